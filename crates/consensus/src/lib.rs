//! Chain-wide parameters and shared type aliases.

pub mod constants;
pub mod params;

pub use params::{chain_params, ChainParams, ConsensusParams, GenesisParams, Network};

/// A 32-byte content hash (transaction ids, block ids, merkle nodes).
pub type Hash256 = [u8; 32];

/// A 21-byte address program hash: one version byte followed by the
/// 20-byte hash160 of the redeem script.
pub type Hash168 = [u8; 21];
