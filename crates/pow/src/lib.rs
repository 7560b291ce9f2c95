//! Proof-of-work checks and chain-work accounting.

pub mod difficulty;

pub use difficulty::{
    block_proof, check_proof_of_work, compact_to_u256, u256_to_compact, CompactError, PowError,
};
