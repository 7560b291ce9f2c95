//! Per-network chain parameters, threaded explicitly through constructors.

use crate::constants::MAX_MESSAGE_SIZE;
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mainnet" => Some(Self::Mainnet),
            "testnet" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

/// The fields of the genesis block header. The header itself (and its
/// hash) is assembled by the primitives crate at startup.
#[derive(Clone, Copy, Debug)]
pub struct GenesisParams {
    pub version: u32,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub genesis: GenesisParams,
    /// Loosest allowed target, in compact form.
    pub pow_limit_bits: u32,
    /// Depth at which history is considered final for pruning (K).
    pub reorg_horizon: u32,
    /// Heights whose headers are never pruned.
    pub checkpoint_heights: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// The 4-byte network magic prefixed to every message.
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub user_agent: &'static str,
    /// Cap on a single message body accepted from a peer.
    pub max_message_size: usize,
    pub consensus: ConsensusParams,
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            message_start: [0x0e, 0x1a, 0xf5, 0x2d],
            default_port: 20_866,
            user_agent: "/elaspv-rust:0.1.0/",
            max_message_size: MAX_MESSAGE_SIZE,
            consensus: ConsensusParams {
                genesis: GenesisParams {
                    version: 1,
                    merkle_root: [
                        0x05, 0x79, 0x86, 0x2e, 0xe6, 0x1f, 0x67, 0x2f, 0x47, 0x7d, 0x2c, 0x6e,
                        0x88, 0xf9, 0x2b, 0x4c, 0x9e, 0x0d, 0x31, 0x47, 0x15, 0x9a, 0x8c, 0x25,
                        0xa0, 0x5e, 0x1d, 0xd1, 0x2c, 0x7c, 0x8a, 0x63,
                    ],
                    timestamp: 1_513_936_800,
                    bits: 0x1d00_ffff,
                    nonce: 2_083_236_893,
                },
                pow_limit_bits: 0x1d00_ffff,
                reorg_horizon: 6,
                checkpoint_heights: vec![0],
            },
        },
        Network::Testnet => ChainParams {
            network,
            message_start: [0x0b, 0x21, 0x4c, 0x7a],
            default_port: 21_866,
            user_agent: "/elaspv-rust:0.1.0/",
            max_message_size: MAX_MESSAGE_SIZE,
            consensus: ConsensusParams {
                genesis: GenesisParams {
                    version: 1,
                    merkle_root: [
                        0x05, 0x79, 0x86, 0x2e, 0xe6, 0x1f, 0x67, 0x2f, 0x47, 0x7d, 0x2c, 0x6e,
                        0x88, 0xf9, 0x2b, 0x4c, 0x9e, 0x0d, 0x31, 0x47, 0x15, 0x9a, 0x8c, 0x25,
                        0xa0, 0x5e, 0x1d, 0xd1, 0x2c, 0x7c, 0x8a, 0x63,
                    ],
                    timestamp: 1_513_936_800,
                    bits: 0x1d0f_ffff,
                    nonce: 414_098_458,
                },
                pow_limit_bits: 0x1d0f_ffff,
                reorg_horizon: 6,
                checkpoint_heights: vec![0],
            },
        },
        Network::Regtest => ChainParams {
            network,
            message_start: [0x0c, 0x3f, 0x9d, 0x51],
            default_port: 22_866,
            user_agent: "/elaspv-rust:0.1.0/",
            max_message_size: MAX_MESSAGE_SIZE,
            consensus: ConsensusParams {
                genesis: GenesisParams {
                    version: 1,
                    merkle_root: [
                        0x05, 0x79, 0x86, 0x2e, 0xe6, 0x1f, 0x67, 0x2f, 0x47, 0x7d, 0x2c, 0x6e,
                        0x88, 0xf9, 0x2b, 0x4c, 0x9e, 0x0d, 0x31, 0x47, 0x15, 0x9a, 0x8c, 0x25,
                        0xa0, 0x5e, 0x1d, 0xd1, 0x2c, 0x7c, 0x8a, 0x63,
                    ],
                    timestamp: 1_513_936_800,
                    // Regtest accepts essentially any hash.
                    bits: 0x207f_ffff,
                    nonce: 2,
                },
                pow_limit_bits: 0x207f_ffff,
                reorg_horizon: 6,
                checkpoint_heights: vec![0],
            },
        },
    }
}
