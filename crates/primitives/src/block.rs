use elaspv_consensus::{ChainParams, Hash256};

use crate::encoding::{DecodeError, Decoder, Encoder, WireDecode, WireEncode};
use crate::hash::sha256d;

/// Bound on an opaque auxpow payload accepted off the wire.
pub const MAX_AUX_PAYLOAD: u64 = 1_024 * 1_024;

/// A block header. The chain carries its height on the wire, and headers
/// mined under a parent chain append an auxpow payload the SPV core treats
/// as opaque bytes. The block id covers the core fields only.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub height: u32,
    pub nonce: u32,
    pub aux_payload: Vec<u8>,
}

impl BlockHeader {
    /// Serialization of the core fields, the preimage of [`BlockHeader::hash`].
    pub fn core_bytes(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(84);
        encoder.write_u32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.timestamp);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.height);
        encoder.write_u32_le(self.nonce);
        encoder.into_inner()
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.core_bytes())
    }

    /// The genesis header for the configured network.
    pub fn genesis(params: &ChainParams) -> Self {
        let genesis = &params.consensus.genesis;
        Self {
            version: genesis.version,
            prev_block: [0u8; 32],
            merkle_root: genesis.merkle_root,
            timestamp: genesis.timestamp,
            bits: genesis.bits,
            height: 0,
            nonce: genesis.nonce,
            aux_payload: Vec::new(),
        }
    }
}

impl WireEncode for BlockHeader {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.timestamp);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.height);
        encoder.write_u32_le(self.nonce);
        encoder.write_var_bytes(&self.aux_payload);
    }
}

impl WireDecode for BlockHeader {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_u32_le()?;
        let prev_block = decoder.read_hash()?;
        let merkle_root = decoder.read_hash()?;
        let timestamp = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let height = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        let aux_payload = decoder.read_var_bytes_max(MAX_AUX_PAYLOAD)?;
        Ok(Self {
            version,
            prev_block,
            merkle_root,
            timestamp,
            bits,
            height,
            nonce,
            aux_payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{from_bytes, to_bytes};
    use elaspv_consensus::{chain_params, Network};

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: [0x10; 32],
            merkle_root: [0x20; 32],
            timestamp: 1_600_000_000,
            bits: 0x1d00_ffff,
            height: 42,
            nonce: 12_345,
            aux_payload: vec![0xDE, 0xAD],
        }
    }

    #[test]
    fn wire_roundtrip() {
        let header = sample_header();
        let bytes = to_bytes(&header);
        assert_eq!(from_bytes::<BlockHeader>(&bytes).unwrap(), header);
    }

    #[test]
    fn hash_excludes_aux_payload() {
        let header = sample_header();
        let mut stripped = header.clone();
        stripped.aux_payload.clear();
        assert_eq!(header.hash(), stripped.hash());

        let mut tampered = header.clone();
        tampered.nonce += 1;
        assert_ne!(header.hash(), tampered.hash());
    }

    #[test]
    fn genesis_links_to_nothing() {
        let params = chain_params(Network::Regtest);
        let genesis = BlockHeader::genesis(&params);
        assert_eq!(genesis.prev_block, [0u8; 32]);
        assert_eq!(genesis.height, 0);
    }
}
