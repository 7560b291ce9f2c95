use elaspv_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder, WireDecode, WireEncode};

pub const OUTPOINT_LEN: usize = 34;

/// Reference to a transaction output: funding txid plus output index.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OutPoint {
    pub tx_id: Hash256,
    pub index: u16,
}

impl OutPoint {
    pub fn new(tx_id: Hash256, index: u16) -> Self {
        Self { tx_id, index }
    }

    /// Stable 34-byte key form used by the storage layer.
    pub fn key_bytes(&self) -> [u8; OUTPOINT_LEN] {
        let mut out = [0u8; OUTPOINT_LEN];
        out[..32].copy_from_slice(&self.tx_id);
        out[32..].copy_from_slice(&self.index.to_le_bytes());
        out
    }

    pub fn from_key_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != OUTPOINT_LEN {
            return None;
        }
        let tx_id: Hash256 = bytes[..32].try_into().ok()?;
        let index = u16::from_le_bytes(bytes[32..].try_into().ok()?);
        Some(Self { tx_id, index })
    }
}

impl WireEncode for OutPoint {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.tx_id);
        encoder.write_u16_le(self.index);
    }
}

impl WireDecode for OutPoint {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let tx_id = decoder.read_hash()?;
        let index = decoder.read_u16_le()?;
        Ok(Self { tx_id, index })
    }
}
