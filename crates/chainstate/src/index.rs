//! Header index records.

use elaspv_consensus::Hash256;
use elaspv_primitives::encoding::{DecodeError, Decoder, Encoder, WireDecode, WireEncode};
use elaspv_primitives::BlockHeader;
use primitive_types::U256;

/// The current best chain tip.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BestTip {
    pub hash: Hash256,
    pub height: u32,
    pub work: U256,
}

/// A stored header plus the cumulative work of the chain ending at it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeaderEntry {
    pub header: BlockHeader,
    pub work: U256,
}

impl HeaderEntry {
    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.header.encode_into(&mut encoder);
        let mut work = [0u8; 32];
        self.work.to_little_endian(&mut work);
        encoder.write_bytes(&work);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::decode_from(&mut decoder)?;
        let work = U256::from_little_endian(&decoder.read_fixed::<32>()?);
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { header, work })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrip() {
        let entry = HeaderEntry {
            header: BlockHeader {
                version: 1,
                prev_block: [0x01; 32],
                merkle_root: [0x02; 32],
                timestamp: 1_700_000_000,
                bits: 0x207f_ffff,
                height: 9,
                nonce: 77,
                aux_payload: vec![0xEE; 5],
            },
            work: U256::from(123_456_789u64) << 64,
        };
        let bytes = entry.encode();
        assert_eq!(HeaderEntry::decode(&bytes).unwrap(), entry);
    }
}
