use elaspv_consensus::{Hash168, Hash256};

use crate::encoding::{to_bytes, DecodeError, Decoder, Encoder, WireDecode, WireEncode};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

/// Bound on inputs/outputs per transaction accepted off the wire.
pub const MAX_TX_IO: u64 = 10_000;
/// Bound on an attached payload accepted off the wire.
pub const MAX_TX_PAYLOAD: u64 = 1_024 * 1_024;

/// Well-known transaction type bytes.
pub mod tx_type {
    pub const COIN_BASE: u8 = 0x00;
    pub const REGISTER_ASSET: u8 = 0x01;
    pub const TRANSFER_ASSET: u8 = 0x02;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prev: OutPoint,
    pub sequence: u32,
}

impl WireEncode for TxIn {
    fn encode_into(&self, encoder: &mut Encoder) {
        self.prev.encode_into(encoder);
        encoder.write_u32_le(self.sequence);
    }
}

impl WireDecode for TxIn {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let prev = OutPoint::decode_from(decoder)?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self { prev, sequence })
    }
}

/// An output: value locked to an address program hash.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: u64,
    pub output_lock: u32,
    pub address: Hash168,
}

impl WireEncode for TxOut {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.value);
        encoder.write_u32_le(self.output_lock);
        encoder.write_bytes(&self.address);
    }
}

impl WireDecode for TxOut {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let value = decoder.read_u64_le()?;
        let output_lock = decoder.read_u32_le()?;
        let address = decoder.read_fixed::<21>()?;
        Ok(Self {
            value,
            output_lock,
            address,
        })
    }
}

/// A transaction as carried on the wire: a type byte, a type-specific
/// opaque payload, inputs, outputs and a lock time. The SPV core never
/// interprets the payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub tx_type: u8,
    pub payload: Vec<u8>,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn hash(&self) -> Hash256 {
        sha256d(&to_bytes(self))
    }

    pub fn is_coin_base(&self) -> bool {
        self.tx_type == tx_type::COIN_BASE
    }
}

impl WireEncode for Transaction {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.tx_type);
        encoder.write_var_bytes(&self.payload);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode_into(encoder);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode_into(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl WireDecode for Transaction {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let tx_type = decoder.read_u8()?;
        let payload = decoder.read_var_bytes_max(MAX_TX_PAYLOAD)?;
        let input_count = decoder.read_varint_max(MAX_TX_IO)?;
        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            inputs.push(TxIn::decode_from(decoder)?);
        }
        let output_count = decoder.read_varint_max(MAX_TX_IO)?;
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            outputs.push(TxOut::decode_from(decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            tx_type,
            payload,
            inputs,
            outputs,
            lock_time,
        })
    }
}
