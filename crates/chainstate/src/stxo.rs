//! Spent outputs, retained until their spend is buried below the reorg
//! horizon so a fork can restore them.

use elaspv_consensus::Hash256;
use elaspv_primitives::encoding::{DecodeError, Decoder, Encoder};
use elaspv_primitives::OutPoint;
use elaspv_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::ledger::LedgerError;
use crate::utxo::Utxo;

/// A [`Utxo`] that has been consumed, plus where and by what.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Stxo {
    pub utxo: Utxo,
    pub spend_height: u32,
    pub spend_tx_id: Hash256,
}

impl Stxo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(107);
        encoder.write_bytes(&self.utxo.encode());
        encoder.write_u32_le(self.spend_height);
        encoder.write_hash(&self.spend_tx_id);
        encoder.into_inner()
    }

    pub fn decode(op: OutPoint, bytes: &[u8]) -> Result<Self, DecodeError> {
        // The embedded utxo record is fixed-width; split it off the front.
        const UTXO_RECORD_LEN: usize = 8 + 4 + 4 + 21;
        if bytes.len() < UTXO_RECORD_LEN {
            return Err(DecodeError::Eof);
        }
        let utxo = Utxo::decode(op, &bytes[..UTXO_RECORD_LEN])?;
        let mut decoder = Decoder::new(&bytes[UTXO_RECORD_LEN..]);
        let spend_height = decoder.read_u32_le()?;
        let spend_tx_id = decoder.read_hash()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            utxo,
            spend_height,
            spend_tx_id,
        })
    }
}

pub struct StxoSet<S> {
    store: S,
}

impl<S> StxoSet<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> StxoSet<S> {
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<Stxo>, LedgerError> {
        match self.store.get(Column::Stxo, &outpoint.key_bytes())? {
            Some(bytes) => Ok(Some(Stxo::decode(*outpoint, &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, batch: &mut WriteBatch, stxo: &Stxo) {
        batch.put(Column::Stxo, stxo.utxo.op.key_bytes(), stxo.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        batch.delete(Column::Stxo, outpoint.key_bytes());
    }

    pub fn all(&self) -> Result<Vec<Stxo>, LedgerError> {
        let entries = self.store.scan_prefix(Column::Stxo, &[])?;
        let mut stxos = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let op = OutPoint::from_key_bytes(&key)
                .ok_or(StoreError::Backend("invalid stxo key".to_string()))?;
            stxos.push(Stxo::decode(op, &value)?);
        }
        Ok(stxos)
    }
}
