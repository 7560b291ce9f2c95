//! Unspent outputs owned by registered addresses, backed by the storage
//! trait.

use elaspv_consensus::Hash168;
use elaspv_primitives::encoding::{DecodeError, Decoder, Encoder};
use elaspv_primitives::OutPoint;
use elaspv_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::ledger::LedgerError;

/// An output credited to one of our addresses. `at_height` of zero means
/// the funding transaction has not been confirmed in a block yet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Utxo {
    pub op: OutPoint,
    pub value: u64,
    pub lock_time: u32,
    pub at_height: u32,
    pub address: Hash168,
}

impl Utxo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(71);
        encoder.write_u64_le(self.value);
        encoder.write_u32_le(self.lock_time);
        encoder.write_u32_le(self.at_height);
        encoder.write_bytes(&self.address);
        encoder.into_inner()
    }

    pub fn decode(op: OutPoint, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_u64_le()?;
        let lock_time = decoder.read_u32_le()?;
        let at_height = decoder.read_u32_le()?;
        let address = decoder.read_fixed::<21>()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            op,
            value,
            lock_time,
            at_height,
            address,
        })
    }
}

pub struct UtxoSet<S> {
    store: S,
}

impl<S> UtxoSet<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> UtxoSet<S> {
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, LedgerError> {
        match self.store.get(Column::Utxo, &outpoint.key_bytes())? {
            Some(bytes) => Ok(Some(Utxo::decode(*outpoint, &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, batch: &mut WriteBatch, utxo: &Utxo) {
        batch.put(Column::Utxo, utxo.op.key_bytes(), utxo.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        batch.delete(Column::Utxo, outpoint.key_bytes());
    }

    pub fn all(&self) -> Result<Vec<Utxo>, LedgerError> {
        let entries = self.store.scan_prefix(Column::Utxo, &[])?;
        let mut utxos = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let op = OutPoint::from_key_bytes(&key)
                .ok_or(StoreError::Backend("invalid utxo key".to_string()))?;
            utxos.push(Utxo::decode(op, &value)?);
        }
        Ok(utxos)
    }
}
