//! In-memory backend used by tests and the `--backend memory` mode.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp, ALL_COLUMNS};

#[derive(Debug)]
pub struct MemoryStore {
    columns: Mutex<HashMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut columns = HashMap::new();
        for column in ALL_COLUMNS {
            columns.insert(column, BTreeMap::new());
        }
        Self {
            columns: Mutex::new(columns),
        }
    }
}

fn lock_poisoned() -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let columns = self.columns.lock().map_err(|_| lock_poisoned())?;
        Ok(columns
            .get(&column)
            .and_then(|tree| tree.get(key))
            .cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.lock().map_err(|_| lock_poisoned())?;
        columns
            .entry(column)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.lock().map_err(|_| lock_poisoned())?;
        if let Some(tree) = columns.get_mut(&column) {
            tree.remove(key);
        }
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let columns = self.columns.lock().map_err(|_| lock_poisoned())?;
        let Some(tree) = columns.get(&column) else {
            return Ok(Vec::new());
        };
        Ok(tree
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut columns = self.columns.lock().map_err(|_| lock_poisoned())?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    columns
                        .entry(*column)
                        .or_default()
                        .insert(key.as_slice().to_vec(), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    if let Some(tree) = columns.get_mut(column) {
                        tree.remove(key.as_slice());
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let store = MemoryStore::new();
        store.put(Column::Meta, b"tip", b"abc").unwrap();
        assert_eq!(
            store.get(Column::Meta, b"tip").unwrap(),
            Some(b"abc".to_vec())
        );
        store.delete(Column::Meta, b"tip").unwrap();
        assert_eq!(store.get(Column::Meta, b"tip").unwrap(), None);
    }

    #[test]
    fn scan_prefix_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        store.put(Column::Utxo, b"aa1", b"1").unwrap();
        store.put(Column::Utxo, b"aa2", b"2").unwrap();
        store.put(Column::Utxo, b"ab1", b"3").unwrap();
        let entries = store.scan_prefix(Column::Utxo, b"aa").unwrap();
        assert_eq!(
            entries,
            vec![
                (b"aa1".to_vec(), b"1".to_vec()),
                (b"aa2".to_vec(), b"2".to_vec()),
            ]
        );
    }

    #[test]
    fn batch_applies_all_ops() {
        let store = MemoryStore::new();
        store.put(Column::Meta, b"old", b"x").unwrap();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"new".as_slice(), b"y".as_slice());
        batch.delete(Column::Meta, b"old".as_slice());
        store.write_batch(&batch).unwrap();
        assert_eq!(store.get(Column::Meta, b"old").unwrap(), None);
        assert_eq!(
            store.get(Column::Meta, b"new").unwrap(),
            Some(b"y".to_vec())
        );
    }
}
