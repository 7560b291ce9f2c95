//! Owned-output ledger: applies matched transactions, promotes them when
//! their block is verified, and rewinds them on reorg.
//!
//! The ledger is mutated only through [`WriteBatch`]es the caller commits,
//! so a block's worth of changes lands atomically or not at all.

use std::sync::Arc;

use elaspv_consensus::Hash168;
use elaspv_primitives::encoding::DecodeError;
use elaspv_primitives::{OutPoint, Transaction};
use elaspv_storage::{KeyValueStore, StoreError, WriteBatch};

use crate::addrfilter::AddrFilter;
use crate::stxo::{Stxo, StxoSet};
use crate::utxo::{Utxo, UtxoSet};

#[derive(Debug)]
pub enum LedgerError {
    Store(StoreError),
    Decode(DecodeError),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Store(err) => write!(f, "{err}"),
            LedgerError::Decode(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        LedgerError::Store(err)
    }
}

impl From<DecodeError> for LedgerError {
    fn from(err: DecodeError) -> Self {
        LedgerError::Decode(err)
    }
}

/// What applying one transaction changed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxOutcome {
    /// Outpoints credited to our addresses for the first time. These are
    /// fed to the bloom filter and advertised via `filteradd`.
    pub credited: Vec<OutPoint>,
    /// Our outpoints this transaction consumed.
    pub spent: Vec<OutPoint>,
    /// Whether anything of ours was touched at all (including pure
    /// height promotions).
    pub relevant: bool,
}

/// Ledger state rewound for one detached block.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UndoOutcome {
    pub removed_utxos: Vec<OutPoint>,
    pub restored_utxos: Vec<OutPoint>,
}

pub struct Ledger<S> {
    utxos: UtxoSet<Arc<S>>,
    stxos: StxoSet<Arc<S>>,
    filter: Arc<AddrFilter>,
}

impl<S: KeyValueStore> Ledger<S> {
    pub fn new(store: Arc<S>, filter: Arc<AddrFilter>) -> Self {
        Self {
            utxos: UtxoSet::new(Arc::clone(&store)),
            stxos: StxoSet::new(store),
            filter,
        }
    }

    pub fn addr_filter(&self) -> &Arc<AddrFilter> {
        &self.filter
    }

    pub fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, LedgerError> {
        self.utxos.get(outpoint)
    }

    pub fn stxo(&self, outpoint: &OutPoint) -> Result<Option<Stxo>, LedgerError> {
        self.stxos.get(outpoint)
    }

    pub fn utxos(&self) -> Result<Vec<Utxo>, LedgerError> {
        self.utxos.all()
    }

    pub fn stxos(&self) -> Result<Vec<Stxo>, LedgerError> {
        self.stxos.all()
    }

    /// Confirmed plus unconfirmed value credited to one address.
    pub fn balance(&self, address: &Hash168) -> Result<u64, LedgerError> {
        Ok(self
            .utxos
            .all()?
            .iter()
            .filter(|utxo| &utxo.address == address)
            .map(|utxo| utxo.value)
            .sum())
    }

    /// Apply one matched transaction at `height` (zero for unconfirmed).
    ///
    /// Re-applying the same transaction at a real height promotes the
    /// provisional entries it created earlier.
    pub fn apply_transaction(
        &self,
        batch: &mut WriteBatch,
        tx: &Transaction,
        height: u32,
    ) -> Result<TxOutcome, LedgerError> {
        let tx_id = tx.hash();
        let mut outcome = TxOutcome::default();

        for (index, output) in tx.outputs.iter().enumerate() {
            if !self.filter.contains(&output.address) {
                continue;
            }
            let op = OutPoint::new(tx_id, index as u16);
            if let Some(mut existing) = self.utxos.get(&op)? {
                if height > 0 && existing.at_height == 0 {
                    existing.at_height = height;
                    self.utxos.put(batch, &existing);
                    outcome.relevant = true;
                }
                continue;
            }
            if let Some(mut spent) = self.stxos.get(&op)? {
                // Already consumed; still promote the funding height.
                if height > 0 && spent.utxo.at_height == 0 {
                    spent.utxo.at_height = height;
                    self.stxos.put(batch, &spent);
                    outcome.relevant = true;
                }
                continue;
            }
            let utxo = Utxo {
                op,
                value: output.value,
                lock_time: output.output_lock,
                at_height: height,
                address: output.address,
            };
            self.utxos.put(batch, &utxo);
            outcome.credited.push(op);
            outcome.relevant = true;
        }

        for input in &tx.inputs {
            if let Some(utxo) = self.utxos.get(&input.prev)? {
                let stxo = Stxo {
                    utxo,
                    spend_height: height,
                    spend_tx_id: tx_id,
                };
                self.utxos.delete(batch, &input.prev);
                self.stxos.put(batch, &stxo);
                outcome.spent.push(input.prev);
                outcome.relevant = true;
                continue;
            }
            if let Some(mut stxo) = self.stxos.get(&input.prev)? {
                if stxo.spend_tx_id == tx_id && height > 0 && stxo.spend_height == 0 {
                    stxo.spend_height = height;
                    self.stxos.put(batch, &stxo);
                    outcome.relevant = true;
                }
            }
        }

        Ok(outcome)
    }

    /// Rewind one detached block. Callers detach in descending height
    /// order, so spends at this height are undone before the outputs
    /// created here are deleted.
    pub fn undo_block(
        &self,
        batch: &mut WriteBatch,
        height: u32,
    ) -> Result<UndoOutcome, LedgerError> {
        let mut outcome = UndoOutcome::default();

        for stxo in self.stxos.all()? {
            if stxo.spend_height != height {
                continue;
            }
            self.stxos.delete(batch, &stxo.utxo.op);
            if stxo.utxo.at_height == height {
                // Created and consumed in the detached block; gone entirely.
                outcome.removed_utxos.push(stxo.utxo.op);
            } else {
                self.utxos.put(batch, &stxo.utxo);
                outcome.restored_utxos.push(stxo.utxo.op);
            }
        }

        for utxo in self.utxos.all()? {
            if utxo.at_height != height {
                continue;
            }
            self.utxos.delete(batch, &utxo.op);
            outcome.removed_utxos.push(utxo.op);
        }

        Ok(outcome)
    }

    /// Drop spent outputs whose spend is buried below the reorg horizon.
    pub fn prune_stxos(
        &self,
        batch: &mut WriteBatch,
        tip_height: u32,
        reorg_horizon: u32,
    ) -> Result<usize, LedgerError> {
        let mut pruned = 0usize;
        for stxo in self.stxos.all()? {
            if stxo.spend_height == 0 {
                continue;
            }
            if tip_height >= stxo.spend_height.saturating_add(reorg_horizon) {
                self.stxos.delete(batch, &stxo.utxo.op);
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}
