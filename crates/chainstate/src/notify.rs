//! Listener notification with exactly-once delivery.
//!
//! Listeners register an interest in a transaction type and a confirmation
//! depth. A notification fires once per (transaction, listener) pair; a
//! listener that acknowledges with a receipt is never re-notified, even
//! across restarts.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use elaspv_bloom::{merkle_root_from_branch, MerkleBranch};
use elaspv_consensus::Hash256;
use elaspv_primitives::Transaction;
use elaspv_storage::{Column, KeyValueStore, StoreError};
use log::warn;

/// An inclusion proof a third party can check against its own copy of the
/// header chain: fold the txid up the branch and compare to the merkle
/// root of the block at `height`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Proof {
    pub block_hash: Hash256,
    pub height: u32,
    pub merkle_root: Hash256,
    pub branch: MerkleBranch,
}

impl Proof {
    pub fn verify(&self, tx_id: &Hash256) -> bool {
        merkle_root_from_branch(tx_id, &self.branch.branches, self.branch.index)
            == self.merkle_root
    }
}

/// The capability the core consumes from registered listeners.
pub trait TransactionListener: Send + Sync {
    /// Transaction type this listener cares about.
    fn tx_type(&self) -> u8;

    /// Whether to wait for confirmation depth. Listeners returning false
    /// are notified as soon as the transaction is verified in a block.
    fn confirmed(&self) -> bool;

    /// Confirmation depth for listeners that wait; a depth of 1 fires on
    /// the block of inclusion.
    fn depth(&self) -> u32 {
        6
    }

    fn notify(
        &self,
        proof: &Proof,
        tx: &Transaction,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// A verified transaction awaiting notification.
pub struct PendingNotification<'a> {
    pub tx: &'a Transaction,
    pub at_height: u32,
    pub proof: &'a Proof,
}

pub struct Notifier<S> {
    store: Arc<S>,
    listeners: Vec<Arc<dyn TransactionListener>>,
    fired: Mutex<HashSet<(Hash256, usize)>>,
}

impl<S: KeyValueStore> Notifier<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            listeners: Vec::new(),
            fired: Mutex::new(HashSet::new()),
        }
    }

    pub fn register_listener(&mut self, listener: Arc<dyn TransactionListener>) {
        self.listeners.push(listener);
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// Acknowledge a notification; the transaction is never re-notified.
    pub fn submit_transaction_receipt(&self, tx_hash: &Hash256) -> Result<(), StoreError> {
        self.store.put(Column::TxReceipt, tx_hash, &[1])
    }

    pub fn has_receipt(&self, tx_hash: &Hash256) -> Result<bool, StoreError> {
        Ok(self.store.get(Column::TxReceipt, tx_hash)?.is_some())
    }

    /// Fire every notification that became eligible at `tip_height`.
    ///
    /// `pending` must be sorted ascending by height; listeners then observe
    /// transactions in best-chain order.
    pub fn dispatch(
        &self,
        tip_height: u32,
        pending: &[PendingNotification<'_>],
    ) -> Result<usize, StoreError> {
        let mut fired_count = 0usize;
        for entry in pending {
            if entry.at_height == 0 {
                continue;
            }
            let tx_hash = entry.tx.hash();
            if self.has_receipt(&tx_hash)? {
                continue;
            }
            for (index, listener) in self.listeners.iter().enumerate() {
                if listener.tx_type() != entry.tx.tx_type {
                    continue;
                }
                let depth = if listener.confirmed() {
                    listener.depth().max(1)
                } else {
                    1
                };
                if tip_height < entry.at_height + depth - 1 {
                    continue;
                }
                {
                    let mut fired =
                        self.fired.lock().unwrap_or_else(PoisonError::into_inner);
                    if !fired.insert((tx_hash, index)) {
                        continue;
                    }
                }
                if let Err(err) = listener.notify(entry.proof, entry.tx) {
                    // Listener trouble never affects core state.
                    warn!("transaction listener failed: {err}");
                }
                fired_count += 1;
            }
        }
        Ok(fired_count)
    }

    /// Forget the fire-state of transactions that vanished in a reorg, so
    /// a later re-confirmation notifies again (unless acknowledged).
    pub fn forget(&self, tx_hashes: &[Hash256]) {
        let mut fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        fired.retain(|(hash, _)| !tx_hashes.contains(hash));
    }
}
