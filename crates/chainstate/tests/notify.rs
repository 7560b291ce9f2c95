use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use elaspv_bloom::{check_merkle_block, PartialMerkleTree};
use elaspv_chainstate::notify::PendingNotification;
use elaspv_chainstate::{Notifier, Proof, TransactionListener};
use elaspv_consensus::Hash168;
use elaspv_primitives::transaction::tx_type;
use elaspv_primitives::{BlockHeader, Transaction, TxOut};
use elaspv_storage::memory::MemoryStore;

const ADDR: Hash168 = [0xA7; 21];

struct CountingListener {
    wanted_type: u8,
    wait_depth: Option<u32>,
    fired: AtomicUsize,
}

impl CountingListener {
    fn confirmed_at(depth: u32) -> Self {
        Self {
            wanted_type: tx_type::TRANSFER_ASSET,
            wait_depth: Some(depth),
            fired: AtomicUsize::new(0),
        }
    }

    fn unconfirmed() -> Self {
        Self {
            wanted_type: tx_type::TRANSFER_ASSET,
            wait_depth: None,
            fired: AtomicUsize::new(0),
        }
    }

    fn count(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }
}

impl TransactionListener for CountingListener {
    fn tx_type(&self) -> u8 {
        self.wanted_type
    }

    fn confirmed(&self) -> bool {
        self.wait_depth.is_some()
    }

    fn depth(&self) -> u32 {
        self.wait_depth.unwrap_or(1)
    }

    fn notify(
        &self,
        proof: &Proof,
        tx: &Transaction,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        assert!(proof.verify(&tx.hash()), "proof must verify independently");
        self.fired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn sample_tx(value: u64) -> Transaction {
    Transaction {
        tx_type: tx_type::TRANSFER_ASSET,
        payload: Vec::new(),
        inputs: Vec::new(),
        outputs: vec![TxOut {
            value,
            output_lock: 0,
            address: ADDR,
        }],
        lock_time: 0,
    }
}

/// A real single-branch proof for a block containing just this tx.
fn proof_for(tx: &Transaction, height: u32) -> Proof {
    let tx_id = tx.hash();
    let tree = PartialMerkleTree::build(&[tx_id, [0x99; 32]], &[true, false]);
    let header = BlockHeader {
        version: 1,
        prev_block: [0u8; 32],
        merkle_root: tree.root(),
        timestamp: 1_600_000_000,
        bits: 0x207f_ffff,
        height,
        nonce: 0,
        aux_payload: Vec::new(),
    };
    let block = tree.to_merkle_block(header.clone());
    let matches = check_merkle_block(&block).expect("valid block");
    Proof {
        block_hash: header.hash(),
        height,
        merkle_root: header.merkle_root,
        branch: matches.branch(&tx_id).expect("branch"),
    }
}

#[test]
fn fires_once_at_configured_depth() {
    let store = Arc::new(MemoryStore::new());
    let mut notifier = Notifier::new(store);
    let listener = Arc::new(CountingListener::confirmed_at(6));
    notifier.register_listener(listener.clone());

    let tx = sample_tx(100);
    let proof = proof_for(&tx, 20);
    let pending = [PendingNotification {
        tx: &tx,
        at_height: 20,
        proof: &proof,
    }];

    // Depth 6 needs tip 25.
    assert_eq!(notifier.dispatch(24, &pending).expect("dispatch"), 0);
    assert_eq!(notifier.dispatch(25, &pending).expect("dispatch"), 1);
    assert_eq!(listener.count(), 1);

    // Re-dispatching at later tips never re-fires.
    assert_eq!(notifier.dispatch(26, &pending).expect("dispatch"), 0);
    assert_eq!(notifier.dispatch(40, &pending).expect("dispatch"), 0);
    assert_eq!(listener.count(), 1);
}

#[test]
fn depth_one_fires_on_inclusion() {
    let store = Arc::new(MemoryStore::new());
    let mut notifier = Notifier::new(store);
    let listener = Arc::new(CountingListener::confirmed_at(1));
    notifier.register_listener(listener.clone());

    let tx = sample_tx(100);
    let proof = proof_for(&tx, 20);
    let pending = [PendingNotification {
        tx: &tx,
        at_height: 20,
        proof: &proof,
    }];
    assert_eq!(notifier.dispatch(20, &pending).expect("dispatch"), 1);
    assert_eq!(listener.count(), 1);
}

#[test]
fn unconfirmed_listener_fires_on_first_verified_sight() {
    let store = Arc::new(MemoryStore::new());
    let mut notifier = Notifier::new(store);
    let listener = Arc::new(CountingListener::unconfirmed());
    notifier.register_listener(listener.clone());

    let tx = sample_tx(100);
    let proof = proof_for(&tx, 30);
    let pending = [PendingNotification {
        tx: &tx,
        at_height: 30,
        proof: &proof,
    }];
    assert_eq!(notifier.dispatch(30, &pending).expect("dispatch"), 1);
}

#[test]
fn listeners_filter_by_transaction_type() {
    let store = Arc::new(MemoryStore::new());
    let mut notifier = Notifier::new(store);
    let listener = Arc::new(CountingListener {
        wanted_type: tx_type::REGISTER_ASSET,
        wait_depth: Some(1),
        fired: AtomicUsize::new(0),
    });
    notifier.register_listener(listener.clone());

    let tx = sample_tx(100);
    let proof = proof_for(&tx, 10);
    let pending = [PendingNotification {
        tx: &tx,
        at_height: 10,
        proof: &proof,
    }];
    assert_eq!(notifier.dispatch(50, &pending).expect("dispatch"), 0);
    assert_eq!(listener.count(), 0);
}

#[test]
fn acknowledged_transactions_stay_quiet_across_restart() {
    let store = Arc::new(MemoryStore::new());
    let tx = sample_tx(100);
    let proof = proof_for(&tx, 20);

    {
        let mut notifier = Notifier::new(Arc::clone(&store));
        let listener = Arc::new(CountingListener::confirmed_at(1));
        notifier.register_listener(listener.clone());
        let pending = [PendingNotification {
            tx: &tx,
            at_height: 20,
            proof: &proof,
        }];
        assert_eq!(notifier.dispatch(25, &pending).expect("dispatch"), 1);
        notifier
            .submit_transaction_receipt(&tx.hash())
            .expect("receipt");
    }

    // Fresh notifier over the same store, as after a restart. The receipt
    // suppresses re-notification even though the in-memory fire-state is
    // gone.
    let mut notifier = Notifier::new(store);
    let listener = Arc::new(CountingListener::confirmed_at(1));
    notifier.register_listener(listener.clone());
    let pending = [PendingNotification {
        tx: &tx,
        at_height: 20,
        proof: &proof,
    }];
    assert_eq!(notifier.dispatch(60, &pending).expect("dispatch"), 0);
    assert_eq!(listener.count(), 0);
}

#[test]
fn reorged_out_transaction_can_renotify_after_reconfirmation() {
    let store = Arc::new(MemoryStore::new());
    let mut notifier = Notifier::new(store);
    let listener = Arc::new(CountingListener::confirmed_at(1));
    notifier.register_listener(listener.clone());

    let tx = sample_tx(100);
    let proof = proof_for(&tx, 20);
    let pending = [PendingNotification {
        tx: &tx,
        at_height: 20,
        proof: &proof,
    }];
    assert_eq!(notifier.dispatch(20, &pending).expect("dispatch"), 1);

    // The block at 20 is reorged away; the coordinator forgets the tx.
    notifier.forget(&[tx.hash()]);

    // It reconfirms at height 22 on the new chain and notifies again.
    let proof = proof_for(&tx, 22);
    let pending = [PendingNotification {
        tx: &tx,
        at_height: 22,
        proof: &proof,
    }];
    assert_eq!(notifier.dispatch(22, &pending).expect("dispatch"), 1);
    assert_eq!(listener.count(), 2);
}

#[test]
fn unconfirmed_pending_entries_do_not_fire() {
    let store = Arc::new(MemoryStore::new());
    let mut notifier = Notifier::new(store);
    let listener = Arc::new(CountingListener::confirmed_at(1));
    notifier.register_listener(listener.clone());

    let tx = sample_tx(100);
    let proof = proof_for(&tx, 0);
    let pending = [PendingNotification {
        tx: &tx,
        at_height: 0,
        proof: &proof,
    }];
    assert_eq!(notifier.dispatch(100, &pending).expect("dispatch"), 0);
}
