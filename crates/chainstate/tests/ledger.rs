use std::sync::Arc;

use elaspv_chainstate::{AddrFilter, Ledger};
use elaspv_consensus::Hash168;
use elaspv_primitives::transaction::tx_type;
use elaspv_primitives::{OutPoint, Transaction, TxIn, TxOut};
use elaspv_storage::memory::MemoryStore;
use elaspv_storage::{KeyValueStore, WriteBatch};

const ADDR_A: Hash168 = [0xA1; 21];
const ADDR_B: Hash168 = [0xB2; 21];
const ADDR_OTHER: Hash168 = [0xCC; 21];

fn ledger() -> (Arc<MemoryStore>, Ledger<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let filter = Arc::new(AddrFilter::new([ADDR_A, ADDR_B]));
    let ledger = Ledger::new(Arc::clone(&store), filter);
    (store, ledger)
}

fn credit_tx(address: Hash168, value: u64, salt: u8) -> Transaction {
    Transaction {
        tx_type: tx_type::TRANSFER_ASSET,
        payload: vec![salt],
        inputs: Vec::new(),
        outputs: vec![TxOut {
            value,
            output_lock: 0,
            address,
        }],
        lock_time: 0,
    }
}

fn spend_tx(prev: OutPoint, to: Hash168, value: u64) -> Transaction {
    Transaction {
        tx_type: tx_type::TRANSFER_ASSET,
        payload: Vec::new(),
        inputs: vec![TxIn {
            prev,
            sequence: 0xFFFF_FFFF,
        }],
        outputs: vec![TxOut {
            value,
            output_lock: 0,
            address: to,
        }],
        lock_time: 0,
    }
}

fn apply(store: &MemoryStore, ledger: &Ledger<MemoryStore>, tx: &Transaction, height: u32) {
    let mut batch = WriteBatch::new();
    ledger.apply_transaction(&mut batch, tx, height).expect("apply");
    store.write_batch(&batch).expect("commit");
}

#[test]
fn outputs_to_watched_addresses_become_utxos() {
    let (store, ledger) = ledger();
    let t1 = credit_tx(ADDR_A, 100, 1);
    let stranger = credit_tx(ADDR_OTHER, 500, 2);

    apply(&store, &ledger, &t1, 20);
    apply(&store, &ledger, &stranger, 20);

    let utxos = ledger.utxos().expect("utxos");
    assert_eq!(utxos.len(), 1);
    assert_eq!(utxos[0].op, OutPoint::new(t1.hash(), 0));
    assert_eq!(utxos[0].value, 100);
    assert_eq!(utxos[0].at_height, 20);
    assert_eq!(ledger.balance(&ADDR_A).expect("balance"), 100);
    assert_eq!(ledger.balance(&ADDR_OTHER).expect("balance"), 0);
}

#[test]
fn provisional_entries_promote_when_confirmed() {
    let (store, ledger) = ledger();
    let t1 = credit_tx(ADDR_A, 42, 3);

    // Seen in the mempool first, then verified in a block.
    apply(&store, &ledger, &t1, 0);
    let op = OutPoint::new(t1.hash(), 0);
    assert_eq!(ledger.utxo(&op).expect("get").expect("exists").at_height, 0);

    apply(&store, &ledger, &t1, 33);
    assert_eq!(ledger.utxo(&op).expect("get").expect("exists").at_height, 33);
}

#[test]
fn spending_moves_utxo_to_stxo() {
    let (store, ledger) = ledger();
    let t1 = credit_tx(ADDR_A, 100, 4);
    apply(&store, &ledger, &t1, 20);

    let op = OutPoint::new(t1.hash(), 0);
    let t2 = spend_tx(op, ADDR_OTHER, 100);
    apply(&store, &ledger, &t2, 26);

    assert!(ledger.utxo(&op).expect("get").is_none());
    let stxo = ledger.stxo(&op).expect("get").expect("stxo exists");
    assert_eq!(stxo.spend_height, 26);
    assert_eq!(stxo.spend_tx_id, t2.hash());
    assert_eq!(stxo.utxo.at_height, 20);
    assert_eq!(ledger.balance(&ADDR_A).expect("balance"), 0);
}

#[test]
fn balance_equals_credits_minus_debits() {
    let (store, ledger) = ledger();

    let t1 = credit_tx(ADDR_A, 100, 5);
    let t2 = credit_tx(ADDR_A, 250, 6);
    let t3 = credit_tx(ADDR_B, 70, 7);
    apply(&store, &ledger, &t1, 10);
    apply(&store, &ledger, &t2, 11);
    apply(&store, &ledger, &t3, 11);

    // Spend t1's output; change of 40 comes back to ADDR_B.
    let spend = Transaction {
        tx_type: tx_type::TRANSFER_ASSET,
        payload: Vec::new(),
        inputs: vec![TxIn {
            prev: OutPoint::new(t1.hash(), 0),
            sequence: 0,
        }],
        outputs: vec![
            TxOut {
                value: 60,
                output_lock: 0,
                address: ADDR_OTHER,
            },
            TxOut {
                value: 40,
                output_lock: 0,
                address: ADDR_B,
            },
        ],
        lock_time: 0,
    };
    apply(&store, &ledger, &spend, 12);

    assert_eq!(ledger.balance(&ADDR_A).expect("balance"), 250);
    assert_eq!(ledger.balance(&ADDR_B).expect("balance"), 70 + 40);
}

#[test]
fn reorg_undo_restores_prior_ledger_state() {
    let (store, ledger) = ledger();

    let t1 = credit_tx(ADDR_A, 100, 8);
    apply(&store, &ledger, &t1, 20);
    let op = OutPoint::new(t1.hash(), 0);

    let utxos_before = ledger.utxos().expect("utxos");
    let stxos_before = ledger.stxos().expect("stxos");

    let t2 = spend_tx(op, ADDR_B, 100);
    apply(&store, &ledger, &t2, 26);

    // Detach the spending block; the spend is undone.
    let mut batch = WriteBatch::new();
    let undo = ledger.undo_block(&mut batch, 26).expect("undo");
    store.write_batch(&batch).expect("commit");
    assert_eq!(undo.restored_utxos, vec![op]);
    // t2 also credited ADDR_B at height 26; that output is removed.
    assert_eq!(undo.removed_utxos, vec![OutPoint::new(t2.hash(), 0)]);

    assert_eq!(ledger.utxos().expect("utxos"), utxos_before);
    assert_eq!(ledger.stxos().expect("stxos"), stxos_before);

    // Detach the funding block too; the ledger is empty again.
    let mut batch = WriteBatch::new();
    ledger.undo_block(&mut batch, 20).expect("undo");
    store.write_batch(&batch).expect("commit");
    assert!(ledger.utxos().expect("utxos").is_empty());
    assert!(ledger.stxos().expect("stxos").is_empty());
}

#[test]
fn reorg_then_reapply_is_idempotent() {
    let (store, ledger) = ledger();

    let t1 = credit_tx(ADDR_A, 100, 9);
    let t2 = spend_tx(OutPoint::new(t1.hash(), 0), ADDR_B, 100);
    apply(&store, &ledger, &t1, 5);
    apply(&store, &ledger, &t2, 6);

    let utxos_before = ledger.utxos().expect("utxos");
    let stxos_before = ledger.stxos().expect("stxos");

    for height in [6u32, 5] {
        let mut batch = WriteBatch::new();
        ledger.undo_block(&mut batch, height).expect("undo");
        store.write_batch(&batch).expect("commit");
    }
    apply(&store, &ledger, &t1, 5);
    apply(&store, &ledger, &t2, 6);

    assert_eq!(ledger.utxos().expect("utxos"), utxos_before);
    assert_eq!(ledger.stxos().expect("stxos"), stxos_before);
}

#[test]
fn created_and_spent_in_detached_block_vanishes() {
    let (store, ledger) = ledger();

    let t1 = credit_tx(ADDR_A, 100, 10);
    let op = OutPoint::new(t1.hash(), 0);
    let t2 = spend_tx(op, ADDR_OTHER, 100);
    apply(&store, &ledger, &t1, 30);
    apply(&store, &ledger, &t2, 30);

    let mut batch = WriteBatch::new();
    let undo = ledger.undo_block(&mut batch, 30).expect("undo");
    store.write_batch(&batch).expect("commit");

    assert!(undo.restored_utxos.is_empty());
    assert!(undo.removed_utxos.contains(&op));
    assert!(ledger.utxos().expect("utxos").is_empty());
    assert!(ledger.stxos().expect("stxos").is_empty());
}

#[test]
fn buried_stxos_are_pruned() {
    let (store, ledger) = ledger();

    let t1 = credit_tx(ADDR_A, 100, 11);
    let op = OutPoint::new(t1.hash(), 0);
    let t2 = spend_tx(op, ADDR_OTHER, 100);
    apply(&store, &ledger, &t1, 20);
    apply(&store, &ledger, &t2, 26);

    // Not yet buried with K = 6 at tip 31.
    let mut batch = WriteBatch::new();
    assert_eq!(ledger.prune_stxos(&mut batch, 31, 6).expect("prune"), 0);

    let mut batch = WriteBatch::new();
    assert_eq!(ledger.prune_stxos(&mut batch, 32, 6).expect("prune"), 1);
    store.write_batch(&batch).expect("commit");
    assert!(ledger.stxo(&op).expect("get").is_none());
}
