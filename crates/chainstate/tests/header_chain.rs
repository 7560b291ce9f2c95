use std::sync::Arc;

use elaspv_chainstate::{ChainState, ChainStateError, HeaderAccepted};
use elaspv_consensus::{chain_params, ChainParams, Hash256, Network};
use elaspv_primitives::BlockHeader;
use elaspv_storage::memory::MemoryStore;

fn params() -> Arc<ChainParams> {
    Arc::new(chain_params(Network::Regtest))
}

fn open_chain(params: &Arc<ChainParams>) -> ChainState<MemoryStore> {
    ChainState::open(Arc::new(MemoryStore::new()), Arc::clone(params)).expect("open")
}

/// Grind the nonce until the header meets its own target. Regtest bits
/// accept roughly every second hash, so this terminates immediately.
fn mine(mut header: BlockHeader) -> BlockHeader {
    use elaspv_pow::check_proof_of_work;
    while check_proof_of_work(&header.hash(), header.bits, header.bits).is_err() {
        header.nonce = header.nonce.wrapping_add(1);
    }
    header
}

fn child_of(parent: &BlockHeader, parent_hash: Hash256, salt: u32) -> BlockHeader {
    mine(BlockHeader {
        version: 1,
        prev_block: parent_hash,
        merkle_root: [salt as u8; 32],
        timestamp: parent.timestamp + 60,
        bits: parent.bits,
        height: parent.height + 1,
        nonce: salt,
        aux_payload: Vec::new(),
    })
}

/// Build `count` linked headers on top of `base`.
fn extend(base: &BlockHeader, base_hash: Hash256, count: u32, salt: u32) -> Vec<BlockHeader> {
    let mut headers = Vec::with_capacity(count as usize);
    let mut parent = base.clone();
    let mut parent_hash = base_hash;
    for i in 0..count {
        let header = child_of(&parent, parent_hash, salt + i);
        parent_hash = header.hash();
        parent = header.clone();
        headers.push(header);
    }
    headers
}

#[test]
fn linear_chain_reaches_height_ten() {
    let params = params();
    let chain = open_chain(&params);
    let genesis = BlockHeader::genesis(&params);

    let headers = extend(&genesis, genesis.hash(), 10, 100);
    for header in &headers {
        let accepted = chain.insert_header(header).expect("insert");
        assert_eq!(accepted, HeaderAccepted::Extended(header.hash()));
    }

    let tip = chain.best_tip();
    assert_eq!(tip.height, 10);
    assert_eq!(tip.hash, headers.last().unwrap().hash());

    for header in &headers {
        let entry = chain
            .header_entry(&header.hash())
            .expect("get")
            .expect("stored");
        assert_eq!(&entry.header, header);
        assert_eq!(
            chain.height_hash(header.height).expect("height lookup"),
            Some(header.hash())
        );
    }
}

#[test]
fn heavier_fork_triggers_reorg() {
    let params = params();
    let chain = open_chain(&params);
    let genesis = BlockHeader::genesis(&params);

    let main = extend(&genesis, genesis.hash(), 10, 100);
    for header in &main {
        chain.insert_header(header).expect("insert main");
    }

    // Branch at height 5 and build past the old tip. Same bits per block,
    // so cumulative work first exceeds the old tip's at height 11.
    let branch_parent = &main[4];
    let alt = extend(branch_parent, branch_parent.hash(), 7, 200);

    for header in alt.iter().take(5) {
        let accepted = chain.insert_header(header).expect("insert alt");
        assert_eq!(
            accepted,
            HeaderAccepted::SideChain(header.hash()),
            "height {} should stay on the side chain",
            header.height
        );
    }

    let accepted = chain.insert_header(&alt[5]).expect("insert alt tip");
    let HeaderAccepted::Reorged(event) = accepted else {
        panic!("expected reorg, got {accepted:?}");
    };
    assert_eq!(event.fork_height, 5);
    let detached_heights: Vec<u32> = event.detached.iter().map(|(h, _)| *h).collect();
    assert_eq!(detached_heights, vec![10, 9, 8, 7, 6]);
    let detached_hashes: Vec<Hash256> = event.detached.iter().map(|(_, h)| *h).collect();
    let expected_detached: Vec<Hash256> =
        main[5..].iter().rev().map(|header| header.hash()).collect();
    assert_eq!(detached_hashes, expected_detached);

    let attached_heights: Vec<u32> = event.attached.iter().map(|(h, _)| *h).collect();
    assert_eq!(attached_heights, vec![6, 7, 8, 9, 10, 11]);
    let attached_hashes: Vec<Hash256> = event.attached.iter().map(|(_, h)| *h).collect();
    let expected_attached: Vec<Hash256> =
        alt[..6].iter().map(|header| header.hash()).collect();
    assert_eq!(attached_hashes, expected_attached);

    let accepted = chain.insert_header(&alt[6]).expect("extend new best");
    assert_eq!(accepted, HeaderAccepted::Extended(alt[6].hash()));

    let tip = chain.best_tip();
    assert_eq!(tip.height, 12);
    assert_eq!(tip.hash, alt[6].hash());
    for header in &alt {
        assert_eq!(
            chain.height_hash(header.height).expect("height lookup"),
            Some(header.hash())
        );
    }
}

#[test]
fn equal_work_keeps_first_seen_tip() {
    let params = params();
    let chain = open_chain(&params);
    let genesis = BlockHeader::genesis(&params);

    let first = child_of(&genesis, genesis.hash(), 1);
    let second = child_of(&genesis, genesis.hash(), 2);
    chain.insert_header(&first).expect("insert first");
    let accepted = chain.insert_header(&second).expect("insert second");
    assert_eq!(accepted, HeaderAccepted::SideChain(second.hash()));
    assert_eq!(chain.best_tip().hash, first.hash());
}

#[test]
fn unknown_parent_is_reported_for_orphan_handling() {
    let params = params();
    let chain = open_chain(&params);
    let genesis = BlockHeader::genesis(&params);

    let orphan = mine(BlockHeader {
        version: 1,
        prev_block: [0x77; 32],
        merkle_root: [0x01; 32],
        timestamp: genesis.timestamp + 60,
        bits: genesis.bits,
        height: 1,
        nonce: 0,
        aux_payload: Vec::new(),
    });
    match chain.insert_header(&orphan) {
        Err(ChainStateError::UnknownParent(prev)) => assert_eq!(prev, [0x77; 32]),
        other => panic!("expected unknown parent, got {other:?}"),
    }
}

#[test]
fn wrong_claimed_height_is_rejected() {
    let params = params();
    let chain = open_chain(&params);
    let genesis = BlockHeader::genesis(&params);

    let mut header = child_of(&genesis, genesis.hash(), 9);
    header.height = 5;
    let header = mine(header);
    match chain.insert_header(&header) {
        Err(ChainStateError::HeightMismatch { expected, got }) => {
            assert_eq!(expected, 1);
            assert_eq!(got, 5);
        }
        other => panic!("expected height mismatch, got {other:?}"),
    }
}

#[test]
fn duplicate_header_is_idempotent() {
    let params = params();
    let chain = open_chain(&params);
    let genesis = BlockHeader::genesis(&params);

    let header = child_of(&genesis, genesis.hash(), 3);
    chain.insert_header(&header).expect("first insert");
    assert_eq!(
        chain.insert_header(&header).expect("second insert"),
        HeaderAccepted::AlreadyKnown
    );
}

#[test]
fn locator_is_sparse_and_ends_at_genesis() {
    let params = params();
    let chain = open_chain(&params);
    let genesis = BlockHeader::genesis(&params);

    let headers = extend(&genesis, genesis.hash(), 40, 300);
    for header in &headers {
        chain.insert_header(header).expect("insert");
    }

    let locator = chain.locator().expect("locator");
    assert_eq!(locator.first(), Some(&chain.best_tip().hash));
    assert_eq!(locator.last(), Some(&chain.genesis_hash()));
    // Dense walk for the first ten, exponential afterwards.
    assert!(locator.len() < 20, "locator too dense: {}", locator.len());
}

#[test]
fn reopening_restores_the_tip() {
    let params = params();
    let store = Arc::new(MemoryStore::new());
    let genesis;
    let tip_hash;
    {
        let chain = ChainState::open(Arc::clone(&store), Arc::clone(&params)).expect("open");
        genesis = BlockHeader::genesis(&params);
        let headers = extend(&genesis, genesis.hash(), 3, 400);
        for header in &headers {
            chain.insert_header(header).expect("insert");
        }
        tip_hash = headers.last().unwrap().hash();
    }

    let reopened = ChainState::open(store, params).expect("reopen");
    let tip = reopened.best_tip();
    assert_eq!(tip.height, 3);
    assert_eq!(tip.hash, tip_hash);
}
