use elaspv_primitives::encoding::{from_bytes, to_bytes, DecodeError};
use elaspv_primitives::transaction::tx_type;
use elaspv_primitives::{BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn rand_hash(rng: &mut StdRng) -> [u8; 32] {
    let mut hash = [0u8; 32];
    rng.fill(&mut hash[..]);
    hash
}

fn rand_address(rng: &mut StdRng) -> [u8; 21] {
    let mut address = [0u8; 21];
    rng.fill(&mut address[..]);
    address
}

fn rand_transaction(rng: &mut StdRng) -> Transaction {
    let input_count = rng.gen_range(0..5);
    let output_count = rng.gen_range(1..6);
    Transaction {
        tx_type: if rng.gen_bool(0.5) {
            tx_type::COIN_BASE
        } else {
            tx_type::TRANSFER_ASSET
        },
        payload: (0..rng.gen_range(0..64)).map(|_| rng.gen()).collect(),
        inputs: (0..input_count)
            .map(|_| TxIn {
                prev: OutPoint::new(rand_hash(rng), rng.gen()),
                sequence: rng.gen(),
            })
            .collect(),
        outputs: (0..output_count)
            .map(|_| TxOut {
                value: rng.gen(),
                output_lock: rng.gen(),
                address: rand_address(rng),
            })
            .collect(),
        lock_time: rng.gen(),
    }
}

fn rand_header(rng: &mut StdRng) -> BlockHeader {
    BlockHeader {
        version: rng.gen(),
        prev_block: rand_hash(rng),
        merkle_root: rand_hash(rng),
        timestamp: rng.gen(),
        bits: rng.gen(),
        height: rng.gen(),
        nonce: rng.gen(),
        aux_payload: (0..rng.gen_range(0..128)).map(|_| rng.gen()).collect(),
    }
}

#[test]
fn transactions_roundtrip() {
    let mut rng = StdRng::seed_from_u64(0x0521);
    for _ in 0..200 {
        let tx = rand_transaction(&mut rng);
        let bytes = to_bytes(&tx);
        assert_eq!(from_bytes::<Transaction>(&bytes).unwrap(), tx);
    }
}

#[test]
fn headers_roundtrip() {
    let mut rng = StdRng::seed_from_u64(0x0522);
    for _ in 0..200 {
        let header = rand_header(&mut rng);
        let bytes = to_bytes(&header);
        assert_eq!(from_bytes::<BlockHeader>(&bytes).unwrap(), header);
    }
}

#[test]
fn outpoints_roundtrip() {
    let mut rng = StdRng::seed_from_u64(0x0523);
    for _ in 0..200 {
        let op = OutPoint::new(rand_hash(&mut rng), rng.gen());
        let bytes = to_bytes(&op);
        assert_eq!(from_bytes::<OutPoint>(&bytes).unwrap(), op);
    }
}

#[test]
fn trailing_garbage_is_rejected() {
    let mut rng = StdRng::seed_from_u64(0x0524);
    let tx = rand_transaction(&mut rng);
    let mut bytes = to_bytes(&tx);
    bytes.push(0x00);
    assert_eq!(
        from_bytes::<Transaction>(&bytes),
        Err(DecodeError::TrailingBytes)
    );
}

#[test]
fn every_truncation_point_fails_cleanly() {
    let mut rng = StdRng::seed_from_u64(0x0525);
    let tx = rand_transaction(&mut rng);
    let bytes = to_bytes(&tx);
    for cut in 0..bytes.len() {
        assert!(
            from_bytes::<Transaction>(&bytes[..cut]).is_err(),
            "truncation at {cut} decoded"
        );
    }
}
