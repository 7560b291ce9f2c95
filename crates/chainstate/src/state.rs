//! Append-only header chain with fork detection and rollback.
//!
//! Headers are accepted only with valid proof-of-work and a known parent.
//! The best tip follows greatest cumulative work; moving it across a fork
//! yields a [`ReorgEvent`] the sync coordinator uses to rewind the ledger.

use std::sync::{Arc, Mutex, PoisonError};

use elaspv_consensus::{ChainParams, Hash256};
use elaspv_pow::{block_proof, check_proof_of_work, PowError};
use elaspv_primitives::encoding::DecodeError;
use elaspv_primitives::BlockHeader;
use elaspv_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::index::{BestTip, HeaderEntry};

const META_TIP_KEY: &[u8] = b"tip";

#[derive(Debug)]
pub enum ChainStateError {
    Store(StoreError),
    Decode(DecodeError),
    Pow(PowError),
    /// The header's parent is not stored; the caller queues the orphan
    /// and requests ancestors.
    UnknownParent(Hash256),
    /// The header's claimed height disagrees with its parent.
    HeightMismatch { expected: u32, got: u32 },
    CorruptIndex(&'static str),
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::Decode(err) => write!(f, "{err}"),
            ChainStateError::Pow(err) => write!(f, "{err}"),
            ChainStateError::UnknownParent(hash) => {
                write!(f, "unknown parent {}", hex(hash))
            }
            ChainStateError::HeightMismatch { expected, got } => {
                write!(f, "header height {got}, parent implies {expected}")
            }
            ChainStateError::CorruptIndex(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}

impl From<PowError> for ChainStateError {
    fn from(err: PowError) -> Self {
        ChainStateError::Pow(err)
    }
}

fn hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Best-chain switch across a fork. `detached` runs from the old tip down
/// toward the common ancestor, `attached` from just above the ancestor up
/// to the new tip.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReorgEvent {
    pub fork_height: u32,
    pub detached: Vec<(u32, Hash256)>,
    pub attached: Vec<(u32, Hash256)>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HeaderAccepted {
    /// Already stored; nothing changed.
    AlreadyKnown,
    /// Extended the current best chain.
    Extended(Hash256),
    /// Stored on a side chain; the best tip did not move.
    SideChain(Hash256),
    /// The best tip moved across a fork.
    Reorged(ReorgEvent),
}

pub struct ChainState<S> {
    store: Arc<S>,
    params: Arc<ChainParams>,
    genesis_hash: Hash256,
    tip: Mutex<BestTip>,
}

impl<S: KeyValueStore> ChainState<S> {
    /// Open the chain state, seeding the genesis header on first run.
    pub fn open(store: Arc<S>, params: Arc<ChainParams>) -> Result<Self, ChainStateError> {
        let genesis = BlockHeader::genesis(&params);
        let genesis_hash = genesis.hash();

        let tip = match store.get(Column::Meta, META_TIP_KEY)? {
            Some(bytes) => {
                let hash: Hash256 = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainStateError::CorruptIndex("malformed tip record"))?;
                let entry = load_entry(store.as_ref(), &hash)?
                    .ok_or(ChainStateError::CorruptIndex("tip header missing"))?;
                BestTip {
                    hash,
                    height: entry.height(),
                    work: entry.work,
                }
            }
            None => {
                let work = block_proof(genesis.bits)
                    .map_err(|err| ChainStateError::Pow(PowError::Compact(err)))?;
                let entry = HeaderEntry {
                    header: genesis.clone(),
                    work,
                };
                let mut batch = WriteBatch::new();
                batch.put(Column::Header, genesis_hash, entry.encode());
                batch.put(Column::HeightIndex, 0u32.to_le_bytes(), genesis_hash);
                batch.put(Column::Meta, META_TIP_KEY, genesis_hash.to_vec());
                store.write_batch(&batch)?;
                BestTip {
                    hash: genesis_hash,
                    height: 0,
                    work,
                }
            }
        };

        Ok(Self {
            store,
            params,
            genesis_hash,
            tip: Mutex::new(tip),
        })
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_hash
    }

    pub fn best_tip(&self) -> BestTip {
        *self.tip.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn header_entry(&self, hash: &Hash256) -> Result<Option<HeaderEntry>, ChainStateError> {
        load_entry(self.store.as_ref(), hash)
    }

    /// Best-chain hash at `height`, if the height is on the best chain.
    pub fn height_hash(&self, height: u32) -> Result<Option<Hash256>, ChainStateError> {
        let Some(bytes) = self.store.get(Column::HeightIndex, &height.to_le_bytes())? else {
            return Ok(None);
        };
        let hash: Hash256 = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ChainStateError::CorruptIndex("malformed height index record"))?;
        Ok(Some(hash))
    }

    /// Whether a height is final for pruning purposes.
    pub fn is_buried(&self, height: u32) -> bool {
        let tip = self.best_tip();
        tip.height >= height.saturating_add(self.params.consensus.reorg_horizon)
    }

    /// Validate and store one header, moving the best tip if it now has
    /// the most cumulative work.
    pub fn insert_header(&self, header: &BlockHeader) -> Result<HeaderAccepted, ChainStateError> {
        let hash = header.hash();
        if self.header_entry(&hash)?.is_some() {
            return Ok(HeaderAccepted::AlreadyKnown);
        }

        check_proof_of_work(&hash, header.bits, self.params.consensus.pow_limit_bits)?;

        let parent = self
            .header_entry(&header.prev_block)?
            .ok_or(ChainStateError::UnknownParent(header.prev_block))?;
        let expected = parent.height() + 1;
        if header.height != expected {
            return Err(ChainStateError::HeightMismatch {
                expected,
                got: header.height,
            });
        }

        let proof = block_proof(header.bits)
            .map_err(|err| ChainStateError::Pow(PowError::Compact(err)))?;
        let entry = HeaderEntry {
            header: header.clone(),
            work: parent.work + proof,
        };

        let mut batch = WriteBatch::new();
        batch.put(Column::Header, hash, entry.encode());

        let mut tip = self.tip.lock().unwrap_or_else(PoisonError::into_inner);

        // Strictly greater work moves the tip; ties stay first-seen.
        if entry.work <= tip.work {
            self.store.write_batch(&batch)?;
            return Ok(HeaderAccepted::SideChain(hash));
        }

        if header.prev_block == tip.hash {
            batch.put(Column::HeightIndex, header.height.to_le_bytes(), hash);
            batch.put(Column::Meta, META_TIP_KEY, hash.to_vec());
            self.store.write_batch(&batch)?;
            *tip = BestTip {
                hash,
                height: header.height,
                work: entry.work,
            };
            return Ok(HeaderAccepted::Extended(hash));
        }

        // The new tip is on a fork. Walk its ancestry back to the first
        // block already on the best chain.
        let mut attached: Vec<(u32, Hash256)> = vec![(header.height, hash)];
        let mut cursor_hash = header.prev_block;
        let mut cursor = parent.clone();
        loop {
            if self.height_hash(cursor.height())? == Some(cursor_hash) {
                break;
            }
            attached.push((cursor.height(), cursor_hash));
            let prev = cursor.header.prev_block;
            cursor = self
                .header_entry(&prev)?
                .ok_or(ChainStateError::CorruptIndex("fork walk hit missing header"))?;
            cursor_hash = prev;
        }
        attached.reverse();
        let fork_height = cursor.height();

        let mut detached: Vec<(u32, Hash256)> = Vec::new();
        for height in ((fork_height + 1)..=tip.height).rev() {
            let old = self
                .height_hash(height)?
                .ok_or(ChainStateError::CorruptIndex("height index gap"))?;
            detached.push((height, old));
            batch.delete(Column::HeightIndex, height.to_le_bytes());
        }
        for (height, attach_hash) in &attached {
            batch.put(Column::HeightIndex, height.to_le_bytes(), *attach_hash);
        }
        batch.put(Column::Meta, META_TIP_KEY, hash.to_vec());
        self.store.write_batch(&batch)?;
        *tip = BestTip {
            hash,
            height: header.height,
            work: entry.work,
        };

        Ok(HeaderAccepted::Reorged(ReorgEvent {
            fork_height,
            detached,
            attached,
        }))
    }

    /// Sparse block locator: the tip, then exponentially spaced ancestors,
    /// ending at genesis.
    pub fn locator(&self) -> Result<Vec<Hash256>, ChainStateError> {
        let tip = self.best_tip();
        let mut locator = Vec::new();
        let mut hash = tip.hash;
        let mut height = tip.height;
        let mut step: u32 = 1;

        loop {
            locator.push(hash);
            if height == 0 {
                break;
            }
            let mut back = step;
            while back > 0 && height > 0 {
                let Some(entry) = self.header_entry(&hash)? else {
                    // Pruned below; close the locator with genesis.
                    if locator.last() != Some(&self.genesis_hash) {
                        locator.push(self.genesis_hash);
                    }
                    return Ok(locator);
                };
                hash = entry.header.prev_block;
                height -= 1;
                back -= 1;
            }
            if locator.len() > 10 {
                step = step.saturating_mul(2);
            }
        }

        if locator.last() != Some(&self.genesis_hash) {
            locator.push(self.genesis_hash);
        }
        Ok(locator)
    }

    /// Drop header entries buried below the reorg horizon, keeping genesis
    /// and checkpoint heights.
    pub fn prune(&self) -> Result<usize, ChainStateError> {
        let tip = self.best_tip();
        let horizon = self.params.consensus.reorg_horizon;
        let Some(cutoff) = tip.height.checked_sub(horizon) else {
            return Ok(0);
        };

        let mut batch = WriteBatch::new();
        let mut pruned = 0usize;
        for (key, value) in self.store.scan_prefix(Column::Header, &[])? {
            let entry = HeaderEntry::decode(&value)?;
            let height = entry.height();
            if height == 0 || height >= cutoff {
                continue;
            }
            if self.params.consensus.checkpoint_heights.contains(&height) {
                continue;
            }
            batch.delete(Column::Header, key);
            pruned += 1;
        }
        if pruned > 0 {
            self.store.write_batch(&batch)?;
        }
        Ok(pruned)
    }
}

fn load_entry<S: KeyValueStore>(
    store: &S,
    hash: &Hash256,
) -> Result<Option<HeaderEntry>, ChainStateError> {
    match store.get(Column::Header, hash)? {
        Some(bytes) => Ok(Some(HeaderEntry::decode(&bytes)?)),
        None => Ok(None),
    }
}
