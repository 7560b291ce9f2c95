//! Partial merkle tree verification for filtered blocks.
//!
//! A `merkleblock` message carries the block header, the total transaction
//! count, a depth-first list of hashes and a flag bitstring. Verification
//! replays the depth-first walk with an explicit stack, recomputes the
//! merkle root and collects the transaction ids the remote marked as
//! matched. The check is self-consistency only; the caller compares the
//! header against its own chain.

use std::collections::HashMap;
use std::fmt;

use elaspv_consensus::Hash256;
use elaspv_primitives::encoding::{DecodeError, Decoder, Encoder, WireDecode, WireEncode};
use elaspv_primitives::hash::sha256d;
use elaspv_primitives::BlockHeader;

/// Bound on the hash list length accepted off the wire.
const MAX_MERKLE_HASHES: u64 = 1 << 17;
/// Bound on the flag bitstring accepted off the wire.
const MAX_MERKLE_FLAGS: u64 = 1 << 14;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    pub tx_count: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
}

impl WireEncode for MerkleBlock {
    fn encode_into(&self, encoder: &mut Encoder) {
        self.header.encode_into(encoder);
        encoder.write_u32_le(self.tx_count);
        encoder.write_varint(self.hashes.len() as u64);
        for hash in &self.hashes {
            encoder.write_hash(hash);
        }
        encoder.write_var_bytes(&self.flags);
    }
}

impl WireDecode for MerkleBlock {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::decode_from(decoder)?;
        let tx_count = decoder.read_u32_le()?;
        let hash_count = decoder.read_varint_max(MAX_MERKLE_HASHES)?;
        let mut hashes = Vec::with_capacity(hash_count as usize);
        for _ in 0..hash_count {
            hashes.push(decoder.read_hash()?);
        }
        let flags = decoder.read_var_bytes_max(MAX_MERKLE_FLAGS)?;
        Ok(Self {
            header,
            tx_count,
            hashes,
            flags,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MerkleError {
    /// tx_count of zero.
    NoTransactions,
    /// Empty flag bitstring.
    NoFlags,
    /// Two equal sibling hashes combined (CVE-2012-2459).
    DuplicateHash,
    /// A combine step found no left child hash.
    MissingLeft,
    /// The hash list ran dry mid-walk.
    OutOfHashes,
    /// The flag bitstring ran dry mid-walk.
    OutOfFlags,
    /// The walk descended to a leaf position past tx_count.
    LeafOutOfRange,
    /// Hashes were left unconsumed after the root was reached.
    UnusedHashes,
    /// Non-zero flag bits were left unconsumed after the root was reached.
    UnusedFlags,
    /// The recomputed root differs from the header's merkle root.
    RootMismatch,
    /// Stack bookkeeping went inconsistent; malformed flag string.
    Malformed,
}

impl fmt::Display for MerkleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MerkleError::NoTransactions => write!(f, "no transactions in merkleblock"),
            MerkleError::NoFlags => write!(f, "no flag bits"),
            MerkleError::DuplicateHash => write!(f, "DUP HASH CRASH"),
            MerkleError::MissingLeft => write!(f, "left child is nil"),
            MerkleError::OutOfHashes => write!(f, "ran out of hashes"),
            MerkleError::OutOfFlags => write!(f, "ran out of flag bits"),
            MerkleError::LeafOutOfRange => write!(f, "leaf position beyond transaction count"),
            MerkleError::UnusedHashes => write!(f, "unused hashes after root"),
            MerkleError::UnusedFlags => write!(f, "unused flag bits after root"),
            MerkleError::RootMismatch => write!(f, "computed root does not match header"),
            MerkleError::Malformed => write!(f, "malformed partial merkle tree"),
        }
    }
}

impl std::error::Error for MerkleError {}

/// Number of tree levels above the leaf row for `n` leaves.
pub fn tree_depth(n: u32) -> u32 {
    let mut depth = 0;
    while (1u32 << depth) < n {
        depth += 1;
    }
    depth
}

/// Smallest power of two that can contain `n` leaves.
pub fn next_power_of_two(n: u32) -> u32 {
    1 << tree_depth(n)
}

/// Whether a tree position is structurally unpopulated for `size` leaves.
///
/// Leaves occupy positions `[0, msb)`; each higher row is offset by `msb`,
/// and the root sits at `(msb << 1) - 2`.
fn in_dead_zone(pos: u32, size: u32) -> bool {
    let msb = next_power_of_two(size);
    let mut last = size - 1;
    if pos > (msb << 1) - 2 {
        // beyond the root; not even in the tree
        return true;
    }
    let mut row = msb;
    while pos >= row {
        row = (row >> 1) | msb;
        last = (last >> 1) | msb;
    }
    pos > last
}

/// Hash two sibling nodes into their parent, refusing equal siblings.
fn make_merkle_parent(
    left: Option<&Hash256>,
    right: Option<&Hash256>,
) -> Result<Hash256, MerkleError> {
    // Duplicated siblings let an attacker mint fake leaves; CVE-2012-2459.
    if let (Some(left), Some(right)) = (left, right) {
        if left == right {
            return Err(MerkleError::DuplicateHash);
        }
    }
    let left = left.ok_or(MerkleError::MissingLeft)?;
    let right = right.unwrap_or(left);
    let mut concat = [0u8; 64];
    concat[..32].copy_from_slice(left);
    concat[32..].copy_from_slice(right);
    Ok(sha256d(&concat))
}

fn sha256d_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut concat = [0u8; 64];
    concat[..32].copy_from_slice(left);
    concat[32..].copy_from_slice(right);
    sha256d(&concat)
}

/// The sibling path proving one transaction's inclusion. `index` is the
/// leaf's position among all of the block's transactions; its bits select
/// the concatenation side at each level.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MerkleBranch {
    pub branches: Vec<Hash256>,
    pub index: u32,
}

impl WireEncode for MerkleBranch {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_varint(self.branches.len() as u64);
        for hash in &self.branches {
            encoder.write_hash(hash);
        }
        encoder.write_u32_le(self.index);
    }
}

impl WireDecode for MerkleBranch {
    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let count = decoder.read_varint_max(32)?;
        let mut branches = Vec::with_capacity(count as usize);
        for _ in 0..count {
            branches.push(decoder.read_hash()?);
        }
        let index = decoder.read_u32_le()?;
        Ok(Self { branches, index })
    }
}

/// Fold a leaf hash up a branch, reproducing the root it commits to.
pub fn merkle_root_from_branch(leaf: &Hash256, branches: &[Hash256], index: u32) -> Hash256 {
    let mut hash = *leaf;
    for (level, sibling) in branches.iter().enumerate() {
        if (index >> level) & 1 == 0 {
            hash = sha256d_pair(&hash, sibling);
        } else {
            hash = sha256d_pair(sibling, &hash);
        }
    }
    hash
}

/// Outcome of a successful merkle block check: the matched leaves plus
/// every node hash resolved during the walk, kept for branch extraction.
#[derive(Clone, Debug)]
pub struct MerkleMatches {
    tx_count: u32,
    matched: Vec<(u32, Hash256)>,
    resolved: HashMap<u32, Hash256>,
}

impl MerkleMatches {
    pub fn matched_tx_ids(&self) -> Vec<Hash256> {
        self.matched.iter().map(|(_, hash)| *hash).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.matched.is_empty()
    }

    /// Extract the inclusion proof for one matched transaction.
    pub fn branch(&self, tx_id: &Hash256) -> Option<MerkleBranch> {
        let &(leaf_pos, _) = self.matched.iter().find(|(_, hash)| hash == tx_id)?;
        let msb = next_power_of_two(self.tx_count);
        let depth = tree_depth(self.tx_count);
        let mut branches = Vec::with_capacity(depth as usize);
        let mut pos = leaf_pos;
        let mut current = *self.resolved.get(&leaf_pos)?;
        for _ in 0..depth {
            let sibling_pos = pos ^ 1;
            let sibling = if in_dead_zone(sibling_pos, self.tx_count) {
                current
            } else {
                *self.resolved.get(&sibling_pos)?
            };
            branches.push(sibling);
            current = if pos & 1 == 0 {
                sha256d_pair(&current, &sibling)
            } else {
                sha256d_pair(&sibling, &current)
            };
            pos = (pos >> 1) | msb;
        }
        Some(MerkleBranch {
            branches,
            index: leaf_pos,
        })
    }
}

struct MerkleNode {
    pos: u32,
    hash: Option<Hash256>,
}

/// Replay the depth-first walk, recompute the root and return the matched
/// transaction ids. Self-consistency only.
pub fn check_merkle_block(block: &MerkleBlock) -> Result<MerkleMatches, MerkleError> {
    if block.tx_count == 0 {
        return Err(MerkleError::NoTransactions);
    }
    if block.flags.is_empty() {
        return Err(MerkleError::NoFlags);
    }

    let msb = next_power_of_two(block.tx_count);
    let total_bits = block.flags.len() * 8;

    let mut stack: Vec<MerkleNode> = Vec::new();
    let mut matched: Vec<(u32, Hash256)> = Vec::new();
    let mut resolved: HashMap<u32, Hash256> = HashMap::new();
    let mut pos = (msb << 1) - 2;
    let mut next_hash = 0usize;
    let mut next_bit = 0usize;

    loop {
        // A single filled node is the finished root.
        if stack.len() == 1 {
            if let Some(root) = stack[0].hash {
                if root != block.header.merkle_root {
                    return Err(MerkleError::RootMismatch);
                }
                if next_hash != block.hashes.len() {
                    return Err(MerkleError::UnusedHashes);
                }
                for bit in next_bit..total_bits {
                    if block.flags[bit / 8] & (1 << (bit % 8)) != 0 {
                        return Err(MerkleError::UnusedFlags);
                    }
                }
                return Ok(MerkleMatches {
                    tx_count: block.tx_count,
                    matched,
                    resolved,
                });
            }
        }

        // Partial parent: hash the lone left child with itself and ascend.
        if in_dead_zone(pos, block.tx_count) {
            if stack.len() < 2 {
                return Err(MerkleError::Malformed);
            }
            let tip = stack.len() - 1;
            let parent = make_merkle_parent(stack[tip].hash.as_ref(), None)?;
            stack.truncate(tip);
            let parent_pos = stack[tip - 1].pos;
            stack[tip - 1].hash = Some(parent);
            resolved.insert(parent_pos, parent);
            pos = parent_pos | 1;
            continue;
        }

        // Two filled siblings on top of a placeholder: combine and ascend.
        if stack.len() > 2 {
            let tip = stack.len() - 1;
            if let (Some(left), Some(right)) = (stack[tip - 1].hash, stack[tip].hash) {
                let parent = make_merkle_parent(Some(&left), Some(&right))?;
                stack.truncate(tip - 1);
                let parent_pos = stack[tip - 2].pos;
                stack[tip - 2].hash = Some(parent);
                resolved.insert(parent_pos, parent);
                pos = parent_pos | 1;
                continue;
            }
        }

        // No stack op applies; consume message data for a new node.
        if next_hash >= block.hashes.len() {
            return Err(MerkleError::OutOfHashes);
        }
        if next_bit >= total_bits {
            return Err(MerkleError::OutOfFlags);
        }
        let flag_set = block.flags[next_bit / 8] & (1 << (next_bit % 8)) != 0;

        if pos & msb != 0 {
            // Upper row.
            if flag_set {
                // Skip: placeholder on the stack, descend to the left child.
                stack.push(MerkleNode { pos, hash: None });
                pos = (pos ^ msb) << 1;
            } else {
                // Fill this subtree's root straight from the message.
                let hash = block.hashes[next_hash];
                next_hash += 1;
                resolved.insert(pos, hash);
                stack.push(MerkleNode {
                    pos,
                    hash: Some(hash),
                });
                if pos & 1 != 0 {
                    pos = (pos >> 1) | msb;
                } else {
                    pos |= 1;
                }
            }
        } else {
            // Bottom row txid. The dead-zone check above keeps the walk
            // inside [0, tx_count), but guard the invariant anyway.
            if pos >= block.tx_count {
                return Err(MerkleError::LeafOutOfRange);
            }
            let hash = block.hashes[next_hash];
            next_hash += 1;
            resolved.insert(pos, hash);
            if flag_set {
                matched.push((pos, hash));
            }
            stack.push(MerkleNode {
                pos,
                hash: Some(hash),
            });
            if pos & 1 == 0 {
                pos |= 1;
            }
            // On the right side the next stack op ascends.
        }

        next_bit += 1;
    }
}
