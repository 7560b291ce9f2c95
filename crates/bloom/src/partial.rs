//! Depth-first partial merkle tree construction.
//!
//! Builds the (hashes, flags) pair a `merkleblock` message carries, given
//! the full txid list and the subset that matched the peer's filter. The
//! node only ever receives these from peers; construction lives here for
//! proof objects and for exercising the verifier against known trees.

use elaspv_consensus::Hash256;
use elaspv_primitives::hash::sha256d;
use elaspv_primitives::BlockHeader;

use crate::merkleblock::{tree_depth, MerkleBlock};

pub struct PartialMerkleTree {
    num_tx: u32,
    tx_ids: Vec<Hash256>,
    matched: Vec<bool>,
    bits: Vec<bool>,
    final_hashes: Vec<Hash256>,
}

impl PartialMerkleTree {
    /// Build the depth-first traversal for `tx_ids` with `matched` marking
    /// the leaves of interest. Panics if the slices differ in length or are
    /// empty; blocks always carry at least a coinbase.
    pub fn build(tx_ids: &[Hash256], matched: &[bool]) -> Self {
        assert_eq!(tx_ids.len(), matched.len());
        assert!(!tx_ids.is_empty());
        let mut tree = Self {
            num_tx: tx_ids.len() as u32,
            tx_ids: tx_ids.to_vec(),
            matched: matched.to_vec(),
            bits: Vec::new(),
            final_hashes: Vec::new(),
        };
        let depth = tree_depth(tree.num_tx);
        tree.traverse_and_build(depth, 0);
        tree
    }

    /// Width of the tree at `height` levels above the leaves.
    fn calc_tree_width(&self, height: u32) -> u32 {
        (self.num_tx + (1 << height) - 1) >> height
    }

    /// Hash of the node at (height, pos), duplicating the left child when
    /// the right child falls off the row.
    fn calc_hash(&self, height: u32, pos: u32) -> Hash256 {
        if height == 0 {
            return self.tx_ids[pos as usize];
        }
        let left = self.calc_hash(height - 1, pos * 2);
        let right = if pos * 2 + 1 < self.calc_tree_width(height - 1) {
            self.calc_hash(height - 1, pos * 2 + 1)
        } else {
            left
        };
        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&left);
        concat[32..].copy_from_slice(&right);
        sha256d(&concat)
    }

    fn traverse_and_build(&mut self, height: u32, pos: u32) {
        let first = pos << height;
        let last = ((pos + 1) << height).min(self.num_tx);
        let parent_of_match = (first..last).any(|leaf| self.matched[leaf as usize]);
        self.bits.push(parent_of_match);
        if height == 0 || !parent_of_match {
            self.final_hashes.push(self.calc_hash(height, pos));
        } else {
            self.traverse_and_build(height - 1, pos * 2);
            if pos * 2 + 1 < self.calc_tree_width(height - 1) {
                self.traverse_and_build(height - 1, pos * 2 + 1);
            }
        }
    }

    pub fn root(&self) -> Hash256 {
        self.calc_hash(tree_depth(self.num_tx), 0)
    }

    /// Pack into the wire message, bits LSB-first per flag byte.
    pub fn to_merkle_block(&self, header: BlockHeader) -> MerkleBlock {
        let mut flags = vec![0u8; self.bits.len().div_ceil(8)];
        for (i, bit) in self.bits.iter().enumerate() {
            if *bit {
                flags[i / 8] |= 1 << (i % 8);
            }
        }
        MerkleBlock {
            header,
            tx_count: self.num_tx,
            hashes: self.final_hashes.clone(),
            flags,
        }
    }
}
