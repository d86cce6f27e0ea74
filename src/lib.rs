//! Branch-node encoding for a hexary Patricia commitment trie.
//!
//! Every interior node of the trie has up to sixteen children, and each update
//! to it is persisted as a compact, self-describing byte string: two 16-bit
//! presence bitmaps (`touchMap`, `afterMap`) followed by per-child records
//! with varuint-length-prefixed fields. This crate owns that format end to
//! end:
//!
//! - [`Cell`] and [`BranchData`] model one child slot and one encoded update;
//! - [`BranchEncoder`] serialises rows of cells, pulling them through a
//!   [`CellSource`] so the caller can drive an external hasher alongside;
//! - [`BranchMerger`] combines two encoded updates into one, the later
//!   shadowing the earlier;
//! - [`BranchData::replace_plain_keys`] rewrites embedded account and storage
//!   keys in place, e.g. to swap full plain keys for short database handles;
//! - [`Collector`] buffers `(prefix, update)` pairs, spilling to disk, and
//!   replays them in prefix order against a [`PatriciaContext`] store.

mod varint;

pub mod branch;
pub mod cell;
pub mod collector;
pub mod context;
pub mod merge;
pub mod stat;

#[cfg(test)]
mod test_util;

pub use branch::{BranchData, BranchEncoder, CellSource};
pub use cell::{
    Cell, DecodeError, PartFlags, ACCOUNT_PLAIN_PART, HASHEDKEY_PART, HASH_PART,
    STORAGE_PLAIN_PART,
};
pub use collector::{Collector, TransformArgs, BUFFER_OPTIMAL_SIZE};
pub use context::{load_into_context, PatriciaContext, TrieVariant};
pub use merge::{merge_branches, BranchMerger};
pub use stat::{decode_branch_and_collect_stat, BranchStat};

pub(crate) fn count_key_update() {
    metrics::counter!("domain_commitment_keys").increment(1);
}

pub(crate) fn count_branch_update() {
    metrics::counter!("domain_commitment_updates_applied").increment(1);
}
