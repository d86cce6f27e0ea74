use crate::{branch::BranchData, cell::DecodeError, varint::uvarint};
use anyhow::Result;
use arrayref::array_ref;
use sha3::{Digest, Keccak256};
use std::fmt;

/// Combines two encoded branches, the second applied after (and potentially
/// shadowing) the first.
///
/// Owns a reusable scratch buffer and a Keccak256 state; not safe for
/// concurrent use. [`BranchMerger::merge`] returns freshly allocated data, so
/// the result outlives the merger.
pub struct BranchMerger {
    buf: Vec<u8>,
    keccak: Keccak256,
}

impl fmt::Debug for BranchMerger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchMerger")
            .field("buf", &self.buf.len())
            .finish_non_exhaustive()
    }
}

impl BranchMerger {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            keccak: Keccak256::new(),
        }
    }

    /// Keccak256 state for callers that interleave hashing with merging.
    /// `merge` itself never touches it.
    pub fn hasher(&mut self) -> &mut Keccak256 {
        &mut self.keccak
    }

    /// Produces a single branch equivalent to applying `branch1` and then
    /// `branch2`. Children touched by `branch2` shadow `branch1` entirely;
    /// children deleted by `branch2` carry no payload regardless of
    /// `branch1`. The merged header is `(touch1 | touch2, after2)`.
    pub fn merge(&mut self, branch1: &BranchData, branch2: &BranchData) -> Result<BranchData> {
        if branch2.is_empty() {
            return Ok(branch1.clone());
        }
        if branch1.is_empty() {
            return Ok(branch2.clone());
        }

        let b1: &[u8] = branch1;
        let b2: &[u8] = branch2;
        if b1.len() < 4 {
            return Err(DecodeError::Truncated("branch1 header").into());
        }
        if b2.len() < 4 {
            return Err(DecodeError::Truncated("branch2 header").into());
        }

        let touch_map1 = u16::from_be_bytes(*array_ref!(b1, 0, 2));
        let after_map1 = u16::from_be_bytes(*array_ref!(b1, 2, 2));
        let bitmap1 = touch_map1 & after_map1;
        let mut pos1 = 4_usize;

        let touch_map2 = u16::from_be_bytes(*array_ref!(b2, 0, 2));
        let after_map2 = u16::from_be_bytes(*array_ref!(b2, 2, 2));
        let bitmap2 = touch_map2 & after_map2;
        let mut pos2 = 4_usize;

        self.buf.clear();
        self.buf
            .extend_from_slice(&(touch_map1 | touch_map2).to_be_bytes());
        self.buf.extend_from_slice(&after_map2.to_be_bytes());

        let mut bitset = bitmap1 | bitmap2;
        while bitset != 0 {
            let bit = bitset & 0_u16.overflowing_sub(bitset).0;
            if bitmap2 & bit != 0 {
                // fields from branch2 always win
                pos2 = self.append_cell(b2, pos2, true, "branch2")?;
            }
            if bitmap1 & bit != 0 {
                // branch1's cell survives only when branch2 leaves the child
                // untouched yet present
                let add = (touch_map2 & bit == 0) && (after_map2 & bit != 0);
                pos1 = self.append_cell(b1, pos1, add, "branch1")?;
            }
            bitset ^= bit;
        }

        Ok(BranchData::from(self.buf.clone()))
    }

    /// Walks one per-cell record at `pos`, appending its bytes to the output
    /// when `add` is set and merely advancing past them otherwise.
    fn append_cell(
        &mut self,
        data: &[u8],
        mut pos: usize,
        add: bool,
        side: &'static str,
    ) -> Result<usize> {
        if pos >= data.len() {
            return Err(DecodeError::Truncated(side).into());
        }
        let field_bits = data[pos];
        if add {
            self.buf.push(field_bits);
        }
        pos += 1;
        for _ in 0..field_bits.count_ones() {
            let (l, n) = uvarint(&data[pos..]).ok_or(DecodeError::Overflow(side))?;
            if n == 0 {
                return Err(DecodeError::BadVarint(side).into());
            }
            let l = l as usize;
            if data.len() - (pos + n) < l {
                return Err(DecodeError::Truncated(side).into());
            }
            if add {
                self.buf.extend_from_slice(&data[pos..pos + n + l]);
            }
            pos += n + l;
        }
        Ok(pos)
    }
}

/// One-shot merge without a reusable merger.
pub fn merge_branches(branch1: &BranchData, branch2: &BranchData) -> Result<BranchData> {
    BranchMerger::new(branch1.len() + branch2.len()).merge(branch1, branch2)
}
