use crate::{branch::BranchData, context::TrieVariant};

/// Collected summary over one encoded branch.
#[derive(Clone, Copy, Debug, Default)]
pub struct BranchStat {
    pub key_size: u64,
    pub val_size: u64,
    /// Smallest encoded cell seen; 0 means no cell has been observed yet.
    pub min_cell_size: u64,
    pub max_cell_size: u64,
    pub cell_count: u64,
    pub apk_size: u64,
    pub spk_size: u64,
    pub ext_size: u64,
    pub hash_size: u64,
    pub apk_count: u64,
    pub spk_count: u64,
    pub hash_count: u64,
    pub ext_count: u64,
    pub ta_maps_size: u64,
    pub is_root: bool,
}

impl BranchStat {
    /// Folds `other` into this accumulator. Root-entry stats are never added
    /// to ordinary branch totals.
    pub fn collect(&mut self, other: &BranchStat) {
        if other.is_root {
            return;
        }
        self.key_size += other.key_size;
        self.val_size += other.val_size;
        self.min_cell_size = match (self.min_cell_size, other.min_cell_size) {
            (0, m) | (m, 0) => m,
            (a, b) => a.min(b),
        };
        self.max_cell_size = self.max_cell_size.max(other.max_cell_size);
        self.cell_count += other.cell_count;
        self.apk_size += other.apk_size;
        self.spk_size += other.spk_size;
        self.ext_size += other.ext_size;
        self.hash_size += other.hash_size;
        self.apk_count += other.apk_count;
        self.spk_count += other.spk_count;
        self.hash_count += other.hash_count;
        self.ext_count += other.ext_count;
        self.ta_maps_size += other.ta_maps_size;
    }
}

/// Decodes a persisted branch and summarises it. The fixed key `"state"`
/// addresses the root entry, whose value is not branch data and is left
/// undecoded. Undecodable branches yield `None`.
pub fn decode_branch_and_collect_stat(
    key: &[u8],
    branch: &BranchData,
    tv: TrieVariant,
) -> Option<BranchStat> {
    if key.is_empty() {
        return None;
    }

    let mut stat = BranchStat {
        key_size: key.len() as u64,
        val_size: branch.len() as u64,
        is_root: true,
        ..Default::default()
    };
    if key == b"state" {
        return Some(stat);
    }
    stat.is_root = false;

    let (tm, am, cells) = branch.decode_cells().ok()?;
    stat.ta_maps_size = 2 + 2;
    stat.cell_count = u64::from((tm & am).count_ones());
    for cell in cells.iter().flatten() {
        let enc = cell.encode().len() as u64;
        stat.min_cell_size = if stat.min_cell_size == 0 {
            enc
        } else {
            stat.min_cell_size.min(enc)
        };
        stat.max_cell_size = stat.max_cell_size.max(enc);
        if !cell.apk.is_empty() {
            stat.apk_size += cell.apk.len() as u64;
            stat.apk_count += 1;
        } else if !cell.spk.is_empty() {
            stat.spk_size += cell.spk.len() as u64;
            stat.spk_count += 1;
        } else if !cell.hash.is_empty() {
            stat.hash_size += cell.hash.len() as u64;
            stat.hash_count += 1;
        }
        if !cell.extension.is_empty() {
            match tv {
                TrieVariant::Hex | TrieVariant::Bin => {
                    stat.ext_size += cell.extension.len() as u64;
                }
            }
            stat.ext_count += 1;
        }
    }
    Some(stat)
}
