use crate::{
    branch::{BranchData, BranchEncoder},
    cell::Cell,
};
use rand::RngCore;

/// Produces `size` non-empty cells, every one with a random hash and one of
/// an account key, a storage key or an extension. Mirrors the row shapes the
/// trie walker hands to the encoder.
pub(crate) fn generate_cell_row(size: usize) -> ([Cell; 16], u16) {
    let mut rng = rand::thread_rng();
    let mut row: [Cell; 16] = std::array::from_fn(|_| Cell::default());
    let mut bm = 0_u16;
    for (i, cell) in row.iter_mut().enumerate().take(size) {
        let mut hash = [0_u8; 32];
        rng.fill_bytes(&mut hash);
        cell.hash.try_extend_from_slice(&hash).unwrap();
        match rng.next_u32() % 3 {
            0 => {
                let mut key = [0_u8; 20];
                rng.fill_bytes(&mut key);
                cell.apk.try_extend_from_slice(&key).unwrap();
            }
            1 => {
                let mut key = [0_u8; 52];
                rng.fill_bytes(&mut key);
                cell.spk.try_extend_from_slice(&key).unwrap();
            }
            _ => {
                let len = (rng.next_u32() % 20 + 1) as usize;
                let mut ext = [0_u8; 20];
                rng.fill_bytes(&mut ext[..len]);
                cell.extension.try_extend_from_slice(&ext[..len]).unwrap();
            }
        }
        bm |= 1 << i;
    }
    (row, bm)
}

pub(crate) fn encode_row(
    row: &mut [Cell; 16],
    bitmap: u16,
    touch_map: u16,
    after_map: u16,
) -> BranchData {
    let dir = tempfile::tempdir().unwrap();
    let mut be = BranchEncoder::new(1024, dir.path());
    let (enc, _) = be.encode_branch(bitmap, touch_map, after_map, row).unwrap();
    BranchData::from(enc.to_vec())
}
