use crate::{
    cell::{
        Cell, DecodeError, ACCOUNT_PLAIN_PART, HASHEDKEY_PART, HASH_PART, STORAGE_PLAIN_PART,
    },
    collector::{Collector, TransformArgs, BUFFER_OPTIMAL_SIZE},
    varint::{encode_slice, uvarint},
};
use anyhow::{ensure, Context, Result};
use arrayref::array_ref;
use bytes::Bytes;
use std::{fmt, ops::Deref, path::PathBuf};
use tracing::trace;

/// Encoded branch update: big-endian `touchMap` and `afterMap` followed by
/// per-child records in ascending nibble order.
///
/// `touchMap` bit `i` means the child at nibble `i` was modified or deleted by
/// this update; `afterMap` bit `i` means the child is present once the update
/// is applied. Untouched children are absent from the payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BranchData(Bytes);

impl BranchData {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Panics if the branch is shorter than the 4-byte header.
    pub fn touch_map(&self) -> u16 {
        let data: &[u8] = &self.0;
        u16::from_be_bytes(*array_ref!(data, 0, 2))
    }

    /// Panics if the branch is shorter than the 4-byte header.
    pub fn after_map(&self) -> u16 {
        let data: &[u8] = &self.0;
        u16::from_be_bytes(*array_ref!(data, 2, 2))
    }

    /// Whether every child present after this update is described by it:
    /// `!touchMap & afterMap == 0`.
    pub fn is_complete(&self) -> bool {
        !self.touch_map() & self.after_map() == 0
    }

    /// Reconstructs the row of cells. Children with the `afterMap` bit clear
    /// produce `None`.
    pub fn decode_cells(&self) -> Result<(u16, u16, [Option<Cell>; 16])> {
        let data: &[u8] = &self.0;
        if data.len() < 4 {
            return Err(DecodeError::Truncated("branch header").into());
        }
        let touch_map = u16::from_be_bytes(*array_ref!(data, 0, 2));
        let after_map = u16::from_be_bytes(*array_ref!(data, 2, 2));
        let mut pos = 4_usize;
        let mut row: [Option<Cell>; 16] = std::array::from_fn(|_| None);
        let mut bitset = touch_map;
        while bitset != 0 {
            let bit = bitset & 0_u16.overflowing_sub(bitset).0;
            let nibble = bit.trailing_zeros() as usize;
            if after_map & bit != 0 {
                if pos >= data.len() {
                    return Err(DecodeError::Truncated("field bits").into());
                }
                let field_bits = data[pos];
                pos += 1;
                let mut cell = Cell::default();
                pos = cell
                    .fill_from_fields(data, pos, field_bits)
                    .with_context(|| format!("failed to fill cell at nibble {nibble:x}"))?;
                row[nibble] = Some(cell);
            }
            bitset ^= bit;
        }
        Ok((touch_map, after_map, row))
    }

    /// Rewrites embedded account and storage plain keys in place, leaving all
    /// other bytes untouched. `fn_(key, is_storage)` returning `None` keeps
    /// the original length prefix and bytes; `Some(new_key)` substitutes a
    /// fresh varuint length and the new bytes.
    pub fn replace_plain_keys<F>(&self, mut fn_: F) -> Result<BranchData>
    where
        F: FnMut(&[u8], bool) -> Result<Option<Vec<u8>>>,
    {
        fn copy_field(
            data: &[u8],
            pos: usize,
            out: &mut Vec<u8>,
            field: &'static str,
        ) -> Result<usize> {
            let (l, n) = uvarint(&data[pos..]).ok_or(DecodeError::Overflow(field))?;
            if n == 0 {
                return Err(DecodeError::BadVarint(field).into());
            }
            let l = l as usize;
            if data.len() - (pos + n) < l {
                return Err(DecodeError::Truncated(field).into());
            }
            out.extend_from_slice(&data[pos..pos + n + l]);
            Ok(pos + n + l)
        }

        fn replace_field<F>(
            data: &[u8],
            pos: usize,
            out: &mut Vec<u8>,
            is_storage: bool,
            field: &'static str,
            fn_: &mut F,
        ) -> Result<usize>
        where
            F: FnMut(&[u8], bool) -> Result<Option<Vec<u8>>>,
        {
            let (l, n) = uvarint(&data[pos..]).ok_or(DecodeError::Overflow(field))?;
            if n == 0 {
                return Err(DecodeError::BadVarint(field).into());
            }
            let l = l as usize;
            if data.len() - (pos + n) < l {
                return Err(DecodeError::Truncated(field).into());
            }
            let key = &data[pos + n..pos + n + l];
            match fn_(key, is_storage)? {
                None => out.extend_from_slice(&data[pos..pos + n + l]),
                Some(new_key) => encode_slice(out, &new_key),
            }
            Ok(pos + n + l)
        }

        let data: &[u8] = &self.0;
        if data.len() < 4 {
            return Ok(self.clone());
        }
        let touch_map = u16::from_be_bytes(*array_ref!(data, 0, 2));
        let after_map = u16::from_be_bytes(*array_ref!(data, 2, 2));
        if touch_map & after_map == 0 {
            return Ok(self.clone());
        }

        let mut out = Vec::with_capacity(data.len());
        out.extend_from_slice(&data[..4]);
        let mut pos = 4_usize;
        let mut bitset = touch_map & after_map;
        while bitset != 0 {
            let bit = bitset & 0_u16.overflowing_sub(bitset).0;
            if pos >= data.len() {
                return Err(DecodeError::Truncated("field bits").into());
            }
            let field_bits = data[pos];
            out.push(field_bits);
            pos += 1;
            if field_bits & HASHEDKEY_PART != 0 {
                pos = copy_field(data, pos, &mut out, "hashedKey")?;
            }
            if field_bits & ACCOUNT_PLAIN_PART != 0 {
                pos = replace_field(data, pos, &mut out, false, "accountPlainKey", &mut fn_)?;
            }
            if field_bits & STORAGE_PLAIN_PART != 0 {
                pos = replace_field(data, pos, &mut out, true, "storagePlainKey", &mut fn_)?;
            }
            if field_bits & HASH_PART != 0 {
                pos = copy_field(data, pos, &mut out, "hash")?;
            }
            bitset ^= bit;
        }

        Ok(BranchData(out.into()))
    }
}

impl From<Vec<u8>> for BranchData {
    fn from(data: Vec<u8>) -> Self {
        Self(data.into())
    }
}

impl From<Bytes> for BranchData {
    fn from(data: Bytes) -> Self {
        Self(data)
    }
}

impl Deref for BranchData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for BranchData {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Diagnostics pretty-printer. Panics on malformed input; only used in tests
/// and debug prints.
impl fmt::Display for BranchData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        let data: &[u8] = &self.0;
        let touch_map = u16::from_be_bytes(*array_ref!(data, 0, 2));
        let after_map = u16::from_be_bytes(*array_ref!(data, 2, 2));
        writeln!(f, "touchMap {touch_map:016b}, afterMap {after_map:016b}")?;
        let mut pos = 4_usize;
        let mut cell = Cell::default();
        let mut bitset = touch_map;
        while bitset != 0 {
            let bit = bitset & 0_u16.overflowing_sub(bitset).0;
            let nibble = bit.trailing_zeros();
            write!(f, "   {nibble:x} => ")?;
            if after_map & bit == 0 {
                writeln!(f, "{{DELETED}}")?;
            } else {
                let field_bits = data[pos];
                pos += 1;
                pos = cell
                    .fill_from_fields(data, pos, field_bits)
                    .expect("malformed branch data");
                let mut comma = "";
                write!(f, "{{")?;
                if !cell.extension.is_empty() {
                    write!(f, "hashedKey=[{}]", hex::encode(&cell.extension))?;
                    comma = ",";
                }
                if !cell.apk.is_empty() {
                    write!(f, "{comma}accountPlainKey=[{}]", hex::encode(&cell.apk))?;
                    comma = ",";
                }
                if !cell.spk.is_empty() {
                    write!(f, "{comma}storagePlainKey=[{}]", hex::encode(&cell.spk))?;
                    comma = ",";
                }
                if !cell.hash.is_empty() {
                    write!(f, "{comma}hash=[{}]", hex::encode(&cell.hash))?;
                }
                writeln!(f, "}}")?;
            }
            bitset ^= bit;
        }
        Ok(())
    }
}

/// Source of cells for [`BranchEncoder::encode_branch`].
///
/// The encoder visits every nibble up to the highest touched one exactly once,
/// in ascending order: `load` for nibbles that carry data, `skip` for the
/// rest. Implementations typically feed the empty-child marker (`0x80`) into
/// an external hasher on `skip`, which is why skipped nibbles are reported at
/// all.
pub trait CellSource {
    fn load(&mut self, nibble: usize) -> Result<&Cell>;
    fn skip(&mut self, nibble: usize) -> Result<()>;
}

/// A fully materialised row; `skip` is a no-op.
impl CellSource for [Cell; 16] {
    fn load(&mut self, nibble: usize) -> Result<&Cell> {
        Ok(&self[nibble])
    }

    fn skip(&mut self, _nibble: usize) -> Result<()> {
        Ok(())
    }
}

/// Serialises rows of cells into [`BranchData`] and batches the results
/// through a spilling [`Collector`].
///
/// Not safe for concurrent use; the scratch buffer is reused across calls.
#[derive(Debug)]
pub struct BranchEncoder {
    buf: Vec<u8>,
    updates: Collector,
}

impl BranchEncoder {
    pub fn new(capacity: usize, tmpdir: impl Into<PathBuf>) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            updates: Collector::new(tmpdir, BUFFER_OPTIMAL_SIZE / 2),
        }
    }

    /// Encodes one row of cells. The returned slice aliases the encoder's
    /// internal buffer and must be copied before the next call; the second
    /// element is one past the highest visited nibble.
    ///
    /// Iteration is driven by `touch_map`: every nibble below the highest set
    /// bit is reported to `cells` exactly once, ascending. A touched nibble
    /// with the `after_map` bit clear is a deletion; it is skipped like a gap
    /// and contributes no payload bytes. Payload records are written only for
    /// bits of `bitmap`, which must be covered by `touch_map & after_map`.
    pub fn encode_branch(
        &mut self,
        bitmap: u16,
        touch_map: u16,
        after_map: u16,
        cells: &mut impl CellSource,
    ) -> Result<(&[u8], usize)> {
        ensure!(
            bitmap & !(touch_map & after_map) == 0,
            "bitmap {:016b} not covered by touchMap & afterMap {:016b}",
            bitmap,
            touch_map & after_map,
        );

        self.buf.clear();
        self.buf.extend_from_slice(&touch_map.to_be_bytes());
        self.buf.extend_from_slice(&after_map.to_be_bytes());

        let mut last_nibble = 0_usize;
        let mut bitset = touch_map;
        while bitset != 0 {
            let bit = bitset & 0_u16.overflowing_sub(bitset).0;
            let nibble = bit.trailing_zeros() as usize;
            for i in last_nibble..nibble {
                cells.skip(i)?;
            }
            last_nibble = nibble + 1;
            if after_map & bit == 0 {
                // deleted child: empty in the post-state, no payload bytes
                cells.skip(nibble)?;
            } else {
                let cell = cells.load(nibble)?;
                if bitmap & bit != 0 {
                    let field_bits = cell.field_bits();
                    self.buf.push(field_bits);
                    if field_bits & HASHEDKEY_PART != 0 {
                        encode_slice(&mut self.buf, &cell.extension);
                    }
                    if field_bits & ACCOUNT_PLAIN_PART != 0 {
                        encode_slice(&mut self.buf, &cell.apk);
                    }
                    if field_bits & STORAGE_PLAIN_PART != 0 {
                        encode_slice(&mut self.buf, &cell.spk);
                    }
                    if field_bits & HASH_PART != 0 {
                        encode_slice(&mut self.buf, &cell.hash);
                    }
                }
            }
            bitset ^= bit;
        }
        trace!(
            "encoded branch [{}], last nibble {}",
            hex::encode(&self.buf),
            last_nibble
        );
        Ok((&self.buf, last_nibble))
    }

    /// Encodes the row and queues the result for the next [`Self::load`].
    pub fn collect_update(
        &mut self,
        prefix: &[u8],
        bitmap: u16,
        touch_map: u16,
        after_map: u16,
        cells: &mut impl CellSource,
    ) -> Result<usize> {
        let (_, last_nibble) = self.encode_branch(bitmap, touch_map, after_map, cells)?;
        self.updates.collect(prefix, &self.buf)?;
        crate::count_key_update();
        Ok(last_nibble)
    }

    /// Delivers all collected updates to `load_fn` in prefix order and
    /// re-arms the collector for the next batch.
    pub fn load(
        &mut self,
        load_fn: impl FnMut(&[u8], &[u8]) -> Result<()>,
        args: TransformArgs,
    ) -> Result<()> {
        self.updates.load(load_fn, args)
    }
}
