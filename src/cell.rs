use crate::varint::{encode_slice, uvarint};
use anyhow::Result;
use arrayvec::ArrayVec;
use thiserror::Error;

pub type PartFlags = u8;

pub const HASHEDKEY_PART: PartFlags = 1;
pub const ACCOUNT_PLAIN_PART: PartFlags = 2;
pub const STORAGE_PLAIN_PART: PartFlags = 4;
pub const HASH_PART: PartFlags = 8;

/// Maximum number of hex nibbles in a branch-to-child extension path.
pub const MAX_EXTENSION_LEN: usize = 64;
/// Maximum length of an account plain key (full key or shortened handle).
pub const MAX_ACCOUNT_KEY_LEN: usize = 32;
/// Maximum length of a storage plain key (address + slot or shortened handle).
pub const MAX_STORAGE_KEY_LEN: usize = 52;
/// Length of a Keccak256 digest.
pub const HASH_LEN: usize = 32;

/// Failure kinds shared by every decoding path of the branch format.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("buffer too small for {0}")]
    Truncated(&'static str),
    #[error("zero-length varint for {0}")]
    BadVarint(&'static str),
    #[error("varint overflow for {0}")]
    Overflow(&'static str),
    #[error("{field} length {len} exceeds maximum {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

/// One of up to sixteen children of a hexary branch node.
///
/// Any subset of the four fields may be present; a cell with all four empty is
/// never encoded. After [`Cell::fill_from_fields`] the absent fields have zero
/// length, but their backing bytes are not promised to be cleared.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cell {
    /// Hex-nibble extension path from the branch down to this child.
    pub extension: ArrayVec<u8, MAX_EXTENSION_LEN>,
    /// Account plain key.
    pub apk: ArrayVec<u8, MAX_ACCOUNT_KEY_LEN>,
    /// Storage plain key.
    pub spk: ArrayVec<u8, MAX_STORAGE_KEY_LEN>,
    /// Keccak256 digest of the child subtree.
    pub hash: ArrayVec<u8, HASH_LEN>,
}

impl Cell {
    pub fn is_empty(&self) -> bool {
        self.extension.is_empty()
            && self.apk.is_empty()
            && self.spk.is_empty()
            && self.hash.is_empty()
    }

    /// Field bits this cell carries on the wire. The extension travels as
    /// `HASHEDKEY_PART` only when no storage plain key is present.
    pub fn field_bits(&self) -> PartFlags {
        let mut field_bits = 0;
        if !self.extension.is_empty() && self.spk.is_empty() {
            field_bits |= HASHEDKEY_PART;
        }
        if !self.apk.is_empty() {
            field_bits |= ACCOUNT_PLAIN_PART;
        }
        if !self.spk.is_empty() {
            field_bits |= STORAGE_PLAIN_PART;
        }
        if !self.hash.is_empty() {
            field_bits |= HASH_PART;
        }
        field_bits
    }

    /// Serialises this single cell in wire field order. Size probe for
    /// statistics; branch payloads are produced by the encoder instead.
    pub fn encode(&self) -> Vec<u8> {
        let field_bits = self.field_bits();
        let mut out = Vec::with_capacity(
            1 + self.extension.len() + self.apk.len() + self.spk.len() + self.hash.len() + 4,
        );
        out.push(field_bits);
        if field_bits & HASHEDKEY_PART != 0 {
            encode_slice(&mut out, &self.extension);
        }
        if field_bits & ACCOUNT_PLAIN_PART != 0 {
            encode_slice(&mut out, &self.apk);
        }
        if field_bits & STORAGE_PLAIN_PART != 0 {
            encode_slice(&mut out, &self.spk);
        }
        if field_bits & HASH_PART != 0 {
            encode_slice(&mut out, &self.hash);
        }
        out
    }

    /// Consumes exactly the bytes described by `field_bits` starting at `pos`
    /// and populates the corresponding fields, clearing the absent ones.
    /// Returns the position one past the consumed bytes.
    pub fn fill_from_fields(
        &mut self,
        data: &[u8],
        mut pos: usize,
        field_bits: PartFlags,
    ) -> Result<usize> {
        fn take<'a>(
            data: &'a [u8],
            pos: usize,
            field: &'static str,
            max: usize,
        ) -> Result<(&'a [u8], usize)> {
            let (l, n) = uvarint(&data[pos..]).ok_or(DecodeError::Overflow(field))?;
            if n == 0 {
                return Err(DecodeError::BadVarint(field).into());
            }
            let l = l as usize;
            let pos = pos + n;
            if l > max {
                return Err(DecodeError::FieldTooLong {
                    field,
                    len: l,
                    max,
                }
                .into());
            }
            if data.len() < pos + l {
                return Err(DecodeError::Truncated(field).into());
            }
            Ok((&data[pos..pos + l], pos + l))
        }

        if field_bits & HASHEDKEY_PART != 0 {
            let (v, next) = take(data, pos, "hashedKey", MAX_EXTENSION_LEN)?;
            self.extension.clear();
            self.extension.try_extend_from_slice(v).unwrap();
            pos = next;
        } else {
            self.extension.clear();
        }
        if field_bits & ACCOUNT_PLAIN_PART != 0 {
            let (v, next) = take(data, pos, "accountPlainKey", MAX_ACCOUNT_KEY_LEN)?;
            self.apk.clear();
            self.apk.try_extend_from_slice(v).unwrap();
            pos = next;
        } else {
            self.apk.clear();
        }
        if field_bits & STORAGE_PLAIN_PART != 0 {
            let (v, next) = take(data, pos, "storagePlainKey", MAX_STORAGE_KEY_LEN)?;
            self.spk.clear();
            self.spk.try_extend_from_slice(v).unwrap();
            pos = next;
        } else {
            self.spk.clear();
        }
        if field_bits & HASH_PART != 0 {
            let (v, next) = take(data, pos, "hash", HASH_LEN)?;
            self.hash.clear();
            self.hash.try_extend_from_slice(v).unwrap();
            pos = next;
        } else {
            self.hash.clear();
        }

        Ok(pos)
    }
}
