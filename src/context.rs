use crate::{branch::BranchData, cell::Cell};
use anyhow::Result;
use std::{fmt, path::PathBuf};

/// Storage collaborator of the branch subsystem.
///
/// `step` is an opaque monotonic version number the surrounding store attaches
/// to each persisted branch; it is propagated here but never interpreted.
pub trait PatriciaContext {
    /// Loads the persisted branch for `prefix` together with its step.
    /// Missing prefixes yield `Ok(None)`.
    fn get_branch(&mut self, prefix: &[u8]) -> Result<Option<(BranchData, u64)>>;

    /// Fills the account fields of `cell` for the given plain key.
    fn get_account(&mut self, plain_key: &[u8], cell: &mut Cell) -> Result<()>;

    /// Fills the storage fields of `cell` for the given plain key.
    fn get_storage(&mut self, plain_key: &[u8], cell: &mut Cell) -> Result<()>;

    /// Persists a branch along with the prior snapshot for audit.
    fn put_branch(
        &mut self,
        prefix: &[u8],
        data: &[u8],
        prev_data: &[u8],
        prev_step: u64,
    ) -> Result<()>;

    /// Directory for collector spill files.
    fn temp_dir(&self) -> PathBuf;
}

/// Canonical collector load function: reads the previously committed value for
/// the prefix and writes the update back next to it. Merging the update with
/// the prior branch is the storage layer's job, not the collector's.
pub fn load_into_context<C: PatriciaContext>(
    ctx: &mut C,
) -> impl FnMut(&[u8], &[u8]) -> Result<()> + '_ {
    move |prefix, update| {
        let (prev, prev_step) = match ctx.get_branch(prefix)? {
            Some((data, step)) => (data, step),
            None => (BranchData::default(), 0),
        };
        ctx.put_branch(prefix, update, &prev, prev_step)?;
        crate::count_branch_update();
        Ok(())
    }
}

/// Commitment trie flavour. Both variants share the branch encoding; the
/// binary variant operates on single-bit nibbles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TrieVariant {
    #[default]
    Hex,
    Bin,
}

impl TrieVariant {
    /// Parses a human-readable tag; unknown tags fall back to the hexary
    /// variant.
    pub fn parse(s: &str) -> Self {
        match s {
            "bin" => Self::Bin,
            _ => Self::Hex,
        }
    }
}

impl fmt::Display for TrieVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hex => "hex-patricia-hashed",
            Self::Bin => "bin-patricia-hashed",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        branch::BranchEncoder,
        collector::TransformArgs,
        test_util::generate_cell_row,
    };
    use std::collections::HashMap;

    #[derive(Debug, Default)]
    struct MockContext {
        branches: HashMap<Vec<u8>, (Vec<u8>, u64)>,
        audit: Vec<(Vec<u8>, Vec<u8>, Vec<u8>, u64)>,
        tmpdir: PathBuf,
    }

    impl PatriciaContext for MockContext {
        fn get_branch(&mut self, prefix: &[u8]) -> Result<Option<(BranchData, u64)>> {
            Ok(self
                .branches
                .get(prefix)
                .map(|(data, step)| (BranchData::from(data.clone()), *step)))
        }

        fn get_account(&mut self, _plain_key: &[u8], _cell: &mut Cell) -> Result<()> {
            Ok(())
        }

        fn get_storage(&mut self, _plain_key: &[u8], _cell: &mut Cell) -> Result<()> {
            Ok(())
        }

        fn put_branch(
            &mut self,
            prefix: &[u8],
            data: &[u8],
            prev_data: &[u8],
            prev_step: u64,
        ) -> Result<()> {
            self.audit
                .push((prefix.to_vec(), data.to_vec(), prev_data.to_vec(), prev_step));
            self.branches
                .insert(prefix.to_vec(), (data.to_vec(), prev_step + 1));
            Ok(())
        }

        fn temp_dir(&self) -> PathBuf {
            self.tmpdir.clone()
        }
    }

    #[test]
    fn loader_carries_prior_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = MockContext {
            tmpdir: dir.path().into(),
            ..Default::default()
        };
        ctx.branches
            .insert(b"ab".to_vec(), (vec![0x01, 0x02, 0x03, 0x04], 7));

        let (mut row, bm) = generate_cell_row(4);
        let mut be = BranchEncoder::new(1024, ctx.temp_dir());
        be.collect_update(b"ab", bm, bm, bm, &mut row).unwrap();
        be.collect_update(b"cd", bm, bm, bm, &mut row).unwrap();

        be.load(load_into_context(&mut ctx), TransformArgs::default())
            .unwrap();

        assert_eq!(ctx.audit.len(), 2);
        // delivered in prefix order with the prior value and step attached
        let (prefix, update, prev, prev_step) = &ctx.audit[0];
        assert_eq!(prefix, b"ab");
        assert_eq!(prev, &vec![0x01, 0x02, 0x03, 0x04]);
        assert_eq!(*prev_step, 7);
        assert_eq!(&ctx.branches[b"ab".as_slice()].0, update);

        let (prefix, _, prev, prev_step) = &ctx.audit[1];
        assert_eq!(prefix, b"cd");
        assert!(prev.is_empty());
        assert_eq!(*prev_step, 0);
    }

    #[test]
    fn variant_tags() {
        assert_eq!(TrieVariant::parse("hex"), TrieVariant::Hex);
        assert_eq!(TrieVariant::parse("bin"), TrieVariant::Bin);
        assert_eq!(TrieVariant::parse("unknown"), TrieVariant::Hex);
        assert_eq!(TrieVariant::Hex.to_string(), "hex-patricia-hashed");
        assert_eq!(TrieVariant::Bin.to_string(), "bin-patricia-hashed");
    }
}
