use anyhow::{bail, Context, Result};
use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    fs::File,
    io::{self, BufReader, BufWriter, Read, Seek, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::debug;

/// Optimal sort-buffer size of the update pipeline; encoders spill past half
/// of this.
pub const BUFFER_OPTIMAL_SIZE: usize = 256 * 1024 * 1024;

/// Arguments for [`Collector::load`].
#[derive(Clone, Debug, Default)]
pub struct TransformArgs {
    /// Cooperative cancellation flag, checked once per delivered pair.
    pub quit: Option<Arc<AtomicBool>>,
}

impl TransformArgs {
    fn cancelled(&self) -> bool {
        self.quit
            .as_ref()
            .map_or(false, |quit| quit.load(Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct Entry {
    key: Vec<u8>,
    value: Vec<u8>,
}

enum Run {
    Disk(BufReader<File>),
    Mem(std::vec::IntoIter<Entry>),
}

impl Run {
    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self {
            Run::Disk(reader) => read_entry(reader),
            Run::Mem(iter) => Ok(iter.next().map(|e| (e.key, e.value))),
        }
    }
}

/// Accepts `(prefix, value)` pairs during a batch without holding them all in
/// memory: past the buffer threshold the sorted buffer is written out as one
/// run, and [`Collector::load`] merges the runs back in key order.
///
/// Duplicate keys keep the earliest collected value. After a load the
/// collector is empty and ready for the next batch.
#[derive(Debug)]
pub struct Collector {
    tmpdir: PathBuf,
    buffer: Vec<Entry>,
    buffer_bytes: usize,
    buffer_capacity: usize,
    spilled: Vec<File>,
}

impl Collector {
    pub fn new(tmpdir: impl Into<PathBuf>, buffer_capacity: usize) -> Self {
        Self {
            tmpdir: tmpdir.into(),
            buffer: vec![],
            buffer_bytes: 0,
            buffer_capacity,
            spilled: vec![],
        }
    }

    pub fn collect(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.buffer_bytes += key.len() + value.len();
        self.buffer.push(Entry {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        if self.buffer_bytes > self.buffer_capacity {
            self.spill().context("failed to spill collector buffer")?;
        }
        Ok(())
    }

    /// Writes the buffer out as one sorted run. The sort is stable, so
    /// duplicates inside a run stay in arrival order.
    fn spill(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.buffer.sort_by(|a, b| a.key.cmp(&b.key));

        let mut file = tempfile::tempfile_in(&self.tmpdir)
            .with_context(|| format!("cannot create spill file in {}", self.tmpdir.display()))?;
        let mut writer = BufWriter::new(&mut file);
        for entry in &self.buffer {
            write_entry(&mut writer, &entry.key, &entry.value)?;
        }
        writer.flush()?;
        drop(writer);

        debug!(
            entries = self.buffer.len(),
            bytes = self.buffer_bytes,
            run = self.spilled.len(),
            "spilled collector buffer"
        );
        self.buffer.clear();
        self.buffer_bytes = 0;
        self.spilled.push(file);
        Ok(())
    }

    /// Delivers every collected pair to `load_fn` in key order, oldest value
    /// winning among duplicates, then resets for a new batch. Honours
    /// `args.quit` by aborting between deliveries.
    pub fn load(
        &mut self,
        mut load_fn: impl FnMut(&[u8], &[u8]) -> Result<()>,
        args: TransformArgs,
    ) -> Result<()> {
        let mut buffer = std::mem::take(&mut self.buffer);
        self.buffer_bytes = 0;
        buffer.sort_by(|a, b| a.key.cmp(&b.key));

        let mut runs = vec![];
        for mut file in std::mem::take(&mut self.spilled) {
            file.rewind()?;
            runs.push(Run::Disk(BufReader::new(file)));
        }
        // the in-memory tail is the newest run, so it loses ties
        runs.push(Run::Mem(buffer.into_iter()));
        debug!(runs = runs.len(), "loading collected updates");

        let mut heap = BinaryHeap::new();
        for (i, run) in runs.iter_mut().enumerate() {
            if let Some((key, value)) = run.next_entry()? {
                heap.push(Reverse((key, i, value)));
            }
        }

        let mut last_key: Option<Vec<u8>> = None;
        while let Some(Reverse((key, src, value))) = heap.pop() {
            if let Some((next_key, next_value)) = runs[src].next_entry()? {
                heap.push(Reverse((next_key, src, next_value)));
            }
            if args.cancelled() {
                bail!("collector load interrupted");
            }
            if last_key.as_deref() == Some(&key[..]) {
                // a newer duplicate; the oldest value was already delivered
                continue;
            }
            load_fn(&key, &value)?;
            last_key = Some(key);
        }
        Ok(())
    }
}

fn write_entry(writer: &mut impl Write, key: &[u8], value: &[u8]) -> io::Result<()> {
    write_uvarint(writer, key.len() as u64)?;
    writer.write_all(key)?;
    write_uvarint(writer, value.len() as u64)?;
    writer.write_all(value)
}

fn read_entry(reader: &mut impl Read) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let Some(key_len) = read_uvarint(reader)? else {
        return Ok(None);
    };
    let mut key = vec![0; key_len as usize];
    reader.read_exact(&mut key)?;
    let value_len = read_uvarint(reader)?.context("spill run truncated")?;
    let mut value = vec![0; value_len as usize];
    reader.read_exact(&mut value)?;
    Ok(Some((key, value)))
}

fn write_uvarint(writer: &mut impl Write, mut x: u64) -> io::Result<()> {
    while x >= 0x80 {
        writer.write_all(&[x as u8 | 0x80])?;
        x >>= 7;
    }
    writer.write_all(&[x as u8])
}

/// `Ok(None)` on clean end of run, an error on a run cut mid-entry.
fn read_uvarint(reader: &mut impl Read) -> Result<Option<u64>> {
    let mut x = 0_u64;
    let mut s = 0_u32;
    let mut first = true;
    loop {
        let mut byte = [0_u8; 1];
        match reader.read_exact(&mut byte) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && first => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        first = false;
        let b = byte[0];
        if b < 0x80 {
            if s >= 64 {
                bail!("spill run length overflow");
            }
            return Ok(Some(x | (b as u64) << s));
        }
        x |= ((b & 0x7f) as u64) << s;
        s += 7;
        if s >= 64 {
            bail!("spill run length overflow");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::{prelude::*, EnvFilter};

    fn init_tracing() {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(EnvFilter::from_default_env())
            .try_init();
    }

    fn drain(collector: &mut Collector) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = vec![];
        collector
            .load(
                |k, v| {
                    out.push((k.to_vec(), v.to_vec()));
                    Ok(())
                },
                TransformArgs::default(),
            )
            .unwrap();
        out
    }

    #[test]
    fn delivers_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = Collector::new(dir.path(), BUFFER_OPTIMAL_SIZE);

        for key in [b"0b".as_slice(), b"02", b"ff", b"a0"] {
            collector.collect(key, b"v").unwrap();
        }
        let out = drain(&mut collector);
        let keys: Vec<_> = out.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"02".to_vec(), b"0b".to_vec(), b"a0".to_vec(), b"ff".to_vec()]);
    }

    #[test]
    fn spills_and_merges_runs() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        // tiny threshold: nearly every collect spills a run
        let mut collector = Collector::new(dir.path(), 64);

        let mut expected = vec![];
        for i in (0..200_u32).rev() {
            let key = i.to_be_bytes().to_vec();
            let value = vec![i as u8; 16];
            collector.collect(&key, &value).unwrap();
            expected.push((key, value));
        }
        expected.sort();

        let out = drain(&mut collector);
        assert_eq!(out, expected);
    }

    #[test]
    fn duplicate_keys_keep_oldest_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = Collector::new(dir.path(), BUFFER_OPTIMAL_SIZE);
        collector.collect(b"k", b"oldest").unwrap();
        collector.collect(b"k", b"newer").unwrap();

        let out = drain(&mut collector);
        assert_eq!(out, vec![(b"k".to_vec(), b"oldest".to_vec())]);
    }

    #[test]
    fn duplicate_keys_keep_oldest_across_spill() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = Collector::new(dir.path(), 8);
        collector.collect(b"k", b"oldest value").unwrap(); // exceeds threshold, spills
        collector.collect(b"k", b"newer value!").unwrap();

        let out = drain(&mut collector);
        assert_eq!(out, vec![(b"k".to_vec(), b"oldest value".to_vec())]);
    }

    #[test]
    fn cancellation_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = Collector::new(dir.path(), BUFFER_OPTIMAL_SIZE);
        collector.collect(b"a", b"1").unwrap();
        collector.collect(b"b", b"2").unwrap();

        let quit = Arc::new(AtomicBool::new(true));
        let err = collector
            .load(
                |_, _| panic!("must not deliver after cancellation"),
                TransformArgs { quit: Some(quit) },
            )
            .unwrap_err();
        assert!(err.to_string().contains("interrupted"));
    }

    #[test]
    fn resets_after_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = Collector::new(dir.path(), 32);
        for i in 0..10_u8 {
            collector.collect(&[i], b"first batch").unwrap();
        }
        assert_eq!(drain(&mut collector).len(), 10);

        collector.collect(b"z", b"second batch").unwrap();
        let out = drain(&mut collector);
        assert_eq!(out, vec![(b"z".to_vec(), b"second batch".to_vec())]);
    }
}
