//! The storage engine collaborator.
//!
//! The worker process is the only place an engine handle lives; iterators
//! and range sessions cannot cross a process boundary, so they stay here
//! behind the [`Engine`] trait and are addressed over the wire by cursor
//! ids. [`MemEngine`] is the reference implementation backing the tests
//! and the standalone worker binary.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use crate::errors::{IpcError, Result};

/// Fixed size of a forward-scan batch segment.
pub const READ_BATCH_SIZE: usize = 80 * 1024;

/// Engine configuration passed through the wire unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineOptions {
    pub create_if_missing: bool,
    pub read_only: bool,
    pub cache_capacity: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            create_if_missing: true,
            read_only: false,
            cache_capacity: 8 * 1024 * 1024,
        }
    }
}

/// Record layout selection for engines that support both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageLayout {
    Row,
    Column { attr_count: i32 },
}

impl Default for StorageLayout {
    fn default() -> Self {
        StorageLayout::Row
    }
}

/// Bounds and sizing for a range-query session.
///
/// Empty `start` means the beginning of the keyspace, empty `limit` means
/// no upper bound; a non-empty `limit` is exclusive. Bounds are owned
/// copies: the request arena they arrive in is recycled as soon as the
/// worker drains it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeOptions {
    pub start: Vec<u8>,
    pub limit: Vec<u8>,
    pub batch_capacity: u64,
    pub attrs: Vec<i32>,
}

/// Result of filling one scan batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchRead {
    pub has_more: bool,
    pub size: u64,
}

/// The operations the worker dispatch loop needs from a storage engine.
///
/// `put`, `get` and `delete` keep their natural error channel (`bool`,
/// `Option`); only `open` can fail in a way worth describing.
pub trait Engine: Sized + Send {
    type Cursor: Send;
    type Range: Send;

    fn open(path: &Path, opts: &EngineOptions, layout: StorageLayout) -> Result<Self>;

    fn count(&self) -> u64;

    fn put(&mut self, key: &[u8], val: &[u8]) -> bool;

    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn delete(&mut self, key: &[u8]) -> bool;

    /// A fresh forward-scan cursor positioned before the first record.
    fn cursor(&self) -> Self::Cursor;

    /// Fill `buf` with framed records starting at the cursor position.
    /// The cursor advances past every record written.
    fn batch_read(&self, cursor: &mut Self::Cursor, buf: &mut [u8]) -> BatchRead;

    /// A range session over `opts`; driven by repeated `range_read` calls.
    fn range(&self, opts: RangeOptions) -> Self::Range;

    /// Produce the next batch of at most `batch_capacity` bytes. Returns
    /// whether more data remains and the serialized batch, sized exactly.
    fn range_read(&self, range: &mut Self::Range) -> (bool, Vec<u8>);
}

/// Frame one record as `key_len || key || val_len || val`.
fn push_record(out: &mut Vec<u8>, key: &[u8], val: &[u8]) {
    out.extend_from_slice(&(key.len() as u64).to_ne_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(&(val.len() as u64).to_ne_bytes());
    out.extend_from_slice(val);
}

fn record_len(key: &[u8], val: &[u8]) -> usize {
    8 + key.len() + 8 + val.len()
}

/// Decode a batch produced by [`Engine::batch_read`] or
/// [`Engine::range_read`] back into records. The client-side counterpart
/// of [`push_record`].
pub fn decode_batch(buf: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut reader = crate::message::EntityReader::new(buf);
    let mut records = Vec::new();
    while reader.remaining() > 0 {
        let key_len = reader.pop_u64()? as usize;
        let key = reader.pop(key_len)?.to_vec();
        let val_len = reader.pop_u64()? as usize;
        let val = reader.pop(val_len)?.to_vec();
        records.push((key, val));
    }
    Ok(records)
}

/// An ordered in-memory engine.
///
/// Keys live in a `BTreeMap`, so enumeration order is lexicographic byte
/// order. The `path` only identifies the instance; nothing is persisted.
pub struct MemEngine {
    path: PathBuf,
    layout: StorageLayout,
    records: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// Forward-scan position: the last key handed out, if any. Resuming from
/// a key instead of holding a map iterator keeps the cursor valid across
/// interleaved writes.
pub struct MemCursor {
    last: Option<Vec<u8>>,
}

pub struct MemRange {
    next: Option<Vec<u8>>,
    limit: Vec<u8>,
    batch_capacity: u64,
    done: bool,
}

impl MemEngine {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> StorageLayout {
        self.layout
    }

    fn scan_from<'a>(
        &'a self,
        last: &Option<Vec<u8>>,
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> {
        let lower = match last {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        self.records.range((lower, Bound::Unbounded))
    }
}

impl Engine for MemEngine {
    type Cursor = MemCursor;
    type Range = MemRange;

    fn open(path: &Path, opts: &EngineOptions, layout: StorageLayout) -> Result<Self> {
        if !opts.create_if_missing {
            return Err(IpcError::Engine(format!(
                "no existing store at {} and create_if_missing is off",
                path.display()
            )));
        }
        if let StorageLayout::Column { attr_count } = layout {
            if attr_count <= 0 {
                return Err(IpcError::Engine(format!(
                    "column layout needs a positive attribute count, got {}",
                    attr_count
                )));
            }
        }
        Ok(MemEngine {
            path: path.to_owned(),
            layout,
            records: BTreeMap::new(),
        })
    }

    fn count(&self) -> u64 {
        self.records.len() as u64
    }

    fn put(&mut self, key: &[u8], val: &[u8]) -> bool {
        if key.is_empty() {
            return false;
        }
        self.records.insert(key.to_vec(), val.to_vec());
        true
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.records.get(key).cloned()
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        self.records.remove(key).is_some()
    }

    fn cursor(&self) -> MemCursor {
        MemCursor { last: None }
    }

    fn batch_read(&self, cursor: &mut MemCursor, buf: &mut [u8]) -> BatchRead {
        let mut size = 0usize;
        let mut it = self.scan_from(&cursor.last).peekable();
        loop {
            let (key, val) = match it.peek() {
                Some(entry) => *entry,
                None => {
                    return BatchRead {
                        has_more: false,
                        size: size as u64,
                    }
                }
            };
            let need = record_len(key, val);
            if need > buf.len() {
                // A record that can never fit a batch segment would wedge
                // the scan; drop it and keep going.
                log::error!(
                    "record of {} bytes exceeds the {} byte batch segment, skipping",
                    need,
                    buf.len()
                );
                cursor.last = Some(key.clone());
                it.next();
                continue;
            }
            if size + need > buf.len() {
                return BatchRead {
                    has_more: true,
                    size: size as u64,
                };
            }
            let mut frame = Vec::with_capacity(need);
            push_record(&mut frame, key, val);
            buf[size..size + need].copy_from_slice(&frame);
            size += need;
            cursor.last = Some(key.clone());
            it.next();
        }
    }

    fn range(&self, opts: RangeOptions) -> MemRange {
        MemRange {
            next: if opts.start.is_empty() {
                None
            } else {
                Some(opts.start)
            },
            limit: opts.limit,
            batch_capacity: opts.batch_capacity.max(1),
            done: false,
        }
    }

    fn range_read(&self, range: &mut MemRange) -> (bool, Vec<u8>) {
        if range.done {
            return (false, Vec::new());
        }
        let lower = match &range.next {
            Some(key) => Bound::Included(key.clone()),
            None => Bound::Unbounded,
        };
        let mut out = Vec::new();
        let mut it = self.records.range((lower, Bound::Unbounded)).peekable();
        loop {
            let (key, val) = match it.peek() {
                Some(entry) => *entry,
                None => {
                    range.done = true;
                    return (false, out);
                }
            };
            if !range.limit.is_empty() && key.as_slice() >= range.limit.as_slice() {
                range.done = true;
                return (false, out);
            }
            let need = record_len(key, val);
            if !out.is_empty() && out.len() + need > range.batch_capacity as usize {
                // Resume from this record on the next call.
                range.next = Some(key.clone());
                return (true, out);
            }
            push_record(&mut out, key, val);
            it.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine_with(pairs: &[(&str, &str)]) -> (MemEngine, TempDir) {
        let dir = tempfile::tempdir().expect("failed to create tempdir for test");
        let mut engine =
            MemEngine::open(dir.path(), &EngineOptions::default(), StorageLayout::Row).unwrap();
        for (k, v) in pairs {
            assert!(engine.put(k.as_bytes(), v.as_bytes()));
        }
        (engine, dir)
    }

    #[test]
    fn put_get_delete_count() {
        let (mut engine, _dir) = engine_with(&[("a", "1")]);
        assert_eq!(engine.count(), 1);
        assert_eq!(engine.get(b"a"), Some(b"1".to_vec()));
        assert!(engine.delete(b"a"));
        assert!(!engine.delete(b"a"));
        assert_eq!(engine.get(b"a"), None);
        assert_eq!(engine.count(), 0);
    }

    #[test]
    fn open_honors_options() {
        let opts = EngineOptions {
            create_if_missing: false,
            ..EngineOptions::default()
        };
        assert!(MemEngine::open(Path::new("/tmp/missing"), &opts, StorageLayout::Row).is_err());
        assert!(MemEngine::open(
            Path::new("/tmp/x"),
            &EngineOptions::default(),
            StorageLayout::Column { attr_count: 0 }
        )
        .is_err());
    }

    #[test]
    fn batch_read_resumes_until_exhausted() {
        let (engine, _dir) = engine_with(&[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")]);
        let mut cursor = engine.cursor();
        // Room for exactly two records of 18 bytes each.
        let mut buf = [0u8; 36];

        let first = engine.batch_read(&mut cursor, &mut buf);
        assert!(first.has_more);
        let records = decode_batch(&buf[..first.size as usize]).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, b"a");

        let second = engine.batch_read(&mut cursor, &mut buf);
        assert!(!second.has_more);
        let records = decode_batch(&buf[..second.size as usize]).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].0, b"d");

        let done = engine.batch_read(&mut cursor, &mut buf);
        assert!(!done.has_more);
        assert_eq!(done.size, 0);
    }

    #[test]
    fn oversized_record_is_skipped() {
        let (mut engine, _dir) = engine_with(&[("a", "1"), ("c", "3")]);
        assert!(engine.put(b"b", &vec![0u8; 128]));
        let mut cursor = engine.cursor();
        let mut buf = [0u8; 40];

        let mut keys = Vec::new();
        loop {
            let read = engine.batch_read(&mut cursor, &mut buf);
            for (k, _) in decode_batch(&buf[..read.size as usize]).unwrap() {
                keys.push(k);
            }
            if !read.has_more {
                break;
            }
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn range_respects_bounds_and_capacity() {
        let (engine, _dir) = engine_with(&[("k1", "1"), ("k2", "2"), ("k3", "3"), ("k4", "4"), ("k5", "5")]);
        let mut range = engine.range(RangeOptions {
            start: b"k1".to_vec(),
            limit: b"k5".to_vec(),
            batch_capacity: 20,
            attrs: Vec::new(),
        });

        let mut keys = Vec::new();
        loop {
            let (more, batch) = engine.range_read(&mut range);
            for (k, _) in decode_batch(&batch).unwrap() {
                keys.push(k);
            }
            if !more {
                break;
            }
        }
        assert_eq!(
            keys,
            vec![b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec(), b"k4".to_vec()]
        );

        // Exhausted sessions keep answering "no more".
        let (more, batch) = engine.range_read(&mut range);
        assert!(!more);
        assert!(batch.is_empty());
    }

    #[test]
    fn unbounded_range_covers_everything() {
        let (engine, _dir) = engine_with(&[("a", "1"), ("b", "2")]);
        let mut range = engine.range(RangeOptions {
            batch_capacity: 1024,
            ..RangeOptions::default()
        });
        let (more, batch) = engine.range_read(&mut range);
        assert!(!more);
        assert_eq!(decode_batch(&batch).unwrap().len(), 2);
    }
}
