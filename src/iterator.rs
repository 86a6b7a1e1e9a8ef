//! Merge machinery for the read path.
//!
//! Every data source (mutable memtable, immutable memtable, each table in
//! the pinned version) yields internal entries in internal-key order. A
//! min-heap merges them; [`DbIterator`] then collapses the merged stream to
//! one visible value per user key at the reader's snapshot, dropping
//! tombstoned keys and versions newer than the snapshot.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::error::Result;
use crate::key::{InternalKey, ValueKind};
use crate::version::Version;

/// A boxed source of internal entries in ascending internal-key order.
pub type EntryIter = Box<dyn Iterator<Item = Result<(InternalKey, Vec<u8>)>> + Send>;

struct HeapEntry {
    key: InternalKey,
    value: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed for min-heap behavior; source index breaks exact ties so
        // newer sources (lower index) drain first
        match self.key.cmp(&other.key) {
            Ordering::Equal => other.source.cmp(&self.source),
            ord => ord.reverse(),
        }
    }
}

/// K-way merge over entry sources. Internal keys are unique across sources
/// (every write owns its sequence), so the merge is a plain ordered union.
pub struct MergingIterator {
    sources: Vec<EntryIter>,
    heap: BinaryHeap<HeapEntry>,
    failed: bool,
}

impl MergingIterator {
    pub fn new(mut sources: Vec<EntryIter>) -> Result<Self> {
        let mut heap = BinaryHeap::new();
        for (source, iter) in sources.iter_mut().enumerate() {
            match iter.next() {
                Some(Ok((key, value))) => heap.push(HeapEntry { key, value, source }),
                Some(Err(e)) => return Err(e),
                None => {}
            }
        }
        Ok(Self {
            sources,
            heap,
            failed: false,
        })
    }
}

impl Iterator for MergingIterator {
    type Item = Result<(InternalKey, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let entry = self.heap.pop()?;
        match self.sources[entry.source].next() {
            Some(Ok((key, value))) => self.heap.push(HeapEntry {
                key,
                value,
                source: entry.source,
            }),
            Some(Err(e)) => {
                self.failed = true;
                return Some(Err(e));
            }
            None => {}
        }
        Some(Ok((entry.key, entry.value)))
    }
}

/// Public forward iterator: user keys ascending, one value each, as of a
/// snapshot. Pins the version it reads so table chunks stay allocated for
/// its whole lifetime.
pub struct DbIterator {
    inner: MergingIterator,
    snapshot_seq: u64,
    last_user_key: Option<Vec<u8>>,
    done: bool,
    _version: Arc<Version>,
}

impl DbIterator {
    pub fn new(sources: Vec<EntryIter>, snapshot_seq: u64, version: Arc<Version>) -> Result<Self> {
        Ok(Self {
            inner: MergingIterator::new(sources)?,
            snapshot_seq,
            last_user_key: None,
            done: false,
            _version: version,
        })
    }
}

impl Iterator for DbIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let (key, value) = match self.inner.next() {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    return None;
                }
            };

            if key.seq > self.snapshot_seq {
                continue;
            }
            if self.last_user_key.as_deref() == Some(key.user_key.as_slice()) {
                // an older version of a key we already decided
                continue;
            }
            self.last_user_key = Some(key.user_key.clone());
            match key.kind {
                ValueKind::Deletion => continue,
                ValueKind::Value => return Some(Ok((key.user_key, value))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    fn src(entries: Vec<(&[u8], u64, ValueKind, &[u8])>) -> EntryIter {
        Box::new(
            entries
                .into_iter()
                .map(|(k, seq, kind, v)| Ok((InternalKey::new(k.to_vec(), seq, kind), v.to_vec())))
                .collect::<Vec<_>>()
                .into_iter(),
        )
    }

    fn empty_version() -> Arc<Version> {
        Arc::new(Version::new(Arc::new(BytewiseComparator), 2 << 20))
    }

    #[test]
    fn test_merge_interleaves_sources() -> Result<()> {
        let a = src(vec![
            (b"a", 5, ValueKind::Value, b"a5"),
            (b"c", 3, ValueKind::Value, b"c3"),
        ]);
        let b = src(vec![(b"b", 4, ValueKind::Value, b"b4")]);

        let merged: Vec<_> = MergingIterator::new(vec![a, b])?.collect::<Result<Vec<_>>>()?;
        let keys: Vec<_> = merged.iter().map(|(k, _)| k.user_key.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_db_iterator_latest_version_wins() -> Result<()> {
        // same user key in two sources at different sequences
        let newer = src(vec![(b"k", 9, ValueKind::Value, b"new")]);
        let older = src(vec![
            (b"k", 4, ValueKind::Value, b"old"),
            (b"z", 2, ValueKind::Value, b"z2"),
        ]);

        let items: Vec<_> = DbIterator::new(vec![newer, older], u64::MAX >> 8, empty_version())?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(
            items,
            vec![
                (b"k".to_vec(), b"new".to_vec()),
                (b"z".to_vec(), b"z2".to_vec()),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_db_iterator_respects_snapshot() -> Result<()> {
        let source = src(vec![
            (b"k", 9, ValueKind::Value, b"new"),
            (b"k", 4, ValueKind::Value, b"old"),
        ]);

        let items: Vec<_> =
            DbIterator::new(vec![source], 5, empty_version())?.collect::<Result<Vec<_>>>()?;
        assert_eq!(items, vec![(b"k".to_vec(), b"old".to_vec())]);
        Ok(())
    }

    #[test]
    fn test_db_iterator_hides_tombstones() -> Result<()> {
        let source = src(vec![
            (b"a", 7, ValueKind::Deletion, b""),
            (b"a", 3, ValueKind::Value, b"shadowed"),
            (b"b", 5, ValueKind::Value, b"kept"),
        ]);

        let items: Vec<_> = DbIterator::new(vec![source], u64::MAX >> 8, empty_version())?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(items, vec![(b"b".to_vec(), b"kept".to_vec())]);
        Ok(())
    }

    #[test]
    fn test_db_iterator_tombstone_older_than_snapshot_is_ignored() -> Result<()> {
        // snapshot predates the delete: the old value is still visible
        let source = src(vec![
            (b"a", 7, ValueKind::Deletion, b""),
            (b"a", 3, ValueKind::Value, b"alive"),
        ]);

        let items: Vec<_> =
            DbIterator::new(vec![source], 4, empty_version())?.collect::<Result<Vec<_>>>()?;
        assert_eq!(items, vec![(b"a".to_vec(), b"alive".to_vec())]);
        Ok(())
    }
}
