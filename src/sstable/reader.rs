use std::io::Cursor;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt};

use crate::chunk::{ChunkHandle, ChunkStore};
use crate::error::{Error, Result};
use crate::filter::FilterPolicy;
use crate::key::{InternalKey, LookupKey, ValueKind};
use crate::sstable::block::{Block, BlockIterator};

/// Read handle over one table's chunk regions. The index and filter are
/// parsed once at open; data blocks are fetched per lookup.
pub struct Table {
    store: Arc<dyn ChunkStore>,
    data: ChunkHandle,
    // (first key, offset, len) per data block
    index: Vec<(InternalKey, u64, u64)>,
    // (policy name, serialized filter)
    filter: Option<(String, Vec<u8>)>,
    filter_policy: Option<Arc<dyn FilterPolicy>>,
}

impl Table {
    pub fn open(
        store: Arc<dyn ChunkStore>,
        data: ChunkHandle,
        index_handle: &ChunkHandle,
        filter_handle: Option<&ChunkHandle>,
        filter_policy: Option<Arc<dyn FilterPolicy>>,
    ) -> Result<Self> {
        let raw_index = store.read(index_handle, 0, index_handle.len)?;
        let mut cursor = Cursor::new(raw_index.as_slice());
        let count = cursor.read_u32::<BigEndian>()? as usize;
        let mut index = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = cursor.read_u32::<BigEndian>()? as usize;
            let start = cursor.position() as usize;
            if start + key_len > raw_index.len() {
                return Err(crate::corruption!("index entry overruns region"));
            }
            let key = InternalKey::decode(&raw_index[start..start + key_len])?;
            cursor.set_position((start + key_len) as u64);
            let offset = cursor.read_u64::<BigEndian>()?;
            let len = cursor.read_u64::<BigEndian>()?;
            index.push((key, offset, len));
        }

        let filter = match filter_handle {
            Some(handle) => {
                let raw = store.read(handle, 0, handle.len)?;
                let mut cursor = Cursor::new(raw.as_slice());
                let name_len = cursor.read_u32::<BigEndian>()? as usize;
                if 4 + name_len > raw.len() {
                    return Err(crate::corruption!("filter region overrun"));
                }
                let name = String::from_utf8_lossy(&raw[4..4 + name_len]).into_owned();
                Some((name, raw[4 + name_len..].to_vec()))
            }
            None => None,
        };

        Ok(Self {
            store,
            data,
            index,
            filter,
            filter_policy,
        })
    }

    /// Lookup in this table. `Ok(None)` means the key is not here;
    /// `Ok(Some(Err(NotFound)))` means a tombstone shadows it here.
    pub fn get(
        &self,
        lookup: &LookupKey,
        verify_checksums: bool,
    ) -> Result<Option<Result<Vec<u8>>>> {
        if let (Some((name, filter)), Some(policy)) = (&self.filter, &self.filter_policy) {
            if policy.name() == name && !policy.key_may_match(&lookup.user_key, filter) {
                return Ok(None);
            }
        }
        if self.index.is_empty() {
            return Ok(None);
        }

        let target = lookup.seek_key();
        let mut idx = self.find_block(&target);
        let mut needs_seek = true;
        while idx < self.index.len() {
            let mut block = self.block(idx, verify_checksums)?;
            if needs_seek {
                block.seek(&target)?;
                needs_seek = false;
            }
            match block.next() {
                Some(entry) => {
                    let (key, value) = entry?;
                    if key.user_key != lookup.user_key {
                        return Ok(None);
                    }
                    return Ok(Some(match key.kind {
                        ValueKind::Value => Ok(value),
                        ValueKind::Deletion => Err(Error::NotFound),
                    }));
                }
                // seek landed past this block's last entry; the successor
                // is the next block's first entry
                None => idx += 1,
            }
        }
        Ok(None)
    }

    fn block(&self, idx: usize, verify_checksums: bool) -> Result<BlockIterator> {
        let (_, offset, len) = &self.index[idx];
        let raw = self.store.read(&self.data, *offset, *len)?;
        Ok(Block::parse(&raw, verify_checksums)?.iter())
    }

    /// Index slot of the last block whose first key is <= `target`; 0 when
    /// the target precedes every block.
    fn find_block(&self, target: &InternalKey) -> usize {
        let mut low = 0usize;
        let mut high = self.index.len();
        while low < high {
            let mid = (low + high) / 2;
            if &self.index[mid].0 <= target {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low.saturating_sub(1)
    }

    pub fn num_blocks(&self) -> usize {
        self.index.len()
    }
}

/// Streams a table's entries in internal-key order across block boundaries.
pub struct TableIterator {
    table: Arc<Table>,
    verify_checksums: bool,
    next_block: usize,
    current: Option<BlockIterator>,
    done: bool,
}

impl TableIterator {
    pub fn new(table: Arc<Table>, verify_checksums: bool) -> Self {
        Self {
            table,
            verify_checksums,
            next_block: 0,
            current: None,
            done: false,
        }
    }

    /// Position at the first entry with key >= `target`.
    pub fn seek(&mut self, target: &InternalKey) -> Result<()> {
        if self.table.index.is_empty() {
            self.done = true;
            return Ok(());
        }
        let idx = self.table.find_block(target);
        let mut block = self.table.block(idx, self.verify_checksums)?;
        block.seek(target)?;
        self.current = Some(block);
        self.next_block = idx + 1;
        self.done = false;
        Ok(())
    }
}

impl Iterator for TableIterator {
    type Item = Result<(InternalKey, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(block) = &mut self.current {
                match block.next() {
                    Some(Ok(entry)) => return Some(Ok(entry)),
                    Some(Err(e)) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                    None => self.current = None,
                }
            }
            if self.next_block >= self.table.index.len() {
                self.done = true;
                return None;
            }
            match self.table.block(self.next_block, self.verify_checksums) {
                Ok(block) => {
                    self.current = Some(block);
                    self.next_block += 1;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::HeapChunkStore;
    use crate::filter::BloomFilterPolicy;
    use crate::sstable::builder::TableBuilder;

    fn build_table(
        store: &Arc<HeapChunkStore>,
        block_size: usize,
        policy: Option<Arc<dyn FilterPolicy>>,
        entries: &[(InternalKey, Vec<u8>)],
    ) -> Table {
        let mut builder = TableBuilder::new(block_size, policy.clone());
        for (key, value) in entries {
            builder.add(key, value);
        }
        let output = builder
            .finish(store.as_ref())
            .expect("finish")
            .expect("non-empty");
        let chunk_store: Arc<dyn ChunkStore> = Arc::clone(store) as Arc<dyn ChunkStore>;
        Table::open(
            chunk_store,
            output.data,
            &output.index,
            output.filter.as_ref(),
            policy,
        )
        .expect("open table")
    }

    fn sample_entries(n: u64) -> Vec<(InternalKey, Vec<u8>)> {
        (0..n)
            .map(|i| {
                (
                    InternalKey::new(format!("key-{i:04}").into_bytes(), n - i, ValueKind::Value),
                    format!("value-{i}").into_bytes(),
                )
            })
            .collect()
    }

    #[test]
    fn test_get_across_blocks() -> Result<()> {
        let store = Arc::new(HeapChunkStore::new(0));
        let entries = sample_entries(300);
        // tiny blocks force a multi-block table
        let table = build_table(&store, 128, None, &entries);
        assert!(table.num_blocks() > 1);

        for (key, value) in &entries {
            let lookup = LookupKey::new(key.user_key.clone(), u64::MAX >> 8);
            let found = table.get(&lookup, true)?.expect("present");
            assert_eq!(found, Ok(value.clone()));
        }
        assert!(table
            .get(&LookupKey::new(b"missing".to_vec(), u64::MAX >> 8), true)?
            .is_none());
        Ok(())
    }

    #[test]
    fn test_tombstone_surfaces_as_deleted() -> Result<()> {
        let store = Arc::new(HeapChunkStore::new(0));
        let entries = vec![
            (
                InternalKey::new(b"gone".to_vec(), 9, ValueKind::Deletion),
                Vec::new(),
            ),
            (
                InternalKey::new(b"gone".to_vec(), 4, ValueKind::Value),
                b"old".to_vec(),
            ),
            (
                InternalKey::new(b"kept".to_vec(), 5, ValueKind::Value),
                b"v".to_vec(),
            ),
        ];
        let table = build_table(&store, 4096, None, &entries);

        assert_eq!(
            table.get(&LookupKey::new(b"gone".to_vec(), 10), true)?,
            Some(Err(Error::NotFound))
        );
        // a snapshot below the tombstone still sees the old value
        assert_eq!(
            table.get(&LookupKey::new(b"gone".to_vec(), 4), true)?,
            Some(Ok(b"old".to_vec()))
        );
        assert_eq!(
            table.get(&LookupKey::new(b"kept".to_vec(), 10), true)?,
            Some(Ok(b"v".to_vec()))
        );
        Ok(())
    }

    #[test]
    fn test_filter_short_circuits_absent_keys() -> Result<()> {
        let store = Arc::new(HeapChunkStore::new(0));
        let policy: Arc<dyn FilterPolicy> = Arc::new(BloomFilterPolicy::default());
        let entries = sample_entries(100);
        let table = build_table(&store, 1024, Some(policy), &entries);

        for (key, _) in &entries {
            assert!(table
                .get(&LookupKey::new(key.user_key.clone(), u64::MAX >> 8), true)?
                .is_some());
        }
        assert!(table
            .get(&LookupKey::new(b"definitely-absent".to_vec(), 1000), true)?
            .is_none());
        Ok(())
    }

    #[test]
    fn test_iterator_full_scan_in_order() -> Result<()> {
        let store = Arc::new(HeapChunkStore::new(0));
        let entries = sample_entries(200);
        let table = Arc::new(build_table(&store, 128, None, &entries));

        let scanned: Vec<_> = TableIterator::new(Arc::clone(&table), true)
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(scanned.len(), entries.len());
        for (got, want) in scanned.iter().zip(&entries) {
            assert_eq!(got, want);
        }
        Ok(())
    }

    #[test]
    fn test_iterator_seek_mid_table() -> Result<()> {
        let store = Arc::new(HeapChunkStore::new(0));
        let entries = sample_entries(200);
        let table = Arc::new(build_table(&store, 128, None, &entries));

        let mut iter = TableIterator::new(Arc::clone(&table), true);
        iter.seek(&entries[150].0)?;
        let rest: Vec<_> = iter.collect::<Result<Vec<_>>>()?;
        assert_eq!(rest.len(), 50);
        assert_eq!(rest[0], entries[150]);
        Ok(())
    }

    #[test]
    fn test_snapshot_seek_within_versions() -> Result<()> {
        let store = Arc::new(HeapChunkStore::new(0));
        let entries = vec![
            (
                InternalKey::new(b"k".to_vec(), 9, ValueKind::Value),
                b"new".to_vec(),
            ),
            (
                InternalKey::new(b"k".to_vec(), 4, ValueKind::Value),
                b"old".to_vec(),
            ),
        ];
        let table = build_table(&store, 4096, None, &entries);

        assert_eq!(
            table.get(&LookupKey::new(b"k".to_vec(), 6), true)?,
            Some(Ok(b"old".to_vec()))
        );
        assert_eq!(
            table.get(&LookupKey::new(b"k".to_vec(), 9), true)?,
            Some(Ok(b"new".to_vec()))
        );
        assert_eq!(table.get(&LookupKey::new(b"k".to_vec(), 3), true)?, None);
        Ok(())
    }
}
