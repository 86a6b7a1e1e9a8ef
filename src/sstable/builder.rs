use std::sync::Arc;

use byteorder::{BigEndian, WriteBytesExt};

use crate::chunk::{ChunkHandle, ChunkStore};
use crate::error::Result;
use crate::filter::FilterPolicy;
use crate::key::InternalKey;
use crate::sstable::block::BlockBuilder;

/// Result of serializing one table into the chunk store.
#[derive(Debug)]
pub struct TableOutput {
    pub data: ChunkHandle,
    pub index: ChunkHandle,
    pub filter: Option<ChunkHandle>,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    pub num_entries: u64,
    /// Total bytes across all regions.
    pub file_size: u64,
}

/// Serializes an ordered entry stream into the three table regions.
/// Entries must arrive in strictly ascending internal-key order.
pub struct TableBuilder {
    block_size: usize,
    filter_policy: Option<Arc<dyn FilterPolicy>>,

    data: Vec<u8>,
    current: BlockBuilder,
    // (first key of block, offset, len) pending for the index region
    index_entries: Vec<(InternalKey, u64, u64)>,
    pending_first_key: Option<InternalKey>,

    user_keys: Vec<Vec<u8>>,
    smallest: Option<InternalKey>,
    largest: Option<InternalKey>,
    num_entries: u64,
}

impl TableBuilder {
    pub fn new(block_size: usize, filter_policy: Option<Arc<dyn FilterPolicy>>) -> Self {
        Self {
            block_size,
            filter_policy,
            data: Vec::new(),
            current: BlockBuilder::new(),
            index_entries: Vec::new(),
            pending_first_key: None,
            user_keys: Vec::new(),
            smallest: None,
            largest: None,
            num_entries: 0,
        }
    }

    pub fn add(&mut self, key: &InternalKey, value: &[u8]) {
        debug_assert!(
            self.largest.as_ref().map_or(true, |last| last < key),
            "keys must be added in ascending order"
        );
        if self.pending_first_key.is_none() {
            self.pending_first_key = Some(key.clone());
        }
        if self.smallest.is_none() {
            self.smallest = Some(key.clone());
        }
        self.largest = Some(key.clone());

        self.current.add(key, value);
        self.num_entries += 1;
        if self.filter_policy.is_some() {
            self.user_keys.push(key.user_key.clone());
        }

        if self.current.size_estimate() >= self.block_size {
            self.cut_block();
        }
    }

    fn cut_block(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let block = std::mem::replace(&mut self.current, BlockBuilder::new()).finish();
        let first_key = self
            .pending_first_key
            .take()
            .expect("non-empty block has a first key");
        self.index_entries
            .push((first_key, self.data.len() as u64, block.len() as u64));
        self.data.extend_from_slice(&block);
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    /// Flush the regions into `store`. Returns `None` for an empty table.
    pub fn finish(mut self, store: &dyn ChunkStore) -> Result<Option<TableOutput>> {
        self.cut_block();
        if self.num_entries == 0 {
            return Ok(None);
        }

        let mut index = Vec::new();
        index
            .write_u32::<BigEndian>(self.index_entries.len() as u32)
            .unwrap();
        for (first_key, offset, len) in &self.index_entries {
            let encoded = first_key.encode();
            index.write_u32::<BigEndian>(encoded.len() as u32).unwrap();
            index.extend_from_slice(&encoded);
            index.write_u64::<BigEndian>(*offset).unwrap();
            index.write_u64::<BigEndian>(*len).unwrap();
        }

        let filter_region = match &self.filter_policy {
            Some(policy) => {
                let filter = policy.create_filter(&self.user_keys);
                let name = policy.name().as_bytes();
                let mut region = Vec::with_capacity(4 + name.len() + filter.len());
                region.write_u32::<BigEndian>(name.len() as u32).unwrap();
                region.extend_from_slice(name);
                region.extend_from_slice(&filter);
                Some(region)
            }
            None => None,
        };

        let file_size = (self.data.len()
            + index.len()
            + filter_region.as_ref().map_or(0, |f| f.len())) as u64;

        let data = store.allocate(&self.data)?;
        let index = store.allocate(&index)?;
        let filter = match filter_region {
            Some(region) => Some(store.allocate(&region)?),
            None => None,
        };

        Ok(Some(TableOutput {
            data,
            index,
            filter,
            smallest: self.smallest.expect("non-empty table"),
            largest: self.largest.expect("non-empty table"),
            num_entries: self.num_entries,
            file_size,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::HeapChunkStore;
    use crate::filter::BloomFilterPolicy;
    use crate::key::ValueKind;

    #[test]
    fn test_empty_builder_produces_nothing() -> Result<()> {
        let store = HeapChunkStore::new(0);
        let builder = TableBuilder::new(4096, None);
        assert!(builder.finish(&store)?.is_none());
        assert_eq!(store.live_chunks(), 0);
        Ok(())
    }

    #[test]
    fn test_regions_and_bounds() -> Result<()> {
        let store = HeapChunkStore::new(1);
        let mut builder = TableBuilder::new(256, Some(Arc::new(BloomFilterPolicy::default())));
        for i in 0..100u64 {
            let key = InternalKey::new(format!("key-{i:03}").into_bytes(), 100 - i, ValueKind::Value);
            builder.add(&key, b"payload");
        }
        let output = builder.finish(&store)?.expect("non-empty table");

        assert_eq!(output.num_entries, 100);
        assert_eq!(output.smallest.user_key, b"key-000".to_vec());
        assert_eq!(output.largest.user_key, b"key-099".to_vec());
        assert!(output.filter.is_some());
        assert_eq!(store.live_chunks(), 3);
        assert_eq!(
            output.file_size,
            output.data.len + output.index.len + output.filter.as_ref().unwrap().len
        );
        // 100 entries at ~25 bytes each against a 256-byte block budget
        // must span several blocks
        assert!(output.data.len > 256);
        Ok(())
    }
}
