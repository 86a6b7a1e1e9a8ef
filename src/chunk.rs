//! The memory-node boundary.
//!
//! Table payloads never touch the local filesystem: a flush serializes its
//! data, index, and filter regions and hands each to the chunk store, which
//! answers with an opaque handle. On the real deployment the store is the
//! RDMA-backed memory-node pool; in this crate and its tests it is an
//! in-process heap pool with the same contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;

pub type NodeId = u8;

/// Opaque address of one region inside a chunk store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkHandle {
    pub node_id: NodeId,
    pub chunk_id: u64,
    pub len: u64,
}

pub trait ChunkStore: Send + Sync {
    /// Identity of the node this store writes into.
    fn node_id(&self) -> NodeId;

    /// Store `payload` and return its handle.
    fn allocate(&self, payload: &[u8]) -> Result<ChunkHandle>;

    /// Read `len` bytes at `offset` within the chunk.
    fn read(&self, handle: &ChunkHandle, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Release a batch of chunks in one call. Only the creator node issues
    /// this; non-creators just drop their bookkeeping.
    fn free_batch(&self, handles: &[ChunkHandle]) -> Result<()>;
}

/// In-process chunk pool standing in for the memory-node fabric.
pub struct HeapChunkStore {
    node_id: NodeId,
    next_chunk: AtomicU64,
    chunks: Mutex<HashMap<u64, Arc<Vec<u8>>>>,
}

impl HeapChunkStore {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            next_chunk: AtomicU64::new(1),
            chunks: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live chunks, used by tests to observe deallocation.
    pub fn live_chunks(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }
}

impl ChunkStore for HeapChunkStore {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn allocate(&self, payload: &[u8]) -> Result<ChunkHandle> {
        let chunk_id = self.next_chunk.fetch_add(1, Ordering::SeqCst);
        self.chunks
            .lock()?
            .insert(chunk_id, Arc::new(payload.to_vec()));
        Ok(ChunkHandle {
            node_id: self.node_id,
            chunk_id,
            len: payload.len() as u64,
        })
    }

    fn read(&self, handle: &ChunkHandle, offset: u64, len: u64) -> Result<Vec<u8>> {
        let chunk = {
            let chunks = self.chunks.lock()?;
            match chunks.get(&handle.chunk_id) {
                Some(chunk) => Arc::clone(chunk),
                None => {
                    return Err(crate::error::Error::IO(format!(
                        "chunk {} not found on node {}",
                        handle.chunk_id, self.node_id
                    )))
                }
            }
        };
        let start = offset as usize;
        let end = start + len as usize;
        if end > chunk.len() {
            return Err(crate::corruption!(
                "chunk read past end: {}..{} of {}",
                start,
                end,
                chunk.len()
            ));
        }
        Ok(chunk[start..end].to_vec())
    }

    fn free_batch(&self, handles: &[ChunkHandle]) -> Result<()> {
        let mut chunks = self.chunks.lock()?;
        for handle in handles {
            chunks.remove(&handle.chunk_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_read_roundtrip() -> Result<()> {
        let store = HeapChunkStore::new(3);
        let handle = store.allocate(b"hello chunk world")?;
        assert_eq!(handle.node_id, 3);
        assert_eq!(handle.len, 17);

        assert_eq!(store.read(&handle, 0, 5)?, b"hello");
        assert_eq!(store.read(&handle, 6, 5)?, b"chunk");
        assert_eq!(store.read(&handle, 0, handle.len)?, b"hello chunk world");
        Ok(())
    }

    #[test]
    fn test_read_past_end_is_corruption() -> Result<()> {
        let store = HeapChunkStore::new(0);
        let handle = store.allocate(b"abc")?;
        assert!(store.read(&handle, 2, 2).is_err());
        Ok(())
    }

    #[test]
    fn test_free_batch_releases_all() -> Result<()> {
        let store = HeapChunkStore::new(0);
        let a = store.allocate(b"a")?;
        let b = store.allocate(b"b")?;
        let c = store.allocate(b"c")?;
        assert_eq!(store.live_chunks(), 3);

        store.free_batch(&[a.clone(), b])?;
        assert_eq!(store.live_chunks(), 1);
        assert!(store.read(&a, 0, 1).is_err());
        assert_eq!(store.read(&c, 0, 1)?, b"c");
        Ok(())
    }
}
