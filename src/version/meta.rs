use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::chunk::{ChunkHandle, ChunkStore};
use crate::error::Result;
use crate::key::InternalKey;

/// Metadata for one table living in the memory-node pool.
///
/// Ownership follows the creator: once an applied edit retires the file
/// from the live set, the creating node's last reference releases the
/// table's chunk regions back to the pool in one batched call. A clean
/// shutdown drops references without retiring anything, so live tables
/// survive for the next open. A node that merely learned about the table
/// from the manifest frees only this struct.
pub struct RemoteTableMeta {
    pub number: u64,
    pub level: u32,
    pub file_size: u64,
    pub num_entries: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    pub creator_node_id: u8,
    pub data: ChunkHandle,
    pub index: ChunkHandle,
    pub filter: Option<ChunkHandle>,

    /// Remaining read misses before this file becomes a seek-compaction
    /// candidate. Assigned when the file enters a Version.
    pub allowed_seeks: AtomicI64,
    pub under_compaction: AtomicBool,

    // Set once an applied edit removes the file from the live set.
    retired: AtomicBool,
    // Present only on the creator side; drives the deallocation in Drop.
    owner: Option<Arc<dyn ChunkStore>>,
}

impl RemoteTableMeta {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        number: u64,
        level: u32,
        file_size: u64,
        num_entries: u64,
        smallest: InternalKey,
        largest: InternalKey,
        creator_node_id: u8,
        data: ChunkHandle,
        index: ChunkHandle,
        filter: Option<ChunkHandle>,
    ) -> Self {
        Self {
            number,
            level,
            file_size,
            num_entries,
            smallest,
            largest,
            creator_node_id,
            data,
            index,
            filter,
            allowed_seeks: AtomicI64::new(100),
            under_compaction: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            owner: None,
        }
    }

    /// Flag the file as removed from (or restored to) the live set. Only
    /// a retired file's chunks are released when the creator's last
    /// reference drops.
    pub fn mark_retired(&self, retired: bool) {
        self.retired.store(retired, Ordering::Release);
    }

    /// Mark this metadata as created by `store`'s node; its chunks will be
    /// freed when the last reference drops.
    pub fn owned_by(mut self, store: Arc<dyn ChunkStore>) -> Self {
        debug_assert_eq!(store.node_id(), self.creator_node_id);
        self.owner = Some(store);
        self
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.number).unwrap();
        buf.write_u32::<BigEndian>(self.level).unwrap();
        buf.write_u64::<BigEndian>(self.file_size).unwrap();
        buf.write_u64::<BigEndian>(self.num_entries).unwrap();
        buf.write_u8(self.creator_node_id).unwrap();

        encode_key(buf, &self.smallest);
        encode_key(buf, &self.largest);
        encode_handle(buf, &self.data);
        encode_handle(buf, &self.index);
        match &self.filter {
            Some(handle) => {
                buf.write_u8(1).unwrap();
                encode_handle(buf, handle);
            }
            None => buf.write_u8(0).unwrap(),
        }
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let number = cursor.read_u64::<BigEndian>()?;
        let level = cursor.read_u32::<BigEndian>()?;
        let file_size = cursor.read_u64::<BigEndian>()?;
        let num_entries = cursor.read_u64::<BigEndian>()?;
        let creator_node_id = cursor.read_u8()?;

        let smallest = decode_key(cursor)?;
        let largest = decode_key(cursor)?;
        let data = decode_handle(cursor)?;
        let index = decode_handle(cursor)?;
        let filter = match cursor.read_u8()? {
            0 => None,
            _ => Some(decode_handle(cursor)?),
        };

        Ok(Self::new(
            number,
            level,
            file_size,
            num_entries,
            smallest,
            largest,
            creator_node_id,
            data,
            index,
            filter,
        ))
    }

    pub fn handles(&self) -> Vec<ChunkHandle> {
        let mut handles = vec![self.data.clone(), self.index.clone()];
        if let Some(filter) = &self.filter {
            handles.push(filter.clone());
        }
        handles
    }
}

impl Drop for RemoteTableMeta {
    fn drop(&mut self) {
        if !self.retired.load(Ordering::Acquire) {
            return;
        }
        if let Some(store) = self.owner.take() {
            if let Err(e) = store.free_batch(&self.handles()) {
                tracing::warn!(number = self.number, err = %e, "failed to release table chunks");
            }
        }
    }
}

impl PartialEq for RemoteTableMeta {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
            && self.level == other.level
            && self.file_size == other.file_size
            && self.num_entries == other.num_entries
            && self.smallest == other.smallest
            && self.largest == other.largest
            && self.creator_node_id == other.creator_node_id
            && self.data == other.data
            && self.index == other.index
            && self.filter == other.filter
    }
}

impl std::fmt::Debug for RemoteTableMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTableMeta")
            .field("number", &self.number)
            .field("level", &self.level)
            .field("file_size", &self.file_size)
            .field("num_entries", &self.num_entries)
            .field("creator", &self.creator_node_id)
            .finish()
    }
}

fn encode_key(buf: &mut Vec<u8>, key: &InternalKey) {
    let encoded = key.encode();
    buf.write_u32::<BigEndian>(encoded.len() as u32).unwrap();
    buf.extend_from_slice(&encoded);
}

fn decode_key(cursor: &mut Cursor<&[u8]>) -> Result<InternalKey> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let mut raw = vec![0u8; len];
    cursor.read_exact(&mut raw)?;
    InternalKey::decode(&raw)
}

fn encode_handle(buf: &mut Vec<u8>, handle: &ChunkHandle) {
    buf.write_u8(handle.node_id).unwrap();
    buf.write_u64::<BigEndian>(handle.chunk_id).unwrap();
    buf.write_u64::<BigEndian>(handle.len).unwrap();
}

fn decode_handle(cursor: &mut Cursor<&[u8]>) -> Result<ChunkHandle> {
    Ok(ChunkHandle {
        node_id: cursor.read_u8()?,
        chunk_id: cursor.read_u64::<BigEndian>()?,
        len: cursor.read_u64::<BigEndian>()?,
    })
}
