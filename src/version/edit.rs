use std::io::{Cursor, Read};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::key::InternalKey;
use crate::version::meta::RemoteTableMeta;

// field tags
const COMPARATOR: u8 = 0x01;
const LOG_NUMBER: u8 = 0x02;
const NEXT_FILE_NUMBER: u8 = 0x03;
const LAST_SEQUENCE: u8 = 0x04;
const COMPACT_POINTER: u8 = 0x05;
const DELETED_FILE: u8 = 0x06;
const ADDED_FILE: u8 = 0x07;

/// Atomically applicable delta against a Version. Encoded as a sequence of
/// tagged fields so absent fields cost nothing and new tags can be added
/// behind old readers' backs.
#[derive(Debug, Default, PartialEq)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    pub compact_pointers: Vec<(u32, InternalKey)>,
    /// (level, file number, creator node)
    pub deleted_files: Vec<(u32, u64, u8)>,
    /// Added metadata is shared by `Arc`: the same object the edit carries
    /// is the one every version built from it references, so chunk
    /// ownership is never split across copies.
    pub added_files: Vec<(u32, Arc<RemoteTableMeta>)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_comparator_name(&mut self, name: impl Into<String>) {
        self.comparator_name = Some(name.into());
    }

    pub fn set_log_number(&mut self, n: u64) {
        self.log_number = Some(n);
    }

    pub fn set_next_file_number(&mut self, n: u64) {
        self.next_file_number = Some(n);
    }

    pub fn set_last_sequence(&mut self, seq: u64) {
        self.last_sequence = Some(seq);
    }

    pub fn set_compact_pointer(&mut self, level: u32, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    pub fn delete_file(&mut self, level: u32, number: u64, creator_node_id: u8) {
        self.deleted_files.push((level, number, creator_node_id));
    }

    pub fn add_file(&mut self, level: u32, meta: Arc<RemoteTableMeta>) {
        self.added_files.push((level, meta));
    }

    pub fn is_empty(&self) -> bool {
        self.comparator_name.is_none()
            && self.log_number.is_none()
            && self.next_file_number.is_none()
            && self.last_sequence.is_none()
            && self.compact_pointers.is_empty()
            && self.deleted_files.is_empty()
            && self.added_files.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        if let Some(name) = &self.comparator_name {
            buf.write_u8(COMPARATOR).unwrap();
            buf.write_u32::<BigEndian>(name.len() as u32).unwrap();
            buf.extend_from_slice(name.as_bytes());
        }
        if let Some(n) = self.log_number {
            buf.write_u8(LOG_NUMBER).unwrap();
            buf.write_u64::<BigEndian>(n).unwrap();
        }
        if let Some(n) = self.next_file_number {
            buf.write_u8(NEXT_FILE_NUMBER).unwrap();
            buf.write_u64::<BigEndian>(n).unwrap();
        }
        if let Some(seq) = self.last_sequence {
            buf.write_u8(LAST_SEQUENCE).unwrap();
            buf.write_u64::<BigEndian>(seq).unwrap();
        }
        for (level, key) in &self.compact_pointers {
            buf.write_u8(COMPACT_POINTER).unwrap();
            buf.write_u32::<BigEndian>(*level).unwrap();
            let encoded = key.encode();
            buf.write_u32::<BigEndian>(encoded.len() as u32).unwrap();
            buf.extend_from_slice(&encoded);
        }
        for (level, number, node) in &self.deleted_files {
            buf.write_u8(DELETED_FILE).unwrap();
            buf.write_u32::<BigEndian>(*level).unwrap();
            buf.write_u64::<BigEndian>(*number).unwrap();
            buf.write_u8(*node).unwrap();
        }
        for (level, meta) in &self.added_files {
            buf.write_u8(ADDED_FILE).unwrap();
            buf.write_u32::<BigEndian>(*level).unwrap();
            meta.encode_into(&mut buf);
        }

        buf
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::new();
        let mut cursor = Cursor::new(raw);

        while (cursor.position() as usize) < raw.len() {
            let tag = cursor.read_u8()?;
            match tag {
                COMPARATOR => {
                    let len = cursor.read_u32::<BigEndian>()? as usize;
                    let mut name = vec![0u8; len];
                    cursor.read_exact(&mut name)?;
                    edit.comparator_name = Some(String::from_utf8_lossy(&name).into_owned());
                }
                LOG_NUMBER => edit.log_number = Some(cursor.read_u64::<BigEndian>()?),
                NEXT_FILE_NUMBER => edit.next_file_number = Some(cursor.read_u64::<BigEndian>()?),
                LAST_SEQUENCE => edit.last_sequence = Some(cursor.read_u64::<BigEndian>()?),
                COMPACT_POINTER => {
                    let level = cursor.read_u32::<BigEndian>()?;
                    let len = cursor.read_u32::<BigEndian>()? as usize;
                    let mut raw_key = vec![0u8; len];
                    cursor.read_exact(&mut raw_key)?;
                    edit.compact_pointers.push((level, InternalKey::decode(&raw_key)?));
                }
                DELETED_FILE => {
                    let level = cursor.read_u32::<BigEndian>()?;
                    let number = cursor.read_u64::<BigEndian>()?;
                    let node = cursor.read_u8()?;
                    edit.deleted_files.push((level, number, node));
                }
                ADDED_FILE => {
                    let level = cursor.read_u32::<BigEndian>()?;
                    let meta = RemoteTableMeta::decode_from(&mut cursor)?;
                    edit.added_files.push((level, Arc::new(meta)));
                }
                other => {
                    return Err(crate::corruption!("unknown version edit tag: {other:#x}"));
                }
            }
        }

        Ok(edit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkHandle;
    use crate::key::ValueKind;

    fn sample_meta(number: u64, level: u32) -> RemoteTableMeta {
        RemoteTableMeta::new(
            number,
            level,
            2048,
            64,
            InternalKey::new(b"a".to_vec(), 9, ValueKind::Value),
            InternalKey::new(b"m".to_vec(), 1, ValueKind::Value),
            2,
            ChunkHandle {
                node_id: 2,
                chunk_id: 10,
                len: 1900,
            },
            ChunkHandle {
                node_id: 2,
                chunk_id: 11,
                len: 120,
            },
            None,
        )
    }

    #[test]
    fn test_empty_roundtrip() -> Result<()> {
        let edit = VersionEdit::new();
        assert!(edit.is_empty());
        let decoded = VersionEdit::decode(&edit.encode())?;
        assert_eq!(decoded, edit);
        Ok(())
    }

    #[test]
    fn test_full_roundtrip() -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name("dlsm.BytewiseComparator");
        edit.set_log_number(12);
        edit.set_next_file_number(99);
        edit.set_last_sequence(1 << 40);
        edit.set_compact_pointer(3, InternalKey::new(b"ptr".to_vec(), 77, ValueKind::Value));
        edit.delete_file(1, 4, 2);
        edit.delete_file(2, 8, 0);
        edit.add_file(0, Arc::new(sample_meta(100, 0)));
        edit.add_file(1, Arc::new(sample_meta(101, 1)));

        let decoded = VersionEdit::decode(&edit.encode())?;
        assert_eq!(decoded, edit);
        Ok(())
    }

    #[test]
    fn test_flush_style_edit_roundtrip() -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.set_log_number(0);
        edit.add_file(0, Arc::new(sample_meta(7, 0)));
        let decoded = VersionEdit::decode(&edit.encode())?;
        assert_eq!(decoded.added_files.len(), 1);
        assert_eq!(decoded.added_files[0].0, 0);
        assert_eq!(decoded.added_files[0].1.number, 7);
        Ok(())
    }

    #[test]
    fn test_unknown_tag_is_corruption() {
        assert!(matches!(
            VersionEdit::decode(&[0xEE]),
            Err(crate::error::Error::Corruption(_))
        ));
    }
}
