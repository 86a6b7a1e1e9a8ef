//! Internal key format.
//!
//! Every entry in the engine is addressed by an internal key: the user key,
//! a 56-bit sequence number, and a kind tag. Ordering is user key ascending,
//! then sequence descending, then kind descending, so the newest version of
//! a user key is the first one an iterator sees.

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Result;

/// Sequence numbers occupy 56 bits so they can share a u64 with the kind
/// tag when packed.
pub const MAX_SEQUENCE: u64 = (1u64 << 56) - 1;

/// Tag for an entry kind, packed into the low byte of the key trailer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueKind {
    Deletion = 0,
    Value = 1,
}

/// Kind used when seeking: at equal sequence, `Value` sorts first, so a
/// seek key of (user_key, snapshot, Value) lands on the newest entry with
/// sequence <= snapshot.
pub const KIND_FOR_SEEK: ValueKind = ValueKind::Value;

impl ValueKind {
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(ValueKind::Deletion),
            1 => Ok(ValueKind::Value),
            other => Err(crate::corruption!("unknown value kind tag: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub seq: u64,
    pub kind: ValueKind,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Vec<u8>>, seq: u64, kind: ValueKind) -> Self {
        debug_assert!(seq <= MAX_SEQUENCE);
        Self {
            user_key: user_key.into(),
            seq,
            kind,
        }
    }

    /// Seek target for `user_key` as of `snapshot_seq`.
    pub fn for_seek(user_key: impl Into<Vec<u8>>, snapshot_seq: u64) -> Self {
        Self::new(user_key, snapshot_seq, KIND_FOR_SEEK)
    }

    /// user_key bytes followed by a fixed 8-byte trailer `(seq << 8) | kind`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.user_key.len() + 8);
        buf.extend_from_slice(&self.user_key);
        let mut trailer = [0u8; 8];
        LittleEndian::write_u64(&mut trailer, (self.seq << 8) | self.kind as u64);
        buf.extend_from_slice(&trailer);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(crate::corruption!(
                "internal key too short: {} bytes",
                buf.len()
            ));
        }
        let split = buf.len() - 8;
        let packed = LittleEndian::read_u64(&buf[split..]);
        let kind = ValueKind::from_u8((packed & 0xff) as u8)?;
        Ok(Self {
            user_key: buf[..split].to_vec(),
            seq: packed >> 8,
            kind,
        })
    }

    pub fn approximate_size(&self) -> usize {
        self.user_key.len() + 8
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| (other.kind as u8).cmp(&(self.kind as u8)))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A user key paired with the snapshot it is being read at.
#[derive(Clone, Debug)]
pub struct LookupKey {
    pub user_key: Vec<u8>,
    pub snapshot_seq: u64,
}

impl LookupKey {
    pub fn new(user_key: impl Into<Vec<u8>>, snapshot_seq: u64) -> Self {
        Self {
            user_key: user_key.into(),
            snapshot_seq,
        }
    }

    pub fn seek_key(&self) -> InternalKey {
        InternalKey::for_seek(self.user_key.clone(), self.snapshot_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() -> Result<()> {
        let key = InternalKey::new(b"user-key".to_vec(), 12345, ValueKind::Value);
        let decoded = InternalKey::decode(&key.encode())?;
        assert_eq!(decoded, key);

        let tombstone = InternalKey::new(b"".to_vec(), MAX_SEQUENCE, ValueKind::Deletion);
        assert_eq!(InternalKey::decode(&tombstone.encode())?, tombstone);
        Ok(())
    }

    #[test]
    fn test_decode_rejects_short_and_bad_tag() {
        assert!(InternalKey::decode(b"short").is_err());

        let mut buf = InternalKey::new(b"k".to_vec(), 1, ValueKind::Value).encode();
        buf[1] = 0x7f; // clobber the kind byte
        assert!(InternalKey::decode(&buf).is_err());
    }

    #[test]
    fn test_ordering() {
        let a = InternalKey::new(b"a".to_vec(), 5, ValueKind::Value);
        let a_older = InternalKey::new(b"a".to_vec(), 3, ValueKind::Value);
        let b = InternalKey::new(b"b".to_vec(), 1, ValueKind::Value);

        // user key ascending dominates
        assert!(a < b);
        assert!(a_older < b);
        // newer sequence sorts first within a user key
        assert!(a < a_older);
        // at equal sequence, Value sorts before Deletion
        let del = InternalKey::new(b"a".to_vec(), 5, ValueKind::Deletion);
        assert!(a < del);
    }

    #[test]
    fn test_ordering_survives_roundtrip() -> Result<()> {
        let keys = vec![
            InternalKey::new(b"a".to_vec(), 9, ValueKind::Value),
            InternalKey::new(b"a".to_vec(), 2, ValueKind::Deletion),
            InternalKey::new(b"ab".to_vec(), 7, ValueKind::Value),
            InternalKey::new(b"b".to_vec(), MAX_SEQUENCE, ValueKind::Value),
        ];
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
            let x = InternalKey::decode(&pair[0].encode())?;
            let y = InternalKey::decode(&pair[1].encode())?;
            assert!(x < y);
        }
        Ok(())
    }

    #[test]
    fn test_seek_key_finds_snapshot() {
        // Seeking at snapshot 5 must land at or before the seq-5 entry and
        // strictly after the seq-9 entry.
        let seek = LookupKey::new(b"k".to_vec(), 5).seek_key();
        let newer = InternalKey::new(b"k".to_vec(), 9, ValueKind::Value);
        let visible = InternalKey::new(b"k".to_vec(), 5, ValueKind::Value);
        let older = InternalKey::new(b"k".to_vec(), 2, ValueKind::Value);
        assert!(newer < seek);
        assert!(seek <= visible);
        assert!(seek < older);
    }
}
