//! Manifest log: the durable record of version edits.
//!
//! A manifest file is a short magic header followed by length-prefixed,
//! crc-protected records, each one encoded `VersionEdit`:
//!
//! ```text
//! +--------------------+
//! | magic (8) ver (4)  |
//! +--------------------+
//! | len u32 | edit | crc u32 |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! ```
//!
//! `CURRENT` names the active `MANIFEST-<N>`; it is replaced atomically
//! (write temp, rename) so a crash never leaves a dangling pointer.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MAGIC: u64 = 0x644c_534d_4d41_4e49; // "dLSMMANI"
const FORMAT_VERSION: u32 = 1;

pub fn manifest_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{number:06}"))
}

pub fn current_file_name(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

pub fn lock_file_name(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

/// Point `CURRENT` at `MANIFEST-<number>`, atomically.
pub fn set_current_file(dir: &Path, number: u64) -> Result<()> {
    let tmp = dir.join(format!("CURRENT.{number:06}.tmp"));
    let mut file = File::create(&tmp)?;
    writeln!(file, "MANIFEST-{number:06}")?;
    file.sync_all()?;
    fs::rename(&tmp, current_file_name(dir))?;
    Ok(())
}

/// Name of the active manifest file, from `CURRENT`.
pub fn read_current_file(dir: &Path) -> Result<String> {
    let content = fs::read_to_string(current_file_name(dir))?;
    let name = content.trim();
    if name.is_empty() || !name.starts_with("MANIFEST-") {
        return Err(crate::corruption!("CURRENT file is malformed: {name:?}"));
    }
    Ok(name.to_string())
}

/// Append-only writer for one manifest file.
pub struct ManifestLog {
    file: File,
    writer: Mutex<BufWriter<File>>,
}

impl ManifestLog {
    /// Create a fresh manifest, writing the header eagerly.
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;

        file.write_u64::<BigEndian>(MAGIC)?;
        file.write_u32::<BigEndian>(FORMAT_VERSION)?;
        file.sync_all()?;

        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self { file, writer: Mutex::new(writer) })
    }

    pub fn append(&self, record: &[u8]) -> Result<()> {
        let checksum = CRC32.checksum(record);
        let mut writer = self.writer.lock()?;
        writer.write_u32::<BigEndian>(record.len() as u32)?;
        writer.write_all(record)?;
        writer.write_u32::<BigEndian>(checksum)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.writer.lock()?.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Sequential reader over a manifest file's records.
pub struct ManifestReader {
    reader: BufReader<File>,
}

impl ManifestReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let magic = reader.read_u64::<BigEndian>()?;
        if magic != MAGIC {
            return Err(crate::corruption!("bad manifest magic: {magic:#x}"));
        }
        let version = reader.read_u32::<BigEndian>()?;
        if version != FORMAT_VERSION {
            return Err(crate::corruption!("unsupported manifest version {version}"));
        }
        Ok(Self { reader })
    }
}

impl Iterator for ManifestReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return None,
            Err(e) => return Some(Err(e.into())),
        };

        let mut record = vec![0u8; len];
        if let Err(e) = self.reader.read_exact(&mut record) {
            return Some(Err(e.into()));
        }
        let stored = match self.reader.read_u32::<BigEndian>() {
            Ok(checksum) => checksum,
            Err(e) => return Some(Err(e.into())),
        };

        let computed = CRC32.checksum(&record);
        if stored != computed {
            return Some(Err(crate::corruption!(
                "manifest record checksum mismatch: stored {stored:#x}, computed {computed:#x}"
            )));
        }
        Some(Ok(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_append_and_replay() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let path = manifest_file_name(dir.path(), 1);

        let log = ManifestLog::create(&path)?;
        log.append(b"first record")?;
        log.append(b"second record")?;
        log.sync()?;

        let records: Vec<_> = ManifestReader::open(&path)?.collect::<Result<Vec<_>>>()?;
        assert_eq!(records, vec![b"first record".to_vec(), b"second record".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_current_file_roundtrip() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        set_current_file(dir.path(), 7)?;
        assert_eq!(read_current_file(dir.path())?, "MANIFEST-000007");

        set_current_file(dir.path(), 12)?;
        assert_eq!(read_current_file(dir.path())?, "MANIFEST-000012");
        Ok(())
    }

    #[test]
    fn test_checksum_corruption_detected() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let path = manifest_file_name(dir.path(), 1);
        {
            let log = ManifestLog::create(&path)?;
            log.append(b"a record that will be damaged")?;
            log.sync()?;
        }

        // flip a byte inside the record body
        {
            use std::io::{Seek, SeekFrom};
            let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
            file.seek(SeekFrom::Start(12 + 4 + 3))?;
            file.write_all(&[0xff])?;
        }

        let mut reader = ManifestReader::open(&path)?;
        match reader.next() {
            Some(Err(crate::error::Error::Corruption(msg))) => {
                assert!(msg.contains("checksum"));
            }
            other => panic!("expected checksum corruption, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_truncated_tail_stops_iteration() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let path = manifest_file_name(dir.path(), 1);
        {
            let log = ManifestLog::create(&path)?;
            log.append(b"complete record")?;
            log.append(b"this one gets cut off")?;
            log.sync()?;
        }

        let len = fs::metadata(&path)?.len();
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(len - 6)?;

        let mut reader = ManifestReader::open(&path)?;
        assert_eq!(reader.next().expect("first record")?, b"complete record".to_vec());
        assert!(reader.next().expect("second record is damaged").is_err());
        Ok(())
    }

    #[test]
    fn test_bad_magic_rejected() -> Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("MANIFEST-000001");
        fs::write(&path, b"not a manifest at all")?;
        assert!(ManifestReader::open(&path).is_err());
        Ok(())
    }
}
