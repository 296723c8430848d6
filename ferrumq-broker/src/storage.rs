//! Backup file format and rotation for queue persistence.
//!
//! A backup file is a sequential stream of (header, message) records:
//!
//! ```text
//! +-------+----------------+----------------+------------------+
//! | magic | payload length | crc32(payload) | bincode(message) |
//! | 4B    | 4B             | 4B             | length bytes     |
//! +-------+----------------+----------------+------------------+
//! ```
//!
//! Readers consume records until end-of-stream or the first decode failure.
//! Rotation shifts numbered generation files (`<file>.1` .. `<file>.N`) when
//! the active file crosses the configured size, with the size check throttled
//! to every N writes.

use crate::config::RotationConfig;
use ferrumq_core::{Error, Message, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic marker starting every backup record.
const RECORD_MAGIC: u32 = 0x4651_424B; // "FQBK"

/// Record header size in bytes: magic + length + checksum.
const RECORD_HEADER_SIZE: usize = 12;

/// Maximum accepted record payload, guarding against corrupt length fields.
const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// Encode one message as a backup record.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn encode_record(message: &Message) -> Result<Vec<u8>> {
    let body = bincode::serialize(message)?;
    let len = u32::try_from(body.len()).map_err(|_| Error::Storage {
        message: "message too large for backup record".to_string(),
    })?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    let checksum = hasher.finalize();

    let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + body.len());
    record.extend_from_slice(&RECORD_MAGIC.to_be_bytes());
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(&checksum.to_be_bytes());
    record.extend_from_slice(&body);
    Ok(record)
}

/// Sequential reader over the records of a backup file.
#[derive(Debug)]
pub struct BackupReader {
    reader: BufReader<File>,
}

impl BackupReader {
    /// Open a backup file for reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self { reader: BufReader::new(file) })
    }

    /// Read the next record.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream (EOF exactly at a record
    /// boundary). A truncated header, bad magic, bad checksum, or decode
    /// failure is an error: the caller keeps what was already read.
    ///
    /// # Errors
    /// Returns an error on any corrupt or truncated record.
    pub fn next_record(&mut self) -> Result<Option<Message>> {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        match self.reader.read_exact(&mut header) {
            Ok(_) => {},
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let magic = u32::from_be_bytes(header[0..4].try_into().expect("4-byte slice"));
        if magic != RECORD_MAGIC {
            return Err(Error::Storage { message: format!("bad record magic {magic:#010x}") });
        }

        let len = u32::from_be_bytes(header[4..8].try_into().expect("4-byte slice"));
        if len > MAX_RECORD_SIZE {
            return Err(Error::Storage { message: format!("record length {len} out of range") });
        }
        let expected_checksum = u32::from_be_bytes(header[8..12].try_into().expect("4-byte slice"));

        let mut body = vec![0u8; len as usize];
        self.reader.read_exact(&mut body)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        if hasher.finalize() != expected_checksum {
            return Err(Error::Storage { message: "record checksum mismatch".to_string() });
        }

        Ok(Some(bincode::deserialize(&body)?))
    }
}

/// Path of generation file `k` for the given active backup file.
fn generation_path(path: &Path, generation: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

/// Shift existing generation files by one index and move the active file to
/// generation 1. The oldest generation beyond `max_generations` is deleted.
///
/// # Errors
/// Returns an error if any rename fails.
pub fn rotate_generations(path: &Path, rotation: &RotationConfig) -> Result<()> {
    let oldest = generation_path(path, rotation.max_generations);
    if oldest.exists() {
        std::fs::remove_file(&oldest)?;
        debug!("Removed oldest backup generation {}", oldest.display());
    }

    for k in (1..rotation.max_generations).rev() {
        let from = generation_path(path, k);
        if from.exists() {
            std::fs::rename(&from, generation_path(path, k + 1))?;
        }
    }

    if path.exists() {
        std::fs::rename(path, generation_path(path, 1))?;
    }
    debug!("Rotated backup generations for {}", path.display());
    Ok(())
}

/// Append-only record writer with throttled size-based rotation.
#[derive(Debug)]
pub struct BackupWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    rotation: RotationConfig,
    writes_since_check: u64,
}

impl BackupWriter {
    /// Open the active backup file for appending, creating it if missing.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl Into<PathBuf>, rotation: RotationConfig) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, writer: BufWriter::new(file), rotation, writes_since_check: 0 })
    }

    /// Append one message record, rotating generations first when due.
    ///
    /// # Errors
    /// Returns an error if encoding, rotation, or the write fails.
    pub fn append(&mut self, message: &Message) -> Result<()> {
        self.rotate_if_needed()?;
        let record = encode_record(message)?;
        self.writer.write_all(&record)?;
        self.writes_since_check += 1;
        Ok(())
    }

    /// Flush buffered records to the file.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Check the active file size every `check_every_writes` appends and
    /// rotate when it has crossed the threshold.
    fn rotate_if_needed(&mut self) -> Result<()> {
        if self.writes_since_check < self.rotation.check_every_writes {
            return Ok(());
        }
        self.writes_since_check = 0;

        self.writer.flush()?;
        let size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if size < self.rotation.max_file_size {
            return Ok(());
        }

        rotate_generations(&self.path, &self.rotation)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }

    /// Get the active file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write all messages as a fresh backup file, replacing any existing active
/// file after rotating it into the generation chain.
///
/// # Errors
/// Returns an error if rotation or any record write fails.
pub fn write_backup(
    path: &Path,
    rotation: &RotationConfig,
    messages: &[Message],
) -> Result<()> {
    if path.exists() {
        // The previous active file becomes generation 1 rather than being
        // overwritten in place.
        rotate_generations(path, rotation)?;
    }

    let mut writer = BackupWriter::open(path, rotation.clone())?;
    for message in messages {
        writer.append(message)?;
    }
    writer.flush()
}

/// Read every record from a backup file.
///
/// Returns the messages read and whether the read was fully clean. A corrupt
/// tail stops the read at the last good record; already-read messages are
/// returned and the file is left in place for inspection.
///
/// # Errors
/// Returns an error only if the file cannot be opened at all.
pub fn read_backup(path: &Path) -> Result<(Vec<Message>, bool)> {
    let mut reader = BackupReader::open(path)?;
    let mut messages = Vec::new();
    loop {
        match reader.next_record() {
            Ok(Some(message)) => messages.push(message),
            Ok(None) => return Ok((messages, true)),
            Err(e) => {
                warn!("Backup file {} has a corrupt tail: {e}", path.display());
                return Ok((messages, false));
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrumq_core::{Payload, Priority};
    use tempfile::TempDir;

    fn test_message(text: &str) -> Message {
        let mut message = Message::new(Priority::new(5).unwrap());
        message.payload = Payload::Text(text.to_string());
        message
    }

    fn test_rotation() -> RotationConfig {
        RotationConfig { max_file_size: 1024, check_every_writes: 1, max_generations: 3 }
    }

    #[test]
    fn test_record_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Q.bak");

        let messages: Vec<Message> = (0..5).map(|i| test_message(&format!("m{i}"))).collect();
        write_backup(&path, &RotationConfig::default(), &messages).unwrap();

        let (read, clean) = read_backup(&path).unwrap();
        assert!(clean);
        assert_eq!(read.len(), 5);
        for (a, b) in read.iter().zip(&messages) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.payload, b.payload);
        }
    }

    #[test]
    fn test_corrupt_tail_keeps_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Q.bak");

        let messages: Vec<Message> = (0..3).map(|i| test_message(&format!("m{i}"))).collect();
        write_backup(&path, &RotationConfig::default(), &messages).unwrap();

        // Truncate into the middle of the last record.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 4).unwrap();

        let (read, clean) = read_backup(&path).unwrap();
        assert!(!clean);
        assert_eq!(read.len(), 2);
    }

    #[test]
    fn test_bad_checksum_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Q.bak");
        write_backup(&path, &RotationConfig::default(), &[test_message("x")]).unwrap();

        // Flip a payload byte past the header.
        let mut raw = std::fs::read(&path).unwrap();
        let idx = raw.len() - 1;
        raw[idx] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        let (read, clean) = read_backup(&path).unwrap();
        assert!(!clean);
        assert!(read.is_empty());
    }

    #[test]
    fn test_generation_shift() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Q.bak");
        let rotation = test_rotation();

        std::fs::write(&path, b"active").unwrap();
        std::fs::write(generation_path(&path, 1), b"gen1").unwrap();
        std::fs::write(generation_path(&path, 2), b"gen2").unwrap();
        std::fs::write(generation_path(&path, 3), b"gen3").unwrap();

        rotate_generations(&path, &rotation).unwrap();

        assert!(!path.exists());
        assert_eq!(std::fs::read(generation_path(&path, 1)).unwrap(), b"active");
        assert_eq!(std::fs::read(generation_path(&path, 2)).unwrap(), b"gen1");
        assert_eq!(std::fs::read(generation_path(&path, 3)).unwrap(), b"gen2");
        // gen3 (oldest beyond max) was deleted, then gen2 took its slot.
        assert!(!generation_path(&path, 4).exists());
    }

    #[test]
    fn test_writer_rotates_on_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Q.bak");
        let rotation = test_rotation();

        let mut writer = BackupWriter::open(&path, rotation.clone()).unwrap();
        // Each record is well over a hundred bytes; enough appends push the
        // active file past the 1KB threshold and force at least one rotation.
        for i in 0..64 {
            writer.append(&test_message(&format!("payload-{i}"))).unwrap();
        }
        writer.flush().unwrap();
        drop(writer);

        assert!(generation_path(&path, 1).exists());
        let active_size = std::fs::metadata(&path).unwrap().len();
        assert!(active_size < 64 * 100);
    }
}
