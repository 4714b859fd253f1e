//! Append-only record log.
//!
//! Every committed write becomes one entry: a `Put` carrying the full new
//! version of a record, or a `Delete` carrying the removed id. The live table
//! is rebuilt by replaying entries in order.

use crate::error::{Result, StoreError};
use crate::types::{PayloadEncoding, Record, RecordId, Sequence, Timestamp};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for log entries.
const LOG_MAGIC: &[u8; 4] = b"LQR\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

const KIND_PUT: u8 = 0;
const KIND_DELETE: u8 = 1;

/// A single log entry.
#[derive(Clone, Debug, PartialEq)]
pub enum LogEntry {
    /// Insert or replace a record.
    Put(Record),
    /// Remove a record.
    Delete { id: RecordId, sequence: Sequence },
}

impl LogEntry {
    pub fn sequence(&self) -> Sequence {
        match self {
            LogEntry::Put(record) => record.sequence,
            LogEntry::Delete { sequence, .. } => *sequence,
        }
    }

    /// Encode the body (everything between magic and checksum).
    ///
    /// Fails when a field does not fit its length prefix.
    fn encode_body(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        buf.push(LOG_VERSION);

        match self {
            LogEntry::Put(record) => {
                buf.push(KIND_PUT);
                buf.extend_from_slice(&record.sequence.0.to_le_bytes());
                buf.extend_from_slice(&record.id.0.to_le_bytes());
                buf.extend_from_slice(&record.timestamp.0.to_le_bytes());

                let type_bytes = record.record_type.as_bytes();
                let type_len = u16::try_from(type_bytes.len()).map_err(|_| {
                    StoreError::RecordTooLarge(format!(
                        "record type is {} bytes, limit is {}",
                        type_bytes.len(),
                        u16::MAX
                    ))
                })?;
                buf.extend_from_slice(&type_len.to_le_bytes());
                buf.extend_from_slice(type_bytes);

                buf.push(record.encoding.to_byte());

                let payload_len = u32::try_from(record.payload.len()).map_err(|_| {
                    StoreError::RecordTooLarge(format!(
                        "payload is {} bytes, limit is {}",
                        record.payload.len(),
                        u32::MAX
                    ))
                })?;
                buf.extend_from_slice(&payload_len.to_le_bytes());
                buf.extend_from_slice(&record.payload);
            }
            LogEntry::Delete { id, sequence } => {
                buf.push(KIND_DELETE);
                buf.extend_from_slice(&sequence.0.to_le_bytes());
                buf.extend_from_slice(&id.0.to_le_bytes());
            }
        }

        if u32::try_from(buf.len()).is_err() {
            return Err(StoreError::RecordTooLarge(format!(
                "log entry is {} bytes",
                buf.len()
            )));
        }

        Ok(buf)
    }
}

/// Append-only log of store writes.
pub struct RecordLog {
    /// Path to the log file.
    path: PathBuf,

    /// Log file handle.
    file: RwLock<File>,

    /// Current file size (for appending).
    file_size: RwLock<u64>,

    /// Number of writes since last sync.
    writes_since_sync: RwLock<u64>,

    /// Sync every N writes.
    sync_interval: u64,
}

impl RecordLog {
    /// Default sync interval.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a record log with default sync interval.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a record log with custom sync interval.
    /// An interval of 0 or 1 syncs every write.
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_size = file.metadata()?.len();

        Ok(Self {
            path,
            file: RwLock::new(file),
            file_size: RwLock::new(file_size),
            writes_since_sync: RwLock::new(0),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Append an entry. Returns the offset it was written at.
    pub fn append(&self, entry: &LogEntry) -> Result<u64> {
        let body = entry.encode_body()?;
        let mut file = self.file.write();

        let checksum = crc32fast::hash(&body);

        let mut frame = Vec::with_capacity(4 + 4 + body.len() + 4);
        frame.extend_from_slice(LOG_MAGIC);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&checksum.to_le_bytes());

        let offset = *self.file_size.read();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&frame)?;
        *self.file_size.write() = offset + frame.len() as u64;

        let mut writes = self.writes_since_sync.write();
        *writes += 1;
        if *writes >= self.sync_interval {
            file.sync_all()?;
            *writes = 0;
        }

        Ok(offset)
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let file = self.file.write();
        file.sync_all()?;
        *self.writes_since_sync.write() = 0;
        Ok(())
    }

    /// Read every entry from the start of the log.
    pub fn replay(&self) -> Result<Vec<LogEntry>> {
        let file = self.file.read().try_clone()?;
        let end = *self.file_size.read();

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(0))?;

        let mut entries = Vec::new();
        let mut offset = 0u64;
        while offset < end {
            let (entry, len) = read_entry(&mut reader).map_err(|e| match e {
                StoreError::Io(io) if io.kind() == ErrorKind::UnexpectedEof => {
                    StoreError::Corruption(format!("truncated log entry at offset {}", offset))
                }
                other => other,
            })?;
            entries.push(entry);
            offset += len;
        }

        Ok(entries)
    }

    /// Get current file size.
    pub fn size(&self) -> u64 {
        *self.file_size.read()
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read one framed entry. Returns the entry and its framed length.
fn read_entry<R: Read>(reader: &mut R) -> Result<(LogEntry, u64)> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != LOG_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid log entry magic".into()));
    }

    let body_len = read_u32(reader)? as usize;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body)?;

    let stored_checksum = read_u32(reader)?;
    let computed_checksum = crc32fast::hash(&body);
    if stored_checksum != computed_checksum {
        return Err(StoreError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    let entry = decode_body(&body)?;
    Ok((entry, (4 + 4 + body_len + 4) as u64))
}

fn decode_body(body: &[u8]) -> Result<LogEntry> {
    let mut cursor = body;

    let version = read_u8(&mut cursor)?;
    if version != LOG_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported log version: {}",
            version
        )));
    }

    let kind = read_u8(&mut cursor)?;
    let sequence = Sequence(read_u64(&mut cursor)?);
    let id = RecordId(read_u64(&mut cursor)?);

    match kind {
        KIND_PUT => {
            let timestamp = Timestamp(read_u64(&mut cursor)? as i64);

            let type_len = read_u16(&mut cursor)? as usize;
            let record_type = String::from_utf8_lossy(take(&mut cursor, type_len)?).into_owned();

            let encoding_byte = read_u8(&mut cursor)?;
            let encoding = PayloadEncoding::from_byte(encoding_byte).ok_or_else(|| {
                StoreError::InvalidFormat(format!("Unknown payload encoding: {}", encoding_byte))
            })?;

            let payload_len = read_u32(&mut cursor)? as usize;
            let payload = take(&mut cursor, payload_len)?.to_vec();

            Ok(LogEntry::Put(Record {
                id,
                sequence,
                timestamp,
                record_type,
                payload,
                encoding,
            }))
        }
        KIND_DELETE => Ok(LogEntry::Delete { id, sequence }),
        other => Err(StoreError::InvalidFormat(format!(
            "Unknown log entry kind: {}",
            other
        ))),
    }
}

fn take<'a>(cursor: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if cursor.len() < len {
        return Err(StoreError::Corruption("log entry body too short".into()));
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    Ok(head)
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut bytes = [0u8; 1];
    reader.read_exact(&mut bytes)?;
    Ok(bytes[0])
}

fn read_u16<R: Read>(reader: &mut R) -> Result<u16> {
    let mut bytes = [0u8; 2];
    reader.read_exact(&mut bytes)?;
    Ok(u16::from_le_bytes(bytes))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}
