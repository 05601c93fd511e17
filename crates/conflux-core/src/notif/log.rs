//! Per-module append-only notification log.
//!
//! Replayable modules persist every published notification so that late
//! subscribers can catch up. One log per module, one file per log:
//!
//! ```text
//! [MAGIC "CNFX"][VERSION: 1 byte]
//! [len: u32 LE][record JSON][crc32: u32 LE]
//! [len: u32 LE][record JSON][crc32: u32 LE]
//! ...
//! ```
//!
//! Timestamps are strictly monotone within one log: an append carrying a
//! timestamp at or before the last recorded one is bumped to `last + 1`
//! millisecond. Records older than the retention window are purged; a
//! purge that drops persisted records rewrites the file.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::data::DataTree;

/// File magic of notification logs.
const MAGIC: [u8; 4] = *b"CNFX";
/// Current on-disk format version.
const FORMAT_VERSION: u8 = 1;
/// Upper bound on one encoded record, as corruption protection.
const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from notification log operations.
#[derive(Debug, thiserror::Error)]
pub enum NotifLogError {
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Record (de)serialization failure.
    #[error("codec error: {0}")]
    Codec(String),
    /// The file does not look like a notification log.
    #[error("bad log header in {0}")]
    BadHeader(PathBuf),
}

// ---------------------------------------------------------------------------
// LogRecord
// ---------------------------------------------------------------------------

/// One persisted notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Recorded timestamp (milliseconds since the epoch), strictly
    /// monotone within one log.
    pub timestamp_ms: i64,
    /// Notification path.
    pub path: String,
    /// Notification payload.
    pub data: DataTree,
}

fn encode(record: &LogRecord) -> Result<Vec<u8>, NotifLogError> {
    let body = serde_json::to_vec(record).map_err(|e| NotifLogError::Codec(e.to_string()))?;
    let crc = crc32fast::hash(&body);
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&u32::try_from(body.len()).map_err(|_| {
        NotifLogError::Codec("record too large".to_string())
    })?.to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

fn decode(reader: &mut impl Read) -> Result<Option<LogRecord>, NotifLogError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_RECORD_BYTES {
        return Err(NotifLogError::Codec(format!(
            "record of {len} bytes exceeds the {MAX_RECORD_BYTES} byte limit"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    if crc32fast::hash(&body) != u32::from_le_bytes(crc_bytes) {
        return Err(NotifLogError::Codec("crc mismatch".to_string()));
    }
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| NotifLogError::Codec(e.to_string()))
}

// ---------------------------------------------------------------------------
// NotificationLog
// ---------------------------------------------------------------------------

/// Append-only, retention-bounded notification store of one module.
pub struct NotificationLog {
    module: String,
    retention: Duration,
    entries: Vec<LogRecord>,
    last_timestamp: i64,
    file_path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
}

impl NotificationLog {
    /// Opens (or creates) the log of `module`.
    ///
    /// With a directory, existing records are loaded and appends are
    /// persisted to `<dir>/<module>.notif`; without one the log lives in
    /// memory only. A corrupted tail is dropped with a warning — records
    /// before the corruption stay available.
    ///
    /// # Errors
    ///
    /// [`NotifLogError`] on filesystem failures or a foreign header.
    pub fn open(
        module: &str,
        dir: Option<&Path>,
        retention: Duration,
    ) -> Result<Self, NotifLogError> {
        let mut log = Self {
            module: module.to_string(),
            retention,
            entries: Vec::new(),
            last_timestamp: 0,
            file_path: None,
            writer: None,
        };
        let Some(dir) = dir else {
            return Ok(log);
        };

        std::fs::create_dir_all(dir)?;
        let file_path = dir.join(format!("{module}.notif"));
        if file_path.exists() {
            log.load(&file_path)?;
        } else {
            let mut file = File::create(&file_path)?;
            file.write_all(&MAGIC)?;
            file.write_all(&[FORMAT_VERSION])?;
            file.sync_all()?;
        }

        let file = OpenOptions::new().append(true).open(&file_path)?;
        log.writer = Some(BufWriter::new(file));
        log.file_path = Some(file_path);
        Ok(log)
    }

    fn load(&mut self, path: &Path) -> Result<(), NotifLogError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut header = [0u8; 5];
        reader.read_exact(&mut header).map_err(|_| {
            NotifLogError::BadHeader(path.to_path_buf())
        })?;
        if header[..4] != MAGIC || header[4] != FORMAT_VERSION {
            return Err(NotifLogError::BadHeader(path.to_path_buf()));
        }
        loop {
            match decode(&mut reader) {
                Ok(Some(record)) => {
                    self.last_timestamp = record.timestamp_ms;
                    self.entries.push(record);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(module = %self.module, "dropping corrupted log tail: {e}");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Module this log belongs to.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no record is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Timestamp of the newest record, 0 for an empty log.
    #[must_use]
    pub fn last_timestamp(&self) -> i64 {
        self.last_timestamp
    }

    /// Appends a notification, returning the timestamp actually recorded
    /// (bumped past the previous record if needed).
    ///
    /// # Errors
    ///
    /// [`NotifLogError`] if persisting the record fails; the in-memory
    /// log is not modified in that case.
    pub fn append(
        &mut self,
        path: &str,
        data: &DataTree,
        timestamp_ms: i64,
    ) -> Result<i64, NotifLogError> {
        let timestamp_ms = if timestamp_ms <= self.last_timestamp {
            self.last_timestamp + 1
        } else {
            timestamp_ms
        };
        let record = LogRecord {
            timestamp_ms,
            path: path.to_string(),
            data: data.clone(),
        };

        if let Some(writer) = self.writer.as_mut() {
            let bytes = encode(&record)?;
            writer.write_all(&bytes)?;
            writer.flush()?;
        }

        self.last_timestamp = timestamp_ms;
        self.entries.push(record);
        self.purge_expired(unix_millis())?;
        Ok(timestamp_ms)
    }

    /// Records with `after_ms < timestamp <= up_to_ms`, in timestamp
    /// order.
    #[must_use]
    pub fn range(&self, after_ms: i64, up_to_ms: i64) -> Vec<LogRecord> {
        self.entries
            .iter()
            .filter(|r| r.timestamp_ms > after_ms && r.timestamp_ms <= up_to_ms)
            .cloned()
            .collect()
    }

    /// Drops records older than the retention window. A purge that
    /// removed persisted records rewrites the backing file.
    ///
    /// # Errors
    ///
    /// [`NotifLogError`] if rewriting the backing file fails.
    pub fn purge_expired(&mut self, now_ms: i64) -> Result<usize, NotifLogError> {
        let retention_ms = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms.saturating_sub(retention_ms);
        let before = self.entries.len();
        self.entries.retain(|r| r.timestamp_ms >= cutoff);
        let purged = before - self.entries.len();
        if purged > 0 {
            self.rewrite()?;
        }
        Ok(purged)
    }

    /// Rewrites the backing file from the retained records.
    fn rewrite(&mut self) -> Result<(), NotifLogError> {
        let Some(path) = self.file_path.clone() else {
            return Ok(());
        };
        self.writer = None;
        let mut file = File::create(&path)?;
        file.write_all(&MAGIC)?;
        file.write_all(&[FORMAT_VERSION])?;
        for record in &self.entries {
            file.write_all(&encode(record)?)?;
        }
        file.sync_all()?;
        let file = OpenOptions::new().append(true).open(&path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
