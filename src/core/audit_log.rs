//! Append-only audit log with file-based persistence.
//!
//! Each request's trail is stored as newline-delimited JSON (JSONL) in its
//! own directory, so concurrent appends for different requests never contend.
//! The per-request sequence invariant is enforced with an optimistic check:
//! an append whose sequence is not strictly greater than the current maximum
//! is rejected with SequenceConflict.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::AuditEntry;

/// Errors that can occur appending to or reading the audit log
#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("sequence conflict for {request_id}: got {sequence}, current max {current_max}")]
    SequenceConflict {
        request_id: Uuid,
        sequence: u64,
        current_max: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Highest sequence seen for one request, lazily loaded from disk.
/// None means the trail has not been consulted yet.
type SequenceSlot = Arc<Mutex<Option<u64>>>;

/// File-based append-only audit log, one JSONL trail per request
pub struct AuditLog {
    /// Directory containing one subdirectory per request
    base_dir: PathBuf,

    /// Per-request append locks. The outer map lock is held only to fetch
    /// or insert a slot, never across I/O, so appends for different
    /// requests proceed in parallel.
    sequences: Mutex<HashMap<Uuid, SequenceSlot>>,
}

impl AuditLog {
    /// Open an audit log rooted at the given directory
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Directory holding a single request's trail
    fn request_dir(&self, request_id: Uuid) -> PathBuf {
        self.base_dir.join(request_id.to_string())
    }

    /// Path to a request's JSONL trail
    pub fn trail_path(&self, request_id: Uuid) -> PathBuf {
        self.request_dir(request_id).join("audit.jsonl")
    }

    /// Append an entry, enforcing the strictly-increasing sequence invariant.
    ///
    /// The check-then-append is atomic per request (each trail has its own
    /// lock); appends to different trails never contend.
    pub async fn append(&self, entry: &AuditEntry) -> Result<(), AuditLogError> {
        let slot = {
            let mut sequences = self.sequences.lock().await;
            sequences.entry(entry.request_id).or_default().clone()
        };

        let mut max = slot.lock().await;

        let current_max = match *max {
            Some(m) => Some(m),
            None => self.max_sequence_on_disk(entry.request_id).await?,
        };

        if let Some(m) = current_max {
            if entry.sequence <= m {
                *max = Some(m);
                return Err(AuditLogError::SequenceConflict {
                    request_id: entry.request_id,
                    sequence: entry.sequence,
                    current_max: m,
                });
            }
        }

        let dir = self.request_dir(entry.request_id);
        fs::create_dir_all(&dir).await?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.trail_path(entry.request_id))
            .await?;

        let json = serde_json::to_string(entry)?;
        file.write_all(format!("{}\n", json).as_bytes()).await?;
        file.flush().await?;

        *max = Some(entry.sequence);

        Ok(())
    }

    /// Read a request's full trail in sequence order
    pub async fn read(&self, request_id: Uuid) -> Result<Vec<AuditEntry>, AuditLogError> {
        self.read_from(request_id, 0).await
    }

    /// Read a request's trail starting at the given sequence number.
    ///
    /// Supports resuming a paused read: callers track the last sequence they
    /// saw and pass `last + 1`.
    pub async fn read_from(
        &self,
        request_id: Uuid,
        from_sequence: u64,
    ) -> Result<Vec<AuditEntry>, AuditLogError> {
        let path = self.trail_path(request_id);

        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut entries = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(&line)?;
            if entry.sequence >= from_sequence {
                entries.push(entry);
            }
        }

        Ok(entries)
    }

    /// True if any entries exist for the request
    pub async fn exists(&self, request_id: Uuid) -> bool {
        self.trail_path(request_id).exists()
    }

    /// List every request id with a trail on disk
    pub async fn list_requests(&self) -> Result<Vec<Uuid>, AuditLogError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut requests = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        requests.push(uuid);
                    }
                }
            }
        }

        Ok(requests)
    }

    /// Base directory of the log
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Highest sequence currently on disk for a request, if any
    async fn max_sequence_on_disk(
        &self,
        request_id: Uuid,
    ) -> Result<Option<u64>, AuditLogError> {
        let entries = self.read(request_id).await?;
        Ok(entries.iter().map(|e| e.sequence).max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AuditEventType;
    use tempfile::TempDir;

    fn entry(request_id: Uuid, sequence: u64, event_type: AuditEventType) -> AuditEntry {
        AuditEntry::new(request_id, sequence, event_type, serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::new(temp.path());
        let id = Uuid::new_v4();

        log.append(&entry(id, 0, AuditEventType::Created)).await.unwrap();
        log.append(&entry(id, 1, AuditEventType::TierEntered)).await.unwrap();
        log.append(&entry(id, 2, AuditEventType::TierTimeout)).await.unwrap();

        let entries = log.read(id).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].event_type, AuditEventType::Created);
        assert_eq!(entries[2].sequence, 2);
    }

    #[tokio::test]
    async fn test_sequence_conflict_rejected() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::new(temp.path());
        let id = Uuid::new_v4();

        log.append(&entry(id, 0, AuditEventType::Created)).await.unwrap();
        log.append(&entry(id, 1, AuditEventType::TierEntered)).await.unwrap();

        // Duplicate delivery of sequence 1
        let result = log.append(&entry(id, 1, AuditEventType::TierEntered)).await;
        assert!(matches!(
            result,
            Err(AuditLogError::SequenceConflict { current_max: 1, .. })
        ));

        // Stale sequence
        let result = log.append(&entry(id, 0, AuditEventType::Created)).await;
        assert!(matches!(result, Err(AuditLogError::SequenceConflict { .. })));

        // Trail is unchanged
        assert_eq!(log.read(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_conflict_check_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let id = Uuid::new_v4();

        {
            let log = AuditLog::new(temp.path());
            log.append(&entry(id, 0, AuditEventType::Created)).await.unwrap();
            log.append(&entry(id, 1, AuditEventType::TierEntered)).await.unwrap();
        }

        // Fresh handle must load the max from disk
        let log = AuditLog::new(temp.path());
        let result = log.append(&entry(id, 1, AuditEventType::TierEntered)).await;
        assert!(matches!(result, Err(AuditLogError::SequenceConflict { .. })));

        log.append(&entry(id, 2, AuditEventType::TierTimeout)).await.unwrap();
        assert_eq!(log.read(id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_read_from_resumes() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::new(temp.path());
        let id = Uuid::new_v4();

        for seq in 0..5 {
            log.append(&entry(id, seq, AuditEventType::SignalReceived)).await.unwrap();
        }

        let tail = log.read_from(id, 3).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence, 3);
        assert_eq!(tail[1].sequence, 4);
    }

    #[tokio::test]
    async fn test_concurrent_appends_to_distinct_trails() {
        let temp = TempDir::new().unwrap();
        let log = Arc::new(AuditLog::new(temp.path()));

        let mut writers = Vec::new();
        for _ in 0..8 {
            let id = Uuid::new_v4();
            let log = log.clone();
            writers.push(tokio::spawn(async move {
                for seq in 0..16 {
                    log.append(&entry(id, seq, AuditEventType::SignalReceived))
                        .await
                        .unwrap();
                }
                id
            }));
        }

        for writer in writers {
            let id = writer.await.unwrap();
            let entries = log.read(id).await.unwrap();
            assert_eq!(entries.len(), 16);
            for (i, e) in entries.iter().enumerate() {
                assert_eq!(e.sequence, i as u64);
            }
        }
    }

    #[tokio::test]
    async fn test_requests_are_isolated() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::new(temp.path());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        log.append(&entry(a, 0, AuditEventType::Created)).await.unwrap();
        log.append(&entry(b, 0, AuditEventType::Created)).await.unwrap();
        log.append(&entry(b, 1, AuditEventType::TierEntered)).await.unwrap();

        assert_eq!(log.read(a).await.unwrap().len(), 1);
        assert_eq!(log.read(b).await.unwrap().len(), 2);

        let mut listed = log.list_requests().await.unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);
    }
}
