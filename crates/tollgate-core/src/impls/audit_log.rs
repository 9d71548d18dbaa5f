//! Audit log sinks.
//!
//! Records are only ever appended. `JsonlAuditLog` writes one complete JSON
//! line per record with a single `write_all` under a mutex, so a reader
//! tailing the file never sees a torn or rewritten entry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::domain::{AuditEvent, AuditEventKind, AuditRecord, GatewayError, TaskId};
use crate::ports::AuditSink;

/// Keeps every record in memory. Used by tests and as the status feed.
#[derive(Default)]
pub struct InMemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }

    pub async fn by_kind(&self, kind: AuditEventKind) -> Vec<AuditRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.kind() == kind)
            .cloned()
            .collect()
    }

    pub async fn for_task(&self, task_id: TaskId) -> Vec<AuditRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.task_id() == Some(task_id))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn append(&self, event: AuditEvent) -> Result<AuditRecord, GatewayError> {
        let mut records = self.records.lock().await;
        let record = AuditRecord {
            seq: records.len() as u64 + 1,
            event,
        };
        records.push(record.clone());
        Ok(record)
    }
}

struct JsonlWriter {
    file: File,
    next_seq: u64,
}

/// Append-only JSON Lines file.
pub struct JsonlAuditLog {
    path: PathBuf,
    writer: Mutex<JsonlWriter>,
}

impl JsonlAuditLog {
    /// Opens (or creates) the log. Sequence numbers continue after the last
    /// record already in the file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| audit_io(&path, e))?;
        }

        let last_seq = match tokio::fs::try_exists(&path).await {
            Ok(true) => Self::read_all(&path)
                .await?
                .last()
                .map(|r| r.seq)
                .unwrap_or(0),
            Ok(false) => 0,
            Err(e) => return Err(audit_io(&path, e)),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| audit_io(&path, e))?;

        tracing::info!(path = %path.display(), last_seq, "audit log opened");
        Ok(Self {
            path,
            writer: Mutex::new(JsonlWriter {
                file,
                next_seq: last_seq + 1,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every record in the file. Blank lines are skipped; a line that
    /// does not parse is an error.
    pub async fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>, GatewayError> {
        let path = path.as_ref();
        let file = File::open(path).await.map_err(|e| audit_io(path, e))?;
        let mut lines = BufReader::new(file).lines();
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await.map_err(|e| audit_io(path, e))? {
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line).map_err(|e| {
                GatewayError::Audit(format!("{}: malformed record: {e}", path.display()))
            })?;
            out.push(record);
        }
        Ok(out)
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn append(&self, event: AuditEvent) -> Result<AuditRecord, GatewayError> {
        let mut writer = self.writer.lock().await;
        let record = AuditRecord {
            seq: writer.next_seq,
            event,
        };
        let mut line = serde_json::to_vec(&record)
            .map_err(|e| GatewayError::Audit(format!("serialize: {e}")))?;
        line.push(b'\n');

        writer
            .file
            .write_all(&line)
            .await
            .map_err(|e| audit_io(&self.path, e))?;
        writer
            .file
            .flush()
            .await
            .map_err(|e| audit_io(&self.path, e))?;

        // only consume the sequence number once the line is on disk
        writer.next_seq += 1;
        Ok(record)
    }
}

fn audit_io(path: &Path, err: std::io::Error) -> GatewayError {
    GatewayError::Audit(format!("{}: {err}", path.display()))
}

/// Writes each event to every sink in order and returns the first sink's
/// record. Fails on the first sink that fails.
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AuditSink for FanoutAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<AuditRecord, GatewayError> {
        let mut first = None;
        for sink in &self.sinks {
            let record = sink.append(event.clone()).await?;
            first.get_or_insert(record);
        }
        first.ok_or_else(|| GatewayError::Audit("no audit sinks configured".to_string()))
    }
}
