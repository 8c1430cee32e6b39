//! Structured, append-only NDJSON event stream for forensic replay (spec
//! §2 component 10, §6 "NDJSON event log").
//!
//! One JSON object per line: `seq`, `type`, `ts_ms` (monotonic), `hms`
//! (wall, human-readable), `msg`, and a kind-specific `data` object. This
//! is the log persistence degrades to when a SQLite write is retried to
//! exhaustion (spec §7), so it opens in append mode and never buffers more
//! than one line before a flush.
//!
//! The log rotates once it crosses `max_bytes`: the current file is renamed
//! aside with a wall-clock-millis suffix and a fresh file opens at the
//! original path, so a long-running bridge doesn't grow one unbounded file.
//! `seq` resets to 0 in the new file; `ts_ms`/`hms` on each record are
//! enough to reconstruct ordering across a rotation boundary.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use crate::error::PersistenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NdjsonRecordType {
    Event,
    Status,
    Debug,
}

impl NdjsonRecordType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Status => "status",
            Self::Debug => "debug",
        }
    }
}

#[derive(Serialize)]
struct NdjsonRecord {
    seq: u64,
    #[serde(rename = "type")]
    kind: &'static str,
    ts_ms: i64,
    hms: String,
    msg: String,
    data: Value,
}

struct WriterState {
    writer: BufWriter<File>,
    bytes_written: u64,
}

pub struct NdjsonLogger {
    path: PathBuf,
    max_bytes: u64,
    state: Mutex<WriterState>,
    seq: AtomicU64,
}

impl NdjsonLogger {
    /// `max_bytes == 0` disables rotation — the file grows without bound,
    /// matching the teacher's original single-file behavior for tests and
    /// any deployment that rotates externally (e.g. logrotate).
    pub async fn open(path: impl AsRef<Path>, max_bytes: u64) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let (file, bytes_written) = open_append(&path).await?;
        Ok(Self {
            path,
            max_bytes,
            state: Mutex::new(WriterState {
                writer: BufWriter::new(file),
                bytes_written,
            }),
            seq: AtomicU64::new(0),
        })
    }

    pub async fn log(&self, kind: NdjsonRecordType, ts_mono_ns: i64, msg: impl Into<String>, data: Value) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let record = NdjsonRecord {
            seq,
            kind: kind.as_str(),
            ts_ms: ts_mono_ns / 1_000_000,
            hms: Utc::now().format("%H:%M:%S%.3f").to_string(),
            msg: msg.into(),
            data,
        };
        let Ok(line) = serde_json::to_string(&record) else {
            return;
        };

        let mut state = self.state.lock().await;
        if self.max_bytes > 0 && state.bytes_written >= self.max_bytes {
            if let Err(err) = self.rotate(&mut state).await {
                tracing::warn!(error = %err, "NDJSON rotation failed, continuing on current file");
            } else {
                self.seq.store(0, Ordering::Relaxed);
            }
        }

        let written = line.len() + 1;
        if state.writer.write_all(line.as_bytes()).await.is_ok() {
            let _ = state.writer.write_all(b"\n").await;
            let _ = state.writer.flush().await;
            state.bytes_written += written as u64;
        }
    }

    async fn rotate(&self, state: &mut WriterState) -> Result<(), PersistenceError> {
        state.writer.flush().await.map_err(|e| PersistenceError::Sqlx(sqlx::Error::Io(e)))?;
        let rotated_name = format!(
            "{}.{}",
            self.path.file_name().and_then(|n| n.to_str()).unwrap_or("ndjson.log"),
            Utc::now().timestamp_millis()
        );
        let rotated_path = self.path.with_file_name(rotated_name);
        tokio::fs::rename(&self.path, &rotated_path)
            .await
            .map_err(|e| PersistenceError::Sqlx(sqlx::Error::Io(e)))?;
        let (file, bytes_written) = open_append(&self.path).await?;
        state.writer = BufWriter::new(file);
        state.bytes_written = bytes_written;
        Ok(())
    }
}

async fn open_append(path: &Path) -> Result<(File, u64), PersistenceError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| PersistenceError::Sqlx(sqlx::Error::Io(e)))?;
    let len = file
        .metadata()
        .await
        .map(|m| m.len())
        .map_err(|e| PersistenceError::Sqlx(sqlx::Error::Io(e)))?;
    Ok((file, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_one_json_object_per_line_with_increasing_seq() {
        let dir = std::env::temp_dir().join(format!("ndjson-test-{}", std::process::id()));
        let logger = NdjsonLogger::open(&dir, 0).await.unwrap();
        logger
            .log(NdjsonRecordType::Event, 1_000_000_000, "impact detected", serde_json::json!({"sensor": "s1"}))
            .await;
        logger
            .log(NdjsonRecordType::Status, 2_000_000_000, "reconnecting", serde_json::json!({}))
            .await;

        let content = tokio::fs::read_to_string(&dir).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["seq"], 0);
        assert_eq!(first["type"], "event");
        assert_eq!(first["ts_ms"], 1000);

        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["seq"], 1);
        assert_eq!(second["type"], "status");

        let _ = tokio::fs::remove_file(&dir).await;
    }

    #[tokio::test]
    async fn crossing_max_bytes_rotates_to_a_suffixed_file_and_resets_seq() {
        let dir = std::env::temp_dir().join(format!("ndjson-rotate-test-{}", std::process::id()));
        let _ = tokio::fs::remove_file(&dir).await;
        let logger = NdjsonLogger::open(&dir, 1).await.unwrap();

        logger.log(NdjsonRecordType::Event, 0, "first", serde_json::json!({})).await;
        logger.log(NdjsonRecordType::Event, 0, "second", serde_json::json!({})).await;

        let current = tokio::fs::read_to_string(&dir).await.unwrap();
        let current_lines: Vec<&str> = current.lines().collect();
        assert_eq!(current_lines.len(), 1, "rotation should have left only the newest record in the live file");
        let record: Value = serde_json::from_str(current_lines[0]).unwrap();
        assert_eq!(record["seq"], 0, "seq resets after rotation");
        assert_eq!(record["msg"], "second");

        let mut rotated_found = false;
        let mut entries = tokio::fs::read_dir(dir.parent().unwrap()).await.unwrap();
        let prefix = dir.file_name().unwrap().to_str().unwrap().to_string();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().into_string().unwrap_or_default();
            if name.starts_with(&format!("{prefix}.")) {
                rotated_found = true;
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        assert!(rotated_found, "expected a rotated archive file next to the live log");

        let _ = tokio::fs::remove_file(&dir).await;
    }
}
