//! Crash-safe JSONL append log, the persistence mechanism backing the
//! optional `JsonlMemoryRepository`. Kept as an illustrative second
//! `MemoryRepository` implementation alongside the in-memory default; the
//! core only depends on the trait, so nothing besides `crates/runtime`'s
//! wiring choice determines which one is active.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::domain::MemoryItem;
use crate::error::MemoryError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecordEvent {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub item: MemoryItem,
}

#[derive(Debug, Clone)]
pub struct MemoryEventLog {
    path: PathBuf,
}

impl MemoryEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, event: &MemoryRecordEvent) -> Result<(), MemoryError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(storage_err)?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(storage_err)?;
        let line = serde_json::to_string(event).map_err(|e| MemoryError::Storage(e.to_string()))?;
        file.write_all(line.as_bytes()).await.map_err(storage_err)?;
        file.write_all(b"\n").await.map_err(storage_err)?;
        file.flush().await.map_err(storage_err)?;
        file.sync_all().await.map_err(storage_err)?;
        Ok(())
    }

    /// Atomically replace the log: write to a `.tmp` sibling, fsync, rename
    /// over the original. A crash before the rename leaves the original
    /// untouched; a crash after leaves a consistent new file.
    pub async fn overwrite(&self, events: &[MemoryRecordEvent]) -> Result<(), MemoryError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(storage_err)?;
        }

        let tmp_path = {
            let filename = self.path.file_name().map(|f| f.to_string_lossy().to_string()).unwrap_or_else(|| "events.jsonl".to_string());
            self.path.with_file_name(format!("{filename}.tmp"))
        };

        let write_result: Result<(), MemoryError> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await
                .map_err(storage_err)?;
            for event in events {
                let line = serde_json::to_string(event).map_err(|e| MemoryError::Storage(e.to_string()))?;
                file.write_all(line.as_bytes()).await.map_err(storage_err)?;
                file.write_all(b"\n").await.map_err(storage_err)?;
            }
            file.flush().await.map_err(storage_err)?;
            file.sync_all().await.map_err(storage_err)?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(storage_err(err));
        }

        Ok(())
    }

    /// Parses the log line by line. A malformed line is routed to a
    /// `.jsonl.corrupt` sidecar and skipped rather than failing the whole
    /// load.
    pub async fn load(&self) -> Result<Vec<MemoryRecordEvent>, MemoryError> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let raw = tokio::fs::read_to_string(&self.path).await.map_err(storage_err)?;
        let mut events = Vec::new();
        let mut corrupt_count = 0usize;

        for (line_idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MemoryRecordEvent>(line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    corrupt_count += 1;
                    tracing::warn!(line = line_idx + 1, error = %err, path = %self.path.display(), "corrupt JSONL record, skipping");
                    let corrupt_path = self.path.with_extension("jsonl.corrupt");
                    if let Ok(mut bad) = tokio::fs::OpenOptions::new().create(true).append(true).open(&corrupt_path).await {
                        let _ = bad.write_all(line.as_bytes()).await;
                        let _ = bad.write_all(b"\n").await;
                    }
                }
            }
        }

        if corrupt_count > 0 {
            tracing::warn!(corrupt_lines = corrupt_count, path = %self.path.display(), "event log loaded with skipped corrupt lines");
        }

        Ok(events)
    }
}

fn storage_err(err: std::io::Error) -> MemoryError {
    MemoryError::Storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MemoryTier;

    #[tokio::test]
    async fn append_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("quill-event-log-test-{}", Uuid::new_v4()));
        let log = MemoryEventLog::new(dir.join("events.jsonl"));
        let item = MemoryItem::new(MemoryTier::Global, "a fact");
        log.append(&MemoryRecordEvent { event_id: Uuid::new_v4(), occurred_at: Utc::now(), item: item.clone() }).await.unwrap();

        let loaded = log.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].item.content, item.content);
        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn load_skips_corrupt_lines_without_failing() {
        let dir = std::env::temp_dir().join(format!("quill-event-log-corrupt-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("events.jsonl");
        tokio::fs::write(&path, b"not json\n").await.unwrap();

        let log = MemoryEventLog::new(&path);
        let loaded = log.load().await.unwrap();
        assert!(loaded.is_empty());
        assert!(tokio::fs::try_exists(path.with_extension("jsonl.corrupt")).await.unwrap());
        let _ = tokio::fs::remove_dir_all(dir).await;
    }
}
