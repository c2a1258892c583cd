//! Outward-facing collaborators: progress persistence and attempt logging.
//!
//! Neither call is awaited by the engine. Implementations that do slow work
//! hand it off (see [`ChannelRecorder`]).

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use practice_types::{AttemptRecord, PracticeItem};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Receives the terminal status of each practice item.
pub trait ProgressSink: Send + Sync {
    fn persist_item(&self, item: &PracticeItem);
}

/// Receives every scored attempt. Fire-and-forget.
pub trait AttemptRecorder: Send + Sync {
    fn record_attempt(&self, attempt: AttemptRecord);
}

pub struct NullCollaborators;

impl ProgressSink for NullCollaborators {
    fn persist_item(&self, _item: &PracticeItem) {}
}

impl AttemptRecorder for NullCollaborators {
    fn record_attempt(&self, _attempt: AttemptRecord) {}
}

/// Writes everything to the tracing log.
pub struct LogCollaborators;

impl ProgressSink for LogCollaborators {
    fn persist_item(&self, item: &PracticeItem) {
        info!(
            "Progress: '{}' -> {:?} after {} attempt(s)",
            item.target,
            item.status,
            item.attempts.len()
        );
    }
}

impl AttemptRecorder for LogCollaborators {
    fn record_attempt(&self, attempt: AttemptRecord) {
        info!(
            "Attempt: '{}' heard as '{}' (score {:.2}, success: {})",
            attempt.target, attempt.recognized, attempt.score, attempt.is_successful
        );
    }
}

/// Keeps everything in memory. Clones share storage.
#[derive(Clone, Default)]
pub struct RecordingCollaborators {
    items: Arc<Mutex<Vec<PracticeItem>>>,
    attempts: Arc<Mutex<Vec<AttemptRecord>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordingCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persisted(&self) -> Vec<PracticeItem> {
        lock(&self.items).clone()
    }

    pub fn attempts(&self) -> Vec<AttemptRecord> {
        lock(&self.attempts).clone()
    }
}

impl ProgressSink for RecordingCollaborators {
    fn persist_item(&self, item: &PracticeItem) {
        lock(&self.items).push(item.clone());
    }
}

impl AttemptRecorder for RecordingCollaborators {
    fn record_attempt(&self, attempt: AttemptRecord) {
        lock(&self.attempts).push(attempt);
    }
}

/// Forwards attempts to a background task. Attempts sent after the task
/// has gone away are dropped.
#[derive(Clone)]
pub struct ChannelRecorder {
    tx: mpsc::UnboundedSender<AttemptRecord>,
}

impl ChannelRecorder {
    pub fn new(tx: mpsc::UnboundedSender<AttemptRecord>) -> Self {
        Self { tx }
    }

    /// Append attempts as JSON lines to `path` from a spawned task. The task
    /// finishes once every recorder clone has been dropped.
    pub fn spawn_json_lines(path: PathBuf) -> (Self, JoinHandle<Result<()>>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<AttemptRecord>();

        let handle = tokio::spawn(async move {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .with_context(|| format!("Failed to open attempt log {}", path.display()))?;

            while let Some(attempt) = rx.recv().await {
                let mut line = serde_json::to_string(&attempt)?;
                line.push('\n');
                file.write_all(line.as_bytes()).await?;
            }
            file.flush().await?;
            Ok(())
        });

        (Self::new(tx), handle)
    }
}

impl AttemptRecorder for ChannelRecorder {
    fn record_attempt(&self, attempt: AttemptRecord) {
        if self.tx.send(attempt).is_err() {
            warn!("Attempt recorder is gone, dropping attempt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use practice_types::{ItemStatus, ScoreResult};

    fn attempt(target: &str, heard: &str, score: f64) -> AttemptRecord {
        AttemptRecord::new(
            target,
            heard,
            ScoreResult {
                score,
                is_successful: score >= 0.6,
            },
        )
    }

    #[test]
    fn test_recording_clones_share_storage() {
        let recording = RecordingCollaborators::new();
        let sink: Arc<dyn ProgressSink> = Arc::new(recording.clone());
        let recorder: Arc<dyn AttemptRecorder> = Arc::new(recording.clone());

        let mut item = PracticeItem::new("elma");
        item.status = ItemStatus::Success;
        sink.persist_item(&item);
        recorder.record_attempt(attempt("elma", "elma", 1.0));

        assert_eq!(recording.persisted(), vec![item]);
        assert_eq!(recording.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_recorder_ignores_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = ChannelRecorder::new(tx);
        drop(rx);

        recorder.record_attempt(attempt("top", "pop", 0.67));
    }

    #[tokio::test]
    async fn test_json_lines_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attempts.jsonl");

        let (recorder, handle) = ChannelRecorder::spawn_json_lines(path.clone());
        recorder.record_attempt(attempt("kedi", "kedi", 1.0));
        recorder.record_attempt(attempt("kedi", "kuzu", 0.25));
        drop(recorder);
        handle.await.unwrap().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<AttemptRecord> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].recognized, "kuzu");
        assert!(!lines[1].is_successful);
    }
}
