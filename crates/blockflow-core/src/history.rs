//! RunHistoryWriter — JSONL append-only log of progress events.
//!
//! Storage path: `<workspace>/.blockflow/runs/{day}/run-{run_id}.jsonl`
//!
//! One file per run, so a failed run's trail can be read back in order.
//! Write failures are logged and never interrupt execution.

use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::events::ProgressEvent;

#[derive(Debug, Clone)]
pub struct RunHistoryWriter {
    /// Base directory for run files (e.g., "/project/.blockflow/runs")
    base_dir: PathBuf,
}

impl RunHistoryWriter {
    /// History is stored in `<workspace_root>/.blockflow/runs/`.
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            base_dir: workspace_root.as_ref().join(".blockflow").join("runs"),
        }
    }

    pub fn with_base_dir(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// File holding `run_id`'s events when written today.
    pub fn run_file(&self, run_id: &str) -> PathBuf {
        let today = Local::now().format("%Y-%m-%d").to_string();
        self.base_dir.join(today).join(format!("run-{}.jsonl", run_id))
    }

    pub async fn append(&self, event: &ProgressEvent) -> Result<(), HistoryWriteError> {
        let path = self.run_file(&event.run_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| HistoryWriteError::Io(format!("Failed to create history dir: {}", e)))?;
        }

        let mut line = serde_json::to_string(event)
            .map_err(|e| HistoryWriteError::Serialization(e.to_string()))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| HistoryWriteError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| HistoryWriteError::Io(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| HistoryWriteError::Io(e.to_string()))?;
        Ok(())
    }

    /// Append, logging errors instead of returning them.
    pub async fn append_safe(&self, event: &ProgressEvent) {
        if let Err(e) = self.append(event).await {
            tracing::warn!("[History] Failed to write run event: {}", e);
        }
    }

    /// Read every event of a run file back, skipping malformed lines.
    pub async fn read_run(path: impl AsRef<Path>) -> Result<Vec<ProgressEvent>, HistoryWriteError> {
        let content = fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| HistoryWriteError::Io(e.to_string()))?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryWriteError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}
