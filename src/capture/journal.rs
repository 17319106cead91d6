use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// One line of a raw report log
#[derive(Debug, Serialize, Deserialize)]
pub struct LoggedReport {
    pub received_at: DateTime<Utc>,
    pub payload: String,
}

/// Append-only JSON lines log of raw report payloads, for later replay
pub struct ReportLog {
    file: File,
}

impl ReportLog {
    pub async fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .await
            .with_context(|| format!("Failed to create report log {}", path.display()))?;
        Ok(Self { file })
    }

    pub async fn append(&mut self, payload: &str) -> anyhow::Result<()> {
        let entry = LoggedReport {
            received_at: Utc::now(),
            payload: payload.to_string(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await?;
        Ok(())
    }
}

/// Read raw payloads back from a report log.
///
/// Lines that are not log entries are taken as raw payloads themselves, so a
/// file with one report body per line replays as well.
pub fn load_reports(path: impl AsRef<Path>) -> anyhow::Result<Vec<String>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read reports {}", path.display()))?;
    let payloads: Vec<String> = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match serde_json::from_str::<LoggedReport>(line) {
            Ok(entry) => entry.payload,
            Err(_) => line.to_string(),
        })
        .collect();
    debug!("Loaded {} reports from {}", payloads.len(), path.display());
    Ok(payloads)
}
