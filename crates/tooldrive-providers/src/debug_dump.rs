//! Optional JSONL dump of raw streaming events for troubleshooting.

use std::path::PathBuf;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::warn;

const DEFAULT_PATH: &str = "./outputs/responses_stream_events.jsonl";

#[derive(Debug, Clone, Default)]
pub struct StreamDump {
    path: Option<PathBuf>,
}

impl StreamDump {
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn from_flag(enabled: bool) -> Self {
        if enabled {
            Self::to_path(PathBuf::from(DEFAULT_PATH))
        } else {
            Self::disabled()
        }
    }

    pub fn to_path(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Append one event. Failures are logged and otherwise ignored.
    pub async fn record(&self, event: &Value) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = append_line(path, &event.to_string()).await {
            warn!(path = %path.display(), %e, "Failed to write stream event dump");
        }
    }
}

async fn append_line(path: &PathBuf, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}
