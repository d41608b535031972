//! Append-only JSONL transcript of the conversation.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::Config;
use crate::error::{Result, ToolDriveError};
use crate::message::{Message, masked_for_log};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub ts: DateTime<Utc>,
    pub message: Message,
}

/// Writes every history message, with secrets masked, one JSON object per line.
#[derive(Debug, Clone)]
pub struct TranscriptLog {
    path: PathBuf,
}

impl TranscriptLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `UAGENT_LOG_FILE` if set, else `<log dir>/tooldrive_log_<timestamp>.jsonl`.
    pub fn from_config(config: &Config) -> Self {
        let path = config.log_file().unwrap_or_else(|| {
            let stamp = Utc::now().format("%Y%m%d_%H%M%S");
            config.log_dir().join(format!("tooldrive_log_{stamp}.jsonl"))
        });
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, message: &Message) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let entry = TranscriptEntry {
            ts: Utc::now(),
            message: masked_for_log(message),
        };
        let line = serde_json::to_string(&entry)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        debug!(path = %self.path.display(), role = message.role.as_str(), "Transcript entry written");
        Ok(())
    }

    pub async fn load(&self) -> Result<Vec<TranscriptEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&self.path).await?;
        data.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|e| ToolDriveError::Config(format!("corrupt transcript line: {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::ToolCallResult;

    #[tokio::test]
    async fn test_append_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let log = TranscriptLog::new(dir.path().join("nested").join("log.jsonl"));

        log.append(&Message::user("hello")).await.unwrap();
        log.append(&Message::assistant("hi there", vec![])).await.unwrap();

        let entries = log.load().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message.text(), "hello");
        assert_eq!(entries[1].message.text(), "hi there");
    }

    #[tokio::test]
    async fn test_secret_replies_are_masked_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let log = TranscriptLog::new(dir.path().join("log.jsonl"));

        let payload = json!({
            "tool": "human_ask",
            "message": "API token?",
            "user_reply": "tok-123",
            "display_reply": "[SECRET]",
            "cancelled": false,
        });
        let msg = Message::tool(
            ToolCallResult {
                call_id: "call_1".into(),
                text: payload.to_string(),
            },
            "human_ask",
        );
        log.append(&msg).await.unwrap();

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert!(!raw.contains("tok-123"));
        assert!(raw.contains("********"));
    }

    #[test]
    fn test_from_config_prefers_log_file() {
        let mut config = Config::default();
        config
            .apply_env_with(|name| match name {
                "UAGENT_LOG_FILE" => Some("/tmp/td/explicit.jsonl".to_string()),
                _ => None,
            })
            .unwrap();
        let log = TranscriptLog::from_config(&config);
        assert_eq!(log.path(), Path::new("/tmp/td/explicit.jsonl"));

        let mut config = Config::default();
        config
            .apply_env_with(|name| match name {
                "UAGENT_LOG_DIR" => Some("/tmp/td-logs".to_string()),
                _ => None,
            })
            .unwrap();
        let log = TranscriptLog::from_config(&config);
        assert!(log.path().starts_with("/tmp/td-logs"));
        assert!(
            log.path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("tooldrive_log_")
        );
    }
}
