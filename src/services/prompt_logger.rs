//! Fire-and-forget prompt logging sink.
//!
//! Handlers enqueue one record per completed request; a background task
//! drains the channel to a JSONL file. Logging never blocks or fails a
//! request: when the channel is full the record is dropped with a warning.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::core::families::ModelFamily;

const CHANNEL_CAPACITY: usize = 1_000;

/// One logged request/response pair.
#[derive(Debug, Clone, Serialize)]
pub struct PromptLogEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub model: String,
    pub family: ModelFamily,
    /// Inbound prompt: a message list or a raw prompt string, verbatim.
    pub prompt: Value,
    pub response: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Clone)]
pub struct PromptLogger {
    tx: Option<mpsc::Sender<PromptLogEntry>>,
}

impl PromptLogger {
    /// A logger that drops everything; used when prompt logging is off.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Start the drain task writing to `path` and return the sending half.
    pub fn start(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, mut rx) = mpsc::channel::<PromptLogEntry>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            if let Some(parent) = path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    tracing::error!(error = %e, "cannot create prompt log directory");
                    return;
                }
            }
            let file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    tracing::error!(error = %e, path = %path.display(), "cannot open prompt log");
                    return;
                }
            };
            let mut writer = tokio::io::BufWriter::new(file);

            while let Some(entry) = rx.recv().await {
                match serde_json::to_string(&entry) {
                    Ok(mut line) => {
                        line.push('\n');
                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            tracing::error!(error = %e, "prompt log write failed");
                        }
                        let _ = writer.flush().await;
                    }
                    Err(e) => tracing::error!(error = %e, "prompt log serialization failed"),
                }
            }
        });

        Self { tx: Some(tx) }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Enqueue a record. Never blocks; drops on overflow.
    pub fn log(&self, entry: PromptLogEntry) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(entry) {
                tracing::warn!(error = %e, "prompt log queue full, dropping record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(request_id: &str) -> PromptLogEntry {
        PromptLogEntry {
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
            model: "gpt-4".to_string(),
            family: ModelFamily::Gpt4,
            prompt: json!([{"role": "user", "content": "hi"}]),
            response: "hello".to_string(),
            prompt_tokens: 10,
            completion_tokens: 2,
        }
    }

    #[test]
    fn test_disabled_logger_accepts_silently() {
        let logger = PromptLogger::disabled();
        assert!(!logger.is_enabled());
        logger.log(entry("r1"));
    }

    #[tokio::test]
    async fn test_entries_written_as_jsonl() {
        let dir = std::env::temp_dir().join(format!("prompt-log-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("prompts.jsonl");
        let logger = PromptLogger::start(&path);
        assert!(logger.is_enabled());

        logger.log(entry("r1"));
        logger.log(entry("r2"));

        // Give the drain task a moment to write.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["request_id"], "r1");
        assert_eq!(first["family"], "gpt4");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
