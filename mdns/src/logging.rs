//! Structured mDNS event logging: a non-blocking background writer,
//! generalized from `hr_dns::logging::QueryLogger`'s
//! `mpsc::UnboundedSender<String>` + background-file-writer pattern to
//! mDNS lifecycle events instead of per-query DNS log lines.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct EventLogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub detail: String,
}

/// Handle to the background writer; cheap to clone, safe to share across
/// every component that wants to emit structured events.
#[derive(Clone)]
pub struct EventLogger {
    sender: mpsc::UnboundedSender<String>,
}

impl EventLogger {
    /// Spawns the background writer task appending newline-delimited JSON
    /// to `path`. Logging failures are themselves logged via `tracing` and
    /// otherwise swallowed; a broken event log must never back-pressure the
    /// engine.
    pub fn spawn(path: PathBuf) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let file = OpenOptions::new().create(true).append(true).open(&path).await;
            let mut file = match file {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "failed to open mdns event log");
                    return;
                }
            };
            while let Some(line) = receiver.recv().await {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!(error = %e, "failed to write mdns event log line");
                }
            }
        });
        Self { sender }
    }

    pub fn log(&self, kind: impl Into<String>, detail: impl Into<String>) {
        let entry = EventLogEntry {
            timestamp: Utc::now(),
            kind: kind.into(),
            detail: detail.into(),
        };
        match serde_json::to_string(&entry) {
            Ok(mut line) => {
                line.push('\n');
                let _ = self.sender.send(line);
            }
            Err(e) => warn!(error = %e, "failed to serialize mdns event log entry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logs_newline_delimited_json() {
        let dir = std::env::temp_dir().join(format!("mdns-event-log-test-{:?}", std::thread::current().id()));
        let logger = EventLogger::spawn(dir.clone());
        logger.log("announce", "My Printer._http._tcp.local.");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let contents = tokio::fs::read_to_string(&dir).await.unwrap_or_default();
        assert!(contents.contains("\"kind\":\"announce\""));
        let _ = tokio::fs::remove_file(&dir).await;
    }
}
