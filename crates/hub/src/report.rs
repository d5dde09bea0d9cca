//! Error side channel. Errors are reported and then handed back unchanged so
//! callers can still propagate them.

use std::future::Future;
use std::path::PathBuf;

use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

use crate::state::SharedState;

pub trait ErrorReporter: Clone + Send + Sync + 'static {
    /// Record `err` and return it unmodified.
    fn report(&self, err: anyhow::Error) -> impl Future<Output = anyhow::Error> + Send;
}

/// Logs through `tracing`, records an error event for the status API and,
/// when configured, appends a line to an error log file.
#[derive(Clone)]
pub struct StatusReporter {
    shared: SharedState,
    log_path: Option<PathBuf>,
}

impl StatusReporter {
    pub fn new(shared: SharedState, log_path: Option<PathBuf>) -> Self {
        Self { shared, log_path }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        f.write_all(line.as_bytes()).await?;
        f.flush().await
    }
}

impl ErrorReporter for StatusReporter {
    async fn report(&self, err: anyhow::Error) -> anyhow::Error {
        let msg = format!("{err:#}");
        error!("{msg}");
        self.shared.write().await.record_error(msg.clone());

        let line = format!("{} {msg}\n", OffsetDateTime::now_utc());
        if let Err(e) = self.append(&line).await {
            warn!("error log append failed: {e}");
        }
        err
    }
}
