//! Copy-completion monitor.
//!
//! The replication process gives no completion signal, so completion is
//! inferred from an append-only log: count occurrences of a marker at start,
//! then poll until the count rises. Several historical runs may share one log,
//! so only an increase over the baseline counts, never an absolute value.
//!
//! The counter sits behind [`ProgressOracle`]; the polling and cancellation
//! logic does not know it is reading text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Default time between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Source of a monotonically increasing progress counter
#[async_trait]
pub trait ProgressOracle: Send + Sync {
    /// Current value of the counter
    async fn current_marker_count(&self) -> Result<u64>;

    /// Identity of the source, for logs and baselines
    fn describe(&self) -> String;
}

/// Counts marker occurrences in a log file.
#[derive(Debug, Clone)]
pub struct LogMarkerOracle {
    path: PathBuf,
    marker: String,
}

impl LogMarkerOracle {
    /// Watch `path` for `marker`
    pub fn new(path: impl Into<PathBuf>, marker: impl Into<String>) -> Result<Self> {
        let marker = marker.into();
        if marker.is_empty() {
            return Err(Error::config("completion marker must not be empty"));
        }
        // Matching is line by line.
        if marker.contains('\n') {
            return Err(Error::config("completion marker must not contain a newline"));
        }
        Ok(Self {
            path: path.into(),
            marker,
        })
    }

    /// Log file being watched
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ProgressOracle for LogMarkerOracle {
    async fn current_marker_count(&self) -> Result<u64> {
        let file = tokio::fs::File::open(&self.path).await?;
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        let mut count = 0u64;

        // Lines are read as bytes; log files are not guaranteed to be UTF-8.
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            count += String::from_utf8_lossy(&line).matches(&self.marker).count() as u64;
        }
        Ok(count)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Marker count captured when monitoring began
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionBaseline {
    /// Oracle identity (log path)
    pub source: String,
    /// Count at start
    pub count: u64,
    /// When the baseline was read
    pub captured_at: DateTime<Utc>,
}

/// How a wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The counter rose past the baseline
    Completed {
        /// Count at start
        baseline: u64,
        /// Count that ended the wait
        observed: u64,
        /// Polls performed
        polls: u64,
    },
    /// The caller cancelled
    Cancelled,
}

/// Polls a [`ProgressOracle`] until its counter exceeds a baseline.
///
/// If the copy finishes after the process starts but before [`start`] reads
/// the baseline, that completion is already counted and the wait never ends.
/// The monitor does not try to detect this; cancel the wait and recreate in
/// immediate mode instead.
///
/// [`start`]: CompletionMonitor::start
pub struct CompletionMonitor {
    oracle: Arc<dyn ProgressOracle>,
    poll_interval: Duration,
}

impl CompletionMonitor {
    /// Create a monitor polling `oracle` every `poll_interval`
    pub fn new(oracle: Arc<dyn ProgressOracle>, poll_interval: Duration) -> Self {
        Self {
            oracle,
            poll_interval,
        }
    }

    /// Poll interval in effect
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Read the baseline. Fails if the source cannot be read.
    pub async fn start(&self) -> Result<CompletionBaseline> {
        let count = self.oracle.current_marker_count().await?;
        let baseline = CompletionBaseline {
            source: self.oracle.describe(),
            count,
            captured_at: Utc::now(),
        };
        info!(source = %baseline.source, baseline = count, "captured completion baseline");
        Ok(baseline)
    }

    /// Poll until the count exceeds `baseline` or `cancel` fires.
    ///
    /// Unbounded. Failed reads are logged and the next poll proceeds.
    pub async fn wait_from(&self, baseline: &CompletionBaseline, cancel: &CancellationToken) -> WaitOutcome {
        let mut polls = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(source = %baseline.source, polls, "completion wait cancelled");
                    return WaitOutcome::Cancelled;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            polls += 1;
            match self.oracle.current_marker_count().await {
                Ok(observed) if observed > baseline.count => {
                    info!(
                        source = %baseline.source,
                        baseline = baseline.count,
                        observed,
                        polls,
                        "copy complete"
                    );
                    return WaitOutcome::Completed {
                        baseline: baseline.count,
                        observed,
                        polls,
                    };
                }
                Ok(observed) => {
                    debug!(source = %baseline.source, baseline = baseline.count, observed, polls, "copy still running");
                }
                Err(e) => {
                    warn!(source = %baseline.source, error = %e, polls, "could not read progress, will retry");
                }
            }
        }
    }

    /// Capture a baseline, then wait on it
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<WaitOutcome> {
        let baseline = self.start().await?;
        Ok(self.wait_from(&baseline, cancel).await)
    }
}
