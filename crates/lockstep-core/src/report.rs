//! Per-object outcomes and run reports.
//!
//! A report with no timed-out, fatal or skipped entries is the only "done"
//! signal. Anything else means the operator re-runs (timeouts) or intervenes.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::model::QualifiedName;

/// Terminal state of one bounded attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Statement applied and committed
    Succeeded,
    /// Target state already held; nothing was executed
    AlreadySatisfied,
    /// Lock wait budget ran out; rolled back, retry by re-running
    TimedOut,
    /// Non-transient failure; do not retry automatically
    Fatal {
        /// Error detail
        detail: String,
    },
    /// Not attempted because an earlier step for the same table failed
    Skipped {
        /// Why the attempt was skipped
        reason: String,
    },
}

impl Outcome {
    /// Create a fatal outcome
    pub fn fatal(detail: impl fmt::Display) -> Self {
        Self::Fatal {
            detail: detail.to_string(),
        }
    }

    /// Whether the target state holds after this attempt
    #[inline]
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Succeeded | Self::AlreadySatisfied)
    }

    /// Whether this is a fatal outcome
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Short label for tables and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::AlreadySatisfied => "already-satisfied",
            Self::TimedOut => "timed-out",
            Self::Fatal { .. } => "fatal",
            Self::Skipped { .. } => "skipped",
        }
    }

    /// Error detail or skip reason, if any
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Fatal { detail } => Some(detail),
            Self::Skipped { reason } => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{}: {}", self.label(), detail),
            None => f.write_str(self.label()),
        }
    }
}

/// What an attempt tried to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create the replication trigger
    AddTrigger,
    /// Drop the replication trigger
    DropTrigger,
    /// `ALTER TABLE .. DISABLE TRIGGER`
    DisableTrigger,
    /// `ALTER TABLE .. ENABLE ALWAYS TRIGGER`
    EnableAlwaysTrigger,
    /// Drop an index or unique constraint
    DropIndex,
    /// Recreate an index or unique constraint
    CreateIndex,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AddTrigger => "add-trigger",
            Self::DropTrigger => "drop-trigger",
            Self::DisableTrigger => "disable-trigger",
            Self::EnableAlwaysTrigger => "enable-always-trigger",
            Self::DropIndex => "drop-index",
            Self::CreateIndex => "create-index",
        };
        f.write_str(s)
    }
}

/// One bounded attempt on one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationAttempt {
    /// Table or sequence the attempt targeted
    pub object: QualifiedName,
    /// Trigger, index or constraint name within the object
    pub target: String,
    /// What was attempted
    pub operation: Operation,
    /// Lock wait budget the attempt ran under
    #[serde(with = "humantime_serde")]
    pub wait_budget: Duration,
    /// How it ended
    pub outcome: Outcome,
}

impl MutationAttempt {
    /// Emit the attempt at the level its outcome warrants
    pub fn log(&self) {
        let object = &self.object;
        let target = &self.target;
        let operation = self.operation;
        match &self.outcome {
            Outcome::Succeeded => info!(%object, %target, %operation, "succeeded"),
            Outcome::AlreadySatisfied => {
                debug!(%object, %target, %operation, "already satisfied")
            }
            Outcome::TimedOut => warn!(
                %object, %target, %operation, budget = ?self.wait_budget,
                "lock wait budget exceeded, re-run to retry"
            ),
            Outcome::Fatal { detail } => {
                error!(%object, %target, %operation, error = %detail, "attempt failed")
            }
            Outcome::Skipped { reason } => {
                warn!(%object, %target, %operation, reason = %reason, "skipped")
            }
        }
    }
}

/// Counts per outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    /// Applied in this run
    pub succeeded: usize,
    /// Already in the target state
    pub already_satisfied: usize,
    /// Lock wait budget exceeded
    pub timed_out: usize,
    /// Non-transient failures
    pub fatal: usize,
    /// Not attempted
    pub skipped: usize,
}

impl fmt::Display for ReportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} already satisfied, {} timed out, {} fatal, {} skipped",
            self.succeeded, self.already_satisfied, self.timed_out, self.fatal, self.skipped
        )
    }
}

/// Ordered outcomes of one engine invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Attempts in iteration order
    pub entries: Vec<MutationAttempt>,
}

impl RunReport {
    /// Create an empty report
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an attempt
    pub fn push(&mut self, attempt: MutationAttempt) {
        self.entries.push(attempt);
    }

    /// Append every entry of another report
    pub fn extend(&mut self, other: RunReport) {
        self.entries.extend(other.entries);
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the report is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Derived counts
    pub fn summary(&self) -> ReportSummary {
        let mut s = ReportSummary::default();
        for entry in &self.entries {
            match entry.outcome {
                Outcome::Succeeded => s.succeeded += 1,
                Outcome::AlreadySatisfied => s.already_satisfied += 1,
                Outcome::TimedOut => s.timed_out += 1,
                Outcome::Fatal { .. } => s.fatal += 1,
                Outcome::Skipped { .. } => s.skipped += 1,
            }
        }
        s
    }

    /// True when every object is in the target state
    pub fn is_converged(&self) -> bool {
        self.entries.iter().all(|e| e.outcome.is_satisfied())
    }

    /// Entries that need another run
    pub fn timed_out(&self) -> impl Iterator<Item = &MutationAttempt> {
        self.entries
            .iter()
            .filter(|e| e.outcome == Outcome::TimedOut)
    }

    /// Entries that need operator attention
    pub fn fatal(&self) -> impl Iterator<Item = &MutationAttempt> {
        self.entries.iter().filter(|e| e.outcome.is_fatal())
    }

    /// Outcome recorded for `object`, first match
    pub fn outcome_for(&self, object: &QualifiedName) -> Option<&Outcome> {
        self.entries
            .iter()
            .find(|e| &e.object == object)
            .map(|e| &e.outcome)
    }
}
