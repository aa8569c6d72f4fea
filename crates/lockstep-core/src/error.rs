//! Error types for lockstep-core
//!
//! Component-level failures are folded into run reports as outcomes. This type
//! covers what cannot be: configuration problems, an unreadable baseline, a
//! snapshot that does not match discovery, and database errors raised outside
//! a bounded attempt.

use thiserror::Error;

/// Result type for lockstep-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for lockstep-core
#[derive(Error, Debug)]
pub enum Error {
    /// Database error from the connectivity layer
    #[error(transparent)]
    Rdbc(#[from] lockstep_rdbc::Error),

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Snapshot store disagrees with discovery; nothing was dropped
    #[error(
        "snapshot mismatch on {table}: discovered {discovered} eligible index(es), store holds {stored}"
    )]
    Consistency {
        /// Qualified table name
        table: String,
        /// Eligible indexes found in this pass
        discovered: usize,
        /// Records present in the store for the same table and job tag
        stored: usize,
    },

    /// A trigger-bearing operation was requested on a table without a primary key
    #[error("{object} has no primary key")]
    MissingPrimaryKey {
        /// Qualified object name
        object: String,
    },

    /// Marking a snapshot record consumed did not hit exactly one record
    #[error("{matched} snapshot record(s) matched {table} index {index} for job {job_tag}, expected 1")]
    UnmatchedRecord {
        /// Qualified table name
        table: String,
        /// Index or constraint name
        index: String,
        /// Job tag the record was filed under
        job_tag: String,
        /// Records the update touched
        matched: u64,
    },

    /// I/O error (log reads, config files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller cancelled a wait
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn unmatched(record: &crate::snapshot_store::IndexRecord, matched: u64) -> Self {
        Self::UnmatchedRecord {
            table: record.table.to_string(),
            index: record.index_name.clone(),
            job_tag: record.job_tag.clone(),
            matched,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether the underlying database error was a lock wait timeout
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::Rdbc(e) if e.is_lock_timeout())
    }
}
