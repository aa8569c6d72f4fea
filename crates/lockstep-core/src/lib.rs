//! # lockstep-core
//!
//! Schema mutation under live replication.
//!
//! Adding a capture trigger or dropping an index needs an exclusive lock on a
//! table that application traffic keeps busy. lockstep never queues behind that
//! traffic for long: every mutation is one attempt under a short lock wait
//! budget, and whatever did not get its lock is reported so the operator can
//! simply run again.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │TriggerEngine │   │ IndexManager │──▶│  SnapshotStore   │
//! └──────┬───────┘   └──────┬───────┘   └──────────────────┘
//!        │                  │      ▲
//!        ▼                  ▼      │ waits on
//! ┌──────────────────────────────┐ │ ┌──────────────────┐
//! │ ObjectCatalog │ BoundedExecutor │ │CompletionMonitor │
//! └──────────────────────────────┘   └──────────────────┘
//!        │                                    │
//!        ▼                                    ▼
//!   lockstep-rdbc                       ProgressOracle
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lockstep_core::prelude::*;
//!
//! let catalog = Arc::new(PgCatalog::new(conn.clone()));
//! let objects = catalog.discover_objects(&config.replication.objects).await?;
//!
//! let engine = TriggerEngine::new(
//!     catalog,
//!     BoundedExecutor::new(conn),
//!     config.trigger_spec()?,
//!     config.retry.timeout,
//! );
//! let report = engine.run(&objects, TriggerOperation::Add).await;
//! if !report.is_converged() {
//!     // run again later
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod indexes;
pub mod model;
pub mod monitor;
pub mod report;
pub mod size;
pub mod snapshot_store;
pub mod testing;
pub mod triggers;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::catalog::{IndexDefinition, IndexKind, ObjectCatalog, PgCatalog, TriggerState};
    pub use crate::config::LockstepConfig;
    pub use crate::error::{Error, Result};
    pub use crate::executor::BoundedExecutor;
    pub use crate::indexes::{recreate_after_copy, DropReport, IndexManager, IndexSettings, RecreateReport};
    pub use crate::model::{ObjectFilter, ObjectKind, QualifiedName, ReplicationObject};
    pub use crate::monitor::{CompletionMonitor, LogMarkerOracle, ProgressOracle, WaitOutcome};
    pub use crate::report::{MutationAttempt, Operation, Outcome, RunReport};
    pub use crate::snapshot_store::{IndexRecord, MemorySnapshotStore, PgSnapshotStore, SnapshotStore};
    pub use crate::triggers::{ToggleMode, TriggerEngine, TriggerOperation, TriggerSpec};
    pub use std::sync::Arc;
}

pub use error::{Error, Result};
