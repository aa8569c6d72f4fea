//! Index lifecycle manager.
//!
//! Large indexes slow a bulk copy into the target, so they are taken down for
//! its duration and rebuilt afterwards. Definitions are read from the source
//! database (where table sizes are meaningful) and executed against the target.
//!
//! Dropping is a three-phase pipeline with a gate between phases 2 and 3:
//!
//! 1. **Discover** eligible indexes per table: not primary-key or
//!    constraint-backing, owning table larger than the threshold.
//! 2. **Snapshot** every eligible definition to the store, then compare the
//!    store's per-table count with discovery. Any mismatch aborts the whole
//!    job before a single drop.
//! 3. **Drop** each record under the administrative lock budget. A fatal drop
//!    stops the remaining drops on that table only.
//!
//! Recreation runs every unconsumed record's create statement and marks it
//! consumed, optionally after waiting for the copy to complete.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::{IndexDefinition, IndexKind, ObjectCatalog};
use crate::error::{Error, Result};
use crate::executor::BoundedExecutor;
use crate::model::{QualifiedName, ReplicationObject};
use crate::monitor::{CompletionMonitor, WaitOutcome};
use crate::report::{MutationAttempt, Operation, Outcome, RunReport};
use crate::snapshot_store::{IndexRecord, SnapshotStore};

/// Tunables for the index manager
#[derive(Debug, Clone)]
pub struct IndexSettings {
    /// Only tables strictly larger than this many bytes are considered
    pub threshold_bytes: u64,
    /// Lock wait budget for each drop and create
    pub admin_timeout: Duration,
    /// Also take down unique constraints
    pub include_unique_constraints: bool,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            threshold_bytes: 10_000_000_000,
            admin_timeout: Duration::from_secs(600),
            include_unique_constraints: true,
        }
    }
}

/// Eligible definitions on one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TablePlan {
    /// Owning table
    pub table: QualifiedName,
    /// Eligible indexes and constraints, sorted by name
    pub definitions: Vec<IndexDefinition>,
}

/// Snapshot count that disagreed with discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotMismatch {
    /// Owning table
    pub table: QualifiedName,
    /// Eligible definitions found in this pass
    pub discovered: usize,
    /// Records the store holds for the table
    pub stored: usize,
}

impl From<&SnapshotMismatch> for Error {
    fn from(m: &SnapshotMismatch) -> Self {
        Error::Consistency {
            table: m.table.to_string(),
            discovered: m.discovered,
            stored: m.stored,
        }
    }
}

/// Result of a drop run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DropReport {
    /// Per-index outcomes; empty when the gate tripped
    pub report: RunReport,
    /// Tables whose snapshot did not match discovery
    pub mismatches: Vec<SnapshotMismatch>,
}

impl DropReport {
    /// Whether the snapshot gate stopped the run
    pub fn aborted(&self) -> bool {
        !self.mismatches.is_empty()
    }

    /// Every eligible index is gone from the target
    pub fn is_converged(&self) -> bool {
        !self.aborted() && self.report.is_converged()
    }
}

/// Result of a recreate run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecreateReport {
    /// Per-index outcomes
    pub report: RunReport,
    /// Consumed records whose index is not live on the target
    pub orphaned: Vec<IndexRecord>,
}

impl RecreateReport {
    /// Every recorded index is live again
    pub fn is_converged(&self) -> bool {
        self.report.is_converged() && self.orphaned.is_empty()
    }
}

/// Drops and recreates large indexes around a bulk copy.
pub struct IndexManager {
    source: Arc<dyn ObjectCatalog>,
    target: Arc<dyn ObjectCatalog>,
    executor: BoundedExecutor,
    store: Arc<dyn SnapshotStore>,
    settings: IndexSettings,
}

impl IndexManager {
    /// Create a manager. `executor` must run against the database `target` reads.
    pub fn new(
        source: Arc<dyn ObjectCatalog>,
        target: Arc<dyn ObjectCatalog>,
        executor: BoundedExecutor,
        store: Arc<dyn SnapshotStore>,
        settings: IndexSettings,
    ) -> Self {
        Self {
            source,
            target,
            executor,
            store,
            settings,
        }
    }

    /// Settings in effect
    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    fn is_eligible(&self, def: &IndexDefinition) -> bool {
        def.is_removable()
            && def.table_bytes > self.settings.threshold_bytes
            && (def.kind == IndexKind::Index || self.settings.include_unique_constraints)
    }

    /// Phase 1: eligible definitions per table, tables in (schema, name) order.
    ///
    /// Tables with nothing eligible are omitted.
    pub async fn discover(&self, objects: &[ReplicationObject]) -> Result<Vec<TablePlan>> {
        let mut tables: Vec<&QualifiedName> = objects
            .iter()
            .filter(|o| o.is_table())
            .map(|o| &o.name)
            .collect();
        tables.sort();
        tables.dedup();

        let mut plans = Vec::new();
        for table in tables {
            let definitions: Vec<IndexDefinition> = self
                .source
                .table_indexes(table)
                .await?
                .into_iter()
                .filter(|d| self.is_eligible(d))
                .collect();

            if definitions.is_empty() {
                info!(%table, "no large indexes or unique constraints");
                continue;
            }
            info!(%table, eligible = definitions.len(), "found indexes to drop");
            plans.push(TablePlan {
                table: table.clone(),
                definitions,
            });
        }
        Ok(plans)
    }

    /// Phase 2: persist every planned definition, then check the per-table counts.
    pub async fn snapshot(&self, job_tag: &str, plans: &[TablePlan]) -> Result<Vec<SnapshotMismatch>> {
        let mut mismatches = Vec::new();
        for plan in plans {
            for def in &plan.definitions {
                self.store.save(&IndexRecord::from_definition(def, job_tag)).await?;
            }

            let stored = self.store.count_for_table(job_tag, &plan.table).await?;
            let discovered = plan.definitions.len();
            if stored == discovered {
                info!(table = %plan.table, job_tag, stored, "definitions backed up");
            } else {
                let mismatch = SnapshotMismatch {
                    table: plan.table.clone(),
                    discovered,
                    stored,
                };
                error!(error = %Error::from(&mismatch), job_tag, "snapshot does not match discovery");
                mismatches.push(mismatch);
            }
        }
        Ok(mismatches)
    }

    /// Run all three phases for `objects` under `job_tag`.
    ///
    /// Store and discovery failures abort with an error before any drop. A
    /// tripped snapshot gate returns a report with mismatches and no attempts.
    pub async fn drop_indexes(&self, job_tag: &str, objects: &[ReplicationObject]) -> Result<DropReport> {
        let plans = self.discover(objects).await?;
        if plans.is_empty() {
            info!(job_tag, "nothing to drop");
            return Ok(DropReport::default());
        }

        let mismatches = self.snapshot(job_tag, &plans).await?;
        if !mismatches.is_empty() {
            error!(
                job_tag,
                tables = mismatches.len(),
                "aborting without dropping indexes"
            );
            return Ok(DropReport {
                report: RunReport::new(),
                mismatches,
            });
        }

        let mut report = RunReport::new();
        for plan in &plans {
            report.extend(self.drop_table(job_tag, plan).await);
        }

        info!(job_tag, summary = %report.summary(), "index drop finished");
        Ok(DropReport {
            report,
            mismatches: Vec::new(),
        })
    }

    async fn drop_table(&self, job_tag: &str, plan: &TablePlan) -> RunReport {
        let mut report = RunReport::new();
        let mut failed: Option<String> = None;

        for def in &plan.definitions {
            let record = IndexRecord::from_definition(def, job_tag);
            let outcome = match &failed {
                Some(name) => Outcome::Skipped {
                    reason: format!("drop of {} failed on this table", name),
                },
                None => self.drop_one(&record).await,
            };
            if outcome.is_fatal() {
                failed = Some(record.index_name.clone());
            }
            report.push(self.attempt_record(&record, Operation::DropIndex, outcome));
        }
        report
    }

    async fn drop_one(&self, record: &IndexRecord) -> Outcome {
        match self
            .target
            .index_exists(&record.table, &record.index_name, record.kind)
            .await
        {
            Ok(false) => Outcome::AlreadySatisfied,
            Ok(true) => {
                self.executor
                    .attempt(&record.drop_ddl, self.settings.admin_timeout)
                    .await
            }
            Err(e) => Outcome::fatal(e),
        }
    }

    /// Recreate every unconsumed record for `job_tag`.
    pub async fn recreate(&self, job_tag: &str) -> Result<RecreateReport> {
        let pending = self.store.pending(job_tag).await?;
        info!(job_tag, pending = pending.len(), "recreating indexes");

        let mut report = RunReport::new();
        for record in &pending {
            let outcome = self.recreate_one(record).await;
            report.push(self.attempt_record(record, Operation::CreateIndex, outcome));
        }

        let orphaned = self.verify_recreated(job_tag).await?;
        for record in &orphaned {
            warn!(
                table = %record.table,
                index = %record.index_name,
                job_tag,
                "record consumed but index is not live"
            );
        }

        info!(job_tag, summary = %report.summary(), orphaned = orphaned.len(), "index recreate finished");
        Ok(RecreateReport { report, orphaned })
    }

    async fn recreate_one(&self, record: &IndexRecord) -> Outcome {
        let outcome = match self
            .target
            .index_exists(&record.table, &record.index_name, record.kind)
            .await
        {
            Ok(true) => Outcome::AlreadySatisfied,
            Ok(false) => {
                self.executor
                    .attempt(&record.create_ddl, self.settings.admin_timeout)
                    .await
            }
            Err(e) => return Outcome::fatal(e),
        };

        if outcome.is_satisfied() {
            if let Err(e) = self.store.consume(record).await {
                return Outcome::fatal(format!("index is live but record was not marked consumed: {}", e));
            }
        }
        outcome
    }

    /// Unconsumed records whose index is still live on the target.
    pub async fn verify_dropped(&self, job_tag: &str) -> Result<Vec<IndexRecord>> {
        let mut still_live = Vec::new();
        for record in self.store.pending(job_tag).await? {
            if self
                .target
                .index_exists(&record.table, &record.index_name, record.kind)
                .await?
            {
                still_live.push(record);
            }
        }
        Ok(still_live)
    }

    /// Consumed records whose index is not live on the target.
    pub async fn verify_recreated(&self, job_tag: &str) -> Result<Vec<IndexRecord>> {
        let mut missing = Vec::new();
        for record in self.store.list_for(job_tag).await? {
            if !record.is_consumed() {
                continue;
            }
            if !self
                .target
                .index_exists(&record.table, &record.index_name, record.kind)
                .await?
            {
                missing.push(record);
            }
        }
        Ok(missing)
    }

    fn attempt_record(&self, record: &IndexRecord, operation: Operation, outcome: Outcome) -> MutationAttempt {
        let attempt = MutationAttempt {
            object: record.table.clone(),
            target: record.index_name.clone(),
            operation,
            wait_budget: self.settings.admin_timeout,
            outcome,
        };
        attempt.log();
        attempt
    }
}

/// Wait for the copy to complete, then recreate with the manager `connect` builds.
///
/// `connect` runs only once the monitor has signalled completion, so no
/// database session is open during the wait. A cancelled wait returns
/// [`Error::Cancelled`] without calling it.
pub async fn recreate_after_copy<F, Fut, E>(
    job_tag: &str,
    monitor: &CompletionMonitor,
    cancel: &CancellationToken,
    connect: F,
) -> std::result::Result<RecreateReport, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<IndexManager, E>>,
    E: From<Error>,
{
    info!(job_tag, "waiting for copy to complete before recreating indexes");
    match monitor.wait(cancel).await? {
        WaitOutcome::Completed { .. } => {}
        WaitOutcome::Cancelled => return Err(Error::Cancelled.into()),
    }

    let manager = connect().await?;
    Ok(manager.recreate(job_tag).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot_store::MemorySnapshotStore;
    use crate::testing::FakeDatabase;

    const GB: u64 = 1_000_000_000;

    fn manager(db: &Arc<FakeDatabase>, threshold_bytes: u64, include_unique_constraints: bool) -> IndexManager {
        IndexManager::new(
            db.clone(),
            db.clone(),
            BoundedExecutor::new(db.clone()),
            Arc::new(MemorySnapshotStore::new()),
            IndexSettings {
                threshold_bytes,
                admin_timeout: Duration::from_secs(5),
                include_unique_constraints,
            },
        )
    }

    fn orders_db(bytes: u64) -> (Arc<FakeDatabase>, QualifiedName) {
        let db = Arc::new(FakeDatabase::new());
        let orders = QualifiedName::new("public", "orders");
        db.add_table(orders.clone(), &["id"], bytes);
        db.add_index(
            IndexDefinition::index(orders.clone(), "orders_pkey", "CREATE UNIQUE INDEX orders_pkey ON public.orders USING btree (id)", bytes)
                .primary(),
        );
        db.add_index(IndexDefinition::index(
            orders.clone(),
            "orders_created_idx",
            "CREATE INDEX orders_created_idx ON public.orders USING btree (created_at)",
            bytes,
        ));
        db.add_index(IndexDefinition::unique_constraint(
            orders.clone(),
            "orders_ref_key",
            "UNIQUE (external_ref)",
            bytes,
        ));
        db.add_index(
            IndexDefinition::index(
                orders.clone(),
                "orders_ref_key",
                "CREATE UNIQUE INDEX orders_ref_key ON public.orders USING btree (external_ref)",
                bytes,
            )
            .backing_constraint(),
        );
        (db, orders)
    }

    #[tokio::test]
    async fn test_discovery_skips_primary_and_backing_indexes() {
        let (db, orders) = orders_db(20 * GB);
        let objects = [ReplicationObject::table(orders, vec!["id".into()])];

        let plans = manager(&db, 10 * GB, true).discover(&objects).await.unwrap();
        assert_eq!(plans.len(), 1);
        let names: Vec<(&str, IndexKind)> = plans[0]
            .definitions
            .iter()
            .map(|d| (d.name.as_str(), d.kind))
            .collect();
        assert_eq!(
            names,
            [
                ("orders_created_idx", IndexKind::Index),
                ("orders_ref_key", IndexKind::Constraint)
            ]
        );

        let without_constraints = manager(&db, 10 * GB, false).discover(&objects).await.unwrap();
        assert_eq!(without_constraints[0].definitions.len(), 1);
    }

    #[tokio::test]
    async fn test_threshold_is_strict() {
        let (db, orders) = orders_db(10 * GB);
        let objects = [ReplicationObject::table(orders, vec!["id".into()])];

        assert!(manager(&db, 10 * GB, true).discover(&objects).await.unwrap().is_empty());
        assert_eq!(manager(&db, 10 * GB - 1, true).discover(&objects).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_drop_skips_rest_of_table() {
        let (db, orders) = orders_db(20 * GB);
        db.fail_with_sqlstate("DROP INDEX", "42501", "must be owner of index orders_created_idx");
        let objects = [ReplicationObject::table(orders, vec!["id".into()])];

        let result = manager(&db, GB, true).drop_indexes("job1", &objects).await.unwrap();
        let labels: Vec<&str> = result.report.entries.iter().map(|e| e.outcome.label()).collect();
        assert_eq!(labels, ["fatal", "skipped"]);
        assert!(!result.is_converged());
    }
}
