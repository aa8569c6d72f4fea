//! Behaviour tests for the index lifecycle manager

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use lockstep_core::catalog::{IndexDefinition, IndexKind};
use lockstep_core::error::{Error, Result};
use lockstep_core::executor::BoundedExecutor;
use lockstep_core::indexes::{recreate_after_copy, IndexManager, IndexSettings};
use lockstep_core::model::{QualifiedName, ReplicationObject};
use lockstep_core::monitor::CompletionMonitor;
use lockstep_core::report::Outcome;
use lockstep_core::snapshot_store::{IndexRecord, MemorySnapshotStore, SnapshotStore};
use lockstep_core::testing::{FakeDatabase, ScriptedOracle};
use lockstep_rdbc::connection::Connection;

const GB: u64 = 1_000_000_000;
const JOB: &str = "app_migration";

fn orders() -> QualifiedName {
    QualifiedName::new("public", "orders")
}

fn definitions() -> Vec<IndexDefinition> {
    let t = orders();
    vec![
        IndexDefinition::index(
            t.clone(),
            "orders_pkey",
            "CREATE UNIQUE INDEX orders_pkey ON public.orders USING btree (id)",
            0,
        )
        .primary(),
        IndexDefinition::index(
            t.clone(),
            "orders_created_idx",
            "CREATE INDEX orders_created_idx ON public.orders USING btree (created_at)",
            0,
        ),
        IndexDefinition::index(
            t.clone(),
            "orders_customer_idx",
            "CREATE INDEX orders_customer_idx ON public.orders USING btree (customer_id)",
            0,
        ),
        IndexDefinition::unique_constraint(t, "orders_ref_key", "UNIQUE (external_ref)", 0),
    ]
}

/// Source and target with identical schemas; orders is 20 GB on the source.
fn databases() -> (Arc<FakeDatabase>, Arc<FakeDatabase>) {
    let source = Arc::new(FakeDatabase::new());
    let target = Arc::new(FakeDatabase::new());
    source.add_table(orders(), &["id"], 20 * GB);
    target.add_table(orders(), &["id"], 0);
    for def in definitions() {
        source.add_index(def.clone());
        target.add_index(def);
    }
    (source, target)
}

fn manager(
    source: &Arc<FakeDatabase>,
    target: &Arc<FakeDatabase>,
    store: Arc<dyn SnapshotStore>,
) -> IndexManager {
    IndexManager::new(
        source.clone(),
        target.clone(),
        BoundedExecutor::new(target.clone()),
        store,
        IndexSettings {
            threshold_bytes: 10 * GB,
            admin_timeout: Duration::from_secs(600),
            include_unique_constraints: true,
        },
    )
}

fn objects() -> Vec<ReplicationObject> {
    vec![ReplicationObject::table(orders(), vec!["id".into()])]
}

/// Store that silently loses every save after the first `keep`.
struct LossyStore {
    inner: MemorySnapshotStore,
    keep: usize,
    saves: AtomicUsize,
}

#[async_trait]
impl SnapshotStore for LossyStore {
    async fn install(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self, record: &IndexRecord) -> Result<()> {
        if self.saves.fetch_add(1, Ordering::SeqCst) < self.keep {
            self.inner.save(record).await?;
        }
        Ok(())
    }

    async fn list_for(&self, job_tag: &str) -> Result<Vec<IndexRecord>> {
        self.inner.list_for(job_tag).await
    }

    async fn count_for_table(&self, job_tag: &str, table: &QualifiedName) -> Result<usize> {
        self.inner.count_for_table(job_tag, table).await
    }

    async fn consume(&self, record: &IndexRecord) -> Result<()> {
        self.inner.consume(record).await
    }
}

#[tokio::test]
async fn test_snapshot_gate_blocks_every_drop() {
    let (source, target) = databases();
    let store = Arc::new(LossyStore {
        inner: MemorySnapshotStore::new(),
        keep: 2,
        saves: AtomicUsize::new(0),
    });

    let result = manager(&source, &target, store)
        .drop_indexes(JOB, &objects())
        .await
        .unwrap();

    assert!(result.aborted());
    assert_eq!(result.mismatches.len(), 1);
    assert_eq!(result.mismatches[0].discovered, 3);
    assert_eq!(result.mismatches[0].stored, 2);
    assert!(result.report.is_empty());
    assert!(target.statements().is_empty());
    assert!(target.is_live(&orders(), "orders_created_idx", IndexKind::Index));
}

#[tokio::test]
async fn test_drop_then_recreate_round_trip() {
    let (source, target) = databases();
    let store = Arc::new(MemorySnapshotStore::new());
    let manager = manager(&source, &target, store.clone());

    let dropped = manager.drop_indexes(JOB, &objects()).await.unwrap();
    assert!(dropped.is_converged());
    assert_eq!(dropped.report.summary().succeeded, 3);
    assert!(!target.is_live(&orders(), "orders_created_idx", IndexKind::Index));
    assert!(!target.is_live(&orders(), "orders_ref_key", IndexKind::Constraint));
    assert!(target.is_live(&orders(), "orders_pkey", IndexKind::Index));
    assert!(manager.verify_dropped(JOB).await.unwrap().is_empty());
    assert_eq!(store.pending(JOB).await.unwrap().len(), 3);

    let recreated = manager.recreate(JOB).await.unwrap();
    assert!(recreated.is_converged());
    assert_eq!(recreated.report.summary().succeeded, 3);
    assert!(target.is_live(&orders(), "orders_created_idx", IndexKind::Index));
    assert!(target.is_live(&orders(), "orders_ref_key", IndexKind::Constraint));
    assert!(store.pending(JOB).await.unwrap().is_empty());
    assert_eq!(
        target.statements_matching("CREATE INDEX orders_created_idx"),
        ["CREATE INDEX orders_created_idx ON public.orders USING btree (created_at)"]
    );

    // Nothing left to do.
    let again = manager.recreate(JOB).await.unwrap();
    assert!(again.report.is_empty());
    assert!(again.is_converged());
}

#[tokio::test]
async fn test_recreating_a_live_index_is_a_no_op() {
    let (source, target) = databases();
    let store = Arc::new(MemorySnapshotStore::new());
    let manager = manager(&source, &target, store.clone());
    manager.drop_indexes(JOB, &objects()).await.unwrap();

    // Rebuilt by hand before recreate ran.
    target
        .execute(
            "CREATE INDEX orders_created_idx ON public.orders USING btree (created_at)",
            &[],
        )
        .await
        .unwrap();
    let creates_before = target.statements_matching("orders_created_idx").len();

    let report = manager.recreate(JOB).await.unwrap();

    let entry = report
        .report
        .entries
        .iter()
        .find(|e| e.target == "orders_created_idx")
        .unwrap();
    assert_eq!(entry.outcome, Outcome::AlreadySatisfied);
    assert_eq!(
        target.statements_matching("orders_created_idx").len(),
        creates_before
    );
    assert!(store.pending(JOB).await.unwrap().is_empty());
    assert!(report.is_converged());
}

#[tokio::test]
async fn test_timed_out_drop_converges_on_rerun() {
    let (source, target) = databases();
    target.fail_with_lock_timeout("orders_customer_idx", 1);
    let manager = manager(&source, &target, Arc::new(MemorySnapshotStore::new()));

    let first = manager.drop_indexes(JOB, &objects()).await.unwrap();
    assert_eq!(first.report.timed_out().count(), 1);
    assert!(!first.is_converged());
    let still_live = manager.verify_dropped(JOB).await.unwrap();
    assert_eq!(still_live.len(), 1);
    assert_eq!(still_live[0].index_name, "orders_customer_idx");

    let second = manager.drop_indexes(JOB, &objects()).await.unwrap();
    assert!(second.is_converged());
    assert_eq!(second.report.summary().succeeded, 1);
    assert_eq!(second.report.summary().already_satisfied, 2);
}

#[tokio::test]
async fn test_small_tables_are_left_alone() {
    let (source, target) = databases();
    let manager = IndexManager::new(
        source.clone(),
        target.clone(),
        BoundedExecutor::new(target.clone()),
        Arc::new(MemorySnapshotStore::new()),
        IndexSettings {
            threshold_bytes: 20 * GB,
            ..IndexSettings::default()
        },
    );

    let result = manager.drop_indexes(JOB, &objects()).await.unwrap();
    assert!(result.report.is_empty());
    assert!(result.is_converged());
    assert!(target.statements().is_empty());
}

#[tokio::test]
async fn test_job_tags_are_isolated() {
    let (source, target) = databases();
    let store = Arc::new(MemorySnapshotStore::new());
    let manager = manager(&source, &target, store.clone());
    manager.drop_indexes(JOB, &objects()).await.unwrap();

    let other = manager.recreate("other_job").await.unwrap();
    assert!(other.report.is_empty());
    assert!(!target.is_live(&orders(), "orders_created_idx", IndexKind::Index));
    assert_eq!(store.pending(JOB).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_index_lost_after_recreate_is_reported() {
    let (source, target) = databases();
    let store = Arc::new(MemorySnapshotStore::new());
    let manager = manager(&source, &target, store.clone());
    manager.drop_indexes(JOB, &objects()).await.unwrap();
    assert!(manager.recreate(JOB).await.unwrap().is_converged());

    // Someone drops it again by hand after it was rebuilt.
    let lost = store
        .list_for(JOB)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.index_name == "orders_customer_idx")
        .unwrap();
    target.execute(&lost.drop_ddl, &[]).await.unwrap();

    let again = manager.recreate(JOB).await.unwrap();
    assert!(again.report.is_empty());
    assert_eq!(again.orphaned.len(), 1);
    assert_eq!(again.orphaned[0].index_name, "orders_customer_idx");
    assert!(again.orphaned[0].is_consumed());
    assert!(!again.is_converged());

    let missing = manager.verify_recreated(JOB).await.unwrap();
    assert_eq!(missing, again.orphaned);
    assert!(!target.is_live(&orders(), "orders_customer_idx", IndexKind::Index));
}

#[tokio::test]
async fn test_deferred_recreate_connects_after_copy() {
    let (source, target) = databases();
    let store = Arc::new(MemorySnapshotStore::new());
    manager(&source, &target, store.clone())
        .drop_indexes(JOB, &objects())
        .await
        .unwrap();

    let oracle = Arc::new(ScriptedOracle::new([2, 2, 2, 3]));
    let monitor = CompletionMonitor::new(oracle.clone(), Duration::from_millis(5));
    let reads_at_connect = AtomicUsize::new(0);

    let counter = &reads_at_connect;
    let watched = oracle.clone();
    let report = recreate_after_copy(JOB, &monitor, &CancellationToken::new(), move || async move {
        counter.store(watched.reads(), Ordering::SeqCst);
        Ok::<_, Error>(manager(&source, &target, store))
    })
    .await
    .unwrap();

    assert_eq!(reads_at_connect.load(Ordering::SeqCst), 4);
    assert!(report.is_converged());
    assert_eq!(report.report.len(), 3);
}

#[tokio::test]
async fn test_cancelled_wait_never_connects() {
    let (source, target) = databases();
    let store = Arc::new(MemorySnapshotStore::new());
    manager(&source, &target, store.clone())
        .drop_indexes(JOB, &objects())
        .await
        .unwrap();
    let statements_before = target.statements().len();

    let monitor = CompletionMonitor::new(
        Arc::new(ScriptedOracle::new([5])),
        Duration::from_secs(3600),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();
    let connected = AtomicBool::new(false);

    let flag = &connected;
    let (src, tgt, st) = (source.clone(), target.clone(), store.clone());
    let result = recreate_after_copy(JOB, &monitor, &cancel, move || async move {
        flag.store(true, Ordering::SeqCst);
        Ok::<_, Error>(manager(&src, &tgt, st))
    })
    .await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(!connected.load(Ordering::SeqCst));
    assert_eq!(target.statements().len(), statements_before);
    assert_eq!(store.pending(JOB).await.unwrap().len(), 3);
}
