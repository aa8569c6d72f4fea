//! # Index Snapshot Store
//!
//! Durable copies of index definitions taken before they are dropped, so they
//! can be recreated after a restart. Records are keyed by
//! `(schema, index name, job tag)`; the job tag keeps concurrent jobs that share
//! one metadata database apart.
//!
//! Recreation marks a record consumed instead of deleting it, leaving an audit
//! trail of what was dropped and when it came back.
//!
//! | Store | Use Case |
//! |-------|----------|
//! | `MemorySnapshotStore` | Testing |
//! | `PgSnapshotStore` | Dedicated metadata database |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use lockstep_rdbc::connection::Connection;
use lockstep_rdbc::security::{quote_qualified, validate_qualified_identifier};
use lockstep_rdbc::types::{Row, Value};

use crate::catalog::{IndexDefinition, IndexKind};
use crate::error::{Error, Result};
use crate::model::QualifiedName;

/// Default location of the snapshot table
pub const DEFAULT_SNAPSHOT_TABLE: &str = "lockstep.index_snapshots";

/// One index or unique constraint taken down temporarily.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Owning table
    pub table: QualifiedName,
    /// Index or constraint name
    pub index_name: String,
    /// Plain index or unique constraint
    pub kind: IndexKind,
    /// Statement that recreates it
    pub create_ddl: String,
    /// Statement that removes it
    pub drop_ddl: String,
    /// Job this record belongs to
    pub job_tag: String,
    /// Owning table size in bytes at discovery
    pub table_bytes: u64,
    /// Set once recreation has run
    pub consumed_at: Option<DateTime<Utc>>,
}

impl IndexRecord {
    /// Record for `definition` under `job_tag`
    pub fn from_definition(definition: &IndexDefinition, job_tag: &str) -> Self {
        Self {
            table: definition.table.clone(),
            index_name: definition.name.clone(),
            kind: definition.kind,
            create_ddl: definition.create_ddl.clone(),
            drop_ddl: definition.drop_ddl.clone(),
            job_tag: job_tag.to_string(),
            table_bytes: definition.table_bytes,
            consumed_at: None,
        }
    }

    /// Schema the index lives in
    #[inline]
    pub fn schema(&self) -> &str {
        &self.table.schema
    }

    /// Whether recreation has consumed this record
    #[inline]
    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    fn key(&self) -> (String, String, String) {
        (
            self.table.schema.clone(),
            self.index_name.clone(),
            self.job_tag.clone(),
        )
    }
}

/// Persistence for index records.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Create backing storage if missing. Idempotent.
    async fn install(&self) -> Result<()>;

    /// Upsert by `(schema, index name, job tag)`; a saved record is unconsumed.
    async fn save(&self, record: &IndexRecord) -> Result<()>;

    /// Every record for `job_tag`, consumed or not, ordered by table then name
    async fn list_for(&self, job_tag: &str) -> Result<Vec<IndexRecord>>;

    /// Number of records held for `table` under `job_tag`
    async fn count_for_table(&self, job_tag: &str, table: &QualifiedName) -> Result<usize>;

    /// Mark `record` as used by recreation. Fails when the store does not hold it.
    async fn consume(&self, record: &IndexRecord) -> Result<()>;

    /// Records for `job_tag` not yet consumed
    async fn pending(&self, job_tag: &str) -> Result<Vec<IndexRecord>> {
        Ok(self
            .list_for(job_tag)
            .await?
            .into_iter()
            .filter(|r| !r.is_consumed())
            .collect())
    }
}

fn sort_records(records: &mut [IndexRecord]) {
    records.sort_by(|a, b| {
        a.table
            .cmp(&b.table)
            .then_with(|| a.index_name.cmp(&b.index_name))
    });
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory snapshot store for testing.
#[derive(Default)]
pub struct MemorySnapshotStore {
    records: RwLock<BTreeMap<(String, String, String), IndexRecord>>,
}

impl MemorySnapshotStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn install(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self, record: &IndexRecord) -> Result<()> {
        let mut record = record.clone();
        record.consumed_at = None;
        self.records.write().await.insert(record.key(), record);
        Ok(())
    }

    async fn list_for(&self, job_tag: &str) -> Result<Vec<IndexRecord>> {
        let mut records: Vec<IndexRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.job_tag == job_tag)
            .cloned()
            .collect();
        sort_records(&mut records);
        Ok(records)
    }

    async fn count_for_table(&self, job_tag: &str, table: &QualifiedName) -> Result<usize> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.job_tag == job_tag && &r.table == table)
            .count())
    }

    async fn consume(&self, record: &IndexRecord) -> Result<()> {
        match self.records.write().await.get_mut(&record.key()) {
            Some(stored) => {
                stored.consumed_at = Some(Utc::now());
                Ok(())
            }
            None => Err(Error::unmatched(record, 0)),
        }
    }
}

// ============================================================================
// PostgreSQL store
// ============================================================================

/// Snapshot store backed by a table in the metadata database.
///
/// # Table Schema
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS lockstep.index_snapshots (
///     schema_name TEXT NOT NULL,
///     table_name TEXT NOT NULL,
///     index_name TEXT NOT NULL,
///     kind TEXT NOT NULL,
///     create_ddl TEXT NOT NULL,
///     drop_ddl TEXT NOT NULL,
///     job_tag TEXT NOT NULL,
///     table_bytes BIGINT NOT NULL,
///     saved_at TIMESTAMPTZ NOT NULL DEFAULT now(),
///     consumed_at TIMESTAMPTZ,
///     PRIMARY KEY (schema_name, index_name, job_tag)
/// );
/// ```
pub struct PgSnapshotStore {
    conn: Arc<dyn Connection>,
    schema: String,
    table: String,
}

impl PgSnapshotStore {
    /// Create a store writing to `table` (`schema.table`)
    pub fn new(conn: Arc<dyn Connection>, table: &str) -> Result<Self> {
        let (schema, name) = validate_qualified_identifier(table)
            .map_err(|e| Error::config(format!("snapshot_table: {}", e)))?;
        Ok(Self {
            conn,
            schema: schema.to_string(),
            table: name.to_string(),
        })
    }

    fn qualified(&self) -> String {
        quote_qualified(&self.schema, &self.table)
    }

    fn row_to_record(row: &Row) -> Result<IndexRecord> {
        let kind_str = row.try_str("kind")?;
        let kind = IndexKind::parse(kind_str)
            .ok_or_else(|| Error::config(format!("unknown index kind '{}' in snapshot table", kind_str)))?;

        Ok(IndexRecord {
            table: QualifiedName::new(row.try_str("schema_name")?, row.try_str("table_name")?),
            index_name: row.try_str("index_name")?.to_string(),
            kind,
            create_ddl: row.try_str("create_ddl")?.to_string(),
            drop_ddl: row.try_str("drop_ddl")?.to_string(),
            job_tag: row.try_str("job_tag")?.to_string(),
            table_bytes: row.try_i64("table_bytes")?.max(0) as u64,
            consumed_at: row.opt_datetime("consumed_at"),
        })
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn install(&self) -> Result<()> {
        let create_schema = format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            lockstep_rdbc::security::quote_identifier(&self.schema)
        );
        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                schema_name TEXT NOT NULL,
                table_name TEXT NOT NULL,
                index_name TEXT NOT NULL,
                kind TEXT NOT NULL,
                create_ddl TEXT NOT NULL,
                drop_ddl TEXT NOT NULL,
                job_tag TEXT NOT NULL,
                table_bytes BIGINT NOT NULL,
                saved_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                consumed_at TIMESTAMPTZ,
                PRIMARY KEY (schema_name, index_name, job_tag)
            )
            "#,
            self.qualified()
        );

        self.conn.execute(&create_schema, &[]).await?;
        self.conn.execute(&create_table, &[]).await?;

        info!(table = %self.qualified(), "snapshot table installed");
        Ok(())
    }

    async fn save(&self, record: &IndexRecord) -> Result<()> {
        let query = format!(
            r#"
            INSERT INTO {} (schema_name, table_name, index_name, kind, create_ddl, drop_ddl, job_tag, table_bytes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (schema_name, index_name, job_tag)
            DO UPDATE SET
                table_name = EXCLUDED.table_name,
                kind = EXCLUDED.kind,
                create_ddl = EXCLUDED.create_ddl,
                drop_ddl = EXCLUDED.drop_ddl,
                table_bytes = EXCLUDED.table_bytes,
                saved_at = now(),
                consumed_at = NULL
            "#,
            self.qualified()
        );

        self.conn
            .execute(
                &query,
                &[
                    Value::from(record.table.schema.as_str()),
                    Value::from(record.table.name.as_str()),
                    Value::from(record.index_name.as_str()),
                    Value::from(record.kind.as_str()),
                    Value::from(record.create_ddl.as_str()),
                    Value::from(record.drop_ddl.as_str()),
                    Value::from(record.job_tag.as_str()),
                    Value::Int64(i64::try_from(record.table_bytes).unwrap_or(i64::MAX)),
                ],
            )
            .await?;

        debug!(table = %record.table, index = %record.index_name, job_tag = %record.job_tag, "saved index record");
        Ok(())
    }

    async fn list_for(&self, job_tag: &str) -> Result<Vec<IndexRecord>> {
        let query = format!(
            r#"
            SELECT schema_name, table_name, index_name, kind, create_ddl, drop_ddl, job_tag, table_bytes, consumed_at
            FROM {}
            WHERE job_tag = $1
            "#,
            self.qualified()
        );

        let rows = self.conn.query(&query, &[Value::from(job_tag)]).await?;
        let mut records = rows
            .iter()
            .map(Self::row_to_record)
            .collect::<Result<Vec<_>>>()?;
        sort_records(&mut records);
        Ok(records)
    }

    async fn count_for_table(&self, job_tag: &str, table: &QualifiedName) -> Result<usize> {
        let query = format!(
            "SELECT COUNT(*) AS stored FROM {} WHERE job_tag = $1 AND schema_name = $2 AND table_name = $3",
            self.qualified()
        );

        let row = self
            .conn
            .query_one(
                &query,
                &[
                    Value::from(job_tag),
                    Value::from(table.schema.as_str()),
                    Value::from(table.name.as_str()),
                ],
            )
            .await?;

        let stored = match row {
            Some(row) => row.try_i64("stored")?,
            None => 0,
        };
        Ok(stored.max(0) as usize)
    }

    async fn consume(&self, record: &IndexRecord) -> Result<()> {
        let query = format!(
            "UPDATE {} SET consumed_at = now() WHERE schema_name = $1 AND index_name = $2 AND job_tag = $3",
            self.qualified()
        );

        let matched = self
            .conn
            .execute(
                &query,
                &[
                    Value::from(record.table.schema.as_str()),
                    Value::from(record.index_name.as_str()),
                    Value::from(record.job_tag.as_str()),
                ],
            )
            .await?;
        if matched != 1 {
            return Err(Error::unmatched(record, matched));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(table: &str, index: &str, tag: &str) -> IndexRecord {
        IndexRecord::from_definition(
            &IndexDefinition::index(
                QualifiedName::new("public", table),
                index,
                format!("CREATE INDEX {} ON public.{} (id)", index, table),
                1 << 30,
            ),
            tag,
        )
    }

    #[tokio::test]
    async fn test_memory_store_upsert_and_partitioning() {
        let store = MemorySnapshotStore::new();
        store.save(&record("orders", "orders_a", "job1")).await.unwrap();
        store.save(&record("orders", "orders_a", "job1")).await.unwrap();
        store.save(&record("orders", "orders_b", "job1")).await.unwrap();
        store.save(&record("orders", "orders_a", "job2")).await.unwrap();

        let orders = QualifiedName::new("public", "orders");
        assert_eq!(store.count_for_table("job1", &orders).await.unwrap(), 2);
        assert_eq!(store.count_for_table("job2", &orders).await.unwrap(), 1);
        assert_eq!(store.list_for("job3").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_consume_is_soft_and_resave_resets() {
        let store = MemorySnapshotStore::new();
        let rec = record("orders", "orders_a", "job1");
        store.save(&rec).await.unwrap();
        store.consume(&rec).await.unwrap();

        let all = store.list_for("job1").await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_consumed());
        assert!(store.pending("job1").await.unwrap().is_empty());

        store.save(&rec).await.unwrap();
        assert_eq!(store.pending("job1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_consume_of_missing_record_fails() {
        let store = MemorySnapshotStore::new();
        let rec = record("orders", "orders_a", "job1");
        assert!(matches!(
            store.consume(&rec).await,
            Err(Error::UnmatchedRecord { matched: 0, .. })
        ));

        let db = Arc::new(crate::testing::FakeDatabase::new());
        let pg = PgSnapshotStore::new(db.clone(), DEFAULT_SNAPSHOT_TABLE).unwrap();
        let err = pg.consume(&rec).await.unwrap_err();
        assert!(matches!(err, Error::UnmatchedRecord { matched: 0, .. }));
        assert!(err.to_string().contains("orders_a"));
        assert_eq!(db.statements_matching("UPDATE").len(), 1);
    }

    #[test]
    fn test_pg_store_rejects_unqualified_table() {
        let conn: Arc<dyn Connection> = Arc::new(crate::testing::FakeDatabase::new());
        assert!(PgSnapshotStore::new(conn.clone(), "index_snapshots").is_err());
        assert!(PgSnapshotStore::new(conn, DEFAULT_SNAPSHOT_TABLE).is_ok());
    }

    #[test]
    fn test_row_to_record() {
        let now = Utc::now();
        let row = Row::from_pairs([
            ("schema_name", Value::from("public")),
            ("table_name", Value::from("orders")),
            ("index_name", Value::from("orders_ref_key")),
            ("kind", Value::from("constraint")),
            ("create_ddl", Value::from("ALTER TABLE ..")),
            ("drop_ddl", Value::from("ALTER TABLE ..")),
            ("job_tag", Value::from("job1")),
            ("table_bytes", Value::Int64(123)),
            ("consumed_at", Value::DateTimeTz(now)),
        ]);
        let rec = PgSnapshotStore::row_to_record(&row).unwrap();
        assert_eq!(rec.kind, IndexKind::Constraint);
        assert_eq!(rec.table, QualifiedName::new("public", "orders"));
        assert_eq!(rec.consumed_at, Some(now));
    }
}
