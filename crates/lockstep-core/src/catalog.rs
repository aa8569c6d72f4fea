//! Object catalog accessor.
//!
//! Read-only view of the live database: which relations are replicated, which
//! triggers they carry, and which indexes and unique constraints they have.
//! No retry logic lives here; a failed read surfaces as an error to the engine,
//! which records it against the object being processed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use lockstep_rdbc::connection::Connection;
use lockstep_rdbc::security::{quote_identifier, quote_qualified};
use lockstep_rdbc::types::{Row, Value};

use crate::error::Result;
use crate::model::{ObjectFilter, QualifiedName, ReplicationObject};

/// `pg_trigger.tgenabled` firing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    /// Fires in origin and local modes (`O`)
    Origin,
    /// Fires always (`A`)
    Always,
    /// Fires only in replica mode (`R`)
    Replica,
    /// Disabled (`D`)
    Disabled,
}

impl TriggerState {
    /// Parse the single-character catalog code
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "O" => Some(Self::Origin),
            "A" => Some(Self::Always),
            "R" => Some(Self::Replica),
            "D" => Some(Self::Disabled),
            _ => None,
        }
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Origin => write!(f, "origin"),
            Self::Always => write!(f, "always"),
            Self::Replica => write!(f, "replica"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Whether a definition is a plain index or a unique constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// `CREATE INDEX` / `DROP INDEX`
    Index,
    /// `ALTER TABLE .. ADD CONSTRAINT .. UNIQUE` / `DROP CONSTRAINT`
    Constraint,
}

impl IndexKind {
    /// Stable text form used in persisted records
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Constraint => "constraint",
        }
    }

    /// Parse the persisted text form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "index" => Some(Self::Index),
            "constraint" => Some(Self::Constraint),
            _ => None,
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An index or unique constraint as it exists in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Owning table
    pub table: QualifiedName,
    /// Index or constraint name
    pub name: String,
    /// Plain index or unique constraint
    pub kind: IndexKind,
    /// Backs the table's primary key
    pub is_primary: bool,
    /// Backs a primary key, unique or exclusion constraint (plain indexes only)
    pub backs_constraint: bool,
    /// Statement that recreates it
    pub create_ddl: String,
    /// Statement that removes it
    pub drop_ddl: String,
    /// Size of the owning table in bytes at discovery time
    pub table_bytes: u64,
}

impl IndexDefinition {
    /// A plain index; drop DDL is derived from the name
    pub fn index(
        table: QualifiedName,
        name: impl Into<String>,
        create_ddl: impl Into<String>,
        table_bytes: u64,
    ) -> Self {
        let name = name.into();
        let drop_ddl = drop_index_sql(&table.schema, &name);
        Self {
            table,
            name,
            kind: IndexKind::Index,
            is_primary: false,
            backs_constraint: false,
            create_ddl: create_ddl.into(),
            drop_ddl,
            table_bytes,
        }
    }

    /// A unique constraint given its `pg_get_constraintdef` text
    pub fn unique_constraint(
        table: QualifiedName,
        name: impl Into<String>,
        definition: &str,
        table_bytes: u64,
    ) -> Self {
        let name = name.into();
        let quoted_table = table.quoted();
        let quoted_name = quote_identifier(&name);
        Self {
            create_ddl: format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {}",
                quoted_table, quoted_name, definition
            ),
            drop_ddl: format!("ALTER TABLE {} DROP CONSTRAINT {}", quoted_table, quoted_name),
            table,
            name,
            kind: IndexKind::Constraint,
            is_primary: false,
            backs_constraint: false,
            table_bytes,
        }
    }

    /// Mark as the primary key's index
    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self.backs_constraint = true;
        self
    }

    /// Mark as backing a constraint
    pub fn backing_constraint(mut self) -> Self {
        self.backs_constraint = true;
        self
    }

    /// Whether this definition may ever be dropped temporarily
    pub fn is_removable(&self) -> bool {
        !self.is_primary && !(self.kind == IndexKind::Index && self.backs_constraint)
    }
}

fn drop_index_sql(schema: &str, name: &str) -> String {
    format!("DROP INDEX {}", quote_qualified(schema, name))
}

/// Read-only catalog queries
#[async_trait]
pub trait ObjectCatalog: Send + Sync {
    /// Non-inherited tables and sequences matching `filter`, sorted by (schema, name)
    async fn discover_objects(&self, filter: &ObjectFilter) -> Result<Vec<ReplicationObject>>;

    /// Firing state of `trigger` on `table`, `None` when absent
    async fn trigger_state(
        &self,
        table: &QualifiedName,
        trigger: &str,
    ) -> Result<Option<TriggerState>>;

    /// Whether `trigger` exists on `table`
    async fn has_trigger(&self, table: &QualifiedName, trigger: &str) -> Result<bool> {
        Ok(self.trigger_state(table, trigger).await?.is_some())
    }

    /// Every index and unique constraint on `table`, sorted by name
    async fn table_indexes(&self, table: &QualifiedName) -> Result<Vec<IndexDefinition>>;

    /// Whether the named index or constraint is live on `table`
    async fn index_exists(&self, table: &QualifiedName, name: &str, kind: IndexKind)
        -> Result<bool>;
}

const DISCOVER_SQL: &str = r#"
SELECT n.nspname AS schema_name,
       c.relname AS object_name,
       c.relkind::text AS relkind,
       COALESCE((
           SELECT json_agg(a.attname::text ORDER BY k.ord)
           FROM pg_index i
           CROSS JOIN LATERAL unnest(i.indkey) WITH ORDINALITY AS k(attnum, ord)
           JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
           WHERE i.indrelid = c.oid AND i.indisprimary
       ), '[]'::json) AS primary_key
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE c.relkind IN ('r', 'p', 'S')
  AND NOT EXISTS (SELECT 1 FROM pg_inherits inh WHERE inh.inhrelid = c.oid)
  AND n.nspname NOT IN ('pg_catalog', 'information_schema')
  AND n.nspname NOT LIKE 'pg_toast%'
  AND n.nspname NOT LIKE 'pg_temp%'
ORDER BY 1, 2
"#;

const TRIGGER_STATE_SQL: &str = r#"
SELECT t.tgenabled::text AS tgenabled
FROM pg_trigger t
JOIN pg_class c ON c.oid = t.tgrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1 AND c.relname = $2 AND t.tgname = $3 AND NOT t.tgisinternal
"#;

const INDEXES_SQL: &str = r#"
SELECT ic.relname AS index_name,
       i.indisprimary AS is_primary,
       EXISTS (
           SELECT 1 FROM pg_constraint con
           WHERE con.conindid = i.indexrelid AND con.contype IN ('p', 'u', 'x')
       ) AS backs_constraint,
       pg_get_indexdef(i.indexrelid) AS create_ddl,
       pg_relation_size(t.oid) AS table_bytes
FROM pg_index i
JOIN pg_class ic ON ic.oid = i.indexrelid
JOIN pg_class t ON t.oid = i.indrelid
JOIN pg_namespace n ON n.oid = t.relnamespace
WHERE n.nspname = $1 AND t.relname = $2
ORDER BY ic.relname
"#;

const UNIQUE_CONSTRAINTS_SQL: &str = r#"
SELECT con.conname AS constraint_name,
       pg_get_constraintdef(con.oid) AS definition,
       pg_relation_size(t.oid) AS table_bytes
FROM pg_constraint con
JOIN pg_class t ON t.oid = con.conrelid
JOIN pg_namespace n ON n.oid = t.relnamespace
WHERE n.nspname = $1 AND t.relname = $2 AND con.contype = 'u'
ORDER BY con.conname
"#;

const INDEX_EXISTS_SQL: &str = r#"
SELECT 1 AS present FROM pg_indexes
WHERE schemaname = $1 AND tablename = $2 AND indexname = $3
"#;

const CONSTRAINT_EXISTS_SQL: &str = r#"
SELECT 1 AS present
FROM pg_constraint con
JOIN pg_class t ON t.oid = con.conrelid
JOIN pg_namespace n ON n.oid = t.relnamespace
WHERE n.nspname = $1 AND t.relname = $2 AND con.conname = $3
"#;

/// PostgreSQL catalog accessor
pub struct PgCatalog {
    conn: Arc<dyn Connection>,
}

impl PgCatalog {
    /// Create a catalog over `conn`
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self { conn }
    }

    fn table_params(table: &QualifiedName) -> [Value; 2] {
        [
            Value::from(table.schema.as_str()),
            Value::from(table.name.as_str()),
        ]
    }
}

fn primary_key_columns(row: &Row) -> Vec<String> {
    match row.get_by_name("primary_key") {
        Some(Value::Json(serde_json::Value::Array(items))) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl ObjectCatalog for PgCatalog {
    async fn discover_objects(&self, filter: &ObjectFilter) -> Result<Vec<ReplicationObject>> {
        let rows = self.conn.query(DISCOVER_SQL, &[]).await?;

        let mut objects = Vec::with_capacity(rows.len());
        for row in &rows {
            let name = QualifiedName::new(row.try_str("schema_name")?, row.try_str("object_name")?);
            if !filter.matches(&name) {
                continue;
            }
            let object = match row.try_str("relkind")? {
                "S" => ReplicationObject::sequence(name),
                _ => ReplicationObject::table(name, primary_key_columns(row)),
            };
            objects.push(object);
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(count = objects.len(), "discovered replication objects");
        Ok(objects)
    }

    async fn trigger_state(
        &self,
        table: &QualifiedName,
        trigger: &str,
    ) -> Result<Option<TriggerState>> {
        let [schema, name] = Self::table_params(table);
        let row = self
            .conn
            .query_one(TRIGGER_STATE_SQL, &[schema, name, Value::from(trigger)])
            .await?;

        match row {
            Some(row) => Ok(TriggerState::from_code(row.try_str("tgenabled")?)),
            None => Ok(None),
        }
    }

    async fn table_indexes(&self, table: &QualifiedName) -> Result<Vec<IndexDefinition>> {
        let params = Self::table_params(table);
        let mut definitions = Vec::new();

        for row in self.conn.query(INDEXES_SQL, &params).await? {
            let mut def = IndexDefinition::index(
                table.clone(),
                row.try_str("index_name")?,
                row.try_str("create_ddl")?,
                row.try_i64("table_bytes")?.max(0) as u64,
            );
            def.is_primary = row.try_bool("is_primary")?;
            def.backs_constraint = row.try_bool("backs_constraint")?;
            definitions.push(def);
        }

        for row in self.conn.query(UNIQUE_CONSTRAINTS_SQL, &params).await? {
            definitions.push(IndexDefinition::unique_constraint(
                table.clone(),
                row.try_str("constraint_name")?,
                row.try_str("definition")?,
                row.try_i64("table_bytes")?.max(0) as u64,
            ));
        }

        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(definitions)
    }

    async fn index_exists(
        &self,
        table: &QualifiedName,
        name: &str,
        kind: IndexKind,
    ) -> Result<bool> {
        let sql = match kind {
            IndexKind::Index => INDEX_EXISTS_SQL,
            IndexKind::Constraint => CONSTRAINT_EXISTS_SQL,
        };
        let [schema, table_name] = Self::table_params(table);
        let row = self
            .conn
            .query_one(sql, &[schema, table_name, Value::from(name)])
            .await?;
        Ok(row.is_some())
    }
}
