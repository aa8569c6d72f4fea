//! Replication object model shared by the engines.

use serde::{Deserialize, Serialize};
use std::fmt;

use lockstep_rdbc::security::quote_qualified;

/// Schema-qualified relation name.
///
/// Ordering is by schema, then name, which is the iteration order of every run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    /// Namespace
    pub schema: String,
    /// Relation name
    pub name: String,
}

impl QualifiedName {
    /// Create a qualified name
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Quoted form for generated SQL
    pub fn quoted(&self) -> String {
        quote_qualified(&self.schema, &self.name)
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Kind of replicated relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// Ordinary or partitioned table
    Table,
    /// Sequence
    Sequence,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Sequence => write!(f, "sequence"),
        }
    }
}

/// A table or sequence designated for replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationObject {
    /// Qualified name
    pub name: QualifiedName,
    /// Table or sequence
    pub kind: ObjectKind,
    /// Primary key columns in key order; empty for sequences
    #[serde(default)]
    pub primary_key: Vec<String>,
}

impl ReplicationObject {
    /// A table with the given primary key columns
    pub fn table(name: QualifiedName, primary_key: Vec<String>) -> Self {
        Self {
            name,
            kind: ObjectKind::Table,
            primary_key,
        }
    }

    /// A sequence
    pub fn sequence(name: QualifiedName) -> Self {
        Self {
            name,
            kind: ObjectKind::Sequence,
            primary_key: Vec::new(),
        }
    }

    /// Whether this is a table
    #[inline]
    pub fn is_table(&self) -> bool {
        self.kind == ObjectKind::Table
    }

    /// Whether this table has a primary key
    #[inline]
    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }
}

/// Include/exclude lists narrowing which relations are replicated.
///
/// Empty include lists match everything. Exclusions win over inclusions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectFilter {
    /// Schemas to include
    #[serde(default)]
    pub namespace_include: Vec<String>,
    /// Schemas to exclude
    #[serde(default)]
    pub namespace_exclude: Vec<String>,
    /// Relation names to include
    #[serde(default)]
    pub table_include: Vec<String>,
    /// Relation names to exclude
    #[serde(default)]
    pub table_exclude: Vec<String>,
}

impl ObjectFilter {
    /// Whether `name` passes the filter
    pub fn matches(&self, name: &QualifiedName) -> bool {
        let listed = |list: &[String], value: &str| list.iter().any(|v| v == value);

        if !self.namespace_include.is_empty() && !listed(&self.namespace_include, &name.schema) {
            return false;
        }
        if listed(&self.namespace_exclude, &name.schema) {
            return false;
        }
        if !self.table_include.is_empty() && !listed(&self.table_include, &name.name) {
            return false;
        }
        !listed(&self.table_exclude, &name.name)
    }
}
