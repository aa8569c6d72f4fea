//! In-memory test doubles.
//!
//! [`FakeDatabase`] stands in for both the connection and the catalog of one
//! database. It understands the trigger and index DDL this crate emits, keeps
//! a log of executed statements, honours transactions, and can be told to fail
//! statements matching a pattern. [`ScriptedOracle`] replays a fixed sequence
//! of marker counts.

use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use lockstep_rdbc::connection::{Connection, Transaction};
use lockstep_rdbc::error::SQLSTATE_LOCK_NOT_AVAILABLE;
use lockstep_rdbc::types::{Row, Value};
use lockstep_rdbc::Error as RdbcError;

use crate::catalog::{IndexDefinition, IndexKind, ObjectCatalog, TriggerState};
use crate::error::{Error, Result};
use crate::model::{ObjectFilter, ObjectKind, QualifiedName, ReplicationObject};
use crate::monitor::ProgressOracle;

const IDENT: &str = r#""((?:[^"]|"")+)""#;

static CREATE_TRIGGER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^CREATE TRIGGER {IDENT} .* ON {IDENT}\.{IDENT} FOR EACH ROW"))
        .expect("create trigger pattern is invalid - this is a bug")
});

static DROP_TRIGGER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^DROP TRIGGER IF EXISTS {IDENT} ON {IDENT}\.{IDENT}$"))
        .expect("drop trigger pattern is invalid - this is a bug")
});

static TOGGLE_TRIGGER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^ALTER TABLE {IDENT}\.{IDENT} (DISABLE|ENABLE ALWAYS) TRIGGER {IDENT}$"
    ))
    .expect("toggle trigger pattern is invalid - this is a bug")
});

fn unquote(s: &str) -> String {
    s.replace("\"\"", "\"")
}

#[derive(Debug, Clone)]
struct FakeIndex {
    definition: IndexDefinition,
    live: bool,
}

#[derive(Debug, Clone)]
struct FakeRelation {
    kind: ObjectKind,
    primary_key: Vec<String>,
    bytes: u64,
    triggers: BTreeMap<String, TriggerState>,
    indexes: Vec<FakeIndex>,
}

#[derive(Debug, Clone)]
enum Failure {
    LockTimeout,
    SqlState { code: String, message: String },
}

#[derive(Debug, Clone)]
struct Injection {
    pattern: String,
    remaining: Option<usize>,
    failure: Failure,
}

#[derive(Debug, Clone)]
enum Effect {
    Trigger {
        table: QualifiedName,
        name: String,
        state: Option<TriggerState>,
    },
    Index {
        table: QualifiedName,
        name: String,
        kind: IndexKind,
        live: bool,
    },
}

#[derive(Debug, Default)]
struct State {
    relations: BTreeMap<QualifiedName, FakeRelation>,
    statements: Vec<String>,
    open_transactions: usize,
    injections: Vec<Injection>,
    unreadable: BTreeSet<QualifiedName>,
}

impl State {
    fn injected_failure(&mut self, sql: &str) -> Option<RdbcError> {
        let injection = self.injections.iter_mut().find(|i| {
            sql.contains(i.pattern.as_str()) && i.remaining.map_or(true, |n| n > 0)
        })?;
        if let Some(n) = injection.remaining.as_mut() {
            *n -= 1;
        }
        Some(match &injection.failure {
            Failure::LockTimeout => RdbcError::from_sqlstate(
                Some(SQLSTATE_LOCK_NOT_AVAILABLE),
                "canceling statement due to lock timeout",
                Some(sql),
            ),
            Failure::SqlState { code, message } => {
                RdbcError::from_sqlstate(Some(code.as_str()), message.clone(), Some(sql))
            }
        })
    }

    /// Work out what `sql` would change. Unrecognised statements change nothing.
    fn plan(&self, sql: &str) -> std::result::Result<Option<Effect>, RdbcError> {
        let fail = |code: &str, message: String| Err(RdbcError::from_sqlstate(Some(code), message, Some(sql)));

        if let Some(caps) = CREATE_TRIGGER.captures(sql) {
            let name = unquote(&caps[1]);
            let table = QualifiedName::new(unquote(&caps[2]), unquote(&caps[3]));
            return match self.relations.get(&table) {
                None => fail("42P01", format!("relation \"{}\" does not exist", table)),
                Some(rel) if rel.triggers.contains_key(&name) => fail(
                    "42710",
                    format!("trigger \"{}\" for relation \"{}\" already exists", name, table),
                ),
                Some(_) => Ok(Some(Effect::Trigger {
                    table,
                    name,
                    state: Some(TriggerState::Origin),
                })),
            };
        }

        if let Some(caps) = DROP_TRIGGER.captures(sql) {
            let name = unquote(&caps[1]);
            let table = QualifiedName::new(unquote(&caps[2]), unquote(&caps[3]));
            return Ok(Some(Effect::Trigger {
                table,
                name,
                state: None,
            }));
        }

        if let Some(caps) = TOGGLE_TRIGGER.captures(sql) {
            let table = QualifiedName::new(unquote(&caps[1]), unquote(&caps[2]));
            let name = unquote(&caps[4]);
            let exists = self
                .relations
                .get(&table)
                .is_some_and(|rel| rel.triggers.contains_key(&name));
            if !exists {
                return fail(
                    "42704",
                    format!("trigger \"{}\" for table \"{}\" does not exist", name, table),
                );
            }
            let state = match &caps[3] {
                "DISABLE" => TriggerState::Disabled,
                _ => TriggerState::Always,
            };
            return Ok(Some(Effect::Trigger {
                table,
                name,
                state: Some(state),
            }));
        }

        for (table, rel) in &self.relations {
            for index in &rel.indexes {
                let def = &index.definition;
                let live = if sql == def.drop_ddl {
                    false
                } else if sql == def.create_ddl {
                    true
                } else {
                    continue;
                };
                if live == index.live {
                    return if live {
                        fail("42P07", format!("relation \"{}\" already exists", def.name))
                    } else {
                        fail("42704", format!("index \"{}\" does not exist", def.name))
                    };
                }
                return Ok(Some(Effect::Index {
                    table: table.clone(),
                    name: def.name.clone(),
                    kind: def.kind,
                    live,
                }));
            }
        }

        Ok(None)
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Trigger { table, name, state } => {
                if let Some(rel) = self.relations.get_mut(&table) {
                    match state {
                        Some(state) => {
                            rel.triggers.insert(name, state);
                        }
                        None => {
                            rel.triggers.remove(&name);
                        }
                    }
                }
            }
            Effect::Index {
                table,
                name,
                kind,
                live,
            } => {
                if let Some(rel) = self.relations.get_mut(&table) {
                    for index in rel
                        .indexes
                        .iter_mut()
                        .filter(|i| i.definition.name == name && i.definition.kind == kind)
                    {
                        index.live = live;
                    }
                }
            }
        }
    }

    fn readable(&self, table: &QualifiedName) -> Result<()> {
        if self.unreadable.contains(table) {
            return Err(Error::Rdbc(RdbcError::connection(format!(
                "catalog read for {} failed",
                table
            ))));
        }
        Ok(())
    }
}

/// One in-memory database.
#[derive(Debug, Clone, Default)]
pub struct FakeDatabase {
    state: Arc<Mutex<State>>,
}

impl FakeDatabase {
    /// An empty database
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Add a table with the given primary key columns and size
    pub fn add_table(&self, table: QualifiedName, primary_key: &[&str], bytes: u64) {
        self.lock().relations.insert(
            table,
            FakeRelation {
                kind: ObjectKind::Table,
                primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
                bytes,
                triggers: BTreeMap::new(),
                indexes: Vec::new(),
            },
        );
    }

    /// Add a sequence
    pub fn add_sequence(&self, sequence: QualifiedName) {
        self.lock().relations.insert(
            sequence,
            FakeRelation {
                kind: ObjectKind::Sequence,
                primary_key: Vec::new(),
                bytes: 0,
                triggers: BTreeMap::new(),
                indexes: Vec::new(),
            },
        );
    }

    /// Add a live index or constraint to its (existing) table
    pub fn add_index(&self, definition: IndexDefinition) {
        if let Some(rel) = self.lock().relations.get_mut(&definition.table) {
            rel.indexes.push(FakeIndex {
                definition,
                live: true,
            });
        }
    }

    /// Put a trigger on an existing table
    pub fn add_trigger(&self, table: &QualifiedName, name: &str, state: TriggerState) {
        if let Some(rel) = self.lock().relations.get_mut(table) {
            rel.triggers.insert(name.to_string(), state);
        }
    }

    /// Fail the next `times` statements containing `pattern` with a lock timeout
    pub fn fail_with_lock_timeout(&self, pattern: &str, times: usize) {
        self.lock().injections.push(Injection {
            pattern: pattern.to_string(),
            remaining: Some(times),
            failure: Failure::LockTimeout,
        });
    }

    /// Fail every statement containing `pattern` with the given SQLSTATE
    pub fn fail_with_sqlstate(&self, pattern: &str, code: &str, message: &str) {
        self.lock().injections.push(Injection {
            pattern: pattern.to_string(),
            remaining: None,
            failure: Failure::SqlState {
                code: code.to_string(),
                message: message.to_string(),
            },
        });
    }

    /// Make catalog reads about `table` fail
    pub fn fail_catalog_reads(&self, table: &QualifiedName) {
        self.lock().unreadable.insert(table.clone());
    }

    /// Every statement executed so far, including transaction control
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    /// Executed statements containing `pattern`
    pub fn statements_matching(&self, pattern: &str) -> Vec<String> {
        self.lock()
            .statements
            .iter()
            .filter(|s| s.contains(pattern))
            .cloned()
            .collect()
    }

    /// Whether a transaction is open
    pub fn in_transaction(&self) -> bool {
        self.lock().open_transactions > 0
    }

    /// Committed firing state of `trigger` on `table`
    pub fn trigger(&self, table: &QualifiedName, trigger: &str) -> Option<TriggerState> {
        self.lock()
            .relations
            .get(table)
            .and_then(|rel| rel.triggers.get(trigger).copied())
    }

    /// Whether the named index or constraint is live
    pub fn is_live(&self, table: &QualifiedName, name: &str, kind: IndexKind) -> bool {
        self.lock().relations.get(table).is_some_and(|rel| {
            rel.indexes
                .iter()
                .any(|i| i.live && i.definition.name == name && i.definition.kind == kind)
        })
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Connection for FakeDatabase {
    async fn query(&self, _sql: &str, _params: &[Value]) -> lockstep_rdbc::Result<Vec<Row>> {
        Ok(Vec::new())
    }

    async fn execute(&self, sql: &str, _params: &[Value]) -> lockstep_rdbc::Result<u64> {
        let mut state = self.lock();
        state.statements.push(sql.to_string());
        if let Some(e) = state.injected_failure(sql) {
            return Err(e);
        }
        let effect = state.plan(sql)?;
        if let Some(effect) = effect {
            state.apply(effect);
        }
        Ok(0)
    }

    async fn begin(&self) -> lockstep_rdbc::Result<Box<dyn Transaction>> {
        let mut state = self.lock();
        state.statements.push("BEGIN".to_string());
        state.open_transactions += 1;
        Ok(Box::new(FakeTransaction {
            state: Arc::clone(&self.state),
            effects: Mutex::new(Vec::new()),
            aborted: Mutex::new(false),
        }))
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> lockstep_rdbc::Result<()> {
        Ok(())
    }
}

struct FakeTransaction {
    state: Arc<Mutex<State>>,
    effects: Mutex<Vec<Effect>>,
    aborted: Mutex<bool>,
}

impl FakeTransaction {
    fn finish(&self, statement: &str, keep: bool) {
        let effects = std::mem::take(&mut *self.effects.lock().unwrap_or_else(|p| p.into_inner()));
        let mut state = lock(&self.state);
        state.statements.push(statement.to_string());
        state.open_transactions = state.open_transactions.saturating_sub(1);
        if keep {
            for effect in effects {
                state.apply(effect);
            }
        }
    }
}

#[async_trait]
impl Transaction for FakeTransaction {
    async fn query(&self, _sql: &str, _params: &[Value]) -> lockstep_rdbc::Result<Vec<Row>> {
        Ok(Vec::new())
    }

    async fn execute(&self, sql: &str, _params: &[Value]) -> lockstep_rdbc::Result<u64> {
        let mut aborted = self.aborted.lock().unwrap_or_else(|p| p.into_inner());
        if *aborted {
            return Err(RdbcError::from_sqlstate(
                Some("25P02"),
                "current transaction is aborted, commands ignored until end of transaction block",
                Some(sql),
            ));
        }

        let mut state = lock(&self.state);
        state.statements.push(sql.to_string());
        let planned = match state.injected_failure(sql) {
            Some(e) => Err(e),
            None if sql.starts_with("SET LOCAL") => Ok(None),
            None => state.plan(sql),
        };
        match planned {
            Ok(effect) => {
                if let Some(effect) = effect {
                    self.effects.lock().unwrap_or_else(|p| p.into_inner()).push(effect);
                }
                Ok(0)
            }
            Err(e) => {
                *aborted = true;
                Err(e)
            }
        }
    }

    async fn commit(self: Box<Self>) -> lockstep_rdbc::Result<()> {
        let aborted = *self.aborted.lock().unwrap_or_else(|p| p.into_inner());
        // COMMIT of a failed transaction rolls back.
        self.finish("COMMIT", !aborted);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> lockstep_rdbc::Result<()> {
        self.finish("ROLLBACK", false);
        Ok(())
    }
}

#[async_trait]
impl ObjectCatalog for FakeDatabase {
    async fn discover_objects(&self, filter: &ObjectFilter) -> Result<Vec<ReplicationObject>> {
        let state = self.lock();
        Ok(state
            .relations
            .iter()
            .filter(|(name, _)| filter.matches(name))
            .map(|(name, rel)| match rel.kind {
                ObjectKind::Table => ReplicationObject::table(name.clone(), rel.primary_key.clone()),
                ObjectKind::Sequence => ReplicationObject::sequence(name.clone()),
            })
            .collect())
    }

    async fn trigger_state(&self, table: &QualifiedName, trigger: &str) -> Result<Option<TriggerState>> {
        let state = self.lock();
        state.readable(table)?;
        Ok(state
            .relations
            .get(table)
            .and_then(|rel| rel.triggers.get(trigger).copied()))
    }

    async fn table_indexes(&self, table: &QualifiedName) -> Result<Vec<IndexDefinition>> {
        let state = self.lock();
        state.readable(table)?;
        let Some(rel) = state.relations.get(table) else {
            return Ok(Vec::new());
        };
        let mut definitions: Vec<IndexDefinition> = rel
            .indexes
            .iter()
            .filter(|i| i.live)
            .map(|i| IndexDefinition {
                table_bytes: rel.bytes,
                ..i.definition.clone()
            })
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(definitions)
    }

    async fn index_exists(&self, table: &QualifiedName, name: &str, kind: IndexKind) -> Result<bool> {
        self.lock().readable(table)?;
        Ok(self.is_live(table, name, kind))
    }
}

/// Replays marker counts; the last value repeats once the script runs out.
#[derive(Debug)]
pub struct ScriptedOracle {
    counts: Vec<u64>,
    failing_reads: BTreeSet<usize>,
    reads: AtomicUsize,
}

impl ScriptedOracle {
    /// Counts returned by successive reads
    pub fn new(counts: impl IntoIterator<Item = u64>) -> Self {
        Self {
            counts: counts.into_iter().collect(),
            failing_reads: BTreeSet::new(),
            reads: AtomicUsize::new(0),
        }
    }

    /// Make the read at zero-based position `read` fail
    pub fn failing_at(mut self, read: usize) -> Self {
        self.failing_reads.insert(read);
        self
    }

    /// Reads performed so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProgressOracle for ScriptedOracle {
    async fn current_marker_count(&self) -> Result<u64> {
        let read = self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing_reads.contains(&read) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "scripted read failure",
            )));
        }
        let count = self
            .counts
            .get(read)
            .or_else(|| self.counts.last())
            .copied()
            .unwrap_or(0);
        Ok(count)
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_ddl_round_trip() {
        let db = FakeDatabase::new();
        let orders = QualifiedName::new("public", "orders");
        db.add_table(orders.clone(), &["id"], 0);

        db.execute(
            "CREATE TRIGGER \"cap\" AFTER INSERT OR UPDATE OR DELETE ON \"public\".\"orders\" FOR EACH ROW EXECUTE FUNCTION \"f\"()",
            &[],
        )
        .await
        .unwrap();
        assert_eq!(db.trigger(&orders, "cap"), Some(TriggerState::Origin));

        db.execute("ALTER TABLE \"public\".\"orders\" DISABLE TRIGGER \"cap\"", &[])
            .await
            .unwrap();
        assert_eq!(db.trigger(&orders, "cap"), Some(TriggerState::Disabled));

        db.execute("DROP TRIGGER IF EXISTS \"cap\" ON \"public\".\"orders\"", &[])
            .await
            .unwrap();
        assert_eq!(db.trigger(&orders, "cap"), None);
    }

    #[tokio::test]
    async fn test_rollback_discards_effects() {
        let db = FakeDatabase::new();
        let orders = QualifiedName::new("public", "orders");
        db.add_table(orders.clone(), &["id"], 0);

        let tx = db.begin().await.unwrap();
        tx.execute(
            "CREATE TRIGGER \"cap\" AFTER INSERT OR UPDATE OR DELETE ON \"public\".\"orders\" FOR EACH ROW EXECUTE FUNCTION \"f\"()",
            &[],
        )
        .await
        .unwrap();
        assert!(db.in_transaction());
        tx.rollback().await.unwrap();

        assert_eq!(db.trigger(&orders, "cap"), None);
        assert!(!db.in_transaction());
    }

    #[tokio::test]
    async fn test_scripted_oracle_repeats_last() {
        let oracle = ScriptedOracle::new([1, 2]).failing_at(1);
        assert_eq!(oracle.current_marker_count().await.unwrap(), 1);
        assert!(oracle.current_marker_count().await.is_err());
        assert_eq!(oracle.current_marker_count().await.unwrap(), 2);
        assert_eq!(oracle.current_marker_count().await.unwrap(), 2);
        assert_eq!(oracle.reads(), 4);
    }
}
