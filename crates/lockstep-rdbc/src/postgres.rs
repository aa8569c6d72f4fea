//! PostgreSQL backend implementation for lockstep-rdbc
//!
//! Provides PostgreSQL-specific implementations:
//! - Connection with SQLSTATE-aware error mapping
//! - Transactions driven by explicit BEGIN / COMMIT / ROLLBACK
//! - Connection factory honoring connect timeout and application name

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_postgres::types::{ToSql, Type};
use tracing::{debug, error, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, Transaction};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Convert a Value to a tokio-postgres compatible parameter
fn value_to_sql(value: &Value) -> BoxedParam {
    match value {
        Value::Null => Box::new(Option::<String>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int16(n) => Box::new(*n),
        Value::Int32(n) => Box::new(*n),
        Value::Int64(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::String(s) => Box::new(s.clone()),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Json(j) => Box::new(j.clone()),
    }
}

/// Map a driver error, keeping the SQLSTATE classification.
fn map_pg_error(e: tokio_postgres::Error, sql: &str) -> Error {
    let code = e.code().map(|c| c.code().to_string());
    let message = match e.as_db_error() {
        Some(db) => db.message().to_string(),
        None => e.to_string(),
    };
    if code.is_none() && e.is_closed() {
        return Error::connection_with_source("connection closed", e);
    }
    Error::from_sqlstate(code.as_deref(), message, Some(sql))
}

/// Convert a tokio-postgres row to a Row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns: Vec<String> = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values: Vec<Value> = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect();

    Row::new(columns, values)
}

fn get_opt<'a, T>(row: &'a tokio_postgres::Row, idx: usize) -> Option<T>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

/// Convert a PostgreSQL value to a Value
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    let value = match *pg_type {
        Type::BOOL => get_opt::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get_opt::<i16>(row, idx).map(Value::Int16),
        Type::INT4 => get_opt::<i32>(row, idx).map(Value::Int32),
        Type::INT8 => get_opt::<i64>(row, idx).map(Value::Int64),
        Type::OID => get_opt::<u32>(row, idx).map(|n| Value::Int64(i64::from(n))),
        Type::FLOAT8 => get_opt::<f64>(row, idx).map(Value::Float64),
        Type::FLOAT4 => get_opt::<f32>(row, idx).map(|n| Value::Float64(f64::from(n))),
        // "char" columns such as pg_trigger.tgenabled
        Type::CHAR => get_opt::<i8>(row, idx).map(|c| Value::String((c as u8 as char).to_string())),
        Type::TIMESTAMPTZ => get_opt::<chrono::DateTime<chrono::Utc>>(row, idx).map(Value::DateTimeTz),
        Type::JSON | Type::JSONB => get_opt::<serde_json::Value>(row, idx).map(Value::Json),
        _ => get_opt::<String>(row, idx).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

async fn run_query(client: &tokio_postgres::Client, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let boxed: Vec<BoxedParam> = params.iter().map(value_to_sql).collect();
    let refs: Vec<&(dyn ToSql + Sync)> = boxed
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect();
    let pg_rows = client
        .query(sql, &refs)
        .await
        .map_err(|e| map_pg_error(e, sql))?;
    Ok(pg_rows.iter().map(pg_row_to_row).collect())
}

async fn run_execute(client: &tokio_postgres::Client, sql: &str, params: &[Value]) -> Result<u64> {
    debug!(sql = %sql, "executing statement");
    if params.is_empty() {
        // Utility statements (DDL, SET LOCAL) go through the simple protocol.
        let messages = client
            .simple_query(sql)
            .await
            .map_err(|e| map_pg_error(e, sql))?;
        let affected = messages
            .iter()
            .filter_map(|m| match m {
                tokio_postgres::SimpleQueryMessage::CommandComplete(n) => Some(*n),
                _ => None,
            })
            .sum();
        return Ok(affected);
    }
    let boxed: Vec<BoxedParam> = params.iter().map(value_to_sql).collect();
    let refs: Vec<&(dyn ToSql + Sync)> = boxed
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect();
    client
        .execute(sql, &refs)
        .await
        .map_err(|e| map_pg_error(e, sql))
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        run_query(&self.client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        run_execute(&self.client, sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;

        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| Error::Transaction {
                message: e.to_string(),
                source: Some(Box::new(e)),
            })?;

        Ok(Box::new(PgTransaction {
            client: Arc::clone(&self.client),
            finished: AtomicBool::new(false),
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL transaction
pub struct PgTransaction {
    client: Arc<tokio_postgres::Client>,
    finished: AtomicBool,
}

impl PgTransaction {
    async fn finish(&self, command: &str) -> Result<()> {
        self.client
            .batch_execute(command)
            .await
            .map_err(|e| Error::Transaction {
                message: e.to_string(),
                source: Some(Box::new(e)),
            })?;
        self.finished.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        run_query(&self.client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        run_execute(&self.client, sql, params).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Relaxed) {
            warn!("transaction dropped without commit or rollback");
        }
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::connection_with_source("invalid connection url", e))?;
        pg_config.connect_timeout(config.connect_timeout);
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }
        if !config.properties.is_empty() {
            let options: Vec<String> = config
                .properties
                .iter()
                .map(|(key, value)| format!("-c {}={}", key, value))
                .collect();
            pg_config.options(&options.join(" "));
        }

        let (client, connection) = pg_config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "postgres connection error");
            }
        });

        Ok(Box::new(PgConnection::new(client)))
    }
}

/// Connect to PostgreSQL database
pub async fn connect(url: &str) -> Result<Box<dyn Connection>> {
    PgConnectionFactory
        .connect(&ConnectionConfig::new(url))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversion() {
        let _ = value_to_sql(&Value::Int32(42));
        let _ = value_to_sql(&Value::String("hello".into()));
        let _ = value_to_sql(&Value::Null);
        let _ = value_to_sql(&Value::Bool(true));
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        let err = PgConnectionFactory
            .connect(&ConnectionConfig::new("postgres://localhost:notaport/db"))
            .await
            .err()
            .map(|e| e.category());
        assert_eq!(err, Some(crate::error::ErrorCategory::Connection));
    }
}
