//! Bounded mutation executor.
//!
//! Runs one DDL statement inside its own transaction with `SET LOCAL
//! lock_timeout`, so the budget lapses with the transaction and the session
//! default is back in force however the attempt ends:
//!
//! ```text
//! BEGIN
//! SET LOCAL lock_timeout = '<budget>ms'
//! <statement>
//! COMMIT | ROLLBACK
//! ```

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use lockstep_rdbc::connection::Connection;
use lockstep_rdbc::Error as RdbcError;

use crate::report::Outcome;

/// Executes single statements under a lock wait budget.
#[derive(Clone)]
pub struct BoundedExecutor {
    conn: Arc<dyn Connection>,
}

impl BoundedExecutor {
    /// Create an executor over `conn`
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self { conn }
    }

    /// The connection statements run on
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Attempt `statement` once, waiting at most `wait_budget` for locks.
    ///
    /// Never returns an error: lock wait expiry is [`Outcome::TimedOut`], any
    /// other failure is [`Outcome::Fatal`]. The transaction is committed on
    /// success and rolled back otherwise.
    pub async fn attempt(&self, statement: &str, wait_budget: Duration) -> Outcome {
        debug!(statement = %statement, budget = ?wait_budget, "attempting statement");

        let tx = match self.conn.begin().await {
            Ok(tx) => tx,
            Err(e) => return classify(e),
        };

        let result = async {
            tx.execute(&lock_timeout_sql(wait_budget), &[]).await?;
            tx.execute(statement, &[]).await
        }
        .await;

        let outcome = match result {
            Ok(_) => match tx.commit().await {
                Ok(()) => Outcome::Succeeded,
                Err(e) => classify(e),
            },
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed attempt also failed");
                }
                classify(e)
            }
        };

        debug!(statement = %statement, outcome = %outcome, "attempt finished");
        outcome
    }
}

/// Largest `lock_timeout` the server accepts.
pub const MAX_WAIT_BUDGET: Duration = Duration::from_millis(i32::MAX as u64);

/// `lock_timeout = 0` disables the limit, so the budget is clamped to 1ms.
fn lock_timeout_sql(budget: Duration) -> String {
    let millis = budget.min(MAX_WAIT_BUDGET).as_millis().max(1);
    format!("SET LOCAL lock_timeout = '{}ms'", millis)
}

fn classify(e: RdbcError) -> Outcome {
    if e.is_lock_timeout() {
        Outcome::TimedOut
    } else {
        Outcome::fatal(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDatabase;

    #[test]
    fn test_lock_timeout_sql() {
        assert_eq!(
            lock_timeout_sql(Duration::from_secs(1)),
            "SET LOCAL lock_timeout = '1000ms'"
        );
        assert_eq!(
            lock_timeout_sql(Duration::ZERO),
            "SET LOCAL lock_timeout = '1ms'"
        );
    }

    #[tokio::test]
    async fn test_success_commits() {
        let db = Arc::new(FakeDatabase::new());
        let exec = BoundedExecutor::new(db.clone());

        let outcome = exec.attempt("SELECT 1", Duration::from_millis(250)).await;

        assert_eq!(outcome, Outcome::Succeeded);
        assert_eq!(
            db.statements(),
            [
                "BEGIN",
                "SET LOCAL lock_timeout = '250ms'",
                "SELECT 1",
                "COMMIT"
            ]
        );
        assert!(!db.in_transaction());
    }

    #[tokio::test]
    async fn test_lock_timeout_rolls_back() {
        let db = Arc::new(FakeDatabase::new());
        db.fail_with_lock_timeout("DROP INDEX", 1);
        let exec = BoundedExecutor::new(db.clone());

        let first = exec
            .attempt("DROP INDEX \"public\".\"orders_idx\"", Duration::from_secs(1))
            .await;
        assert_eq!(first, Outcome::TimedOut);
        assert_eq!(db.statements().last().map(String::as_str), Some("ROLLBACK"));
        assert!(!db.in_transaction());

        // Session is usable for the next attempt.
        let second = exec
            .attempt("DROP INDEX \"public\".\"orders_idx\"", Duration::from_secs(1))
            .await;
        assert_eq!(second, Outcome::Succeeded);
    }

    #[tokio::test]
    async fn test_other_errors_are_fatal() {
        let db = Arc::new(FakeDatabase::new());
        db.fail_with_sqlstate("CREATE TRIGGER", "42501", "permission denied for table orders");
        let exec = BoundedExecutor::new(db.clone());

        let outcome = exec
            .attempt("CREATE TRIGGER x AFTER INSERT ON t", Duration::from_secs(1))
            .await;

        match outcome {
            Outcome::Fatal { detail } => assert!(detail.contains("permission denied")),
            other => panic!("expected fatal, got {:?}", other),
        }
        assert!(!db.in_transaction());
    }
}
