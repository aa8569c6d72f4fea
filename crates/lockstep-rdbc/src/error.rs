//! Error types for lockstep-rdbc
//!
//! Errors are classified so callers can tell contention apart from real failures:
//! - Lock timeouts (SQLSTATE `55P03`), the designed-for outcome of a bounded DDL attempt
//! - Retriable errors (connection, deadlock)
//! - Non-retriable errors (syntax, permissions, constraint violations)

use std::fmt;
use thiserror::Error;

/// Result type for lockstep-rdbc operations
pub type Result<T> = std::result::Result<T, Error>;

/// SQLSTATE raised when `lock_timeout` expires while waiting for a lock.
pub const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";

/// SQLSTATE raised when a deadlock is detected.
pub const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";

/// SQLSTATE raised when the role lacks a privilege.
pub const SQLSTATE_INSUFFICIENT_PRIVILEGE: &str = "42501";

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-related errors (retriable)
    Connection,
    /// Query execution errors
    Query,
    /// Transaction errors
    Transaction,
    /// Constraint violation (not retriable)
    Constraint,
    /// Type conversion errors (not retriable)
    TypeConversion,
    /// Lock wait budget exceeded (retriable by re-invocation)
    LockTimeout,
    /// Deadlock detected (retriable)
    Deadlock,
    /// Authentication or authorization failure
    Authentication,
    /// Configuration error
    Configuration,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::LockTimeout | Self::Deadlock)
    }
}

/// Main error type for lockstep-rdbc
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        code: Option<String>,
    },

    /// Transaction error
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Constraint violation (PK, FK, unique, check)
    #[error("constraint violation: {message}")]
    Constraint { message: String, sql: Option<String> },

    /// Type conversion failed
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// Lock could not be acquired within the session's lock wait budget
    #[error("lock timeout: {message}")]
    LockTimeout { message: String, sql: Option<String> },

    /// Deadlock detected
    #[error("deadlock detected: {message}")]
    Deadlock { message: String },

    /// Authentication or privilege failure
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Constraint { .. } => ErrorCategory::Constraint,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::LockTimeout { .. } => ErrorCategory::LockTimeout,
            Self::Deadlock { .. } => ErrorCategory::Deadlock,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this error means the lock wait budget ran out
    #[inline]
    pub fn is_lock_timeout(&self) -> bool {
        self.category() == ErrorCategory::LockTimeout
    }

    /// Classify a database error by its SQLSTATE code.
    ///
    /// `code` is the five-character SQLSTATE reported by the server, if any.
    pub fn from_sqlstate(
        code: Option<&str>,
        message: impl Into<String>,
        sql: Option<&str>,
    ) -> Self {
        let message = message.into();
        let sql = sql.map(String::from);
        match code {
            Some(SQLSTATE_LOCK_NOT_AVAILABLE) => Self::LockTimeout { message, sql },
            Some(SQLSTATE_DEADLOCK_DETECTED) => Self::Deadlock { message },
            Some(SQLSTATE_INSUFFICIENT_PRIVILEGE) => Self::Authentication { message },
            Some(c) if c.starts_with("08") => Self::Connection {
                message,
                source: None,
            },
            Some(c) if c.starts_with("23") => Self::Constraint { message, sql },
            other => Self::Query {
                message,
                sql,
                code: other.map(String::from),
            },
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            code: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            code: None,
        }
    }

    /// Create a lock timeout error
    pub fn lock_timeout(message: impl Into<String>) -> Self {
        Self::LockTimeout {
            message: message.into(),
            sql: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// The SQLSTATE code attached to this error, when the server reported one
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::LockTimeout { .. } => Some(SQLSTATE_LOCK_NOT_AVAILABLE),
            Self::Deadlock { .. } => Some(SQLSTATE_DEADLOCK_DETECTED),
            Self::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::Transaction => write!(f, "transaction"),
            Self::Constraint => write!(f, "constraint"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::LockTimeout => write!(f, "lock_timeout"),
            Self::Deadlock => write!(f, "deadlock"),
            Self::Authentication => write!(f, "authentication"),
            Self::Configuration => write!(f, "configuration"),
            Self::Other => write!(f, "other"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retriable() {
        assert!(ErrorCategory::Connection.is_retriable());
        assert!(ErrorCategory::LockTimeout.is_retriable());
        assert!(ErrorCategory::Deadlock.is_retriable());

        assert!(!ErrorCategory::Constraint.is_retriable());
        assert!(!ErrorCategory::TypeConversion.is_retriable());
        assert!(!ErrorCategory::Query.is_retriable());
        assert!(!ErrorCategory::Authentication.is_retriable());
    }

    #[test]
    fn test_from_sqlstate_lock_timeout() {
        let err = Error::from_sqlstate(
            Some("55P03"),
            "canceling statement due to lock timeout",
            Some("CREATE TRIGGER t ON public.orders"),
        );
        assert!(err.is_lock_timeout());
        assert_eq!(err.sqlstate(), Some("55P03"));
    }

    #[test]
    fn test_from_sqlstate_classes() {
        assert_eq!(
            Error::from_sqlstate(Some("40P01"), "deadlock", None).category(),
            ErrorCategory::Deadlock
        );
        assert_eq!(
            Error::from_sqlstate(Some("08006"), "connection failure", None).category(),
            ErrorCategory::Connection
        );
        assert_eq!(
            Error::from_sqlstate(Some("23505"), "duplicate key", None).category(),
            ErrorCategory::Constraint
        );
        assert_eq!(
            Error::from_sqlstate(Some("42501"), "permission denied", None).category(),
            ErrorCategory::Authentication
        );
        let syntax = Error::from_sqlstate(Some("42601"), "syntax error", Some("CREAT"));
        assert_eq!(syntax.category(), ErrorCategory::Query);
        assert_eq!(syntax.sqlstate(), Some("42601"));
        assert_eq!(
            Error::from_sqlstate(None, "client side", None).category(),
            ErrorCategory::Query
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::connection("connection refused");
        assert!(err.to_string().contains("connection refused"));

        let err = Error::lock_timeout("could not obtain lock on relation \"orders\"");
        assert!(err.to_string().starts_with("lock timeout"));
    }
}
