//! Error types for sqlweave.
//!
//! All engine-reported failures are translated into a [`DbError`] carrying the
//! engine's message and result code. Callers never see a raw driver error.

use thiserror::Error;

/// SQLite primary result code for `SQLITE_BUSY`.
const SQLITE_BUSY: i64 = 5;
/// SQLite primary result code for `SQLITE_LOCKED`.
const SQLITE_LOCKED: i64 = 6;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Cannot prepare statement: {message} (query: {sql})")]
    Prepare {
        message: String,
        code: Option<String>,
        sql: String,
    },

    #[error("Binding failed: {message}")]
    Bind { message: String },

    #[error("Execution failed: {message}")]
    Exec {
        message: String,
        /// Engine result code, e.g. "19" for a SQLite constraint violation
        code: Option<String>,
    },

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        code: Option<String>,
    },

    #[error("Transient conflict: {message}")]
    TransientConflict {
        message: String,
        code: Option<String>,
    },

    #[error("Expected exactly one distinct key, found {found}")]
    Cardinality { found: usize },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a statement preparation error.
    pub fn prepare(message: impl Into<String>, code: Option<String>, sql: impl Into<String>) -> Self {
        Self::Prepare {
            message: message.into(),
            code,
            sql: sql.into(),
        }
    }

    /// Create a binding error.
    pub fn bind(message: impl Into<String>) -> Self {
        Self::Bind {
            message: message.into(),
        }
    }

    /// Create an execution error.
    pub fn exec(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Exec {
            message: message.into(),
            code,
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            code,
        }
    }

    /// Create a transient (busy/locked) conflict error.
    pub fn transient(message: impl Into<String>, code: Option<String>) -> Self {
        Self::TransientConflict {
            message: message.into(),
            code,
        }
    }

    /// Create a cardinality error.
    pub fn cardinality(found: usize) -> Self {
        Self::Cardinality { found }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Engine result code carried by this error, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Prepare { code, .. }
            | Self::Exec { code, .. }
            | Self::Transaction { code, .. }
            | Self::TransientConflict { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Busy/locked conditions that the session retry loop may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientConflict { .. })
    }

    /// Errors after which the connection must not go back to the pool.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Translate a driver error raised while preparing `sql`.
    pub fn from_prepare(err: sqlx::Error, sql: &str) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                if is_busy_code(code.as_deref()) {
                    DbError::transient(db_err.message(), code)
                } else {
                    DbError::prepare(db_err.message(), code, sql)
                }
            }
            other => DbError::from(other),
        }
    }

    /// Translate a driver error raised while executing a bound statement.
    pub fn from_execution(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                if is_busy_code(code.as_deref()) {
                    DbError::transient(db_err.message(), code)
                } else {
                    DbError::exec(db_err.message(), code)
                }
            }
            other => DbError::from(other),
        }
    }

    /// Translate a driver error raised by BEGIN/COMMIT/ROLLBACK.
    pub fn from_transaction(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                if is_busy_code(code.as_deref()) {
                    DbError::transient(db_err.message(), code)
                } else {
                    DbError::transaction(db_err.message(), code)
                }
            }
            other => DbError::from(other),
        }
    }
}

/// True for `SQLITE_BUSY`/`SQLITE_LOCKED` and their extended codes.
pub(crate) fn is_busy_code(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i64>().ok())
        .map(|c| matches!(c & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
        .unwrap_or(false)
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the database locator and its options",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                if is_busy_code(code.as_deref()) {
                    DbError::transient(db_err.message(), code)
                } else {
                    DbError::exec(db_err.message(), code)
                }
            }
            sqlx::Error::RowNotFound => DbError::exec("No rows returned", None),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reopen the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check that the database file is reachable and not corrupted",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database driver compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::invalid_input(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "The connection is unusable and will be discarded",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
