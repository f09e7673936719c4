//! SQLite adapter over `sqlx`.
//!
//! [`SqliteConnector`] opens one `SqliteConnection` per pooled slot and wraps it
//! in a [`SqliteHandle`]. The driver's own statement cache is sized from the
//! configured capacity, and the handle's [`StatementCache`] tracks which
//! expanded statements that cache holds.

use super::cache::StatementCache;
use super::engine::{Connector, EngineConnection, ExecOutcome, RowStream};
use crate::config::DatabaseConfig;
use crate::error::{DbError, DbResult};
use crate::models::{ParamType, Row, Value};
use futures_util::StreamExt;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{
    Column as _, ConnectOptions as _, Connection as _, Row as _, Sqlite, TypeInfo as _,
    ValueRef as _,
};
use std::str::FromStr;
use tracing::{debug, info};

/// Opens SQLite connections for the pool.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    options: SqliteConnectOptions,
    statement_cache: usize,
}

impl SqliteConnector {
    pub fn new(options: SqliteConnectOptions, statement_cache: usize) -> Self {
        Self {
            options: options.statement_cache_capacity(statement_cache),
            statement_cache,
        }
    }

    /// Build connect options from a parsed locator.
    pub fn from_config(config: &DatabaseConfig) -> DbResult<Self> {
        let mut options = SqliteConnectOptions::from_str(&config.connection_string)
            .map_err(|e| {
                DbError::connection(
                    format!("Invalid SQLite locator: {}", e),
                    "Use sqlite:path.db, sqlite://path.db or sqlite::memory:",
                )
            })?
            .create_if_missing(!config.read_only)
            .read_only(config.read_only);

        if let Some(timeout) = config.busy_timeout() {
            options = options.busy_timeout(timeout);
        }

        // Only SQLCipher builds act on the key; stock SQLite ignores the pragma.
        if let Some(key) = &config.encryption_key {
            options = options.pragma("key", quote_literal(key));
        }

        Ok(Self::new(options, config.statement_cache_or_default()))
    }
}

/// Render `value` as a single-quoted SQL string literal.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

impl Connector for SqliteConnector {
    type Connection = SqliteHandle;

    async fn connect(&self) -> DbResult<SqliteHandle> {
        let raw = self.options.connect().await.map_err(|e| {
            DbError::connection(
                e.to_string(),
                "Check that the database file exists and is readable",
            )
        })?;
        info!(
            filename = %self.options.get_filename().display(),
            statement_cache = self.statement_cache,
            "Opened SQLite connection"
        );
        Ok(SqliteHandle {
            raw,
            statements: StatementCache::new(self.statement_cache),
            last: ExecOutcome::default(),
        })
    }
}

/// One live SQLite connection plus the record of its prepared statements.
pub struct SqliteHandle {
    raw: SqliteConnection,
    statements: StatementCache,
    last: ExecOutcome,
}

impl SqliteHandle {
    pub fn statement_cache(&self) -> &StatementCache {
        &self.statements
    }

    /// Prepared statements the driver currently keeps for this connection.
    pub fn cached_statements(&self) -> usize {
        self.raw.cached_statements_size()
    }

    async fn control(&mut self, command: &'static str) -> DbResult<()> {
        sqlx::Executor::execute(&mut self.raw, command)
            .await
            .map(|_| ())
            .map_err(DbError::from_transaction)
    }
}

/// Make sure the driver has `sql` prepared, preparing it on a cache miss.
///
/// Returns whether the statement may stay in the driver's cache afterwards.
async fn prepare_cached(
    raw: &mut SqliteConnection,
    statements: &mut StatementCache,
    sql: &str,
) -> DbResult<bool> {
    if statements.touch(sql) {
        debug!(sql = %sql, "Statement cache hit");
        return Ok(true);
    }

    debug!(sql = %sql, "Preparing statement");
    sqlx::Executor::prepare(&mut *raw, sql)
        .await
        .map_err(|e| DbError::from_prepare(e, sql))?;
    if let Some(evicted) = statements.insert(sql) {
        debug!(sql = %evicted, "Statement evicted from cache");
    }
    Ok(statements.is_enabled())
}

/// Bind one resolved value at the next position.
fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Integer(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.as_str()),
        Value::Blob(v) => query.bind(v.as_slice()),
    }
}

impl EngineConnection for SqliteHandle {
    async fn begin(&mut self) -> DbResult<()> {
        self.control("BEGIN TRANSACTION").await
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.control("COMMIT").await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.control("ROLLBACK").await
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> DbResult<ExecOutcome> {
        let Self {
            raw,
            statements,
            last,
        } = self;
        let persistent = prepare_cached(raw, statements, sql).await?;

        debug!(sql = %sql, params = ?params.len(), "Executing statement");
        let query = params
            .iter()
            .fold(sqlx::query::<Sqlite>(sql).persistent(persistent), bind_value);
        let result = query
            .execute(&mut *raw)
            .await
            .map_err(DbError::from_execution)?;

        *last = ExecOutcome {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_rowid(),
        };
        Ok(*last)
    }

    async fn fetch<'c>(
        &'c mut self,
        sql: &'c str,
        params: &'c [Value],
    ) -> DbResult<RowStream<'c>> {
        let Self {
            raw, statements, ..
        } = self;
        let persistent = prepare_cached(raw, statements, sql).await?;

        debug!(sql = %sql, params = ?params.len(), "Fetching rows");
        let query = params
            .iter()
            .fold(sqlx::query::<Sqlite>(sql).persistent(persistent), bind_value);
        let rows = query.fetch(raw).map(|result| {
            result
                .map_err(DbError::from_execution)
                .and_then(|row| decode_row(&row))
        });
        Ok(rows.boxed())
    }

    fn last_insert_id(&self) -> i64 {
        self.last.last_insert_id
    }

    fn affected_rows(&self) -> u64 {
        self.last.rows_affected
    }

    async fn close(self) -> DbResult<()> {
        self.raw.close().await.map_err(DbError::from)
    }
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Map a SQLite type name onto the binding type that reads it back.
///
/// Values carry one of the five storage classes, but declared column types
/// (`VARCHAR(255)`, `DOUBLE`, ...) follow SQLite's affinity rules.
pub fn storage_class(type_name: &str) -> Option<ParamType> {
    let upper = type_name.to_ascii_uppercase();
    if upper == "NULL" {
        None
    } else if upper.contains("INT") || upper == "BOOLEAN" {
        Some(ParamType::Integer)
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        Some(ParamType::Text)
    } else if upper.contains("BLOB") {
        Some(ParamType::Blob)
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        Some(ParamType::Float)
    } else if upper == "NUMERIC" {
        Some(ParamType::Float)
    } else {
        Some(ParamType::Text)
    }
}

fn decode_row(row: &SqliteRow) -> DbResult<Row> {
    let mut decoded = Row::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        decoded.push(column.name(), decode_column(row, idx)?);
    }
    Ok(decoded)
}

fn decode_column(row: &SqliteRow, idx: usize) -> DbResult<Value> {
    let class = {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        storage_class(raw.type_info().name())
    };

    let value = match class {
        None => Value::Null,
        Some(ParamType::Integer) => Value::Integer(row.try_get::<i64, _>(idx)?),
        Some(ParamType::Float) => Value::Float(row.try_get::<f64, _>(idx)?),
        Some(ParamType::Blob) => Value::Blob(row.try_get::<Vec<u8>, _>(idx)?),
        Some(ParamType::Text) => match row.try_get::<String, _>(idx) {
            Ok(text) => Value::Text(text),
            // Text that is not valid UTF-8 comes back as raw bytes
            Err(_) => Value::Blob(row.try_get::<Vec<u8>, _>(idx)?),
        },
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_memory(capacity: usize) -> SqliteHandle {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        SqliteConnector::new(options, capacity).connect().await.unwrap()
    }

    #[tokio::test]
    async fn test_driver_cache_is_bounded() {
        let mut handle = open_memory(2).await;
        for i in 0..10 {
            handle.execute(&format!("SELECT {}", i), &[]).await.unwrap();
        }

        assert_eq!(handle.cached_statements(), 2);
        assert_eq!(handle.statement_cache().len(), 2);
        assert_eq!(handle.statement_cache().stats().evictions, 8);
        assert!(handle.statement_cache().contains("SELECT 9"));
        assert!(!handle.statement_cache().contains("SELECT 0"));
    }

    #[tokio::test]
    async fn test_driver_cache_reuses_statement() {
        let mut handle = open_memory(4).await;
        for i in 0..3 {
            handle
                .execute("SELECT ? AS v", &[Value::Integer(i)])
                .await
                .unwrap();
        }

        assert_eq!(handle.cached_statements(), 1);
        let stats = handle.statement_cache().stats();
        assert_eq!((stats.hits, stats.misses), (2, 1));
    }

    #[tokio::test]
    async fn test_zero_capacity_keeps_nothing() {
        let mut handle = open_memory(0).await;
        handle.execute("SELECT 1", &[]).await.unwrap();
        handle.execute("SELECT ?", &[Value::Integer(1)]).await.unwrap();
        handle.execute("SELECT 1", &[]).await.unwrap();

        assert_eq!(handle.cached_statements(), 0);
        assert!(handle.statement_cache().is_empty());
        assert_eq!(handle.statement_cache().stats().hits, 0);
        assert_eq!(handle.statement_cache().stats().misses, 3);
    }

    #[tokio::test]
    async fn test_failed_prepare_is_not_cached() {
        let mut handle = open_memory(4).await;
        let err = handle
            .execute("SELECT * FROM missing", &[])
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Prepare { .. }));
        assert!(handle.statement_cache().is_empty());
        assert_eq!(handle.statement_cache().stats().misses, 1);
    }

    #[tokio::test]
    async fn test_encryption_key_is_accepted() {
        let config = DatabaseConfig::parse("sqlite::memory:?encryption_key=it%27s").unwrap();
        let mut handle = SqliteConnector::from_config(&config)
            .unwrap()
            .connect()
            .await
            .unwrap();
        handle.execute("SELECT 1", &[]).await.unwrap();
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_storage_class_of_values() {
        assert_eq!(storage_class("INTEGER"), Some(ParamType::Integer));
        assert_eq!(storage_class("REAL"), Some(ParamType::Float));
        assert_eq!(storage_class("TEXT"), Some(ParamType::Text));
        assert_eq!(storage_class("BLOB"), Some(ParamType::Blob));
        assert_eq!(storage_class("NULL"), None);
    }

    #[test]
    fn test_storage_class_of_declared_types() {
        assert_eq!(storage_class("VARCHAR(255)"), Some(ParamType::Text));
        assert_eq!(storage_class("BIGINT"), Some(ParamType::Integer));
        assert_eq!(storage_class("DOUBLE PRECISION"), Some(ParamType::Float));
        assert_eq!(storage_class("boolean"), Some(ParamType::Integer));
        assert_eq!(storage_class("DATETIME"), Some(ParamType::Text));
    }
}
