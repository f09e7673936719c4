//! Database handle and sessions.
//!
//! [`Database`] owns the pool. A unit of work runs inside
//! [`Database::with_session`], which checks out a connection, opens a
//! transaction, runs the caller's block and commits or rolls back. The block
//! receives a [`Session`] from which it prepares procedures.
//!
//! # Retries
//!
//! When BEGIN or COMMIT reports a transient busy/locked conflict, the whole
//! block is run again on a freshly acquired connection, up to the configured
//! number of attempts with exponential backoff. Any other failure is returned
//! at once, after rollback.
//!
//! # Connection hand-back
//!
//! The connection goes back to the pool when the session is dropped, which
//! happens on every exit path. A session that is still inside a transaction,
//! whose rollback failed, or that saw a fatal engine error discards its
//! connection instead, so the pool never hands out a connection mid-transaction.

use super::engine::{Connector, EngineConnection};
use super::pool::{ConnectionPool, PoolStats, PooledConnection};
use super::procedure::Procedure;
use super::sqlite::SqliteConnector;
use crate::config::{DatabaseConfig, PoolOptions, RetryPolicy};
use crate::error::{DbError, DbResult};
use futures_util::future::BoxFuture;
use tracing::{debug, warn};

/// Outcome of one attempt at a unit of work.
enum Attempt<T> {
    Done(DbResult<T>),
    /// BEGIN or COMMIT hit a busy/locked conflict.
    Conflict(DbError),
}

pub struct Database<C: Connector> {
    pool: ConnectionPool<C>,
    retry: RetryPolicy,
}

impl<C: Connector> Clone for Database<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            retry: self.retry,
        }
    }
}

impl Database<SqliteConnector> {
    /// Open a SQLite database from a locator such as `sqlite:data.db`.
    ///
    /// No connection is opened until the first session needs one.
    pub fn open(locator: &str) -> DbResult<Self> {
        let config = DatabaseConfig::parse(locator).map_err(DbError::invalid_input)?;
        Self::from_config(&config)
    }

    pub fn from_config(config: &DatabaseConfig) -> DbResult<Self> {
        let connector = SqliteConnector::from_config(config)?;
        Self::new(connector, &config.pool_options, config.retry)
    }
}

impl<C: Connector> Database<C> {
    pub fn new(connector: C, pool_options: &PoolOptions, retry: RetryPolicy) -> DbResult<Self> {
        retry.validate().map_err(DbError::invalid_input)?;
        Ok(Self {
            pool: ConnectionPool::new(connector, pool_options)?,
            retry,
        })
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Run `block` inside a transaction, committing on success.
    ///
    /// The block may run more than once when BEGIN or COMMIT meets a transient
    /// conflict, so it should not have side effects outside the database.
    pub async fn with_session<T, F>(&self, mut block: F) -> DbResult<T>
    where
        F: for<'a> FnMut(&'a mut Session<C>) -> BoxFuture<'a, DbResult<T>>,
    {
        let mut attempt = 1;
        loop {
            let mut session = Session::new(self.pool.acquire().await?);
            match session.run_unit(&mut block).await {
                Attempt::Done(result) => return result,
                Attempt::Conflict(e) if attempt < self.retry.max_attempts => {
                    drop(session);
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient conflict, retrying unit of work"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Attempt::Conflict(e) => {
                    warn!(
                        attempts = attempt,
                        error = %e,
                        "Transient conflict persisted, giving up"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Run `block` on a pooled connection in autocommit mode.
    ///
    /// No transaction is opened and nothing is retried. The block can still
    /// open one with [`Session::with_transaction`].
    pub async fn with_connection<T, F>(&self, block: F) -> DbResult<T>
    where
        F: for<'a> FnOnce(&'a mut Session<C>) -> BoxFuture<'a, DbResult<T>>,
    {
        let mut session = Session::new(self.pool.acquire().await?);
        let result = block(&mut session).await;
        if let Err(e) = &result {
            session.note_error(e);
        }
        result
    }

    /// Close idle connections. Checked-out connections close on release.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// One checked-out connection and its transaction depth.
pub struct Session<C: Connector> {
    connection: PooledConnection<C>,
    depth: u32,
    poisoned: bool,
}

impl<C: Connector> Session<C> {
    fn new(connection: PooledConnection<C>) -> Self {
        Self {
            connection,
            depth: 0,
            poisoned: false,
        }
    }

    /// Prepare a procedure on this session's connection.
    pub fn prepare(&mut self, sql: impl Into<String>) -> Procedure<'_, C::Connection> {
        Procedure::new(&mut *self.connection, sql)
    }

    /// Run `block` in a transaction scope.
    ///
    /// At depth zero this begins a transaction and commits or rolls back
    /// around the block. Nested calls reuse the open transaction; their errors
    /// propagate to the enclosing scope, which decides the outcome.
    pub async fn with_transaction<T, F>(&mut self, block: F) -> DbResult<T>
    where
        F: for<'a> FnOnce(&'a mut Session<C>) -> BoxFuture<'a, DbResult<T>>,
    {
        if self.depth > 0 {
            self.depth += 1;
            let result = block(&mut *self).await;
            self.depth -= 1;
            if let Err(e) = &result {
                self.note_error(e);
            }
            return result;
        }

        self.start_transaction().await?;
        match block(&mut *self).await {
            Ok(value) => match self.commit().await {
                Ok(()) => Ok(value),
                Err(e) => {
                    self.rollback_after(&e).await;
                    Err(e)
                }
            },
            Err(e) => {
                self.rollback_after(&e).await;
                Err(e)
            }
        }
    }

    /// Current transaction nesting depth; zero in autocommit mode.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    /// Pool id of the underlying connection.
    pub fn connection_id(&self) -> u64 {
        self.connection.id()
    }

    async fn run_unit<T, F>(&mut self, block: &mut F) -> Attempt<T>
    where
        F: for<'a> FnMut(&'a mut Session<C>) -> BoxFuture<'a, DbResult<T>>,
    {
        if let Err(e) = self.start_transaction().await {
            return if e.is_transient() {
                Attempt::Conflict(e)
            } else {
                Attempt::Done(Err(e))
            };
        }

        match block(&mut *self).await {
            Ok(value) => match self.commit().await {
                Ok(()) => Attempt::Done(Ok(value)),
                Err(e) => {
                    self.rollback_after(&e).await;
                    if e.is_transient() {
                        Attempt::Conflict(e)
                    } else {
                        Attempt::Done(Err(e))
                    }
                }
            },
            Err(e) => {
                self.rollback_after(&e).await;
                Attempt::Done(Err(e))
            }
        }
    }

    pub(crate) async fn start_transaction(&mut self) -> DbResult<()> {
        debug!(connection_id = self.connection.id(), "Starting transaction");
        if let Err(e) = self.connection.begin().await {
            self.note_error(&e);
            return Err(e);
        }
        self.depth = 1;
        Ok(())
    }

    pub(crate) async fn commit(&mut self) -> DbResult<()> {
        debug!(connection_id = self.connection.id(), "Committing transaction");
        self.connection.commit().await?;
        self.depth = 0;
        Ok(())
    }

    pub(crate) async fn rollback(&mut self) -> DbResult<()> {
        debug!(connection_id = self.connection.id(), "Rolling back transaction");
        let result = self.connection.rollback().await;
        self.depth = 0;
        if result.is_err() {
            // Transaction state is unknown; never hand this connection out again
            self.poisoned = true;
        }
        result
    }

    /// Roll back after `cause`. A rollback failure is logged; `cause` still wins.
    async fn rollback_after(&mut self, cause: &DbError) {
        self.note_error(cause);
        if let Err(e) = self.rollback().await {
            warn!(
                connection_id = self.connection.id(),
                error = %e,
                cause = %cause,
                "Rollback failed"
            );
        }
    }

    fn note_error(&mut self, e: &DbError) {
        if e.is_fatal() {
            self.poisoned = true;
        }
    }
}

impl<C: Connector> Drop for Session<C> {
    fn drop(&mut self) {
        if self.depth > 0 || self.poisoned {
            warn!(
                connection_id = self.connection.id(),
                depth = self.depth,
                poisoned = self.poisoned,
                "Discarding connection instead of releasing it"
            );
            self.connection.mark_discard();
        }
    }
}
