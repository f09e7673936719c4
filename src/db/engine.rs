//! Engine boundary.
//!
//! The pool, sessions and procedures only talk to a database through these two
//! traits. [`Connector`] is the connection factory handed to the pool, and
//! [`EngineConnection`] is one live engine session.
//!
//! Implementations translate every engine failure into a [`DbError`] carrying
//! the engine's message and result code.
//!
//! [`DbError`]: crate::error::DbError

use crate::error::DbResult;
use crate::models::{Row, Value};
use futures_util::stream::BoxStream;
use std::future::Future;

/// Lazy, forward-only rows of one statement execution.
pub type RowStream<'c> = BoxStream<'c, DbResult<Row>>;

/// Result of a statement run for its side effects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    pub last_insert_id: i64,
}

/// Opens physical connections on demand.
pub trait Connector: Send + Sync + 'static {
    type Connection: EngineConnection;

    fn connect(&self) -> impl Future<Output = DbResult<Self::Connection>> + Send;
}

pub trait EngineConnection: Send + 'static {
    fn begin(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    fn commit(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    fn rollback(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    /// Prepare (or reuse) `sql`, bind `params` at positions 1..=n and run it.
    fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = DbResult<ExecOutcome>> + Send;

    /// Prepare (or reuse) `sql`, bind `params` and return its rows lazily.
    ///
    /// Dropping the stream finalizes the engine cursor.
    fn fetch<'c>(
        &'c mut self,
        sql: &'c str,
        params: &'c [Value],
    ) -> impl Future<Output = DbResult<RowStream<'c>>> + Send + 'c;

    /// Row id generated by the most recent successful insert.
    fn last_insert_id(&self) -> i64;

    /// Rows changed by the most recent `execute`.
    fn affected_rows(&self) -> u64;

    fn close(self) -> impl Future<Output = DbResult<()>> + Send
    where
        Self: Sized;
}
