//! sqlweave
//!
//! A data-access layer over SQLite: a lazily filled connection pool,
//! transactional sessions that retry on busy/locked conflicts, procedures with
//! list placeholders and type-tagged parameters, and a lazy pipeline that
//! reshapes joined rows into nested structures.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod pipeline;

pub use config::{Config, DatabaseConfig, PoolOptions, RetryPolicy};
pub use db::{Database, Procedure, RowCursor, Session};
pub use error::{DbError, DbResult};
pub use models::{ParamType, Row, Value};
pub use pipeline::{Collection, Node, Pipeline, Record};
