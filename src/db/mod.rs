//! Database access layer.
//!
//! This module provides:
//! - The engine boundary traits and the SQLite adapter
//! - Connection pooling with lazy connection creation
//! - Sessions with transactional scopes and retry on transient conflicts
//! - Procedures: placeholder expansion, type-tagged binding and lazy fetch

pub mod cache;
pub mod cursor;
pub mod engine;
pub mod expand;
pub mod params;
pub mod pool;
pub mod procedure;
pub mod session;
pub mod sqlite;

pub use cache::{CacheStats, StatementCache};
pub use cursor::RowCursor;
pub use engine::{Connector, EngineConnection, ExecOutcome, RowStream};
pub use expand::BoundQuery;
pub use params::{Binding, TaggedValue};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use procedure::Procedure;
pub use session::{Database, Session};
pub use sqlite::{SqliteConnector, SqliteHandle};
