//! Connection pool.
//!
//! Physical connections are created lazily through a [`Connector`], up to
//! `max_connections`, and tracked in a map from handle id to slot. A semaphore
//! bounds how many are checked out at once; the slot map is the only state
//! behind a lock.
//!
//! A checked-out connection is a [`PooledConnection`]. Dropping it returns the
//! connection to the idle set, unless it was marked for discard after a fatal
//! engine error, in which case the slot is removed and the connection closed.

use super::engine::{Connector, EngineConnection};
use crate::config::PoolOptions;
use crate::error::{DbError, DbResult};
use serde::Serialize;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections currently open (idle + in use).
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub discarded: u64,
    pub acquisitions: u64,
    pub releases: u64,
    pub timeouts: u64,
}

struct Slot<E> {
    /// `None` while checked out or while the connection is being opened.
    connection: Option<E>,
    in_use: bool,
    created_at: Instant,
}

struct PoolState<E> {
    slots: HashMap<u64, Slot<E>>,
    closed: bool,
    stats: PoolStats,
}

struct PoolInner<C: Connector> {
    connector: C,
    max_connections: usize,
    acquire_timeout: Duration,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState<C::Connection>>,
    next_id: AtomicU64,
}

impl<C: Connector> PoolInner<C> {
    fn lock(&self) -> MutexGuard<'_, PoolState<C::Connection>> {
        // A panic while holding the lock leaves the map consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn put_back(&self, id: u64, connection: C::Connection) {
        let mut state = self.lock();
        state.stats.releases += 1;
        if state.closed {
            state.slots.remove(&id);
            debug!(connection_id = id, "Pool closed, dropping released connection");
            return;
        }
        match state.slots.get_mut(&id) {
            Some(slot) => {
                slot.connection = Some(connection);
                slot.in_use = false;
                debug!(
                    connection_id = id,
                    age_ms = slot.created_at.elapsed().as_millis() as u64,
                    "Connection returned to pool"
                );
            }
            None => warn!(connection_id = id, "Released connection has no slot"),
        }
    }

    fn remove(&self, id: u64) {
        let mut state = self.lock();
        state.slots.remove(&id);
        state.stats.discarded += 1;
        warn!(connection_id = id, "Discarded pooled connection");
    }
}

/// A bounded pool of lazily opened engine connections.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, options: &PoolOptions) -> DbResult<Self> {
        options.validate().map_err(DbError::invalid_input)?;
        let max_connections = options.max_connections_or_default() as usize;

        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                max_connections,
                acquire_timeout: Duration::from_secs(options.acquire_timeout_or_default()),
                semaphore: Arc::new(Semaphore::new(max_connections)),
                state: Mutex::new(PoolState {
                    slots: HashMap::new(),
                    closed: false,
                    stats: PoolStats::default(),
                }),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn max_connections(&self) -> usize {
        self.inner.max_connections
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Check out a connection, reusing an idle one or opening a new one.
    ///
    /// Waits up to the acquire timeout when every connection is in use.
    pub async fn acquire(&self) -> DbResult<PooledConnection<C>> {
        if self.inner.lock().closed {
            return Err(pool_closed());
        }

        let permit = match tokio::time::timeout(
            self.inner.acquire_timeout,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(pool_closed()),
            Err(_) => {
                self.inner.lock().stats.timeouts += 1;
                return Err(DbError::timeout(
                    "connection pool acquire",
                    self.inner.acquire_timeout.as_secs(),
                ));
            }
        };

        let idle = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(pool_closed());
            }
            let found = state.slots.iter_mut().find_map(|(id, slot)| {
                if slot.in_use {
                    return None;
                }
                let connection = slot.connection.take()?;
                slot.in_use = true;
                Some((*id, connection))
            });
            if found.is_some() {
                state.stats.acquisitions += 1;
            }
            found
        };

        if let Some((id, connection)) = idle {
            debug!(connection_id = id, "Reusing idle connection");
            return Ok(PooledConnection::new(id, connection, &self.inner, permit));
        }

        // Reserve the slot before connecting so the size bound holds while the
        // lock is released.
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().slots.insert(
            id,
            Slot {
                connection: None,
                in_use: true,
                created_at: Instant::now(),
            },
        );
        let reservation = Reservation {
            pool: &self.inner,
            id,
            armed: true,
        };

        let connection = match self.inner.connector.connect().await {
            Ok(connection) => connection,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                return Err(DbError::connection(
                    e.to_string(),
                    "Check the database locator and that the engine is reachable",
                ));
            }
        };
        reservation.disarm();

        {
            let mut state = self.inner.lock();
            state.stats.created += 1;
            state.stats.acquisitions += 1;
        }
        info!(connection_id = id, "Created pooled connection");
        Ok(PooledConnection::new(id, connection, &self.inner, permit))
    }

    /// Return a connection to the idle set.
    pub fn release(&self, connection: PooledConnection<C>) {
        connection.release();
    }

    /// Drop a connection without returning it to the idle set.
    pub fn discard(&self, connection: PooledConnection<C>) {
        connection.discard();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        let idle = state
            .slots
            .values()
            .filter(|slot| !slot.in_use && slot.connection.is_some())
            .count();
        PoolStats {
            size: state.slots.len(),
            idle,
            in_use: state.slots.values().filter(|slot| slot.in_use).count(),
            ..state.stats.clone()
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Close idle connections and refuse further acquires.
    ///
    /// Connections still checked out are closed when they come back.
    pub async fn close(&self) {
        let idle: Vec<(u64, C::Connection)> = {
            let mut state = self.inner.lock();
            state.closed = true;
            let ids: Vec<u64> = state
                .slots
                .iter()
                .filter(|(_, slot)| !slot.in_use)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let slot = state.slots.remove(&id)?;
                    slot.connection.map(|connection| (id, connection))
                })
                .collect()
        };
        self.inner.semaphore.close();

        let count = idle.len();
        for (id, connection) in idle {
            if let Err(e) = connection.close().await {
                warn!(connection_id = id, error = %e, "Failed to close connection");
            }
        }
        info!(closed = count, "Connection pool closed");
    }
}

fn pool_closed() -> DbError {
    DbError::connection("Connection pool is closed", "Open a new database handle")
}

/// Removes a reserved slot if opening its connection fails or is cancelled.
struct Reservation<'p, C: Connector> {
    pool: &'p PoolInner<C>,
    id: u64,
    armed: bool,
}

impl<C: Connector> Reservation<'_, C> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C: Connector> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.lock().slots.remove(&self.id);
        }
    }
}

/// A connection checked out of a [`ConnectionPool`].
pub struct PooledConnection<C: Connector> {
    id: u64,
    // Some until Drop takes it back for the pool
    connection: Option<C::Connection>,
    pool: Arc<PoolInner<C>>,
    discard: bool,
    // Released after the connection is back in the idle set
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledConnection<C> {
    fn new(
        id: u64,
        connection: C::Connection,
        pool: &Arc<PoolInner<C>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            id,
            connection: Some(connection),
            pool: Arc::clone(pool),
            discard: false,
            _permit: permit,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Do not return this connection to the pool when it is dropped.
    pub fn mark_discard(&mut self) {
        self.discard = true;
    }

    pub fn is_marked_for_discard(&self) -> bool {
        self.discard
    }

    pub fn release(self) {}

    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("pooled connection is present until dropped")
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("pooled connection is present until dropped")
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        if self.discard {
            drop(connection);
            self.pool.remove(self.id);
        } else {
            self.pool.put_back(self.id, connection);
        }
    }
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("discard", &self.discard)
            .finish()
    }
}
