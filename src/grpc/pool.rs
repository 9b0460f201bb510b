//! Bounded connection pool for the backend
//!
//! Transport connections to the single upstream are dialed lazily and shared
//! by many concurrent streams. Each connection carries up to
//! `max_concurrent_streams` calls; once every connection is full a new one is
//! dialed, up to `max_active`. At the ceiling the pool either oversubscribes
//! the least-loaded connection (`reuse`) or refuses the call.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;

use crate::config::PoolConfig;
use crate::error::PoolError;

/// Dials transport connections to the backend.
///
/// The health hook lets a connector veto an idle connection before it is
/// handed out again.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Clone + Send + Sync + 'static;

    async fn connect(&self) -> Result<Self::Conn, PoolError>;

    fn is_healthy(&self, _conn: &Self::Conn) -> bool {
        true
    }
}

/// Snapshot of pool accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub connections: usize,
    pub idle_connections: usize,
    pub active_streams: usize,
    pub dialing: usize,
}

pub struct ConnectionPool<C: Connector> {
    connector: C,
    shared: Arc<Shared<C::Conn>>,
}

struct Shared<T> {
    config: PoolConfig,
    state: Mutex<PoolState<T>>,
    /// Signalled whenever a dial settles
    dial_settled: Notify,
}

struct PoolState<T> {
    slots: Vec<Slot<T>>,
    dialing: usize,
    next_id: u64,
    closed: bool,
}

struct Slot<T> {
    id: u64,
    conn: T,
    streams: usize,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, id: u64) {
        let mut state = self.lock();
        if state.closed {
            return;
        }

        let Some(pos) = state.slots.iter().position(|slot| slot.id == id) else {
            return;
        };
        let slot = &mut state.slots[pos];
        slot.streams = slot.streams.saturating_sub(1);

        let idle = state.slots.iter().filter(|slot| slot.streams == 0).count();
        if state.slots[pos].streams == 0 && idle > self.config.max_idle {
            state.slots.remove(pos);
            tracing::debug!(slot = id, "Closed surplus idle backend connection");
        }
    }
}

impl<T> PoolState<T> {
    fn stats(&self) -> PoolStats {
        PoolStats {
            connections: self.slots.len(),
            idle_connections: self.slots.iter().filter(|s| s.streams == 0).count(),
            active_streams: self.slots.iter().map(|s| s.streams).sum(),
            dialing: self.dialing,
        }
    }

    fn insert(&mut self, conn: T, streams: usize) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.push(Slot { id, conn, streams });
        id
    }
}

enum Checkout<T> {
    Ready(PooledConnection<T>),
    Dial(DialReservation<T>),
    /// At the ceiling with nothing usable yet, but a dial is in flight
    Wait,
}

/// Counts a dial in progress against the ceiling until it settles.
/// A caller that gives up mid-dial gives the reservation back on drop.
struct DialReservation<T> {
    shared: Arc<Shared<T>>,
    armed: bool,
}

impl<T> DialReservation<T> {
    fn settle(mut self, state: &mut PoolState<T>) {
        state.dialing -= 1;
        self.armed = false;
        self.shared.dial_settled.notify_waiters();
    }
}

impl<T> Drop for DialReservation<T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.lock().dialing -= 1;
            self.shared.dial_settled.notify_waiters();
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self {
            connector,
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PoolState {
                    slots: Vec::new(),
                    dialing: 0,
                    next_id: 0,
                    closed: false,
                }),
                dial_settled: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Check out a connection for one call, dialing if every connection is full
    pub async fn acquire(&self) -> Result<PooledConnection<C::Conn>, PoolError> {
        let reservation = loop {
            // Registered before checking so a dial settling in between is not missed
            let settled = self.shared.dial_settled.notified();
            match self.checkout()? {
                Checkout::Ready(conn) => return Ok(conn),
                Checkout::Dial(reservation) => break reservation,
                Checkout::Wait => settled.await,
            }
        };

        let conn = self.dial().await;

        let mut state = self.shared.lock();
        reservation.settle(&mut state);
        let conn = conn?;
        if state.closed {
            return Err(PoolError::Closed);
        }

        let id = state.insert(conn.clone(), 1);
        tracing::debug!(
            slot = id,
            connections = state.slots.len(),
            "Dialed new backend connection"
        );
        Ok(PooledConnection::new(conn, id, &self.shared))
    }

    fn checkout(&self) -> Result<Checkout<C::Conn>, PoolError> {
        let config = &self.shared.config;
        let mut state = self.shared.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }

        state
            .slots
            .retain(|slot| slot.streams > 0 || self.connector.is_healthy(&slot.conn));

        let max_streams = config.max_concurrent_streams.max(1);
        if let Some(slot) = state
            .slots
            .iter_mut()
            .filter(|slot| slot.streams < max_streams)
            .min_by_key(|slot| slot.streams)
        {
            slot.streams += 1;
            return Ok(Checkout::Ready(PooledConnection::new(
                slot.conn.clone(),
                slot.id,
                &self.shared,
            )));
        }

        if state.slots.len() + state.dialing < config.max_active {
            state.dialing += 1;
            return Ok(Checkout::Dial(DialReservation {
                shared: self.shared.clone(),
                armed: true,
            }));
        }

        if config.reuse
            && let Some(slot) = state.slots.iter_mut().min_by_key(|slot| slot.streams)
        {
            slot.streams += 1;
            return Ok(Checkout::Ready(PooledConnection::new(
                slot.conn.clone(),
                slot.id,
                &self.shared,
            )));
        }

        if state.dialing > 0 {
            return Ok(Checkout::Wait);
        }

        Err(PoolError::Exhausted {
            max_active: config.max_active,
        })
    }

    async fn dial(&self) -> Result<C::Conn, PoolError> {
        let timeout: Duration = self.shared.config.dial_timeout();
        match tokio::time::timeout(timeout, self.connector.connect()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => {
                crate::metrics::record_dial_failure();
                Err(e)
            }
            Err(_) => {
                crate::metrics::record_dial_failure();
                Err(PoolError::DialTimeout(timeout))
            }
        }
    }

    /// Pre-dial idle connections up to the idle floor
    pub async fn warm_up(&self) -> Result<usize, PoolError> {
        let mut dialed = 0;
        loop {
            let reservation = {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                let total = state.slots.len() + state.dialing;
                if total >= self.shared.config.max_idle || total >= self.shared.config.max_active
                {
                    return Ok(dialed);
                }
                state.dialing += 1;
                DialReservation {
                    shared: self.shared.clone(),
                    armed: true,
                }
            };

            let conn = self.dial().await;
            let mut state = self.shared.lock();
            reservation.settle(&mut state);
            let conn = conn?;
            if state.closed {
                return Err(PoolError::Closed);
            }
            state.insert(conn, 0);
            dialed += 1;
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.lock().stats()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Close every pooled connection.
    ///
    /// Calls holding a handle keep their connection; releasing it afterwards
    /// is a no-op. A second shutdown reports [`PoolError::Closed`].
    pub fn shutdown(&self) -> Result<(), PoolError> {
        let drained = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            state.closed = true;
            std::mem::take(&mut state.slots)
        };

        tracing::info!(connections = drained.len(), "Backend connection pool shut down");
        Ok(())
    }
}

/// A connection checked out for exactly one call.
///
/// Returned to the pool by [`PooledConnection::close`] or on drop, whichever
/// comes first.
pub struct PooledConnection<T> {
    conn: T,
    slot: u64,
    pool: Weak<Shared<T>>,
    released: bool,
}

impl<T> PooledConnection<T> {
    fn new(conn: T, slot: u64, shared: &Arc<Shared<T>>) -> Self {
        Self {
            conn,
            slot,
            pool: Arc::downgrade(shared),
            released: false,
        }
    }

    /// The underlying transport handle
    pub fn value(&self) -> &T {
        &self.conn
    }

    /// Return the connection to the pool
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(shared) = self.pool.upgrade() {
            shared.release(self.slot);
        }
    }
}

impl<T> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T> std::fmt::Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot", &self.slot)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}
