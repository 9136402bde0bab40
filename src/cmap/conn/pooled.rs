use std::{
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use derive_where::derive_where;

use super::{Connection, ConnectionGeneration, ConnectionInfo, PendingConnection, Transport};
use crate::{
    bson::oid::ObjectId,
    cmap::{worker::PoolGeneration, PoolManager},
    error::Result,
    event::cmap::{
        CmapEventEmitter,
        ConnectionCheckedInEvent,
        ConnectionCheckedOutEvent,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        ConnectionReadyEvent,
    },
    timeout::TimeoutContext,
};

/// A wrapper around the [`Connection`] type that represents a connection within a connection pool.
/// This type derefs into [`Connection`], so fields and methods exposed on that type can be called
/// directly from this one.
#[derive_where(Debug)]
pub struct PooledConnection {
    connection: Connection,

    /// The connection pool generation from which this connection was checked out.
    pub(crate) generation: ConnectionGeneration,

    /// Marks the time when the connection was last checked into the pool. This value can be used
    /// to determine whether this connection is idle.
    ready_and_available_time: Option<Instant>,

    /// The manager used to check this connection back into the pool when dropped. This value is
    /// unset when the connection is checked into the pool.
    pool_manager: Option<PoolManager>,

    /// Emitter for events related to this connection.
    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}

impl PooledConnection {
    pub(crate) fn new(pending_connection: PendingConnection, stream: Box<dyn Transport>) -> Self {
        let generation = match pending_connection.generation {
            PoolGeneration::Normal(generation) => ConnectionGeneration::Normal(generation),
            PoolGeneration::LoadBalanced(_) => ConnectionGeneration::LoadBalanced(None),
        };
        let event_emitter = pending_connection.event_emitter.clone();
        Self {
            connection: pending_connection.into_connection(stream),
            generation,
            ready_and_available_time: None,
            pool_manager: None,
            event_emitter,
        }
    }

    /// User-facing information about this connection.
    pub fn info(&self) -> ConnectionInfo {
        self.connection.info()
    }

    /// Write an already-encoded message and read the server's reply. A network error marks the
    /// connection as failed, and the pool closes it when it is checked back in.
    pub async fn send_message(
        &mut self,
        message: &[u8],
        timeout_context: &TimeoutContext,
    ) -> Result<Vec<u8>> {
        self.connection.send_message(message, timeout_context).await
    }

    /// The service ID for this connection. Only returns a value if this connection is to a load
    /// balancer.
    pub(crate) fn service_id(&self) -> Option<ObjectId> {
        self.stream_description
            .as_ref()
            .and_then(|sd| sd.service_id)
    }

    /// Updates the state of the connection to indicate that it is checked into the pool.
    pub(crate) fn mark_as_available(&mut self) {
        self.pool_manager.take();
        self.ready_and_available_time = Some(Instant::now());
    }

    /// Updates the state of the connection to indicate that it is checked out of the pool.
    pub(crate) fn mark_as_in_use(&mut self, manager: PoolManager) {
        self.pool_manager = Some(manager);
        self.ready_and_available_time.take();
    }

    /// Whether this connection is idle.
    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        self.ready_and_available_time
            .and_then(|ready_and_available_time| {
                max_idle_time.map(|max_idle_time| {
                    Instant::now().duration_since(ready_and_available_time) >= max_idle_time
                })
            })
            .unwrap_or(false)
    }

    /// Whether this connection was created in an older generation than the pool's current one.
    pub(crate) fn is_stale(&self, current_generation: &PoolGeneration) -> bool {
        self.generation.is_stale(current_generation)
    }

    /// Nullify the inner state and return it in a new [`PooledConnection`] for checking back in
    /// to the pool.
    fn take(&mut self) -> Self {
        Self {
            connection: self.connection.take(),
            generation: self.generation,
            event_emitter: self.event_emitter.clone(),
            pool_manager: None,
            ready_and_available_time: None,
        }
    }

    /// Close this connection, emitting a [`ConnectionClosedEvent`] with the supplied reason.
    pub(crate) fn close_and_drop(mut self, reason: ConnectionClosedReason) {
        self.close(reason);
    }

    /// Close this connection, emitting a [`ConnectionClosedEvent`] with the supplied reason.
    fn close(&mut self, reason: ConnectionClosedReason) {
        self.pool_manager.take();
        self.event_emitter
            .emit_event(|| self.closed_event(reason).into());
    }

    /// Whether the server reported session support during the handshake.
    pub fn supports_sessions(&self) -> bool {
        self.connection
            .stream_description
            .as_ref()
            .is_some_and(|sd| sd.supports_sessions())
    }

    /// Helper to create a [`ConnectionCheckedOutEvent`] for the connection.
    pub(crate) fn checked_out_event(&self, time_started: Instant) -> ConnectionCheckedOutEvent {
        ConnectionCheckedOutEvent {
            address: self.connection.address.clone(),
            connection_id: self.connection.id,
            duration: Instant::now() - time_started,
        }
    }

    /// Helper to create a [`ConnectionCheckedInEvent`] for the connection.
    pub(crate) fn checked_in_event(&self) -> ConnectionCheckedInEvent {
        ConnectionCheckedInEvent {
            address: self.connection.address.clone(),
            connection_id: self.connection.id,
        }
    }

    /// Helper to create a [`ConnectionReadyEvent`] for the connection.
    pub(crate) fn ready_event(&self) -> ConnectionReadyEvent {
        ConnectionReadyEvent {
            address: self.connection.address.clone(),
            connection_id: self.connection.id,
            duration: Instant::now() - self.connection.time_created,
        }
    }

    /// Helper to create a [`ConnectionClosedEvent`] for the connection.
    pub(crate) fn closed_event(&self, reason: ConnectionClosedReason) -> ConnectionClosedEvent {
        ConnectionClosedEvent {
            address: self.connection.address.clone(),
            connection_id: self.connection.id,
            reason,
            error: self.connection.error().cloned(),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // If the connection has a pool manager, that means that the connection is
        // being dropped when it's checked out. If the pool is still alive, it
        // should check itself back in. Otherwise, the connection should close
        // itself and emit a ConnectionClosed event (because the `close_and_drop`
        // helper was not called explicitly).
        //
        // If the connection does not have a pool manager, then the connection is
        // being dropped while it's not checked out. This means that the pool called
        // the `close_and_drop` helper explicitly, so we don't add it back to the
        // pool or emit any events.
        if let Some(pool_manager) = self.pool_manager.take() {
            let dropped_connection = self.take();
            if let Err(mut conn) = pool_manager.check_in(dropped_connection) {
                // the check in failed because the pool has been dropped, so we emit the event
                // here and drop the connection.
                conn.close(ConnectionClosedReason::PoolClosed);
            }
        }
    }
}
