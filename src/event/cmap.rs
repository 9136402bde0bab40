//! Contains the events and functionality for monitoring behavior of the connection pooling of a
//! [`Topology`](crate::Topology).

use std::time::Duration;

use derive_more::From;

use crate::{
    bson::oid::ObjectId,
    error::Error,
    event::EventHandler,
    options::ServerAddress,
    trace::{connection::ConnectionTracingEventEmitter, CONNECTION_TRACING_EVENT_TARGET},
};

/// Event emitted when a connection pool is created.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct PoolCreatedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,

    /// The maximum number of connections the pool will manage.
    pub max_pool_size: u32,

    /// The number of connections the pool keeps open once ready.
    pub min_pool_size: u32,

    /// The maximum number of connections the pool establishes concurrently.
    pub max_connecting: u32,

    /// How long a connection may sit idle before it is closed.
    pub max_idle_time: Option<Duration>,
}

/// Event emitted when a connection pool becomes ready.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct PoolReadyEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a connection pool is cleared.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct PoolClearedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,

    /// If the connection is to a load balancer, the id of the selected backend.
    pub service_id: Option<ObjectId>,

    /// Whether in-use connections were interrupted when the pool was cleared.
    pub interrupt_in_use_connections: bool,
}

/// Event emitted when a connection pool is closed.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct PoolClosedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a connection is created.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionCreatedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,

    /// The unique ID of the connection. This is not used for anything internally, but can be used
    /// to identify other events related to this connection.
    pub connection_id: u32,
}

/// Event emitted when a connection is ready to be used. This indicates that all the necessary
/// prerequisites for using a connection (handshake, authentication, etc.) have been completed.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionReadyEvent {
    /// The address of the server that the connection is connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// The time it took to establish the connection.
    pub duration: Duration,
}

/// Event emitted when a connection is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    /// The address of the server that the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// The reason that the connection was closed.
    pub reason: ConnectionClosedReason,

    /// The error that caused the connection to close, if any.
    pub error: Option<Error>,
}

/// The reasons that a connection may be closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The connection pool has been cleared since the connection was created.
    Stale,

    /// The connection has been available for longer than `max_idle_time` without being used.
    Idle,

    /// An error occurred while using the connection.
    Error,

    /// The connection was dropped while a command was still executing on it.
    Dropped,

    /// The pool that the connection belongs to has been closed.
    PoolClosed,
}

/// Event emitted when a thread begins checking out a connection to use for an operation.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionCheckoutStartedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a thread is unable to check out a connection.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckoutFailedEvent {
    /// The address of the server that the connection would have connected to.
    pub address: ServerAddress,

    /// The reason a connection was unable to be checked out.
    pub reason: ConnectionCheckoutFailedReason,

    /// The error that caused the checkout to fail.
    pub error: Option<Error>,

    /// How long the checkout took before failing.
    pub duration: Duration,
}

/// The reasons a connection may not be able to be checked out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionCheckoutFailedReason {
    /// The pool was closed.
    PoolClosed,

    /// The checkout ran out of time or was cancelled.
    Timeout,

    /// An error occurred while trying to establish a connection, or the pool was cleared.
    ConnectionError,
}

/// Event emitted when a connection is successfully checked out.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionCheckedOutEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// How long the checkout took.
    pub duration: Duration,
}

/// Event emitted when a connection is checked back into a connection pool.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ConnectionCheckedInEvent {
    /// The address of the server that the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,
}

#[derive(Clone, Debug, From)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum CmapEvent {
    PoolCreated(PoolCreatedEvent),
    PoolReady(PoolReadyEvent),
    PoolCleared(PoolClearedEvent),
    PoolClosed(PoolClosedEvent),
    ConnectionCreated(ConnectionCreatedEvent),
    ConnectionReady(ConnectionReadyEvent),
    ConnectionClosed(ConnectionClosedEvent),
    ConnectionCheckoutStarted(ConnectionCheckoutStartedEvent),
    ConnectionCheckoutFailed(ConnectionCheckoutFailedEvent),
    ConnectionCheckedOut(ConnectionCheckedOutEvent),
    ConnectionCheckedIn(ConnectionCheckedInEvent),
}

/// Routes CMAP events to the user's handler and to `tracing`. Events are only constructed when
/// someone is listening.
#[derive(Clone)]
pub(crate) struct CmapEventEmitter {
    user_handler: Option<EventHandler<CmapEvent>>,
    tracing_emitter: ConnectionTracingEventEmitter,
}

impl CmapEventEmitter {
    pub(crate) fn new(
        user_handler: Option<EventHandler<CmapEvent>>,
        topology_id: ObjectId,
    ) -> CmapEventEmitter {
        Self {
            user_handler,
            tracing_emitter: ConnectionTracingEventEmitter::new(topology_id),
        }
    }

    pub(crate) fn emit_event(&self, generate_event: impl FnOnce() -> CmapEvent) {
        let tracing_enabled =
            tracing::enabled!(target: CONNECTION_TRACING_EVENT_TARGET, tracing::Level::DEBUG);
        if self.user_handler.is_none() && !tracing_enabled {
            return;
        }

        let event = generate_event();
        if tracing_enabled {
            self.tracing_emitter.handle(&event);
        }
        if let Some(ref handler) = self.user_handler {
            handler.handle(event);
        }
    }
}
