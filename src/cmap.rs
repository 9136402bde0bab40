#[cfg(test)]
mod test;

pub(crate) mod conn;
mod connection_requester;
pub(crate) mod establish;
mod manager;
pub(crate) mod options;
mod status;
mod worker;

use std::time::Instant;

use derive_where::derive_where;
use tokio_util::sync::CancellationToken;

pub use self::conn::{pooled::PooledConnection, ConnectionInfo, Connector, Transport};
use self::{
    connection_requester::ConnectionRequestResult,
    establish::ConnectionEstablisher,
    options::ConnectionPoolOptions,
};
pub(crate) use self::{
    conn::{Connection, ConnectionGeneration, StreamDescription},
    status::PoolGenerationSubscriber,
    worker::PoolGeneration,
};
use crate::{
    bson::oid::ObjectId,
    error::{Error, ErrorKind, Result},
    event::cmap::{
        CmapEvent,
        CmapEventEmitter,
        ConnectionCheckoutFailedEvent,
        ConnectionCheckoutFailedReason,
        ConnectionCheckoutStartedEvent,
        PoolCreatedEvent,
    },
    options::ServerAddress,
    runtime,
    sdam::TopologyUpdater,
    timeout::TimeoutContext,
};
use connection_requester::ConnectionRequester;
use manager::PoolManager;
use worker::{ConnectionPoolWorker, DEFAULT_MAX_CONNECTING};

#[cfg(test)]
use crate::runtime::WorkerHandle;

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// A pool of connections to a single server.
///
/// This type is actually a handle to a task that manages the connections and is cheap to clone
/// and pass around. Connections are returned to the pool by dropping them.
#[derive(Clone)]
#[derive_where(Debug)]
pub struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    connection_requester: ConnectionRequester,
    generation_subscriber: PoolGenerationSubscriber,

    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        connection_establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        topology_id: ObjectId,
        options: ConnectionPoolOptions,
    ) -> Self {
        let event_emitter =
            CmapEventEmitter::new(options.cmap_event_handler.clone(), topology_id);

        event_emitter.emit_event(|| {
            CmapEvent::PoolCreated(PoolCreatedEvent {
                address: address.clone(),
                max_pool_size: options.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE),
                min_pool_size: options.min_pool_size.unwrap_or(0),
                max_connecting: options.max_connecting.unwrap_or(DEFAULT_MAX_CONNECTING),
                max_idle_time: options.max_idle_time,
            })
        });

        let (manager, connection_requester, generation_subscriber) = ConnectionPoolWorker::start(
            address.clone(),
            connection_establisher,
            server_updater,
            event_emitter.clone(),
            options,
        );

        Self {
            address,
            manager,
            connection_requester,
            generation_subscriber,
            event_emitter,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_mocked(address: ServerAddress) -> Self {
        let (manager, _) = manager::channel();
        let handle = WorkerHandle::new_mocked();
        let (connection_requester, _) = connection_requester::channel(handle);
        let (_, generation_subscriber) = status::channel(PoolGeneration::normal());

        Self {
            address,
            manager,
            connection_requester,
            generation_subscriber,
            event_emitter: CmapEventEmitter::new(None, ObjectId::new()),
        }
    }

    /// The address of the server this pool connects to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Checks out a connection from the pool. This method will yield until this thread is at the
    /// front of the wait queue, and then will block again if no available connections are in the
    /// pool and the total number of connections is not less than the max pool size.
    ///
    /// The wait is bounded by the checkout timeout of `timeout_context` and abandoned early if
    /// `cancellation` fires.
    pub async fn check_out(
        &self,
        timeout_context: &TimeoutContext,
        cancellation: Option<&CancellationToken>,
    ) -> Result<PooledConnection> {
        let time_started = Instant::now();
        self.event_emitter.emit_event(|| {
            ConnectionCheckoutStartedEvent {
                address: self.address.clone(),
            }
            .into()
        });

        let checkout = async {
            let timeout = timeout_context.connection_checkout_timeout();
            match runtime::maybe_timeout(timeout, self.request_connection()).await {
                Ok(result) => result,
                Err(_) => Err(
                    timeout_context.timeout_error(Error::wait_queue_timeout(&self.address)),
                ),
            }
        };

        let conn = match cancellation {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::operation_cancelled()),
                result = checkout => result,
            },
            None => checkout.await,
        };

        match conn {
            Ok(ref conn) => {
                self.event_emitter
                    .emit_event(|| conn.checked_out_event(time_started).into());
            }

            Err(ref err) => {
                let reason = match *err.kind {
                    ErrorKind::ConnectionPoolClosed { .. } => {
                        ConnectionCheckoutFailedReason::PoolClosed
                    }
                    ErrorKind::WaitQueueTimeout { .. } | ErrorKind::OperationTimeout { .. } => {
                        ConnectionCheckoutFailedReason::Timeout
                    }
                    _ => ConnectionCheckoutFailedReason::ConnectionError,
                };
                self.event_emitter.emit_event(|| {
                    ConnectionCheckoutFailedEvent {
                        address: self.address.clone(),
                        reason,
                        error: Some(err.clone()),
                        duration: Instant::now() - time_started,
                    }
                    .into()
                });
            }
        }

        conn
    }

    async fn request_connection(&self) -> Result<PooledConnection> {
        match self.connection_requester.request().await {
            ConnectionRequestResult::Pooled(c) => Ok(*c),
            ConnectionRequestResult::Establishing(task) => task.await,
            ConnectionRequestResult::PoolCleared(e) => {
                Err(Error::pool_cleared_error(&self.address, &e))
            }
            ConnectionRequestResult::PoolClosed => Err(Error::pool_closed_error(&self.address)),
        }
    }

    /// Increments the generation of the pool. Rather than eagerly removing stale connections from
    /// the pool, they are left for the background thread to clean up, unless
    /// `interrupt_in_use_connections` is set, in which case checked-out connections of the old
    /// generation are interrupted and idle ones are closed right away.
    pub(crate) async fn clear(
        &self,
        cause: Error,
        service_id: Option<ObjectId>,
        interrupt_in_use_connections: bool,
    ) {
        self.manager
            .clear(cause, service_id, interrupt_in_use_connections)
            .await
    }

    /// Mark the pool as ready so that checkouts are served.
    pub(crate) async fn mark_as_ready(&self) {
        self.manager.mark_as_ready().await
    }

    /// Close the pool. Idle connections are closed immediately; checked-out connections are
    /// closed when they are returned.
    pub(crate) async fn close(&self) {
        self.manager.close().await
    }

    pub(crate) fn generation(&self) -> PoolGeneration {
        self.generation_subscriber.generation()
    }
}
