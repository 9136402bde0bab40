use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use derive_where::derive_where;
use tokio_util::sync::CancellationToken;

use super::{
    conn::{pooled::PooledConnection, PendingConnection},
    connection_requester,
    connection_requester::{
        ConnectionRequest,
        ConnectionRequestReceiver,
        ConnectionRequestResult,
        ConnectionRequester,
    },
    establish::ConnectionEstablisher,
    manager,
    manager::{ConnectionSucceeded, ManagementRequestReceiver, PoolManagementRequest, PoolManager},
    options::ConnectionPoolOptions,
    status,
    status::{PoolGenerationPublisher, PoolGenerationSubscriber},
    DEFAULT_MAX_POOL_SIZE,
};
use crate::{
    bson::oid::ObjectId,
    error::{Error, Result},
    event::cmap::{
        CmapEventEmitter,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        PoolClearedEvent,
        PoolClosedEvent,
        PoolReadyEvent,
    },
    options::ServerAddress,
    runtime::{self, AcknowledgedMessage, WorkerHandleListener},
    sdam::TopologyUpdater,
};

pub(crate) const DEFAULT_MAX_CONNECTING: u32 = 2;
const DEFAULT_MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

/// A worker task that manages the shared state of the pool.
#[derive_where(Debug)]
pub(crate) struct ConnectionPoolWorker {
    /// The address the pool's connections will connect to.
    address: ServerAddress,

    /// Current state of the pool. Determines if connections may be checked out
    /// and if min_pool_size connection creation should continue.
    state: PoolState,

    /// The total number of connections managed by the pool, including connections which are
    /// currently checked out of the pool or have yet to be established.
    total_connection_count: u32,

    /// The number of connections currently being established by this pool.
    pending_connection_count: u32,

    /// The number of established connections to each backend service behind a load balancer.
    service_connection_count: HashMap<ObjectId, u32>,

    /// The ID of the next connection created by the pool.
    next_connection_id: u32,

    /// The current generation of the pool. The generation is incremented whenever the pool is
    /// cleared. Connections belonging to a previous generation are considered stale and will be
    /// closed when checked back in or when popped off of the set of available connections.
    generation: PoolGeneration,

    /// The established connections that are currently checked into the pool and awaiting usage in
    /// future operations.
    available_connections: VecDeque<PooledConnection>,

    /// Contains the logic for "establishing" a connection. This includes handshaking a connection
    /// when it's first created.
    establisher: ConnectionEstablisher,

    /// Emitter for CMAP events.
    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,

    /// The time between maintenance tasks.
    maintenance_frequency: Duration,

    /// Connections that have been ready for usage in the pool for longer than `max_idle_time` will
    /// be closed either by the background thread or when popped off of the set of available
    /// connections. If `max_idle_time` is `None`, then connections will not be closed due to being
    /// idle.
    max_idle_time: Option<Duration>,

    /// The minimum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool. If fewer than `min_pool_size`
    /// connections are in the pool, the background thread will create more connections and add
    /// them to the pool.
    min_pool_size: Option<u32>,

    /// The maximum number of connections that the pool can manage, including connections checked
    /// out of the pool. Zero means there is no limit.
    max_pool_size: u32,

    /// The maximum number of connections that may be establishing at once.
    max_connecting: u32,

    /// Fired to interrupt the connections of the current generation. Replaced every time it is
    /// fired.
    interrupt: CancellationToken,

    /// Receiver used to determine if any threads hold references to this pool. If all the
    /// sender ends of this receiver drop, this worker will be notified and drop too.
    handle_listener: WorkerHandleListener,

    /// Receiver for incoming connection check out requests.
    request_receiver: ConnectionRequestReceiver,

    /// Ordered queue of incoming requests waiting for connections.
    wait_queue: VecDeque<ConnectionRequest>,

    /// Receiver for incoming pool management requests (e.g. checking in a connection).
    management_receiver: ManagementRequestReceiver,

    /// Sender used to publish the latest generation.
    generation_publisher: PoolGenerationPublisher,

    /// A pool manager that can be cloned and attached to connections checked out of the pool.
    manager: PoolManager,

    /// A handle used to notify SDAM that a connection establishment error happened. This will
    /// allow the server to transition to Unknown and clear the pool as necessary.
    server_updater: TopologyUpdater,
}

impl ConnectionPoolWorker {
    /// Starts a worker and returns a manager and connection requester.
    /// Once all connection requesters are dropped, the worker will stop executing
    /// and close the pool.
    pub(super) fn start(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        event_emitter: CmapEventEmitter,
        options: ConnectionPoolOptions,
    ) -> (PoolManager, ConnectionRequester, PoolGenerationSubscriber) {
        // A max idle time of zero means that connections should not be closed due to idleness.
        let max_idle_time = options.max_idle_time.filter(|t| !t.is_zero());

        let max_pool_size = options.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let max_connecting = options.max_connecting.unwrap_or(DEFAULT_MAX_CONNECTING);
        let min_pool_size = options.min_pool_size;

        let (handle, handle_listener) = WorkerHandleListener::channel();
        let (connection_requester, request_receiver) = connection_requester::channel(handle);
        let (manager, management_receiver) = manager::channel();

        let is_load_balanced = options.load_balanced;
        let generation = if is_load_balanced {
            PoolGeneration::load_balanced()
        } else {
            PoolGeneration::normal()
        };
        let (generation_publisher, generation_subscriber) = status::channel(generation.clone());

        // Pools behind a load balancer are never paused by a monitor, so they start ready.
        let state = if is_load_balanced {
            PoolState::Ready
        } else {
            PoolState::New
        };
        #[cfg(test)]
        let state = if options.ready {
            PoolState::Ready
        } else {
            state
        };

        let maintenance_frequency = options
            .maintenance_frequency
            .unwrap_or(DEFAULT_MAINTENANCE_FREQUENCY);

        let worker = ConnectionPoolWorker {
            address,
            event_emitter,
            max_idle_time,
            min_pool_size,
            establisher,
            next_connection_id: 1,
            total_connection_count: 0,
            pending_connection_count: 0,
            service_connection_count: HashMap::new(),
            generation,
            available_connections: VecDeque::new(),
            max_pool_size,
            max_connecting,
            interrupt: CancellationToken::new(),
            request_receiver,
            wait_queue: Default::default(),
            management_receiver,
            manager: manager.clone(),
            handle_listener,
            state,
            generation_publisher,
            maintenance_frequency,
            server_updater,
        };

        runtime::execute(async move {
            worker.execute().await;
        });

        (manager, connection_requester, generation_subscriber)
    }

    /// Run the worker thread, listening on the various receivers until all handles have been
    /// dropped or the pool is closed. Once the loop exits, the pool will close any available
    /// connections and emit a pool closed event.
    async fn execute(mut self) {
        let mut maintenance_interval = runtime::interval(self.maintenance_frequency);
        let mut close_handler: Option<AcknowledgedMessage<()>> = None;

        loop {
            let task = tokio::select! {
                // This marker indicates that the futures will be polled in order from top to
                // bottom, so management requests are always handled before new check outs.
                biased;

                Some(request) = self.management_receiver.recv() => request.into(),
                _ = self.handle_listener.wait_for_all_handle_drops() => {
                    // all worker handles have been dropped meaning this
                    // pool has no more references and can be dropped itself.
                    break
                },
                Some(request) = self.request_receiver.recv() => {
                    PoolTask::CheckOut(request)
                },
                _ = maintenance_interval.tick() => {
                    PoolTask::Maintenance
                },
                else => {
                    break
                }
            };

            match task {
                PoolTask::CheckOut(request) => match self.state {
                    PoolState::Ready => {
                        self.wait_queue.push_back(request);
                    }
                    PoolState::Paused(ref e) => {
                        // if receiver doesn't listen to error that's ok.
                        let _ = request.fulfill(ConnectionRequestResult::PoolCleared(e.clone()));
                    }
                    PoolState::New => {
                        let _ = request.fulfill(ConnectionRequestResult::PoolCleared(
                            Error::internal("check out attempted from a pool that is not ready"),
                        ));
                    }
                },
                PoolTask::HandleManagementRequest(request) => match *request {
                    PoolManagementRequest::CheckIn(connection) => self.check_in(*connection),
                    PoolManagementRequest::Clear {
                        _completion_handler,
                        cause,
                        service_id,
                        interrupt_in_use_connections,
                    } => {
                        self.clear(cause, service_id, interrupt_in_use_connections);
                    }
                    PoolManagementRequest::MarkAsReady { completion_handler } => {
                        self.mark_as_ready();
                        completion_handler.acknowledge(());
                    }
                    PoolManagementRequest::Close { completion_handler } => {
                        close_handler = Some(completion_handler);
                        break;
                    }
                    PoolManagementRequest::HandleConnectionSucceeded(conn) => {
                        self.handle_connection_succeeded(conn);
                    }
                    PoolManagementRequest::HandleConnectionFailed => {
                        self.handle_connection_failed();
                    }
                },
                PoolTask::Maintenance => {
                    self.perform_maintenance();
                }
            }

            while self.can_service_connection_request() {
                let Some(request) = self.wait_queue.pop_front() else {
                    break;
                };
                if request.is_abandoned() {
                    continue;
                }
                if !self.check_out(request) {
                    break;
                }
            }
        }

        for request in self.wait_queue.drain(..) {
            let _ = request.fulfill(ConnectionRequestResult::PoolClosed);
        }

        while let Some(connection) = self.available_connections.pop_front() {
            connection.close_and_drop(ConnectionClosedReason::PoolClosed);
        }

        self.event_emitter.emit_event(|| {
            PoolClosedEvent {
                address: self.address.clone(),
            }
            .into()
        });

        if let Some(handler) = close_handler {
            handler.acknowledge(());
        }
    }

    fn below_max_connections(&self) -> bool {
        self.max_pool_size == 0 || self.total_connection_count < self.max_pool_size
    }

    fn can_service_connection_request(&self) -> bool {
        if !matches!(self.state, PoolState::Ready) {
            return false;
        }

        if !self.available_connections.is_empty() {
            return true;
        }

        self.below_max_connections() && self.pending_connection_count < self.max_connecting
    }

    /// Attempt to satisfy the given request. Returns false if the request had to be put back at
    /// the front of the wait queue.
    fn check_out(&mut self, request: ConnectionRequest) -> bool {
        // first attempt to check out an available connection
        while let Some(mut conn) = self.available_connections.pop_back() {
            // Close the connection if it's stale.
            if conn.is_stale(&self.generation) {
                self.close_connection(conn, ConnectionClosedReason::Stale);
                continue;
            }

            // Close the connection if it's idle.
            if conn.is_idle(self.max_idle_time) {
                self.close_connection(conn, ConnectionClosedReason::Idle);
                continue;
            }

            conn.mark_as_in_use(self.manager.clone());
            if let Err(result) = request.fulfill(ConnectionRequestResult::Pooled(Box::new(conn))) {
                // checking out thread stopped listening, indicating it hit the wait queue
                // timeout, so we put connection back into pool.
                if let ConnectionRequestResult::Pooled(mut connection) = result {
                    connection.mark_as_available();
                    self.available_connections.push_back(*connection);
                }
            }

            return true;
        }

        // otherwise, attempt to create a connection.
        if self.below_max_connections() && self.pending_connection_count < self.max_connecting {
            let event_emitter = self.event_emitter.clone();
            let establisher = self.establisher.clone();
            let pending_connection = self.create_pending_connection();
            let manager = self.manager.clone();
            let server_updater = self.server_updater.clone();
            let status = self.generation_publisher.subscribe();
            let address = self.address.clone();

            let handle = runtime::spawn(async move {
                let mut connection = establish_connection(
                    establisher,
                    pending_connection,
                    server_updater,
                    &manager,
                    event_emitter,
                )
                .await?;

                // A clear that ran during establishment leaves the connection stale. The worker
                // closes it and the request fails as it would have against the paused pool.
                if let Some(cause) = status.cleared_since(&connection) {
                    manager.handle_connection_succeeded(ConnectionSucceeded::ForPool(Box::new(
                        connection,
                    )));
                    return Err(Error::pool_cleared_error(&address, &cause));
                }

                connection.mark_as_in_use(manager.clone());
                manager.handle_connection_succeeded(ConnectionSucceeded::Used {
                    service_id: connection.generation.service_id(),
                });
                Ok(connection)
            });

            // this only fails if the other end stopped listening (e.g. due to timeout), in
            // which case we just let the connection establish in the background.
            let _: std::result::Result<_, _> =
                request.fulfill(ConnectionRequestResult::Establishing(handle));
            true
        } else {
            // put the request to the the front of the wait queue so that it will be processed
            // next time a request can be processed.
            self.wait_queue.push_front(request);
            false
        }
    }

    fn create_pending_connection(&mut self) -> PendingConnection {
        self.total_connection_count += 1;
        self.pending_connection_count += 1;

        let pending_connection = PendingConnection {
            id: self.next_connection_id,
            address: self.address.clone(),
            generation: self.generation.clone(),
            event_emitter: self.event_emitter.clone(),
            time_created: std::time::Instant::now(),
            interrupt: self.interrupt.child_token(),
        };
        self.next_connection_id += 1;
        self.event_emitter
            .emit_event(|| pending_connection.created_event().into());

        pending_connection
    }

    /// Process a connection establishment failure.
    fn handle_connection_failed(&mut self) {
        // Establishing a pending connection failed, so that must be reflected in to total
        // connection count.
        self.total_connection_count -= 1;
        self.pending_connection_count -= 1;
    }

    /// Process a successful connection establishment, optionally populating the pool with the
    /// resulting connection.
    fn handle_connection_succeeded(&mut self, connection: ConnectionSucceeded) {
        self.pending_connection_count -= 1;
        if let Some(sid) = connection.service_id() {
            *self.service_connection_count.entry(sid).or_insert(0) += 1;
        }
        if let ConnectionSucceeded::ForPool(connection) = connection {
            let mut connection = *connection;
            if connection.is_stale(&self.generation) {
                self.close_connection(connection, ConnectionClosedReason::Stale);
                return;
            }
            connection.mark_as_available();
            self.available_connections.push_back(connection);
        }
    }

    fn check_in(&mut self, mut conn: PooledConnection) {
        self.event_emitter
            .emit_event(|| conn.checked_in_event().into());

        conn.mark_as_available();

        if conn.has_errored() {
            self.close_connection(conn, ConnectionClosedReason::Error);
        } else if conn.is_stale(&self.generation) {
            self.close_connection(conn, ConnectionClosedReason::Stale);
        } else if conn.is_executing() {
            self.close_connection(conn, ConnectionClosedReason::Dropped);
        } else {
            self.available_connections.push_back(conn);
        }
    }

    fn clear(&mut self, cause: Error, service_id: Option<ObjectId>, interrupt: bool) {
        let was_ready = match (&mut self.generation, service_id) {
            (PoolGeneration::Normal(gen), None) => {
                *gen += 1;
                let prev = std::mem::replace(&mut self.state, PoolState::Paused(cause.clone()));
                matches!(prev, PoolState::Ready)
            }
            (PoolGeneration::LoadBalanced(gen_map), Some(sid)) => {
                let gen = gen_map.entry(sid).or_insert(0);
                *gen += 1;
                true
            }
            (_, _) => {
                tracing::debug!(
                    address = %self.address,
                    ?service_id,
                    "ignoring pool clear whose service id does not match the pool's mode"
                );
                return;
            }
        };
        self.generation_publisher
            .publish_clear(self.generation.clone(), cause.clone());

        // Connections to a load balancer are shared between services, so they are never
        // interrupted.
        let interrupt = interrupt && !self.is_load_balanced();
        if interrupt {
            self.interrupt.cancel();
            self.interrupt = CancellationToken::new();
        }

        if was_ready {
            self.event_emitter.emit_event(|| {
                PoolClearedEvent {
                    address: self.address.clone(),
                    service_id,
                    interrupt_in_use_connections: interrupt,
                }
                .into()
            });

            if !self.is_load_balanced() {
                for request in self.wait_queue.drain(..) {
                    // an error means the other end hung up already, which is okay because we were
                    // returning an error anyways
                    let _: std::result::Result<_, _> =
                        request.fulfill(ConnectionRequestResult::PoolCleared(cause.clone()));
                }
            }
        }

        if interrupt {
            self.remove_perished_connections();
        }
    }

    fn mark_as_ready(&mut self) {
        if matches!(self.state, PoolState::Ready) {
            return;
        }

        self.state = PoolState::Ready;
        self.event_emitter.emit_event(|| {
            PoolReadyEvent {
                address: self.address.clone(),
            }
            .into()
        });
    }

    fn is_load_balanced(&self) -> bool {
        matches!(self.generation, PoolGeneration::LoadBalanced(_))
    }

    /// Close a connection, emit the event for it being closed, and decrement the
    /// total connection count.
    fn close_connection(&mut self, connection: PooledConnection, reason: ConnectionClosedReason) {
        if let (Some(sid), PoolGeneration::LoadBalanced(gen_map)) =
            (connection.generation.service_id(), &mut self.generation)
        {
            if let Some(count) = self.service_connection_count.get_mut(&sid) {
                *count -= 1;
                if *count == 0 {
                    gen_map.remove(&sid);
                    self.service_connection_count.remove(&sid);
                }
            }
        }
        connection.close_and_drop(reason);
        self.total_connection_count -= 1;
    }

    /// Ensure all connections in the pool are valid and that the pool is managing at least
    /// min_pool_size connections.
    fn perform_maintenance(&mut self) {
        self.remove_perished_connections();
        if matches!(self.state, PoolState::Ready) {
            self.ensure_min_connections();
        }
    }

    /// Iterate over the connections and remove any that are stale or idle.
    fn remove_perished_connections(&mut self) {
        while let Some(connection) = self.available_connections.pop_front() {
            if connection.is_stale(&self.generation) {
                self.close_connection(connection, ConnectionClosedReason::Stale);
            } else if connection.is_idle(self.max_idle_time) {
                self.close_connection(connection, ConnectionClosedReason::Idle);
            } else {
                self.available_connections.push_front(connection);
                // All subsequent connections are either not idle or not stale since they were
                // checked into the pool later, so we can just quit early.
                break;
            };
        }
    }

    /// Populate the the pool with enough connections to meet the min_pool_size_requirement.
    fn ensure_min_connections(&mut self) {
        if let Some(min_pool_size) = self.min_pool_size {
            while self.total_connection_count < min_pool_size
                && self.pending_connection_count < self.max_connecting
            {
                let pending_connection = self.create_pending_connection();
                let event_handler = self.event_emitter.clone();
                let manager = self.manager.clone();
                let establisher = self.establisher.clone();
                let updater = self.server_updater.clone();
                runtime::execute(async move {
                    let connection = establish_connection(
                        establisher,
                        pending_connection,
                        updater,
                        &manager,
                        event_handler,
                    )
                    .await;

                    if let Ok(connection) = connection {
                        manager.handle_connection_succeeded(ConnectionSucceeded::ForPool(
                            Box::new(connection),
                        ))
                    }
                });
            }
        }
    }
}

/// Helper covering the common connection establishment behavior between
/// connections established in check_out and those established as part of
/// satisfying min_pool_size.
async fn establish_connection(
    establisher: ConnectionEstablisher,
    pending_connection: PendingConnection,
    server_updater: TopologyUpdater,
    manager: &PoolManager,
    event_emitter: CmapEventEmitter,
) -> Result<PooledConnection> {
    let connection_id = pending_connection.id;
    let address = pending_connection.address.clone();

    let mut establish_result = establisher.establish_connection(pending_connection).await;

    match establish_result {
        Err(ref e) => {
            event_emitter.emit_event(|| {
                ConnectionClosedEvent {
                    address: address.clone(),
                    reason: ConnectionClosedReason::Error,
                    connection_id,
                    error: Some(e.cause.clone()),
                }
                .into()
            });
            server_updater
                .handle_application_error(address, e.cause.clone(), e.handshake_phase.clone())
                .await;
            manager.handle_connection_failed();
        }
        Ok(ref mut connection) => {
            event_emitter.emit_event(|| connection.ready_event().into());
        }
    }

    establish_result.map_err(|e| e.cause)
}

/// The generation of a pool. Pools connected to a load balancer track a separate generation for
/// every backend service they have seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PoolGeneration {
    Normal(u32),
    LoadBalanced(HashMap<ObjectId, u32>),
}

impl PoolGeneration {
    pub(crate) fn normal() -> Self {
        Self::Normal(0)
    }

    fn load_balanced() -> Self {
        Self::LoadBalanced(HashMap::new())
    }

    #[cfg(test)]
    pub(crate) fn as_normal(&self) -> Option<u32> {
        match self {
            PoolGeneration::Normal(n) => Some(*n),
            _ => None,
        }
    }
}

/// The states a pool moves through over its lifetime.
///
/// The "closed" state is not represented: closing the pool stops the worker, after which every
/// request is answered with a pool closed error.
#[derive(Debug)]
enum PoolState {
    /// Same as Paused, but only for a new pool, not one that has been cleared due to an error.
    New,

    /// Connections may not be checked out nor created in the background to satisfy minPoolSize.
    Paused(Error),

    /// Pool is operational.
    Ready,
}

/// Task to process by the worker.
#[derive(Debug)]
enum PoolTask {
    /// Handle a management request from a `PoolManager`.
    HandleManagementRequest(Box<PoolManagementRequest>),

    /// Fulfill the given connection request.
    CheckOut(ConnectionRequest),

    /// Perform pool maintenance (ensure min connections, remove stale or idle connections).
    Maintenance,
}

impl From<PoolManagementRequest> for PoolTask {
    fn from(request: PoolManagementRequest) -> Self {
        PoolTask::HandleManagementRequest(Box::new(request))
    }
}
