use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use derive_where::derive_where;
use tokio::sync::{
    broadcast,
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    watch::{self, Ref},
};
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use super::{
    description::topology::server_selection::{attempt_to_select_server, SelectedServer},
    Monitor,
    Server,
    ServerDescription,
    ServerType,
    SessionSupportStatus,
    TopologyDescription,
    TopologyType,
    TransactionSupportStatus,
};
use crate::{
    bson::oid::ObjectId,
    cmap::{
        establish::ConnectionEstablisher,
        ConnectionGeneration,
        Connector,
        PoolGeneration,
        PooledConnection,
    },
    error::{Error, ErrorKind, Result},
    event::{
        sdam::{
            SdamEvent,
            SdamEventEmitter,
            ServerClosedEvent,
            ServerDescriptionChangedEvent,
            ServerOpeningEvent,
            TopologyClosedEvent,
            TopologyDescriptionChangedEvent,
            TopologyOpeningEvent,
        },
        server_selection::ServerSelectionEvent,
        EventHandler,
    },
    options::{ServerAddress, TopologyOptions},
    runtime::{self, AcknowledgedMessage, WorkerHandle, WorkerHandleListener},
    selection_criteria::SelectionCriteria,
    session::{ClusterTime, Session},
    timeout::TimeoutContext,
    trace::server_selection::ServerSelectionEventEmitter,
};

/// The operation name reported in server selection events when the caller gives none.
const UNNAMED_OPERATION: &str = "unknown";

/// A handle to a monitored deployment.
///
/// The topology discovers the deployment's servers, keeps one connection pool and one monitor per
/// server, and selects servers for operations. This type is cheap to clone; the background tasks
/// stop once every handle has been dropped or [`Topology::shutdown`] has been called.
#[derive(Clone)]
#[derive_where(Debug)]
pub struct Topology {
    id: ObjectId,
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    check_requester: TopologyCheckRequester,

    #[derive_where(skip)]
    selection_event_handler: Option<EventHandler<ServerSelectionEvent>>,

    _worker_handle: WorkerHandle,
}

impl Topology {
    /// Create a topology and start monitoring the hosts in `options`. Streams to servers are
    /// opened through `connector`.
    ///
    /// This must be called from within a tokio runtime.
    pub fn new(options: TopologyOptions, connector: Arc<dyn Connector>) -> Result<Topology> {
        options.validate()?;

        let id = ObjectId::new();
        let description = TopologyDescription::new(&options);
        let event_emitter = SdamEventEmitter::new(options.sdam_event_handler.clone(), id);
        let connection_establisher = ConnectionEstablisher::new(connector, &options);

        let (updater, update_receiver) = TopologyUpdater::channel();
        let (check_requester, _) = TopologyCheckRequester::channel();
        let (worker_handle, handle_listener) = WorkerHandleListener::channel();

        let state = TopologyState {
            description: description.clone(),
            servers: HashMap::new(),
        };
        let (watcher, broadcaster) = TopologyWatcher::channel(state);

        let worker = TopologyWorker {
            id,
            update_receiver,
            broadcaster,
            check_requester: check_requester.clone(),
            handle_listener,
            options: options.clone(),
            connection_establisher,
            topology_watcher: watcher.clone(),
            topology_updater: updater.clone(),
            event_emitter,
        };

        // Emit events for the initialization of the topology and the seed list.
        worker.emit_event(|| TopologyOpeningEvent { topology_id: id }.into());
        worker.emit_event(|| {
            SdamEvent::TopologyDescriptionChanged(Box::new(TopologyDescriptionChangedEvent {
                topology_id: id,
                previous_description: TopologyDescription::default(),
                new_description: description.clone(),
            }))
        });
        for address in description.server_addresses() {
            worker.emit_event(|| {
                ServerOpeningEvent {
                    address: address.clone(),
                    topology_id: id,
                }
                .into()
            });
        }

        let mut state = worker.broadcaster.clone_latest();
        worker.sync_servers(&mut state, description.server_addresses().cloned().collect());

        // Load-balanced topologies don't have a heartbeat monitor, so the single server is
        // synthesized as a load balancer with an RTT of 0 so it'll be selected.
        if options.load_balanced() {
            let old_description = state.description.clone();
            for address in old_description.server_addresses() {
                let new_description = ServerDescription {
                    server_type: ServerType::LoadBalancer,
                    average_round_trip_time: Some(Duration::ZERO),
                    ..ServerDescription::new(address)
                };
                state.description.update(new_description)?;
            }
            worker.process_topology_diff(&old_description, &state.description);
        }

        worker.broadcaster.publish_new_state(state);
        runtime::execute(worker.execute());

        Ok(Topology {
            id,
            watcher,
            updater,
            check_requester,
            selection_event_handler: options.server_selection_event_handler,
            _worker_handle: worker_handle,
        })
    }

    /// The identifier attached to every event this topology emits.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Select a server suitable for `criteria`, waiting for the topology to change until one
    /// appears or the server selection timeout of `timeout_context` elapses.
    ///
    /// `criteria` defaults to the primary. The minimum round trip time of the selected server is
    /// recorded on `timeout_context`.
    pub async fn select_server(
        &self,
        criteria: Option<&SelectionCriteria>,
        timeout_context: &mut TimeoutContext,
        options: SelectServerOptions,
    ) -> Result<SelectedServer> {
        let pinned_criteria = options
            .pinned_address
            .clone()
            .map(SelectionCriteria::from_address);
        let default_criteria = SelectionCriteria::default();
        let criteria = pinned_criteria
            .as_ref()
            .or(criteria)
            .unwrap_or(&default_criteria);

        let timeout = timeout_context.server_selection_timeout();
        let start_time = Instant::now();
        let event_emitter = ServerSelectionEventEmitter::new(
            self.id,
            criteria,
            options.operation_name.as_deref().unwrap_or(UNNAMED_OPERATION),
            start_time,
            timeout,
            self.selection_event_handler.as_ref(),
        );
        let deprioritized: Vec<&ServerAddress> = options.deprioritized.iter().collect();

        let mut watcher = self.watch();
        let mut waiting_event_emitted = false;
        event_emitter.emit_started_event(&watcher.observe_latest().description);

        loop {
            let state = watcher.observe_latest();

            let result = attempt_to_select_server(
                criteria,
                &state.description,
                &state.servers,
                &deprioritized,
            );
            match result {
                Err(error) => {
                    event_emitter.emit_failed_event(&state.description, &error);
                    return Err(error);
                }
                Ok(Some(server)) => {
                    event_emitter.emit_succeeded_event(&state.description, server.address());
                    timeout_context.set_min_round_trip_time(
                        state
                            .description
                            .get_server_description(server.address())
                            .and_then(|sd| sd.min_round_trip_time),
                    );
                    return Ok(server);
                }
                Ok(None) => {}
            }

            if !watcher.is_alive() {
                let error: Error = ErrorKind::Shutdown.into();
                event_emitter.emit_failed_event(&state.description, &error);
                return Err(error);
            }

            if !waiting_event_emitted {
                event_emitter.emit_waiting_event(&state.description);
                waiting_event_emitted = true;
            }

            self.request_check();
            let remaining = timeout
                .checked_sub(start_time.elapsed())
                .unwrap_or(Duration::ZERO);
            let change_occurred = match options.cancellation {
                Some(ref token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        let error = Error::operation_cancelled();
                        event_emitter.emit_failed_event(&state.description, &error);
                        return Err(error);
                    }
                    changed = watcher.wait_for_update(remaining) => changed,
                },
                None => watcher.wait_for_update(remaining).await,
            };

            if !change_occurred {
                let description = watcher.observe_latest().description;
                let error = if watcher.is_alive() {
                    timeout_context.timeout_error(Error::server_selection(
                        description.server_selection_timeout_error_message(criteria),
                        Some(description.clone()),
                    ))
                } else {
                    ErrorKind::Shutdown.into()
                };
                event_emitter.emit_failed_event(&description, &error);
                return Err(error);
            }
        }
    }

    /// Ask every monitor to check its server as soon as possible.
    pub fn request_check(&self) {
        self.check_requester.request()
    }

    /// A snapshot of the latest topology description.
    pub fn description(&self) -> TopologyDescription {
        self.watcher.borrow_latest().description.clone()
    }

    /// The current type of the topology.
    pub fn topology_type(&self) -> TopologyType {
        self.watcher.borrow_latest().description.topology_type
    }

    /// The highest cluster time seen by the topology.
    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.watcher
            .borrow_latest()
            .description
            .cluster_time()
            .cloned()
    }

    /// Record a cluster time seen in a server reply. Cluster time only moves forward.
    pub async fn advance_cluster_time(&self, to: ClusterTime) {
        self.updater.advance_cluster_time(to).await;
    }

    /// Whether the deployment supports logical sessions.
    pub fn session_support_status(&self) -> SessionSupportStatus {
        self.watcher
            .borrow_latest()
            .description
            .session_support_status()
    }

    /// Start a session, failing with [`ErrorKind::SessionsNotSupported`] if the deployment does
    /// not support them. When no data-bearing server has been seen yet, one is selected first so
    /// that support can be determined.
    pub async fn start_session(
        &self,
        causal_consistency: bool,
        timeout_context: &mut TimeoutContext,
    ) -> Result<Session> {
        if self.session_support_status() == SessionSupportStatus::Undetermined {
            let criteria =
                SelectionCriteria::predicate(|server| server.server_type().is_data_bearing());
            self.select_server(
                Some(&criteria),
                timeout_context,
                SelectServerOptions::builder()
                    .operation_name("startSession")
                    .build(),
            )
            .await?;
        }

        match self.session_support_status() {
            SessionSupportStatus::Supported { .. } => Ok(Session::new(causal_consistency)),
            _ => Err(ErrorKind::SessionsNotSupported.into()),
        }
    }

    /// Whether the deployment supports transactions.
    pub fn transaction_support_status(&self) -> TransactionSupportStatus {
        self.watcher
            .borrow_latest()
            .description
            .transaction_support_status()
    }

    /// The time a session stays alive on the server after its last use.
    pub fn logical_session_timeout(&self) -> Option<Duration> {
        self.watcher
            .borrow_latest()
            .description
            .logical_session_timeout()
    }

    /// Report an error that an operation hit while using `connection`. Depending on the error,
    /// the server is marked Unknown, its pool is cleared, or its monitor is asked to check it.
    ///
    /// Returns whether the topology changed.
    pub async fn handle_connection_error(
        &self,
        connection: &PooledConnection,
        error: Error,
    ) -> bool {
        self.handle_application_error(
            connection.address().clone(),
            error,
            HandshakePhase::after_completion(connection),
        )
        .await
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.updater
            .handle_application_error(address, error, phase)
            .await
    }

    /// Replace the set of monitored hosts. Servers not already present are added and start
    /// being monitored; servers missing from `hosts` are removed.
    pub async fn sync_hosts(&self, hosts: impl IntoIterator<Item = ServerAddress>) {
        self.updater.sync_hosts(hosts.into_iter().collect()).await;
    }

    /// Stop all monitors, close every connection pool and emit the closing events. Selections
    /// that are still waiting fail once the topology has shut down.
    pub async fn shutdown(&self) {
        self.updater.shutdown().await;
    }

    /// A watcher that has already seen the latest state.
    pub(crate) fn watch(&self) -> TopologyWatcher {
        let mut watcher = self.watcher.clone();
        watcher.receiver.borrow_and_update();
        watcher
    }

    #[cfg(test)]
    pub(crate) fn updater(&self) -> TopologyUpdater {
        self.updater.clone()
    }

    #[cfg(test)]
    pub(crate) fn servers(&self) -> HashMap<ServerAddress, Arc<Server>> {
        self.watcher.borrow_latest().servers.clone()
    }
}

/// Options for a single [`Topology::select_server`] call.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct SelectServerOptions {
    /// The name of the operation, reported in server selection events.
    pub operation_name: Option<String>,

    /// A server to avoid, typically the one a retried operation previously failed on. It is
    /// still chosen if nothing else qualifies.
    pub deprioritized: Option<ServerAddress>,

    /// Restrict selection to this server, e.g. the mongos a transaction is pinned to. Overrides
    /// the criteria.
    pub pinned_address: Option<ServerAddress>,

    /// Abandons the selection when cancelled.
    pub cancellation: Option<CancellationToken>,
}

#[derive(Debug, Clone)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

#[derive(Debug)]
pub(crate) enum UpdateMessage {
    AdvanceClusterTime(ClusterTime),
    ServerUpdate(Box<ServerDescription>),
    SyncHosts(HashSet<ServerAddress>),
    MonitorError {
        address: ServerAddress,
        error: Error,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    },
    Shutdown,
}

struct TopologyWorker {
    id: ObjectId,
    update_receiver: TopologyUpdateReceiver,
    broadcaster: TopologyBroadcaster,
    check_requester: TopologyCheckRequester,
    handle_listener: WorkerHandleListener,
    options: TopologyOptions,
    connection_establisher: ConnectionEstablisher,
    event_emitter: SdamEventEmitter,

    topology_watcher: TopologyWatcher,
    topology_updater: TopologyUpdater,
}

impl TopologyWorker {
    async fn execute(mut self) {
        let mut shutdown_ack = None;
        loop {
            tokio::select! {
                Some(update) = self.update_receiver.recv() => {
                    let (update, ack) = update.into_parts();
                    let changed = match update {
                        UpdateMessage::AdvanceClusterTime(to) => {
                            self.advance_cluster_time(to);
                            true
                        }
                        UpdateMessage::SyncHosts(hosts) => self.sync_hosts(hosts),
                        UpdateMessage::ServerUpdate(sd) => self.update_server(*sd).await,
                        UpdateMessage::MonitorError { address, error } => {
                            self.handle_monitor_error(address, error).await
                        }
                        UpdateMessage::ApplicationError {
                            address,
                            error,
                            phase,
                        } => self.handle_application_error(address, error, phase).await,
                        UpdateMessage::Shutdown => {
                            shutdown_ack = Some(ack);
                            break;
                        }
                    };
                    ack.acknowledge(changed);
                }
                _ = self.handle_listener.wait_for_all_handle_drops() => break,
            }
        }

        self.shutdown().await;
        if let Some(ack) = shutdown_ack {
            ack.acknowledge(true);
        }

        // Answer requests that raced with the exit.
        self.update_receiver.close();
        while let Some(update) = self.update_receiver.recv().await {
            update.acknowledge(false);
        }
    }

    fn emit_event(&self, generate_event: impl FnOnce() -> SdamEvent) {
        self.event_emitter.emit_event(generate_event)
    }

    fn advance_cluster_time(&mut self, to: ClusterTime) {
        let mut latest_state = self.broadcaster.clone_latest();
        latest_state.description.advance_cluster_time(&to);
        self.broadcaster.publish_new_state(latest_state);
    }

    fn sync_hosts(&mut self, hosts: HashSet<ServerAddress>) -> bool {
        let mut state = self.broadcaster.clone_latest();
        let old_description = state.description.clone();

        state.description.sync_hosts(hosts);
        let addresses = state.description.server_addresses().cloned().collect();
        self.sync_servers(&mut state, addresses);

        let changed = self.process_topology_diff(&old_description, &state.description);
        self.broadcaster.publish_new_state(state);
        changed
    }

    /// Make the set of running servers match `hosts`, starting a pool and a monitor for every
    /// new address.
    fn sync_servers(&self, state: &mut TopologyState, hosts: HashSet<ServerAddress>) {
        state.servers.retain(|address, server| {
            let keep = hosts.contains(address);
            if !keep {
                server.stop_monitoring();
            }
            keep
        });

        for address in hosts {
            if state.servers.contains_key(&address) {
                continue;
            }

            let server = Server::new(
                address.clone(),
                &self.options,
                self.connection_establisher.clone(),
                self.topology_updater.clone(),
                self.id,
            );

            // Load balancers are never monitored.
            if !self.options.load_balanced() {
                Monitor::start(
                    address.clone(),
                    self.topology_updater.clone(),
                    self.topology_watcher.clone(),
                    self.event_emitter.clone(),
                    self.check_requester.subscribe(),
                    server.monitor_shutdown(),
                    self.connection_establisher.clone(),
                    &self.options,
                );
            }

            state.servers.insert(address, server);
        }
    }

    async fn update_server(&mut self, sd: ServerDescription) -> bool {
        let server_type = sd.server_type;
        let server_address = sd.address.clone();

        let mut latest_state = self.broadcaster.clone_latest();
        let old_description = latest_state.description.clone();

        if let Err(error) = latest_state.description.update(sd) {
            tracing::warn!(address = %server_address, %error, "failed to apply server update");
            return false;
        }

        let hosts = latest_state
            .description
            .server_addresses()
            .cloned()
            .collect();
        self.sync_servers(&mut latest_state, hosts);

        let topology_changed =
            self.process_topology_diff(&old_description, &latest_state.description);

        if server_type.is_data_bearing()
            || (server_type != ServerType::Unknown
                && latest_state.description.topology_type() == TopologyType::Single)
        {
            if let Some(server) = latest_state.servers.get(&server_address) {
                server.pool.mark_as_ready().await;
            }
        }

        // Published even when the description is equal, since round trip times and cluster
        // times are not part of the comparison.
        self.broadcaster.publish_new_state(latest_state);

        topology_changed
    }

    fn process_topology_diff(
        &self,
        old_description: &TopologyDescription,
        new_description: &TopologyDescription,
    ) -> bool {
        let diff = match old_description.diff(new_description) {
            Some(diff) => diff,
            None => return false,
        };

        for (address, (previous_description, new_description)) in diff.changed_servers {
            self.emit_event(|| {
                SdamEvent::ServerDescriptionChanged(Box::new(ServerDescriptionChangedEvent {
                    address: address.clone(),
                    topology_id: self.id,
                    previous_description: previous_description.clone(),
                    new_description: new_description.clone(),
                }))
            });
        }

        for address in diff.removed_addresses {
            self.emit_event(|| {
                ServerClosedEvent {
                    address: address.clone(),
                    topology_id: self.id,
                }
                .into()
            });
        }

        for address in diff.added_addresses {
            self.emit_event(|| {
                ServerOpeningEvent {
                    address: address.clone(),
                    topology_id: self.id,
                }
                .into()
            });
        }

        self.emit_event(|| {
            SdamEvent::TopologyDescriptionChanged(Box::new(TopologyDescriptionChangedEvent {
                topology_id: self.id,
                previous_description: old_description.clone(),
                new_description: new_description.clone(),
            }))
        });

        true
    }

    async fn mark_server_as_unknown(&mut self, address: ServerAddress, error: Error) -> bool {
        let description = ServerDescription::new_from_error(address, error);
        self.update_server(description).await
    }

    async fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        handshake: HandshakePhase,
    ) -> bool {
        let server = match self.server(&address) {
            Some(s) => s,
            None => return false,
        };

        match &handshake {
            HandshakePhase::PreHello { generation } => {
                match (generation, server.pool.generation()) {
                    (PoolGeneration::Normal(hgen), PoolGeneration::Normal(sgen)) => {
                        if *hgen < sgen {
                            return false;
                        }
                    }
                    // Pre-hello handshake errors are ignored in load-balanced mode.
                    (PoolGeneration::LoadBalanced(_), PoolGeneration::LoadBalanced(_)) => {
                        return false
                    }
                    _ => {
                        tracing::debug!(
                            address = %address,
                            "ignoring error from a pool in a different load-balancing mode"
                        );
                        return false;
                    }
                }
            }
            HandshakePhase::PostHello { generation }
            | HandshakePhase::AfterCompletion { generation, .. } => {
                if generation.is_stale(&server.pool.generation()) {
                    return false;
                }
            }
        }

        // Errors reporting a topology version no newer than the one already known are stale.
        let current_topology_version = self
            .broadcaster
            .borrow_latest()
            .description
            .get_server_description(&address)
            .and_then(|sd| sd.topology_version());
        if let (Some(error_tv), Some(current_tv)) =
            (error.topology_version(), current_topology_version)
        {
            if !error_tv.is_more_recent_than(current_tv) {
                return false;
            }
        }

        let is_load_balanced = self.options.load_balanced();
        if error.is_state_change_error() {
            let updated = is_load_balanced
                || self
                    .mark_server_as_unknown(server.address.clone(), error.clone())
                    .await;

            if updated && (error.is_shutting_down() || handshake.wire_version().unwrap_or(0) < 8)
            {
                server
                    .pool
                    .clear(error, handshake.service_id(), false)
                    .await;
            }
            self.check_requester.request();

            updated
        } else if error.is_non_timeout_network_error()
            || (handshake.is_before_completion()
                && (error.is_network_timeout() || matches!(*error.kind, ErrorKind::Command(_))))
        {
            let updated = is_load_balanced
                || self
                    .mark_server_as_unknown(server.address.clone(), error.clone())
                    .await;
            if updated {
                server
                    .pool
                    .clear(error, handshake.service_id(), false)
                    .await;
            }
            updated
        } else {
            false
        }
    }

    async fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        match self.server(&address) {
            Some(server) => {
                let updated = self.mark_server_as_unknown(address, error.clone()).await;
                if updated {
                    // The heartbeat monitor is disabled in load-balanced mode, so this will never
                    // have a service id. Operations still in flight on the server are failed
                    // right away.
                    server.pool.clear(error, None, true).await;
                }
                updated
            }
            None => false,
        }
    }

    async fn shutdown(&mut self) {
        let mut state = self.broadcaster.clone_latest();

        for (address, server) in state.servers.drain() {
            server.stop_monitoring();
            server.pool.close().await;
            self.emit_event(|| {
                ServerClosedEvent {
                    address,
                    topology_id: self.id,
                }
                .into()
            });
        }

        let previous_description = std::mem::take(&mut state.description);
        self.emit_event(|| {
            SdamEvent::TopologyDescriptionChanged(Box::new(TopologyDescriptionChangedEvent {
                topology_id: self.id,
                previous_description,
                new_description: TopologyDescription::default(),
            }))
        });
        self.broadcaster.publish_new_state(state);

        self.emit_event(|| {
            TopologyClosedEvent {
                topology_id: self.id,
            }
            .into()
        });
    }

    fn server(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        self.broadcaster
            .borrow_latest()
            .servers
            .get(address)
            .cloned()
    }
}

/// Handle used to send updates to the topology worker.
#[derive(Debug, Clone)]
pub(crate) struct TopologyUpdater {
    sender: UnboundedSender<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdater {
    pub(crate) fn channel() -> (TopologyUpdater, TopologyUpdateReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();

        let updater = TopologyUpdater { sender: tx };

        let update_receiver = TopologyUpdateReceiver {
            update_receiver: rx,
        };

        (updater, update_receiver)
    }

    /// Send an update message to the topology worker and wait for it to be processed. Returns
    /// whether the topology changed, or `false` if the worker has stopped.
    async fn send_message(&self, update: UpdateMessage) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(update);

        match self.sender.send(message) {
            Ok(_) => receiver.wait_for_acknowledgment().await.unwrap_or(false),
            _ => false,
        }
    }

    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        self.send_message(UpdateMessage::MonitorError { address, error })
            .await
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.send_message(UpdateMessage::ApplicationError {
            address,
            error,
            phase,
        })
        .await
    }

    pub(crate) async fn update(&self, sd: ServerDescription) -> bool {
        self.send_message(UpdateMessage::ServerUpdate(Box::new(sd)))
            .await
    }

    pub(crate) async fn advance_cluster_time(&self, to: ClusterTime) {
        self.send_message(UpdateMessage::AdvanceClusterTime(to))
            .await;
    }

    pub(crate) async fn sync_hosts(&self, hosts: HashSet<ServerAddress>) -> bool {
        self.send_message(UpdateMessage::SyncHosts(hosts)).await
    }

    pub(crate) async fn shutdown(&self) {
        self.send_message(UpdateMessage::Shutdown).await;
    }
}

pub(crate) struct TopologyUpdateReceiver {
    update_receiver: UnboundedReceiver<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdateReceiver {
    pub(crate) async fn recv(&mut self) -> Option<AcknowledgedMessage<UpdateMessage, bool>> {
        self.update_receiver.recv().await
    }

    fn close(&mut self) {
        self.update_receiver.close();
    }
}

/// Receives the states published by the topology worker.
#[derive(Debug, Clone)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    fn channel(initial_state: TopologyState) -> (TopologyWatcher, TopologyBroadcaster) {
        let (tx, rx) = watch::channel(initial_state);
        let watcher = TopologyWatcher { receiver: rx };
        let broadcaster = TopologyBroadcaster { state_sender: tx };
        (watcher, broadcaster)
    }

    /// Whether the topology worker is still running.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    pub(crate) fn server_description(&self, address: &ServerAddress) -> Option<ServerDescription> {
        self.receiver
            .borrow()
            .description
            .get_server_description(address)
            .cloned()
    }

    /// Clone the latest state and mark it as seen.
    pub(crate) fn observe_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    /// Wait up to `timeout` for a state that hasn't been seen yet. Returns whether one arrived.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        matches!(
            runtime::timeout(timeout, self.receiver.changed()).await,
            Ok(Ok(()))
        )
    }

    pub(crate) fn borrow_latest(&self) -> Ref<'_, TopologyState> {
        self.receiver.borrow()
    }
}

struct TopologyBroadcaster {
    state_sender: watch::Sender<TopologyState>,
}

impl TopologyBroadcaster {
    fn clone_latest(&self) -> TopologyState {
        self.borrow_latest().clone()
    }

    fn borrow_latest(&self) -> Ref<'_, TopologyState> {
        self.state_sender.borrow()
    }

    fn publish_new_state(&self, state: TopologyState) {
        self.state_sender.send_replace(state);
    }
}

/// Wakes the monitors of every server so they check their server early.
#[derive(Clone, Debug)]
pub(crate) struct TopologyCheckRequester {
    sender: broadcast::Sender<()>,
}

impl TopologyCheckRequester {
    fn channel() -> (TopologyCheckRequester, TopologyCheckRequestReceiver) {
        let (tx, rx) = broadcast::channel(1);
        (
            TopologyCheckRequester { sender: tx },
            TopologyCheckRequestReceiver { receiver: rx },
        )
    }

    fn request(&self) {
        let _ = self.sender.send(());
    }

    fn subscribe(&self) -> TopologyCheckRequestReceiver {
        TopologyCheckRequestReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

pub(crate) struct TopologyCheckRequestReceiver {
    receiver: broadcast::Receiver<()>,
}

impl TopologyCheckRequestReceiver {
    /// Wait up to `timeout` for a check request.
    pub(crate) async fn wait_for_check_request(&mut self, timeout: Duration) {
        let _: Result<_> = runtime::timeout(timeout, self.receiver.recv()).await;
    }

    /// Drop any requests that came in before the current check started.
    pub(crate) fn clear_check_requests(&mut self) {
        while !matches!(
            self.receiver.try_recv(),
            Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed)
        ) {}
    }
}

/// Enum describing a point in time during an operation's execution relative to when the
/// handshake for the connection being used in that operation completed.
///
/// This is used to determine the error handling semantics for certain error types.
#[derive(Debug, Clone)]
pub(crate) enum HandshakePhase {
    /// Describes a point that occurred before the initial hello completed (e.g. when opening the
    /// socket).
    PreHello { generation: PoolGeneration },

    /// Describes a point in time after the initial hello has completed, but before the entire
    /// handshake completes.
    PostHello { generation: ConnectionGeneration },

    /// Describes a point in time after the handshake completed (e.g. when the command was sent to
    /// the server).
    AfterCompletion {
        generation: ConnectionGeneration,
        max_wire_version: i32,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(handshaked_connection: &PooledConnection) -> Self {
        Self::AfterCompletion {
            generation: handshaked_connection.generation,
            // given that this is a handshaked connection, the stream description should
            // always be available, so 0 should never actually be returned here.
            max_wire_version: handshaked_connection
                .stream_description()
                .ok()
                .and_then(|sd| sd.max_wire_version)
                .unwrap_or(0),
        }
    }

    /// The `serviceId` reported by the server. If the initial hello has not completed, returns
    /// `None`.
    pub(crate) fn service_id(&self) -> Option<ObjectId> {
        match self {
            HandshakePhase::PreHello { .. } => None,
            HandshakePhase::PostHello { generation, .. } => generation.service_id(),
            HandshakePhase::AfterCompletion { generation, .. } => generation.service_id(),
        }
    }

    /// Whether this phase is before the handshake completed or not.
    fn is_before_completion(&self) -> bool {
        !matches!(self, HandshakePhase::AfterCompletion { .. })
    }

    /// The wire version of the server as reported by the handshake. If the handshake did not
    /// complete, this returns `None`.
    fn wire_version(&self) -> Option<i32> {
        match self {
            HandshakePhase::AfterCompletion {
                max_wire_version, ..
            } => Some(*max_wire_version),
            _ => None,
        }
    }
}
