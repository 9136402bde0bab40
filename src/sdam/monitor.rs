use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::{
    description::server::{ServerDescription, TopologyVersion},
    topology::{TopologyCheckRequestReceiver, TopologyUpdater, TopologyWatcher},
};
use crate::{
    cmap::{establish::ConnectionEstablisher, Connection},
    error::{Error, Result},
    event::sdam::{
        SdamEvent,
        SdamEventEmitter,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, AwaitableHelloOptions, HelloReply},
    options::{ServerAddress, ServerMonitoringMode, TopologyOptions},
    runtime,
};

static MONITORING_CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

fn next_monitoring_connection_id() -> u32 {
    MONITORING_CONNECTION_ID.fetch_add(1, Ordering::SeqCst)
}

/// Monitor that performs regular heartbeats to determine server status.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    connection_establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    sdam_event_emitter: SdamEventEmitter,
    check_request_receiver: TopologyCheckRequestReceiver,
    shutdown: CancellationToken,

    rtt: RttHandle,

    /// Stops the RTT pinger when the monitor exits. Only set once the server has been streamed
    /// from.
    rtt_monitor: Option<DropGuard>,

    /// The topology version from the latest reply. While set and streaming is allowed, checks
    /// are awaitable hellos.
    topology_version: Option<TopologyVersion>,

    /// Whether the server accepted `hello` in place of the legacy command.
    hello_ok: Option<bool>,

    heartbeat_frequency: Duration,
    min_heartbeat_frequency: Duration,
    connect_timeout: Option<Duration>,
    allow_streaming: bool,
}

impl Monitor {
    /// Start a monitor for the server at `address`. The monitor runs until `shutdown` fires or
    /// the topology it reports to is dropped.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        sdam_event_emitter: SdamEventEmitter,
        check_request_receiver: TopologyCheckRequestReceiver,
        shutdown: CancellationToken,
        connection_establisher: ConnectionEstablisher,
        options: &TopologyOptions,
    ) {
        let monitor = Self {
            address,
            connection: None,
            connection_establisher,
            topology_updater,
            topology_watcher,
            sdam_event_emitter,
            check_request_receiver,
            shutdown,
            rtt: RttHandle::new(options.rtt_window_size()),
            rtt_monitor: None,
            topology_version: None,
            hello_ok: None,
            heartbeat_frequency: options.heartbeat_freq(),
            min_heartbeat_frequency: options.min_heartbeat_freq(),
            connect_timeout: options.connect_timeout(),
            allow_streaming: !matches!(
                options.server_monitoring_mode,
                Some(ServerMonitoringMode::Poll)
            ),
        };
        runtime::execute(monitor.execute());
    }

    async fn execute(mut self) {
        tracing::trace!(address = %self.address, "starting server monitor");

        while self.is_alive() {
            let check_succeeded = self.check_server().await;

            // A streaming monitor sends the next awaitable hello as soon as the previous one
            // returns. The server holds it until its state changes or the await time elapses.
            if check_succeeded && self.is_streaming() {
                self.start_rtt_monitor();
                continue;
            }

            self.wait_for_next_check(check_succeeded).await;
        }

        tracing::trace!(address = %self.address, "server monitor stopped");
    }

    fn is_alive(&self) -> bool {
        !self.shutdown.is_cancelled() && self.topology_watcher.is_alive()
    }

    fn is_streaming(&self) -> bool {
        self.allow_streaming && self.topology_version.is_some() && self.connection.is_some()
    }

    /// Sleep until the next check is due. After a failed check only the minimum frequency is
    /// waited; otherwise a check request can cut the full interval short once the minimum has
    /// passed.
    async fn wait_for_next_check(&mut self, check_succeeded: bool) {
        let shutdown = self.shutdown.clone();
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = runtime::delay_for(self.min_heartbeat_frequency) => {}
        }

        if !check_succeeded {
            return;
        }

        let remaining = self
            .heartbeat_frequency
            .saturating_sub(self.min_heartbeat_frequency);
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {}
            _ = self.check_request_receiver.wait_for_check_request(remaining) => {}
        }
    }

    /// Checks the server by running a hello command. If an I/O error occurs, the connection
    /// will be replaced with a new one.
    ///
    /// Returns whether the check succeeded.
    async fn check_server(&mut self) -> bool {
        self.check_request_receiver.clear_check_requests();

        let check_result = match self.perform_hello().await {
            HelloResult::Err(e) => {
                let previously_available = self
                    .topology_watcher
                    .server_description(&self.address)
                    .is_some_and(|sd| sd.is_available());
                if e.is_network_error() && previously_available {
                    self.handle_error(e).await;
                    self.perform_hello().await
                } else {
                    HelloResult::Err(e)
                }
            }
            other => other,
        };

        match check_result {
            HelloResult::Ok(reply) => {
                let server_description = ServerDescription::new_from_hello_reply(
                    self.address.clone(),
                    reply,
                    self.rtt.average().unwrap_or_default(),
                    self.rtt.min(),
                );
                self.topology_updater.update(server_description).await;
                true
            }
            HelloResult::Err(e) => {
                self.handle_error(e).await;
                false
            }
            HelloResult::Cancelled => false,
        }
    }

    async fn perform_hello(&mut self) -> HelloResult {
        let awaited = self.is_streaming();
        let (driver_connection_id, server_connection_id) = match self.connection {
            Some(ref connection) => (connection.id, connection.server_id),
            None => (next_monitoring_connection_id(), None),
        };

        self.emit_event(|| {
            ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
                awaited,
                driver_connection_id,
                server_connection_id,
            }
            .into()
        });

        let shutdown = self.shutdown.clone();
        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return HelloResult::Cancelled,
            result = self.run_hello(driver_connection_id, awaited) => result,
        };
        let duration = start.elapsed();

        let server_connection_id = self
            .connection
            .as_ref()
            .and_then(|c| c.server_id)
            .or(server_connection_id);

        match result {
            Ok(reply) => {
                // Awaited replies are held by the server, so their duration says nothing
                // about latency.
                if !awaited {
                    self.rtt.add_sample(duration);
                }
                self.topology_version = reply.command_response.topology_version;
                self.hello_ok = reply.command_response.hello_ok;

                self.emit_event(|| {
                    ServerHeartbeatSucceededEvent {
                        duration,
                        reply: reply.raw_command_response.clone(),
                        server_address: self.address.clone(),
                        awaited,
                        driver_connection_id,
                        server_connection_id,
                    }
                    .into()
                });
                HelloResult::Ok(reply)
            }
            Err(error) => {
                self.connection.take();
                self.emit_event(|| {
                    ServerHeartbeatFailedEvent {
                        duration,
                        failure: error.clone(),
                        server_address: self.address.clone(),
                        awaited,
                        driver_connection_id,
                        server_connection_id,
                    }
                    .into()
                });
                HelloResult::Err(error)
            }
        }
    }

    async fn run_hello(&mut self, connection_id: u32, awaited: bool) -> Result<HelloReply> {
        match self.connection {
            Some(ref mut connection) => {
                let awaitable_options = match (awaited, self.topology_version) {
                    (true, Some(topology_version)) => Some(AwaitableHelloOptions {
                        topology_version,
                        max_await_time: self.heartbeat_frequency,
                    }),
                    _ => None,
                };
                let command = hello_command(None, self.hello_ok, awaitable_options);

                // An awaited hello may legitimately take a full heartbeat interval to return.
                let timeout = match self.connect_timeout {
                    Some(timeout) if awaited => Some(timeout + self.heartbeat_frequency),
                    other => other,
                };
                connection.send_hello(&command, timeout).await
            }
            None => {
                let (connection, reply) = self
                    .connection_establisher
                    .establish_monitoring_connection(self.address.clone(), connection_id)
                    .await?;
                self.connection = Some(connection);
                Ok(reply)
            }
        }
    }

    /// Reset the monitor's view of the server and report it as Unknown.
    async fn handle_error(&mut self, error: Error) -> bool {
        self.connection.take();
        self.topology_version.take();
        self.rtt.reset();
        self.topology_updater
            .handle_monitor_error(self.address.clone(), error)
            .await
    }

    fn start_rtt_monitor(&mut self) {
        if self.rtt_monitor.is_some() {
            return;
        }

        let shutdown = self.shutdown.child_token();
        let rtt_monitor = RttMonitor {
            address: self.address.clone(),
            connection: None,
            connection_establisher: self.connection_establisher.clone(),
            rtt: self.rtt.clone(),
            heartbeat_frequency: self.heartbeat_frequency,
            connect_timeout: self.connect_timeout,
            hello_ok: self.hello_ok,
            shutdown: shutdown.clone(),
        };
        runtime::execute(rtt_monitor.execute());
        self.rtt_monitor = Some(shutdown.drop_guard());
    }

    fn emit_event<F>(&self, event: F)
    where
        F: FnOnce() -> SdamEvent,
    {
        self.sdam_event_emitter.emit_event(event)
    }
}

#[allow(clippy::large_enum_variant)]
enum HelloResult {
    Ok(HelloReply),
    Err(Error),
    Cancelled,
}

/// Samples round-trip times on a dedicated connection while the main monitoring connection is
/// blocked on awaitable hellos.
struct RttMonitor {
    address: ServerAddress,
    connection: Option<Connection>,
    connection_establisher: ConnectionEstablisher,
    rtt: RttHandle,
    heartbeat_frequency: Duration,
    connect_timeout: Option<Duration>,
    hello_ok: Option<bool>,
    shutdown: CancellationToken,
}

impl RttMonitor {
    async fn execute(mut self) {
        let shutdown = self.shutdown.clone();
        let mut interval = runtime::interval(self.heartbeat_frequency);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.ping() => {}
            }
        }
    }

    async fn ping(&mut self) {
        let start = Instant::now();
        let result = match self.connection {
            Some(ref mut connection) => {
                let command = hello_command(None, self.hello_ok, None);
                connection
                    .send_hello(&command, self.connect_timeout)
                    .await
                    .map(|_| ())
            }
            None => self
                .connection_establisher
                .establish_monitoring_connection(
                    self.address.clone(),
                    next_monitoring_connection_id(),
                )
                .await
                .map(|(connection, _)| {
                    self.connection = Some(connection);
                }),
        };

        match result {
            Ok(()) => self.rtt.add_sample(start.elapsed()),
            Err(error) => {
                // The main monitor reports failures; the pinger just starts over.
                tracing::trace!(address = %self.address, %error, "RTT check failed");
                self.connection.take();
            }
        }
    }
}

/// A window of the most recent round-trip time samples for one server.
#[derive(Debug, Clone)]
pub(crate) struct RttInfo {
    samples: VecDeque<Duration>,
    window_size: usize,
}

impl RttInfo {
    pub(crate) fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            samples: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    pub(crate) fn add_sample(&mut self, sample: Duration) {
        if self.samples.len() == self.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// The mean of the samples in the window.
    pub(crate) fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    /// The smallest sample in the window. A single sample is not enough to call it a minimum.
    pub(crate) fn min(&self) -> Option<Duration> {
        if self.samples.len() < 2 {
            return None;
        }
        self.samples.iter().min().copied()
    }

    pub(crate) fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Round-trip statistics shared between a monitor and its RTT pinger.
#[derive(Clone)]
struct RttHandle {
    info: Arc<watch::Sender<RttInfo>>,
}

impl RttHandle {
    fn new(window_size: usize) -> Self {
        let (info, _) = watch::channel(RttInfo::new(window_size));
        Self {
            info: Arc::new(info),
        }
    }

    fn add_sample(&self, sample: Duration) {
        self.info.send_modify(|info| info.add_sample(sample));
    }

    fn average(&self) -> Option<Duration> {
        self.info.borrow().average()
    }

    fn min(&self) -> Option<Duration> {
        self.info.borrow().min()
    }

    fn reset(&self) {
        self.info.send_modify(RttInfo::reset);
    }
}
