use crate::{
    bson::oid::ObjectId,
    event::cmap::{CmapEvent, ConnectionCheckoutFailedReason, ConnectionClosedReason},
    trace::{TracingRepresentation, CONNECTION_TRACING_EVENT_TARGET},
};

#[derive(Clone)]
pub(crate) struct ConnectionTracingEventEmitter {
    topology_id: ObjectId,
}

impl ConnectionTracingEventEmitter {
    pub(crate) fn new(topology_id: ObjectId) -> ConnectionTracingEventEmitter {
        Self { topology_id }
    }

    pub(crate) fn handle(&self, event: &CmapEvent) {
        use CmapEvent::*;
        match event {
            PoolCreated(event) => {
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    maxIdleTimeMS = event.max_idle_time.map(|m| m.as_millis()),
                    maxPoolSize = event.max_pool_size,
                    minPoolSize = event.min_pool_size,
                    maxConnecting = event.max_connecting,
                    "Connection pool created",
                );
            }
            PoolReady(event) => {
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    "Connection pool ready",
                );
            }
            PoolCleared(event) => {
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    serviceId = event.service_id.map(|id| id.tracing_representation()),
                    interruptInUseConnections = event.interrupt_in_use_connections,
                    "Connection pool cleared",
                );
            }
            PoolClosed(event) => {
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    "Connection pool closed",
                );
            }
            ConnectionCreated(event) => {
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    driverConnectionId = event.connection_id,
                    "Connection created",
                );
            }
            ConnectionReady(event) => {
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    driverConnectionId = event.connection_id,
                    durationMS = event.duration.as_millis(),
                    "Connection ready",
                );
            }
            ConnectionClosed(event) => {
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    driverConnectionId = event.connection_id,
                    reason = event.reason.tracing_representation(),
                    error = event.error.as_ref().map(|e| e.tracing_representation()),
                    "Connection closed",
                );
            }
            ConnectionCheckoutStarted(event) => {
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    "Connection checkout started",
                );
            }
            ConnectionCheckoutFailed(event) => {
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    reason = event.reason.tracing_representation(),
                    error = event.error.as_ref().map(|e| e.tracing_representation()),
                    durationMS = event.duration.as_millis(),
                    "Connection checkout failed",
                );
            }
            ConnectionCheckedOut(event) => {
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    driverConnectionId = event.connection_id,
                    durationMS = event.duration.as_millis(),
                    "Connection checked out",
                );
            }
            ConnectionCheckedIn(event) => {
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    driverConnectionId = event.connection_id,
                    "Connection checked in",
                );
            }
        }
    }
}

impl TracingRepresentation for ConnectionClosedReason {
    type Representation = &'static str;

    fn tracing_representation(&self) -> &'static str {
        match self {
            Self::Stale => "Connection became stale because the pool was cleared",
            Self::Idle => {
                "Connection has been available but unused for longer than the configured max idle \
                 time"
            }
            Self::Error => "An error occurred while using the connection",
            Self::Dropped => "Connection was dropped during an operation",
            Self::PoolClosed => "Connection pool was closed",
        }
    }
}

impl TracingRepresentation for ConnectionCheckoutFailedReason {
    type Representation = &'static str;

    fn tracing_representation(&self) -> &'static str {
        match self {
            Self::PoolClosed => "Connection pool was closed",
            Self::Timeout => "Wait queue timeout elapsed without a connection becoming available",
            Self::ConnectionError => "An error occurred while trying to establish a new connection",
        }
    }
}
