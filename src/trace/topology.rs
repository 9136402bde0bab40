use crate::{
    bson::oid::ObjectId,
    event::sdam::SdamEvent,
    trace::{TracingRepresentation, TOPOLOGY_TRACING_EVENT_TARGET},
};

#[derive(Clone)]
pub(crate) struct TopologyTracingEventEmitter {
    topology_id: ObjectId,
}

impl TopologyTracingEventEmitter {
    pub(crate) fn new(topology_id: ObjectId) -> TopologyTracingEventEmitter {
        TopologyTracingEventEmitter { topology_id }
    }

    pub(crate) fn handle(&self, event: &SdamEvent) {
        use SdamEvent::*;
        match event {
            // Server-level changes are always accompanied by a topology-level change, which is
            // logged instead.
            ServerDescriptionChanged(_) => {}
            ServerOpening(event) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    "Starting server monitoring"
                );
            }
            ServerClosed(event) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.address.host(),
                    serverPort = event.address.port_tracing_representation(),
                    "Stopped server monitoring"
                );
            }
            TopologyDescriptionChanged(event) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    previousDescription = event.previous_description.tracing_representation(),
                    newDescription = event.new_description.tracing_representation(),
                    "Topology description changed"
                );
            }
            TopologyOpening(_) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    "Starting topology monitoring"
                );
            }
            TopologyClosed(_) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    "Stopped topology monitoring"
                );
            }
            ServerHeartbeatStarted(event) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.server_address.host(),
                    serverPort = event.server_address.port_tracing_representation(),
                    driverConnectionId = event.driver_connection_id,
                    serverConnectionId = event.server_connection_id,
                    awaited = event.awaited,
                    "Server heartbeat started"
                );
            }
            ServerHeartbeatSucceeded(event) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.server_address.host(),
                    serverPort = event.server_address.port_tracing_representation(),
                    driverConnectionId = event.driver_connection_id,
                    serverConnectionId = event.server_connection_id,
                    awaited = event.awaited,
                    reply = event.reply.tracing_representation(),
                    durationMS = event.duration.as_millis(),
                    "Server heartbeat succeeded"
                );
            }
            ServerHeartbeatFailed(event) => {
                tracing::debug!(
                    target: TOPOLOGY_TRACING_EVENT_TARGET,
                    topologyId = self.topology_id.tracing_representation(),
                    serverHost = event.server_address.host(),
                    serverPort = event.server_address.port_tracing_representation(),
                    driverConnectionId = event.driver_connection_id,
                    serverConnectionId = event.server_connection_id,
                    awaited = event.awaited,
                    failure = event.failure.tracing_representation(),
                    durationMS = event.duration.as_millis(),
                    "Server heartbeat failed"
                );
            }
        }
    }
}
