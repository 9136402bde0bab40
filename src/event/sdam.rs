//! Contains the events and functionality for monitoring Server Discovery and Monitoring.

use std::time::Duration;

use derive_more::From;

use crate::{
    bson::{oid::ObjectId, Document},
    error::Error,
    event::EventHandler,
    options::ServerAddress,
    sdam::{ServerDescription, TopologyDescription},
    trace::{topology::TopologyTracingEventEmitter, TOPOLOGY_TRACING_EVENT_TARGET},
};

/// Published when a server description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The server's previous description.
    pub previous_description: ServerDescription,

    /// The server's new description.
    pub new_description: ServerDescription,
}

impl ServerDescriptionChangedEvent {
    #[cfg(test)]
    pub(crate) fn is_marked_unknown_event(&self) -> bool {
        self.previous_description.server_type.is_available()
            && self.new_description.server_type == crate::sdam::ServerType::Unknown
    }
}

/// Published when a server is initialized.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server is closed.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a topology description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The ID of the topology.
    pub topology_id: ObjectId,

    /// The topology's previous description.
    pub previous_description: TopologyDescription,

    /// The topology's new description.
    pub new_description: TopologyDescription,
}

/// Published when a topology is initialized.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a topology is closed, either explicitly or because every handle to it was
/// dropped.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct TopologyClosedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server monitor's `hello` or legacy hello command is started.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server.
    pub server_address: ServerAddress,

    /// Determines if this heartbeat event is from an awaitable `hello`.
    pub awaited: bool,

    /// The client-generated ID for the connection used for the heartbeat.
    pub driver_connection_id: u32,

    /// The server-generated ID for the connection used for the heartbeat. If this event
    /// corresponds to the first heartbeat on a new monitoring connection, this value will not be
    /// present.
    pub server_connection_id: Option<i64>,
}

/// Published when a server monitor's `hello` or legacy hello command succeeds.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// The execution time of the event.
    pub duration: Duration,

    /// The reply to the `hello` or legacy hello command.
    pub reply: Document,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// Determines if this heartbeat event is from an awaitable `hello`.
    pub awaited: bool,

    /// The client-generated ID for the connection used for the heartbeat.
    pub driver_connection_id: u32,

    /// The server-generated ID for the connection used for the heartbeat.
    pub server_connection_id: Option<i64>,
}

/// Published when a server monitor's `hello` or legacy hello command fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// The execution time of the event.
    pub duration: Duration,

    /// The failure that occurred.
    pub failure: Error,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// Determines if this heartbeat event is from an awaitable `hello`.
    pub awaited: bool,

    /// The client-generated ID for the connection used for the heartbeat.
    pub driver_connection_id: u32,

    /// The server-generated ID for the connection used for the heartbeat.
    pub server_connection_id: Option<i64>,
}

#[derive(Clone, Debug, From)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum SdamEvent {
    #[from(ignore)]
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    ServerOpening(ServerOpeningEvent),
    ServerClosed(ServerClosedEvent),
    #[from(ignore)]
    TopologyDescriptionChanged(Box<TopologyDescriptionChangedEvent>),
    TopologyOpening(TopologyOpeningEvent),
    TopologyClosed(TopologyClosedEvent),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

/// Routes SDAM events to the user's handler and to `tracing`.
#[derive(Clone)]
pub(crate) struct SdamEventEmitter {
    user_handler: Option<EventHandler<SdamEvent>>,
    tracing_emitter: TopologyTracingEventEmitter,
}

impl SdamEventEmitter {
    pub(crate) fn new(
        user_handler: Option<EventHandler<SdamEvent>>,
        topology_id: ObjectId,
    ) -> Self {
        Self {
            user_handler,
            tracing_emitter: TopologyTracingEventEmitter::new(topology_id),
        }
    }

    pub(crate) fn emit_event(&self, generate_event: impl FnOnce() -> SdamEvent) {
        let tracing_enabled =
            tracing::enabled!(target: TOPOLOGY_TRACING_EVENT_TARGET, tracing::Level::DEBUG);
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
