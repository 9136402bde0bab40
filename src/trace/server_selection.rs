use std::time::{Duration, Instant};

use super::{TracingRepresentation, SERVER_SELECTION_TRACING_EVENT_TARGET};
use crate::{
    bson::oid::ObjectId,
    error::Error,
    event::{
        server_selection::{
            ServerSelectionEvent,
            ServerSelectionFailedEvent,
            ServerSelectionStartedEvent,
            ServerSelectionSucceededEvent,
            ServerSelectionWaitingEvent,
        },
        EventHandler,
    },
    options::ServerAddress,
    sdam::TopologyDescription,
    selection_criteria::SelectionCriteria,
};

/// Type responsible for emitting server selection events, both to `tracing` and to the user's
/// handler.
pub(crate) struct ServerSelectionEventEmitter<'a> {
    topology_id: ObjectId,
    criteria: &'a SelectionCriteria,
    operation_name: &'a str,
    start_time: Instant,
    timeout: Duration,
    user_handler: Option<&'a EventHandler<ServerSelectionEvent>>,
}

impl ServerSelectionEventEmitter<'_> {
    pub(crate) fn new<'a>(
        topology_id: ObjectId,
        criteria: &'a SelectionCriteria,
        operation_name: &'a str,
        start_time: Instant,
        timeout: Duration,
        user_handler: Option<&'a EventHandler<ServerSelectionEvent>>,
    ) -> ServerSelectionEventEmitter<'a> {
        ServerSelectionEventEmitter::<'a> {
            topology_id,
            criteria,
            operation_name,
            start_time,
            timeout,
            user_handler,
        }
    }

    fn remaining_time(&self) -> Duration {
        self.timeout
            .checked_sub(self.start_time.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub(crate) fn emit_started_event(&self, topology_description: &TopologyDescription) {
        if tracing::enabled!(target: SERVER_SELECTION_TRACING_EVENT_TARGET, tracing::Level::DEBUG) {
            tracing::debug!(
                target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                operation = self.operation_name,
                selector = self.criteria.tracing_representation(),
                topologyDescription = topology_description.tracing_representation(),
                "Server selection started"
            );
        }
        if let Some(handler) = self.user_handler {
            handler.handle(
                ServerSelectionStartedEvent {
                    topology_id: self.topology_id,
                    operation: self.operation_name.to_string(),
                    criteria: self.criteria.clone(),
                    topology_description: topology_description.clone(),
                }
                .into(),
            );
        }
    }

    pub(crate) fn emit_failed_event(
        &self,
        topology_description: &TopologyDescription,
        error: &Error,
    ) {
        if tracing::enabled!(target: SERVER_SELECTION_TRACING_EVENT_TARGET, tracing::Level::DEBUG) {
            tracing::debug!(
                target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                operation = self.operation_name,
                selector = self.criteria.tracing_representation(),
                topologyDescription = topology_description.tracing_representation(),
                failure = error.tracing_representation(),
                "Server selection failed"
            );
        }
        if let Some(handler) = self.user_handler {
            handler.handle(
                ServerSelectionFailedEvent {
                    topology_id: self.topology_id,
                    operation: self.operation_name.to_string(),
                    criteria: self.criteria.clone(),
                    failure: error.clone(),
                    duration: self.start_time.elapsed(),
                }
                .into(),
            );
        }
    }

    pub(crate) fn emit_succeeded_event(
        &self,
        topology_description: &TopologyDescription,
        address: &ServerAddress,
    ) {
        if tracing::enabled!(target: SERVER_SELECTION_TRACING_EVENT_TARGET, tracing::Level::DEBUG) {
            tracing::debug!(
                target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                operation = self.operation_name,
                selector = self.criteria.tracing_representation(),
                topologyDescription = topology_description.tracing_representation(),
                serverHost = address.host(),
                serverPort = address.port_tracing_representation(),
                "Server selection succeeded"
            );
        }
        if let Some(handler) = self.user_handler {
            handler.handle(
                ServerSelectionSucceededEvent {
                    topology_id: self.topology_id,
                    operation: self.operation_name.to_string(),
                    criteria: self.criteria.clone(),
                    server_address: address.clone(),
                    duration: self.start_time.elapsed(),
                }
                .into(),
            );
        }
    }

    pub(crate) fn emit_waiting_event(&self, topology_description: &TopologyDescription) {
        let remaining_time = self.remaining_time();
        if tracing::enabled!(target: SERVER_SELECTION_TRACING_EVENT_TARGET, tracing::Level::INFO) {
            tracing::info!(
                target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                topologyId = self.topology_id.tracing_representation(),
                operation = self.operation_name,
                selector = self.criteria.tracing_representation(),
                topologyDescription = topology_description.tracing_representation(),
                remainingTimeMS = remaining_time.as_millis(),
                "Waiting for suitable server to become available",
            );
        }
        if let Some(handler) = self.user_handler {
            handler.handle(
                ServerSelectionWaitingEvent {
                    topology_id: self.topology_id,
                    operation: self.operation_name.to_string(),
                    criteria: self.criteria.clone(),
                    topology_description: topology_description.clone(),
                    remaining_time,
                }
                .into(),
            );
        }
    }
}
