//! Contains the events emitted while selecting a server for an operation.

use std::time::Duration;

use derive_more::From;

use crate::{
    bson::oid::ObjectId,
    error::Error,
    options::ServerAddress,
    sdam::TopologyDescription,
    selection_criteria::SelectionCriteria,
};

/// Published when server selection begins.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerSelectionStartedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The name of the operation a server is being selected for.
    pub operation: String,

    /// The criteria used to select the server.
    pub criteria: SelectionCriteria,

    /// The topology observed when selection began.
    pub topology_description: TopologyDescription,
}

/// Published when server selection is about to wait for the topology to change.
///
/// Only emitted once per selection attempt, the first time no suitable server is found.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerSelectionWaitingEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The name of the operation a server is being selected for.
    pub operation: String,

    /// The criteria used to select the server.
    pub criteria: SelectionCriteria,

    /// The topology in which no suitable server was found.
    pub topology_description: TopologyDescription,

    /// How much longer selection will wait before failing.
    pub remaining_time: Duration,
}

/// Published when server selection succeeds.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerSelectionSucceededEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The name of the operation a server was selected for.
    pub operation: String,

    /// The criteria used to select the server.
    pub criteria: SelectionCriteria,

    /// The address of the selected server.
    pub server_address: ServerAddress,

    /// How long selection took.
    pub duration: Duration,
}

/// Published when server selection fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerSelectionFailedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The name of the operation a server was being selected for.
    pub operation: String,

    /// The criteria used to select the server.
    pub criteria: SelectionCriteria,

    /// The reason selection failed.
    pub failure: Error,

    /// How long selection ran before failing.
    pub duration: Duration,
}

#[derive(Clone, Debug, From)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum ServerSelectionEvent {
    Started(ServerSelectionStartedEvent),
    Waiting(ServerSelectionWaitingEvent),
    Succeeded(ServerSelectionSucceededEvent),
    Failed(ServerSelectionFailedEvent),
}
