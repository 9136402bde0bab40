use crate::{
    bson::{oid::ObjectId, Bson, Document},
    options::{ServerAddress, DEFAULT_PORT},
    sdam::TopologyDescription,
    selection_criteria::SelectionCriteria,
};

pub(crate) mod connection;
pub(crate) mod server_selection;
pub(crate) mod topology;

pub(crate) const CONNECTION_TRACING_EVENT_TARGET: &str = "mongodb_connectivity::connection";
pub(crate) const SERVER_SELECTION_TRACING_EVENT_TARGET: &str =
    "mongodb_connectivity::server_selection";
pub(crate) const TOPOLOGY_TRACING_EVENT_TARGET: &str = "mongodb_connectivity::topology";

pub(crate) trait TracingRepresentation {
    type Representation;

    fn tracing_representation(&self) -> Self::Representation;
}

impl TracingRepresentation for ObjectId {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_hex()
    }
}

impl TracingRepresentation for Document {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        Bson::Document(self.clone())
            .into_relaxed_extjson()
            .to_string()
    }
}

impl TracingRepresentation for crate::error::Error {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_string()
    }
}

impl TracingRepresentation for SelectionCriteria {
    type Representation = String;

    fn tracing_representation(&self) -> Self::Representation {
        self.to_string()
    }
}

impl TracingRepresentation for TopologyDescription {
    type Representation = String;

    fn tracing_representation(&self) -> Self::Representation {
        self.to_string()
    }
}

impl ServerAddress {
    /// Logged ports are always populated, with 27017 when the address left it unset.
    pub(crate) fn port_tracing_representation(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => Some(port.unwrap_or(DEFAULT_PORT)),
        }
    }
}
