use std::time::Duration;

use crate::{bson::oid::ObjectId, hello::HelloReply};

/// What the handshake reported about the server at the other end of a connection.
#[derive(Debug, Default, Clone)]
pub(crate) struct StreamDescription {
    /// The maximum wire version that the server understands.
    pub(crate) max_wire_version: Option<i32>,

    /// How long sessions started on this server will stay alive without executing an operation
    /// before the server kills them.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// If the connection is to a load balancer, the id of the selected backend.
    pub(crate) service_id: Option<ObjectId>,
}

impl StreamDescription {
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let response = &reply.command_response;
        Self {
            max_wire_version: response.max_wire_version,
            logical_session_timeout: response
                .logical_session_timeout_minutes
                .map(|mins| Duration::from_secs(mins as u64 * 60)),
            service_id: response.service_id,
        }
    }

    /// Whether sessions can be used on a connection with this description.
    pub(crate) fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some()
    }
}
