use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    bson::{doc, oid::ObjectId, DateTime, Document},
    error::{CommandError, Error, ErrorKind, Result},
    options::ServerAddress,
    sdam::{ServerType, TopologyVersion},
    selection_criteria::TagSet,
    session::ClusterTime,
};

/// The legacy version of the `hello` command which was deprecated in 5.0.
/// To limit usages of the legacy name in the codebase, this constant should be used
/// wherever possible.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct AwaitableHelloOptions {
    pub(crate) topology_version: TopologyVersion,
    pub(crate) max_await_time: Duration,
}

/// A hello (or legacy hello) command ready to be handed to a [`Transport`](crate::Transport).
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct HelloCommand {
    /// The name of the command, either `hello` or `isMaster`.
    pub name: &'static str,

    /// The database the command is run against.
    pub target_db: &'static str,

    /// The command document.
    pub body: Document,

    /// Whether the server may stream further replies to this command without new requests.
    pub exhaust_allowed: bool,
}

/// Construct a hello or legacy hello command, depending on the circumstances.
///
/// If `load_balanced` is true, `hello` will be used.
/// If the server indicated `helloOk: true`, then `hello` will also be used.
/// Otherwise, legacy hello will be used, and if it's unknown whether the server supports hello,
/// the command also will contain `helloOk: true`.
pub(crate) fn hello_command(
    load_balanced: Option<bool>,
    hello_ok: Option<bool>,
    awaitable_options: Option<AwaitableHelloOptions>,
) -> HelloCommand {
    let (mut body, name) = if matches!(load_balanced, Some(true)) || matches!(hello_ok, Some(true))
    {
        (doc! { "hello": 1 }, "hello")
    } else {
        let mut body = doc! { LEGACY_HELLO_COMMAND_NAME: 1 };
        if hello_ok.is_none() {
            body.insert("helloOk", true);
        }
        (body, LEGACY_HELLO_COMMAND_NAME)
    };

    if matches!(load_balanced, Some(true)) {
        body.insert("loadBalanced", true);
    }

    if let Some(opts) = awaitable_options {
        body.insert(
            "topologyVersion",
            doc! {
                "processId": opts.topology_version.process_id,
                "counter": opts.topology_version.counter,
            },
        );
        body.insert(
            "maxAwaitTimeMS",
            i64::try_from(opts.max_await_time.as_millis()).unwrap_or(i64::MAX),
        );
    }

    HelloCommand {
        name,
        target_db: "admin",
        body,
        exhaust_allowed: awaitable_options.is_some(),
    }
}

/// Parse the raw reply to a hello command. Replies with `ok: 0` are converted into command
/// errors.
pub(crate) fn parse_hello_reply(
    server_address: ServerAddress,
    raw_command_response: Document,
) -> Result<HelloReply> {
    let ok = match raw_command_response.get("ok") {
        Some(crate::bson::Bson::Double(ok)) => *ok == 1.0,
        Some(crate::bson::Bson::Int32(ok)) => *ok == 1,
        Some(crate::bson::Bson::Int64(ok)) => *ok == 1,
        Some(crate::bson::Bson::Boolean(ok)) => *ok,
        _ => false,
    };
    if !ok {
        let command_error: CommandError =
            crate::bson::from_document(raw_command_response).map_err(|e| {
                Error::invalid_response(format!("failed to parse hello error reply: {e}"))
            })?;
        return Err(ErrorKind::Command(command_error).into());
    }

    let command_response: HelloCommandResponse =
        crate::bson::from_document(raw_command_response.clone())?;
    let cluster_time = raw_command_response
        .get_document("$clusterTime")
        .ok()
        .and_then(|doc| crate::bson::from_document(doc.clone()).ok());

    Ok(HelloReply {
        server_address,
        command_response,
        raw_command_response,
        cluster_time,
    })
}

/// A parsed reply to a hello command.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct HelloReply {
    /// The address of the server that sent the reply.
    pub server_address: ServerAddress,

    /// The typed contents of the reply.
    pub command_response: HelloCommandResponse,

    /// The reply exactly as the server sent it.
    pub raw_command_response: Document,

    /// The cluster time gossiped by the server, if any.
    pub cluster_time: Option<ClusterTime>,
}

/// The response to a `hello` command.
///
/// See the [`hello` command reference](https://www.mongodb.com/docs/manual/reference/command/hello/)
/// for more details.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// mongos instance, or a standalone mongod.
    pub is_writable_primary: Option<bool>,

    #[serde(rename = "ismaster")]
    /// Legacy name for `is_writable_primary` field.
    pub is_master: Option<bool>,

    /// Whether or not the server supports using the `hello` command for monitoring instead
    /// of the legacy hello command.
    pub hello_ok: Option<bool>,

    /// The list of all hosts.
    pub hosts: Option<Vec<String>>,

    /// The list of all passives in a replica set.
    pub passives: Option<Vec<String>>,

    /// The list of all arbiters in a replica set.
    pub arbiters: Option<Vec<String>>,

    /// An optional message. This contains the value "isdbgrid" when returned from a mongos.
    pub msg: Option<String>,

    /// The address of the server that returned this `HelloCommandResponse`.
    pub me: Option<String>,

    /// The current replica set config version.
    pub set_version: Option<i32>,

    /// The name of the current replica set.
    pub set_name: Option<String>,

    /// Whether the server is hidden.
    pub hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub arbiter_only: Option<bool>,

    #[serde(rename = "isreplicaset")]
    /// Whether the server is a replica set.
    pub is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub logical_session_timeout_minutes: Option<i64>,

    /// Optime and date information for the server's most recent write operation.
    pub last_write: Option<LastWrite>,

    /// The minimum wire version that the server supports.
    pub min_wire_version: Option<i32>,

    /// The maximum wire version that the server supports.
    pub max_wire_version: Option<i32>,

    /// User-defined tags for a replica set member.
    pub tags: Option<TagSet>,

    /// A unique identifier for each election.
    pub election_id: Option<ObjectId>,

    /// The address of current primary member of the replica set.
    pub primary: Option<String>,

    /// The maximum permitted size of a BSON object in bytes.
    #[serde(default)]
    pub max_bson_object_size: i64,

    /// The maximum number of write operations permitted in a write batch.
    pub max_write_batch_size: Option<i64>,

    /// If the connection is to a load balancer, the id of the selected backend.
    pub service_id: Option<ObjectId>,

    /// The server's current topology version.
    pub topology_version: Option<TopologyVersion>,

    /// The maximum permitted size of a BSON wire protocol message.
    #[serde(default)]
    pub max_message_size_bytes: i32,

    /// The server-generated ID for the connection the "hello" command was run on.
    /// Present on server versions 4.2+.
    pub connection_id: Option<i64>,
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

/// Date information for a server's most recent write.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastWrite {
    /// When the last write was applied on the server.
    pub last_write_date: DateTime,
}
