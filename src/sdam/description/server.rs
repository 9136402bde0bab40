use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    bson::{oid::ObjectId, DateTime},
    error::{Error, ErrorKind, Result},
    hello::HelloReply,
    options::ServerAddress,
    selection_criteria::TagSet,
    session::ClusterTime,
};

/// The lowest wire version this crate can talk to (MongoDB 4.2).
pub(crate) const MIN_WIRE_VERSION: i32 = 8;
const MIN_DB_VERSION: &str = "4.2";

/// The highest wire version this crate understands.
pub(crate) const MAX_WIRE_VERSION: i32 = 25;

/// Servers at or above this wire version order (electionId, setVersion) with the election id
/// first when detecting stale primaries.
pub(crate) const ELECTION_ID_PRIORITY_WIRE_VERSION: i32 = 17;

/// Enum representing the possible types of servers that can be connected to.
#[derive(Debug, Deserialize, Clone, Copy, Eq, PartialEq, Serialize, Default, derive_more::Display)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    #[serde(rename = "RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[serde(rename = "RSOther")]
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the replica
    /// set config.
    #[serde(rename = "RSGhost")]
    RsGhost,

    /// A load-balancing proxy between the client and the MongoDB deployment.
    LoadBalancer,

    /// A server that has not been communicated with yet or can't connect to.
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    /// Whether this server is "available" i.e. whether it can be selected for operations.
    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// Struct modeling the `topologyVersion` field included in the server's hello and legacy hello
/// responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TopologyVersion {
    /// Identifies the server process. Counters are only comparable within one process.
    pub process_id: ObjectId,

    /// Incremented by the server whenever its view of the topology changes.
    pub counter: i64,
}

impl TopologyVersion {
    /// A topology version is more recent than another if it comes from a different process or
    /// carries a higher counter.
    pub(crate) fn is_more_recent_than(&self, existing_tv: TopologyVersion) -> bool {
        self.process_id != existing_tv.process_id || self.counter > existing_tv.counter
    }
}

/// A description of the most up-to-date information known about a server.
#[derive(Debug, Clone)]
pub struct ServerDescription {
    /// The address of this server.
    pub(crate) address: ServerAddress,

    /// The type of this server.
    pub(crate) server_type: ServerType,

    /// The last time this server was updated.
    pub(crate) last_update_time: Option<DateTime>,

    /// The average duration of this server's hello calls.
    pub(crate) average_round_trip_time: Option<Duration>,

    /// The fastest of this server's recent round trips. Only known once at least two samples
    /// have been taken.
    pub(crate) min_round_trip_time: Option<Duration>,

    // The description either holds the reply to the last hello, the error that the last check
    // (or an application operation) failed with, or nothing for a server that has not been
    // checked yet.
    pub(crate) reply: std::result::Result<Option<HelloReply>, Error>,
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (self.reply.as_ref(), other.reply.as_ref()) {
            (Ok(self_reply), Ok(other_reply)) => {
                let self_response = self_reply.as_ref().map(|r| &r.command_response);
                let other_response = other_reply.as_ref().map(|r| &r.command_response);

                match (self_response, other_response) {
                    (Some(a), Some(b)) => {
                        a.min_wire_version == b.min_wire_version
                            && a.max_wire_version == b.max_wire_version
                            && a.me == b.me
                            && a.hosts == b.hosts
                            && a.passives == b.passives
                            && a.arbiters == b.arbiters
                            && a.tags == b.tags
                            && a.set_name == b.set_name
                            && a.set_version == b.set_version
                            && a.election_id == b.election_id
                            && a.primary == b.primary
                            && a.logical_session_timeout_minutes
                                == b.logical_session_timeout_minutes
                            && a.topology_version == b.topology_version
                    }
                    (None, None) => true,
                    _ => false,
                }
            }
            (Err(self_err), Err(other_err)) => {
                match (self_err.kind.as_ref(), other_err.kind.as_ref()) {
                    (ErrorKind::Command(self_command), ErrorKind::Command(other_command)) => {
                        self_command.code == other_command.code
                            && self_command.topology_version
                                == other_command.topology_version
                    }
                    _ => self_err.to_string() == other_err.to_string(),
                }
            }
            _ => false,
        }
    }
}

impl ServerDescription {
    /// The placeholder description of a server that has not been checked yet.
    pub(crate) fn new(address: &ServerAddress) -> Self {
        Self {
            address: address.clone(),
            server_type: Default::default(),
            last_update_time: None,
            average_round_trip_time: None,
            min_round_trip_time: None,
            reply: Ok(None),
        }
    }

    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        mut reply: HelloReply,
        average_round_trip_time: Duration,
        min_round_trip_time: Option<Duration>,
    ) -> Self {
        let mut description = Self::new(&address);
        description.last_update_time = Some(DateTime::now());
        description.server_type = reply.command_response.server_type();

        // An unknown server's latency is meaningless for selection.
        if description.server_type.is_available() {
            description.average_round_trip_time = Some(average_round_trip_time);
            description.min_round_trip_time = min_round_trip_time;
        }

        let lowercase = |hosts: &mut Option<Vec<String>>| {
            if let Some(hosts) = hosts {
                hosts.iter_mut().for_each(|host| *host = host.to_lowercase());
            }
        };
        lowercase(&mut reply.command_response.hosts);
        lowercase(&mut reply.command_response.passives);
        lowercase(&mut reply.command_response.arbiters);
        if let Some(ref mut me) = reply.command_response.me {
            *me = me.to_lowercase();
        }
        if let Some(ref mut primary) = reply.command_response.primary {
            *primary = primary.to_lowercase();
        }

        description.reply = Ok(Some(reply));
        description
    }

    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        let mut description = Self::new(&address);
        description.last_update_time = Some(DateTime::now());
        description.reply = Err(error);
        description
    }

    /// The address of this server.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The type of this server.
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// Whether this server is "available" i.e. whether it can be selected for operations.
    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    pub(crate) fn hello_reply(&self) -> Option<&HelloReply> {
        self.reply.as_ref().ok().and_then(Option::as_ref)
    }

    pub(crate) fn error(&self) -> Option<&Error> {
        self.reply.as_ref().err()
    }

    pub(crate) fn compatibility_error_message(&self) -> Option<String> {
        let reply = self.hello_reply()?;
        let server_min_wire_version = reply.command_response.min_wire_version.unwrap_or(0);

        if server_min_wire_version > MAX_WIRE_VERSION {
            return Some(format!(
                "Server at {} requires wire version {}, but this client only \
                 supports up to {}",
                self.address, server_min_wire_version, MAX_WIRE_VERSION,
            ));
        }

        let server_max_wire_version = reply.command_response.max_wire_version.unwrap_or(0);

        if server_max_wire_version < MIN_WIRE_VERSION {
            return Some(format!(
                "Server at {} reports wire version {}, but this client requires \
                 at least {} (MongoDB {}).",
                self.address, server_max_wire_version, MIN_WIRE_VERSION, MIN_DB_VERSION
            ));
        }

        None
    }

    pub(crate) fn set_name(&self) -> Result<Option<String>> {
        let set_name = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.set_name.clone());
        Ok(set_name)
    }

    pub(crate) fn known_hosts(&self) -> Result<Vec<ServerAddress>> {
        let known_hosts = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .map(|reply| {
                let hosts = reply.command_response.hosts.as_ref();
                let passives = reply.command_response.passives.as_ref();
                let arbiters = reply.command_response.arbiters.as_ref();

                hosts
                    .into_iter()
                    .flatten()
                    .chain(passives.into_iter().flatten())
                    .chain(arbiters.into_iter().flatten())
            });

        known_hosts
            .into_iter()
            .flatten()
            .map(ServerAddress::parse)
            .collect()
    }

    pub(crate) fn invalid_me(&self) -> Result<bool> {
        if let Some(reply) = self.reply.as_ref().map_err(Clone::clone)? {
            if let Some(ref me) = reply.command_response.me {
                return Ok(ServerAddress::parse(me)? != self.address);
            }
        }

        Ok(false)
    }

    pub(crate) fn set_version(&self) -> Result<Option<i32>> {
        let set_version = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.set_version);
        Ok(set_version)
    }

    pub(crate) fn election_id(&self) -> Result<Option<ObjectId>> {
        let election_id = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.election_id);
        Ok(election_id)
    }

    pub(crate) fn min_wire_version(&self) -> Option<i32> {
        self.hello_reply()
            .and_then(|reply| reply.command_response.min_wire_version)
    }

    pub(crate) fn max_wire_version(&self) -> Option<i32> {
        self.hello_reply()
            .and_then(|reply| reply.command_response.max_wire_version)
    }

    pub(crate) fn last_write_date(&self) -> Option<DateTime> {
        self.hello_reply().and_then(|reply| {
            reply
                .command_response
                .last_write
                .as_ref()
                .map(|write| write.last_write_date)
        })
    }

    /// The session timeout the server reported. A negative or out of range value counts as no
    /// session support.
    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.hello_reply().and_then(|reply| {
            reply
                .command_response
                .logical_session_timeout_minutes
                .and_then(|minutes| u64::try_from(minutes).ok())
                .and_then(|minutes| minutes.checked_mul(60))
                .map(Duration::from_secs)
        })
    }

    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        self.hello_reply().and_then(|reply| reply.cluster_time.as_ref())
    }

    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.reply {
            Ok(None) => None,
            Ok(Some(ref reply)) => reply.command_response.topology_version,
            Err(ref e) => e.topology_version(),
        }
    }

    pub(crate) fn primary(&self) -> Option<&str> {
        self.hello_reply()
            .and_then(|reply| reply.command_response.primary.as_deref())
    }

    pub(crate) fn tags(&self) -> Option<&TagSet> {
        self.hello_reply()
            .and_then(|reply| reply.command_response.tags.as_ref())
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let server_tags = match self.tags() {
            Some(tags) => tags,
            None => return tag_set.is_empty(),
        };

        tag_set
            .iter()
            .all(|(key, val)| server_tags.get(key) == Some(val))
    }
}
