//! Contains the options used to configure a [`Topology`](crate::Topology).

use std::{
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    time::Duration,
};

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use typed_builder::TypedBuilder;

pub use crate::selection_criteria::{
    ReadPreference,
    ReadPreferenceOptions,
    SelectionCriteria,
    TagSet,
};
use crate::{
    error::{Error, Result},
    event::{cmap::CmapEvent, sdam::SdamEvent, server_selection::ServerSelectionEvent, EventHandler},
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

/// The default time between heartbeats.
pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

/// The shortest time a monitor will wait between two checks of the same server.
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

pub(crate) const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The number of round trip time samples kept per server.
pub(crate) const DEFAULT_RTT_WINDOW_SIZE: usize = 10;

/// An enum representing the address of a MongoDB server.
#[derive(Clone, Debug, Eq)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the MongoDB server can be found.
        host: String,

        /// The TCP port that the MongoDB server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(|e| D::Error::custom(format!("{e}")))
    }
}

impl Serialize for ServerAddress {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Tcp { host, port },
                Self::Tcp {
                    host: other_host,
                    port: other_port,
                },
            ) => {
                host == other_host
                    && port.unwrap_or(DEFAULT_PORT) == other_port.unwrap_or(DEFAULT_PORT)
            }
        }
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        match self {
            Self::Tcp { host, port } => {
                host.hash(state);
                port.unwrap_or(DEFAULT_PORT).hash(state);
            }
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`. Hostnames are case-insensitive and are
    /// normalized to lowercase.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');
        let hostname = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "invalid server address: \"{address}\"; hostname cannot be empty"
                )))
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| {
                    Error::invalid_argument(format!(
                        "port must be valid 16-bit unsigned integer, instead got: {part}"
                    ))
                })?;

                if port == 0 {
                    return Err(Error::invalid_argument(format!(
                        "invalid server address: \"{address}\"; port must be non-zero"
                    )));
                }
                if parts.next().is_some() {
                    return Err(Error::invalid_argument(format!(
                        "address \"{address}\" contains more than one unescaped ':'"
                    )));
                }

                Some(port)
            }
            None => None,
        };

        Ok(ServerAddress::Tcp {
            host: hostname.to_lowercase(),
            port,
        })
    }

    /// The hostname or IP address of this address.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    /// The port of this address, if one was specified.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
            }
        }
    }
}

/// How a server monitor learns about changes to its server.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ServerMonitoringMode {
    /// Use streaming when the server supports it and polling otherwise.
    #[default]
    Auto,
    /// Always poll the server on the heartbeat interval.
    Poll,
    /// Stream topology changes from servers that support awaitable hello.
    Stream,
}

/// Contains the options that can be used to create a new [`Topology`](crate::Topology).
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct TopologyOptions {
    /// The initial list of seeds that the topology should connect to.
    #[builder(default_code = "vec![ServerAddress::default()]")]
    pub hosts: Vec<ServerAddress>,

    /// Connect only to the single seed given in `hosts`, bypassing discovery.
    pub direct_connection: Option<bool>,

    /// The name of the replica set the topology is expected to be a member of.
    pub repl_set_name: Option<String>,

    /// Whether the deployment sits behind a load balancer.
    pub load_balanced: Option<bool>,

    /// The amount of time each monitoring task waits between performing server checks.
    ///
    /// The default value is 10 seconds.
    pub heartbeat_freq: Option<Duration>,

    /// The minimum time between two checks of the same server. Only lowered in tests.
    #[builder(setter(skip))]
    pub(crate) min_heartbeat_freq: Option<Duration>,

    /// Whether monitors poll or stream server state.
    pub server_monitoring_mode: Option<ServerMonitoringMode>,

    /// The connect timeout passed to each underlying stream.
    ///
    /// The default value is 10 seconds. A value of zero disables the timeout.
    pub connect_timeout: Option<Duration>,

    /// The width of the latency window used during server selection.
    ///
    /// The default value is 15 milliseconds.
    pub local_threshold: Option<Duration>,

    /// The amount of time to wait for a suitable server before failing selection.
    ///
    /// The default value is 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// An overall deadline for each operation. Setting this enables the single shared deadline
    /// mode in which every phase of an operation draws from the same budget.
    pub timeout: Option<Duration>,

    /// The timeout applied to individual socket reads and writes when no overall deadline is
    /// configured.
    pub socket_timeout: Option<Duration>,

    /// The maximum number of connections that each server's pool may manage at once.
    ///
    /// The default value is 10.
    pub max_pool_size: Option<u32>,

    /// The minimum number of connections each pool keeps open once it is ready.
    pub min_pool_size: Option<u32>,

    /// The maximum number of connections a pool may be establishing at once.
    ///
    /// The default value is 2.
    pub max_connecting: Option<u32>,

    /// Connections that have been idle in the pool for longer than this are closed. A value of
    /// zero disables the idle check.
    pub max_idle_time: Option<Duration>,

    /// How long a checkout may wait for a connection before failing, when no overall deadline
    /// is configured.
    pub wait_queue_timeout: Option<Duration>,

    /// The number of round trip time samples kept per server.
    ///
    /// The default value is 10.
    pub rtt_window_size: Option<usize>,

    /// The handler that should process all Connection Monitoring and Pooling events.
    #[builder(setter(strip_option))]
    pub cmap_event_handler: Option<EventHandler<CmapEvent>>,

    /// The handler that should process all Server Discovery and Monitoring events.
    #[builder(setter(strip_option))]
    pub sdam_event_handler: Option<EventHandler<SdamEvent>>,

    /// The handler that should process all server selection events.
    #[builder(setter(strip_option))]
    pub server_selection_event_handler: Option<EventHandler<ServerSelectionEvent>>,

    /// Pool maintenance interval. Only lowered in tests.
    #[builder(setter(skip))]
    pub(crate) maintenance_frequency: Option<Duration>,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TopologyOptions {
    /// Checks the options for combinations that cannot be honored.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::invalid_argument("at least one host must be specified"));
        }

        if let (Some(min), Some(max)) = (self.min_pool_size, self.max_pool_size) {
            if max != 0 && min > max {
                return Err(Error::invalid_argument(format!(
                    "min_pool_size ({min}) is greater than max_pool_size ({max})"
                )));
            }
        }

        if self.max_connecting == Some(0) {
            return Err(Error::invalid_argument("max_connecting must be greater than 0"));
        }

        if self.direct_connection == Some(true) && self.hosts.len() > 1 {
            return Err(Error::invalid_argument(
                "cannot specify multiple seeds with directConnection=true",
            ));
        }

        if self.load_balanced == Some(true) {
            if self.hosts.len() > 1 {
                return Err(Error::invalid_argument(
                    "cannot specify multiple seeds with loadBalanced=true",
                ));
            }
            if self.repl_set_name.is_some() {
                return Err(Error::invalid_argument(
                    "cannot specify replicaSet with loadBalanced=true",
                ));
            }
            if self.direct_connection == Some(true) {
                return Err(Error::invalid_argument(
                    "cannot specify directConnection=true with loadBalanced=true",
                ));
            }
        }

        if self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY) < self.min_heartbeat_freq() {
            return Err(Error::invalid_argument(format!(
                "heartbeat_freq must be at least {}ms",
                self.min_heartbeat_freq().as_millis()
            )));
        }

        if self.rtt_window_size == Some(0) {
            return Err(Error::invalid_argument("rtt_window_size must be greater than 0"));
        }

        Ok(())
    }

    pub(crate) fn load_balanced(&self) -> bool {
        self.load_balanced == Some(true)
    }

    pub(crate) fn heartbeat_freq(&self) -> Duration {
        self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    pub(crate) fn min_heartbeat_freq(&self) -> Duration {
        self.min_heartbeat_freq.unwrap_or(MIN_HEARTBEAT_FREQUENCY)
    }

    pub(crate) fn server_selection_timeout(&self) -> Duration {
        self.server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT)
    }

    /// The connect timeout, with zero meaning "no timeout".
    pub(crate) fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout {
            Some(timeout) if timeout.is_zero() => None,
            Some(timeout) => Some(timeout),
            None => Some(DEFAULT_CONNECT_TIMEOUT),
        }
    }

    pub(crate) fn rtt_window_size(&self) -> usize {
        self.rtt_window_size.unwrap_or(DEFAULT_RTT_WINDOW_SIZE)
    }

    #[cfg(test)]
    pub(crate) fn with_test_frequencies(
        mut self,
        min_heartbeat_freq: Duration,
        maintenance_frequency: Duration,
    ) -> Self {
        self.min_heartbeat_freq = Some(min_heartbeat_freq);
        self.maintenance_frequency = Some(maintenance_frequency);
        self
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_address() {
        let address = ServerAddress::parse("Example.COM:27018").unwrap();
        assert_eq!(address.host(), "example.com");
        assert_eq!(address.port(), Some(27018));
        assert_eq!(address.to_string(), "example.com:27018");

        assert_eq!(
            ServerAddress::parse("localhost").unwrap(),
            ServerAddress::parse("localhost:27017").unwrap()
        );

        assert!(ServerAddress::parse("").is_err());
        assert!(ServerAddress::parse("a:0").is_err());
        assert!(ServerAddress::parse("a:b").is_err());
        assert!(ServerAddress::parse("a:1:2").is_err());
    }

    #[test]
    fn validate_rejects_inconsistent_options() {
        let a = ServerAddress::parse("a").unwrap();
        let b = ServerAddress::parse("b").unwrap();

        let options = TopologyOptions::builder()
            .hosts(vec![a.clone(), b.clone()])
            .load_balanced(true)
            .build();
        assert!(options.validate().is_err());

        let options = TopologyOptions::builder()
            .hosts(vec![a.clone()])
            .load_balanced(true)
            .repl_set_name("rs0".to_string())
            .build();
        assert!(options.validate().is_err());

        let options = TopologyOptions::builder()
            .hosts(vec![a.clone(), b])
            .direct_connection(true)
            .build();
        assert!(options.validate().is_err());

        let options = TopologyOptions::builder()
            .hosts(vec![a.clone()])
            .min_pool_size(5)
            .max_pool_size(2)
            .build();
        assert!(options.validate().is_err());

        let options = TopologyOptions::builder()
            .hosts(vec![a.clone()])
            .max_connecting(0)
            .build();
        assert!(options.validate().is_err());

        let options = TopologyOptions::builder()
            .hosts(vec![a.clone()])
            .heartbeat_freq(Duration::from_millis(10))
            .build();
        assert!(options.validate().is_err());

        let options = TopologyOptions::builder().hosts(vec![a]).build();
        assert!(options.validate().is_ok());
    }

    #[test]
    fn zero_connect_timeout_disables_timeout() {
        let options = TopologyOptions::builder()
            .connect_timeout(Duration::ZERO)
            .build();
        assert_eq!(options.connect_timeout(), None);
        assert_eq!(
            TopologyOptions::default().connect_timeout(),
            Some(DEFAULT_CONNECT_TIMEOUT)
        );
    }
}
