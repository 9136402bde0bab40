
use std::{collections::HashMap, fmt, ops::Deref, sync::Arc, time::Duration};

use super::TopologyDescription;
use crate::{
    error::{Error, Result},
    options::ServerAddress,
    sdam::{
        description::{
            server::{ServerDescription, ServerType},
            topology::TopologyType,
        },
        Server,
        ServerInfo,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

pub(crate) const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

/// Struct encapsulating a selected server that handles the opcount accounting.
#[derive(Debug)]
pub struct SelectedServer {
    server: Arc<Server>,
}

impl SelectedServer {
    fn new(server: Arc<Server>) -> Self {
        server.increment_operation_count();
        Self { server }
    }

    /// The address of the selected server.
    pub fn address(&self) -> &ServerAddress {
        &self.server.address
    }
}

impl Deref for SelectedServer {
    type Target = Server;

    fn deref(&self) -> &Server {
        self.server.deref()
    }
}

impl Drop for SelectedServer {
    fn drop(&mut self) {
        self.server.decrement_operation_count();
    }
}

/// Attempt to select a server, returning None if no server could be selected
/// that matched the provided criteria.
pub(crate) fn attempt_to_select_server<'a>(
    criteria: &'a SelectionCriteria,
    topology_description: &'a TopologyDescription,
    servers: &'a HashMap<ServerAddress, Arc<Server>>,
    deprioritized: &[&ServerAddress],
) -> Result<Option<SelectedServer>> {
    let in_window =
        topology_description.suitable_servers_in_latency_window(criteria, deprioritized)?;
    let in_window_servers = in_window
        .into_iter()
        .flat_map(|description| servers.get(&description.address))
        .collect::<Vec<_>>();

    Ok(select_server_in_latency_window(in_window_servers).map(SelectedServer::new))
}

/// Choose a server from several suitable choices within the latency window: two are picked at
/// random and the one with fewer operations in flight wins.
fn select_server_in_latency_window(in_window: Vec<&Arc<Server>>) -> Option<Arc<Server>> {
    if in_window.len() < 2 {
        return in_window.first().map(|server| (*server).clone());
    }

    super::choose_n(&in_window, 2)
        .min_by_key(|s| s.operation_count())
        .map(|server| (*server).clone())
}

impl TopologyDescription {
    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if self.has_available_servers() {
            format!(
                "Server selection timeout: None of the available servers suitable for criteria \
                 {criteria:?}. Topology: {self}"
            )
        } else {
            format!("Server selection timeout: No available servers. Topology: {self}")
        }
    }

    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(|server| server.is_available())
    }

    pub(crate) fn is_replica_set(&self) -> bool {
        matches!(
            self.topology_type,
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary
        )
    }

    /// The servers eligible for an operation with the given criteria, after the latency window
    /// has been applied. Deprioritized servers are only considered when nothing else qualifies.
    pub(crate) fn suitable_servers_in_latency_window<'a>(
        &'a self,
        criteria: &SelectionCriteria,
        deprioritized: &[&ServerAddress],
    ) -> Result<Vec<&'a ServerDescription>> {
        if let Some(message) = self.compatibility_error() {
            return Err(Error::server_selection(message.clone(), Some(self.clone())));
        }
        if self.is_replica_set() {
            if let Some(max_staleness) = criteria.as_read_pref().and_then(|rp| rp.max_staleness())
            {
                super::verify_max_staleness(max_staleness, self.heartbeat_frequency())?;
            }
        }

        let mut suitable = self.suitable_servers(
            criteria,
            self.servers
                .iter()
                .filter(|(address, _)| !deprioritized.contains(address))
                .map(|(_, description)| description)
                .collect(),
        );
        if suitable.is_empty() && !deprioritized.is_empty() {
            suitable = self.suitable_servers(criteria, self.servers.values().collect());
        }
        self.retain_servers_within_latency_window(&mut suitable);

        Ok(suitable)
    }

    fn suitable_servers<'a>(
        &self,
        criteria: &SelectionCriteria,
        candidates: Vec<&'a ServerDescription>,
    ) -> Vec<&'a ServerDescription> {
        match criteria {
            SelectionCriteria::ReadPreference(read_preference) => match self.topology_type {
                TopologyType::Unknown => Vec::new(),
                TopologyType::Single | TopologyType::LoadBalanced => candidates,
                TopologyType::Sharded => of_types(&candidates, &[ServerType::Mongos]),
                TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                    self.suitable_replica_set_members(&candidates, read_preference)
                }
            },
            SelectionCriteria::Predicate(predicate) => candidates
                .into_iter()
                .filter(|sd| {
                    // A directly connected server is eligible whatever its type.
                    (self.topology_type == TopologyType::Single || sd.server_type.is_data_bearing())
                        && predicate(&ServerInfo::new_borrowed(sd))
                })
                .collect(),
        }
    }

    fn suitable_replica_set_members<'a>(
        &self,
        candidates: &[&'a ServerDescription],
        read_preference: &ReadPreference,
    ) -> Vec<&'a ServerDescription> {
        let primary = || of_types(candidates, &[ServerType::RsPrimary]);
        let secondaries = || {
            self.narrow_by_read_preference(
                of_types(candidates, &[ServerType::RsSecondary]),
                read_preference,
            )
        };

        match read_preference {
            ReadPreference::Primary => primary(),
            ReadPreference::Secondary { .. } => secondaries(),
            ReadPreference::PrimaryPreferred { .. } => {
                let primary = primary();
                if primary.is_empty() {
                    secondaries()
                } else {
                    primary
                }
            }
            ReadPreference::SecondaryPreferred { .. } => {
                let secondaries = secondaries();
                if secondaries.is_empty() {
                    primary()
                } else {
                    secondaries
                }
            }
            ReadPreference::Nearest { .. } => self.narrow_by_read_preference(
                of_types(candidates, &[ServerType::RsPrimary, ServerType::RsSecondary]),
                read_preference,
            ),
        }
    }

    /// Apply the staleness bound and then the tag sets of `read_preference`.
    fn narrow_by_read_preference<'a>(
        &self,
        mut servers: Vec<&'a ServerDescription>,
        read_preference: &ReadPreference,
    ) -> Vec<&'a ServerDescription> {
        // A zero max staleness is the same as none at all.
        if let Some(max_staleness) = read_preference.max_staleness().filter(|s| !s.is_zero()) {
            self.retain_fresh_servers(&mut servers, max_staleness);
        }
        if let Some(tag_sets) = read_preference.tag_sets() {
            filter_servers_by_tag_sets(&mut servers, tag_sets);
        }
        servers
    }

    /// Keep the servers whose estimated replication lag is within `max_staleness`. Lag is
    /// measured against the primary when there is one and against the most recently written
    /// secondary otherwise.
    fn retain_fresh_servers(&self, servers: &mut Vec<&ServerDescription>, max_staleness: Duration) {
        let max_staleness = millis(max_staleness);
        let heartbeat = millis(self.heartbeat_frequency());
        let write_lag = |sd: &ServerDescription| {
            let updated = sd.last_update_time?.timestamp_millis();
            let written = sd.last_write_date()?.timestamp_millis();
            Some(updated.saturating_sub(written))
        };

        match self.primary() {
            Some(primary) => {
                let primary_lag = write_lag(primary);
                servers.retain(|sd| match (write_lag(*sd), primary_lag) {
                    (Some(lag), Some(primary_lag)) => {
                        lag.saturating_sub(primary_lag).saturating_add(heartbeat) <= max_staleness
                    }
                    _ => false,
                });
            }
            None => {
                let freshest = self
                    .servers
                    .values()
                    .filter(|sd| sd.server_type == ServerType::RsSecondary)
                    .filter_map(|sd| sd.last_write_date())
                    .map(|date| date.timestamp_millis())
                    .max();
                let Some(freshest) = freshest else {
                    return;
                };
                servers.retain(|sd| {
                    sd.last_write_date().is_some_and(|date| {
                        freshest
                            .saturating_sub(date.timestamp_millis())
                            .saturating_add(heartbeat)
                            <= max_staleness
                    })
                });
            }
        }
    }

    fn retain_servers_within_latency_window(&self, suitable_servers: &mut Vec<&ServerDescription>) {
        let local_threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);
        let window_end = suitable_servers
            .iter()
            .filter_map(|sd| sd.average_round_trip_time)
            .min()
            .map(|fastest| fastest.checked_add(local_threshold).unwrap_or(Duration::MAX));

        suitable_servers.retain(|sd| match (sd.average_round_trip_time, window_end) {
            (Some(rtt), Some(window_end)) => rtt <= window_end,
            // The load balancer is never monitored, so it has no RTT to compare.
            _ => sd.server_type == ServerType::LoadBalancer,
        });
    }

    fn primary(&self) -> Option<&ServerDescription> {
        self.servers
            .values()
            .find(|sd| sd.server_type == ServerType::RsPrimary)
    }
}

fn of_types<'a>(
    servers: &[&'a ServerDescription],
    types: &[ServerType],
) -> Vec<&'a ServerDescription> {
    servers
        .iter()
        .copied()
        .filter(|sd| types.contains(&sd.server_type))
        .collect()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        write!(f, "{{ Type: {}", self.topology_type)?;

        if let Some(ref set_name) = self.set_name {
            write!(f, ", Set Name: {set_name}")?;
        }

        if let Some(max_set_version) = self.max_set_version {
            write!(f, ", Max Set Version: {max_set_version}")?;
        }

        if let Some(max_election_id) = self.max_election_id {
            write!(f, ", Max Election ID: {max_election_id}")?;
        }

        if let Some(ref compatibility_error) = self.compatibility_error {
            write!(f, ", Compatibility Error: {compatibility_error}")?;
        }

        if !self.servers.is_empty() {
            write!(f, ", Servers: [ ")?;
            let mut iter = self.servers.values();
            if let Some(server) = iter.next() {
                write!(f, "{}", ServerInfo::new_borrowed(server))?;
            }
            for server in iter {
                write!(f, ", {}", ServerInfo::new_borrowed(server))?;
            }
            write!(f, " ]")?;
        }

        write!(f, " }}")
    }
}

/// Narrow `servers` to those matching the first tag set any of them matches. If no tag set
/// matches, nothing is eligible.
fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    match tag_sets
        .iter()
        .find(|tag_set| servers.iter().any(|sd| sd.matches_tag_set(tag_set)))
    {
        Some(tag_set) => servers.retain(|sd| sd.matches_tag_set(tag_set)),
        None => servers.clear(),
    }
}
