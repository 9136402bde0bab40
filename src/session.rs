//! Logical sessions and the cluster time they gossip.

use derive_where::derive_where;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    bson::{Document, Timestamp},
    options::ServerAddress,
};

/// Struct modeling a cluster time reported by the server.
///
/// See the MongoDB documentation on
/// [causal consistency](https://www.mongodb.com/docs/manual/core/read-isolation-consistency-recency/)
/// for more information.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[derive_where(PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    /// The logical time of the cluster.
    pub cluster_time: Timestamp,

    #[derive_where(skip)]
    #[serde(default)]
    pub(crate) signature: Document,
}

impl ClusterTime {
    /// A cluster time with an empty signature.
    pub fn new(cluster_time: Timestamp) -> Self {
        Self {
            cluster_time,
            signature: Document::new(),
        }
    }
}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &ClusterTime) -> std::cmp::Ordering {
        self.cluster_time.cmp(&other.cluster_time)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Replace `current` with `candidate` if the candidate is newer. Never moves backwards.
pub(crate) fn advance<T: Ord + Clone>(current: &mut Option<T>, candidate: &T) {
    if current.as_ref().map(|c| c < candidate).unwrap_or(true) {
        *current = Some(candidate.clone());
    }
}

/// Client-side state for one logical session.
///
/// A session tracks the highest cluster time and operation time it has observed so that reads
/// issued through it are causally consistent with its earlier writes. A session in a
/// transaction against a sharded cluster may also be pinned to one mongos, in which case server
/// selection routes all of its operations to that server.
#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    pinned_address: Option<ServerAddress>,
    causal_consistency: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Session {
    /// Starts a new session.
    pub fn new(causal_consistency: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster_time: None,
            operation_time: None,
            pinned_address: None,
            causal_consistency,
        }
    }

    /// The id of this session.
    pub fn id(&self) -> &Uuid {
        &self.id
    }

    /// Whether reads in this session observe this session's earlier writes.
    pub fn causal_consistency(&self) -> bool {
        self.causal_consistency
    }

    /// The highest cluster time this session has seen.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// Advance the cluster time. Lower values than the one already held are ignored.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        advance(&mut self.cluster_time, to);
    }

    /// The operation time of the most recent operation run in this session.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Advance the operation time. Lower values than the one already held are ignored.
    pub fn advance_operation_time(&mut self, ts: Timestamp) {
        advance(&mut self.operation_time, &ts);
    }

    /// The server this session's operations are pinned to, if any.
    pub fn pinned_address(&self) -> Option<&ServerAddress> {
        self.pinned_address.as_ref()
    }

    /// Pin this session's operations to the given server.
    pub fn pin(&mut self, address: ServerAddress) {
        self.pinned_address = Some(address);
    }

    /// Remove any server pin.
    pub fn unpin(&mut self) {
        self.pinned_address = None;
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn ts(time: u32) -> Timestamp {
        Timestamp { time, increment: 0 }
    }

    #[test]
    fn session_times_are_monotonic() {
        let mut session = Session::default();
        session.advance_cluster_time(&ClusterTime::new(ts(5)));
        session.advance_cluster_time(&ClusterTime::new(ts(3)));
        assert_eq!(session.cluster_time().map(|c| c.cluster_time), Some(ts(5)));

        session.advance_operation_time(ts(7));
        session.advance_operation_time(ts(2));
        assert_eq!(session.operation_time(), Some(ts(7)));

        session.advance_cluster_time(&ClusterTime::new(ts(9)));
        assert_eq!(session.cluster_time().map(|c| c.cluster_time), Some(ts(9)));
    }

    #[test]
    fn cluster_time_equality_ignores_signature() {
        let mut signed = ClusterTime::new(ts(1));
        signed.signature = crate::bson::doc! { "hash": 1 };
        assert_eq!(signed, ClusterTime::new(ts(1)));
    }

    #[test]
    fn pinning() {
        let mut session = Session::new(false);
        assert!(!session.causal_consistency());
        let address = ServerAddress::parse("mongos-1").unwrap();
        session.pin(address.clone());
        assert_eq!(session.pinned_address(), Some(&address));
        session.unpin();
        assert_eq!(session.pinned_address(), None);
    }
}
