use std::{collections::HashSet, time::Duration};

use pretty_assertions::assert_eq;

use crate::{
    bson::{doc, oid::ObjectId, Document, Timestamp},
    error::Error,
    hello::parse_hello_reply,
    options::{ServerAddress, TopologyOptions},
    sdam::{
        description::{server::ServerDescription, topology::TopologyDescription},
        ServerType,
        SessionSupportStatus,
        TopologyType,
        TopologyVersion,
        TransactionSupportStatus,
    },
    session::ClusterTime,
};

pub(crate) fn address(host: &str) -> ServerAddress {
    ServerAddress::parse(host).unwrap()
}

/// A description built from a hello reply that extends a healthy modern server's reply with
/// `fields`.
pub(crate) fn described(host: &str, rtt_ms: u64, fields: Document) -> ServerDescription {
    let mut reply = doc! {
        "ok": 1,
        "maxWireVersion": 21,
        "minWireVersion": 0,
        "logicalSessionTimeoutMinutes": 30_i64,
    };
    reply.extend(fields);
    let address = address(host);
    let reply = parse_hello_reply(address.clone(), reply).unwrap();
    ServerDescription::new_from_hello_reply(address, reply, Duration::from_millis(rtt_ms), None)
}

pub(crate) fn primary(host: &str, set_name: &str, hosts: &[&str]) -> ServerDescription {
    described(
        host,
        10,
        doc! { "isWritablePrimary": true, "setName": set_name, "hosts": hosts.to_vec() },
    )
}

pub(crate) fn secondary(host: &str, set_name: &str, hosts: &[&str]) -> ServerDescription {
    described(
        host,
        10,
        doc! {
            "isWritablePrimary": false,
            "secondary": true,
            "setName": set_name,
            "hosts": hosts.to_vec(),
        },
    )
}

pub(crate) fn topology(hosts: &[&str]) -> TopologyDescription {
    let options = TopologyOptions::builder()
        .hosts(hosts.iter().map(|h| address(h)).collect::<Vec<_>>())
        .build();
    TopologyDescription::new(&options)
}

fn oid(n: u8) -> ObjectId {
    let mut bytes = [0; 12];
    bytes[11] = n;
    ObjectId::from_bytes(bytes)
}

fn server_type(description: &TopologyDescription, host: &str) -> Option<ServerType> {
    description
        .servers
        .get(&address(host))
        .map(|sd| sd.server_type)
}

fn hosts(description: &TopologyDescription) -> HashSet<String> {
    description
        .servers
        .keys()
        .map(|address| address.to_string())
        .collect()
}

#[test]
fn initial_type_follows_options() {
    assert_eq!(topology(&["a:27017"]).topology_type, TopologyType::Unknown);

    let direct = TopologyOptions::builder()
        .hosts(vec![address("a:27017")])
        .direct_connection(true)
        .build();
    assert_eq!(
        TopologyDescription::new(&direct).topology_type,
        TopologyType::Single
    );

    let replica_set = TopologyOptions::builder()
        .hosts(vec![address("a:27017")])
        .repl_set_name("rs0".to_string())
        .build();
    assert_eq!(
        TopologyDescription::new(&replica_set).topology_type,
        TopologyType::ReplicaSetNoPrimary
    );

    let load_balanced = TopologyOptions::builder()
        .hosts(vec![address("a:27017")])
        .load_balanced(true)
        .build();
    let description = TopologyDescription::new(&load_balanced);
    assert_eq!(description.topology_type, TopologyType::LoadBalanced);
    assert_eq!(
        description.transaction_support_status(),
        TransactionSupportStatus::Supported
    );
}

#[test]
fn single_seed_standalone_becomes_single() {
    let mut description = topology(&["a:27017"]);
    description
        .update(described("a:27017", 5, doc! { "isWritablePrimary": true }))
        .unwrap();

    assert_eq!(description.topology_type, TopologyType::Single);
    assert_eq!(server_type(&description, "a:27017"), Some(ServerType::Standalone));
}

#[test]
fn standalone_among_several_seeds_is_removed() {
    let mut description = topology(&["a:27017", "b:27017"]);
    description
        .update(described("a:27017", 5, doc! { "isWritablePrimary": true }))
        .unwrap();

    assert_eq!(description.topology_type, TopologyType::Unknown);
    assert_eq!(hosts(&description), HashSet::from(["b:27017".to_string()]));
}

#[test]
fn mongos_makes_topology_sharded_and_evicts_others() {
    let mut description = topology(&["a:27017", "b:27017"]);
    description
        .update(described("a:27017", 5, doc! { "msg": "isdbgrid" }))
        .unwrap();
    assert_eq!(description.topology_type, TopologyType::Sharded);

    description
        .update(secondary("b:27017", "rs0", &["b:27017"]))
        .unwrap();
    assert_eq!(hosts(&description), HashSet::from(["a:27017".to_string()]));
}

#[test]
fn primary_discovers_replica_set_members() {
    let mut description = topology(&["a:27017"]);
    description
        .update(primary("a:27017", "rs0", &["a:27017", "b:27017", "c:27017"]))
        .unwrap();

    assert_eq!(description.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(description.set_name(), Some("rs0"));
    assert_eq!(
        hosts(&description),
        HashSet::from([
            "a:27017".to_string(),
            "b:27017".to_string(),
            "c:27017".to_string()
        ])
    );
    assert_eq!(server_type(&description, "b:27017"), Some(ServerType::Unknown));
}

#[test]
fn three_node_replica_set_converges() {
    let members = ["a:27017", "b:27017", "c:27017"];
    let mut description = topology(&["b:27017"]);

    description
        .update(secondary("b:27017", "rs0", &members))
        .unwrap();
    assert_eq!(description.topology_type, TopologyType::ReplicaSetNoPrimary);
    assert_eq!(description.servers.len(), 3);

    let mut first_primary = primary("a:27017", "rs0", &members);
    set_election(&mut first_primary, oid(1), 1);
    description.update(first_primary).unwrap();
    description
        .update(secondary("c:27017", "rs0", &members))
        .unwrap();

    assert_eq!(description.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(server_type(&description, "a:27017"), Some(ServerType::RsPrimary));
    assert_eq!(server_type(&description, "b:27017"), Some(ServerType::RsSecondary));
    assert_eq!(server_type(&description, "c:27017"), Some(ServerType::RsSecondary));

    // Losing the primary drops the set back to having no primary.
    description
        .update(ServerDescription::new_from_error(
            address("a:27017"),
            std::io::ErrorKind::ConnectionReset.into(),
        ))
        .unwrap();
    assert_eq!(description.topology_type, TopologyType::ReplicaSetNoPrimary);
    assert_eq!(server_type(&description, "a:27017"), Some(ServerType::Unknown));

    // B wins the next election.
    let mut second_primary = primary("b:27017", "rs0", &members);
    set_election(&mut second_primary, oid(2), 1);
    description.update(second_primary).unwrap();
    assert_eq!(description.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(server_type(&description, "b:27017"), Some(ServerType::RsPrimary));
    assert_eq!(description.max_election_id, Some(oid(2)));

    // A still believes it is primary under the old election when the partition heals.
    let mut partitioned = primary("a:27017", "rs0", &members);
    set_election(&mut partitioned, oid(1), 1);
    description.update(partitioned).unwrap();
    assert_eq!(server_type(&description, "a:27017"), Some(ServerType::Unknown));
    assert_eq!(server_type(&description, "b:27017"), Some(ServerType::RsPrimary));

    // Then it steps down and rejoins as a secondary.
    description
        .update(secondary("a:27017", "rs0", &members))
        .unwrap();
    assert_eq!(description.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(server_type(&description, "a:27017"), Some(ServerType::RsSecondary));
    assert_eq!(server_type(&description, "b:27017"), Some(ServerType::RsPrimary));
    assert_eq!(server_type(&description, "c:27017"), Some(ServerType::RsSecondary));
    assert_eq!(description.servers.len(), 3);
}

#[test]
fn primary_removes_members_it_does_not_list() {
    let mut description = topology(&["a:27017", "b:27017", "stale:27017"]);
    description
        .update(primary("a:27017", "rs0", &["a:27017", "b:27017"]))
        .unwrap();

    assert_eq!(
        hosts(&description),
        HashSet::from(["a:27017".to_string(), "b:27017".to_string()])
    );
}

#[test]
fn member_of_another_set_is_removed() {
    let mut description = topology(&["a:27017", "b:27017"]);
    description
        .update(primary("a:27017", "rs0", &["a:27017", "b:27017"]))
        .unwrap();
    description
        .update(secondary("b:27017", "other", &["b:27017"]))
        .unwrap();

    assert_eq!(hosts(&description), HashSet::from(["a:27017".to_string()]));
    assert_eq!(description.topology_type, TopologyType::ReplicaSetWithPrimary);
}

#[test]
fn primary_with_older_election_is_stale() {
    let members = ["a:27017", "b:27017"];
    let mut description = topology(&members);

    let mut current = primary("a:27017", "rs0", &members);
    set_election(&mut current, oid(2), 1);
    description.update(current).unwrap();

    let mut stale = primary("b:27017", "rs0", &members);
    set_election(&mut stale, oid(1), 1);
    description.update(stale).unwrap();

    assert_eq!(server_type(&description, "a:27017"), Some(ServerType::RsPrimary));
    assert_eq!(server_type(&description, "b:27017"), Some(ServerType::Unknown));
    assert_eq!(description.max_election_id, Some(oid(2)));
}

#[test]
fn newer_primary_demotes_old_one() {
    let members = ["a:27017", "b:27017"];
    let mut description = topology(&members);

    let mut old = primary("a:27017", "rs0", &members);
    set_election(&mut old, oid(1), 1);
    description.update(old).unwrap();

    let mut new = primary("b:27017", "rs0", &members);
    set_election(&mut new, oid(2), 1);
    description.update(new).unwrap();

    assert_eq!(server_type(&description, "a:27017"), Some(ServerType::Unknown));
    assert_eq!(server_type(&description, "b:27017"), Some(ServerType::RsPrimary));
    assert_eq!(description.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(description.max_election_id, Some(oid(2)));
    assert_eq!(description.max_set_version, Some(1));
}

fn set_election(description: &mut ServerDescription, election_id: ObjectId, set_version: i32) {
    if let Ok(Some(ref mut reply)) = description.reply {
        reply.command_response.election_id = Some(election_id);
        reply.command_response.set_version = Some(set_version);
    }
}

#[test]
fn outdated_topology_version_is_ignored() {
    let process_id = ObjectId::new();
    let mut description = topology(&["a:27017"]);

    let with_counter = |counter: i64, server_type: &str| {
        let mut fields = doc! {
            "topologyVersion": { "processId": process_id, "counter": counter },
        };
        if server_type == "secondary" {
            fields.extend(doc! {
                "isWritablePrimary": false,
                "secondary": true,
                "setName": "rs0",
                "hosts": ["a:27017"],
            });
        } else {
            fields.extend(doc! {
                "isWritablePrimary": true,
                "setName": "rs0",
                "hosts": ["a:27017"],
            });
        }
        described("a:27017", 5, fields)
    };

    description.update(with_counter(2, "primary")).unwrap();
    description.update(with_counter(1, "secondary")).unwrap();

    assert_eq!(server_type(&description, "a:27017"), Some(ServerType::RsPrimary));
    assert_eq!(
        description.servers[&address("a:27017")].topology_version(),
        Some(TopologyVersion {
            process_id,
            counter: 2
        })
    );
}

#[test]
fn update_for_unknown_address_is_ignored() {
    let mut description = topology(&["a:27017"]);
    description
        .update(described("zzz:27017", 5, doc! { "isWritablePrimary": true }))
        .unwrap();
    assert_eq!(hosts(&description), HashSet::from(["a:27017".to_string()]));
}

#[test]
fn logical_session_timeout_is_minimum_over_data_bearing_servers() {
    let members = ["a:27017", "b:27017"];
    let mut description = topology(&members);
    assert_eq!(
        description.session_support_status(),
        SessionSupportStatus::Undetermined
    );

    description.update(primary("a:27017", "rs0", &members)).unwrap();
    let mut short = secondary("b:27017", "rs0", &members);
    if let Ok(Some(ref mut reply)) = short.reply {
        reply.command_response.logical_session_timeout_minutes = Some(10);
    }
    description.update(short).unwrap();

    assert_eq!(
        description.logical_session_timeout(),
        Some(Duration::from_secs(600))
    );
    assert_eq!(
        description.session_support_status(),
        SessionSupportStatus::Supported {
            logical_session_timeout: Some(Duration::from_secs(600))
        }
    );
    assert_eq!(
        description.transaction_support_status(),
        TransactionSupportStatus::Supported
    );

    let mut unsupported = secondary("b:27017", "rs0", &members);
    if let Ok(Some(ref mut reply)) = unsupported.reply {
        reply.command_response.logical_session_timeout_minutes = None;
    }
    description.update(unsupported).unwrap();
    assert_eq!(description.logical_session_timeout(), None);
    assert_eq!(
        description.session_support_status(),
        SessionSupportStatus::Unsupported
    );
    assert_eq!(
        description.transaction_support_status(),
        TransactionSupportStatus::Unsupported
    );
}

#[test]
fn out_of_range_session_timeout_means_no_session_support() {
    for minutes in [-1_i64, i64::MAX] {
        let mut description = topology(&["a:27017"]);
        description
            .update(described(
                "a:27017",
                5,
                doc! { "isWritablePrimary": true, "logicalSessionTimeoutMinutes": minutes },
            ))
            .unwrap();

        assert_eq!(server_type(&description, "a:27017"), Some(ServerType::Standalone));
        assert_eq!(description.logical_session_timeout(), None);
        assert_eq!(
            description.session_support_status(),
            SessionSupportStatus::Unsupported
        );
    }
}

#[test]
fn incompatible_wire_version_is_reported() {
    let mut description = topology(&["a:27017"]);
    description
        .update(described(
            "a:27017",
            5,
            doc! { "isWritablePrimary": true, "maxWireVersion": 2 },
        ))
        .unwrap();

    let message = description.compatibility_error().expect("should be incompatible");
    assert!(message.contains("a:27017"), "{message}");
}

#[test]
fn cluster_time_only_advances() {
    let mut description = topology(&["a:27017"]);
    description.advance_cluster_time(&ClusterTime::new(Timestamp {
        time: 10,
        increment: 1,
    }));
    description.advance_cluster_time(&ClusterTime::new(Timestamp {
        time: 5,
        increment: 1,
    }));
    assert_eq!(
        description.cluster_time().map(|ct| ct.cluster_time),
        Some(Timestamp {
            time: 10,
            increment: 1
        })
    );

    description
        .update(described(
            "a:27017",
            5,
            doc! {
                "isWritablePrimary": true,
                "$clusterTime": {
                    "clusterTime": Timestamp { time: 20, increment: 0 },
                    "signature": {},
                },
            },
        ))
        .unwrap();
    assert_eq!(
        description.cluster_time().map(|ct| ct.cluster_time),
        Some(Timestamp {
            time: 20,
            increment: 0
        })
    );
}

#[test]
fn mismatched_set_name_on_direct_connection_becomes_error() {
    let options = TopologyOptions::builder()
        .hosts(vec![address("a:27017")])
        .direct_connection(true)
        .repl_set_name("expected".to_string())
        .build();
    let mut description = TopologyDescription::new(&options);
    description
        .update(primary("a:27017", "actual", &["a:27017"]))
        .unwrap();

    let server = &description.servers[&address("a:27017")];
    assert_eq!(server.server_type, ServerType::Unknown);
    let error: &Error = server.error().expect("should carry an error");
    assert!(error.to_string().contains("expected"), "{error}");
}

#[test]
fn diff_reports_added_removed_and_changed() {
    let before = topology(&["a:27017", "gone:27017"]);
    let mut after = before.clone();
    after
        .update(primary("a:27017", "rs0", &["a:27017", "new:27017"]))
        .unwrap();

    let diff = before.diff(&after).expect("descriptions differ");
    assert_eq!(
        diff.added_addresses,
        HashSet::from([&address("new:27017")])
    );
    assert_eq!(
        diff.removed_addresses,
        HashSet::from([&address("gone:27017")])
    );
    assert_eq!(
        diff.changed_servers.keys().collect::<Vec<_>>(),
        vec![&&address("a:27017")]
    );

    assert!(after.diff(&after.clone()).is_none());
}

#[test]
fn sync_hosts_replaces_server_set() {
    let mut description = topology(&["a:27017", "b:27017"]);
    description.sync_hosts(HashSet::from([address("b:27017"), address("c:27017")]));
    assert_eq!(
        hosts(&description),
        HashSet::from(["b:27017".to_string(), "c:27017".to_string()])
    );
}

#[test]
fn common_wire_version_considers_available_servers() {
    let members = ["a:27017", "b:27017"];
    let mut description = topology(&members);
    assert_eq!(description.common_wire_version(), None);

    description.update(primary("a:27017", "rs0", &members)).unwrap();
    let mut older = secondary("b:27017", "rs0", &members);
    if let Ok(Some(ref mut reply)) = older.reply {
        reply.command_response.max_wire_version = Some(17);
    }
    description.update(older).unwrap();
    assert_eq!(description.common_wire_version(), Some(17));
}
