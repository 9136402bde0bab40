use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use pretty_assertions::assert_eq;

use super::{establish::ConnectionEstablisher, options::ConnectionPoolOptions, ConnectionPool};
use crate::{
    bson::oid::ObjectId,
    error::{Error, ErrorKind},
    event::cmap::{CmapEvent, ConnectionCheckoutFailedReason, ConnectionClosedReason},
    options::{ServerAddress, TopologyOptions},
    runtime,
    sdam::TopologyUpdater,
    test::{EventBuffer, MockConnector, MockServer, EVENT_TIMEOUT},
    timeout::TimeoutContext,
};

const ADDRESS: &str = "pool-test:27017";

struct PoolFixture {
    pool: ConnectionPool,
    connector: MockConnector,
    events: EventBuffer<CmapEvent>,
}

fn pool_with(
    server: MockServer,
    configure: impl FnOnce(&mut ConnectionPoolOptions),
) -> PoolFixture {
    let connector = MockConnector::new().with_server(ADDRESS, server);
    let events = EventBuffer::<CmapEvent>::new();

    let topology_options = TopologyOptions::default();
    let mut options = ConnectionPoolOptions::from_topology_options(&topology_options);
    options.cmap_event_handler = Some(events.handler());
    options.ready = true;
    configure(&mut options);

    let establisher =
        ConnectionEstablisher::new(Arc::new(connector.clone()), &topology_options);
    // Nothing drives the topology in these tests, so establishment errors go nowhere.
    let (updater, _) = TopologyUpdater::channel();

    let pool = ConnectionPool::new(
        ServerAddress::parse(ADDRESS).unwrap(),
        establisher,
        updater,
        ObjectId::new(),
        options,
    );
    PoolFixture {
        pool,
        connector,
        events,
    }
}

fn ready_pool() -> PoolFixture {
    pool_with(MockServer::standalone(), |_| {})
}

fn short_wait() -> TimeoutContext {
    TimeoutContext::legacy(
        Duration::from_secs(30),
        Some(Duration::from_millis(100)),
        None,
        None,
    )
}

fn no_wait_limit() -> TimeoutContext {
    TimeoutContext::legacy(Duration::from_secs(30), None, None, None)
}

#[tokio::test]
async fn checked_in_connection_is_reused() {
    let PoolFixture {
        pool,
        connector,
        events,
    } = ready_pool();

    let conn = pool.check_out(&no_wait_limit(), None).await.unwrap();
    let first_id = conn.info().id;
    drop(conn);

    let mut stream = events.stream_all();
    stream
        .next_match(EVENT_TIMEOUT, |e| matches!(e, CmapEvent::ConnectionCheckedIn(_)))
        .await
        .expect("connection should be checked in");

    let conn = pool.check_out(&no_wait_limit(), None).await.unwrap();
    assert_eq!(conn.info().id, first_id);
    assert_eq!(connector.dial_count(), 1);
}

#[tokio::test]
async fn send_message_round_trips_through_transport() {
    let PoolFixture { pool, .. } = ready_pool();

    let mut conn = pool.check_out(&no_wait_limit(), None).await.unwrap();
    let reply = conn
        .send_message(b"ping", &no_wait_limit())
        .await
        .unwrap();
    assert_eq!(reply, b"ping".to_vec());
}

#[tokio::test]
async fn checkout_times_out_when_pool_is_full() {
    let PoolFixture { pool, events, .. } = pool_with(MockServer::standalone(), |options| {
        options.max_pool_size = Some(1);
    });

    let _held = pool.check_out(&no_wait_limit(), None).await.unwrap();
    let error = pool.check_out(&short_wait(), None).await.unwrap_err();
    assert!(
        matches!(*error.kind, ErrorKind::WaitQueueTimeout { .. }),
        "unexpected error: {error}"
    );

    let failed: Vec<_> = events.filter_map(|e| match e {
        CmapEvent::ConnectionCheckoutFailed(e) => Some(e.reason),
        _ => None,
    });
    assert_eq!(failed, vec![ConnectionCheckoutFailedReason::Timeout]);
}

#[tokio::test]
async fn zero_max_pool_size_is_unbounded() {
    let PoolFixture { pool, .. } = pool_with(MockServer::standalone(), |options| {
        options.max_pool_size = Some(0);
    });

    let mut held = Vec::new();
    for _ in 0..15 {
        held.push(pool.check_out(&short_wait(), None).await.unwrap());
    }
    assert_eq!(held.len(), 15);
}

#[tokio::test]
async fn waiters_are_served_in_order() {
    let PoolFixture { pool, .. } = pool_with(MockServer::standalone(), |options| {
        options.max_pool_size = Some(1);
    });

    let held = pool.check_out(&no_wait_limit(), None).await.unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for i in 0..3 {
        let pool = pool.clone();
        let order = order.clone();
        tasks.push(runtime::spawn(async move {
            let conn = pool.check_out(&no_wait_limit(), None).await.unwrap();
            order.lock().unwrap().push(i);
            drop(conn);
        }));
        // Give each waiter time to join the queue before the next one.
        runtime::delay_for(Duration::from_millis(50)).await;
    }

    drop(held);
    for task in tasks {
        runtime::timeout(EVENT_TIMEOUT, task).await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test]
async fn cold_pool_establishes_one_connection_at_a_time() {
    let PoolFixture {
        pool,
        connector,
        events,
    } = pool_with(
        MockServer::standalone().latency(Duration::from_millis(100)),
        |options| {
            options.max_pool_size = Some(2);
            options.max_connecting = Some(1);
        },
    );

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let pool = pool.clone();
        tasks.push(runtime::spawn(async move {
            let conn = pool.check_out(&no_wait_limit(), None).await.unwrap();
            runtime::delay_for(Duration::from_millis(200)).await;
            drop(conn);
        }));
    }
    for task in tasks {
        runtime::timeout(EVENT_TIMEOUT, task).await.unwrap();
    }

    assert_eq!(connector.dial_count(), 2);
    let lifecycle: Vec<_> = events.filter_map(|e| match e {
        CmapEvent::ConnectionCreated(_) => Some("created"),
        CmapEvent::ConnectionReady(_) => Some("ready"),
        _ => None,
    });
    assert_eq!(lifecycle, vec!["created", "ready", "created", "ready"]);
}

#[tokio::test]
async fn cancelled_checkout_gives_up() {
    let PoolFixture { pool, .. } = pool_with(MockServer::standalone(), |options| {
        options.max_pool_size = Some(1);
    });

    let _held = pool.check_out(&no_wait_limit(), None).await.unwrap();
    let token = tokio_util::sync::CancellationToken::new();
    let cancel = token.clone();
    runtime::execute(async move {
        runtime::delay_for(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let error = pool
        .check_out(&no_wait_limit(), Some(&token))
        .await
        .unwrap_err();
    assert!(error.is_cancelled(), "unexpected error: {error}");
}

#[tokio::test]
async fn clear_makes_connections_stale_and_pauses_pool() {
    let PoolFixture { pool, events, .. } = ready_pool();

    let conn = pool.check_out(&no_wait_limit(), None).await.unwrap();
    let cause: Error = std::io::ErrorKind::ConnectionReset.into();
    pool.clear(cause, None, false).await;
    assert_eq!(pool.generation().as_normal(), Some(1));

    let error = pool.check_out(&short_wait(), None).await.unwrap_err();
    assert!(error.is_pool_cleared(), "unexpected error: {error}");
    assert!(error.is_network_error());

    drop(conn);
    let mut stream = events.stream_all();
    let closed = stream
        .next_map(EVENT_TIMEOUT, |e| match e {
            CmapEvent::ConnectionClosed(e) => Some(e.reason),
            _ => None,
        })
        .await
        .expect("stale connection should be closed");
    assert_eq!(closed, ConnectionClosedReason::Stale);

    pool.mark_as_ready().await;
    let conn = pool.check_out(&no_wait_limit(), None).await.unwrap();
    assert_eq!(conn.info().id, 2);

    let cleared: Vec<_> = events.filter_map(|e| match e {
        CmapEvent::PoolCleared(e) => Some(e.interrupt_in_use_connections),
        _ => None,
    });
    assert_eq!(cleared, vec![false]);
}

#[tokio::test]
async fn clear_rejects_queued_waiters() {
    let PoolFixture { pool, .. } = pool_with(MockServer::standalone(), |options| {
        options.max_pool_size = Some(1);
    });

    let _held = pool.check_out(&no_wait_limit(), None).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        runtime::spawn(async move { pool.check_out(&no_wait_limit(), None).await })
    };
    runtime::delay_for(Duration::from_millis(50)).await;

    pool.clear(std::io::ErrorKind::ConnectionReset.into(), None, false)
        .await;
    let result = runtime::timeout(EVENT_TIMEOUT, waiter).await.unwrap();
    let error = result.unwrap_err();
    assert!(error.is_pool_cleared(), "unexpected error: {error}");
}

#[tokio::test]
async fn connection_established_across_a_clear_is_not_handed_out() {
    let PoolFixture { pool, events, .. } = pool_with(
        MockServer::standalone().latency(Duration::from_millis(300)),
        |_| {},
    );

    let checkout = {
        let pool = pool.clone();
        runtime::spawn(async move { pool.check_out(&no_wait_limit(), None).await })
    };
    runtime::delay_for(Duration::from_millis(50)).await;

    pool.clear(std::io::ErrorKind::ConnectionReset.into(), None, false)
        .await;
    let error = runtime::timeout(EVENT_TIMEOUT, checkout)
        .await
        .unwrap()
        .unwrap_err();
    assert!(error.is_pool_cleared(), "unexpected error: {error}");
    assert!(error.is_network_error());

    let mut stream = events.stream_all();
    let (id, reason) = stream
        .next_map(EVENT_TIMEOUT, |e| match e {
            CmapEvent::ConnectionClosed(e) => Some((e.connection_id, e.reason)),
            _ => None,
        })
        .await
        .expect("stale connection should be closed");
    assert_eq!((id, reason), (1, ConnectionClosedReason::Stale));

    pool.mark_as_ready().await;
    let conn = pool.check_out(&no_wait_limit(), None).await.unwrap();
    assert_eq!(conn.info().id, 2);
    assert_eq!(pool.generation().as_normal(), Some(1));
}

#[tokio::test]
async fn interrupting_clear_aborts_in_flight_io() {
    let PoolFixture { pool, events, .. } = pool_with(
        MockServer::standalone().message_delay(Duration::from_secs(30)),
        |_| {},
    );

    let mut conn = pool.check_out(&no_wait_limit(), None).await.unwrap();
    let io = runtime::spawn(async move {
        let result = conn.send_message(b"slow", &no_wait_limit()).await;
        (conn, result)
    });
    runtime::delay_for(Duration::from_millis(50)).await;

    pool.clear(std::io::ErrorKind::ConnectionReset.into(), None, true)
        .await;

    let (conn, result) = runtime::timeout(EVENT_TIMEOUT, io).await.unwrap();
    let error = result.unwrap_err();
    assert!(error.is_network_error(), "unexpected error: {error}");
    drop(conn);

    let mut stream = events.stream_all();
    let reason = stream
        .next_map(EVENT_TIMEOUT, |e| match e {
            CmapEvent::ConnectionClosed(e) => Some(e.reason),
            _ => None,
        })
        .await
        .expect("interrupted connection should be closed");
    assert_eq!(reason, ConnectionClosedReason::Error);

    let cleared: Vec<_> = events.filter_map(|e| match e {
        CmapEvent::PoolCleared(e) => Some(e.interrupt_in_use_connections),
        _ => None,
    });
    assert_eq!(cleared, vec![true]);
}

#[tokio::test]
async fn new_pool_rejects_checkout_until_ready() {
    let PoolFixture { pool, events, .. } = pool_with(MockServer::standalone(), |options| {
        options.ready = false;
    });

    let error = pool.check_out(&short_wait(), None).await.unwrap_err();
    assert!(error.is_pool_cleared(), "unexpected error: {error}");

    pool.mark_as_ready().await;
    pool.check_out(&short_wait(), None).await.unwrap();
    assert_eq!(
        events.filter_map(|e| matches!(e, CmapEvent::PoolReady(_)).then_some(())).len(),
        1
    );
}

#[tokio::test]
async fn closed_pool_rejects_checkout() {
    let PoolFixture { pool, events, .. } = ready_pool();

    let conn = pool.check_out(&no_wait_limit(), None).await.unwrap();
    drop(conn);
    pool.close().await;

    let error = pool.check_out(&short_wait(), None).await.unwrap_err();
    assert!(error.is_pool_closed(), "unexpected error: {error}");

    let closed: Vec<_> = events.filter_map(|e| match e {
        CmapEvent::ConnectionClosed(e) => Some(e.reason),
        _ => None,
    });
    assert_eq!(closed, vec![ConnectionClosedReason::PoolClosed]);
    assert_eq!(
        events.filter_map(|e| matches!(e, CmapEvent::PoolClosed(_)).then_some(())).len(),
        1
    );
}

#[tokio::test]
async fn failed_establishment_surfaces_error() {
    let PoolFixture { pool, events, .. } = pool_with(MockServer::down(), |_| {});

    let error = pool.check_out(&short_wait(), None).await.unwrap_err();
    assert!(error.is_network_error(), "unexpected error: {error}");

    let closed: Vec<_> = events.filter_map(|e| match e {
        CmapEvent::ConnectionClosed(e) => Some(e.reason),
        _ => None,
    });
    assert_eq!(closed, vec![ConnectionClosedReason::Error]);

    let failed: Vec<_> = events.filter_map(|e| match e {
        CmapEvent::ConnectionCheckoutFailed(e) => Some(e.reason),
        _ => None,
    });
    assert_eq!(failed, vec![ConnectionCheckoutFailedReason::ConnectionError]);
}

#[tokio::test]
async fn background_maintenance_fills_min_pool_size() {
    // The worker stops once every handle to the pool is gone, so the pool stays bound.
    let PoolFixture {
        pool,
        connector,
        events,
    } = pool_with(MockServer::standalone(), |options| {
        options.min_pool_size = Some(2);
        options.maintenance_frequency = Some(Duration::from_millis(10));
    });

    let mut stream = events.stream_all();
    for _ in 0..2 {
        stream
            .next_match(EVENT_TIMEOUT, |e| matches!(e, CmapEvent::ConnectionReady(_)))
            .await
            .expect("min_pool_size connections should be established");
    }
    assert_eq!(connector.dial_count(), 2);

    // Both connections are idle in the pool, so checking one out dials nothing new.
    drop(pool.check_out(&no_wait_limit(), None).await.unwrap());
    assert_eq!(connector.dial_count(), 2);
}

#[tokio::test]
async fn idle_connections_are_closed() {
    let PoolFixture { pool, events, .. } = pool_with(MockServer::standalone(), |options| {
        options.max_idle_time = Some(Duration::from_millis(10));
        options.maintenance_frequency = Some(Duration::from_millis(10));
    });

    drop(pool.check_out(&no_wait_limit(), None).await.unwrap());

    let mut stream = events.stream_all();
    let reason = stream
        .next_map(EVENT_TIMEOUT, |e| match e {
            CmapEvent::ConnectionClosed(e) => Some(e.reason),
            _ => None,
        })
        .await
        .expect("idle connection should be closed");
    assert_eq!(reason, ConnectionClosedReason::Idle);
}

#[tokio::test]
async fn load_balanced_pool_tracks_service_generations() {
    let service_id = ObjectId::new();
    let PoolFixture { pool, events, .. } =
        pool_with(MockServer::load_balancer(service_id), |options| {
            options.load_balanced = true;
            options.ready = false;
        });

    // Pools behind a load balancer never wait for a monitor.
    let conn = pool.check_out(&no_wait_limit(), None).await.unwrap();
    assert_eq!(conn.service_id(), Some(service_id));

    pool.clear(
        std::io::ErrorKind::ConnectionReset.into(),
        Some(service_id),
        true,
    )
    .await;

    // Clearing one service leaves the pool usable.
    let other = pool.check_out(&no_wait_limit(), None).await.unwrap();
    drop(conn);
    drop(other);

    let mut stream = events.stream_all();
    let reason = stream
        .next_map(EVENT_TIMEOUT, |e| match e {
            CmapEvent::ConnectionClosed(e) => Some(e.reason),
            _ => None,
        })
        .await
        .expect("connection from the cleared generation should be closed");
    assert_eq!(reason, ConnectionClosedReason::Stale);

    let cleared: Vec<_> = events.filter_map(|e| match e {
        CmapEvent::PoolCleared(e) => Some((e.service_id, e.interrupt_in_use_connections)),
        _ => None,
    });
    assert_eq!(cleared, vec![(Some(service_id), false)]);
}

#[tokio::test]
async fn load_balanced_pool_requires_service_id() {
    let PoolFixture { pool, .. } = pool_with(MockServer::standalone(), |options| {
        options.load_balanced = true;
    });

    let error = pool.check_out(&short_wait(), None).await.unwrap_err();
    assert!(error.is_incompatible_server(), "unexpected error: {error}");
}
