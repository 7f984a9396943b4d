//! Integration tests for node health tracking
//!
//! Covers the hysteresis window, immediate recovery, and a local node that
//! goes silent long enough to push queries back onto full group dispatch.

mod common;

use common::{cluster_config, FakeClient, Mode};
use searchdispatch::clock::ManualClock;
use searchdispatch::cluster::NodeMonitor;
use searchdispatch::dispatcher::{Dispatcher, Route};
use searchdispatch::query::{Query, DISPATCH_DIRECT};
use searchdispatch::ErrorKind;
use futures::future::join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const HYSTERESIS: Duration = Duration::from_secs(10);

fn monitor() -> (NodeMonitor, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    (NodeMonitor::new("node 0", HYSTERESIS, clock.clone()), clock)
}

#[test]
fn test_failure_within_window_keeps_node_up() {
    let (monitor, clock) = monitor();
    monitor.responded(true);

    clock.advance(Duration::from_secs(3));
    monitor.failed(ErrorKind::Connectivity);
    assert!(monitor.is_working(), "one failure 3s after a success is transient");

    clock.advance(Duration::from_secs(6));
    monitor.failed(ErrorKind::Connectivity);
    assert!(monitor.is_working(), "still inside the 10s window");
}

#[test]
fn test_failure_after_window_takes_node_down() {
    let (monitor, clock) = monitor();
    monitor.responded(true);

    clock.advance(Duration::from_secs(3));
    monitor.failed(ErrorKind::Connectivity);
    clock.advance(Duration::from_secs(8));
    monitor.failed(ErrorKind::Connectivity);
    assert!(!monitor.is_working(), "11s without a success");
}

#[test]
fn test_exactly_at_window_is_not_an_outage() {
    let (monitor, clock) = monitor();
    monitor.responded(true);
    clock.advance(HYSTERESIS);
    monitor.failed(ErrorKind::Connectivity);
    assert!(monitor.is_working());
}

#[test]
fn test_recovery_is_immediate() {
    let (monitor, clock) = monitor();
    monitor.responded(true);
    clock.advance(Duration::from_secs(30));
    monitor.failed(ErrorKind::Connectivity);
    assert!(!monitor.is_working());

    monitor.responded(false);
    assert!(monitor.is_working());
    assert!(!monitor.search_nodes_online());
}

#[test]
fn test_non_connectivity_failures_change_nothing() {
    let (monitor, clock) = monitor();
    monitor.responded(true);
    let last_success = monitor.last_success();
    clock.advance(Duration::from_secs(60));

    for kind in [ErrorKind::Protocol, ErrorKind::Routing, ErrorKind::Encode] {
        monitor.failed(kind);
    }
    assert!(monitor.is_working());
    assert_eq!(monitor.last_success(), last_success);
}

#[test]
fn test_concurrent_updates_settle_consistently() {
    let (monitor, clock) = monitor();
    let monitor = Arc::new(monitor);
    monitor.responded(true);
    clock.advance(Duration::from_secs(30));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let monitor = monitor.clone();
            std::thread::spawn(move || {
                for _ in 0..1_000 {
                    if i % 2 == 0 {
                        monitor.failed(ErrorKind::Connectivity);
                    } else {
                        let _ = monitor.is_working();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(!monitor.is_working());

    monitor.responded(true);
    assert!(monitor.is_working());
}

#[tokio::test(start_paused = true)]
async fn test_silent_local_node_falls_back_to_group_dispatch() {
    let config = cluster_config(2, 1, "node0");
    let client = FakeClient::for_config(&config);
    client.node(0).set_docs(100);
    client.node(1).set_docs(100);

    let clock = Arc::new(ManualClock::new());
    let dispatcher = Dispatcher::with_clock(config, &client, clock.clone()).unwrap();
    dispatcher.monitor().ping_round().await;

    let query = Query::new(Duration::from_secs(1)).with_property(DISPATCH_DIRECT, "true");
    let outcome = dispatcher.search(&query).await.unwrap();
    assert_eq!(outcome.route, Route::Direct(0));

    // Local node stops answering for longer than the hysteresis window
    client.node(0).set_mode(Mode::Hang);
    clock.advance(Duration::from_secs(11));
    let round = dispatcher.monitor().ping_round().await;
    assert_eq!(round.failed, 1);
    assert!(!dispatcher.cluster().node(0).unwrap().is_working());

    let searches_before = client.node(0).searches();
    let query = Query::new(Duration::from_secs(1)).with_property(DISPATCH_DIRECT, "true");
    let outcome = dispatcher.search(&query).await.unwrap();
    assert_eq!(outcome.route, Route::Group(1));
    assert!(outcome.group.outcomes[0].outcome.is_completed());
    assert_eq!(client.node(0).searches(), searches_before);

    dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_short_silence_keeps_direct_dispatch() {
    let config = cluster_config(2, 1, "node0");
    let client = FakeClient::for_config(&config);
    client.node(0).set_docs(100);
    client.node(1).set_docs(100);

    let clock = Arc::new(ManualClock::new());
    let dispatcher = Dispatcher::with_clock(config, &client, clock.clone()).unwrap();
    dispatcher.monitor().ping_round().await;

    client.node(0).set_mode(Mode::Refuse);
    clock.advance(Duration::from_secs(2));
    dispatcher.monitor().ping_round().await;
    assert!(dispatcher.cluster().node(0).unwrap().is_working());

    client.node(0).set_mode(Mode::Answer);
    let query = Query::new(Duration::from_secs(1)).with_property(DISPATCH_DIRECT, "true");
    let outcome = dispatcher.search(&query).await.unwrap();
    assert_eq!(outcome.route, Route::Direct(0));
}

fn stale_direct_dispatcher() -> (Dispatcher, FakeClient) {
    let config = cluster_config(2, 1, "node0");
    let client = FakeClient::for_config(&config);
    client.node(0).set_docs(100);
    client.node(1).set_docs(100);
    let dispatcher =
        Dispatcher::with_clock(config, &client, Arc::new(ManualClock::new())).unwrap();
    (dispatcher, client)
}

#[tokio::test(start_paused = true)]
async fn test_stale_health_refresh_stays_within_query_budget() {
    let (dispatcher, client) = stale_direct_dispatcher();
    dispatcher.monitor().ping_round().await;

    client.node(1).set_mode(Mode::Hang);
    tokio::time::advance(Duration::from_secs(2)).await;

    let query = Query::new(Duration::from_millis(100)).with_property(DISPATCH_DIRECT, "true");
    let started = tokio::time::Instant::now();
    let outcome = dispatcher.search(&query).await.unwrap();

    assert!(started.elapsed() <= Duration::from_millis(100));
    assert_eq!(outcome.route, Route::Direct(0));
    assert!(outcome.group.outcomes[0].outcome.is_completed());
    assert!(dispatcher.cluster().node(0).unwrap().is_working());

    dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_direct_queries_share_one_refresh() {
    let (dispatcher, client) = stale_direct_dispatcher();
    dispatcher.monitor().ping_round().await;
    tokio::time::advance(Duration::from_secs(2)).await;
    let pings_before = client.node(0).pings.load(Ordering::SeqCst);

    let query = Query::new(Duration::from_secs(1)).with_property(DISPATCH_DIRECT, "true");
    let outcomes = join_all((0..10).map(|_| dispatcher.search(&query))).await;

    for outcome in outcomes {
        assert_eq!(outcome.unwrap().route, Route::Direct(0));
    }
    assert_eq!(client.node(0).pings.load(Ordering::SeqCst), pings_before + 1);

    dispatcher.shutdown().await;
}
