use std::time::Duration;

use redis_monitor::monitor::{ChannelObserver, ConnectError, HubStatus, StreamError};
use tokio::time::sleep;

use crate::test_utils::{
    ScriptedConnector, arguments, assert_no_batch, directory, exception_message, recv_batch,
    set_args, set_line, wait_for_hub_count, wait_for_observer_count, wait_for_status,
};

#[tokio::test]
async fn test_last_unsubscribe_closes_upstream_and_next_subscribe_reconnects() {
    let connector = ScriptedConnector::new();
    let directory = directory(&connector);

    let (a, _a_events) = ChannelObserver::new("A", 8);
    directory.subscribe("db1", a.clone()).await;

    let first = connector.feed(0).await;
    wait_for_status(&directory, "db1", Some(HubStatus::Streaming)).await;
    assert_eq!(connector.open_streams(), 1);

    directory.unsubscribe("db1", "A").await;
    first.wait_closed().await;
    wait_for_hub_count(&directory, 0).await;
    assert_eq!(connector.open_streams(), 0);
    assert_eq!(directory.hub_status("db1").await, None);

    let (c, mut c_events) = ChannelObserver::new("C", 8);
    directory.subscribe("db1", c.clone()).await;

    let second = connector.feed(1).await;
    assert_eq!(connector.opens(), 2);
    assert!(first.is_closed());
    assert!(!second.is_closed());

    second.send_line(&set_line("1.0", "k", "v"));
    assert_eq!(arguments(&recv_batch(&mut c_events).await), vec![set_args("k", "v")]);
}

#[tokio::test]
async fn test_concurrent_subscribes_share_one_upstream() {
    let connector = ScriptedConnector::new();
    let directory = directory(&connector);

    let mut receivers = Vec::new();
    let mut tasks = Vec::new();
    for i in 0..16 {
        let (observer, receiver) = ChannelObserver::new(&format!("observer-{}", i), 8);
        receivers.push((observer.clone(), receiver));

        let directory = directory.clone();
        tasks.push(tokio::spawn(async move {
            directory.subscribe("db1", observer).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    wait_for_observer_count(&directory, "db1", 16).await;
    let feed = connector.feed(0).await;
    assert_eq!(connector.opens(), 1);
    assert_eq!(directory.hub_count().await, 1);

    feed.send_line(&set_line("1.0", "k", "v"));
    for (_, receiver) in receivers.iter_mut() {
        assert_eq!(arguments(&recv_batch(receiver).await), vec![set_args("k", "v")]);
    }
}

#[tokio::test]
async fn test_connect_error_sends_one_exception_and_discards_hub() {
    let connector = ScriptedConnector::new();
    let directory = directory(&connector);
    connector.fail_next_open(ConnectError::Rejected(
        "WRONGPASS invalid username-password pair".to_string(),
    ));

    let (a, mut a_events) = ChannelObserver::new("A", 8);
    directory.subscribe("db1", a.clone()).await;

    let batch = recv_batch(&mut a_events).await;
    assert_eq!(
        exception_message(&batch),
        "WRONGPASS invalid username-password pair"
    );
    assert_no_batch(&mut a_events, Duration::from_millis(100)).await;

    wait_for_hub_count(&directory, 0).await;
    assert_eq!(directory.current_observer_count("db1").await, 0);
    assert_eq!(connector.open_streams(), 0);

    // A fresh subscribe retries with a brand-new connection.
    directory.subscribe("db1", a.clone()).await;
    connector.feed(0).await;
    assert_eq!(connector.opens(), 2);
}

#[tokio::test]
async fn test_connect_timeout_is_reported() {
    let connector = ScriptedConnector::new();
    let directory = directory(&connector);
    connector.delay_opens(Duration::from_secs(5));

    let (a, mut a_events) = ChannelObserver::new("A", 8);
    directory.subscribe("db1", a.clone()).await;

    let batch = recv_batch(&mut a_events).await;
    assert_eq!(exception_message(&batch), "connection timed out");
    wait_for_hub_count(&directory, 0).await;
}

#[tokio::test]
async fn test_status_moves_from_connecting_to_streaming() {
    let connector = ScriptedConnector::new();
    let directory = directory(&connector);
    connector.delay_opens(Duration::from_millis(200));

    assert_eq!(directory.hub_status("db1").await, None);

    let (a, _a_events) = ChannelObserver::new("A", 8);
    directory.subscribe("db1", a.clone()).await;

    assert_eq!(
        directory.hub_status("db1").await,
        Some(HubStatus::Connecting)
    );
    wait_for_status(&directory, "db1", Some(HubStatus::Streaming)).await;
}

#[tokio::test]
async fn test_unsubscribe_while_connecting_abandons_connection() {
    let connector = ScriptedConnector::new();
    let directory = directory(&connector);
    connector.delay_opens(Duration::from_millis(200));

    let (a, mut a_events) = ChannelObserver::new("A", 8);
    directory.subscribe("db1", a.clone()).await;
    directory.unsubscribe("db1", "A").await;

    wait_for_hub_count(&directory, 0).await;
    sleep(Duration::from_millis(300)).await;

    assert!(connector.opens() <= 1);
    assert_eq!(connector.open_streams(), 0);
    assert_no_batch(&mut a_events, Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let connector = ScriptedConnector::new();
    let directory = directory(&connector);

    let (a, _a_events) = ChannelObserver::new("A", 8);
    let (b, _b_events) = ChannelObserver::new("B", 8);
    directory.subscribe("db1", a.clone()).await;
    directory.subscribe("db1", b.clone()).await;
    wait_for_observer_count(&directory, "db1", 2).await;

    directory.unsubscribe("db1", "A").await;
    directory.unsubscribe("db1", "A").await;
    directory.unsubscribe("db1", "unknown").await;
    wait_for_observer_count(&directory, "db1", 1).await;
    assert_eq!(connector.open_streams(), 1);

    directory.unsubscribe("db1", "B").await;
    wait_for_hub_count(&directory, 0).await;

    directory.unsubscribe("db1", "B").await;
    directory.unsubscribe("db2", "B").await;
    assert_eq!(directory.hub_count().await, 0);
    assert_eq!(connector.opens(), 1);
}

#[tokio::test]
async fn test_duplicate_subscribe_is_ignored() {
    let connector = ScriptedConnector::new();
    let directory = directory(&connector);

    let (a, mut a_events) = ChannelObserver::new("A", 8);
    directory.subscribe("db1", a.clone()).await;
    directory.subscribe("db1", a.clone()).await;
    wait_for_status(&directory, "db1", Some(HubStatus::Streaming)).await;
    assert_eq!(directory.current_observer_count("db1").await, 1);

    connector.feed(0).await.send_line(&set_line("1.0", "k", "v"));
    assert_eq!(recv_batch(&mut a_events).await.len(), 1);
    assert_no_batch(&mut a_events, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_closed_signal_unsubscribes_observer() {
    let connector = ScriptedConnector::new();
    let directory = directory(&connector);

    let (a, a_events) = ChannelObserver::new("A", 8);
    let (b, mut b_events) = ChannelObserver::new("B", 8);
    directory.subscribe("db1", a.clone()).await;
    directory.subscribe("db1", b.clone()).await;
    wait_for_observer_count(&directory, "db1", 2).await;

    // The transport side going away cancels A's closed token.
    drop(a_events);
    wait_for_observer_count(&directory, "db1", 1).await;

    let feed = connector.feed(0).await;
    assert!(!feed.is_closed());
    feed.send_line(&set_line("1.0", "k", "v"));
    assert_eq!(arguments(&recv_batch(&mut b_events).await), vec![set_args("k", "v")]);
}

#[tokio::test]
async fn test_closed_signal_of_last_observer_releases_hub() {
    let connector = ScriptedConnector::new();
    let directory = directory(&connector);

    let (a, mut a_events) = ChannelObserver::new("A", 8);
    directory.subscribe("db1", a.clone()).await;
    let feed = connector.feed(0).await;

    a_events.close();
    feed.wait_closed().await;
    wait_for_hub_count(&directory, 0).await;
}

#[tokio::test]
async fn test_dropped_observer_is_pruned_on_delivery() {
    let connector = ScriptedConnector::new();
    let directory = directory(&connector);

    let (a, _a_events) = ChannelObserver::new("A", 8);
    let (b, mut b_events) = ChannelObserver::new("B", 8);
    directory.subscribe("db1", a.clone()).await;
    directory.subscribe("db1", b.clone()).await;
    wait_for_observer_count(&directory, "db1", 2).await;

    // The hub only holds a weak reference to A.
    drop(a);

    let feed = connector.feed(0).await;
    feed.send_line(&set_line("1.0", "k", "v"));
    recv_batch(&mut b_events).await;

    wait_for_observer_count(&directory, "db1", 1).await;
    assert!(!feed.is_closed());
}

#[tokio::test]
async fn test_stream_termination_notifies_every_observer() {
    let test_cases = vec![
        (
            StreamError::Server("ERR max number of clients reached".to_string()),
            "ERR max number of clients reached",
        ),
        (StreamError::Closed, "connection closed by server"),
        (
            StreamError::Io("connection reset by peer".to_string()),
            "I/O error: connection reset by peer",
        ),
    ];

    for (error, expected_message) in test_cases {
        let connector = ScriptedConnector::new();
        let directory = directory(&connector);

        let (a, mut a_events) = ChannelObserver::new("A", 8);
        let (b, mut b_events) = ChannelObserver::new("B", 8);
        directory.subscribe("db1", a.clone()).await;
        directory.subscribe("db1", b.clone()).await;
        wait_for_observer_count(&directory, "db1", 2).await;

        let feed = connector.feed(0).await;
        feed.send_line(&set_line("1.0", "k", "v"));
        feed.fail(error);

        for events in [&mut a_events, &mut b_events] {
            // Events read before the failure are delivered first.
            let batch = recv_batch(events).await;
            assert_eq!(arguments(&batch), vec![set_args("k", "v")]);

            let batch = recv_batch(events).await;
            assert_eq!(exception_message(&batch), expected_message);
        }

        feed.wait_closed().await;
        wait_for_hub_count(&directory, 0).await;
        assert_eq!(directory.current_observer_count("db1").await, 0);

        // No automatic reconnect.
        sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.opens(), 1);
    }
}

#[tokio::test]
async fn test_clear_unsubscribes_everyone() {
    let connector = ScriptedConnector::new();
    let directory = directory(&connector);

    let (a, mut a_events) = ChannelObserver::new("A", 8);
    let (b, mut b_events) = ChannelObserver::new("B", 8);
    directory.subscribe("db1", a.clone()).await;
    directory.subscribe("db1", b.clone()).await;
    let feed = connector.feed(0).await;

    directory.clear("db1").await;

    assert!(feed.is_closed());
    assert_eq!(directory.hub_count().await, 0);
    assert_eq!(directory.current_observer_count("db1").await, 0);
    assert_no_batch(&mut a_events, Duration::from_millis(50)).await;
    assert_no_batch(&mut b_events, Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_shutdown_terminates_every_hub() {
    let connector = ScriptedConnector::new();
    let directory = directory(&connector);

    let (a, mut a_events) = ChannelObserver::new("A", 8);
    let (b, mut b_events) = ChannelObserver::new("B", 8);
    directory.subscribe("db1", a.clone()).await;
    directory.subscribe("db2", b.clone()).await;

    let first = connector.feed(0).await;
    let second = connector.feed(1).await;
    assert_eq!(directory.hub_count().await, 2);

    directory.shutdown().await;

    for events in [&mut a_events, &mut b_events] {
        let batch = recv_batch(events).await;
        assert_eq!(exception_message(&batch), "monitor hub shut down");
    }

    assert!(first.is_closed());
    assert!(second.is_closed());
    assert_eq!(directory.hub_count().await, 0);
    assert_eq!(connector.open_streams(), 0);
}
