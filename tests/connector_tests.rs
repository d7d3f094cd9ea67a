mod common;

use common::{connector_config, mock_dialer};
use marketfeed::config::{ConnectorConfig, OverflowPolicy};
use marketfeed::connector::{Connector, ConnectorEvent, ConnectorState};
use marketfeed::error::FeedError;
use marketfeed::models::{ClientMessage, ServerMessage};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn ping(timestamp: i64) -> ClientMessage {
    ClientMessage::Ping { timestamp }
}

fn subscribe(symbol: &str) -> ClientMessage {
    ClientMessage::Subscribe {
        symbol: symbol.to_string(),
    }
}

async fn wait_for_disconnect(events: &mut UnboundedReceiver<ConnectorEvent>) {
    while let Some(event) = events.recv().await {
        if matches!(event, ConnectorEvent::Disconnected) {
            return;
        }
    }
    panic!("event stream ended before disconnect");
}

#[tokio::test(start_paused = true)]
async fn test_queued_messages_flushed_in_order_on_connect() {
    let (dialer, mut server) = mock_dialer();
    server.fail_next(2);
    let (connector, _events) = Connector::spawn(connector_config(5), dialer);

    for i in 1..=3 {
        connector.send(ping(i)).unwrap();
    }
    assert_eq!(connector.queued(), 3);

    connector.connect().unwrap();
    connector
        .wait_for_state(ConnectorState::Connected)
        .await
        .unwrap();

    for i in 1..=3 {
        assert_eq!(server.next_sent().await, ping(i));
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(server.sent.try_recv().is_err());
    assert_eq!(server.dials(), 3);
    assert_eq!(connector.queued(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_messages_sent_while_reconnecting_delivered_exactly_once() {
    let (dialer, mut server) = mock_dialer();
    let (connector, mut events) = Connector::spawn(connector_config(5), dialer);
    connector.connect().unwrap();
    connector
        .wait_for_state(ConnectorState::Connected)
        .await
        .unwrap();

    server.fail_next(1);
    server.drop_link();
    wait_for_disconnect(&mut events).await;

    for i in 1..=3 {
        connector.send(ping(i)).unwrap();
    }

    for i in 1..=3 {
        assert_eq!(server.next_sent().await, ping(i));
    }
    assert_eq!(connector.state(), ConnectorState::Connected);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(server.sent.try_recv().is_err());
    // Initial dial, one refused retry, one successful retry.
    assert_eq!(server.dials(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_replayed_after_reconnect() {
    let (dialer, mut server) = mock_dialer();
    let (connector, mut events) = Connector::spawn(connector_config(5), dialer);
    connector.subscribe("GBPUSD").unwrap();
    connector.subscribe("EURUSD").unwrap();
    connector.connect().unwrap();

    assert_eq!(server.next_sent().await, subscribe("EURUSD"));
    assert_eq!(server.next_sent().await, subscribe("GBPUSD"));

    connector.unsubscribe("GBPUSD").unwrap();
    assert_eq!(
        server.next_sent().await,
        ClientMessage::Unsubscribe {
            symbol: "GBPUSD".to_string()
        }
    );

    server.drop_link();
    wait_for_disconnect(&mut events).await;

    assert_eq!(server.next_sent().await, subscribe("EURUSD"));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(server.sent.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_backoff_doubles_after_dropped_link() {
    let (dialer, server) = mock_dialer();
    let (connector, mut events) = Connector::spawn(connector_config(10), dialer);
    connector.connect().unwrap();
    connector
        .wait_for_state(ConnectorState::Connected)
        .await
        .unwrap();

    server.fail_next(3);
    server.drop_link();
    wait_for_disconnect(&mut events).await;
    let dropped_at = tokio::time::Instant::now();

    while server.dials() < 5 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let dialed_at = server.dialed_at();
    assert_eq!(dialed_at[1] - dropped_at, Duration::from_millis(100));
    let gaps: Vec<Duration> = dialed_at[1..].windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(800),
        ]
    );
    connector
        .wait_for_state(ConnectorState::Connected)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_initial_connect_backoff_sequence() {
    let (dialer, server) = mock_dialer();
    server.fail_next(3);
    let (connector, _events) = Connector::spawn(connector_config(10), dialer);
    connector.connect().unwrap();

    while server.dials() < 4 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let gaps: Vec<Duration> = server
        .dialed_at()
        .windows(2)
        .map(|w| w[1] - w[0])
        .collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_attempt_cap_enters_failed_and_stops_dialing() {
    let (dialer, server) = mock_dialer();
    server.fail_always();
    let (connector, mut events) = Connector::spawn(connector_config(3), dialer);
    connector.connect().unwrap();

    match events.recv().await {
        Some(ConnectorEvent::Fatal(FeedError::ReconnectExhausted { attempts })) => {
            assert_eq!(attempts, 3)
        }
        other => panic!("expected fatal event, got {:?}", other),
    }
    assert_eq!(connector.state(), ConnectorState::Failed);
    assert_eq!(server.dials(), 3);

    tokio::time::sleep(Duration::from_secs(3_600)).await;
    assert_eq!(server.dials(), 3);
    assert_eq!(connector.state(), ConnectorState::Failed);

    // Manual reconnect starts a fresh cycle.
    server.fail_next(0);
    connector.reconnect().unwrap();
    connector
        .wait_for_state(ConnectorState::Connected)
        .await
        .unwrap();
    assert_eq!(server.dials(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_pending_reconnect() {
    let (dialer, server) = mock_dialer();
    server.fail_always();
    let config = ConnectorConfig {
        base_delay_ms: 3_600_000,
        max_delay_ms: 3_600_000,
        ..connector_config(10)
    };
    let (connector, mut events) = Connector::spawn(config, dialer);
    connector.connect().unwrap();
    connector
        .wait_for_state(ConnectorState::Reconnecting)
        .await
        .unwrap();
    assert_eq!(server.dials(), 1);

    connector.close().await;
    assert_eq!(connector.state(), ConnectorState::Closed);
    assert!(matches!(events.recv().await, Some(ConnectorEvent::Closed)));

    tokio::time::sleep(Duration::from_secs(7_200)).await;
    assert_eq!(server.dials(), 1);
    assert!(matches!(connector.send(ping(1)), Err(FeedError::Closed)));
}

#[tokio::test(start_paused = true)]
async fn test_server_ping_answered_and_messages_forwarded() {
    let (dialer, mut server) = mock_dialer();
    let (connector, mut events) = Connector::spawn(connector_config(3), dialer);
    connector.connect().unwrap();
    assert!(matches!(events.recv().await, Some(ConnectorEvent::Connected)));

    server.push(ServerMessage::Ping { timestamp: 42 });
    assert_eq!(server.next_sent().await, ClientMessage::Pong { timestamp: 42 });

    server.push(ServerMessage::Subscribed {
        symbol: "EURUSD".to_string(),
    });
    match events.recv().await {
        Some(ConnectorEvent::Message(ServerMessage::Subscribed { symbol })) => {
            assert_eq!(symbol, "EURUSD")
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_reject_new_policy_surfaces_queue_full() {
    let (dialer, _server) = mock_dialer();
    let config = ConnectorConfig {
        queue_capacity: 2,
        overflow_policy: OverflowPolicy::RejectNew,
        ..connector_config(3)
    };
    let (connector, _events) = Connector::spawn(config, dialer);

    connector.send(ping(1)).unwrap();
    connector.send(ping(2)).unwrap();
    assert!(matches!(
        connector.send(ping(3)),
        Err(FeedError::QueueFull { capacity: 2 })
    ));
    assert_eq!(connector.queued(), 2);
    assert_eq!(connector.dropped(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_drop_oldest_policy_keeps_newest() {
    let (dialer, mut server) = mock_dialer();
    let config = ConnectorConfig {
        queue_capacity: 2,
        overflow_policy: OverflowPolicy::DropOldest,
        ..connector_config(3)
    };
    let (connector, _events) = Connector::spawn(config, dialer);

    for i in 1..=3 {
        connector.send(ping(i)).unwrap();
    }
    assert_eq!(connector.dropped(), 1);

    connector.connect().unwrap();
    assert_eq!(server.next_sent().await, ping(2));
    assert_eq!(server.next_sent().await, ping(3));
}
