mod common;

use common::{connect_client, drain_messages, eurusd_config};
use marketfeed::config::ServerConfig;
use marketfeed::engine::registry::Outbound;
use marketfeed::engine::session::{Session, SessionControl};
use marketfeed::error::FeedError;
use marketfeed::models::{
    reply_channel, ClientMessage, ErrorCode, OrderStatus, ServerMessage, Side,
};
use marketfeed::server::{AppState, FeedService};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_one_second_cadence_yields_five_ticks_in_five_seconds() {
    let service = FeedService::start(eurusd_config(1_000)).unwrap();
    let registry = service.registry();
    let (id, mut mailbox) = connect_client(&registry, 256);
    registry.subscribe(id, "EURUSD").unwrap();

    tokio::time::sleep(Duration::from_millis(5_500)).await;

    let messages = drain_messages(&mut mailbox);
    let ticks: Vec<_> = messages
        .iter()
        .filter_map(|message| match message {
            ServerMessage::MarketData(tick) => Some(tick),
            _ => None,
        })
        .collect();
    assert_eq!(ticks.len(), 5);
    for tick in &ticks {
        assert_eq!(tick.symbol, "EURUSD");
        assert!(tick.ask >= tick.bid);
        assert!(tick.volume >= 0.0);
    }

    let books = messages
        .iter()
        .filter(|message| matches!(message, ServerMessage::OrderBook(_)))
        .count();
    assert_eq!(books, 5);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribed_connection_receives_no_ticks() {
    let service = FeedService::start(eurusd_config(1_000)).unwrap();
    let registry = service.registry();
    let (_id, mut mailbox) = connect_client(&registry, 256);

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert!(drain_messages(&mut mailbox).is_empty());

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_connection_evicted_responsive_one_kept() {
    let service = FeedService::start(eurusd_config(60_000)).unwrap();
    let registry = service.registry();

    let (silent, _silent_mailbox) = connect_client(&registry, 256);
    let (responsive, mut mailbox) = connect_client(&registry, 256);

    let responder_registry = registry.clone();
    tokio::spawn(async move {
        while let Some(outbound) = mailbox.recv().await {
            if let Outbound::Frame(frame) = outbound {
                if let Ok(ServerMessage::Ping { .. }) = serde_json::from_str(&frame) {
                    responder_registry.record_pong(responsive);
                }
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(90)).await;

    assert!(!registry.contains(silent));
    assert!(registry.contains(responsive));
    assert!(registry.subscribers(&reply_channel(silent)).is_empty());

    service.shutdown().await;
}

#[tokio::test]
async fn test_zero_size_order_rejected_without_order_update() {
    let state = AppState::new(ServerConfig::default());
    let (handle, mut mailbox) = marketfeed::engine::registry::ConnectionHandle::channel(32);
    let mut session = Session::open(state.registry.clone(), state.orders.clone(), handle, 5);

    let control = session.handle_message(ClientMessage::PlaceOrder {
        symbol: "EURUSD".to_string(),
        side: "buy".to_string(),
        size: 0.0,
        correlation_id: Some("c-1".to_string()),
    });
    assert_eq!(control, SessionControl::Continue);

    let messages = drain_messages(&mut mailbox);
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        ServerMessage::Error {
            code,
            correlation_id,
            ..
        } => {
            assert_eq!(*code, ErrorCode::InvalidSize);
            assert_eq!(correlation_id.as_deref(), Some("c-1"));
        }
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(state.orders.open_order_count(), 0);
}

#[tokio::test]
async fn test_order_lifecycle_reaches_only_its_owner() {
    let state = AppState::new(ServerConfig::default());
    let (owner_handle, mut owner_mailbox) =
        marketfeed::engine::registry::ConnectionHandle::channel(32);
    let (other_handle, mut other_mailbox) =
        marketfeed::engine::registry::ConnectionHandle::channel(32);
    let mut owner = Session::open(state.registry.clone(), state.orders.clone(), owner_handle, 5);
    let mut other = Session::open(state.registry.clone(), state.orders.clone(), other_handle, 5);

    owner.handle_message(ClientMessage::PlaceOrder {
        symbol: "GBPUSD".to_string(),
        side: "sell".to_string(),
        size: 2.5,
        correlation_id: Some("place-1".to_string()),
    });

    let messages = drain_messages(&mut owner_mailbox);
    assert_eq!(messages.len(), 2);
    let order_id = match &messages[0] {
        ServerMessage::OrderUpdate {
            order_id,
            status,
            correlation_id,
            side,
            ..
        } => {
            assert_eq!(*status, OrderStatus::Acknowledged);
            assert_eq!(correlation_id.as_deref(), Some("place-1"));
            assert_eq!(*side, Side::Sell);
            order_id.clone()
        }
        other => panic!("expected order update, got {:?}", other),
    };
    assert_eq!(
        messages[1],
        ServerMessage::PositionUpdate {
            symbol: "GBPUSD".to_string(),
            net_size: -2.5,
        }
    );
    assert!(drain_messages(&mut other_mailbox).is_empty());

    // Only the owner may cancel.
    other.handle_message(ClientMessage::CancelOrder {
        order_id: order_id.clone(),
        correlation_id: None,
    });
    match drain_messages(&mut other_mailbox).as_slice() {
        [ServerMessage::Error { code, .. }] => assert_eq!(*code, ErrorCode::OrderNotFound),
        other => panic!("unexpected {:?}", other),
    }

    owner.handle_message(ClientMessage::CancelOrder {
        order_id,
        correlation_id: Some("cancel-1".to_string()),
    });
    let messages = drain_messages(&mut owner_mailbox);
    assert!(matches!(
        messages.first(),
        Some(ServerMessage::OrderUpdate {
            status: OrderStatus::Cancelled,
            ..
        })
    ));
    assert_eq!(state.orders.open_order_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_readers_and_forces_stalled() {
    let service = FeedService::start(eurusd_config(60_000)).unwrap();
    let registry = service.registry();

    let (reader, mut reader_mailbox) = connect_client(&registry, 32);
    let (stalled, _stalled_mailbox) = connect_client(&registry, 32);
    registry.subscribe(reader, "EURUSD").unwrap();
    registry.subscribe(stalled, "EURUSD").unwrap();
    registry
        .publish(
            "EURUSD",
            &ServerMessage::Subscribed {
                symbol: "EURUSD".to_string(),
            },
        )
        .unwrap();

    let writer = tokio::spawn(async move {
        let mut frames = 0;
        while let Some(outbound) = reader_mailbox.recv().await {
            match outbound {
                Outbound::Frame(_) => frames += 1,
                Outbound::Close => break,
            }
        }
        frames
    });

    let report = service.shutdown().await;
    assert_eq!(report.flushed, 1);
    assert_eq!(report.forced, 1);
    assert_eq!(writer.await.unwrap(), 1);
    assert!(registry.is_empty());
    assert_eq!(registry.channel_count(), 0);
}

#[tokio::test]
async fn test_zero_heartbeat_durations_refused_at_start() {
    let mut config = eurusd_config(1_000);
    config.heartbeat.ping_interval_ms = 0;
    assert!(matches!(
        FeedService::start(config),
        Err(FeedError::Config(_))
    ));

    let mut config = eurusd_config(1_000);
    config.heartbeat.timeout_ms = 0;
    assert!(matches!(
        FeedService::start(config),
        Err(FeedError::Config(_))
    ));
}
