#![allow(dead_code)]

use async_trait::async_trait;
use marketfeed::config::{ConnectorConfig, GeneratorConfig, ServerConfig};
use marketfeed::connector::{Dialer, Link};
use marketfeed::engine::registry::{ConnectionHandle, ConnectionRegistry, Mailbox, Outbound};
use marketfeed::error::{FeedError, Result};
use marketfeed::models::{ClientMessage, ConnectionId, ServerMessage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub fn eurusd_config(tick_interval_ms: u64) -> ServerConfig {
    ServerConfig {
        generator: GeneratorConfig {
            instruments: vec![("EURUSD".to_string(), 1.0850)],
            tick_interval_ms,
            ..GeneratorConfig::default()
        },
        ..ServerConfig::default()
    }
}

pub fn connector_config(max_attempts: u32) -> ConnectorConfig {
    ConnectorConfig {
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        max_attempts,
        ..ConnectorConfig::default()
    }
}

/// Registers a bare connection and returns its id and mailbox.
pub fn connect_client(registry: &ConnectionRegistry, buffer: usize) -> (ConnectionId, Mailbox) {
    let (handle, mailbox) = ConnectionHandle::channel(buffer);
    (registry.register(handle), mailbox)
}

/// Everything currently queued for a connection, decoded. Stops at a close marker.
pub fn drain_messages(mailbox: &mut Mailbox) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Some(outbound) = mailbox.try_recv() {
        match outbound {
            Outbound::Frame(frame) => messages.push(serde_json::from_str(&frame).unwrap()),
            Outbound::Close => break,
        }
    }
    messages
}

struct MockState {
    dials: u32,
    dialed_at: Vec<Instant>,
    failures_remaining: u32,
    sent: mpsc::UnboundedSender<ClientMessage>,
    live: Option<(mpsc::UnboundedSender<ServerMessage>, Arc<AtomicBool>)>,
}

/// In-memory stand-in for the feed server.
pub struct MockServer {
    state: Arc<Mutex<MockState>>,
    pub sent: mpsc::UnboundedReceiver<ClientMessage>,
}

pub struct MockDialer {
    state: Arc<Mutex<MockState>>,
}

pub fn mock_dialer() -> (MockDialer, MockServer) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let state = Arc::new(Mutex::new(MockState {
        dials: 0,
        dialed_at: Vec::new(),
        failures_remaining: 0,
        sent: sent_tx,
        live: None,
    }));
    (
        MockDialer {
            state: state.clone(),
        },
        MockServer {
            state,
            sent: sent_rx,
        },
    )
}

impl MockServer {
    pub fn dials(&self) -> u32 {
        self.state.lock().dials
    }

    /// When each dial happened, oldest first.
    pub fn dialed_at(&self) -> Vec<Instant> {
        self.state.lock().dialed_at.clone()
    }

    pub fn fail_next(&self, count: u32) {
        self.state.lock().failures_remaining = count;
    }

    pub fn fail_always(&self) {
        self.fail_next(u32::MAX);
    }

    /// Kills the live link as if the server went away.
    pub fn drop_link(&self) {
        if let Some((_, closed)) = self.state.lock().live.take() {
            closed.store(true, Ordering::SeqCst);
        }
    }

    pub fn push(&self, message: ServerMessage) {
        if let Some((tx, _)) = self.state.lock().live.as_ref() {
            let _ = tx.send(message);
        }
    }

    pub async fn next_sent(&mut self) -> ClientMessage {
        self.sent.recv().await.unwrap()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self) -> Result<Box<dyn Link>> {
        let mut state = self.state.lock();
        state.dials += 1;
        state.dialed_at.push(Instant::now());
        if state.failures_remaining > 0 {
            state.failures_remaining = state.failures_remaining.saturating_sub(1);
            return Err(FeedError::Transport("connection refused".to_string()));
        }

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        state.live = Some((incoming_tx, closed.clone()));
        Ok(Box::new(MockLink {
            sent: state.sent.clone(),
            incoming: incoming_rx,
            closed,
        }))
    }
}

struct MockLink {
    sent: mpsc::UnboundedSender<ClientMessage>,
    incoming: mpsc::UnboundedReceiver<ServerMessage>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Link for MockLink {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FeedError::Transport("link closed".to_string()));
        }
        self.sent
            .send(message.clone())
            .map_err(|_| FeedError::Transport("server gone".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<ServerMessage>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
