//! Client side of the feed: a long-lived connection that survives drops.
//!
//! [`Connector::spawn`] starts one task that owns the link and walks the
//! state machine below. Handles are cheap clones that talk to it over a
//! command channel.
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected
//!                               |                  |
//!                             fail          unexpected close
//!                               v                  v
//!                          Reconnecting <----------+
//!                               |
//!                        attempts exhausted --> Failed
//! any state --close--> Closed
//! ```

pub mod queue;
pub mod transport;

use crate::config::ConnectorConfig;
use crate::error::{FeedError, Result};
use crate::models::{ClientMessage, ServerMessage};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

pub use queue::OutboundQueue;
pub use transport::{Dialer, Link, WsDialer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Attempt budget spent. Only a manual reconnect leaves this state.
    Failed,
    Closed,
}

#[derive(Debug)]
pub enum ConnectorEvent {
    Connected,
    /// The live link dropped without being asked to.
    Disconnected,
    Message(ServerMessage),
    Fatal(FeedError),
    Closed,
}

enum Command {
    Connect,
    Subscribe(String),
    Unsubscribe(String),
    Flush,
    Close(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct Connector {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectorState>,
    queue: Arc<OutboundQueue>,
}

impl Connector {
    /// Spawns the connector task in `Disconnected`. Call [`Connector::connect`]
    /// to start dialing.
    pub fn spawn<D: Dialer>(
        config: ConnectorConfig,
        dialer: D,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectorEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectorState::Disconnected);
        let queue = Arc::new(OutboundQueue::new(
            config.queue_capacity,
            config.overflow_policy,
        ));

        let actor = ConnectorActor {
            config,
            dialer: Arc::new(dialer),
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            queue: queue.clone(),
            pending: None,
            subscriptions: BTreeSet::new(),
            close_ack: None,
        };
        tokio::spawn(actor.run());

        (
            Self {
                commands: command_tx,
                state: state_rx,
                queue,
            },
            event_rx,
        )
    }

    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    /// Starts a fresh attempt cycle. The way out of `Failed`.
    pub fn reconnect(&self) -> Result<()> {
        self.connect()
    }

    /// Records the subscription; it is re-sent after every reconnect.
    pub fn subscribe(&self, symbol: impl Into<String>) -> Result<()> {
        self.command(Command::Subscribe(symbol.into()))
    }

    pub fn unsubscribe(&self, symbol: impl Into<String>) -> Result<()> {
        self.command(Command::Unsubscribe(symbol.into()))
    }

    /// Queues `message` for delivery. Sent immediately when connected,
    /// otherwise held until the next successful connect.
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        if self.state() == ConnectorState::Closed {
            return Err(FeedError::Closed);
        }
        self.queue.push(message)?;
        self.command(Command::Flush)
    }

    /// Closes the link and stops the task, cancelling any pending reconnect.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn state(&self) -> ConnectorState {
        *self.state.borrow()
    }

    /// Resolves once the connector reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectorState) -> Result<()> {
        let mut state = self.state.clone();
        loop {
            if *state.borrow_and_update() == target {
                return Ok(());
            }
            if state.changed().await.is_err() {
                return if *state.borrow() == target {
                    Ok(())
                } else {
                    Err(FeedError::Closed)
                };
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| FeedError::Closed)
    }
}

enum Phase {
    Idle,
    /// `retry` counts the waits taken in this cycle; 0 dials at once.
    Dial { attempt: u32, retry: u32 },
    Live(Box<dyn Link>),
    Closed,
}

struct ConnectorActor<D> {
    config: ConnectorConfig,
    dialer: Arc<D>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ConnectorEvent>,
    state: watch::Sender<ConnectorState>,
    queue: Arc<OutboundQueue>,
    /// Taken from the queue but not yet written. Goes out before anything
    /// still queued.
    pending: Option<ClientMessage>,
    subscriptions: BTreeSet<String>,
    close_ack: Option<oneshot::Sender<()>>,
}

impl<D: Dialer> ConnectorActor<D> {
    async fn run(mut self) {
        let mut phase = Phase::Idle;
        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Dial { attempt, retry } => self.dial(attempt, retry).await,
                Phase::Live(link) => self.pump(link).await,
                Phase::Closed => break,
            };
        }

        self.set_state(ConnectorState::Closed);
        self.emit(ConnectorEvent::Closed);
        if let Some(ack) = self.close_ack.take() {
            let _ = ack.send(());
        }
    }

    async fn idle(&mut self) -> Phase {
        loop {
            match self.commands.recv().await {
                Some(Command::Connect) => {
                    return Phase::Dial {
                        attempt: 1,
                        retry: 0,
                    }
                }
                other => {
                    if !self.absorb(other) {
                        return Phase::Closed;
                    }
                }
            }
        }
    }

    async fn dial(&mut self, attempt: u32, retry: u32) -> Phase {
        if retry == 0 {
            self.set_state(ConnectorState::Connecting);
        } else {
            let delay = self.config.backoff(retry);
            self.set_state(ConnectorState::Reconnecting);
            debug!(attempt, ?delay, "Waiting before next connect attempt");
            if self.wait_for(tokio::time::sleep(delay)).await.is_none() {
                return Phase::Closed;
            }
        }

        let dialer = self.dialer.clone();
        let result = match self.wait_for(async move { dialer.dial().await }).await {
            Some(result) => result,
            None => return Phase::Closed,
        };

        match result {
            Ok(link) => self.on_connected(link).await,
            Err(e) if attempt >= self.config.max_attempts => {
                warn!(attempt, error = %e, "Connect failed, giving up");
                self.set_state(ConnectorState::Failed);
                self.emit(ConnectorEvent::Fatal(FeedError::ReconnectExhausted {
                    attempts: attempt,
                }));
                Phase::Idle
            }
            Err(e) => {
                warn!(attempt, error = %e, "Connect failed");
                Phase::Dial {
                    attempt: attempt + 1,
                    retry: retry + 1,
                }
            }
        }
    }

    async fn on_connected(&mut self, mut link: Box<dyn Link>) -> Phase {
        self.set_state(ConnectorState::Connected);
        self.emit(ConnectorEvent::Connected);

        let replay: Vec<String> = self.subscriptions.iter().cloned().collect();
        for symbol in replay {
            if link.send(&ClientMessage::Subscribe { symbol }).await.is_err() {
                return self.lost(link).await;
            }
        }
        if self.flush(link.as_mut()).await.is_err() {
            return self.lost(link).await;
        }
        Phase::Live(link)
    }

    async fn pump(&mut self, mut link: Box<dyn Link>) -> Phase {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let sent = match command {
                        Some(Command::Subscribe(symbol)) => {
                            self.subscriptions.insert(symbol.clone());
                            link.send(&ClientMessage::Subscribe { symbol }).await
                        }
                        Some(Command::Unsubscribe(symbol)) => {
                            self.subscriptions.remove(&symbol);
                            link.send(&ClientMessage::Unsubscribe { symbol }).await
                        }
                        Some(Command::Flush) => self.flush(link.as_mut()).await,
                        Some(Command::Connect) => Ok(()),
                        other => {
                            self.absorb(other);
                            link.close().await;
                            return Phase::Closed;
                        }
                    };
                    if sent.is_err() {
                        return self.lost(link).await;
                    }
                }
                incoming = link.recv() => match incoming {
                    Some(Ok(ServerMessage::Ping { timestamp })) => {
                        if link.send(&ClientMessage::Pong { timestamp }).await.is_err() {
                            return self.lost(link).await;
                        }
                    }
                    Some(Ok(message)) => self.emit(ConnectorEvent::Message(message)),
                    Some(Err(e)) => warn!(error = %e, "Discarding undecodable server message"),
                    None => return self.lost(link).await,
                },
            }
        }
    }

    /// Writes the pending message, then everything queued, in order.
    async fn flush(&mut self, link: &mut dyn Link) -> Result<()> {
        while let Some(message) = self.pending.take().or_else(|| self.queue.pop()) {
            if let Err(e) = link.send(&message).await {
                self.pending = Some(message);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn lost(&mut self, mut link: Box<dyn Link>) -> Phase {
        info!("Connection lost, reconnecting");
        link.close().await;
        self.emit(ConnectorEvent::Disconnected);
        Phase::Dial {
            attempt: 1,
            retry: 1,
        }
    }

    /// Drives `future` while still serving commands. `None` if a close
    /// arrived first.
    async fn wait_for<F: Future>(&mut self, future: F) -> Option<F::Output> {
        tokio::pin!(future);
        loop {
            tokio::select! {
                output = &mut future => return Some(output),
                command = self.commands.recv() => {
                    if !self.absorb(command) {
                        return None;
                    }
                }
            }
        }
    }

    /// Applies a command that needs no link. Returns false on close.
    fn absorb(&mut self, command: Option<Command>) -> bool {
        match command {
            Some(Command::Subscribe(symbol)) => {
                self.subscriptions.insert(symbol);
            }
            Some(Command::Unsubscribe(symbol)) => {
                self.subscriptions.remove(&symbol);
            }
            Some(Command::Connect) | Some(Command::Flush) => {}
            Some(Command::Close(ack)) => {
                self.close_ack = Some(ack);
                return false;
            }
            None => return false,
        }
        true
    }

    fn set_state(&self, state: ConnectorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "Connector state changed");
        }
    }

    fn emit(&self, event: ConnectorEvent) {
        let _ = self.events.send(event);
    }
}
