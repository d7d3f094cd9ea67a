use crate::engine::engine_metrics::FeedMetrics;
use crate::error::{FeedError, Result, ValidationError};
use crate::models::{reply_channel, ConnectionId, ConnectionState, ErrorCode, ServerMessage};
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Frame queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(Arc<str>),
    Close,
}

/// Sending half of a connection's transport, owned by the registry.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Outbound>,
    kill: Arc<Notify>,
}

/// Receiving half, drained by the transport writer.
pub struct Mailbox {
    rx: mpsc::Receiver<Outbound>,
    kill: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn channel(buffer: usize) -> (ConnectionHandle, Mailbox) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let kill = Arc::new(Notify::new());
        (
            ConnectionHandle {
                tx,
                kill: kill.clone(),
            },
            Mailbox { rx, kill },
        )
    }

    fn try_deliver(&self, outbound: Outbound) -> bool {
        self.tx.try_send(outbound).is_ok()
    }

    /// Queues a close marker behind pending frames and waits for the writer to finish.
    async fn flush_and_close(&self) {
        if self.tx.send(Outbound::Close).await.is_ok() {
            self.tx.closed().await;
        }
    }

    /// Stops the writer without draining.
    pub fn force_close(&self) {
        self.kill.notify_one();
    }
}

impl Mailbox {
    pub async fn recv(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            _ = self.kill.notified() => None,
            outbound = self.rx.recv() => outbound,
        }
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    state: ConnectionState,
    last_seen: Instant,
    // Reverse index: every channel this connection appears in.
    subscriptions: HashSet<String>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    channels: HashMap<String, HashSet<ConnectionId>>,
}

impl RegistryInner {
    fn remove(&mut self, id: ConnectionId) -> Option<ConnectionEntry> {
        let mut entry = self.connections.remove(&id)?;
        for channel in &entry.subscriptions {
            if let Some(subscribers) = self.channels.get_mut(channel) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    self.channels.remove(channel);
                }
            }
        }
        entry.state = ConnectionState::Closed;
        Some(entry)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub flushed: usize,
    pub forced: usize,
}

/// Live connections and their channel subscriptions.
///
/// Both maps sit behind one lock so a connection and its subscriptions are
/// always removed together. The lock is never held while sending.
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    next_id: AtomicU64,
    max_subscriptions: usize,
    metrics: FeedMetrics,
}

impl ConnectionRegistry {
    pub fn new(max_subscriptions: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            next_id: AtomicU64::new(1),
            max_subscriptions,
            metrics: FeedMetrics::new(),
        }
    }

    pub fn register(&self, handle: ConnectionHandle) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let reply = reply_channel(id);

        let mut inner = self.inner.write();
        inner
            .channels
            .entry(reply.clone())
            .or_default()
            .insert(id);
        inner.connections.insert(
            id,
            ConnectionEntry {
                handle,
                state: ConnectionState::Open,
                last_seen: Instant::now(),
                subscriptions: HashSet::from([reply]),
            },
        );
        self.metrics
            .connections_open
            .set(inner.connections.len() as f64);
        drop(inner);

        info!(connection_id = id, "Connection registered");
        id
    }

    /// Returns `Ok(false)` if the connection was already subscribed.
    pub fn subscribe(&self, id: ConnectionId, channel: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let entry = inner
            .connections
            .get_mut(&id)
            .ok_or_else(|| unknown_connection(id))?;

        if entry.subscriptions.contains(channel) {
            return Ok(false);
        }
        // The private reply channel does not count against the cap.
        if entry.subscriptions.len().saturating_sub(1) >= self.max_subscriptions {
            return Err(ValidationError::new(
                ErrorCode::SubscriptionLimit,
                format!("Max subscriptions ({}) reached", self.max_subscriptions),
            )
            .into());
        }

        entry.subscriptions.insert(channel.to_string());
        inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(id);
        debug!(connection_id = id, channel, "Subscribed");
        Ok(true)
    }

    /// Returns `false` if there was nothing to remove.
    /// The connection's own reply channel cannot be left.
    pub fn unsubscribe(&self, id: ConnectionId, channel: &str) -> bool {
        if channel == reply_channel(id) {
            return false;
        }
        let mut inner = self.inner.write();
        let removed = match inner.connections.get_mut(&id) {
            Some(entry) => entry.subscriptions.remove(channel),
            None => false,
        };
        if removed {
            if let Some(subscribers) = inner.channels.get_mut(channel) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    inner.channels.remove(channel);
                }
            }
            debug!(connection_id = id, channel, "Unsubscribed");
        }
        removed
    }

    /// Fans a message out to the current subscribers of `channel`.
    ///
    /// Subscribers whose buffer is full or whose transport is gone are
    /// deregistered after the fan-out; the rest still receive the message.
    /// Returns the number of connections the message was queued for.
    pub fn publish(&self, channel: &str, message: &ServerMessage) -> Result<usize> {
        let targets: Vec<(ConnectionId, ConnectionHandle)> = {
            let inner = self.inner.read();
            match inner.channels.get(channel) {
                Some(subscribers) => subscribers
                    .iter()
                    .filter_map(|id| {
                        inner
                            .connections
                            .get(id)
                            .map(|entry| (*id, entry.handle.clone()))
                    })
                    .collect(),
                None => return Ok(0),
            }
        };
        if targets.is_empty() {
            return Ok(0);
        }

        let frame: Arc<str> = serde_json::to_string(message)?.into();
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, handle) in &targets {
            if handle.try_deliver(Outbound::Frame(frame.clone())) {
                delivered += 1;
            } else {
                failed.push(*id);
            }
        }
        self.metrics.messages_published.increment(delivered as u64);

        for id in failed {
            warn!(connection_id = id, channel, "Slow or broken consumer, disconnecting");
            self.metrics.slow_consumer_disconnects.increment(1);
            if let Some(handle) = self.deregister(id) {
                handle.force_close();
            }
        }

        Ok(delivered)
    }

    /// Sends directly to one connection, bypassing channels.
    pub fn send_to(&self, id: ConnectionId, message: &ServerMessage) -> Result<()> {
        let handle = self
            .inner
            .read()
            .connections
            .get(&id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| unknown_connection(id))?;

        let frame: Arc<str> = serde_json::to_string(message)?.into();
        if handle.try_deliver(Outbound::Frame(frame)) {
            return Ok(());
        }

        warn!(connection_id = id, "Direct send failed, disconnecting");
        self.metrics.slow_consumer_disconnects.increment(1);
        if let Some(handle) = self.deregister(id) {
            handle.force_close();
        }
        Err(FeedError::Connection {
            connection_id: id,
            reason: "outbound buffer full or closed".to_string(),
        })
    }

    /// Removes the connection and all of its subscriptions.
    ///
    /// Cost is proportional to the connection's own subscriptions.
    pub fn deregister(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let mut inner = self.inner.write();
        let entry = inner.remove(id)?;
        self.metrics
            .connections_open
            .set(inner.connections.len() as f64);
        drop(inner);

        debug!(
            connection_id = id,
            subscriptions = entry.subscriptions.len(),
            "Connection deregistered"
        );
        Some(entry.handle)
    }

    pub fn record_pong(&self, id: ConnectionId) {
        if let Some(entry) = self.inner.write().connections.get_mut(&id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Splits open connections into live ones and ones silent past `timeout`.
    /// Silent connections are moved to `Closing`.
    ///
    /// The scan runs under the read lock; the write lock is taken only to mark
    /// the silent ones, rechecking each in case a pong landed in between.
    pub(crate) fn sweep(
        &self,
        now: Instant,
        timeout: Duration,
    ) -> (Vec<(ConnectionId, ConnectionHandle)>, Vec<ConnectionId>) {
        let silent = |last_seen: Instant| now.saturating_duration_since(last_seen) >= timeout;

        let mut live = Vec::new();
        let mut candidates = Vec::new();
        {
            let inner = self.inner.read();
            for (id, entry) in inner.connections.iter() {
                if entry.state != ConnectionState::Open {
                    continue;
                }
                if silent(entry.last_seen) {
                    candidates.push((*id, entry.handle.clone()));
                } else {
                    live.push((*id, entry.handle.clone()));
                }
            }
        }
        if candidates.is_empty() {
            return (live, Vec::new());
        }

        let mut stale = Vec::with_capacity(candidates.len());
        let mut inner = self.inner.write();
        for (id, handle) in candidates {
            match inner.connections.get_mut(&id) {
                Some(entry) if entry.state == ConnectionState::Open => {
                    if silent(entry.last_seen) {
                        entry.state = ConnectionState::Closing;
                        stale.push(id);
                    } else {
                        live.push((id, handle));
                    }
                }
                _ => {}
            }
        }
        (live, stale)
    }

    pub(crate) fn try_deliver(&self, handle: &ConnectionHandle, message: &ServerMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(frame) => handle.try_deliver(Outbound::Frame(frame.into())),
            Err(_) => false,
        }
    }

    pub(crate) fn try_close(&self, handle: &ConnectionHandle) -> bool {
        handle.try_deliver(Outbound::Close)
    }

    /// Empties the registry, giving each connection `grace` to flush what is
    /// already queued before it is force-closed.
    pub async fn drain(&self, grace: Duration) -> DrainReport {
        let handles: Vec<(ConnectionId, ConnectionHandle)> = {
            let mut inner = self.inner.write();
            inner.channels.clear();
            inner
                .connections
                .drain()
                .map(|(id, entry)| (id, entry.handle))
                .collect()
        };
        self.metrics.connections_open.set(0.0);

        let outcomes = join_all(handles.into_iter().map(|(id, handle)| async move {
            let flushed = tokio::time::timeout(grace, handle.flush_and_close())
                .await
                .is_ok();
            if !flushed {
                warn!(connection_id = id, "Connection did not drain in time, forcing close");
                handle.force_close();
            }
            flushed
        }))
        .await;

        let flushed = outcomes.iter().filter(|ok| **ok).count();
        let report = DrainReport {
            flushed,
            forced: outcomes.len() - flushed,
        };
        info!(flushed = report.flushed, forced = report.forced, "Registry drained");
        report
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.read().connections.contains_key(&id)
    }

    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.inner.read().connections.get(&id).map(|entry| entry.state)
    }

    pub fn subscribers(&self, channel: &str) -> Vec<ConnectionId> {
        self.inner
            .read()
            .channels
            .get(channel)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn subscriptions(&self, id: ConnectionId) -> Vec<String> {
        self.inner
            .read()
            .connections
            .get(&id)
            .map(|entry| entry.subscriptions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channel_count(&self) -> usize {
        self.inner.read().channels.len()
    }
}

fn unknown_connection(id: ConnectionId) -> FeedError {
    FeedError::Connection {
        connection_id: id,
        reason: "not registered".to_string(),
    }
}
