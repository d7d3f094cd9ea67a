use crate::config::HeartbeatConfig;
use crate::engine::engine_metrics::FeedMetrics;
use crate::engine::registry::ConnectionRegistry;
use crate::engine::task::Periodic;
use crate::error::FeedError;
use crate::models::ServerMessage;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Pings open connections and evicts the ones that stopped answering.
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    timeout: Duration,
    metrics: FeedMetrics,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<ConnectionRegistry>, config: &HeartbeatConfig) -> Self {
        Self {
            registry,
            timeout: config.timeout(),
            metrics: FeedMetrics::new(),
        }
    }

    /// One monitor cycle. Returns the evicted connection ids.
    ///
    /// Every send is a `try_send`, so a slow client cannot hold up the sweep.
    pub fn check(&self, now: Instant) -> Vec<u64> {
        let (live, stale) = self.registry.sweep(now, self.timeout);

        for &id in &stale {
            let reason = FeedError::Timeout {
                connection_id: id,
                silent_ms: self.timeout.as_millis() as u64,
            };
            info!(connection_id = id, %reason, "Evicting unresponsive connection");
            if let Some(handle) = self.registry.deregister(id) {
                if !self.registry.try_close(&handle) {
                    handle.force_close();
                }
            }
            self.metrics.heartbeat_evictions.increment(1);
        }

        let ping = ServerMessage::ping();
        for (id, handle) in live {
            if !self.registry.try_deliver(&handle, &ping) {
                debug!(connection_id = id, "Ping not deliverable, disconnecting");
                if let Some(handle) = self.registry.deregister(id) {
                    handle.force_close();
                }
            }
        }

        stale
    }
}

#[async_trait]
impl Periodic for HeartbeatMonitor {
    async fn run_cycle(&mut self) {
        self.check(Instant::now());
    }
}
