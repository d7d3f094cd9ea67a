use crate::error::{FeedError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// One unit of work run on a fixed cadence.
#[async_trait]
pub trait Periodic: Send + 'static {
    async fn run_cycle(&mut self);
}

/// A spawned periodic job that can be stopped on its own.
pub struct PeriodicTask {
    name: &'static str,
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// The first cycle runs one `period` after spawning. A zero period is
    /// rejected before anything is spawned.
    pub fn spawn<P: Periodic>(name: &'static str, period: Duration, mut job: P) -> Result<Self> {
        if period.is_zero() {
            return Err(FeedError::Config(format!("{} period must be non-zero", name)));
        }
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => job.run_cycle().await,
                }
            }
            info!(task = name, "Periodic task stopped");
        });

        Ok(Self {
            name,
            stop_tx,
            handle,
        })
    }

    pub async fn stop(self) {
        debug!(task = self.name, "Stopping periodic task");
        let _ = self.stop_tx.send(());
        let _ = self.handle.await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
