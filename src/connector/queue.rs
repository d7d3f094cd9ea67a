use crate::config::OverflowPolicy;
use crate::error::{FeedError, Result};
use crate::models::ClientMessage;
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Bounded FIFO of messages waiting for a live connection.
///
/// Shared between connector handles (producers) and the connector task
/// (single consumer).
pub struct OutboundQueue {
    items: ArrayQueue<ClientMessage>,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            items: ArrayQueue::new(capacity.max(1)),
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, message: ClientMessage) -> Result<()> {
        match self.policy {
            OverflowPolicy::DropOldest => {
                if let Some(evicted) = self.items.force_push(message) {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(?evicted, dropped, "Outbound queue full, dropped oldest message");
                }
                Ok(())
            }
            OverflowPolicy::RejectNew => self.items.push(message).map_err(|_| {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                FeedError::QueueFull {
                    capacity: self.items.capacity(),
                }
            }),
        }
    }

    pub fn pop(&self) -> Option<ClientMessage> {
        self.items.pop()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Messages lost to the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
