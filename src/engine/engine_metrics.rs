use metrics::{register_counter, register_gauge, Counter, Gauge};

#[derive(Clone)]
pub struct FeedMetrics {
    pub connections_open: Gauge,
    pub messages_published: Counter,
    pub slow_consumer_disconnects: Counter,
    pub heartbeat_evictions: Counter,
    pub protocol_errors: Counter,
    pub orders_acknowledged: Counter,
    pub orders_rejected: Counter,
    pub orders_cancelled: Counter,
}

impl Default for FeedMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self {
            connections_open: register_gauge!("marketfeed_connections_open"),
            messages_published: register_counter!("marketfeed_messages_published_total"),
            slow_consumer_disconnects: register_counter!(
                "marketfeed_slow_consumer_disconnects_total"
            ),
            heartbeat_evictions: register_counter!("marketfeed_heartbeat_evictions_total"),
            protocol_errors: register_counter!("marketfeed_protocol_errors_total"),
            orders_acknowledged: register_counter!("marketfeed_orders_acknowledged_total"),
            orders_rejected: register_counter!("marketfeed_orders_rejected_total"),
            orders_cancelled: register_counter!("marketfeed_orders_cancelled_total"),
        }
    }
}
