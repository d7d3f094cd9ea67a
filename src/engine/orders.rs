use crate::engine::engine_metrics::FeedMetrics;
use crate::engine::registry::ConnectionRegistry;
use crate::error::ValidationError;
use crate::models::{reply_channel, ConnectionId, ErrorCode, OrderStatus, ServerMessage, Side};
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum OrderKind {
    Place {
        symbol: String,
        side: String,
        size: f64,
    },
    Cancel {
        order_id: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderCommand {
    pub connection_id: ConnectionId,
    pub kind: OrderKind,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone)]
struct OpenOrder {
    connection_id: ConnectionId,
    symbol: String,
    side: Side,
    size: f64,
}

/// Terminal outcome of one command.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Acknowledged { order_id: String },
    Cancelled { order_id: String },
    Rejected(ValidationError),
}

impl OrderOutcome {
    pub fn status(&self) -> OrderStatus {
        match self {
            OrderOutcome::Acknowledged { .. } => OrderStatus::Acknowledged,
            OrderOutcome::Cancelled { .. } => OrderStatus::Cancelled,
            OrderOutcome::Rejected(_) => OrderStatus::Rejected,
        }
    }
}

// A command that passed validation.
enum Validated {
    Place {
        symbol: String,
        side: Side,
        size: f64,
    },
    Cancel {
        order_id: String,
        order: OpenOrder,
    },
}

pub struct OrderCommandHandler {
    registry: Arc<ConnectionRegistry>,
    instruments: HashSet<String>,
    open_orders: SkipMap<String, OpenOrder>,
    // Net open size per (connection, symbol).
    exposure: Mutex<HashMap<(ConnectionId, String), f64>>,
    metrics: FeedMetrics,
}

impl OrderCommandHandler {
    pub fn new(registry: Arc<ConnectionRegistry>, instruments: impl IntoIterator<Item = String>) -> Self {
        Self {
            registry,
            instruments: instruments.into_iter().collect(),
            open_orders: SkipMap::new(),
            exposure: Mutex::new(HashMap::new()),
            metrics: FeedMetrics::new(),
        }
    }

    pub fn is_known(&self, symbol: &str) -> bool {
        self.instruments.contains(symbol)
    }

    pub fn open_order_count(&self) -> usize {
        self.open_orders.len()
    }

    /// RECEIVED -> VALIDATED -> ACKNOWLEDGED | CANCELLED | REJECTED.
    #[instrument(skip(self), fields(connection_id = command.connection_id))]
    pub fn handle(&self, command: OrderCommand) -> OrderOutcome {
        debug!(status = ?OrderStatus::Received, "Order command received");

        let validated = match self.validate(&command) {
            Ok(validated) => validated,
            Err(err) => {
                warn!(code = %err.code, reason = %err.reason, "Order command rejected");
                self.metrics.orders_rejected.increment(1);
                let reply = ServerMessage::error(err.code, err.reason.clone(), command.correlation_id);
                if let Err(e) = self.registry.send_to(command.connection_id, &reply) {
                    debug!(error = %e, "Could not deliver rejection");
                }
                return OrderOutcome::Rejected(err);
            }
        };
        debug!(status = ?OrderStatus::Validated, "Order command validated");

        match validated {
            Validated::Place { symbol, side, size } => {
                let order_id = uuid::Uuid::new_v4().to_string();
                let order = OpenOrder {
                    connection_id: command.connection_id,
                    symbol,
                    side,
                    size,
                };
                self.open_orders.insert(order_id.clone(), order.clone());
                self.metrics.orders_acknowledged.increment(1);
                info!(order_id = %order_id, symbol = %order.symbol, side = %side, size, "Order acknowledged");

                self.notify(&order_id, &order, OrderStatus::Acknowledged, command.correlation_id);
                self.adjust_exposure(&order, order.side.signed(order.size));
                OrderOutcome::Acknowledged { order_id }
            }
            Validated::Cancel { order_id, order } => {
                self.metrics.orders_cancelled.increment(1);
                info!(order_id = %order_id, "Order cancelled");

                self.notify(&order_id, &order, OrderStatus::Cancelled, command.correlation_id);
                self.adjust_exposure(&order, -order.side.signed(order.size));
                OrderOutcome::Cancelled { order_id }
            }
        }
    }

    fn validate(&self, command: &OrderCommand) -> Result<Validated, ValidationError> {
        match &command.kind {
            OrderKind::Place { symbol, side, size } => {
                if !size.is_finite() || *size <= 0.0 {
                    return Err(ValidationError::new(
                        ErrorCode::InvalidSize,
                        "Order size must be positive",
                    ));
                }
                if !self.is_known(symbol) {
                    return Err(ValidationError::new(
                        ErrorCode::UnknownSymbol,
                        format!("Unknown symbol: {}", symbol),
                    ));
                }
                let side = side
                    .parse::<Side>()
                    .map_err(|e| ValidationError::new(ErrorCode::InvalidSide, e))?;
                Ok(Validated::Place {
                    symbol: symbol.clone(),
                    side,
                    size: *size,
                })
            }
            OrderKind::Cancel { order_id } => {
                let owned = self
                    .open_orders
                    .get(order_id)
                    .filter(|entry| entry.value().connection_id == command.connection_id)
                    .is_some();
                // Removal claims the order, so two racing cancels cannot both succeed.
                match owned.then(|| self.open_orders.remove(order_id)).flatten() {
                    Some(entry) => Ok(Validated::Cancel {
                        order_id: order_id.clone(),
                        order: entry.value().clone(),
                    }),
                    None => Err(ValidationError::new(
                        ErrorCode::OrderNotFound,
                        format!("No open order {}", order_id),
                    )),
                }
            }
        }
    }

    fn notify(
        &self,
        order_id: &str,
        order: &OpenOrder,
        status: OrderStatus,
        correlation_id: Option<String>,
    ) {
        let update = ServerMessage::OrderUpdate {
            order_id: order_id.to_string(),
            status,
            correlation_id,
            symbol: order.symbol.clone(),
            side: order.side,
            size: order.size,
        };
        if let Err(e) = self
            .registry
            .publish(&reply_channel(order.connection_id), &update)
        {
            warn!(error = %e, "Failed to publish order update");
        }
    }

    // Accounts are per connection, so positions share the reply channel.
    fn adjust_exposure(&self, order: &OpenOrder, delta: f64) {
        let net_size = {
            let mut exposure = self.exposure.lock();
            let net = exposure
                .entry((order.connection_id, order.symbol.clone()))
                .or_insert(0.0);
            *net += delta;
            *net
        };
        let update = ServerMessage::PositionUpdate {
            symbol: order.symbol.clone(),
            net_size,
        };
        if let Err(e) = self
            .registry
            .publish(&reply_channel(order.connection_id), &update)
        {
            warn!(error = %e, "Failed to publish position update");
        }
    }

    /// Drops everything held for a closed connection.
    pub fn release_connection(&self, connection_id: ConnectionId) {
        let stale: Vec<String> = self
            .open_orders
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect();
        for order_id in &stale {
            self.open_orders.remove(order_id);
        }
        self.exposure
            .lock()
            .retain(|(owner, _), _| *owner != connection_id);
        if !stale.is_empty() {
            debug!(connection_id, released = stale.len(), "Released open orders");
        }
    }
}
