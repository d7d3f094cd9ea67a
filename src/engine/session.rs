use crate::engine::engine_metrics::FeedMetrics;
use crate::engine::orders::{OrderCommand, OrderCommandHandler, OrderKind};
use crate::engine::registry::{ConnectionHandle, ConnectionRegistry};
use crate::error::{FeedError, Result};
use crate::models::{
    reply_channel, ClientEnvelope, ClientMessage, ConnectionId, ErrorCode, ServerMessage,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    Continue,
    Disconnect,
}

/// Inbound side of one connection, independent of the transport.
pub struct Session {
    id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
    orders: Arc<OrderCommandHandler>,
    max_protocol_errors: u32,
    protocol_errors: u32,
    metrics: FeedMetrics,
}

impl Session {
    /// Registers the connection and returns its session.
    pub fn open(
        registry: Arc<ConnectionRegistry>,
        orders: Arc<OrderCommandHandler>,
        handle: ConnectionHandle,
        max_protocol_errors: u32,
    ) -> Self {
        let id = registry.register(handle);
        Self {
            id,
            registry,
            orders,
            max_protocol_errors,
            protocol_errors: 0,
            metrics: FeedMetrics::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Unknown or missing `type` counts as a protocol error. A known type
    /// whose payload fails to decode is answered with `INVALID_REQUEST`.
    pub fn handle_text(&mut self, text: &str) -> SessionControl {
        let envelope = match serde_json::from_str::<ClientEnvelope>(text) {
            Ok(envelope) => envelope,
            Err(e) => return self.protocol_error(FeedError::Protocol(e.to_string())),
        };
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle_message(message),
            Err(e) => {
                debug!(connection_id = self.id, kind = ?envelope.kind, error = %e, "Invalid payload");
                let reply = self.reply(ServerMessage::error(
                    ErrorCode::InvalidRequest,
                    format!("Invalid {:?} payload: {}", envelope.kind, e),
                    envelope.correlation_id(),
                ));
                self.control(reply)
            }
        }
    }

    pub fn handle_message(&mut self, message: ClientMessage) -> SessionControl {
        let result = match message {
            ClientMessage::Subscribe { symbol } => self.subscribe(symbol),
            ClientMessage::Unsubscribe { symbol } => self.unsubscribe(symbol),
            ClientMessage::PlaceOrder {
                symbol,
                side,
                size,
                correlation_id,
            } => {
                self.orders.handle(OrderCommand {
                    connection_id: self.id,
                    kind: OrderKind::Place { symbol, side, size },
                    correlation_id,
                });
                Ok(())
            }
            ClientMessage::CancelOrder {
                order_id,
                correlation_id,
            } => {
                self.orders.handle(OrderCommand {
                    connection_id: self.id,
                    kind: OrderKind::Cancel { order_id },
                    correlation_id,
                });
                Ok(())
            }
            ClientMessage::Ping { timestamp } => self.reply(ServerMessage::Pong { timestamp }),
            ClientMessage::Pong { .. } => {
                self.registry.record_pong(self.id);
                Ok(())
            }
        };

        self.control(result)
    }

    fn control(&self, result: Result<()>) -> SessionControl {
        match result {
            Ok(()) => SessionControl::Continue,
            Err(e) => {
                debug!(connection_id = self.id, error = %e, "Reply failed");
                SessionControl::Disconnect
            }
        }
    }

    /// Transport-level pong frame.
    pub fn record_pong(&self) {
        self.registry.record_pong(self.id);
    }

    fn subscribe(&mut self, symbol: String) -> Result<()> {
        if !self.orders.is_known(&symbol) {
            return self.reply(ServerMessage::error(
                ErrorCode::UnknownSymbol,
                format!("Unknown symbol: {}", symbol),
                None,
            ));
        }
        match self.registry.subscribe(self.id, &symbol) {
            Ok(_) => self.reply(ServerMessage::Subscribed { symbol }),
            Err(FeedError::Validation(err)) => {
                self.reply(ServerMessage::error(err.code, err.reason, None))
            }
            Err(e) => Err(e),
        }
    }

    fn unsubscribe(&mut self, symbol: String) -> Result<()> {
        if !self.orders.is_known(&symbol) || symbol == reply_channel(self.id) {
            return self.reply(ServerMessage::error(
                ErrorCode::UnknownSymbol,
                format!("Unknown symbol: {}", symbol),
                None,
            ));
        }
        self.registry.unsubscribe(self.id, &symbol);
        self.reply(ServerMessage::Unsubscribed { symbol })
    }

    fn protocol_error(&mut self, error: FeedError) -> SessionControl {
        self.protocol_errors += 1;
        self.metrics.protocol_errors.increment(1);
        warn!(
            connection_id = self.id,
            count = self.protocol_errors,
            %error,
            "Discarding unparsable message"
        );
        if self.protocol_errors > self.max_protocol_errors {
            info!(connection_id = self.id, "Protocol error threshold exceeded");
            SessionControl::Disconnect
        } else {
            SessionControl::Continue
        }
    }

    fn reply(&self, message: ServerMessage) -> Result<()> {
        self.registry.send_to(self.id, &message)
    }

    /// Removes the connection from the registry and releases its orders.
    pub fn close(self) {
        self.registry.deregister(self.id);
        self.orders.release_connection(self.id);
        debug!(connection_id = self.id, "Session closed");
    }
}
