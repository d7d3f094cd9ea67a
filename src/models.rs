use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn signed(&self, size: f64) -> f64 {
        match self {
            Side::Buy => size,
            Side::Sell => -size,
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            _ => Err(format!("Invalid side: {}", s)),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Server-side lifecycle of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketTick {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
    pub cumulative_size: f64,
    /// Share of the side total held at this level.
    pub percentage: f64,
    /// Share of the side total held at this level or better.
    pub cumulative_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderStatus {
    Received,
    Validated,
    Acknowledged,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidSize,
    InvalidSide,
    UnknownSymbol,
    OrderNotFound,
    SubscriptionLimit,
    /// Known message type with a payload that does not decode.
    InvalidRequest,
    ProtocolError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ErrorCode::InvalidSize => "INVALID_SIZE",
            ErrorCode::InvalidSide => "INVALID_SIDE",
            ErrorCode::UnknownSymbol => "UNKNOWN_SYMBOL",
            ErrorCode::OrderNotFound => "ORDER_NOT_FOUND",
            ErrorCode::SubscriptionLimit => "SUBSCRIPTION_LIMIT",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
        };
        f.write_str(code)
    }
}

// Client -> server envelopes. Unknown `type` values fail to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Subscribe {
        symbol: String,
    },
    Unsubscribe {
        symbol: String,
    },
    PlaceOrder {
        symbol: String,
        side: String,
        size: f64,
        #[serde(default)]
        correlation_id: Option<String>,
    },
    CancelOrder {
        order_id: String,
        #[serde(default)]
        correlation_id: Option<String>,
    },
    Ping {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
}

/// Outer `{type, payload}` shell of a client message, decoded first so a bad
/// payload under a known type can be answered.
#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: ClientKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientKind {
    Subscribe,
    Unsubscribe,
    PlaceOrder,
    CancelOrder,
    Ping,
    Pong,
}

impl ClientEnvelope {
    pub fn correlation_id(&self) -> Option<String> {
        self.payload
            .get("correlationId")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    }
}

impl ClientMessage {
    pub fn ping() -> Self {
        ClientMessage::Ping {
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

// Server -> client envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    MarketData(MarketTick),
    OrderBook(OrderBookSnapshot),
    OrderUpdate {
        order_id: String,
        status: OrderStatus,
        correlation_id: Option<String>,
        symbol: String,
        side: Side,
        size: f64,
    },
    PositionUpdate {
        symbol: String,
        net_size: f64,
    },
    Subscribed {
        symbol: String,
    },
    Unsubscribed {
        symbol: String,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
    Ping {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
}

impl ServerMessage {
    pub fn ping() -> Self {
        ServerMessage::Ping {
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn error(
        code: ErrorCode,
        message: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            correlation_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::MarketData(_) => "marketData",
            ServerMessage::OrderBook(_) => "orderBook",
            ServerMessage::OrderUpdate { .. } => "orderUpdate",
            ServerMessage::PositionUpdate { .. } => "positionUpdate",
            ServerMessage::Subscribed { .. } => "subscribed",
            ServerMessage::Unsubscribed { .. } => "unsubscribed",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Ping { .. } => "ping",
            ServerMessage::Pong { .. } => "pong",
        }
    }
}

/// Private channel every connection is subscribed to on registration.
pub fn reply_channel(id: ConnectionId) -> String {
    format!("orders.{}", id)
}
