use crate::error::{FeedError, Result};
use crate::models::{ClientMessage, ServerMessage};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// An established connection to the feed server.
#[async_trait]
pub trait Link: Send + 'static {
    async fn send(&mut self, message: &ClientMessage) -> Result<()>;

    /// Next decoded message. `None` once the peer is gone; `Some(Err(_))` for
    /// a message that could not be decoded.
    async fn recv(&mut self) -> Option<Result<ServerMessage>>;

    async fn close(&mut self);
}

/// Opens links. One dial is one connection attempt.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> Result<Box<dyn Link>>;
}

pub struct WsDialer {
    url: String,
    connect_timeout: Duration,
}

impl WsDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self) -> Result<Box<dyn Link>> {
        debug!(url = %self.url, "Dialing");
        match timeout(self.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((stream, response))) => {
                info!(url = %self.url, status = %response.status(), "WebSocket connected");
                Ok(Box::new(WsLink { stream }))
            }
            Ok(Err(e)) => Err(FeedError::Transport(e.to_string())),
            Err(_) => Err(FeedError::Transport(format!(
                "connect timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<ServerMessage>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(&text).map_err(FeedError::from))
                }
                Ok(Message::Close(_)) => return None,
                // Control frames are answered by tungstenite itself.
                Ok(_) => continue,
                Err(e) => {
                    debug!(error = %e, "WebSocket read failed");
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
