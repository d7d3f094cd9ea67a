use crate::config::ServerConfig;
use crate::engine::generator::{FeedPublisher, FeedSource, MarketDataGenerator};
use crate::engine::heartbeat::HeartbeatMonitor;
use crate::engine::orders::OrderCommandHandler;
use crate::engine::registry::{ConnectionHandle, ConnectionRegistry, DrainReport, Outbound};
use crate::engine::session::{Session, SessionControl};
use crate::engine::task::PeriodicTask;
use crate::error::{FeedError, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::future::IntoFuture;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub orders: Arc<OrderCommandHandler>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.max_subscriptions));
        let orders = Arc::new(OrderCommandHandler::new(
            registry.clone(),
            config.generator.symbols(),
        ));
        Self {
            registry,
            orders,
            config: Arc::new(config),
        }
    }
}

/// The running distribution core: shared state plus its two periodic tasks.
pub struct FeedService {
    state: AppState,
    publisher: Option<PeriodicTask>,
    heartbeat: Option<PeriodicTask>,
}

impl FeedService {
    pub fn start(config: ServerConfig) -> Result<Self> {
        let generator = MarketDataGenerator::new(config.generator.clone())?;
        Self::start_with_source(config, generator)
    }

    /// Starts the service with any feed in place of the synthetic generator.
    pub fn start_with_source<S: FeedSource>(config: ServerConfig, source: S) -> Result<Self> {
        config.heartbeat.validate()?;
        let state = AppState::new(config);

        let publisher = PeriodicTask::spawn(
            "market-data",
            state.config.generator.tick_interval(),
            FeedPublisher::new(source, state.registry.clone()),
        )?;
        let heartbeat = PeriodicTask::spawn(
            "heartbeat",
            state.config.heartbeat.ping_interval(),
            HeartbeatMonitor::new(state.registry.clone(), &state.config.heartbeat),
        )?;

        Ok(Self {
            state,
            publisher: Some(publisher),
            heartbeat: Some(heartbeat),
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.state.registry.clone()
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    pub async fn stop_publisher(&mut self) {
        if let Some(task) = self.publisher.take() {
            task.stop().await;
        }
    }

    pub async fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.stop().await;
        }
    }

    /// Stops both periodic tasks, then drains every connection.
    pub async fn shutdown(mut self) -> DrainReport {
        info!("Shutting down feed service");
        self.stop_publisher().await;
        self.stop_heartbeat().await;
        self.state
            .registry
            .drain(self.state.config.shutdown_grace())
            .await
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(config: ServerConfig) -> Result<()> {
    let address = format!("0.0.0.0:{}", config.port);
    let service = FeedService::start(config)?;

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| FeedError::Transport(format!("failed to bind {}: {}", address, e)))?;

    info!("Starting market feed server on {}", address);
    info!("Endpoints:");
    info!("  GET  /health");
    info!("  GET  /ws");

    tokio::select! {
        result = axum::serve(listener, service.router()).into_future() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
            info!("Server stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, stopping server.");
        }
    }

    let report = service.shutdown().await;
    info!(
        flushed = report.flushed,
        forced = report.forced,
        "Shutdown complete"
    );
    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (handle, mut mailbox) = ConnectionHandle::channel(state.config.outbound_buffer);
    let mut session = Session::open(
        state.registry.clone(),
        state.orders.clone(),
        handle,
        state.config.max_protocol_errors,
    );
    let id = session.id();
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = mailbox.recv().await {
            match outbound {
                Outbound::Frame(frame) => {
                    if sink.send(Message::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            // Writer ends on eviction, overflow or close marker.
            _ = &mut writer => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if session.handle_text(&text) == SessionControl::Disconnect {
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if session.handle_text(&String::from_utf8_lossy(&bytes)) == SessionControl::Disconnect {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => session.record_pong(),
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(connection_id = id, error = %e, "WebSocket read failed");
                    break;
                }
            },
        }
    }

    session.close();
    info!(connection_id = id, "WebSocket connection closed");
}
