use crate::config::{ConnectorConfig, OverflowPolicy, ServerConfig};
use crate::connector::{Connector, ConnectorEvent, WsDialer};
use crate::error::{FeedError, Result};
use crate::server::start_server;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the feed server
    Serve {
        /// JSON file with a full or partial server configuration
        #[clap(short, long)]
        config: Option<PathBuf>,
        #[clap(short, long)]
        port: Option<u16>,
        #[clap(long)]
        seed: Option<u64>,
        #[clap(long)]
        tick_ms: Option<u64>,
        /// Expose Prometheus metrics on this port
        #[clap(long)]
        metrics_port: Option<u16>,
    },
    /// Connect to a feed server and print everything it sends
    Connect {
        #[clap(short, long, default_value = "ws://127.0.0.1:3000/ws")]
        url: String,
        #[clap(short, long)]
        symbol: Vec<String>,
        #[clap(long)]
        max_attempts: Option<u32>,
        /// Reject sends when the outbound queue is full instead of dropping the oldest
        #[clap(long)]
        reject_new: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

pub async fn run_cli() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            port,
            seed,
            tick_ms,
            metrics_port,
        } => {
            let mut server_config = match config {
                Some(path) => ServerConfig::from_file(path)?,
                None => ServerConfig::default(),
            };
            if let Some(port) = port {
                server_config.port = port;
            }
            if let Some(seed) = seed {
                server_config.generator.seed = seed;
            }
            if let Some(tick_ms) = tick_ms {
                server_config.generator.tick_interval_ms = tick_ms;
            }

            if let Some(metrics_port) = metrics_port {
                PrometheusBuilder::new()
                    .with_http_listener(([0, 0, 0, 0], metrics_port))
                    .install()
                    .map_err(|e| {
                        FeedError::Config(format!("failed to install Prometheus recorder: {}", e))
                    })?;
                info!(metrics_port, "Prometheus exporter listening");
            }

            start_server(server_config).await
        }
        Commands::Connect {
            url,
            symbol,
            max_attempts,
            reject_new,
        } => {
            info!(url = %url, "Starting connector");
            let mut config = ConnectorConfig {
                url,
                ..ConnectorConfig::default()
            };
            if let Some(max_attempts) = max_attempts {
                config.max_attempts = max_attempts;
            }
            if reject_new {
                config.overflow_policy = OverflowPolicy::RejectNew;
            }

            let dialer = WsDialer::new(config.url.clone());
            let (connector, mut events) = Connector::spawn(config, dialer);
            for symbol in symbol {
                connector.subscribe(symbol)?;
            }
            connector.connect()?;

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(ConnectorEvent::Message(message)) => {
                            println!("{}", serde_json::to_string(&message)?);
                        }
                        Some(ConnectorEvent::Fatal(e)) => {
                            warn!(error = %e, "Connector gave up");
                            connector.close().await;
                            return Err(e);
                        }
                        Some(ConnectorEvent::Closed) | None => break,
                        Some(event) => info!(?event, "Connector event"),
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted, closing connector");
                        connector.close().await;
                        break;
                    }
                }
            }
            Ok(())
        }
    }
}
