use crate::error::{FeedError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Symbols and their baseline mid prices.
    pub instruments: Vec<(String, f64)>,
    pub tick_interval_ms: u64,
    /// Max step per tick as a fraction of baseline.
    pub volatility: f64,
    /// Mid is clamped to baseline * (1 +/- band).
    pub band: f64,
    pub spread_fraction: f64,
    pub book_levels: usize,
    /// Distance between rungs as a fraction of baseline.
    pub level_step_fraction: f64,
    pub min_level_size: f64,
    pub max_level_size: f64,
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            instruments: vec![
                ("EURUSD".to_string(), 1.0850),
                ("GBPUSD".to_string(), 1.2700),
                ("USDJPY".to_string(), 149.50),
                ("BTCUSD".to_string(), 50000.0),
            ],
            tick_interval_ms: 1000,
            volatility: 0.0005,
            band: 0.02,
            spread_fraction: 0.0001,
            book_levels: 10,
            level_step_fraction: 0.0001,
            min_level_size: 0.1,
            max_level_size: 10.0,
            seed: 42,
        }
    }
}

impl GeneratorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.instruments.iter().map(|(s, _)| s.clone()).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub ping_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 30_000,
            timeout_ms: 60_000,
        }
    }
}

impl HeartbeatConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ping_interval_ms == 0 {
            return Err(FeedError::Config(
                "heartbeat ping interval must be non-zero".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(FeedError::Config(
                "heartbeat timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Per-connection outbound buffer. Overflow disconnects the client.
    pub outbound_buffer: usize,
    pub max_subscriptions: usize,
    /// Unparsable messages tolerated before the connection is dropped.
    pub max_protocol_errors: u32,
    pub shutdown_grace_ms: u64,
    pub generator: GeneratorConfig,
    pub heartbeat: HeartbeatConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            outbound_buffer: 256,
            max_subscriptions: 50,
            max_protocol_errors: 5,
            shutdown_grace_ms: 2_000,
            generator: GeneratorConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            FeedError::Config(format!(
                "cannot read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum OverflowPolicy {
    DropOldest,
    RejectNew,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub url: String,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Dials per connection cycle before giving up.
    pub max_attempts: u32,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/ws".to_string(),
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_attempts: 10,
            queue_capacity: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

impl ConnectorConfig {
    /// Delay before the given retry (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let ms = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = ConnectorConfig {
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1_000,
            ..ConnectorConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(4), Duration::from_millis(800));
        assert_eq!(config.backoff(5), Duration::from_millis(1_000));
        assert_eq!(config.backoff(30), Duration::from_millis(1_000));
    }

    #[test]
    fn test_heartbeat_rejects_zero_durations() {
        assert!(HeartbeatConfig::default().validate().is_ok());
        let no_ping = HeartbeatConfig {
            ping_interval_ms: 0,
            ..HeartbeatConfig::default()
        };
        assert!(matches!(no_ping.validate(), Err(FeedError::Config(_))));
        let no_timeout = HeartbeatConfig {
            timeout_ms: 0,
            ..HeartbeatConfig::default()
        };
        assert!(matches!(no_timeout.validate(), Err(FeedError::Config(_))));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"port": 9000, "heartbeat": {"timeout_ms": 5000}}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.heartbeat.timeout_ms, 5000);
        assert_eq!(config.heartbeat.ping_interval_ms, 30_000);
        assert_eq!(config.generator.book_levels, 10);
    }
}
