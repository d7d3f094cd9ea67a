//! Synthetic market data.
//!
//! Each symbol carries its last mid forward between ticks, so prices move as a
//! bounded random walk around the configured baseline rather than jumping.

use crate::config::GeneratorConfig;
use crate::engine::registry::ConnectionRegistry;
use crate::engine::task::Periodic;
use crate::error::{FeedError, Result};
use crate::models::{BookLevel, MarketTick, OrderBookSnapshot, ServerMessage};
use async_trait::async_trait;
use chrono::Utc;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tracing::{trace, warn};

#[derive(Debug, Clone)]
pub enum FeedEvent {
    Tick(MarketTick),
    Book(OrderBookSnapshot),
}

impl FeedEvent {
    pub fn symbol(&self) -> &str {
        match self {
            FeedEvent::Tick(tick) => &tick.symbol,
            FeedEvent::Book(book) => &book.symbol,
        }
    }

    pub fn into_message(self) -> ServerMessage {
        match self {
            FeedEvent::Tick(tick) => ServerMessage::MarketData(tick),
            FeedEvent::Book(book) => ServerMessage::OrderBook(book),
        }
    }
}

/// Anything that yields ticks/books on demand. An external price feed can
/// stand in for the generator here.
#[async_trait]
pub trait FeedSource: Send + 'static {
    async fn next_events(&mut self) -> Vec<FeedEvent>;
}

#[derive(Debug, Clone)]
struct InstrumentState {
    symbol: String,
    baseline: f64,
    mid: f64,
    high: f64,
    low: f64,
    volume: f64,
}

pub struct MarketDataGenerator {
    config: GeneratorConfig,
    rng: ChaCha8Rng,
    instruments: Vec<InstrumentState>,
}

impl MarketDataGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self::with_rng(config, rng)
    }

    pub fn with_rng(config: GeneratorConfig, rng: ChaCha8Rng) -> Result<Self> {
        validate(&config)?;
        let instruments = config
            .instruments
            .iter()
            .map(|(symbol, baseline)| InstrumentState {
                symbol: symbol.clone(),
                baseline: *baseline,
                mid: *baseline,
                high: *baseline,
                low: *baseline,
                volume: 0.0,
            })
            .collect();

        Ok(Self {
            config,
            rng,
            instruments,
        })
    }

    pub fn symbols(&self) -> Vec<String> {
        self.instruments.iter().map(|i| i.symbol.clone()).collect()
    }

    pub fn mid(&self, symbol: &str) -> Option<f64> {
        self.instruments
            .iter()
            .find(|i| i.symbol == symbol)
            .map(|i| i.mid)
    }

    /// Advances the symbol's mid by one bounded step and returns the tick.
    pub fn next_tick(&mut self, symbol: &str) -> Option<MarketTick> {
        let index = self.index_of(symbol)?;
        Some(self.advance(index))
    }

    /// Builds a book around the symbol's current mid.
    pub fn order_book(&mut self, symbol: &str) -> Option<OrderBookSnapshot> {
        let index = self.index_of(symbol)?;
        Some(self.book_at(index))
    }

    fn index_of(&self, symbol: &str) -> Option<usize> {
        self.instruments.iter().position(|i| i.symbol == symbol)
    }

    fn advance(&mut self, index: usize) -> MarketTick {
        let volatility = self.config.volatility;
        let band = self.config.band;
        let spread_fraction = self.config.spread_fraction;
        let step_unit: f64 = self.rng.gen_range(-1.0..=1.0);
        let traded: f64 = self.rng.gen_range(0.0..=self.config.max_level_size * 10.0);

        let state = &mut self.instruments[index];
        let floor = state.baseline * (1.0 - band);
        let ceiling = state.baseline * (1.0 + band);
        state.mid = (state.mid + step_unit * volatility * state.baseline).clamp(floor, ceiling);
        state.high = state.high.max(state.mid);
        state.low = state.low.min(state.mid);
        state.volume += traded;

        let half_spread = state.baseline * spread_fraction / 2.0;
        trace!(symbol = %state.symbol, mid = state.mid, "Tick generated");

        MarketTick {
            symbol: state.symbol.clone(),
            bid: state.mid - half_spread,
            ask: state.mid + half_spread,
            last: state.mid,
            high: state.high,
            low: state.low,
            volume: state.volume,
            timestamp: Utc::now(),
        }
    }

    fn book_at(&mut self, index: usize) -> OrderBookSnapshot {
        let levels = self.config.book_levels;
        let (symbol, baseline, mid) = {
            let state = &self.instruments[index];
            (state.symbol.clone(), state.baseline, state.mid)
        };
        let half_spread = baseline * self.config.spread_fraction / 2.0;
        let step = baseline * self.config.level_step_fraction;
        let best_bid = mid - half_spread;
        let best_ask = mid + half_spread;

        let bid_rungs: Vec<(f64, f64)> = (0..levels)
            .map(|i| (best_bid - i as f64 * step, self.level_size()))
            .collect();
        let ask_rungs: Vec<(f64, f64)> = (0..levels)
            .map(|i| (best_ask + i as f64 * step, self.level_size()))
            .collect();

        OrderBookSnapshot {
            symbol,
            bids: build_side(&bid_rungs),
            asks: build_side(&ask_rungs),
            timestamp: Utc::now(),
        }
    }

    fn level_size(&mut self) -> f64 {
        self.rng
            .gen_range(self.config.min_level_size..=self.config.max_level_size)
    }
}

#[async_trait]
impl FeedSource for MarketDataGenerator {
    async fn next_events(&mut self) -> Vec<FeedEvent> {
        let mut events = Vec::with_capacity(self.instruments.len() * 2);
        for index in 0..self.instruments.len() {
            events.push(FeedEvent::Tick(self.advance(index)));
            events.push(FeedEvent::Book(self.book_at(index)));
        }
        events
    }
}

/// Accumulates sizes best-first into book levels.
///
/// Percentages are zero when the side holds no size.
pub fn build_side(rungs: &[(f64, f64)]) -> Vec<BookLevel> {
    let total: f64 = rungs.iter().map(|(_, size)| size).sum();
    let mut cumulative = 0.0;

    rungs
        .iter()
        .map(|&(price, size)| {
            cumulative += size;
            let (percentage, cumulative_percentage) = if total > 0.0 {
                (size / total * 100.0, cumulative / total * 100.0)
            } else {
                (0.0, 0.0)
            };
            BookLevel {
                price,
                size,
                cumulative_size: cumulative,
                percentage,
                cumulative_percentage,
            }
        })
        .collect()
}

fn validate(config: &GeneratorConfig) -> Result<()> {
    let invalid = |reason: &str| Err(FeedError::Config(reason.to_string()));

    if config.instruments.is_empty() {
        return invalid("at least one instrument is required");
    }
    if config.instruments.iter().any(|(_, baseline)| *baseline <= 0.0) {
        return invalid("baseline prices must be positive");
    }
    if !(0.0..1.0).contains(&config.band) {
        return invalid("band must be in [0, 1)");
    }
    if config.volatility < 0.0 || config.spread_fraction < 0.0 {
        return invalid("volatility and spread must be non-negative");
    }
    if config.level_step_fraction <= 0.0 {
        return invalid("level step must be positive");
    }
    if config.min_level_size <= 0.0 || config.min_level_size > config.max_level_size {
        return invalid("level sizes must satisfy 0 < min <= max");
    }
    if config.tick_interval_ms == 0 {
        return invalid("tick interval must be non-zero");
    }
    // Deepest bid at the band floor, as a fraction of baseline.
    let deepest_bid = 1.0
        - config.band
        - config.spread_fraction / 2.0
        - config.book_levels.saturating_sub(1) as f64 * config.level_step_fraction;
    if deepest_bid <= 0.0 {
        return invalid("book depth reaches non-positive bid prices");
    }
    Ok(())
}

/// Pushes every event from a source to the channel named by its symbol.
pub struct FeedPublisher<S: FeedSource> {
    source: S,
    registry: Arc<ConnectionRegistry>,
}

impl<S: FeedSource> FeedPublisher<S> {
    pub fn new(source: S, registry: Arc<ConnectionRegistry>) -> Self {
        Self { source, registry }
    }
}

#[async_trait]
impl<S: FeedSource> Periodic for FeedPublisher<S> {
    async fn run_cycle(&mut self) {
        for event in self.source.next_events().await {
            let channel = event.symbol().to_string();
            if let Err(e) = self.registry.publish(&channel, &event.into_message()) {
                warn!(channel = %channel, error = %e, "Failed to publish feed event");
            }
        }
    }
}
