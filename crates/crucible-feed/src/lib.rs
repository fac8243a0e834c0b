//! Crucible Feed - Price Data for the Arena
//!
//! The engine never talks to a market-data provider directly; it consumes
//! the [`PriceFeed`] trait, which yields one [`PriceTick`] per poll. Ticks
//! may be partial (symbols missing, provider hiccups) and consumers are
//! expected to skip what is absent rather than fabricate values.
//!
//! Ships with [`SimulatedFeed`], a seedable random-walk generator used by
//! the demo population and the test suites, and [`FeedHub`], a small
//! fan-out of ticks to in-process subscribers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crucible_types::{PriceMap, Symbol};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("feed unavailable: {0}")]
    Unavailable(String),

    #[error("malformed feed payload: {0}")]
    Malformed(String),
}

pub type FeedResult<T> = Result<T, FeedError>;

// ============================================================================
// Tick Types
// ============================================================================

/// Per-symbol quote carried by a tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceInfo {
    pub price_usd: Decimal,
    /// Move since the feed's baseline price, as a fraction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_pct: Option<Decimal>,
}

impl PriceInfo {
    pub fn new(price_usd: Decimal) -> Self {
        Self {
            price_usd,
            change_pct: None,
        }
    }
}

/// One poll of the feed. Symbols the provider did not report are simply
/// absent from `prices`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTick {
    pub prices: HashMap<Symbol, PriceInfo>,
    pub at: DateTime<Utc>,
}

impl PriceTick {
    pub fn new(prices: HashMap<Symbol, PriceInfo>) -> Self {
        Self {
            prices,
            at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    /// Flatten to the symbol -> price map strategies consume
    pub fn price_map(&self) -> PriceMap {
        self.prices
            .iter()
            .map(|(s, info)| (s.clone(), info.price_usd))
            .collect()
    }
}

// ============================================================================
// Feed Trait
// ============================================================================

/// A pull source of market prices, polled at the configured interval.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the latest quotes. A tick may cover only a subset of symbols.
    async fn fetch_tick(&self) -> FeedResult<PriceTick>;
}

// ============================================================================
// Simulated Feed
// ============================================================================

/// Configuration for the random-walk feed
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Symbols the feed quotes, with their starting prices
    pub initial_prices: HashMap<Symbol, Decimal>,
    /// Poll interval the server drives the feed at
    pub interval_ms: u64,
    /// Largest single-tick move, in basis points of the current price
    pub max_move_bps: i64,
    /// Chance (per ten thousand, per symbol, per tick) that a quote is
    /// dropped from the tick, exercising partial-update handling
    pub dropout_per_10k: u32,
    /// Fixed RNG seed for reproducible walks; `None` seeds from entropy
    pub seed: Option<u64>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        let mut initial_prices = HashMap::new();
        initial_prices.insert(Symbol::new("SOL"), Decimal::new(150, 0));
        initial_prices.insert(Symbol::new("ETH"), Decimal::new(3200, 0));
        initial_prices.insert(Symbol::new("BTC"), Decimal::new(65000, 0));
        Self {
            initial_prices,
            interval_ms: 1_000,
            max_move_bps: 20,
            dropout_per_10k: 0,
            seed: None,
        }
    }
}

struct WalkState {
    rng: StdRng,
    current: HashMap<Symbol, Decimal>,
}

/// Random-walk price generator.
///
/// Each tick moves every symbol by a uniform random amount within
/// `max_move_bps` of its current price. With a fixed seed the walk is fully
/// reproducible.
pub struct SimulatedFeed {
    config: FeedConfig,
    baseline: HashMap<Symbol, Decimal>,
    state: Mutex<WalkState>,
}

impl SimulatedFeed {
    pub fn new(config: FeedConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let current = config.initial_prices.clone();
        let baseline = config.initial_prices.clone();
        Self {
            config,
            baseline,
            state: Mutex::new(WalkState { rng, current }),
        }
    }

    /// Symbols this feed quotes
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.baseline.keys().cloned().collect();
        symbols.sort();
        symbols
    }
}

#[async_trait]
impl PriceFeed for SimulatedFeed {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn fetch_tick(&self) -> FeedResult<PriceTick> {
        let mut state = self.state.lock();
        let mut prices = HashMap::new();

        // Deterministic iteration order so a seeded walk replays exactly
        let mut symbols: Vec<Symbol> = state.current.keys().cloned().collect();
        symbols.sort();

        for symbol in symbols {
            let bps = state
                .rng
                .gen_range(-self.config.max_move_bps..=self.config.max_move_bps);
            let factor = Decimal::ONE + Decimal::new(bps, 4);
            let price = match state.current.get_mut(&symbol) {
                Some(entry) => {
                    *entry *= factor;
                    *entry
                }
                None => continue,
            };

            if self.config.dropout_per_10k > 0
                && state.rng.gen_range(0..10_000) < self.config.dropout_per_10k
            {
                debug!(symbol = %symbol, "simulated feed dropout");
                continue;
            }

            let mut info = PriceInfo::new(price);
            if let Some(base) = self.baseline.get(&symbol) {
                if !base.is_zero() {
                    info.change_pct = Some((price - base) / base);
                }
            }
            prices.insert(symbol, info);
        }

        Ok(PriceTick::new(prices))
    }
}

// ============================================================================
// Fan-out Hub
// ============================================================================

/// Fans completed ticks out to in-process subscribers (demo agents, tests).
///
/// Subscribers that fall behind or disconnect are dropped on the next
/// publish; delivery is best-effort with no replay.
#[derive(Default)]
pub struct FeedHub {
    subscribers: RwLock<Vec<flume::Sender<PriceTick>>>,
}

impl FeedHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> flume::Receiver<PriceTick> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.write().push(tx);
        rx
    }

    pub fn publish(&self, tick: &PriceTick) {
        let mut subs = self.subscribers.write();
        subs.retain(|tx| tx.send(tick.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_config(seed: u64) -> FeedConfig {
        FeedConfig {
            seed: Some(seed),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn seeded_walk_is_reproducible() {
        let a = SimulatedFeed::new(seeded_config(42));
        let b = SimulatedFeed::new(seeded_config(42));

        let tick_a = a.fetch_tick().await.unwrap();
        let tick_b = b.fetch_tick().await.unwrap();

        for (symbol, info) in &tick_a.prices {
            assert_eq!(tick_b.prices.get(symbol).unwrap().price_usd, info.price_usd);
        }
    }

    #[tokio::test]
    async fn walk_stays_within_configured_move() {
        let config = FeedConfig {
            max_move_bps: 10,
            ..seeded_config(7)
        };
        let initial = config.initial_prices.clone();
        let feed = SimulatedFeed::new(config);

        let tick = feed.fetch_tick().await.unwrap();
        for (symbol, start) in initial {
            let now = tick.prices.get(&symbol).unwrap().price_usd;
            let move_frac = ((now - start) / start).abs();
            assert!(move_frac <= Decimal::new(10, 4));
        }
    }

    #[tokio::test]
    async fn dropout_omits_symbols_without_fabricating() {
        let config = FeedConfig {
            dropout_per_10k: 10_000,
            ..seeded_config(1)
        };
        let feed = SimulatedFeed::new(config);
        let tick = feed.fetch_tick().await.unwrap();
        assert!(tick.is_empty());
    }

    #[tokio::test]
    async fn hub_fans_out_to_all_subscribers() {
        let hub = FeedHub::new();
        let rx1 = hub.subscribe();
        let rx2 = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        let feed = SimulatedFeed::new(seeded_config(3));
        let tick = feed.fetch_tick().await.unwrap();
        hub.publish(&tick);

        assert_eq!(rx1.recv().unwrap().prices.len(), tick.prices.len());
        assert_eq!(rx2.recv().unwrap().prices.len(), tick.prices.len());
    }

    #[tokio::test]
    async fn hub_drops_disconnected_subscribers() {
        let hub = FeedHub::new();
        let rx = hub.subscribe();
        drop(rx);

        let feed = SimulatedFeed::new(seeded_config(3));
        let tick = feed.fetch_tick().await.unwrap();
        hub.publish(&tick);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn price_info_wire_shape_is_camel_case() {
        let info = PriceInfo::new(Decimal::new(15042, 2));
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"priceUsd\""));
        assert!(!json.contains("change_pct"));
    }

    #[test]
    fn price_map_flattens_tick() {
        let mut prices = HashMap::new();
        prices.insert(Symbol::new("SOL"), PriceInfo::new(Decimal::new(150, 0)));
        let tick = PriceTick::new(prices);
        let map = tick.price_map();
        assert_eq!(map.get(&Symbol::new("SOL")), Some(&Decimal::new(150, 0)));
    }
}
