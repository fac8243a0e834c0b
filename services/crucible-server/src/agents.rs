//! Demo strategy population.
//!
//! Drives the engine the way external participants would over the wire,
//! using a small fleet of in-process strategies. Strategies are treated as
//! untrusted: each `on_price_update` call runs behind a panic boundary and
//! a panicking strategy simply makes no decision that tick.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crucible_types::{ArenaError, OrderIntent, ParticipantId, PriceMap, Side, Strategy, Symbol, Tier};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::AppState;

// ============================================================================
// Strategies
// ============================================================================

/// Chases the tick's biggest mover: buys strength, exits on weakness.
struct MomentumStrategy {
    last: HashMap<Symbol, Decimal>,
    held: HashMap<Symbol, Decimal>,
    lot: Decimal,
}

impl MomentumStrategy {
    fn new() -> Self {
        Self {
            last: HashMap::new(),
            held: HashMap::new(),
            lot: dec!(0.5),
        }
    }
}

impl Strategy for MomentumStrategy {
    fn name(&self) -> &str {
        "momentum"
    }

    fn on_price_update(&mut self, prices: &PriceMap) -> Option<OrderIntent> {
        let mut best: Option<(Symbol, Decimal)> = None;
        let mut symbols: Vec<&Symbol> = prices.keys().collect();
        symbols.sort();
        for symbol in symbols {
            let price = prices[symbol];
            if let Some(prev) = self.last.get(symbol) {
                if *prev > Decimal::ZERO {
                    let change = (price - *prev) / *prev;
                    let replace = match &best {
                        Some((_, current)) => change.abs() > current.abs(),
                        None => true,
                    };
                    if replace {
                        best = Some((symbol.clone(), change));
                    }
                }
            }
        }
        for (symbol, price) in prices {
            self.last.insert(symbol.clone(), *price);
        }

        let (symbol, change) = best?;
        if change > dec!(0.0005) {
            *self.held.entry(symbol.clone()).or_insert(Decimal::ZERO) += self.lot;
            Some(OrderIntent {
                symbol,
                side: Side::Buy,
                amount: self.lot,
                reason: vec!["MOMENTUM".to_string()],
            })
        } else if change < dec!(-0.0005)
            && self.held.get(&symbol).copied().unwrap_or(Decimal::ZERO) >= self.lot
        {
            *self.held.entry(symbol.clone()).or_insert(Decimal::ZERO) -= self.lot;
            Some(OrderIntent {
                symbol,
                side: Side::Sell,
                amount: self.lot,
                reason: vec!["MOMENTUM".to_string(), "STOP_LOSS".to_string()],
            })
        } else {
            None
        }
    }
}

/// Buys below the first price it saw, takes profit above it.
struct DipBuyerStrategy {
    baseline: HashMap<Symbol, Decimal>,
    held: HashMap<Symbol, Decimal>,
    trigger: Decimal,
    lot: Decimal,
}

impl DipBuyerStrategy {
    fn new() -> Self {
        Self {
            baseline: HashMap::new(),
            held: HashMap::new(),
            trigger: dec!(0.002),
            lot: dec!(0.5),
        }
    }
}

impl Strategy for DipBuyerStrategy {
    fn name(&self) -> &str {
        "dip-buyer"
    }

    fn on_price_update(&mut self, prices: &PriceMap) -> Option<OrderIntent> {
        let mut symbols: Vec<&Symbol> = prices.keys().collect();
        symbols.sort();
        for symbol in symbols {
            let price = prices[symbol];
            let baseline = *self.baseline.entry(symbol.clone()).or_insert(price);
            if baseline <= Decimal::ZERO {
                continue;
            }
            let drift = (price - baseline) / baseline;
            if drift < -self.trigger {
                *self.held.entry(symbol.clone()).or_insert(Decimal::ZERO) += self.lot;
                return Some(OrderIntent {
                    symbol: symbol.clone(),
                    side: Side::Buy,
                    amount: self.lot,
                    reason: vec!["DIP_BUY".to_string()],
                });
            }
            if drift > self.trigger
                && self.held.get(symbol).copied().unwrap_or(Decimal::ZERO) >= self.lot
            {
                *self.held.entry(symbol.clone()).or_insert(Decimal::ZERO) -= self.lot;
                return Some(OrderIntent {
                    symbol: symbol.clone(),
                    side: Side::Sell,
                    amount: self.lot,
                    reason: vec!["DIP_BUY".to_string(), "TAKE_PROFIT".to_string()],
                });
            }
        }
        None
    }
}

/// Trades a coin flip on a random symbol. Mostly noise for the hive mind.
struct RandomStrategy {
    rng: StdRng,
    held: HashMap<Symbol, Decimal>,
}

impl RandomStrategy {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            held: HashMap::new(),
        }
    }
}

impl Strategy for RandomStrategy {
    fn name(&self) -> &str {
        "coin-flip"
    }

    fn on_price_update(&mut self, prices: &PriceMap) -> Option<OrderIntent> {
        if !self.rng.gen_bool(0.3) {
            return None;
        }
        let mut symbols: Vec<&Symbol> = prices.keys().collect();
        symbols.sort();
        if symbols.is_empty() {
            return None;
        }
        let symbol = symbols[self.rng.gen_range(0..symbols.len())].clone();
        let amount = Decimal::from(self.rng.gen_range(1u32..=5)) / dec!(10);

        let held = self.held.get(&symbol).copied().unwrap_or(Decimal::ZERO);
        let side = if held >= amount && self.rng.gen_bool(0.5) {
            Side::Sell
        } else {
            Side::Buy
        };
        match side {
            Side::Buy => *self.held.entry(symbol.clone()).or_insert(Decimal::ZERO) += amount,
            Side::Sell => *self.held.entry(symbol.clone()).or_insert(Decimal::ZERO) -= amount,
        }
        Some(OrderIntent {
            symbol,
            side,
            amount,
            reason: vec!["COIN_FLIP".to_string()],
        })
    }
}

/// Buys tiny lots but panics on a fixed cadence, exercising the panic
/// boundary around untrusted strategy code.
struct ErraticStrategy {
    ticks: u64,
    panic_every: u64,
}

impl ErraticStrategy {
    fn new(panic_every: u64) -> Self {
        Self {
            ticks: 0,
            panic_every,
        }
    }
}

impl Strategy for ErraticStrategy {
    fn name(&self) -> &str {
        "erratic"
    }

    fn on_price_update(&mut self, prices: &PriceMap) -> Option<OrderIntent> {
        self.ticks += 1;
        if self.ticks % self.panic_every == 0 {
            panic!("erratic strategy diverged");
        }
        if self.ticks % 7 != 0 {
            return None;
        }
        let mut symbols: Vec<&Symbol> = prices.keys().collect();
        symbols.sort();
        let symbol = (*symbols.first()?).clone();
        Some(OrderIntent {
            symbol,
            side: Side::Buy,
            amount: dec!(0.1),
            reason: vec!["YOLO".to_string()],
        })
    }
}

// ============================================================================
// Population driver
// ============================================================================

struct DemoAgent {
    participant_id: ParticipantId,
    name: String,
    strategy: Box<dyn Strategy>,
}

fn build_agents(state: &AppState, count: usize) -> Vec<DemoAgent> {
    let mut agents = Vec::with_capacity(count);
    for i in 0..count {
        let strategy: Box<dyn Strategy> = match i % 4 {
            0 => Box::new(MomentumStrategy::new()),
            1 => Box::new(DipBuyerStrategy::new()),
            2 => Box::new(RandomStrategy::new(1042 + i as u64)),
            _ => Box::new(ErraticStrategy::new(50)),
        };
        let name = format!("{}-{}", strategy.name(), i + 1);
        let participant_id = state.engine.register_participant(name.clone());
        agents.push(DemoAgent {
            participant_id,
            name,
            strategy,
        });
    }
    agents
}

/// Run the demo fleet until every agent is eliminated or launched. Each
/// feed tick is fanned to every strategy and resulting intents are
/// submitted straight into the engine.
pub async fn run_demo_population(state: Arc<AppState>, count: usize) {
    let mut agents = build_agents(&state, count);
    let ticks = state.hub.subscribe();
    info!(agents = agents.len(), "demo population trading");

    while let Ok(tick) = ticks.recv_async().await {
        let prices: PriceMap = tick.price_map();

        agents.retain(|agent| {
            state
                .engine
                .participant_snapshot(agent.participant_id)
                .map(|s| s.tier != Tier::Eliminated && s.tier != Tier::Launched)
                .unwrap_or(false)
        });
        if agents.is_empty() {
            info!("demo population fully eliminated or launched, stopping");
            break;
        }

        for agent in &mut agents {
            let decision =
                panic::catch_unwind(AssertUnwindSafe(|| agent.strategy.on_price_update(&prices)));
            let intent = match decision {
                Ok(Some(intent)) => intent,
                Ok(None) => continue,
                Err(_) => {
                    warn!(agent = %agent.name, "strategy panicked, treated as no decision");
                    continue;
                }
            };
            match state.engine.submit_order(
                agent.participant_id,
                intent.symbol,
                intent.side,
                intent.amount,
                intent.reason,
            ) {
                Ok(_) => {}
                Err(ArenaError::OrderRejected(reason)) => {
                    debug!(agent = %agent.name, %reason, "demo order rejected");
                }
                Err(e) => warn!(agent = %agent.name, error = %e, "demo order failed"),
            }
        }
    }
}
