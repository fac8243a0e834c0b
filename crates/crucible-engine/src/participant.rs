//! Participant state owned by the engine.
//!
//! A participant is mutated only inside a matching transaction or an
//! epoch-close transaction; everything reporting-facing goes through
//! [`ParticipantSnapshot`].

use chrono::{DateTime, Utc};
use crucible_types::{ParticipantId, Position, Symbol, Tier, TierState};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Live participant record inside the engine's state table
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub balance: Decimal,
    pub initial_balance: Decimal,
    pub positions: HashMap<Symbol, Position>,
    pub tier_state: TierState,
    pub created_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(name: impl Into<String>, initial_balance: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: ParticipantId::new(),
            name: name.into(),
            balance: initial_balance,
            initial_balance,
            positions: HashMap::new(),
            tier_state: TierState::new(now),
            created_at: now,
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier_state.tier
    }

    /// Balance plus mark-to-market value of all open positions.
    ///
    /// A position whose symbol has no reference price yet is valued at its
    /// average cost; the engine never fabricates a tick.
    pub fn equity(&self, prices: &HashMap<Symbol, Decimal>) -> Decimal {
        let mut equity = self.balance;
        for (symbol, position) in &self.positions {
            let price = prices.get(symbol).copied().unwrap_or(position.avg_cost);
            equity += position.market_value(price);
        }
        equity
    }

    /// Equity minus initial capital. Pure over current state.
    pub fn pnl(&self, prices: &HashMap<Symbol, Decimal>) -> Decimal {
        self.equity(prices) - self.initial_balance
    }

    /// PnL as a fraction of initial capital
    pub fn roi(&self, prices: &HashMap<Symbol, Decimal>) -> Decimal {
        if self.initial_balance.is_zero() {
            return Decimal::ZERO;
        }
        self.pnl(prices) / self.initial_balance
    }

    pub fn snapshot(&self, prices: &HashMap<Symbol, Decimal>) -> ParticipantSnapshot {
        ParticipantSnapshot {
            id: self.id,
            name: self.name.clone(),
            balance: self.balance,
            initial_balance: self.initial_balance,
            positions: self.positions.clone(),
            tier: self.tier_state.tier,
            entry_fee_paid: self.tier_state.entry_fee_paid,
            consecutive_wins: self.tier_state.consecutive_wins,
            pool_contribution: self.tier_state.pool_contribution,
            pnl: self.pnl(prices),
            roi: self.roi(prices),
            created_at: self.created_at,
        }
    }
}

/// Read-only view handed to ranking, the hive mind and the HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub id: ParticipantId,
    pub name: String,
    pub balance: Decimal,
    pub initial_balance: Decimal,
    pub positions: HashMap<Symbol, Position>,
    pub tier: Tier,
    pub entry_fee_paid: bool,
    pub consecutive_wins: u32,
    pub pool_contribution: Decimal,
    pub pnl: Decimal,
    pub roi: Decimal,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn equity_marks_positions_to_market() {
        let mut p = Participant::new("tester", dec!(1000));
        p.balance = dec!(400);
        p.positions
            .insert(Symbol::new("SOL"), Position::new(dec!(4), dec!(150)));

        let mut prices = HashMap::new();
        prices.insert(Symbol::new("SOL"), dec!(175));

        assert_eq!(p.equity(&prices), dec!(1100));
        assert_eq!(p.pnl(&prices), dec!(100));
        assert_eq!(p.roi(&prices), dec!(0.1));
    }

    #[test]
    fn missing_price_falls_back_to_avg_cost() {
        let mut p = Participant::new("tester", dec!(1000));
        p.balance = dec!(0);
        p.positions
            .insert(Symbol::new("ETH"), Position::new(dec!(2), dec!(500)));

        let prices = HashMap::new();
        assert_eq!(p.equity(&prices), dec!(1000));
        assert_eq!(p.pnl(&prices), dec!(0));
    }

    #[test]
    fn snapshot_reflects_tier_state() {
        let p = Participant::new("tester", dec!(1000));
        let snap = p.snapshot(&HashMap::new());
        assert_eq!(snap.tier, Tier::Training);
        assert!(!snap.entry_fee_paid);
        assert_eq!(snap.consecutive_wins, 0);
        assert_eq!(snap.pnl, dec!(0));
    }
}
