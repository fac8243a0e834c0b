//! Crucible Types - Domain Types for the Trading Arena
//!
//! This crate defines the shared vocabulary of the Crucible tournament:
//! - Strongly typed identifiers
//! - Orders, trades and positions
//! - Competition tiers and the epoch lifecycle
//! - Rankings and epoch summaries
//! - The untrusted strategy callback contract
//!
//! # Architecture
//!
//! Every mutable aggregate (participants, ledger, prices) lives in
//! `crucible-engine`; this crate only carries the immutable value types that
//! cross crate boundaries. Amounts are `rust_decimal::Decimal` end to end,
//! timestamps are `chrono::DateTime<Utc>`, and identifiers are UUID newtypes
//! so a `ParticipantId` can never be passed where a `TradeId` is expected.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Macro to generate ID types with common implementations
macro_rules! define_id {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from a string (with or without prefix)
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                let s = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Get the inner UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

define_id!(ParticipantId, "part", "Unique identifier for a tournament participant");
define_id!(OrderId, "order", "Unique identifier for a submitted order");
define_id!(TradeId, "trade", "Unique identifier for a settled trade");
define_id!(LaunchTaskId, "launch", "Unique identifier for a settlement bridge launch task");

// ============================================================================
// Symbols and Sides
// ============================================================================

/// Tradable symbol (e.g. "SOL", "ETH"), always against the quote currency
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Direction of the slippage adjustment: buys execute above the
    /// reference price, sells below
    pub fn slippage_sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
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

// ============================================================================
// Competition Tiers
// ============================================================================

/// Competition tier a participant occupies.
///
/// Transitions are strictly monotonic: `Training -> PaidArena -> Launched`,
/// with `Eliminated` reachable from the two active tiers and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Free tier every participant starts in
    Training,
    /// Entry fee paid, competing for launch
    PaidArena,
    /// Settlement bridge confirmed, graduated out of the ladder
    Launched,
    /// Ranked out of the tournament, terminal
    Eliminated,
}

impl Tier {
    /// Tiers reachable from this one
    pub fn valid_transitions(&self) -> Vec<Tier> {
        match self {
            Tier::Training => vec![Tier::PaidArena, Tier::Eliminated],
            Tier::PaidArena => vec![Tier::Launched, Tier::Eliminated],
            Tier::Launched => vec![],
            Tier::Eliminated => vec![],
        }
    }

    pub fn can_transition_to(&self, next: Tier) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Launched and Eliminated have no outgoing transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Tier::Launched | Tier::Eliminated)
    }

    /// Still competing in the ladder
    pub fn is_active(&self) -> bool {
        matches!(self, Tier::Training | Tier::PaidArena)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Training => write!(f, "training"),
            Tier::PaidArena => write!(f, "paid_arena"),
            Tier::Launched => write!(f, "launched"),
            Tier::Eliminated => write!(f, "eliminated"),
        }
    }
}

/// Per-participant ladder bookkeeping carried alongside the tier.
///
/// Mutated only inside epoch-close transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierState {
    pub tier: Tier,
    /// One-time arena entry fee has been collected
    pub entry_fee_paid: bool,
    /// Consecutive qualifying wins in the current tier, reset on any miss
    pub consecutive_wins: u32,
    /// Total amount this participant has paid into the liquidity pool
    pub pool_contribution: Decimal,
    /// Every applied transition with its timestamp, oldest first
    pub history: Vec<(Tier, DateTime<Utc>)>,
}

impl TierState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            tier: Tier::Training,
            entry_fee_paid: false,
            consecutive_wins: 0,
            pool_contribution: Decimal::ZERO,
            history: vec![(Tier::Training, now)],
        }
    }

    /// Apply a transition, recording it in the history.
    pub fn transition_to(&mut self, next: Tier, now: DateTime<Utc>) -> ArenaResult<()> {
        if !self.tier.can_transition_to(next) {
            return Err(ArenaError::InvalidTierTransition {
                from: self.tier,
                to: next,
            });
        }
        self.tier = next;
        self.consecutive_wins = 0;
        self.history.push((next, now));
        Ok(())
    }
}

// ============================================================================
// Epoch Lifecycle
// ============================================================================

/// Phase of the currently running epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochPhase {
    /// Accepting orders
    Open,
    /// Close in progress, orders rejected
    Closing,
    /// Summary published, next epoch about to open
    Closed,
}

impl EpochPhase {
    pub fn valid_transitions(&self) -> Vec<EpochPhase> {
        match self {
            EpochPhase::Open => vec![EpochPhase::Closing],
            EpochPhase::Closing => vec![EpochPhase::Closed],
            // The scheduler never idles: Closed rolls straight into the
            // next epoch's Open
            EpochPhase::Closed => vec![EpochPhase::Open],
        }
    }

    pub fn can_transition_to(&self, next: EpochPhase) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn accepts_orders(&self) -> bool {
        matches!(self, EpochPhase::Open)
    }
}

impl fmt::Display for EpochPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpochPhase::Open => write!(f, "open"),
            EpochPhase::Closing => write!(f, "closing"),
            EpochPhase::Closed => write!(f, "closed"),
        }
    }
}

/// One row of an epoch ranking, sorted by PnL descending
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    /// 1-based rank after sorting
    pub rank: u32,
    pub participant_id: ParticipantId,
    /// PnL at close, the sort key
    pub value: Decimal,
}

/// Snapshot published when an epoch closes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: u64,
    pub started_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub rankings: Vec<RankingEntry>,
    pub eliminated: Vec<ParticipantId>,
    pub ascension_eligible: Vec<ParticipantId>,
    /// Trades settled during this epoch
    pub trade_count: usize,
}

// ============================================================================
// Orders and Trades
// ============================================================================

/// A validated order as accepted by the matching engine.
///
/// Immutable once constructed; rejected submissions never become an `Order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub participant_id: ParticipantId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    /// Free-form rationale tags self-reported by the strategy
    pub tags: Vec<String>,
    pub submitted_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        participant_id: ParticipantId,
        symbol: Symbol,
        side: Side,
        quantity: Decimal,
        tags: Vec<String>,
    ) -> Self {
        Self {
            id: OrderId::new(),
            participant_id,
            symbol,
            side,
            quantity,
            tags,
            submitted_at: Utc::now(),
        }
    }
}

/// The settled result of an accepted order.
///
/// Trades are append-only: once written to the ledger they are never mutated
/// or removed. Rankings and the hive mind derive everything from these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub participant_id: ParticipantId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    /// Post-slippage execution price
    pub executed_price: Decimal,
    pub tags: Vec<String>,
    /// Epoch the trade settled in
    pub epoch: u64,
    /// Per-participant submission sequence, total order within one participant
    pub sequence: u64,
    pub executed_at: DateTime<Utc>,
}

impl Trade {
    pub fn from_order(
        order: &Order,
        executed_price: Decimal,
        epoch: u64,
        sequence: u64,
    ) -> Self {
        Self {
            id: TradeId::new(),
            participant_id: order.participant_id,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            executed_price,
            tags: order.tags.clone(),
            epoch,
            sequence,
            executed_at: Utc::now(),
        }
    }

    /// Quote-currency value of the execution
    pub fn notional(&self) -> Decimal {
        self.quantity * self.executed_price
    }
}

// ============================================================================
// Positions
// ============================================================================

/// Open position in one symbol: running quantity and average entry cost
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub quantity: Decimal,
    pub avg_cost: Decimal,
}

impl Position {
    pub fn new(quantity: Decimal, avg_cost: Decimal) -> Self {
        Self { quantity, avg_cost }
    }

    /// Mark-to-market value at the given reference price
    pub fn market_value(&self, price: Decimal) -> Decimal {
        self.quantity * price
    }

    /// Unrealized PnL against the average cost
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.quantity * (price - self.avg_cost)
    }

    /// Fold a buy into the running average cost
    pub fn apply_buy(&mut self, quantity: Decimal, price: Decimal) {
        let new_quantity = self.quantity + quantity;
        if new_quantity > Decimal::ZERO {
            self.avg_cost =
                (self.quantity * self.avg_cost + quantity * price) / new_quantity;
        }
        self.quantity = new_quantity;
    }

    /// Reduce the position by a sell, average cost unchanged
    pub fn apply_sell(&mut self, quantity: Decimal) {
        self.quantity -= quantity;
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }
}

impl Default for Position {
    fn default() -> Self {
        Self {
            quantity: Decimal::ZERO,
            avg_cost: Decimal::ZERO,
        }
    }
}

// ============================================================================
// Strategy Contract
// ============================================================================

/// Latest reference prices keyed by symbol, handed to strategies each tick
pub type PriceMap = HashMap<Symbol, Decimal>;

/// A strategy's requested action for one tick
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub symbol: Symbol,
    pub side: Side,
    pub amount: Decimal,
    /// Rationale tags attached to the resulting order
    pub reason: Vec<String>,
}

/// The only contract the engine holds with untrusted strategy code.
///
/// Implementations are arbitrary and replaceable; the caller invokes
/// `on_price_update` once per tick and must treat a panic inside it as
/// "no decision" for that tick, never propagating it into engine state.
pub trait Strategy: Send {
    /// Short name used in logs and fingerprints
    fn name(&self) -> &str;

    /// React to a price tick; `None` means no action this tick
    fn on_price_update(&mut self, prices: &PriceMap) -> Option<OrderIntent>;
}

// ============================================================================
// Errors
// ============================================================================

/// Why an order submission was rejected.
///
/// Rejections are reported to the submitting session only and leave no trace
/// in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UnknownParticipant,
    ParticipantEliminated,
    UnknownSymbol,
    InvalidQuantity,
    InsufficientBalance,
    InsufficientPosition,
    /// Epoch close in progress, resubmit next epoch
    EpochClosing,
    /// No reference price seen yet for the symbol
    PriceUnavailable,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnknownParticipant => write!(f, "unknown participant"),
            RejectReason::ParticipantEliminated => write!(f, "participant is eliminated"),
            RejectReason::UnknownSymbol => write!(f, "symbol not on allow-list"),
            RejectReason::InvalidQuantity => write!(f, "quantity must be positive"),
            RejectReason::InsufficientBalance => write!(f, "insufficient balance"),
            RejectReason::InsufficientPosition => write!(f, "insufficient position"),
            RejectReason::EpochClosing => write!(f, "epoch close in progress"),
            RejectReason::PriceUnavailable => write!(f, "no reference price available"),
        }
    }
}

/// Arena-wide error type
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArenaError {
    #[error("order rejected: {0}")]
    OrderRejected(RejectReason),

    #[error("unknown participant: {0}")]
    UnknownParticipant(ParticipantId),

    #[error("invalid tier transition: {from} -> {to}")]
    InvalidTierTransition { from: Tier, to: Tier },

    #[error("invalid epoch phase transition: {from} -> {to}")]
    InvalidPhaseTransition { from: EpochPhase, to: EpochPhase },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type ArenaResult<T> = Result<T, ArenaError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn participant_id_display_and_parse() {
        let id = ParticipantId::new();
        let s = id.to_string();
        assert!(s.starts_with("part_"));
        assert_eq!(ParticipantId::parse(&s).unwrap(), id);
        // Bare UUID parses too
        assert_eq!(ParticipantId::parse(&id.0.to_string()).unwrap(), id);
    }

    #[test]
    fn id_types_do_not_collide() {
        let uuid = Uuid::new_v4();
        let a = ParticipantId::from_uuid(uuid);
        let b = ParticipantId::from_uuid(uuid);
        assert_eq!(a, b);
        assert!(TradeId::new().to_string().starts_with("trade_"));
        assert!(LaunchTaskId::new().to_string().starts_with("launch_"));
    }

    #[test]
    fn side_opposite_and_display() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!(Side::Buy.to_string(), "buy");
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"sell\"");
    }

    #[test]
    fn tier_transitions_are_monotonic() {
        assert!(Tier::Training.can_transition_to(Tier::PaidArena));
        assert!(Tier::Training.can_transition_to(Tier::Eliminated));
        assert!(Tier::PaidArena.can_transition_to(Tier::Launched));
        assert!(Tier::PaidArena.can_transition_to(Tier::Eliminated));

        // No backward or skipping moves
        assert!(!Tier::Training.can_transition_to(Tier::Launched));
        assert!(!Tier::PaidArena.can_transition_to(Tier::Training));
        assert!(!Tier::Launched.can_transition_to(Tier::PaidArena));
    }

    #[test]
    fn eliminated_is_absorbing() {
        assert!(Tier::Eliminated.valid_transitions().is_empty());
        assert!(Tier::Eliminated.is_terminal());
        assert!(!Tier::Eliminated.is_active());
    }

    #[test]
    fn tier_state_records_history() {
        let now = Utc::now();
        let mut state = TierState::new(now);
        assert_eq!(state.tier, Tier::Training);

        state.consecutive_wins = 2;
        state.transition_to(Tier::PaidArena, now).unwrap();
        assert_eq!(state.tier, Tier::PaidArena);
        // Streak resets on promotion
        assert_eq!(state.consecutive_wins, 0);
        assert_eq!(state.history.len(), 2);

        let err = state.transition_to(Tier::Training, now).unwrap_err();
        assert!(matches!(err, ArenaError::InvalidTierTransition { .. }));
    }

    #[test]
    fn epoch_phase_cycle() {
        assert!(EpochPhase::Open.can_transition_to(EpochPhase::Closing));
        assert!(EpochPhase::Closing.can_transition_to(EpochPhase::Closed));
        assert!(EpochPhase::Closed.can_transition_to(EpochPhase::Open));
        assert!(!EpochPhase::Open.can_transition_to(EpochPhase::Closed));
        assert!(EpochPhase::Open.accepts_orders());
        assert!(!EpochPhase::Closing.accepts_orders());
    }

    #[test]
    fn position_average_cost() {
        let mut pos = Position::default();
        pos.apply_buy(dec!(10), dec!(100));
        assert_eq!(pos.avg_cost, dec!(100));

        pos.apply_buy(dec!(10), dec!(200));
        assert_eq!(pos.quantity, dec!(20));
        assert_eq!(pos.avg_cost, dec!(150));

        pos.apply_sell(dec!(5));
        assert_eq!(pos.quantity, dec!(15));
        // Sells leave the average untouched
        assert_eq!(pos.avg_cost, dec!(150));

        assert_eq!(pos.market_value(dec!(160)), dec!(2400));
        assert_eq!(pos.unrealized_pnl(dec!(160)), dec!(150));
    }

    #[test]
    fn trade_from_order_carries_tags() {
        let order = Order::new(
            ParticipantId::new(),
            Symbol::new("SOL"),
            Side::Buy,
            dec!(2),
            vec!["DIP_BUY".to_string()],
        );
        let trade = Trade::from_order(&order, dec!(101), 7, 3);
        assert_eq!(trade.participant_id, order.participant_id);
        assert_eq!(trade.tags, vec!["DIP_BUY".to_string()]);
        assert_eq!(trade.epoch, 7);
        assert_eq!(trade.sequence, 3);
        assert_eq!(trade.notional(), dec!(202));
    }

    #[test]
    fn reject_reason_serializes_snake_case() {
        let json = serde_json::to_string(&RejectReason::InsufficientBalance).unwrap();
        assert_eq!(json, "\"insufficient_balance\"");
        assert_eq!(
            RejectReason::EpochClosing.to_string(),
            "epoch close in progress"
        );
    }

    #[test]
    fn slippage_sign_follows_side() {
        assert_eq!(Side::Buy.slippage_sign(), Decimal::ONE);
        assert_eq!(Side::Sell.slippage_sign(), -Decimal::ONE);
    }
}
