//! Crucible Engine - Matching and Ledger Core
//!
//! The engine owns every mutable aggregate of the tournament population:
//! the participant table (balances, positions, tier state), the reference
//! price table, and the append-only trade ledger. All of it sits behind a
//! single lock; every mutator takes the write lock for its whole
//! transaction, which makes order submission, epoch close and tier
//! transitions atomic steps relative to each other.
//!
//! # Architecture
//!
//! - There is no cross-participant order book. Every order executes against
//!   the shared reference price, adjusted by a fixed slippage fraction
//!   applied against the participant (buys fill above reference, sells
//!   below).
//! - Orders either settle fully or are rejected; there are no partial
//!   fills, and a rejection leaves no trace in the ledger.
//! - PnL is always derived on demand from balance plus mark-to-market
//!   positions minus initial capital. `calculate_pnl` never mutates.
//!
//! # Example
//!
//! ```ignore
//! use crucible_engine::{ArenaEngine, EngineConfig};
//!
//! let engine = ArenaEngine::new(EngineConfig::default());
//! let id = engine.register_participant("momentum-7");
//! let result = engine.submit_order(id, "SOL".into(), Side::Buy, dec!(2), vec![])?;
//! ```

mod ledger;
mod participant;

pub use ledger::TradeLedger;
pub use participant::{Participant, ParticipantSnapshot};

use chrono::{DateTime, Utc};
use crucible_types::{
    ArenaError, ArenaResult, EpochPhase, Order, OrderId, ParticipantId, PriceMap, RejectReason,
    Side, Symbol, Tier, Trade, TradeId,
};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Starting balance credited to every new participant
    pub initial_balance: Decimal,
    /// One-sided adverse execution fraction (0.01 = 1%)
    pub slippage_fraction: Decimal,
    /// Symbol allow-list; orders and ticks outside it are ignored
    pub symbols: Vec<Symbol>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(10000),
            slippage_fraction: dec!(0.01),
            symbols: vec![Symbol::new("SOL"), Symbol::new("ETH"), Symbol::new("BTC")],
        }
    }
}

// ============================================================================
// Submit Result
// ============================================================================

/// Successful order submission, returned synchronously to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResult {
    pub order_id: OrderId,
    pub trade_id: TradeId,
    pub executed_price: Decimal,
    pub new_balance: Decimal,
}

// ============================================================================
// Engine
// ============================================================================

struct EngineState {
    participants: HashMap<ParticipantId, Participant>,
    prices: HashMap<Symbol, Decimal>,
    ledger: TradeLedger,
    epoch: u64,
    phase: EpochPhase,
    epoch_opened_at: DateTime<Utc>,
}

/// The single-writer population core.
///
/// Cheap to share as `Arc<ArenaEngine>`; all methods take `&self`.
pub struct ArenaEngine {
    config: EngineConfig,
    state: RwLock<EngineState>,
}

impl ArenaEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: RwLock::new(EngineState {
                participants: HashMap::new(),
                prices: HashMap::new(),
                ledger: TradeLedger::new(),
                epoch: 1,
                phase: EpochPhase::Open,
                epoch_opened_at: Utc::now(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Seed a new participant with the configured initial balance.
    ///
    /// Registration is allowed in any epoch phase; a participant created
    /// during a close first appears in the next epoch's rankings.
    pub fn register_participant(&self, name: impl Into<String>) -> ParticipantId {
        let participant = Participant::new(name, self.config.initial_balance);
        let id = participant.id;
        let name = participant.name.clone();
        let mut state = self.state.write();
        state.participants.insert(id, participant);
        info!(participant = %id, name = %name, "participant registered");
        id
    }

    // ------------------------------------------------------------------
    // Order Submission
    // ------------------------------------------------------------------

    /// Validate and settle one order as a single atomic transaction.
    ///
    /// Exactly one `Trade` is appended per accepted order; a rejection has
    /// no effect on any state.
    pub fn submit_order(
        &self,
        participant_id: ParticipantId,
        symbol: Symbol,
        side: Side,
        quantity: Decimal,
        tags: Vec<String>,
    ) -> ArenaResult<SubmitResult> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        if !state.phase.accepts_orders() {
            return Err(ArenaError::OrderRejected(RejectReason::EpochClosing));
        }
        if !self.config.symbols.contains(&symbol) {
            return Err(ArenaError::OrderRejected(RejectReason::UnknownSymbol));
        }
        if quantity <= Decimal::ZERO {
            return Err(ArenaError::OrderRejected(RejectReason::InvalidQuantity));
        }

        let reference = state
            .prices
            .get(&symbol)
            .copied()
            .ok_or(ArenaError::OrderRejected(RejectReason::PriceUnavailable))?;

        let participant = state
            .participants
            .get_mut(&participant_id)
            .ok_or(ArenaError::OrderRejected(RejectReason::UnknownParticipant))?;
        if participant.tier() == Tier::Eliminated {
            return Err(ArenaError::OrderRejected(RejectReason::ParticipantEliminated));
        }

        // One-sided adverse execution: the slippage buffer is priced into
        // the fill itself
        let executed_price = reference
            * (Decimal::ONE + side.slippage_sign() * self.config.slippage_fraction);
        let notional = quantity * executed_price;

        match side {
            Side::Buy => {
                if participant.balance < notional {
                    return Err(ArenaError::OrderRejected(RejectReason::InsufficientBalance));
                }
                participant.balance -= notional;
                participant
                    .positions
                    .entry(symbol.clone())
                    .or_default()
                    .apply_buy(quantity, executed_price);
            }
            Side::Sell => {
                let held = participant
                    .positions
                    .get(&symbol)
                    .map(|p| p.quantity)
                    .unwrap_or(Decimal::ZERO);
                if held < quantity {
                    return Err(ArenaError::OrderRejected(RejectReason::InsufficientPosition));
                }
                participant.balance += notional;
                if let Some(position) = participant.positions.get_mut(&symbol) {
                    position.apply_sell(quantity);
                    if position.is_flat() {
                        participant.positions.remove(&symbol);
                    }
                }
            }
        }
        let new_balance = participant.balance;

        let epoch = state.epoch;
        let sequence = state.ledger.next_sequence(participant_id);
        let order = Order::new(participant_id, symbol.clone(), side, quantity, tags);
        let trade = Trade::from_order(&order, executed_price, epoch, sequence);
        let result = SubmitResult {
            order_id: order.id,
            trade_id: trade.id,
            executed_price,
            new_balance,
        };
        state.ledger.append(trade);

        debug!(
            participant = %participant_id,
            symbol = %symbol,
            %side,
            %quantity,
            price = %executed_price,
            balance = %new_balance,
            "order settled"
        );

        self.enforce_equity_invariant(state, participant_id);
        Ok(result)
    }

    /// Equity must never be negative after a matching transaction. The
    /// validation guards make this unreachable; if it fires anyway the
    /// state is corrupt and the process must halt.
    fn enforce_equity_invariant(&self, state: &EngineState, participant_id: ParticipantId) {
        if let Some(participant) = state.participants.get(&participant_id) {
            let equity = participant.equity(&state.prices);
            if equity < Decimal::ZERO {
                error!(participant = %participant_id, %equity, "equity invariant violated");
                panic!("equity invariant violated for {participant_id}: {equity}");
            }
        }
    }

    // ------------------------------------------------------------------
    // PnL
    // ------------------------------------------------------------------

    /// Balance plus mark-to-market positions minus initial capital.
    ///
    /// Pure read; calling it twice without an intervening trade or tick
    /// yields identical results.
    pub fn calculate_pnl(&self, participant_id: ParticipantId) -> ArenaResult<Decimal> {
        let state = self.state.read();
        let participant = state
            .participants
            .get(&participant_id)
            .ok_or(ArenaError::UnknownParticipant(participant_id))?;
        Ok(participant.pnl(&state.prices))
    }

    // ------------------------------------------------------------------
    // Price Ingestion
    // ------------------------------------------------------------------

    /// Ingest a tick. Unlisted symbols and non-positive quotes are skipped;
    /// symbols absent from the tick retain their last known price.
    pub fn apply_price_update(&self, prices: &PriceMap) {
        let mut state = self.state.write();
        for (symbol, price) in prices {
            if !self.config.symbols.contains(symbol) {
                debug!(symbol = %symbol, "ignoring tick for unlisted symbol");
                continue;
            }
            if *price <= Decimal::ZERO {
                warn!(symbol = %symbol, price = %price, "skipping malformed quote");
                continue;
            }
            state.prices.insert(symbol.clone(), *price);
        }
    }

    // ------------------------------------------------------------------
    // Epoch Close Path
    // ------------------------------------------------------------------

    /// Suspend order intake for the close. Returns the closing epoch's
    /// number and open timestamp.
    pub fn begin_close(&self) -> ArenaResult<(u64, DateTime<Utc>)> {
        let mut state = self.state.write();
        if !state.phase.can_transition_to(EpochPhase::Closing) {
            return Err(ArenaError::InvalidPhaseTransition {
                from: state.phase,
                to: EpochPhase::Closing,
            });
        }
        state.phase = EpochPhase::Closing;
        info!(epoch = state.epoch, "epoch closing, order intake suspended");
        Ok((state.epoch, state.epoch_opened_at))
    }

    /// Publish the close and roll straight into the next epoch. The
    /// scheduler never idles between epochs.
    pub fn finish_close(&self) -> ArenaResult<u64> {
        let mut state = self.state.write();
        if !state.phase.can_transition_to(EpochPhase::Closed) {
            return Err(ArenaError::InvalidPhaseTransition {
                from: state.phase,
                to: EpochPhase::Closed,
            });
        }
        state.phase = EpochPhase::Closed;
        state.epoch += 1;
        state.epoch_opened_at = Utc::now();
        state.phase = EpochPhase::Open;
        info!(epoch = state.epoch, "epoch opened");
        Ok(state.epoch)
    }

    /// Transition the given participants to `Eliminated`
    pub fn mark_eliminated(&self, ids: &[ParticipantId]) -> ArenaResult<()> {
        let now = Utc::now();
        let mut state = self.state.write();
        for id in ids {
            let participant = state
                .participants
                .get_mut(id)
                .ok_or(ArenaError::UnknownParticipant(*id))?;
            participant.tier_state.transition_to(Tier::Eliminated, now)?;
            info!(participant = %id, "participant eliminated");
        }
        Ok(())
    }

    /// Update the consecutive-win streak for the participant's current
    /// tier. Returns the new streak value.
    pub fn record_qualifying_result(
        &self,
        participant_id: ParticipantId,
        won: bool,
    ) -> ArenaResult<u32> {
        let mut state = self.state.write();
        let participant = state
            .participants
            .get_mut(&participant_id)
            .ok_or(ArenaError::UnknownParticipant(participant_id))?;
        if won {
            participant.tier_state.consecutive_wins += 1;
        } else {
            participant.tier_state.consecutive_wins = 0;
        }
        Ok(participant.tier_state.consecutive_wins)
    }

    /// Collect the one-time arena entry fee. Returns `false` without any
    /// mutation when the balance cannot cover the fee.
    pub fn try_charge_entry_fee(
        &self,
        participant_id: ParticipantId,
        fee: Decimal,
    ) -> ArenaResult<bool> {
        let mut state = self.state.write();
        let participant = state
            .participants
            .get_mut(&participant_id)
            .ok_or(ArenaError::UnknownParticipant(participant_id))?;
        if participant.balance < fee {
            warn!(participant = %participant_id, %fee, balance = %participant.balance,
                "entry fee exceeds balance, promotion deferred");
            return Ok(false);
        }
        participant.balance -= fee;
        participant.tier_state.entry_fee_paid = true;
        participant.tier_state.pool_contribution += fee;
        info!(participant = %participant_id, %fee, "entry fee collected");
        Ok(true)
    }

    /// Apply a tier promotion, enforcing the monotonic transition rules
    pub fn promote_tier(&self, participant_id: ParticipantId, to: Tier) -> ArenaResult<()> {
        let now = Utc::now();
        let mut state = self.state.write();
        let participant = state
            .participants
            .get_mut(&participant_id)
            .ok_or(ArenaError::UnknownParticipant(participant_id))?;
        let from = participant.tier();
        participant.tier_state.transition_to(to, now)?;
        info!(participant = %participant_id, %from, %to, "tier transition");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read-only Snapshots
    // ------------------------------------------------------------------

    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }

    pub fn phase(&self) -> EpochPhase {
        self.state.read().phase
    }

    pub fn epoch_opened_at(&self) -> DateTime<Utc> {
        self.state.read().epoch_opened_at
    }

    pub fn participant_count(&self) -> usize {
        self.state.read().participants.len()
    }

    pub fn ledger_len(&self) -> usize {
        self.state.read().ledger.len()
    }

    pub fn reference_price(&self, symbol: &Symbol) -> Option<Decimal> {
        self.state.read().prices.get(symbol).copied()
    }

    pub fn reference_prices(&self) -> PriceMap {
        self.state.read().prices.clone()
    }

    pub fn trades_for_epoch(&self, epoch: u64) -> Vec<Trade> {
        self.state.read().ledger.trades_for_epoch(epoch)
    }

    pub fn trades_for_participant(&self, participant_id: ParticipantId) -> Vec<Trade> {
        self.state.read().ledger.trades_for_participant(participant_id)
    }

    pub fn recent_trades(&self, limit: usize) -> Vec<Trade> {
        self.state.read().ledger.recent(limit)
    }

    pub fn participant_snapshot(&self, participant_id: ParticipantId) -> Option<ParticipantSnapshot> {
        let state = self.state.read();
        state
            .participants
            .get(&participant_id)
            .map(|p| p.snapshot(&state.prices))
    }

    /// Snapshots of the whole population, sorted by participant id so
    /// downstream iteration is deterministic
    pub fn snapshots(&self) -> Vec<ParticipantSnapshot> {
        let state = self.state.read();
        let mut snapshots: Vec<ParticipantSnapshot> = state
            .participants
            .values()
            .map(|p| p.snapshot(&state.prices))
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }
}

// ============================================================================
// Tests
// ============================================================================
