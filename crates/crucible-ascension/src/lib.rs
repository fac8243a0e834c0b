//! Crucible Ascension - Competition Ladder and Liquidity Pool
//!
//! Evaluated once per epoch close, the tracker moves participants up the
//! `Training -> PaidArena -> Launched` ladder. A tier is left by stringing
//! together consecutive winning epochs above that tier's ROI floor while
//! ranked inside the ascension band; any miss resets the streak but never
//! demotes. Leaving `Training` costs a one-time entry fee that is credited
//! to the shared liquidity pool and earmarked for the payer; leaving
//! `PaidArena` hands that earmark to the settlement bridge as the launch
//! stake.
//!
//! Launch execution is asynchronous and unreliable, so qualification and
//! confirmation are separate steps: qualifying creates a pending launch
//! record and emits a `LaunchRequest`, and only a confirmed bridge call
//! promotes the participant to `Launched` and consumes the earmark. Pending
//! launches are re-emitted on later closes instead of being re-evaluated,
//! and once the retry budget is spent they are flagged for manual
//! intervention rather than dropped.

use chrono::{DateTime, Utc};
use crucible_engine::{ArenaEngine, ParticipantSnapshot};
use crucible_epoch::EpochCloseOutcome;
use crucible_settlement::{strategy_fingerprint, LaunchConfirmation, LaunchRequest};
use crucible_types::{ArenaResult, LaunchTaskId, ParticipantId, Tier};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct AscensionConfig {
    /// Consecutive qualifying wins needed to leave `Training`
    pub training_win_threshold: u32,
    /// Epoch ROI a `Training` win must exceed
    pub training_roi_floor: Decimal,
    /// Consecutive qualifying wins needed to leave `PaidArena`
    pub arena_win_threshold: u32,
    /// Epoch ROI a `PaidArena` win must exceed
    pub arena_roi_floor: Decimal,
    /// One-time fee charged on promotion into the paid arena
    pub entry_fee: Decimal,
    /// Failed launch driver runs tolerated before flagging for manual
    /// intervention
    pub launch_retry_budget: u32,
    /// Identity the settlement bridge launches on behalf of
    pub owner_identity: String,
}

impl Default for AscensionConfig {
    fn default() -> Self {
        Self {
            training_win_threshold: 2,
            training_roi_floor: dec!(0.25),
            arena_win_threshold: 2,
            arena_roi_floor: dec!(0.50),
            entry_fee: dec!(1000),
            launch_retry_budget: 5,
            owner_identity: "crucible-treasury".to_string(),
        }
    }
}

impl AscensionConfig {
    /// Win streak and ROI floor a participant in `tier` must clear, or
    /// `None` for tiers with nothing left to qualify for.
    pub fn tier_requirements(&self, tier: Tier) -> Option<(u32, Decimal)> {
        match tier {
            Tier::Training => Some((self.training_win_threshold, self.training_roi_floor)),
            Tier::PaidArena => Some((self.arena_win_threshold, self.arena_roi_floor)),
            Tier::Launched | Tier::Eliminated => None,
        }
    }
}

// ============================================================================
// Liquidity Pool
// ============================================================================

/// Shared pool of collected entry fees. The balance only grows as fees come
/// in; the single way money leaves is a confirmed launch consuming the
/// payer's earmarked share.
#[derive(Debug, Default)]
pub struct LiquidityPool {
    balance: Decimal,
    earmarks: HashMap<ParticipantId, Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSnapshot {
    pub balance: Decimal,
    pub earmarked_total: Decimal,
    pub earmark_count: usize,
}

impl LiquidityPool {
    pub fn credit_fee(&mut self, participant_id: ParticipantId, fee: Decimal) {
        self.balance += fee;
        *self.earmarks.entry(participant_id).or_insert(Decimal::ZERO) += fee;
    }

    pub fn earmark_for(&self, participant_id: ParticipantId) -> Decimal {
        self.earmarks
            .get(&participant_id)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Remove and return the participant's earmark, debiting the balance.
    /// `None` when nothing is earmarked, in which case the balance is
    /// untouched.
    pub fn consume(&mut self, participant_id: ParticipantId) -> Option<Decimal> {
        let share = self.earmarks.remove(&participant_id)?;
        self.balance -= share;
        Some(share)
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            balance: self.balance,
            earmarked_total: self.earmarks.values().copied().sum(),
            earmark_count: self.earmarks.len(),
        }
    }
}

// ============================================================================
// Launch bookkeeping
// ============================================================================

/// A qualified launch that the bridge has not confirmed yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingLaunch {
    /// Epoch the participant qualified in; the idempotency key keeps using
    /// it across retries
    pub epoch: u64,
    /// Failed driver runs so far
    pub attempts: u32,
    pub needs_manual_intervention: bool,
}

/// A launch the bridge confirmed, kept for audit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedLaunch {
    pub participant_id: ParticipantId,
    pub epoch: u64,
    pub task_id: LaunchTaskId,
    pub tx_reference: Option<String>,
    pub pool_share: Decimal,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Promotion {
    pub participant_id: ParticipantId,
    pub to: Tier,
}

/// Everything one epoch close decided about the ladder
#[derive(Debug, Clone, Default)]
pub struct EpochEvaluation {
    pub epoch: u64,
    pub promotions: Vec<Promotion>,
    /// Launch requests the caller should drive against the bridge, newly
    /// qualified and pending retries alike
    pub launches: Vec<LaunchRequest>,
    /// Participants whose promotion was skipped because the entry fee
    /// exceeded their balance; their streak is preserved
    pub deferred: Vec<ParticipantId>,
    /// Pending launches out of retry budget, awaiting an operator
    pub flagged: Vec<ParticipantId>,
}

// ============================================================================
// Tracker
// ============================================================================

#[derive(Default)]
struct TrackerState {
    pool: LiquidityPool,
    pending: HashMap<ParticipantId, PendingLaunch>,
    completed: Vec<CompletedLaunch>,
}

pub struct AscensionTracker {
    engine: Arc<ArenaEngine>,
    config: AscensionConfig,
    state: RwLock<TrackerState>,
}

impl AscensionTracker {
    pub fn new(engine: Arc<ArenaEngine>, config: AscensionConfig) -> Self {
        Self {
            engine,
            config,
            state: RwLock::new(TrackerState::default()),
        }
    }

    pub fn config(&self) -> &AscensionConfig {
        &self.config
    }

    /// Apply one closed epoch to the ladder. Streaks are updated for every
    /// ranked participant, promotions and launch qualifications fire where
    /// thresholds are met, and unconfirmed launches from earlier closes are
    /// re-emitted for another driver run.
    pub fn evaluate_epoch(&self, outcome: &EpochCloseOutcome) -> ArenaResult<EpochEvaluation> {
        let epoch = outcome.summary.epoch;
        let eligible: HashSet<ParticipantId> =
            outcome.summary.ascension_eligible.iter().copied().collect();
        let eliminated: HashSet<ParticipantId> =
            outcome.summary.eliminated.iter().copied().collect();

        let mut evaluation = EpochEvaluation {
            epoch,
            ..EpochEvaluation::default()
        };

        let mut guard = self.state.write();
        let state = &mut *guard;

        // Participants awaiting bridge confirmation are retried, not
        // re-evaluated against this epoch's ranking.
        let mut pending_ids: Vec<ParticipantId> = state.pending.keys().copied().collect();
        pending_ids.sort();
        for id in pending_ids {
            let share = state.pool.earmark_for(id);
            let snapshot = self.engine.participant_snapshot(id);
            let record = match state.pending.get_mut(&id) {
                Some(record) => record,
                None => continue,
            };
            if record.needs_manual_intervention {
                evaluation.flagged.push(id);
                continue;
            }
            match snapshot {
                Some(snapshot) if snapshot.tier == Tier::Eliminated => {
                    record.needs_manual_intervention = true;
                    warn!(
                        participant = %id,
                        qualified_epoch = record.epoch,
                        "pending launch holder was eliminated, flagging for manual intervention"
                    );
                    evaluation.flagged.push(id);
                }
                Some(snapshot) => {
                    evaluation
                        .launches
                        .push(self.launch_request(&snapshot, record.epoch, share));
                }
                None => {
                    record.needs_manual_intervention = true;
                    warn!(
                        participant = %id,
                        "pending launch holder no longer registered, flagging for manual intervention"
                    );
                    evaluation.flagged.push(id);
                }
            }
        }

        for entry in &outcome.summary.rankings {
            let id = entry.participant_id;
            if eliminated.contains(&id) || state.pending.contains_key(&id) {
                continue;
            }
            let snapshot = match self.engine.participant_snapshot(id) {
                Some(snapshot) => snapshot,
                None => continue,
            };
            let (threshold, floor) = match self.config.tier_requirements(snapshot.tier) {
                Some(requirements) => requirements,
                None => continue,
            };

            let roi = outcome.rois.get(&id).copied().unwrap_or(Decimal::ZERO);
            let won = eligible.contains(&id) && roi > floor;
            let streak = self.engine.record_qualifying_result(id, won)?;
            if !won || streak < threshold {
                continue;
            }

            match snapshot.tier {
                Tier::Training => {
                    if self.engine.try_charge_entry_fee(id, self.config.entry_fee)? {
                        state.pool.credit_fee(id, self.config.entry_fee);
                        self.engine.promote_tier(id, Tier::PaidArena)?;
                        evaluation.promotions.push(Promotion {
                            participant_id: id,
                            to: Tier::PaidArena,
                        });
                    } else {
                        evaluation.deferred.push(id);
                    }
                }
                Tier::PaidArena => {
                    let share = state.pool.earmark_for(id);
                    state.pending.insert(
                        id,
                        PendingLaunch {
                            epoch,
                            attempts: 0,
                            needs_manual_intervention: false,
                        },
                    );
                    evaluation
                        .launches
                        .push(self.launch_request(&snapshot, epoch, share));
                    info!(participant = %id, epoch, "launch qualified, settlement requested");
                }
                Tier::Launched | Tier::Eliminated => {}
            }
        }

        Ok(evaluation)
    }

    /// Persist a bridge-confirmed launch: promote to `Launched`, consume the
    /// pool earmark, and archive the receipt. Returns `false` without any
    /// effect when no launch is pending for the participant, so a duplicate
    /// confirmation cannot double-debit the pool.
    pub fn confirm_launch(
        &self,
        participant_id: ParticipantId,
        confirmation: &LaunchConfirmation,
    ) -> ArenaResult<bool> {
        if !self.state.read().pending.contains_key(&participant_id) {
            return Ok(false);
        }
        self.engine.promote_tier(participant_id, Tier::Launched)?;

        let mut guard = self.state.write();
        let state = &mut *guard;
        let record = match state.pending.remove(&participant_id) {
            Some(record) => record,
            None => return Ok(false),
        };
        let share = state.pool.consume(participant_id).unwrap_or(Decimal::ZERO);
        info!(
            participant = %participant_id,
            task = %confirmation.task_id,
            %share,
            "launch confirmed, pool share consumed"
        );
        state.completed.push(CompletedLaunch {
            participant_id,
            epoch: record.epoch,
            task_id: confirmation.task_id,
            tx_reference: confirmation.tx_reference.clone(),
            pool_share: share,
            confirmed_at: confirmation.confirmed_at,
        });
        Ok(true)
    }

    /// Count one failed driver run against the pending launch. Returns
    /// `true` once the record is flagged for manual intervention.
    pub fn record_launch_failure(&self, participant_id: ParticipantId) -> bool {
        let mut state = self.state.write();
        let record = match state.pending.get_mut(&participant_id) {
            Some(record) => record,
            None => return false,
        };
        record.attempts += 1;
        if record.attempts >= self.config.launch_retry_budget && !record.needs_manual_intervention
        {
            record.needs_manual_intervention = true;
            warn!(
                participant = %participant_id,
                attempts = record.attempts,
                "launch retry budget exhausted, flagged for manual intervention"
            );
        }
        record.needs_manual_intervention
    }

    pub fn pool_snapshot(&self) -> PoolSnapshot {
        self.state.read().pool.snapshot()
    }

    pub fn pending_launches(&self) -> Vec<(ParticipantId, PendingLaunch)> {
        let state = self.state.read();
        let mut pending: Vec<(ParticipantId, PendingLaunch)> = state
            .pending
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect();
        pending.sort_by_key(|(id, _)| *id);
        pending
    }

    pub fn completed_launches(&self) -> Vec<CompletedLaunch> {
        self.state.read().completed.clone()
    }

    fn launch_request(
        &self,
        snapshot: &ParticipantSnapshot,
        epoch: u64,
        pool_share: Decimal,
    ) -> LaunchRequest {
        let fingerprint = strategy_fingerprint(&snapshot.name, &snapshot.id.to_string());
        LaunchRequest::new(
            snapshot.id,
            epoch,
            self.config.owner_identity.clone(),
            fingerprint,
            pool_share,
        )
    }
}
