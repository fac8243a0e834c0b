//! Crucible Epoch - Tournament Round Lifecycle
//!
//! The scheduler drives the `Open -> Closing -> Closed` cycle: it decides
//! when the running epoch's deadline has passed (or an administrator has
//! forced a close), suspends order intake through the engine, computes the
//! deterministic ranking, applies the elimination band, and rolls straight
//! into the next epoch. There is no idle gap between epochs.
//!
//! Ranking is a pure function over participant snapshots: PnL descending,
//! ties broken by participant id, so an identical ledger snapshot always
//! reproduces the same output.

use chrono::{DateTime, Duration, Utc};
use crucible_engine::{ArenaEngine, ParticipantSnapshot};
use crucible_types::{ArenaResult, EpochSummary, ParticipantId, RankingEntry};
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

// ============================================================================
// Configuration
// ============================================================================

/// Epoch scheduling configuration
#[derive(Debug, Clone)]
pub struct EpochConfig {
    /// Wall-clock length of one epoch
    pub duration_minutes: i64,
    /// Fraction of ranked participants eliminated from the bottom
    pub elimination_fraction: Decimal,
    /// Fraction of ranked participants marked ascension-eligible from the top
    pub ascension_fraction: Decimal,
    /// Closed-epoch summaries retained in memory
    pub history_limit: usize,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            duration_minutes: 240,
            elimination_fraction: Decimal::new(10, 2),
            ascension_fraction: Decimal::new(1, 2),
            history_limit: 50,
        }
    }
}

// ============================================================================
// Ranking
// ============================================================================

/// Rank the active population: PnL descending, participant id as the
/// deterministic tie break. Launched and eliminated participants are
/// excluded from the input.
pub fn compute_rankings(snapshots: &[ParticipantSnapshot]) -> Vec<RankingEntry> {
    let mut active: Vec<&ParticipantSnapshot> =
        snapshots.iter().filter(|s| s.tier.is_active()).collect();
    active.sort_by(|a, b| b.pnl.cmp(&a.pnl).then_with(|| a.id.cmp(&b.id)));

    active
        .iter()
        .enumerate()
        .map(|(i, snapshot)| RankingEntry {
            rank: (i + 1) as u32,
            participant_id: snapshot.id,
            value: snapshot.pnl,
        })
        .collect()
}

/// Band sizes for a ranked population of `n`
pub fn band_sizes(n: usize, config: &EpochConfig) -> (usize, usize) {
    if n == 0 {
        return (0, 0);
    }
    let n_dec = Decimal::from(n as u64);
    let eliminated = (n_dec * config.elimination_fraction)
        .floor()
        .to_usize()
        .unwrap_or(0);
    let eligible_floor = (n_dec * config.ascension_fraction)
        .floor()
        .to_usize()
        .unwrap_or(0);
    (eliminated, eligible_floor.max(1))
}

// ============================================================================
// Close Outcome
// ============================================================================

/// Everything the rest of the close sequence needs from one epoch close
#[derive(Debug, Clone)]
pub struct EpochCloseOutcome {
    pub summary: EpochSummary,
    /// Epoch ROI per ranked participant, for streak evaluation
    pub rois: HashMap<ParticipantId, Decimal>,
    pub next_epoch: u64,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Drives the epoch lifecycle against a shared engine.
///
/// The server owns the tick loop; this type owns the decisions: deadline
/// math, the close transaction, and the bounded history of summaries.
pub struct Scheduler {
    engine: Arc<ArenaEngine>,
    config: EpochConfig,
    history: RwLock<VecDeque<EpochSummary>>,
    force_close: AtomicBool,
}

impl Scheduler {
    pub fn new(engine: Arc<ArenaEngine>, config: EpochConfig) -> Self {
        Self {
            engine,
            config,
            history: RwLock::new(VecDeque::new()),
            force_close: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EpochConfig {
        &self.config
    }

    /// Wall-clock instant the running epoch is due to close
    pub fn deadline(&self) -> DateTime<Utc> {
        self.engine.epoch_opened_at() + Duration::minutes(self.config.duration_minutes)
    }

    /// Administrative override: the next scheduler pass closes the epoch
    /// regardless of the deadline
    pub fn request_force_close(&self) {
        info!("force close requested");
        self.force_close.store(true, Ordering::SeqCst);
    }

    pub fn should_close(&self, now: DateTime<Utc>) -> bool {
        self.force_close.load(Ordering::SeqCst) || now >= self.deadline()
    }

    /// Close the epoch if it is due. Returns `None` when the deadline has
    /// not passed and no force close is pending.
    pub fn maybe_close(&self, now: DateTime<Utc>) -> ArenaResult<Option<EpochCloseOutcome>> {
        if !self.should_close(now) {
            return Ok(None);
        }
        self.close_epoch().map(Some)
    }

    /// Run the full close transaction: suspend orders, rank, eliminate,
    /// publish the summary and reopen.
    pub fn close_epoch(&self) -> ArenaResult<EpochCloseOutcome> {
        let (epoch, started_at) = self.engine.begin_close()?;

        // Orders are rejected from here on, so the snapshot is stable
        let snapshots = self.engine.snapshots();
        let rankings = compute_rankings(&snapshots);
        let (eliminated_count, eligible_count) = band_sizes(rankings.len(), &self.config);

        let eliminated: Vec<ParticipantId> = rankings
            .iter()
            .rev()
            .take(eliminated_count)
            .map(|entry| entry.participant_id)
            .collect();
        let ascension_eligible: Vec<ParticipantId> = rankings
            .iter()
            .take(eligible_count)
            .map(|entry| entry.participant_id)
            .filter(|id| !eliminated.contains(id))
            .collect();

        self.engine.mark_eliminated(&eliminated)?;

        let rois: HashMap<ParticipantId, Decimal> = snapshots
            .iter()
            .filter(|s| s.tier.is_active())
            .map(|s| (s.id, s.roi))
            .collect();

        let summary = EpochSummary {
            epoch,
            started_at,
            closed_at: Utc::now(),
            rankings,
            eliminated,
            ascension_eligible,
            trade_count: self.engine.trades_for_epoch(epoch).len(),
        };

        let next_epoch = self.engine.finish_close()?;
        self.force_close.store(false, Ordering::SeqCst);

        {
            let mut history = self.history.write();
            history.push_front(summary.clone());
            history.truncate(self.config.history_limit);
        }

        info!(
            epoch,
            ranked = summary.rankings.len(),
            eliminated = summary.eliminated.len(),
            eligible = summary.ascension_eligible.len(),
            trades = summary.trade_count,
            "epoch closed"
        );

        Ok(EpochCloseOutcome {
            summary,
            rois,
            next_epoch,
        })
    }

    /// Closed-epoch summaries, most recent first
    pub fn history(&self) -> Vec<EpochSummary> {
        self.history.read().iter().cloned().collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_engine::EngineConfig;
    use crucible_types::{Side, Symbol, Tier};
    use rust_decimal_macros::dec;

    fn engine_with_prices() -> Arc<ArenaEngine> {
        let engine = Arc::new(ArenaEngine::new(EngineConfig {
            initial_balance: dec!(10000),
            slippage_fraction: dec!(0.01),
            symbols: vec![Symbol::new("SOL")],
        }));
        prime(&engine, dec!(100));
        engine
    }

    fn prime(engine: &ArenaEngine, price: Decimal) {
        let mut tick = crucible_types::PriceMap::new();
        tick.insert(Symbol::new("SOL"), price);
        engine.apply_price_update(&tick);
    }

    fn test_config() -> EpochConfig {
        EpochConfig {
            duration_minutes: 240,
            elimination_fraction: dec!(0.34),
            ascension_fraction: dec!(0.01),
            history_limit: 10,
        }
    }

    #[test]
    fn rankings_sort_by_pnl_with_id_tie_break() {
        let engine = engine_with_prices();
        let a = engine.register_participant("a");
        let b = engine.register_participant("b");
        // a and b stay flat at pnl 0, c trades into a gain
        let c = engine.register_participant("c");
        engine
            .submit_order(c, "SOL".into(), Side::Buy, dec!(10), vec![])
            .unwrap();
        prime(&engine, dec!(120));

        let rankings = compute_rankings(&engine.snapshots());
        assert_eq!(rankings.len(), 3);
        assert_eq!(rankings[0].participant_id, c);
        assert_eq!(rankings[0].rank, 1);

        // Tied at zero: ordered by id
        let tied: Vec<ParticipantId> =
            rankings[1..].iter().map(|r| r.participant_id).collect();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(tied, expected);
    }

    #[test]
    fn ranking_is_reproducible() {
        let engine = engine_with_prices();
        for i in 0..6 {
            engine.register_participant(format!("agent-{i}"));
        }
        let snaps = engine.snapshots();
        assert_eq!(compute_rankings(&snaps), compute_rankings(&snaps));
    }

    #[test]
    fn band_sizes_floor_and_minimum() {
        let config = EpochConfig {
            elimination_fraction: dec!(0.10),
            ascension_fraction: dec!(0.01),
            ..test_config()
        };
        assert_eq!(band_sizes(0, &config), (0, 0));
        // floor(5 * 0.1) = 0 eliminated, eligible clamps up to 1
        assert_eq!(band_sizes(5, &config), (0, 1));
        assert_eq!(band_sizes(10, &config), (1, 1));
        assert_eq!(band_sizes(250, &config), (25, 2));
    }

    #[test]
    fn close_eliminates_bottom_and_marks_top_eligible() {
        let engine = engine_with_prices();
        let winner = engine.register_participant("winner");
        engine.register_participant("middle");
        let loser = engine.register_participant("loser");

        engine
            .submit_order(winner, "SOL".into(), Side::Buy, dec!(10), vec![])
            .unwrap();
        engine
            .submit_order(loser, "SOL".into(), Side::Buy, dec!(10), vec![])
            .unwrap();
        // winner rides the move up, loser sells into it at the bottom
        engine
            .submit_order(loser, "SOL".into(), Side::Sell, dec!(10), vec![])
            .unwrap();
        prime(&engine, dec!(130));

        let scheduler = Scheduler::new(engine.clone(), test_config());
        let outcome = scheduler.close_epoch().unwrap();

        assert_eq!(outcome.summary.epoch, 1);
        assert_eq!(outcome.next_epoch, 2);
        assert_eq!(outcome.summary.eliminated, vec![loser]);
        assert_eq!(outcome.summary.ascension_eligible, vec![winner]);

        let snap = engine.participant_snapshot(loser).unwrap();
        assert_eq!(snap.tier, Tier::Eliminated);

        // Eliminated participants drop out of the next ranking
        let next = compute_rankings(&engine.snapshots());
        assert!(next.iter().all(|r| r.participant_id != loser));
    }

    #[test]
    fn close_records_rois_for_streak_evaluation() {
        let engine = engine_with_prices();
        let a = engine.register_participant("a");
        engine
            .submit_order(a, "SOL".into(), Side::Buy, dec!(10), vec![])
            .unwrap();
        prime(&engine, dec!(150));

        let scheduler = Scheduler::new(engine.clone(), test_config());
        let outcome = scheduler.close_epoch().unwrap();

        // bought 10 at 101, marked at 150: pnl 490 on 10000 initial
        assert_eq!(outcome.rois.get(&a).copied(), Some(dec!(0.049)));
    }

    #[test]
    fn consecutive_closes_never_idle() {
        let engine = engine_with_prices();
        engine.register_participant("a");
        let scheduler = Scheduler::new(engine.clone(), test_config());

        let first = scheduler.close_epoch().unwrap();
        let second = scheduler.close_epoch().unwrap();
        assert_eq!(first.summary.epoch, 1);
        assert_eq!(second.summary.epoch, 2);
        assert_eq!(engine.epoch(), 3);
        assert!(engine.phase().accepts_orders());

        let history = scheduler.history();
        assert_eq!(history.len(), 2);
        // Most recent first
        assert_eq!(history[0].epoch, 2);
    }

    #[test]
    fn force_close_fires_before_deadline() {
        let engine = engine_with_prices();
        let scheduler = Scheduler::new(engine, test_config());
        let now = Utc::now();

        assert!(!scheduler.should_close(now));
        assert!(scheduler.maybe_close(now).unwrap().is_none());

        scheduler.request_force_close();
        assert!(scheduler.should_close(now));
        let outcome = scheduler.maybe_close(now).unwrap();
        assert!(outcome.is_some());

        // Flag clears after the close
        assert!(!scheduler.should_close(now));
    }

    #[test]
    fn deadline_close_fires_after_duration() {
        let engine = engine_with_prices();
        let scheduler = Scheduler::new(engine, test_config());

        let late = Utc::now() + Duration::minutes(241);
        assert!(scheduler.should_close(late));
    }

    #[test]
    fn empty_population_close_still_advances() {
        let engine = Arc::new(ArenaEngine::new(EngineConfig::default()));
        let scheduler = Scheduler::new(engine.clone(), test_config());

        let outcome = scheduler.close_epoch().unwrap();
        assert!(outcome.summary.rankings.is_empty());
        assert!(outcome.summary.eliminated.is_empty());
        assert!(outcome.summary.ascension_eligible.is_empty());
        assert_eq!(engine.epoch(), 2);
    }

    #[test]
    fn history_is_bounded() {
        let engine = engine_with_prices();
        let scheduler = Scheduler::new(
            engine,
            EpochConfig {
                history_limit: 3,
                ..test_config()
            },
        );
        for _ in 0..5 {
            scheduler.close_epoch().unwrap();
        }
        let history = scheduler.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].epoch, 5);
        assert_eq!(history[2].epoch, 3);
    }
}
