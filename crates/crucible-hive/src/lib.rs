//! Crucible Hive - Population-Level Tag Attribution
//!
//! Strategies annotate every order with free-form reason tags. At each
//! epoch close the hive mind scans the epoch's trades and attributes each
//! trade's holder's current PnL sign to every tag on it. The attribution is
//! deliberately coarse: a tag is credited with a win when the participant
//! carrying it is net profitable right now, not when that particular trade
//! made money. What matters is the population-level feedback loop, not
//! statistical rigor.
//!
//! Tags whose win rate clears the high-water mark are boosted, tags under
//! the low-water mark are penalized, and the resulting patch is broadcast
//! to every connected participant. Honoring it is the strategy's own
//! business; the engine attaches no consequence to ignoring it.

use crucible_types::{ParticipantId, Trade};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct HiveConfig {
    /// Win rate a tag must exceed to be boosted
    pub boost_threshold: Decimal,
    /// Win rate under which a tag is penalized
    pub penalize_threshold: Decimal,
    /// Tags with fewer attributed trades than this are not scored
    pub min_samples: u32,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            boost_threshold: dec!(0.65),
            penalize_threshold: dec!(0.35),
            min_samples: 4,
        }
    }
}

// ============================================================================
// Patch types
// ============================================================================

/// Score sheet for one tag over one epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagScore {
    pub tag: String,
    /// Trades carrying this tag in the epoch
    pub samples: u32,
    /// Samples held by a currently profitable participant
    pub wins: u32,
    pub win_rate: Decimal,
    /// Sum of holder PnL signs, a crude direction indicator
    pub pnl_sign_sum: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HivePatchParameters {
    pub boost: Vec<String>,
    pub penalize: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiveStats {
    pub epoch: u64,
    pub trades_scanned: usize,
    /// Tags that met the sample minimum
    pub tags_scored: usize,
}

/// The per-epoch broadcast. Parameters may be empty when no tag crossed a
/// threshold; the patch is still published so clients see the epoch tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HivePatch {
    pub parameters: HivePatchParameters,
    pub stats: HiveStats,
}

impl HivePatch {
    pub fn is_empty(&self) -> bool {
        self.parameters.boost.is_empty() && self.parameters.penalize.is_empty()
    }
}

// ============================================================================
// Aggregator
// ============================================================================

#[derive(Default)]
struct HiveState {
    last_patch: Option<HivePatch>,
    scores: Vec<TagScore>,
}

/// Aggregates trade outcomes by tag and keeps the latest patch for
/// inspection.
pub struct HiveMind {
    config: HiveConfig,
    state: RwLock<HiveState>,
}

impl HiveMind {
    pub fn new(config: HiveConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HiveState::default()),
        }
    }

    pub fn config(&self) -> &HiveConfig {
        &self.config
    }

    /// Score one closed epoch. `pnl_by_participant` is each holder's PnL at
    /// close; a participant missing from it counts as flat. Output ordering
    /// is fully deterministic: every list is sorted by tag.
    pub fn aggregate(
        &self,
        epoch: u64,
        trades: &[Trade],
        pnl_by_participant: &HashMap<ParticipantId, Decimal>,
    ) -> HivePatch {
        let mut samples: HashMap<&str, (u32, u32, i64)> = HashMap::new();

        for trade in trades {
            let pnl = pnl_by_participant
                .get(&trade.participant_id)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let win = pnl > Decimal::ZERO;
            let sign = match pnl.cmp(&Decimal::ZERO) {
                std::cmp::Ordering::Greater => 1,
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
            };
            for tag in &trade.tags {
                let entry = samples.entry(tag.as_str()).or_insert((0, 0, 0));
                entry.0 += 1;
                if win {
                    entry.1 += 1;
                }
                entry.2 += sign;
            }
        }

        let mut scores: Vec<TagScore> = samples
            .into_iter()
            .filter(|(_, (count, _, _))| *count >= self.config.min_samples)
            .map(|(tag, (count, wins, sign_sum))| TagScore {
                tag: tag.to_string(),
                samples: count,
                wins,
                win_rate: Decimal::from(wins) / Decimal::from(count),
                pnl_sign_sum: sign_sum,
            })
            .collect();
        scores.sort_by(|a, b| a.tag.cmp(&b.tag));

        let mut boost = Vec::new();
        let mut penalize = Vec::new();
        for score in &scores {
            if score.win_rate > self.config.boost_threshold {
                boost.push(score.tag.clone());
            } else if score.win_rate < self.config.penalize_threshold {
                penalize.push(score.tag.clone());
            }
            debug!(
                tag = %score.tag,
                samples = score.samples,
                win_rate = %score.win_rate,
                "tag scored"
            );
        }

        let patch = HivePatch {
            parameters: HivePatchParameters { boost, penalize },
            stats: HiveStats {
                epoch,
                trades_scanned: trades.len(),
                tags_scored: scores.len(),
            },
        };

        info!(
            epoch,
            trades = trades.len(),
            boosted = patch.parameters.boost.len(),
            penalized = patch.parameters.penalize.len(),
            "hive patch computed"
        );

        let mut state = self.state.write();
        state.scores = scores;
        state.last_patch = Some(patch.clone());
        patch
    }

    pub fn last_patch(&self) -> Option<HivePatch> {
        self.state.read().last_patch.clone()
    }

    pub fn tag_scores(&self) -> Vec<TagScore> {
        self.state.read().scores.clone()
    }
}

impl Default for HiveMind {
    fn default() -> Self {
        Self::new(HiveConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crucible_types::{Side, Symbol, TradeId};

    fn trade(participant_id: ParticipantId, tags: &[&str]) -> Trade {
        Trade {
            id: TradeId::new(),
            participant_id,
            symbol: Symbol::from("SOL"),
            side: Side::Buy,
            quantity: dec!(1),
            executed_price: dec!(100),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            epoch: 1,
            sequence: 1,
            executed_at: Utc::now(),
        }
    }

    #[test]
    fn majority_profitable_tag_is_boosted() {
        let hive = HiveMind::default();
        let winner = ParticipantId::new();
        let loser = ParticipantId::new();

        // 10 DIP_BUY trades, 7 held by a profitable participant.
        let mut trades = Vec::new();
        for _ in 0..7 {
            trades.push(trade(winner, &["DIP_BUY"]));
        }
        for _ in 0..3 {
            trades.push(trade(loser, &["DIP_BUY"]));
        }
        let pnl = HashMap::from([(winner, dec!(500)), (loser, dec!(-200))]);

        let patch = hive.aggregate(1, &trades, &pnl);
        assert_eq!(patch.parameters.boost, vec!["DIP_BUY".to_string()]);
        assert!(patch.parameters.penalize.is_empty());
        assert_eq!(patch.stats.trades_scanned, 10);

        let scores = hive.tag_scores();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].samples, 10);
        assert_eq!(scores[0].wins, 7);
        assert_eq!(scores[0].win_rate, dec!(0.7));
        assert_eq!(scores[0].pnl_sign_sum, 4);
    }

    #[test]
    fn losing_tag_is_penalized() {
        let hive = HiveMind::default();
        let loser = ParticipantId::new();
        let trades: Vec<Trade> = (0..5).map(|_| trade(loser, &["FOMO"])).collect();
        let pnl = HashMap::from([(loser, dec!(-50))]);

        let patch = hive.aggregate(1, &trades, &pnl);
        assert!(patch.parameters.boost.is_empty());
        assert_eq!(patch.parameters.penalize, vec!["FOMO".to_string()]);
    }

    #[test]
    fn thin_samples_are_not_scored() {
        let hive = HiveMind::default();
        let winner = ParticipantId::new();
        let trades: Vec<Trade> = (0..3).map(|_| trade(winner, &["RARE"])).collect();
        let pnl = HashMap::from([(winner, dec!(100))]);

        let patch = hive.aggregate(1, &trades, &pnl);
        assert!(patch.is_empty());
        assert_eq!(patch.stats.tags_scored, 0);
        assert!(hive.tag_scores().is_empty());
    }

    #[test]
    fn every_tag_on_a_trade_is_credited() {
        let hive = HiveMind::new(HiveConfig {
            min_samples: 1,
            ..HiveConfig::default()
        });
        let winner = ParticipantId::new();
        let trades = vec![trade(winner, &["MOMENTUM", "BREAKOUT"])];
        let pnl = HashMap::from([(winner, dec!(10))]);

        let patch = hive.aggregate(1, &trades, &pnl);
        assert_eq!(
            patch.parameters.boost,
            vec!["BREAKOUT".to_string(), "MOMENTUM".to_string()]
        );
    }

    #[test]
    fn unknown_holder_counts_as_flat() {
        let hive = HiveMind::new(HiveConfig {
            min_samples: 1,
            ..HiveConfig::default()
        });
        let ghost = ParticipantId::new();
        let trades: Vec<Trade> = (0..4).map(|_| trade(ghost, &["DRIFT"])).collect();

        let patch = hive.aggregate(1, &trades, &HashMap::new());
        // 0% win rate, under the low-water mark.
        assert_eq!(patch.parameters.penalize, vec!["DRIFT".to_string()]);
        assert_eq!(hive.tag_scores()[0].pnl_sign_sum, 0);
    }

    #[test]
    fn middling_win_rate_emits_an_empty_patch() {
        let hive = HiveMind::default();
        let winner = ParticipantId::new();
        let loser = ParticipantId::new();
        let mut trades = Vec::new();
        for _ in 0..2 {
            trades.push(trade(winner, &["COIN_FLIP"]));
        }
        for _ in 0..2 {
            trades.push(trade(loser, &["COIN_FLIP"]));
        }
        let pnl = HashMap::from([(winner, dec!(10)), (loser, dec!(-10))]);

        let patch = hive.aggregate(3, &trades, &pnl);
        assert!(patch.is_empty());
        // Still published with its stats.
        assert_eq!(patch.stats.epoch, 3);
        assert_eq!(patch.stats.tags_scored, 1);
        assert_eq!(hive.last_patch(), Some(patch));
    }

    #[test]
    fn patch_serializes_with_wire_field_names() {
        let hive = HiveMind::new(HiveConfig {
            min_samples: 1,
            ..HiveConfig::default()
        });
        let winner = ParticipantId::new();
        let trades = vec![trade(winner, &["DIP_BUY"])];
        let pnl = HashMap::from([(winner, dec!(5))]);

        let patch = hive.aggregate(2, &trades, &pnl);
        let value = serde_json::to_value(&patch).unwrap();
        assert_eq!(value["parameters"]["boost"][0], "DIP_BUY");
        assert_eq!(value["stats"]["epoch"], 2);
    }
}
