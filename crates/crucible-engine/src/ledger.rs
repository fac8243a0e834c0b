//! Append-only trade ledger.
//!
//! The ledger is the authoritative audit log of the tournament: every
//! accepted order appends exactly one [`Trade`] and nothing ever mutates or
//! removes one. Rankings and the hive mind are derived from it, never from
//! running counters alone.
//!
//! # Invariants
//!
//! - Entries are append-only
//! - Within one participant, `sequence` is dense and strictly increasing
//! - Readers see a consistent prefix (the engine's lock is the boundary)

use crucible_types::{ParticipantId, Trade};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct TradeLedger {
    trades: Vec<Trade>,
    sequences: HashMap<ParticipantId, u64>,
}

impl TradeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next per-participant sequence number, starting at 1
    pub fn next_sequence(&mut self, participant_id: ParticipantId) -> u64 {
        let seq = self.sequences.entry(participant_id).or_insert(0);
        *seq += 1;
        *seq
    }

    pub fn append(&mut self, trade: Trade) {
        self.trades.push(trade);
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn all(&self) -> &[Trade] {
        &self.trades
    }

    /// Trades settled during the given epoch, in append order
    pub fn trades_for_epoch(&self, epoch: u64) -> Vec<Trade> {
        self.trades
            .iter()
            .filter(|t| t.epoch == epoch)
            .cloned()
            .collect()
    }

    pub fn trades_for_participant(&self, participant_id: ParticipantId) -> Vec<Trade> {
        self.trades
            .iter()
            .filter(|t| t.participant_id == participant_id)
            .cloned()
            .collect()
    }

    /// Most recent trades, newest last
    pub fn recent(&self, limit: usize) -> Vec<Trade> {
        let start = self.trades.len().saturating_sub(limit);
        self.trades[start..].to_vec()
    }
}
