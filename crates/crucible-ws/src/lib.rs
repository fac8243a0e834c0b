//! Crucible WS - Session Protocol and Registry
//!
//! This crate defines the JSON message protocol spoken over each
//! participant's WebSocket connection and the registry that tracks one
//! live session per participant. The socket accept loop itself lives in
//! the server binary; everything here is transport-agnostic.
//!
//! # Protocol
//!
//! All messages are JSON objects tagged with a `type` field.
//!
//! ## Order (client -> server)
//! ```json
//! {
//!     "type": "order",
//!     "symbol": "SOL",
//!     "side": "buy",
//!     "amount": "2.5",
//!     "reason": ["DIP_BUY", "MOMENTUM"]
//! }
//! ```
//!
//! ## Order result (server -> client)
//! ```json
//! {
//!     "type": "order_result",
//!     "success": true,
//!     "balance": "9747.50"
//! }
//! ```
//!
//! Price updates, epoch summaries and hive patches are broadcast to every
//! connected session; `welcome` and `order_result` are addressed to a
//! single participant through the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crucible_feed::{PriceInfo, PriceTick};
use crucible_hive::{HivePatch, HivePatchParameters, HiveStats};
use crucible_types::{EpochSummary, ParticipantId, RankingEntry, RejectReason, Side};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

// ============================================================================
// Configuration
// ============================================================================

/// Session handling configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Ping interval in seconds
    pub ping_interval_secs: u64,
    /// Outbound messages buffered per session before it is considered dead
    pub session_queue_size: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            session_queue_size: 256,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum WsError {
    #[error("participant {0} has no active session")]
    NotConnected(ParticipantId),

    #[error("session outbound queue is full or closed")]
    SessionGone,

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type WsResult<T> = Result<T, WsError>;

// ============================================================================
// Messages
// ============================================================================

/// Client message types
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit an order against the current reference price
    Order {
        symbol: String,
        side: Side,
        amount: Decimal,
        /// Free-form reason tags, attributed by the hive mind
        #[serde(default)]
        reason: Vec<String>,
    },
    /// Ping message
    Ping { id: Option<u64> },
}

/// Server message types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once on connect
    Welcome { balance: Decimal, epoch: u64 },
    /// Periodic reference price broadcast
    PriceUpdate { prices: HashMap<String, PriceInfo> },
    /// Synchronous reply to an order
    OrderResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        balance: Option<Decimal>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Epoch close broadcast
    EpochEnd {
        epoch: u64,
        rankings: Vec<RankingEntry>,
        eliminated: Vec<ParticipantId>,
    },
    /// Population feedback broadcast
    HivePatch {
        parameters: HivePatchParameters,
        stats: HiveStats,
    },
    /// Pong response
    Pong { id: Option<u64> },
    /// Error message
    Error { code: i32, message: String },
}

impl ServerMessage {
    pub fn welcome(balance: Decimal, epoch: u64) -> Self {
        Self::Welcome { balance, epoch }
    }

    pub fn price_update(tick: &PriceTick) -> Self {
        Self::PriceUpdate {
            prices: tick
                .prices
                .iter()
                .map(|(symbol, info)| (symbol.to_string(), info.clone()))
                .collect(),
        }
    }

    pub fn order_accepted(balance: Decimal) -> Self {
        Self::OrderResult {
            success: true,
            balance: Some(balance),
            error: None,
        }
    }

    pub fn order_rejected(reason: &RejectReason) -> Self {
        Self::OrderResult {
            success: false,
            balance: None,
            error: Some(reason.to_string()),
        }
    }

    pub fn epoch_end(summary: &EpochSummary) -> Self {
        Self::EpochEnd {
            epoch: summary.epoch,
            rankings: summary.rankings.clone(),
            eliminated: summary.eliminated.clone(),
        }
    }

    pub fn hive_patch(patch: &HivePatch) -> Self {
        Self::HivePatch {
            parameters: patch.parameters.clone(),
            stats: patch.stats.clone(),
        }
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::Error {
            code: 400,
            message: message.into(),
        }
    }
}

// ============================================================================
// Session Registry
// ============================================================================

struct SessionHandle {
    session_id: u64,
    sender: flume::Sender<ServerMessage>,
}

/// One live session per participant. A reconnect replaces the previous
/// session: the old handle is dropped, which closes the stale socket task's
/// queue, while the participant's engine state is untouched.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ParticipantId, SessionHandle>>,
    next_session_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Register a session for the participant, replacing any existing one.
    /// Returns the session id the caller must present when detaching.
    pub fn attach(
        &self,
        participant_id: ParticipantId,
        sender: flume::Sender<ServerMessage>,
    ) -> u64 {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let previous = self.sessions.write().insert(
            participant_id,
            SessionHandle { session_id, sender },
        );
        if previous.is_some() {
            info!(participant = %participant_id, session_id, "session replaced by reconnect");
        } else {
            info!(participant = %participant_id, session_id, "session attached");
        }
        session_id
    }

    /// Drop the participant's session, but only if it is still the one the
    /// caller attached. A stale detach after a reconnect is a no-op.
    pub fn detach(&self, participant_id: ParticipantId, session_id: u64) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(&participant_id) {
            Some(handle) if handle.session_id == session_id => {
                sessions.remove(&participant_id);
                info!(participant = %participant_id, session_id, "session detached");
                true
            }
            _ => {
                debug!(participant = %participant_id, session_id, "stale detach ignored");
                false
            }
        }
    }

    /// Queue a message for one participant's session
    pub fn send_to(&self, participant_id: ParticipantId, message: ServerMessage) -> WsResult<()> {
        let sessions = self.sessions.read();
        let handle = sessions
            .get(&participant_id)
            .ok_or(WsError::NotConnected(participant_id))?;
        handle
            .sender
            .try_send(message)
            .map_err(|_| WsError::SessionGone)
    }

    pub fn is_connected(&self, participant_id: ParticipantId) -> bool {
        self.sessions.read().contains_key(&participant_id)
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn connected_ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self.sessions.read().keys().copied().collect();
        ids.sort();
        ids
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crucible_types::Symbol;
    use rust_decimal_macros::dec;

    fn tick() -> PriceTick {
        let mut prices = HashMap::new();
        prices.insert(
            Symbol::from("SOL"),
            PriceInfo {
                price_usd: dec!(150.25),
                change_pct: None,
            },
        );
        PriceTick {
            prices,
            at: Utc::now(),
        }
    }

    #[test]
    fn order_message_deserializes_with_tags() {
        let json = r#"{"type":"order","symbol":"SOL","side":"buy","amount":"2.5","reason":["DIP_BUY"]}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Order {
                symbol,
                side,
                amount,
                reason,
            } => {
                assert_eq!(symbol, "SOL");
                assert_eq!(side, Side::Buy);
                assert_eq!(amount, dec!(2.5));
                assert_eq!(reason, vec!["DIP_BUY".to_string()]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn order_reason_defaults_to_empty() {
        let json = r#"{"type":"order","symbol":"ETH","side":"sell","amount":1}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ClientMessage::Order { reason, .. } if reason.is_empty()));
    }

    #[test]
    fn welcome_serializes_with_wire_field_names() {
        let json = serde_json::to_value(ServerMessage::welcome(dec!(10000), 3)).unwrap();
        assert_eq!(json["type"], "welcome");
        assert_eq!(json["balance"], "10000");
        assert_eq!(json["epoch"], 3);
    }

    #[test]
    fn price_update_uses_camel_case_price_info() {
        let json = serde_json::to_value(ServerMessage::price_update(&tick())).unwrap();
        assert_eq!(json["type"], "price_update");
        assert_eq!(json["prices"]["SOL"]["priceUsd"], "150.25");
    }

    #[test]
    fn order_result_omits_absent_fields() {
        let ok = serde_json::to_value(ServerMessage::order_accepted(dec!(9000))).unwrap();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["balance"], "9000");
        assert!(ok.get("error").is_none());

        let rejected =
            serde_json::to_value(ServerMessage::order_rejected(&RejectReason::InsufficientBalance))
                .unwrap();
        assert_eq!(rejected["success"], false);
        assert!(rejected.get("balance").is_none());
        assert!(rejected["error"].as_str().is_some());
    }

    #[test]
    fn epoch_end_carries_rankings_and_eliminated() {
        let winner = ParticipantId::new();
        let loser = ParticipantId::new();
        let summary = EpochSummary {
            epoch: 2,
            started_at: Utc::now(),
            closed_at: Utc::now(),
            rankings: vec![RankingEntry {
                rank: 1,
                participant_id: winner,
                value: dec!(290),
            }],
            eliminated: vec![loser],
            ascension_eligible: vec![winner],
            trade_count: 4,
        };

        let json = serde_json::to_value(ServerMessage::epoch_end(&summary)).unwrap();
        assert_eq!(json["type"], "epoch_end");
        assert_eq!(json["epoch"], 2);
        assert_eq!(json["rankings"][0]["value"], "290");
        assert_eq!(json["eliminated"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn ping_roundtrips_to_pong() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping","id":7}"#).unwrap();
        let id = match msg {
            ClientMessage::Ping { id } => id,
            other => panic!("unexpected message: {other:?}"),
        };
        let json = serde_json::to_value(ServerMessage::Pong { id }).unwrap();
        assert_eq!(json["type"], "pong");
        assert_eq!(json["id"], 7);
    }

    #[test]
    fn registry_attach_send_detach() {
        let registry = SessionRegistry::new();
        let id = ParticipantId::new();
        let (tx, rx) = flume::bounded(8);

        let session = registry.attach(id, tx);
        assert!(registry.is_connected(id));
        assert_eq!(registry.connection_count(), 1);

        registry.send_to(id, ServerMessage::welcome(dec!(100), 1)).unwrap();
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Welcome { .. })));

        assert!(registry.detach(id, session));
        assert!(!registry.is_connected(id));
        assert!(matches!(
            registry.send_to(id, ServerMessage::Pong { id: None }),
            Err(WsError::NotConnected(_))
        ));
    }

    #[test]
    fn reconnect_replaces_session() {
        let registry = SessionRegistry::new();
        let id = ParticipantId::new();
        let (old_tx, old_rx) = flume::bounded(8);
        let (new_tx, new_rx) = flume::bounded(8);

        let old_session = registry.attach(id, old_tx);
        let _new_session = registry.attach(id, new_tx);
        assert_eq!(registry.connection_count(), 1);

        registry.send_to(id, ServerMessage::welcome(dec!(100), 1)).unwrap();
        assert!(old_rx.try_recv().is_err());
        assert!(new_rx.try_recv().is_ok());

        // The old socket task's detach must not tear down the new session.
        assert!(!registry.detach(id, old_session));
        assert!(registry.is_connected(id));
    }

    #[test]
    fn connected_ids_are_sorted() {
        let registry = SessionRegistry::new();
        let mut ids: Vec<ParticipantId> = (0..4).map(|_| ParticipantId::new()).collect();
        for id in &ids {
            let (tx, _rx) = flume::bounded(1);
            registry.attach(*id, tx);
        }
        ids.sort();
        assert_eq!(registry.connected_ids(), ids);
    }
}
