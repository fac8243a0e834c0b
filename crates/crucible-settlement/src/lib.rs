//! Crucible Settlement - Launch execution against the settlement bridge
//!
//! A participant that completes the paid arena graduates through a single
//! irreversible launch call to an external settlement service. This crate
//! owns that boundary: the `SettlementBridge` trait, the HTTP client that
//! talks to a real bridge, an in-memory bridge for tests and demos, and
//! the retry driver that turns one logical launch into a bounded sequence
//! of attempts with backoff and status polling.
//!
//! Launches are idempotent by `(participant, epoch)`: submitting the same
//! request twice must resolve to the same task on the bridge side, so a
//! retry after a lost response can never launch a participant twice.

use chrono::{DateTime, Utc};
use crucible_types::{LaunchTaskId, ParticipantId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("settlement bridge timed out")]
    Timeout,

    #[error("settlement bridge transport failure: {0}")]
    Transport(String),

    #[error("launch rejected by settlement bridge: {0}")]
    Rejected(String),

    #[error("unknown launch task: {0}")]
    UnknownTask(LaunchTaskId),
}

impl BridgeError {
    /// Transient errors are worth another attempt; rejections are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport(_))
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

// ============================================================================
// Wire types
// ============================================================================

/// Everything the bridge needs to launch one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub participant_id: ParticipantId,
    /// Epoch in which the participant qualified. Part of the idempotency key.
    pub epoch: u64,
    pub owner_identity: String,
    pub strategy_fingerprint: String,
    /// Liquidity pool share earmarked for this launch.
    pub pool_share: Decimal,
}

impl LaunchRequest {
    pub fn new(
        participant_id: ParticipantId,
        epoch: u64,
        owner_identity: impl Into<String>,
        strategy_fingerprint: impl Into<String>,
        pool_share: Decimal,
    ) -> Self {
        Self {
            participant_id,
            epoch,
            owner_identity: owner_identity.into(),
            strategy_fingerprint: strategy_fingerprint.into(),
            pool_share,
        }
    }

    /// The key the bridge deduplicates on.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.participant_id, self.epoch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStatus {
    Pending,
    Confirmed,
    Failed,
}

impl fmt::Display for LaunchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Snapshot of one launch task as reported by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchReceipt {
    pub task_id: LaunchTaskId,
    pub status: LaunchStatus,
    /// External transaction reference, present once the launch is confirmed.
    pub tx_reference: Option<String>,
}

/// Final outcome of a successful launch driver run.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchConfirmation {
    pub task_id: LaunchTaskId,
    pub tx_reference: Option<String>,
    pub confirmed_at: DateTime<Utc>,
}

// ============================================================================
// Bridge trait
// ============================================================================

#[async_trait::async_trait]
pub trait SettlementBridge: Send + Sync {
    fn name(&self) -> &str;

    /// Submit a launch. Must be idempotent by `(participant_id, epoch)`:
    /// a duplicate submission resolves to the already-created task.
    async fn launch(&self, request: &LaunchRequest) -> BridgeResult<LaunchTaskId>;

    /// Poll the state of a previously created task.
    async fn check_status(&self, task_id: &LaunchTaskId) -> BridgeResult<LaunchReceipt>;
}

/// Hash of a strategy's identity, sent to the bridge so the launched asset
/// can be tied back to the exact strategy that earned it.
pub fn strategy_fingerprint(strategy_name: &str, parameters: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(strategy_name.as_bytes());
    hasher.update(b":");
    hasher.update(parameters.as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// Retry policy and launch driver
// ============================================================================

/// Bounds on one driver run: how many launch attempts, how long each may
/// take, and how status polling behaves after the task is created.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub status_poll_interval_ms: u64,
    pub status_poll_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_ms: 10_000,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            status_poll_interval_ms: 1_000,
            status_poll_attempts: 10,
        }
    }
}

impl RetryPolicy {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Exponential backoff before the given attempt (1-based), capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Drive one launch to completion: submit with bounded retries, then poll
/// until the bridge confirms or fails the task. Returns an error once the
/// attempt budget is spent; the caller decides whether to try again later.
pub async fn run_launch(
    bridge: &dyn SettlementBridge,
    request: &LaunchRequest,
    policy: &RetryPolicy,
) -> BridgeResult<LaunchConfirmation> {
    let mut last_error = BridgeError::Timeout;

    for attempt in 1..=policy.max_attempts {
        if attempt > 1 {
            tokio::time::sleep(policy.backoff_for(attempt)).await;
        }

        let outcome = tokio::time::timeout(policy.attempt_timeout(), bridge.launch(request)).await;
        let task_id = match outcome {
            Err(_) => {
                warn!(
                    key = %request.idempotency_key(),
                    attempt,
                    "launch attempt timed out"
                );
                last_error = BridgeError::Timeout;
                continue;
            }
            Ok(Err(e)) if e.is_retryable() => {
                warn!(
                    key = %request.idempotency_key(),
                    attempt,
                    error = %e,
                    "launch attempt failed"
                );
                last_error = e;
                continue;
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(task_id)) => task_id,
        };

        match await_confirmation(bridge, &task_id, policy).await {
            Ok(confirmation) => {
                info!(
                    key = %request.idempotency_key(),
                    task_id = %confirmation.task_id,
                    attempt,
                    "launch confirmed"
                );
                return Ok(confirmation);
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    key = %request.idempotency_key(),
                    task_id = %task_id,
                    attempt,
                    error = %e,
                    "launch confirmation not reached"
                );
                last_error = e;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error)
}

async fn await_confirmation(
    bridge: &dyn SettlementBridge,
    task_id: &LaunchTaskId,
    policy: &RetryPolicy,
) -> BridgeResult<LaunchConfirmation> {
    for poll in 0..=policy.status_poll_attempts {
        if poll > 0 {
            tokio::time::sleep(Duration::from_millis(policy.status_poll_interval_ms)).await;
        }

        let receipt =
            tokio::time::timeout(policy.attempt_timeout(), bridge.check_status(task_id))
                .await
                .map_err(|_| BridgeError::Timeout)??;

        match receipt.status {
            LaunchStatus::Confirmed => {
                return Ok(LaunchConfirmation {
                    task_id: receipt.task_id,
                    tx_reference: receipt.tx_reference,
                    confirmed_at: Utc::now(),
                });
            }
            LaunchStatus::Failed => {
                return Err(BridgeError::Rejected(format!(
                    "task {task_id} failed on the bridge"
                )));
            }
            LaunchStatus::Pending => {}
        }
    }

    Err(BridgeError::Timeout)
}

// ============================================================================
// HTTP bridge
// ============================================================================

/// Client for a real settlement service speaking JSON over HTTP.
///
/// `POST {base}/launch` with a `LaunchRequest` body returns `{"task_id"}`;
/// `GET {base}/status/{task_id}` returns a `LaunchReceipt`.
pub struct HttpBridge {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    task_id: LaunchTaskId,
}

impl HttpBridge {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn map_transport(e: reqwest::Error) -> BridgeError {
        if e.is_timeout() {
            BridgeError::Timeout
        } else {
            BridgeError::Transport(e.to_string())
        }
    }
}

#[async_trait::async_trait]
impl SettlementBridge for HttpBridge {
    fn name(&self) -> &str {
        "http"
    }

    async fn launch(&self, request: &LaunchRequest) -> BridgeResult<LaunchTaskId> {
        let url = format!("{}/launch", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(Self::map_transport)?;

        if response.status().is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Rejected(body));
        }

        let parsed: LaunchResponse = response
            .error_for_status()
            .map_err(Self::map_transport)?
            .json()
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        Ok(parsed.task_id)
    }

    async fn check_status(&self, task_id: &LaunchTaskId) -> BridgeResult<LaunchReceipt> {
        let url = format!("{}/status/{}", self.base_url, task_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Self::map_transport)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BridgeError::UnknownTask(*task_id));
        }

        response
            .error_for_status()
            .map_err(Self::map_transport)?
            .json()
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }
}

// ============================================================================
// In-memory bridge
// ============================================================================

#[derive(Debug, Clone)]
struct TaskRecord {
    participant_id: ParticipantId,
    epoch: u64,
    polls_until_confirmed: u32,
    failed: bool,
}

#[derive(Default)]
struct BridgeState {
    tasks: std::collections::HashMap<LaunchTaskId, TaskRecord>,
    by_key: std::collections::HashMap<(ParticipantId, u64), LaunchTaskId>,
    launch_calls: u32,
    fail_remaining: u32,
    reject_reason: Option<String>,
    confirmation_delay_polls: u32,
}

/// Bridge fake with scriptable failure behavior. Used by tests and by the
/// demo server when no real bridge URL is configured.
pub struct InMemoryBridge {
    state: parking_lot::Mutex<BridgeState>,
}

impl InMemoryBridge {
    /// Confirms every launch on the first status poll.
    pub fn new() -> Self {
        Self {
            state: parking_lot::Mutex::new(BridgeState::default()),
        }
    }

    /// Fails the first `n` launch calls with a transport error, then behaves
    /// normally.
    pub fn failing(n: u32) -> Self {
        let bridge = Self::new();
        bridge.state.lock().fail_remaining = n;
        bridge
    }

    /// Rejects every launch call outright.
    pub fn rejecting(reason: impl Into<String>) -> Self {
        let bridge = Self::new();
        bridge.state.lock().reject_reason = Some(reason.into());
        bridge
    }

    /// Reports `pending` for the first `polls` status checks of each task.
    pub fn with_confirmation_delay(polls: u32) -> Self {
        let bridge = Self::new();
        bridge.state.lock().confirmation_delay_polls = polls;
        bridge
    }

    /// Marks an existing task as failed so the next status poll reports it.
    pub fn fail_task(&self, task_id: &LaunchTaskId) {
        if let Some(task) = self.state.lock().tasks.get_mut(task_id) {
            task.failed = true;
        }
    }

    pub fn launch_calls(&self) -> u32 {
        self.state.lock().launch_calls
    }

    pub fn task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }
}

impl Default for InMemoryBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SettlementBridge for InMemoryBridge {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn launch(&self, request: &LaunchRequest) -> BridgeResult<LaunchTaskId> {
        let mut state = self.state.lock();
        state.launch_calls += 1;

        if let Some(reason) = &state.reject_reason {
            return Err(BridgeError::Rejected(reason.clone()));
        }
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(BridgeError::Transport("injected failure".to_string()));
        }

        let key = (request.participant_id, request.epoch);
        if let Some(existing) = state.by_key.get(&key) {
            return Ok(*existing);
        }

        let task_id = LaunchTaskId::new();
        let record = TaskRecord {
            participant_id: request.participant_id,
            epoch: request.epoch,
            polls_until_confirmed: state.confirmation_delay_polls,
            failed: false,
        };
        state.tasks.insert(task_id, record);
        state.by_key.insert(key, task_id);
        Ok(task_id)
    }

    async fn check_status(&self, task_id: &LaunchTaskId) -> BridgeResult<LaunchReceipt> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or(BridgeError::UnknownTask(*task_id))?;

        if task.failed {
            return Ok(LaunchReceipt {
                task_id: *task_id,
                status: LaunchStatus::Failed,
                tx_reference: None,
            });
        }
        if task.polls_until_confirmed > 0 {
            task.polls_until_confirmed -= 1;
            return Ok(LaunchReceipt {
                task_id: *task_id,
                status: LaunchStatus::Pending,
                tx_reference: None,
            });
        }

        Ok(LaunchReceipt {
            task_id: *task_id,
            status: LaunchStatus::Confirmed,
            tx_reference: Some(format!("mem:{}:{}", task.participant_id, task.epoch)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request() -> LaunchRequest {
        LaunchRequest::new(
            ParticipantId::new(),
            7,
            "owner-wallet",
            strategy_fingerprint("momentum", "window=5"),
            dec!(250),
        )
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            attempt_timeout_ms: 100,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            status_poll_interval_ms: 1,
            status_poll_attempts: 5,
        }
    }

    #[tokio::test]
    async fn launch_confirms_and_returns_reference() {
        let bridge = InMemoryBridge::new();
        let request = request();

        let confirmation = run_launch(&bridge, &request, &fast_policy()).await.unwrap();
        assert!(confirmation.tx_reference.is_some());
        assert_eq!(bridge.launch_calls(), 1);
        assert_eq!(bridge.task_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_launch_resolves_to_same_task() {
        let bridge = InMemoryBridge::new();
        let request = request();

        let first = bridge.launch(&request).await.unwrap();
        let second = bridge.launch(&request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(bridge.task_count(), 1);

        // A different epoch is a different launch.
        let mut next_epoch = request.clone();
        next_epoch.epoch += 1;
        let third = bridge.launch(&next_epoch).await.unwrap();
        assert_ne!(first, third);
        assert_eq!(bridge.task_count(), 2);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let bridge = InMemoryBridge::failing(2);
        let request = request();

        let confirmation = run_launch(&bridge, &request, &fast_policy()).await.unwrap();
        assert!(confirmation.tx_reference.is_some());
        assert_eq!(bridge.launch_calls(), 3);
    }

    #[tokio::test]
    async fn attempt_budget_exhaustion_surfaces_last_error() {
        let bridge = InMemoryBridge::failing(10);
        let request = request();

        let err = run_launch(&bridge, &request, &fast_policy())
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Transport("injected failure".to_string()));
        assert_eq!(bridge.launch_calls(), 3);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let bridge = InMemoryBridge::rejecting("fingerprint already launched");
        let request = request();

        let err = run_launch(&bridge, &request, &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Rejected(_)));
        assert_eq!(bridge.launch_calls(), 1);
    }

    #[tokio::test]
    async fn pending_task_confirms_after_polls() {
        let bridge = InMemoryBridge::with_confirmation_delay(3);
        let request = request();

        let confirmation = run_launch(&bridge, &request, &fast_policy()).await.unwrap();
        assert!(confirmation.tx_reference.is_some());
    }

    #[tokio::test]
    async fn poll_budget_exhaustion_times_out() {
        let bridge = InMemoryBridge::with_confirmation_delay(100);
        let mut policy = fast_policy();
        policy.max_attempts = 1;
        policy.status_poll_attempts = 2;

        let err = run_launch(&bridge, &request(), &policy).await.unwrap_err();
        assert_eq!(err, BridgeError::Timeout);
    }

    #[tokio::test]
    async fn failed_task_is_a_permanent_rejection() {
        let bridge = InMemoryBridge::new();
        let request = request();
        let task_id = bridge.launch(&request).await.unwrap();
        bridge.fail_task(&task_id);

        let receipt = bridge.check_status(&task_id).await.unwrap();
        assert_eq!(receipt.status, LaunchStatus::Failed);

        let err = run_launch(&bridge, &request, &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Rejected(_)));
    }

    #[tokio::test]
    async fn unknown_task_status_is_an_error() {
        let bridge = InMemoryBridge::new();
        let missing = LaunchTaskId::new();
        let err = bridge.check_status(&missing).await.unwrap_err();
        assert_eq!(err, BridgeError::UnknownTask(missing));
    }

    #[test]
    fn fingerprint_is_deterministic_hex() {
        let a = strategy_fingerprint("momentum", "window=5");
        let b = strategy_fingerprint("momentum", "window=5");
        let c = strategy_fingerprint("momentum", "window=9");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(20), Duration::from_millis(500));
    }

    #[test]
    fn launch_request_serializes_for_the_wire() {
        let request = LaunchRequest::new(
            ParticipantId::new(),
            3,
            "owner",
            "abc123",
            dec!(100),
        );
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["epoch"], 3);
        assert_eq!(value["owner_identity"], "owner");
        let raw_id = value["participant_id"].as_str().unwrap();
        assert_eq!(ParticipantId::parse(raw_id).unwrap(), request.participant_id);
    }
}
