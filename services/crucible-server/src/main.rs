//! Crucible Arena Server
//!
//! The long-running tournament process: one shared [`ArenaEngine`] fed by a
//! simulated price feed, an epoch scheduler that closes and reopens rounds
//! on a fixed cadence, the ascension ladder, the settlement bridge driver
//! and the hive mind, all exposed over HTTP and WebSocket.
//!
//! ## Endpoints
//!
//! - `GET  /health` - liveness probe
//! - `GET  /api/status` - epoch, population and pool overview
//! - `POST /api/participants` - register a participant
//! - `GET  /api/participants/:id` - one participant's snapshot
//! - `GET  /api/leaderboard` - live ranking of the current epoch
//! - `GET  /api/epochs` - closed-epoch summaries, most recent first
//! - `GET  /api/hive` - last hive patch and tag scores
//! - `POST /api/admin/close-epoch` - force the current epoch to close
//! - `GET  /ws?participant_id=...` - trading session socket

mod agents;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use clap::Parser;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crucible_ascension::{AscensionConfig, AscensionTracker, EpochEvaluation};
use crucible_engine::{ArenaEngine, EngineConfig, ParticipantSnapshot};
use crucible_epoch::{compute_rankings, EpochCloseOutcome, EpochConfig, Scheduler};
use crucible_feed::{FeedConfig, FeedHub, PriceFeed, SimulatedFeed};
use crucible_hive::HiveMind;
use crucible_settlement::{
    run_launch, HttpBridge, InMemoryBridge, LaunchRequest, RetryPolicy, SettlementBridge,
};
use crucible_types::{ArenaError, ParticipantId, Symbol, Tier};
use crucible_ws::{ClientMessage, ServerMessage, SessionRegistry, WsConfig};

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "crucible", about = "Crucible arena server", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8890)]
    port: u16,

    /// Minutes per epoch
    #[arg(long, default_value_t = 240)]
    epoch_minutes: i64,

    /// Milliseconds between price ticks
    #[arg(long, default_value_t = 1000)]
    tick_ms: u64,

    /// Seed for the simulated price feed
    #[arg(long)]
    feed_seed: Option<u64>,

    /// Base URL of an external settlement bridge. Launches run against an
    /// in-memory bridge when unset.
    #[arg(long)]
    bridge_url: Option<String>,

    /// Run a demo strategy population against the arena
    #[arg(long, default_value_t = false)]
    demo: bool,

    /// Number of demo agents
    #[arg(long, default_value_t = 12)]
    demo_agents: usize,
}

// ============================================================================
// Application State
// ============================================================================

struct AppState {
    engine: Arc<ArenaEngine>,
    scheduler: Scheduler,
    tracker: AscensionTracker,
    hive: HiveMind,
    registry: SessionRegistry,
    hub: FeedHub,
    bridge: Arc<dyn SettlementBridge>,
    retry_policy: RetryPolicy,
    ws_config: WsConfig,
    ws_tx: broadcast::Sender<ServerMessage>,
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn err(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(message.into()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    participant_id: String,
}

#[derive(Debug, Serialize)]
struct LeaderboardRow {
    rank: u32,
    participant_id: ParticipantId,
    name: String,
    tier: Tier,
    pnl: Decimal,
    roi: Decimal,
}

// ============================================================================
// REST Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "crucible-server" }))
}

async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pending: Vec<serde_json::Value> = state
        .tracker
        .pending_launches()
        .into_iter()
        .map(|(id, record)| {
            json!({
                "participant_id": id,
                "epoch": record.epoch,
                "attempts": record.attempts,
                "needs_manual_intervention": record.needs_manual_intervention,
            })
        })
        .collect();

    ApiResponse::ok(json!({
        "epoch": state.engine.epoch(),
        "phase": state.engine.phase().to_string(),
        "deadline": state.scheduler.deadline(),
        "participants": state.engine.participant_count(),
        "connected_sessions": state.registry.connection_count(),
        "trades": state.engine.ledger_len(),
        "pool": state.tracker.pool_snapshot(),
        "pending_launches": pending,
        "completed_launches": state.tracker.completed_launches().len(),
    }))
}

async fn register_participant(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> impl IntoResponse {
    let name = request.name.trim();
    if name.is_empty() {
        return ApiResponse::<serde_json::Value>::err("name must not be empty");
    }
    let participant_id = state.engine.register_participant(name);
    ApiResponse::ok(json!({
        "participant_id": participant_id,
        "balance": state.engine.config().initial_balance,
        "ws_url": format!("/ws?participant_id={}", participant_id),
    }))
}

async fn get_participant(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let participant_id = match ParticipantId::parse(&id) {
        Ok(participant_id) => participant_id,
        Err(_) => return ApiResponse::<serde_json::Value>::err("invalid participant id"),
    };
    match state.engine.participant_snapshot(participant_id) {
        Some(snapshot) => ApiResponse::ok(json!({
            "snapshot": snapshot,
            "connected": state.registry.is_connected(participant_id),
        })),
        None => ApiResponse::err("unknown participant"),
    }
}

async fn get_leaderboard(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshots = state.engine.snapshots();
    let by_id: HashMap<ParticipantId, &ParticipantSnapshot> =
        snapshots.iter().map(|s| (s.id, s)).collect();

    let rows: Vec<LeaderboardRow> = compute_rankings(&snapshots)
        .into_iter()
        .filter_map(|entry| {
            by_id.get(&entry.participant_id).map(|snapshot| LeaderboardRow {
                rank: entry.rank,
                participant_id: entry.participant_id,
                name: snapshot.name.clone(),
                tier: snapshot.tier,
                pnl: entry.value,
                roi: snapshot.roi,
            })
        })
        .collect();

    ApiResponse::ok(json!({
        "epoch": state.engine.epoch(),
        "rankings": rows,
    }))
}

async fn get_epochs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ApiResponse::ok(state.scheduler.history())
}

async fn get_hive(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ApiResponse::ok(json!({
        "last_patch": state.hive.last_patch(),
        "scores": state.hive.tag_scores(),
    }))
}

async fn close_epoch_now(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.scheduler.request_force_close();
    info!("administrative epoch close requested");
    ApiResponse::ok(json!({
        "epoch": state.engine.epoch(),
        "closing": true,
    }))
}

// ============================================================================
// WebSocket Handler
// ============================================================================

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let participant_id = match ParticipantId::parse(&query.participant_id) {
        Ok(participant_id) => participant_id,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, "invalid participant_id").into_response();
        }
    };
    if state.engine.participant_snapshot(participant_id).is_none() {
        return (StatusCode::NOT_FOUND, "unknown participant").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, participant_id))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, participant_id: ParticipantId) {
    let (mut sender, mut receiver) = socket.split();

    let (session_tx, session_rx) =
        flume::bounded::<ServerMessage>(state.ws_config.session_queue_size);
    let session_id = state.registry.attach(participant_id, session_tx);
    let mut broadcast_rx = state.ws_tx.subscribe();
    let ping_interval = Duration::from_secs(state.ws_config.ping_interval_secs);

    if let Some(snapshot) = state.engine.participant_snapshot(participant_id) {
        let _ = state.registry.send_to(
            participant_id,
            ServerMessage::welcome(snapshot.balance, state.engine.epoch()),
        );
    }

    // Everything outbound goes through one task: the session queue carries
    // direct replies, the broadcast channel carries arena-wide events.
    let send_task = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(ping_interval);
        loop {
            let message = tokio::select! {
                direct = session_rx.recv_async() => match direct {
                    Ok(message) => message,
                    Err(_) => break,
                },
                shared = broadcast_rx.recv() => match shared {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(participant = %participant_id, skipped, "session lagged behind broadcasts");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = keepalive.tick() => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "failed to serialize server message");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = receiver.next().await {
        let message = match result {
            Ok(message) => message,
            Err(e) => {
                debug!(participant = %participant_id, error = %e, "websocket receive error");
                break;
            }
        };
        match message {
            Message::Text(text) => handle_client_message(&state, participant_id, &text),
            Message::Close(_) => break,
            _ => {}
        }
    }

    // A reconnect may already have replaced this session; detach only tears
    // down our own registration.
    state.registry.detach(participant_id, session_id);
    send_task.abort();
    debug!(participant = %participant_id, session_id, "socket closed");
}

fn handle_client_message(state: &AppState, participant_id: ParticipantId, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            let _ = state
                .registry
                .send_to(participant_id, ServerMessage::protocol_error(e.to_string()));
            return;
        }
    };

    match message {
        ClientMessage::Order {
            symbol,
            side,
            amount,
            reason,
        } => {
            let reply = match state.engine.submit_order(
                participant_id,
                Symbol::from(symbol.as_str()),
                side,
                amount,
                reason,
            ) {
                Ok(result) => ServerMessage::order_accepted(result.new_balance),
                Err(ArenaError::OrderRejected(reason)) => ServerMessage::order_rejected(&reason),
                Err(e) => ServerMessage::protocol_error(e.to_string()),
            };
            let _ = state.registry.send_to(participant_id, reply);
        }
        ClientMessage::Ping { id } => {
            let _ = state
                .registry
                .send_to(participant_id, ServerMessage::Pong { id });
        }
    }
}

// ============================================================================
// Market Loop
// ============================================================================

/// Tick cadence for the whole arena: fetch a price tick, settle it into the
/// engine, broadcast it, then give the scheduler a chance to close the epoch.
async fn run_market_loop(state: Arc<AppState>, feed: Arc<dyn PriceFeed>, tick_ms: u64) {
    let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms));
    info!(feed = feed.name(), tick_ms, "market loop running");
    loop {
        ticker.tick().await;

        match feed.fetch_tick().await {
            Ok(tick) => {
                state.engine.apply_price_update(&tick.price_map());
                state.hub.publish(&tick);
                let _ = state.ws_tx.send(ServerMessage::price_update(&tick));
            }
            Err(e) => warn!(error = %e, "price tick skipped"),
        }

        match state.scheduler.maybe_close(Utc::now()) {
            Ok(Some(outcome)) => run_close_sequence(&state, outcome).await,
            Ok(None) => {}
            Err(e) => error!(error = %e, "epoch close failed"),
        }
    }
}

/// Everything that follows a closed epoch: ladder evaluation, the hive
/// patch, the two broadcasts, and one driver task per launch request.
async fn run_close_sequence(state: &Arc<AppState>, outcome: EpochCloseOutcome) {
    let summary = &outcome.summary;

    let evaluation = match state.tracker.evaluate_epoch(&outcome) {
        Ok(evaluation) => evaluation,
        Err(e) => {
            error!(epoch = summary.epoch, error = %e, "ladder evaluation failed");
            EpochEvaluation::default()
        }
    };
    for promotion in &evaluation.promotions {
        info!(participant = %promotion.participant_id, tier = %promotion.to, "promoted");
    }

    let trades = state.engine.trades_for_epoch(summary.epoch);
    let pnl_by_participant: HashMap<ParticipantId, Decimal> = summary
        .rankings
        .iter()
        .map(|entry| (entry.participant_id, entry.value))
        .collect();
    let patch = state.hive.aggregate(summary.epoch, &trades, &pnl_by_participant);

    // Both broadcasts go out every close, the patch included even when it
    // carries no adjustments.
    let _ = state.ws_tx.send(ServerMessage::epoch_end(summary));
    let _ = state.ws_tx.send(ServerMessage::hive_patch(&patch));

    for request in evaluation.launches {
        spawn_launch(state.clone(), request);
    }
}

/// One bridge driver run per launch request, off the market loop. Success
/// feeds back into the tracker; failure counts against the retry budget and
/// the request is re-emitted at the next close.
fn spawn_launch(state: Arc<AppState>, request: LaunchRequest) {
    tokio::spawn(async move {
        let participant_id = request.participant_id;
        info!(
            participant = %participant_id,
            epoch = request.epoch,
            bridge = state.bridge.name(),
            "launch driver started"
        );
        match run_launch(state.bridge.as_ref(), &request, &state.retry_policy).await {
            Ok(confirmation) => {
                match state.tracker.confirm_launch(participant_id, &confirmation) {
                    Ok(true) => info!(
                        participant = %participant_id,
                        task = %confirmation.task_id,
                        "participant launched"
                    ),
                    Ok(false) => debug!(
                        participant = %participant_id,
                        "duplicate launch confirmation ignored"
                    ),
                    Err(e) => error!(
                        participant = %participant_id,
                        error = %e,
                        "launch confirmation failed"
                    ),
                }
            }
            Err(e) => {
                warn!(participant = %participant_id, error = %e, "launch driver run failed");
                state.tracker.record_launch_failure(participant_id);
            }
        }
    });
}

// ============================================================================
// Main
// ============================================================================

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install shutdown handler");
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting Crucible Arena Server");
    info!("======================================");
    info!("  Port: {}", cli.port);
    info!("  Epoch length: {} minutes", cli.epoch_minutes);
    info!("  Tick interval: {} ms", cli.tick_ms);
    match &cli.bridge_url {
        Some(url) => info!("  Settlement bridge: {}", url),
        None => info!("  Settlement bridge: in-memory"),
    }
    info!("  Demo mode: {}", cli.demo);
    if cli.demo {
        info!("  Demo agents: {}", cli.demo_agents);
    }
    info!("======================================");

    let engine = Arc::new(ArenaEngine::new(EngineConfig::default()));
    let scheduler = Scheduler::new(
        engine.clone(),
        EpochConfig {
            duration_minutes: cli.epoch_minutes,
            ..EpochConfig::default()
        },
    );
    let tracker = AscensionTracker::new(engine.clone(), AscensionConfig::default());
    let bridge: Arc<dyn SettlementBridge> = match &cli.bridge_url {
        Some(url) => Arc::new(HttpBridge::new(url.clone())),
        None => Arc::new(InMemoryBridge::new()),
    };

    let feed: Arc<dyn PriceFeed> = Arc::new(SimulatedFeed::new(FeedConfig {
        interval_ms: cli.tick_ms,
        seed: cli.feed_seed,
        ..FeedConfig::default()
    }));

    let (ws_tx, _) = broadcast::channel(1024);
    let state = Arc::new(AppState {
        engine,
        scheduler,
        tracker,
        hive: HiveMind::default(),
        registry: SessionRegistry::new(),
        hub: FeedHub::new(),
        bridge,
        retry_policy: RetryPolicy::default(),
        ws_config: WsConfig::default(),
        ws_tx,
    });

    tokio::spawn(run_market_loop(state.clone(), feed, cli.tick_ms));
    if cli.demo {
        tokio::spawn(agents::run_demo_population(state.clone(), cli.demo_agents));
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/status", get(get_status))
        .route("/api/participants", post(register_participant))
        .route("/api/participants/:id", get(get_participant))
        .route("/api/leaderboard", get(get_leaderboard))
        .route("/api/epochs", get(get_epochs))
        .route("/api/hive", get(get_hive))
        .route("/api/admin/close-epoch", post(close_epoch_now))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
