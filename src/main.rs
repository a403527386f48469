use crate::api::*;
use crate::bridge::{Bridge, Twitch};
use crate::config::Settings;
use crate::contract::TestMarketContract;
use crate::db::SQLite;
use crate::dedup::DedupOutcome;
use crate::error::{map_api_err, ApiError};
use crate::evm::EvmMarketContract;
use crate::kv::{Kv, Store};
use crate::market_service::{Contract, MarketService};
use crate::twitch::HelixClient;
use crate::twitch_api::{TestTwitchApi, TwitchUser};
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Json, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_macros::debug_handler;
use chrono::{DateTime, Utc};
use clap::Parser;
use log::{debug, error, info, trace, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

mod api;
mod bridge;
mod circuit_breaker;
mod client;
mod config;
mod contract;
mod db;
mod dedup;
mod error;
mod evm;
mod idempotency;
mod kv;
mod logging;
mod market_service;
mod signature;
mod twitch;
mod twitch_api;

const PURGE_INTERVAL: Duration = Duration::from_secs(300);

pub struct AppState {
    bridge: Bridge,
    settings: Settings,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[debug_handler]
async fn twitch_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, (StatusCode, String)> {
    let secret = state
        .settings
        .twitch
        .webhook_secret()
        .map_err(|e| map_api_err(e.into()))?;
    let (Some(message_id), Some(timestamp), Some(signature)) = (
        header_str(&headers, HEADER_MESSAGE_ID),
        header_str(&headers, HEADER_MESSAGE_TIMESTAMP),
        header_str(&headers, HEADER_MESSAGE_SIGNATURE),
    ) else {
        return Err(map_api_err(ApiError::Forbidden(
            "missing EventSub signature headers".to_string(),
        )));
    };
    signature::verify(secret, message_id, timestamp, &body, signature)
        .map_err(|e| map_api_err(ApiError::Forbidden(e.to_string())))?;

    let sent_at = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| map_api_err(ApiError::Forbidden(format!("bad timestamp: {}", e))))?
        .with_timezone(&Utc);
    let now = Utc::now();
    if let Some(outcome) = dedup::check_freshness(sent_at, now) {
        return Err(map_api_err(ApiError::Forbidden(format!(
            "message {} rejected: {:?}",
            message_id, outcome
        ))));
    }
    let message_type = header_str(&headers, HEADER_MESSAGE_TYPE)
        .unwrap_or_default()
        .parse::<EventSubMessageType>()
        .map_err(|e| map_api_err(ApiError::BadRequest(format!("{:#}", e))))?;
    let payload: EventSubPayload = serde_json::from_slice(&body)
        .map_err(|e| map_api_err(ApiError::BadRequest(format!("malformed payload: {}", e))))?;

    let event = match message_type {
        EventSubMessageType::WebhookCallbackVerification => {
            let challenge = payload.challenge.ok_or_else(|| {
                map_api_err(ApiError::BadRequest("verification without challenge".to_string()))
            })?;
            info!(
                "Verified subscription {} for {}",
                payload.subscription.id, payload.subscription.kind
            );
            return Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                challenge,
            )
                .into_response());
        }
        EventSubMessageType::Revocation => {
            warn!(
                "Twitch revoked subscription {} for {}: {}",
                payload.subscription.id, payload.subscription.kind, payload.subscription.status
            );
            return Ok(StatusCode::NO_CONTENT.into_response());
        }
        EventSubMessageType::Notification => {
            let raw = payload.event.ok_or_else(|| {
                map_api_err(ApiError::BadRequest("notification without event".to_string()))
            })?;
            TwitchEvent::from_notification(&payload.subscription.kind, &raw)
                .map_err(|e| map_api_err(ApiError::BadRequest(format!("{:#}", e))))?
        }
    };

    match dedup::check_and_mark(state.bridge.kv().store(), message_id, sent_at, now).await {
        DedupOutcome::New => {}
        DedupOutcome::Duplicate => {
            debug!("Skipping duplicate message {}", message_id);
            return Ok(StatusCode::OK.into_response());
        }
        outcome @ (DedupOutcome::Stale | DedupOutcome::FromFuture) => {
            return Err(map_api_err(ApiError::Forbidden(format!(
                "message {} rejected: {:?}",
                message_id, outcome
            ))));
        }
    }
    match event {
        Some(event) => {
            if let Err(e) = state.bridge.handle_event(event).await {
                error!("Processing message {} failed: {:#}", message_id, e);
            }
        }
        None => info!(
            "Ignoring unsupported subscription type {}",
            payload.subscription.kind
        ),
    }
    Ok(StatusCode::OK.into_response())
}

fn client_key(headers: &HeaderMap, peer: Option<ConnectInfo<SocketAddr>>) -> String {
    header_str(headers, "x-forwarded-for")
        .and_then(|forwarded| forwarded.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

async fn rate_limit(state: &AppState, client: &str) -> Result<(), ApiError> {
    rate_limit_in_window(state, client, Utc::now().timestamp() / 60).await
}

/// Fixed-window counter; `window` is the minute since the epoch.
async fn rate_limit_in_window(state: &AppState, client: &str, window: i64) -> Result<(), ApiError> {
    let key = format!("ratelimit:active:{}:{}", client, window);
    match state
        .bridge
        .kv()
        .store()
        .incr(&key, Some(chrono::Duration::seconds(60)))
        .await
    {
        Ok(count) if count > state.settings.server.rate_limit_per_minute => {
            debug!("Client {} exceeded the rate limit", client);
            Err(ApiError::RateLimited)
        }
        Ok(_) => Ok(()),
        Err(e) => {
            warn!("Rate limiter unavailable, letting {} through: {:#}", client, e);
            Ok(())
        }
    }
}

async fn active_market(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Query(query): Query<ActiveMarketQuery>,
) -> Result<Json<PredictionData>, (StatusCode, String)> {
    let channel = query
        .channel_id
        .filter(|c| !c.is_empty())
        .ok_or_else(|| map_api_err(ApiError::BadRequest("channelId is required".to_string())))?;
    rate_limit(&state, &client_key(&headers, peer))
        .await
        .map_err(map_api_err)?;
    trace!("Looking up active market for channel {}", channel);
    let prediction = state
        .bridge
        .kv()
        .get_active_prediction(&channel)
        .await
        .map_err(|e| map_api_err(e.into()))?;
    match prediction {
        Some(prediction) => Ok(Json(prediction)),
        None => Err(map_api_err(ApiError::NotFound(format!(
            "no active market for channel {}",
            channel
        )))),
    }
}

/// Resolves the bearer token to the Twitch user it belongs to.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<TwitchUserId, ApiError> {
    let token = header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;
    match state.bridge.twitch().validate_token(token).await {
        Ok(Some(info)) => Ok(info.user_id),
        Ok(None) => Err(ApiError::Unauthorized("invalid Twitch token".to_string())),
        Err(e) => Err(ApiError::Unavailable(format!(
            "couldn't validate Twitch token: {:#}",
            e
        ))),
    }
}

async fn get_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StreamerSettings>, (StatusCode, String)> {
    let user = authenticate(&state, &headers).await.map_err(map_api_err)?;
    let settings = state
        .bridge
        .kv()
        .get_settings(&user)
        .await
        .map_err(|e| map_api_err(e.into()))?;
    Ok(Json(settings))
}
async fn update_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<UpdateSettingsRequest>,
) -> Result<Json<StreamerSettings>, (StatusCode, String)> {
    let user = authenticate(&state, &headers).await.map_err(map_api_err)?;
    if request.market_duration_secs == Some(0) {
        return Err(map_api_err(ApiError::BadRequest(
            "marketDurationSecs must be positive".to_string(),
        )));
    }
    let kv = state.bridge.kv();
    let mut settings = kv.get_settings(&user).await.map_err(|e| map_api_err(e.into()))?;
    if let Some(auto_create) = request.auto_create_markets {
        settings.auto_create_markets = auto_create;
    }
    if request.market_duration_secs.is_some() {
        settings.market_duration_secs = request.market_duration_secs;
    }
    kv.save_settings(&user, &settings)
        .await
        .map_err(|e| map_api_err(e.into()))?;
    debug!("Updated settings for {}: {:?}", user, settings);
    Ok(Json(settings))
}
async fn streamer_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StreamerStatusResponse>, (StatusCode, String)> {
    let user = authenticate(&state, &headers).await.map_err(map_api_err)?;
    let kv = state.bridge.kv();
    let session = kv.get_session(&user).await.map_err(|e| map_api_err(e.into()))?;
    let active_prediction = kv
        .get_active_prediction(&user)
        .await
        .map_err(|e| map_api_err(e.into()))?;
    Ok(Json(StreamerStatusResponse {
        connected: session.is_some(),
        wallet_address: session.map(|s| s.wallet_address),
        active_prediction,
        rpc_circuit: state.bridge.markets().breaker_state(),
    }))
}
async fn streamer_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StreamerStatsResponse>, (StatusCode, String)> {
    let user = authenticate(&state, &headers).await.map_err(map_api_err)?;
    let counts = state
        .bridge
        .stats(&user)
        .await
        .map_err(|e| map_api_err(e.into()))?;
    Ok(Json(StreamerStatsResponse {
        channel_id: user,
        counts,
    }))
}

#[debug_handler]
async fn connect_streamer(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConnectStreamerRequest>,
) -> Result<Json<StreamerProfileResponse>, (StatusCode, String)> {
    request
        .wallet_address
        .parse::<alloy_primitives::Address>()
        .map_err(|e| {
            map_api_err(ApiError::BadRequest(format!(
                "invalid wallet address {}: {}",
                request.wallet_address, e
            )))
        })?;
    let twitch = state.bridge.twitch();
    let token = twitch
        .exchange_code(&request.code, &request.redirect_uri)
        .await
        .map_err(|e| map_api_err(ApiError::Unauthorized(format!("{:#}", e))))?;
    let user = twitch
        .current_user(&token.access_token)
        .await
        .map_err(|e| map_api_err(e.into()))?;
    let session = StreamerSession {
        twitch_user_id: user.id.clone(),
        login: user.login,
        display_name: user.display_name,
        wallet_address: request.wallet_address,
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        expires_at: Utc::now().timestamp() + token.expires_in,
        profile_image_url: user.profile_image_url,
        connected_at: now_millis(),
    };
    state
        .bridge
        .kv()
        .save_session(&session)
        .await
        .map_err(|e| map_api_err(e.into()))?;
    twitch
        .subscribe_predictions(&session.twitch_user_id)
        .await
        .map_err(|e| map_api_err(e.into()))?;
    info!(
        "Connected streamer {} ({}) with wallet {}",
        session.login, session.twitch_user_id, session.wallet_address
    );
    Ok(Json((&session).into()))
}

async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let store = match state.bridge.kv().store().ping().await {
        Ok(()) => true,
        Err(e) => {
            error!("Health check: store unreachable: {:#}", e);
            false
        }
    };
    let rpc_circuit = state.bridge.markets().breaker_state();
    let status = match (store, rpc_circuit) {
        (false, _) => "down",
        (true, BreakerState::Closed) => "ok",
        (true, _) => "degraded",
    };
    let response = HealthResponse {
        status: status.to_string(),
        store,
        rpc_circuit,
        webhook_secret_configured: state.settings.twitch.webhook_secret().is_ok(),
    };
    let code = if store {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

async fn cors<B>(State(state): State<Arc<AppState>>, request: Request<B>, next: Next<B>) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };
    let headers = response.headers_mut();
    let origin = HeaderValue::from_str(&state.settings.server.cors_origin)
        .unwrap_or_else(|_| HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );
    response
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/twitch/webhook", post(twitch_webhook))
        .route("/api/markets/active", get(active_market))
        .route("/api/streamer/connect", post(connect_streamer))
        .route(
            "/api/streamer/settings",
            get(get_settings).post(update_settings),
        )
        .route("/api/streamer/status", get(streamer_status))
        .route("/api/streamer/stats", get(streamer_stats))
        .route("/api/health", get(health))
        .layer(middleware::from_fn_with_state(state.clone(), cors))
        .with_state(state)
}

#[derive(Parser)]
struct Args {
    /// Config file, defaults to ./bridge.toml when present
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long)]
    port: Option<u16>,
    /// Use the in-memory contract and Twitch instead of the real ones
    #[arg(short, long)]
    test: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Args::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    logging::init(&settings.logging);
    let (contract, twitch): (Contract, Twitch) = if cli.test {
        warn!("Test mode: using the in-memory contract and Twitch");
        (Arc::new(TestMarketContract::default()), test_twitch())
    } else {
        (
            Arc::new(EvmMarketContract::new(&settings.chain)?),
            Arc::new(HelixClient::new(settings.twitch.clone())),
        )
    };
    let (_port, handle) = run_server(settings, contract, twitch).await?;
    handle.await?;
    Ok(())
}

/// A single streamer that connects with code `test-code` and authenticates
/// with token `test-token`.
fn test_twitch() -> Twitch {
    let twitch = TestTwitchApi::default();
    let user = TwitchUser {
        id: "12345".to_string(),
        login: "teststreamer".to_string(),
        display_name: "TestStreamer".to_string(),
        profile_image_url: None,
    };
    twitch.add_user(user, "test-token");
    twitch.add_code("test-code", "test-token");
    Arc::new(twitch)
}

async fn run_server(
    settings: Settings,
    contract: Contract,
    twitch: Twitch,
) -> Result<(u16, JoinHandle<()>)> {
    let sqlite = Arc::new(SQLite::new(Some(settings.store.database_url.clone())).await?);
    let store: Store = sqlite.clone();
    let bridge = Bridge::new(
        Kv::new(store),
        Arc::new(MarketService::new(contract)),
        twitch,
    );
    let addr: SocketAddr = format!("{}:{}", settings.server.bind, settings.server.port)
        .parse()
        .context("invalid server.bind/server.port")?;
    if settings.twitch.webhook_secret().is_err() {
        warn!("twitch.webhook_secret is not set, webhooks will be rejected");
    }
    let state = Arc::new(AppState { bridge, settings });
    let app = router(state);

    let server = axum::Server::try_bind(&addr)?
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
    let port = server.local_addr().port();
    info!("Listening on {}", server.local_addr());

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            match sqlite.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => debug!("Purged {} expired keys", purged),
                Err(e) => warn!("Purging expired keys failed: {:#}", e),
            }
        }
    });
    let handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Server stopped: {}", e);
        }
    });
    Ok((port, handle))
}
