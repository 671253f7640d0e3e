//! Dashboard-facing surface: the WebSocket fan-out hub and the session
//! HTTP API, served from one axum router.
//!
//! Only this module writes to dashboard sockets. Each connection gets its
//! own task fed by a bounded broadcast queue; a client that cannot keep up
//! is dropped with a close code and the others are unaffected.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, Instant};
use tower_http::cors::{Any, CorsLayer};

use crate::gateway_logic::config::Config;
use crate::gateway_logic::model::{frame, ClientMessage};
use crate::gateway_logic::state::{AppState, EngineCommand};

/// Close codes used when the hub drops a client.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_POLICY: u16 = 1008;
const CLOSE_TRY_AGAIN: u16 = 1013;

/// Protocol-level ping cadence per client.
const CLIENT_PING_INTERVAL_SECS: u64 = 30;
/// A client silent for two ping cycles is considered gone.
const CLIENT_LIVENESS_TIMEOUT_SECS: u64 = 65;
/// Upper bound on a manual refresh round-trip.
const REFRESH_TIMEOUT_SECS: u64 = 30;

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

pub async fn run(config: Config, app_state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/api/session", get(get_session))
        .route("/api/nina/session-state", get(get_session_state))
        .route("/api/session/refresh", post(post_refresh))
        .route("/api/session/stats", get(get_stats))
        .route("/api/session/health", get(get_health))
        .route("/api/config/health", get(get_config_health))
        .route("/api/state", get(get_state))
        .layer(cors)
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    log::info!("Downstream server listening on {}", addr);

    if let (Some(cert_path), Some(key_path)) = (config.tls_cert_path, config.tls_key_path) {
        let tls_config = match RustlsConfig::from_pem_file(cert_path, key_path).await {
            Ok(tls) => tls,
            Err(e) => {
                log::error!("Failed to load TLS configuration: {}", e);
                std::process::exit(1);
            }
        };

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        if let Err(e) = axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
        {
            log::error!("Downstream TLS server failed: {}", e);
            std::process::exit(1);
        }
    } else {
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("Failed to bind {}: {}", addr, e);
                std::process::exit(1);
            }
        };
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.recv().await.ok();
                log::info!("Downstream server shutting down.");
            })
            .await;
        if let Err(e) = result {
            log::error!("Downstream server failed: {}", e);
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    if !state.try_admit_client() {
        log::warn!(
            "Rejecting dashboard client: cap of {} reached",
            state.max_clients
        );
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_TRY_AGAIN,
                reason: "dashboard capacity reached".into(),
            })))
            .await;
        return;
    }

    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    log::info!(
        "Dashboard client {} connected ({} active)",
        client_id,
        state.client_count()
    );

    let mut data_rx = state.subscribe_broadcast();
    let mut shutdown_rx = state.subscribe_shutdown();

    // Welcome frame: the current document, immediately.
    let welcome = json!({
        "type": frame::SESSION_UPDATE,
        "data": &*state.snapshot(),
        "timestamp": Utc::now(),
    });
    if send_json(&mut socket, &welcome).await.is_err() {
        state.release_client();
        return;
    }

    // Frame types this client asked for; None means everything.
    let mut subscribed: Option<HashSet<String>> = None;
    let mut last_client_frame = Instant::now();
    let mut ping_timer = interval(Duration::from_secs(CLIENT_PING_INTERVAL_SECS));
    ping_timer.tick().await; // skip the immediate first tick

    let close_frame = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                break Some(CloseFrame {
                    code: CLOSE_NORMAL,
                    reason: "server shutting down".into(),
                });
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_client_frame = Instant::now();
                        handle_client_frame(&mut socket, &text, &mut subscribed).await;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                        last_client_frame = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("Client {} socket error: {}", client_id, e);
                        break None;
                    }
                }
            }
            outgoing = data_rx.recv() => {
                match outgoing {
                    Ok(msg) => {
                        let wanted = subscribed
                            .as_ref()
                            .map(|set| set.contains(&msg.r#type))
                            .unwrap_or(true);
                        if wanted && send_json(&mut socket, &*msg).await.is_err() {
                            break None;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!(
                            "Dropping slow dashboard client {} ({} frames behind)",
                            client_id,
                            skipped
                        );
                        break Some(CloseFrame {
                            code: CLOSE_POLICY,
                            reason: "client too slow".into(),
                        });
                    }
                    Err(broadcast::error::RecvError::Closed) => break None,
                }
            }
            _ = ping_timer.tick() => {
                if last_client_frame.elapsed().as_secs() >= CLIENT_LIVENESS_TIMEOUT_SECS {
                    log::info!("Dashboard client {} timed out", client_id);
                    break Some(CloseFrame {
                        code: CLOSE_GOING_AWAY,
                        reason: "liveness timeout".into(),
                    });
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break None;
                }
            }
        }
    };

    if let Some(cf) = close_frame {
        let _ = socket.send(Message::Close(Some(cf))).await;
    }
    state.release_client();
    log::info!("Dashboard client {} disconnected", client_id);
}

/// Advisory client frames: subscription filters and application pings.
async fn handle_client_frame(
    socket: &mut WebSocket,
    text: &str,
    subscribed: &mut Option<HashSet<String>>,
) {
    let Ok(msg) = serde_json::from_str::<ClientMessage>(text) else {
        log::debug!("Ignoring unparseable client frame: {}", text);
        return;
    };
    match msg.r#type.as_deref() {
        Some("ping") => {
            let pong = json!({ "type": "pong", "timestamp": Utc::now() });
            let _ = send_json(socket, &pong).await;
        }
        Some("subscribe") => {
            *subscribed = parse_subscription(msg.events);
        }
        _ => {}
    }
}

/// Builds a per-client frame filter. Unknown frame types are dropped; an
/// empty or absent list means everything.
fn parse_subscription(events: Option<Vec<String>>) -> Option<HashSet<String>> {
    events
        .map(|events| {
            events
                .into_iter()
                .filter(|e| frame::ALL.contains(&e.as_str()))
                .collect::<HashSet<_>>()
        })
        .filter(|set| !set.is_empty())
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), ()> {
    let text = serde_json::to_string(value).map_err(|_| ())?;
    socket.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// GET /api/session — wrapped document, behind a short cache that collapses
/// dashboard polling bursts.
async fn get_session(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.cached_session_response(|| {
        json!({
            "success": true,
            "data": &*state.snapshot(),
            "timestamp": Utc::now(),
        })
        .to_string()
    });
    ([(header::CONTENT_TYPE, "application/json")], body)
}

/// GET /api/nina/session-state — the document without the envelope, for
/// dashboards speaking the compatibility shape.
async fn get_session_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.snapshot().as_ref().clone())
}

/// POST /api/session/refresh — re-run the seeder and return the fresh
/// document.
async fn post_refresh(State(state): State<AppState>) -> impl IntoResponse {
    let (tx, rx) = tokio::sync::oneshot::channel();
    if let Err(e) = state.send_engine(EngineCommand::Refresh(tx)) {
        return error_response(&e);
    }

    match timeout(Duration::from_secs(REFRESH_TIMEOUT_SECS), rx).await {
        Ok(Ok(doc)) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": &*doc,
                "timestamp": Utc::now(),
            })),
        ),
        Ok(Err(_)) => error_response("refresh was dropped by the engine"),
        Err(_) => error_response("refresh timed out"),
    }
}

async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "success": true,
        "data": {
            "uptimeSeconds": state.uptime_seconds(),
            "startedAt": state.started_at(),
            "events": state.counters.as_json(),
            "websocket": {
                "dashboardClients": state.client_count(),
                "maxDashboardClients": state.max_clients,
            },
            "upstream": {
                "connected": state.nina_connected(),
                "maxReconnectReached": state.max_reconnect_reached(),
            },
            "database": {
                "healthy": state.database_healthy(),
            },
        },
        "timestamp": Utc::now(),
    }))
}

/// GET /api/session/health — the truth source for gateway health.
async fn get_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "sessionManager": state.engine_alive(),
        "websocket": state.nina_connected(),
        "database": state.database_healthy(),
        "uptime": state.uptime_seconds(),
        "timestamp": Utc::now(),
    }))
}

async fn get_config_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime": state.uptime_seconds(),
        "timestamp": Utc::now(),
    }))
}

/// GET /api/state — aggregate view some dashboards consume in one request.
async fn get_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "success": true,
        "data": {
            "session": &*state.snapshot(),
            "connection": {
                "ninaConnected": state.nina_connected(),
                "dashboardClients": state.client_count(),
                "maxReconnectReached": state.max_reconnect_reached(),
            },
            "stats": state.counters.as_json(),
        },
        "timestamp": Utc::now(),
    }))
}

fn error_response(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": message })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_filters_unknown_frame_types() {
        let filter = parse_subscription(Some(vec![
            "sessionUpdate".to_string(),
            "nina-event".to_string(),
            "not-a-frame".to_string(),
        ]))
        .unwrap();
        assert!(filter.contains("sessionUpdate"));
        assert!(filter.contains("nina-event"));
        assert!(!filter.contains("not-a-frame"));
    }

    #[test]
    fn empty_or_bogus_subscription_means_everything() {
        assert!(parse_subscription(None).is_none());
        assert!(parse_subscription(Some(vec![])).is_none());
        assert!(parse_subscription(Some(vec!["bogus".to_string()])).is_none());
    }
}
