//! Upstream link to the imaging host's WebSocket event stream.
//!
//! One task owns the socket. Parsed frames go to the engine over its
//! command channel; nobody else writes to this socket. Connection failures
//! are never fatal: the rest of the gateway keeps serving the last known
//! state while this loop backs off and retries.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep, timeout, Instant};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

use crate::gateway_logic::config::Config;
use crate::gateway_logic::state::{AppState, EngineCommand};

/// First reconnect delay; doubles per attempt.
const RECONNECT_BASE_MS: u64 = 1_000;
/// Reconnect delays never exceed this.
const RECONNECT_CAP_MS: u64 = 30_000;
/// Random extra delay so a flapping host does not see lockstep retries.
const RECONNECT_JITTER_MS: u64 = 250;
/// Settle delay before the subscription frame is sent on a fresh socket.
const SUBSCRIBE_SETTLE_MS: u64 = 100;
/// Ping cadence towards the imaging host.
const PING_INTERVAL_SECS: u64 = 30;
/// Any frame counts as liveness; silence past this forces a reconnect.
const LIVENESS_TIMEOUT_SECS: u64 = 60;

pub async fn run(config: Config, app_state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let url = config.nina_socket_url();
    let mut attempt: u32 = 0;

    loop {
        if shutdown.try_recv().is_ok() {
            log::info!("Upstream link received shutdown signal.");
            break;
        }

        if attempt > 0 {
            if attempt == config.nina_retry_attempts {
                log::warn!(
                    "Reached {} reconnect attempts; continuing to retry at the capped delay",
                    attempt
                );
                app_state.set_max_reconnect_reached(true);
            }
            let delay = backoff_ms(attempt, RECONNECT_BASE_MS, RECONNECT_CAP_MS)
                + rand::rng().random_range(0..RECONNECT_JITTER_MS);
            log::warn!(
                "Reconnecting to imaging host in {}ms (attempt {})...",
                delay,
                attempt
            );
            tokio::select! {
                _ = sleep(Duration::from_millis(delay)) => {}
                _ = shutdown.recv() => {
                    log::info!("Upstream link shutting down during backoff.");
                    return;
                }
            }
        }

        match connect(&url, config.nina_timeout()).await {
            Ok(ws_stream) => {
                log::info!("Connected to imaging host at {}", url);
                attempt = 0;
                app_state.set_nina_connected(true);
                app_state.set_max_reconnect_reached(false);

                let (mut write, mut read) = ws_stream.split();

                // Let the socket settle before subscribing to avoid races
                // on a freshly upgraded connection.
                sleep(Duration::from_millis(SUBSCRIBE_SETTLE_MS)).await;
                let subscribe = json!({ "type": "subscribe" }).to_string();
                if let Err(e) = write.send(WsMessage::Text(subscribe.into())).await {
                    log::error!("Failed to send subscription frame: {}", e);
                    app_state.set_nina_connected(false);
                    attempt = 1;
                    continue;
                }
                log::info!("Subscribed to imaging host event stream.");

                let mut last_activity = Instant::now();
                let mut ping_timer = interval(Duration::from_secs(PING_INTERVAL_SECS));
                ping_timer.tick().await; // skip the immediate first tick

                loop {
                    tokio::select! {
                        _ = shutdown.recv() => {
                            log::info!("Upstream link shutting down...");
                            let _ = write.close().await;
                            app_state.set_nina_connected(false);
                            return;
                        }
                        msg = read.next() => {
                            match msg {
                                Some(Ok(WsMessage::Text(text))) => {
                                    last_activity = Instant::now();
                                    match serde_json::from_str::<serde_json::Value>(&text) {
                                        Ok(value) => {
                                            if app_state.send_engine(EngineCommand::Frame(value)).is_err() {
                                                log::error!("Session engine gone; closing upstream link.");
                                                let _ = write.close().await;
                                                app_state.set_nina_connected(false);
                                                return;
                                            }
                                        }
                                        Err(e) => log::debug!("Unparseable upstream frame ({}): {}", e, text),
                                    }
                                }
                                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                                    last_activity = Instant::now();
                                }
                                Some(Ok(WsMessage::Binary(data))) => {
                                    last_activity = Instant::now();
                                    log::trace!("Ignoring {} binary bytes from imaging host", data.len());
                                }
                                Some(Ok(WsMessage::Close(_))) => {
                                    log::warn!("Imaging host closed the socket.");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    log::error!("Upstream read error: {}", e);
                                    break;
                                }
                                None => {
                                    log::warn!("Upstream stream ended.");
                                    break;
                                }
                            }
                        }
                        _ = ping_timer.tick() => {
                            if last_activity.elapsed().as_secs() >= LIVENESS_TIMEOUT_SECS {
                                log::warn!(
                                    "No upstream liveness for {}s; forcing reconnect.",
                                    LIVENESS_TIMEOUT_SECS
                                );
                                let _ = write.close().await;
                                break;
                            }
                            if let Err(e) = write.send(WsMessage::Ping(Vec::new().into())).await {
                                log::error!("Upstream ping failed: {}", e);
                                break;
                            }
                        }
                    }
                }

                app_state.set_nina_connected(false);
                app_state
                    .counters
                    .upstream_reconnects
                    .fetch_add(1, Ordering::Relaxed);
                attempt = 1;
            }
            Err(e) => {
                log::error!("Failed to connect to imaging host: {}", e);
                app_state.set_nina_connected(false);
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

async fn connect(
    url: &str,
    handshake_timeout: Duration,
) -> anyhow::Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    log::info!("Connecting to imaging host: {}", url);
    let (ws_stream, _) = timeout(handshake_timeout, connect_async(url))
        .await
        .map_err(|_| anyhow::anyhow!("handshake timed out after {:?}", handshake_timeout))??;
    Ok(ws_stream)
}

/// Exponential backoff without jitter: `min(base * 2^(attempt-1), cap)`.
fn backoff_ms(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    base_ms.saturating_mul(1u64 << exponent).min(cap_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_to_the_cap() {
        assert_eq!(backoff_ms(1, 1_000, 30_000), 1_000);
        assert_eq!(backoff_ms(2, 1_000, 30_000), 2_000);
        assert_eq!(backoff_ms(3, 1_000, 30_000), 4_000);
        assert_eq!(backoff_ms(5, 1_000, 30_000), 16_000);
        assert_eq!(backoff_ms(6, 1_000, 30_000), 30_000);
        assert_eq!(backoff_ms(60, 1_000, 30_000), 30_000);
    }
}
