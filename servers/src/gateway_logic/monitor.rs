//! Periodic sweeps: wall-clock evaluation of the session (target expiry,
//! inactivity fallback), event-log pruning, heartbeat frames to the
//! dashboards, and health-transition logging.

use serde_json::json;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;

use crate::gateway_logic::config::Config;
use crate::gateway_logic::model::frame;
use crate::gateway_logic::state::{AppState, EngineCommand};

const CLOCK_TICK_SECS: u64 = 60;
const HEARTBEAT_SECS: u64 = 30;
const PRUNE_SWEEP_SECS: u64 = 900;

pub async fn run(_config: Config, app_state: AppState, mut shutdown: broadcast::Receiver<()>) {
    let mut clock_timer = interval(Duration::from_secs(CLOCK_TICK_SECS));
    let mut heartbeat_timer = interval(Duration::from_secs(HEARTBEAT_SECS));
    let mut prune_timer = interval(Duration::from_secs(PRUNE_SWEEP_SECS));
    let mut was_connected = app_state.nina_connected();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Monitor service received shutdown signal.");
                break;
            }
            _ = clock_timer.tick() => {
                if app_state.send_engine(EngineCommand::ClockTick).is_err() {
                    log::warn!("Session engine is gone; monitor idle.");
                }

                let connected = app_state.nina_connected();
                if connected != was_connected {
                    if connected {
                        log::info!("Imaging host link is up.");
                    } else {
                        log::warn!("Imaging host link is down; serving last known state.");
                    }
                    was_connected = connected;
                }
            }
            _ = heartbeat_timer.tick() => {
                app_state.broadcast(frame::HEARTBEAT, json!({
                    "uptime": app_state.uptime_seconds(),
                    "ninaConnected": app_state.nina_connected(),
                    "dashboardClients": app_state.client_count(),
                }));
            }
            _ = prune_timer.tick() => {
                let _ = app_state.send_engine(EngineCommand::PruneSweep);
            }
        }
    }
}
