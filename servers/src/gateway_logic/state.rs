//! Shared application state handed to every component by the supervisor.
//!
//! `AppState` is cheap to clone; all fields are behind `Arc`. The derived
//! session document lives behind a reader-writer lock with snapshots
//! returned by value, and the fan-out channel plus the engine inbox are
//! owned here so no component needs to know about any other.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::gateway_logic::config::Config;
use crate::gateway_logic::model::{ServerMessage, SessionDocument};

/// How long a serialized `/api/session` response may be reused to collapse
/// dashboard polling bursts.
const SESSION_CACHE_MS: u128 = 1_000;

/// Commands accepted by the engine task, which serializes every mutation of
/// the FSM.
pub enum EngineCommand {
    /// A raw frame from the upstream link.
    Frame(Value),
    /// Re-run the seeder; responds with the fresh document.
    Refresh(oneshot::Sender<Arc<SessionDocument>>),
    /// Evaluate wall-clock rules (expiry, inactivity fallback).
    ClockTick,
    /// Prune the event log down to the replay window.
    PruneSweep,
}

/// Monotonic counters surfaced by `/api/session/stats`.
#[derive(Default)]
pub struct Counters {
    pub events_received: AtomicU64,
    pub events_normalized: AtomicU64,
    pub events_duplicate: AtomicU64,
    pub events_noise: AtomicU64,
    pub events_malformed: AtomicU64,
    pub events_persisted: AtomicU64,
    pub broadcasts_sent: AtomicU64,
    pub clients_total: AtomicU64,
    pub upstream_reconnects: AtomicU64,
    pub db_write_failures: AtomicU64,
}

impl Counters {
    pub fn as_json(&self) -> Value {
        json!({
            "eventsReceived": self.events_received.load(Ordering::Relaxed),
            "eventsNormalized": self.events_normalized.load(Ordering::Relaxed),
            "eventsDuplicate": self.events_duplicate.load(Ordering::Relaxed),
            "eventsNoise": self.events_noise.load(Ordering::Relaxed),
            "eventsMalformed": self.events_malformed.load(Ordering::Relaxed),
            "eventsPersisted": self.events_persisted.load(Ordering::Relaxed),
            "broadcastsSent": self.broadcasts_sent.load(Ordering::Relaxed),
            "clientsTotal": self.clients_total.load(Ordering::Relaxed),
            "upstreamReconnects": self.upstream_reconnects.load(Ordering::Relaxed),
            "dbWriteFailures": self.db_write_failures.load(Ordering::Relaxed),
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    session: Arc<RwLock<Arc<SessionDocument>>>,
    session_cache: Arc<Mutex<Option<(Instant, String)>>>,
    broadcast_tx: broadcast::Sender<Arc<ServerMessage>>,
    engine_tx: mpsc::UnboundedSender<EngineCommand>,
    shutdown_tx: broadcast::Sender<()>,
    pub counters: Arc<Counters>,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    nina_connected: Arc<AtomicBool>,
    database_healthy: Arc<AtomicBool>,
    max_reconnect_reached: Arc<AtomicBool>,
    client_count: Arc<AtomicUsize>,
    pub max_clients: usize,
}

impl AppState {
    pub fn new(
        config: &Config,
        engine_tx: mpsc::UnboundedSender<EngineCommand>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        // Per-client fan-out queue depth: a client that falls this many
        // frames behind is dropped.
        let (broadcast_tx, _) = broadcast::channel(64);
        let now = Utc::now();
        Self {
            session: Arc::new(RwLock::new(Arc::new(SessionDocument::empty(now)))),
            session_cache: Arc::new(Mutex::new(None)),
            broadcast_tx,
            engine_tx,
            shutdown_tx,
            counters: Arc::new(Counters::default()),
            started_at: now,
            started_instant: Instant::now(),
            nina_connected: Arc::new(AtomicBool::new(false)),
            database_healthy: Arc::new(AtomicBool::new(true)),
            max_reconnect_reached: Arc::new(AtomicBool::new(false)),
            client_count: Arc::new(AtomicUsize::new(0)),
            max_clients: config.max_dashboard_clients,
        }
    }

    /// The current derived document, by value.
    pub fn snapshot(&self) -> Arc<SessionDocument> {
        match self.session.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replaces the snapshot and invalidates the HTTP response cache.
    pub fn publish(&self, doc: SessionDocument) {
        let doc = Arc::new(doc);
        match self.session.write() {
            Ok(mut guard) => *guard = doc,
            Err(poisoned) => *poisoned.into_inner() = doc,
        }
        if let Ok(mut cache) = self.session_cache.lock() {
            *cache = None;
        }
    }

    /// Serialized `/api/session` response with a short cache in front,
    /// rebuilt through `build` on miss.
    pub fn cached_session_response(&self, build: impl FnOnce() -> String) -> String {
        if let Ok(mut cache) = self.session_cache.lock() {
            if let Some((at, body)) = cache.as_ref() {
                if at.elapsed().as_millis() < SESSION_CACHE_MS {
                    return body.clone();
                }
            }
            let body = build();
            *cache = Some((Instant::now(), body.clone()));
            return body;
        }
        build()
    }

    /// Fans a frame out to every dashboard client.
    pub fn broadcast(&self, kind: &str, data: Value) {
        let msg = Arc::new(ServerMessage::new(kind, data, Utc::now()));
        // Send errors only mean no client is connected right now.
        if self.broadcast_tx.send(msg).is_ok() {
            self.counters.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn subscribe_broadcast(&self) -> broadcast::Receiver<Arc<ServerMessage>> {
        self.broadcast_tx.subscribe()
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Queues a command for the engine task. Fails only when the engine has
    /// exited.
    pub fn send_engine(&self, cmd: EngineCommand) -> Result<(), String> {
        self.engine_tx
            .send(cmd)
            .map_err(|_| "session engine is not running".to_string())
    }

    pub fn engine_alive(&self) -> bool {
        !self.engine_tx.is_closed()
    }

    /// Admission control for dashboard sockets; returns false at the cap.
    pub fn try_admit_client(&self) -> bool {
        let mut current = self.client_count.load(Ordering::Acquire);
        loop {
            if current >= self.max_clients {
                return false;
            }
            match self.client_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.counters.clients_total.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release_client(&self) {
        self.client_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Acquire)
    }

    pub fn set_nina_connected(&self, connected: bool) {
        self.nina_connected.store(connected, Ordering::Release);
    }

    pub fn nina_connected(&self) -> bool {
        self.nina_connected.load(Ordering::Acquire)
    }

    pub fn set_database_healthy(&self, healthy: bool) {
        self.database_healthy.store(healthy, Ordering::Release);
    }

    pub fn database_healthy(&self) -> bool {
        self.database_healthy.load(Ordering::Acquire)
    }

    pub fn set_max_reconnect_reached(&self, reached: bool) {
        self.max_reconnect_reached.store(reached, Ordering::Release);
    }

    pub fn max_reconnect_reached(&self) -> bool {
        self.max_reconnect_reached.load(Ordering::Acquire)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_instant.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn app_state(max_clients: usize) -> AppState {
        let mut config = Config::parse_from(["test"]);
        config.max_dashboard_clients = max_clients;
        let (engine_tx, _engine_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        AppState::new(&config, engine_tx, shutdown_tx)
    }

    #[test]
    fn admission_respects_the_cap() {
        let state = app_state(2);
        assert!(state.try_admit_client());
        assert!(state.try_admit_client());
        assert!(!state.try_admit_client());

        state.release_client();
        assert!(state.try_admit_client());
        assert_eq!(state.client_count(), 2);
    }

    #[test]
    fn publish_invalidates_the_response_cache() {
        let state = app_state(10);
        let first = state.cached_session_response(|| "one".to_string());
        assert_eq!(first, "one");
        // Within the TTL the cached body is reused.
        let again = state.cached_session_response(|| "two".to_string());
        assert_eq!(again, "one");

        state.publish(SessionDocument::empty(Utc::now()));
        let rebuilt = state.cached_session_response(|| "three".to_string());
        assert_eq!(rebuilt, "three");
    }
}
