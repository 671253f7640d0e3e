//! The session engine: the single task through which every FSM mutation
//! flows. Live frames, manual refreshes, clock ticks and prune sweeps all
//! arrive on one command channel, so the reducer itself needs no locking
//! and every dashboard client observes updates in reducer order.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::gateway_logic::config::Config;
use crate::gateway_logic::fsm::SessionFsm;
use crate::gateway_logic::model::{frame, NormalizedEvent, SESSION_CURRENT};
use crate::gateway_logic::normalizer::{NormalizeOutcome, Normalizer};
use crate::gateway_logic::seeder;
use crate::gateway_logic::state::{AppState, EngineCommand};
use crate::gateway_logic::store::SessionStore;

/// A replay ending idle with a light frame this recent still implies an
/// active session (fallback when no start event is visible in history).
const RECENT_ACTIVITY_FALLBACK_MINUTES: i64 = 30;

pub async fn run(
    config: Config,
    app_state: AppState,
    store: SessionStore,
    mut cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut normalizer = Normalizer::new(config.timezone_offset());
    let mut fsm = SessionFsm::new(Utc::now());

    // The previously persisted row is informational only; the authoritative
    // state is whatever the replay below reconstructs.
    match store.read_state() {
        Ok(Some(prev)) => log::info!(
            "Previously persisted state: session={} fsmState={} lastUpdate={}",
            prev.session_uuid,
            prev.fsm_state.as_str(),
            prev.last_update
        ),
        Ok(None) => log::info!("No previously persisted state row"),
        Err(e) => log::warn!("Could not read persisted state: {}", e),
    }
    match store.list_recent(config.event_replay_window) {
        Ok(events) => log::info!("{} persisted events in the replay window", events.len()),
        Err(e) => log::warn!("Could not read the event log: {}", e),
    }

    match seed(&config, &app_state, &store).await {
        Ok((seeded_normalizer, seeded_fsm)) => {
            normalizer = seeded_normalizer;
            fsm = seeded_fsm;
        }
        Err(e) => log::warn!("Boot seeding failed, starting from empty state: {}", e),
    }
    app_state.publish(fsm.document().clone());

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Session engine received shutdown signal.");
                // Flush the final document before exiting.
                persist_state(&app_state, &store, &fsm);
                break;
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    EngineCommand::Frame(raw) => {
                        handle_frame(&app_state, &store, &mut normalizer, &mut fsm, &raw);
                    }
                    EngineCommand::Refresh(responder) => {
                        match seed(&config, &app_state, &store).await {
                            Ok((seeded_normalizer, mut seeded_fsm)) => {
                                let previous = app_state.snapshot();
                                seeded_fsm.clamp_last_update(previous.last_update);
                                let changed = !seeded_fsm.document().same_state(&previous);
                                normalizer = seeded_normalizer;
                                fsm = seeded_fsm;
                                if changed {
                                    app_state.publish(fsm.document().clone());
                                    broadcast_document(&app_state, &fsm);
                                }
                            }
                            Err(e) => log::warn!("Manual refresh failed, keeping current state: {}", e),
                        }
                        let _ = responder.send(app_state.snapshot());
                    }
                    EngineCommand::ClockTick => {
                        if fsm.apply_clock(Utc::now()) {
                            log::info!("Clock rules changed the session document");
                            persist_state(&app_state, &store, &fsm);
                            app_state.publish(fsm.document().clone());
                            broadcast_document(&app_state, &fsm);
                        }
                        // A previously failed database recovers silently.
                        if !app_state.database_healthy() && store.ping().is_ok() {
                            log::info!("Database is reachable again");
                            app_state.set_database_healthy(true);
                        }
                    }
                    EngineCommand::PruneSweep => {
                        match store.prune(config.event_replay_window) {
                            Ok(0) => {}
                            Ok(removed) => log::info!("Pruned {} events beyond the replay window", removed),
                            Err(e) => log::warn!("Prune sweep failed: {}", e),
                        }
                    }
                }
            }
        }
    }
}

/// Applies one live frame: normalize, reduce, persist, fan out.
fn handle_frame(
    app_state: &AppState,
    store: &SessionStore,
    normalizer: &mut Normalizer,
    fsm: &mut SessionFsm,
    raw: &serde_json::Value,
) {
    let counters = &app_state.counters;
    counters.events_received.fetch_add(1, Ordering::Relaxed);

    let mut event = match normalizer.normalize(raw) {
        NormalizeOutcome::Event(event) => *event,
        NormalizeOutcome::Duplicate => {
            counters.events_duplicate.fetch_add(1, Ordering::Relaxed);
            return;
        }
        NormalizeOutcome::Noise => {
            counters.events_noise.fetch_add(1, Ordering::Relaxed);
            return;
        }
        NormalizeOutcome::Malformed => {
            counters.events_malformed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    counters.events_normalized.fetch_add(1, Ordering::Relaxed);

    let changed = reduce_and_tag(fsm, &mut event);
    persist_event(app_state, store, &event);

    if let Ok(data) = serde_json::to_value(&event) {
        app_state.broadcast(frame::NINA_EVENT, data);
    }

    if changed {
        persist_state(app_state, store, fsm);
        app_state.publish(fsm.document().clone());
        broadcast_document(app_state, fsm);
    }
}

/// Runs the reducer and tags the event with the session it belongs to: a
/// session-creating event gets the new uuid, a session-ending event keeps
/// the uuid of the session it closed.
fn reduce_and_tag(fsm: &mut SessionFsm, event: &mut NormalizedEvent) -> bool {
    let uuid_before = fsm.document().session_uuid.clone();
    let changed = fsm.apply(event);
    let uuid_after = fsm.document().session_uuid.clone();
    event.session_uuid = if uuid_after != SESSION_CURRENT {
        uuid_after
    } else {
        uuid_before
    };
    changed
}

/// Rebuilds the session from the upstream history. Returns the fresh
/// normalizer and FSM only on success, so a failed reseed never clobbers
/// live state. Idempotent: persisted events dedupe on content.
async fn seed(
    config: &Config,
    app_state: &AppState,
    store: &SessionStore,
) -> anyhow::Result<(Normalizer, SessionFsm)> {
    let raw_events = seeder::fetch_event_history(config).await?;

    let mut normalizer = Normalizer::new(config.timezone_offset());
    let mut fsm = SessionFsm::new(Utc::now());
    let counters = &app_state.counters;

    let mut events = Vec::with_capacity(raw_events.len());
    for raw in &raw_events {
        match normalizer.normalize(raw) {
            NormalizeOutcome::Event(event) => events.push(*event),
            NormalizeOutcome::Duplicate => {
                counters.events_duplicate.fetch_add(1, Ordering::Relaxed);
            }
            NormalizeOutcome::Noise => {
                counters.events_noise.fetch_add(1, Ordering::Relaxed);
            }
            NormalizeOutcome::Malformed => {
                counters.events_malformed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    events.sort_by_key(|e| e.timestamp);

    for event in &mut events {
        reduce_and_tag(&mut fsm, event);
    }

    // No start event visible but a light frame landed recently: treat the
    // session as still running.
    if !fsm.document().is_active {
        if let Some(image) = fsm.document().last_image.clone() {
            if Utc::now() - image.timestamp
                <= ChronoDuration::minutes(RECENT_ACTIVITY_FALLBACK_MINUTES)
            {
                log::info!(
                    "No session start in history but imaging activity at {}; assuming active session",
                    image.timestamp
                );
                fsm.assume_active_imaging(image.timestamp);
            }
        }
    }

    // Only the tail matters for replay; the log is state reconstruction,
    // not an archive.
    let window = config.event_replay_window;
    let tail_start = events.len().saturating_sub(window);
    match store.append_batch(&events[tail_start..]) {
        Ok(()) => {
            app_state.set_database_healthy(true);
            counters
                .events_persisted
                .fetch_add((events.len() - tail_start) as u64, Ordering::Relaxed);
        }
        Err(e) => {
            counters.db_write_failures.fetch_add(1, Ordering::Relaxed);
            app_state.set_database_healthy(false);
            log::error!("Failed to persist seeded events: {}", e);
        }
    }
    persist_state(app_state, store, &fsm);

    log::info!(
        "Seeded session state from {} events: fsmState={} session={}",
        events.len(),
        fsm.document().fsm_state.as_str(),
        fsm.document().session_uuid
    );
    Ok((normalizer, fsm))
}

fn persist_event(app_state: &AppState, store: &SessionStore, event: &NormalizedEvent) {
    match store.append(event) {
        Ok(()) => {
            app_state.set_database_healthy(true);
            app_state
                .counters
                .events_persisted
                .fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            app_state
                .counters
                .db_write_failures
                .fetch_add(1, Ordering::Relaxed);
            app_state.set_database_healthy(false);
            log::error!("Failed to persist event {}: {}", event.event_type, e);
        }
    }
}

fn persist_state(app_state: &AppState, store: &SessionStore, fsm: &SessionFsm) {
    match store.update_state(fsm.document()) {
        Ok(()) => app_state.set_database_healthy(true),
        Err(e) => {
            app_state
                .counters
                .db_write_failures
                .fetch_add(1, Ordering::Relaxed);
            app_state.set_database_healthy(false);
            log::error!("Failed to persist session state: {}", e);
        }
    }
}

fn broadcast_document(app_state: &AppState, fsm: &SessionFsm) {
    if let Ok(data) = serde_json::to_value(fsm.document()) {
        app_state.broadcast(frame::SESSION_UPDATE, data);
    }
}
