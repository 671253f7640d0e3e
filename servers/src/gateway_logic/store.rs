//! SQLite persistence for the event log and the derived session state.
//!
//! Booleans are stored as 0/1 integers and instants as ISO-8601 UTC
//! strings; the in-memory document uses native types, so all conversion is
//! encapsulated here. Appends are idempotent through a content-derived
//! dedupe key, which keeps reseeding safe to run at any time.

use chrono::{DateTime, SecondsFormat, Utc};
use lib_common::connections::db_sqlite::{Database, DbError};
use rusqlite::params;
use serde_json::Value;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::str::FromStr;

use crate::gateway_logic::model::{
    ActivityInfo, FsmState, NormalizedEvent, SafetyStatus, SessionDocument, Subsystem,
};

/// Events are batched into one transaction per this many rows on the
/// seeding path.
const BATCH_SIZE: usize = 50;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS session_event (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    session_uuid  TEXT NOT NULL,
    event_type    TEXT NOT NULL,
    timestamp_utc TEXT NOT NULL,
    payload_json  TEXT NOT NULL,
    enriched_json TEXT NOT NULL,
    dedupe_key    TEXT NOT NULL UNIQUE,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_session_event_session
    ON session_event (session_uuid, timestamp_utc);

CREATE TABLE IF NOT EXISTS session_state (
    id                   INTEGER PRIMARY KEY CHECK (id = 1),
    current_session_uuid TEXT NOT NULL,
    session_start        TEXT,
    is_active            INTEGER NOT NULL DEFAULT 0,
    fsm_state            TEXT NOT NULL,
    target_json          TEXT,
    filter_name          TEXT,
    last_image_json      TEXT,
    safety_is_safe       INTEGER,
    safety_time          TEXT,
    activity_subsystem   TEXT NOT NULL,
    activity_state       TEXT NOT NULL,
    activity_since       TEXT,
    last_equipment_json  TEXT,
    flats_json           TEXT NOT NULL,
    darks_json           TEXT NOT NULL,
    is_guiding           INTEGER NOT NULL DEFAULT 0,
    last_update          TEXT NOT NULL
);
";

pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    /// Opens the store, creating the schema when missing. Failure here is a
    /// fatal boot condition for the caller.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let db = Database::open(path)?;
        db.with_conn(|conn| conn.execute_batch(SCHEMA))?;
        Ok(Self { db })
    }

    /// Appends one event. Re-appending the same event is a no-op thanks to
    /// the dedupe key. The write is retried once before the error is
    /// surfaced.
    pub fn append(&self, event: &NormalizedEvent) -> Result<(), DbError> {
        match self.try_append(event) {
            Ok(()) => Ok(()),
            Err(first) => {
                log::warn!("Event append failed, retrying once: {}", first);
                self.try_append(event)
            }
        }
    }

    fn try_append(&self, event: &NormalizedEvent) -> Result<(), DbError> {
        let now = iso(Utc::now());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO session_event
                   (session_uuid, event_type, timestamp_utc, payload_json, enriched_json, dedupe_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.session_uuid,
                    event.event_type,
                    iso(event.timestamp),
                    event.payload.to_string(),
                    event.enriched.to_string(),
                    dedupe_key(event),
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// Appends a batch in transactions of `BATCH_SIZE`, used by the seeding
    /// path. Each chunk commits atomically, so a cancelled replay never
    /// leaves a torn batch behind.
    pub fn append_batch(&self, events: &[NormalizedEvent]) -> Result<(), DbError> {
        for chunk in events.chunks(BATCH_SIZE) {
            let now = iso(Utc::now());
            self.db.with_conn(|conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO session_event
                           (session_uuid, event_type, timestamp_utc, payload_json, enriched_json, dedupe_key, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    )?;
                    for event in chunk {
                        stmt.execute(params![
                            event.session_uuid,
                            event.event_type,
                            iso(event.timestamp),
                            event.payload.to_string(),
                            event.enriched.to_string(),
                            dedupe_key(event),
                            now,
                        ])?;
                    }
                }
                tx.commit()
            })?;
        }
        Ok(())
    }

    /// Mirrors the derived document into the singleton state row, retrying
    /// once on failure.
    pub fn update_state(&self, doc: &SessionDocument) -> Result<(), DbError> {
        match self.try_update_state(doc) {
            Ok(()) => Ok(()),
            Err(first) => {
                log::warn!("State write failed, retrying once: {}", first);
                self.try_update_state(doc)
            }
        }
    }

    fn try_update_state(&self, doc: &SessionDocument) -> Result<(), DbError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO session_state
                   (id, current_session_uuid, session_start, is_active, fsm_state,
                    target_json, filter_name, last_image_json,
                    safety_is_safe, safety_time,
                    activity_subsystem, activity_state, activity_since,
                    last_equipment_json, flats_json, darks_json,
                    is_guiding, last_update)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    doc.session_uuid,
                    doc.session_start.map(iso),
                    doc.is_active as i64,
                    doc.fsm_state.as_str(),
                    doc.target.as_ref().map(to_json),
                    doc.filter.as_ref().map(|f| f.name.clone()),
                    doc.last_image.as_ref().map(to_json),
                    doc.safety.is_safe.map(|b| b as i64),
                    doc.safety.time.map(iso),
                    to_json(&doc.activity.subsystem),
                    doc.activity.state,
                    doc.activity.since.map(iso),
                    doc.last_equipment_change.as_ref().map(to_json),
                    to_json(&doc.flats),
                    to_json(&doc.darks),
                    doc.is_guiding as i64,
                    iso(doc.last_update),
                ],
            )?;
            Ok(())
        })
    }

    /// Reads the persisted state row back into a document, or None when no
    /// state has ever been written.
    pub fn read_state(&self) -> Result<Option<SessionDocument>, DbError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT current_session_uuid, session_start, is_active, fsm_state,
                        target_json, filter_name, last_image_json,
                        safety_is_safe, safety_time,
                        activity_subsystem, activity_state, activity_since,
                        last_equipment_json, flats_json, darks_json,
                        is_guiding, last_update
                   FROM session_state WHERE id = 1",
            )?;
            let mut rows = stmt.query([])?;
            let Some(row) = rows.next()? else {
                return Ok(None);
            };

            let doc = SessionDocument {
                session_uuid: row.get::<_, String>(0)?,
                session_start: parse_instant(row.get::<_, Option<String>>(1)?),
                is_active: row.get::<_, i64>(2)? != 0,
                fsm_state: FsmState::from_str(&row.get::<_, String>(3)?)
                    .unwrap_or(FsmState::Idle),
                target: parse_json(row.get::<_, Option<String>>(4)?),
                filter: row
                    .get::<_, Option<String>>(5)?
                    .map(|name| crate::gateway_logic::model::FilterInfo { name }),
                last_image: parse_json(row.get::<_, Option<String>>(6)?),
                safety: SafetyStatus {
                    is_safe: row.get::<_, Option<i64>>(7)?.map(|v| v != 0),
                    time: parse_instant(row.get::<_, Option<String>>(8)?),
                },
                activity: ActivityInfo {
                    subsystem: serde_json::from_str::<Subsystem>(&row.get::<_, String>(9)?)
                        .unwrap_or(Subsystem::None),
                    state: row.get::<_, String>(10)?,
                    since: parse_instant(row.get::<_, Option<String>>(11)?),
                },
                last_equipment_change: parse_json(row.get::<_, Option<String>>(12)?),
                flats: parse_json(row.get::<_, Option<String>>(13)?).unwrap_or_default(),
                darks: parse_json(row.get::<_, Option<String>>(14)?).unwrap_or_default(),
                is_guiding: row.get::<_, i64>(15)? != 0,
                last_update: parse_instant(row.get::<_, Option<String>>(16)?)
                    .unwrap_or_else(Utc::now),
            };
            Ok(Some(doc))
        })
    }

    /// The most recent `n` events in ascending timestamp order.
    pub fn list_recent(&self, n: usize) -> Result<Vec<NormalizedEvent>, DbError> {
        let mut events = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_uuid, event_type, timestamp_utc, payload_json, enriched_json
                   FROM session_event
                  ORDER BY timestamp_utc DESC, id DESC
                  LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![n as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        events.reverse();
        Ok(events
            .into_iter()
            .filter_map(|(session_uuid, event_type, ts, payload, enriched)| {
                let timestamp = parse_instant(Some(ts))?;
                Some(NormalizedEvent {
                    event_type,
                    timestamp,
                    payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                    enriched: serde_json::from_str(&enriched).unwrap_or(Value::Null),
                    session_uuid,
                })
            })
            .collect())
    }

    /// Deletes all but the newest `keep` events of each session.
    pub fn prune(&self, keep: usize) -> Result<usize, DbError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM session_event WHERE id IN (
                     SELECT id FROM (
                         SELECT id,
                                ROW_NUMBER() OVER (
                                    PARTITION BY session_uuid
                                    ORDER BY timestamp_utc DESC, id DESC
                                ) AS rn
                           FROM session_event
                     ) WHERE rn > ?1
                 )",
                params![keep as i64],
            )
        })
    }

    pub fn event_count(&self) -> Result<i64, DbError> {
        self.db
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM session_event", [], |r| r.get(0)))
    }

    pub fn ping(&self) -> Result<(), DbError> {
        self.db.ping()
    }
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_instant(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Option<T> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Content-derived key making appends idempotent across reseeds.
fn dedupe_key(event: &NormalizedEvent) -> String {
    let mut hasher = DefaultHasher::new();
    event.payload.to_string().hash(&mut hasher);
    format!(
        "{}|{}|{:016x}",
        event.event_type,
        iso(event.timestamp),
        hasher.finish()
    )
}
