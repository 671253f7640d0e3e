//! Shared data model for the session gateway: normalized imaging-host
//! events, the derived session document, and the wire frames exchanged with
//! dashboard clients.
//!
//! Everything here serializes with camelCase field names, which is the shape
//! the dashboards consume. Instants are `DateTime<Utc>` and render as
//! ISO-8601 with explicit offset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Session tag used before any session has been established.
pub const SESSION_CURRENT: &str = "session_current";

/// Frame types the gateway originates on the dashboard WebSocket.
pub mod frame {
    pub const SESSION_UPDATE: &str = "sessionUpdate";
    pub const ENHANCED_SESSION_UPDATE: &str = "enhancedSessionUpdate";
    pub const CONFIG_UPDATE: &str = "config-update";
    pub const NINA_EVENT: &str = "nina-event";
    pub const HEARTBEAT: &str = "heartbeat";

    /// Every frame type a client may subscribe to.
    pub const ALL: &[&str] = &[
        SESSION_UPDATE,
        ENHANCED_SESSION_UPDATE,
        CONFIG_UPDATE,
        NINA_EVENT,
        HEARTBEAT,
    ];
}

/// A single imaging-host event after normalization: shape flattened,
/// timestamp resolved to UTC, payload enriched from the rolling context and
/// tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub enriched: Value,
    pub session_uuid: String,
}

/// FSM states of the reconstructed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsmState {
    Idle,
    Imaging,
    Flats,
    Darks,
    Paused,
}

impl FsmState {
    /// A session is active in every state except `idle`.
    pub fn is_active(self) -> bool {
        !matches!(self, FsmState::Idle)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FsmState::Idle => "idle",
            FsmState::Imaging => "imaging",
            FsmState::Flats => "flats",
            FsmState::Darks => "darks",
            FsmState::Paused => "paused",
        }
    }
}

impl std::str::FromStr for FsmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(FsmState::Idle),
            "imaging" => Ok(FsmState::Imaging),
            "flats" => Ok(FsmState::Flats),
            "darks" => Ok(FsmState::Darks),
            "paused" => Ok(FsmState::Paused),
            other => Err(format!("unknown fsm state '{other}'")),
        }
    }
}

/// Frame classification carried by `IMAGE-SAVE` statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageType {
    Light,
    Dark,
    Flat,
    Unknown,
}

impl ImageType {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "LIGHT" => ImageType::Light,
            "DARK" => ImageType::Dark,
            "FLAT" => ImageType::Flat,
            _ => ImageType::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinates {
    pub ra: Option<String>,
    pub dec: Option<String>,
}

/// The target the imaging host is currently pointed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub name: String,
    pub project: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub rotation: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub scheduled_end_at: Option<DateTime<Utc>>,
    pub is_expired: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterInfo {
    pub name: String,
}

/// Statistics of the most recently saved frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    #[serde(rename = "type")]
    pub image_type: ImageType,
    pub filter: Option<String>,
    pub exposure_time: Option<f64>,
    pub temperature: Option<f64>,
    pub hfr: Option<f64>,
    pub stars: Option<i64>,
    pub rms: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Tri-state safety monitor value. `is_safe = None` means no
/// `SAFETY-CHANGED` event has been observed yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyStatus {
    pub is_safe: Option<bool>,
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    Autofocus,
    Guiding,
    Mount,
    Rotator,
    Sequencer,
    Flats,
    Darks,
    None,
}

/// What the observatory is currently doing, projected from the
/// highest-priority active subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityInfo {
    pub subsystem: Subsystem,
    pub state: String,
    pub since: Option<DateTime<Utc>>,
}

impl Default for ActivityInfo {
    fn default() -> Self {
        Self {
            subsystem: Subsystem::None,
            state: "idle".to_string(),
            since: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentChange {
    pub device: String,
    pub event: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatsInfo {
    pub is_active: bool,
    pub filter: Option<String>,
    pub brightness: Option<f64>,
    pub image_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_image_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DarksInfo {
    pub is_active: bool,
    pub current_exposure_time: Option<f64>,
    /// Dark frame counts grouped by exposure time, keyed by the rendered
    /// exposure (e.g. "60", "300", "0.5").
    pub exposure_groups: BTreeMap<String, u32>,
    pub total_images: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_image_at: Option<DateTime<Utc>>,
}

/// The derived session document: the authoritative projection of the
/// imaging host's current session, recomputed by the FSM on every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDocument {
    pub session_start: Option<DateTime<Utc>>,
    pub session_uuid: String,
    pub is_active: bool,
    pub fsm_state: FsmState,
    pub target: Option<TargetInfo>,
    pub filter: Option<FilterInfo>,
    pub last_image: Option<ImageInfo>,
    pub safety: SafetyStatus,
    pub activity: ActivityInfo,
    pub last_equipment_change: Option<EquipmentChange>,
    pub flats: FlatsInfo,
    pub darks: DarksInfo,
    pub is_guiding: bool,
    pub last_update: DateTime<Utc>,
}

impl SessionDocument {
    /// An empty document with no session established.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            session_start: None,
            session_uuid: SESSION_CURRENT.to_string(),
            is_active: false,
            fsm_state: FsmState::Idle,
            target: None,
            filter: None,
            last_image: None,
            safety: SafetyStatus::default(),
            activity: ActivityInfo::default(),
            last_equipment_change: None,
            flats: FlatsInfo::default(),
            darks: DarksInfo::default(),
            is_guiding: false,
            last_update: now,
        }
    }

    /// Value equality over every tracked field except `lastUpdate`.
    pub fn same_state(&self, other: &Self) -> bool {
        let mut probe = self.clone();
        probe.last_update = other.last_update;
        probe == *other
    }
}

/// Server-originated frame on the dashboard WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMessage {
    pub r#type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl ServerMessage {
    pub fn new(kind: &str, data: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            r#type: kind.to_string(),
            data,
            timestamp,
        }
    }
}

/// Client-originated frame. Both fields are advisory; unknown types are
/// ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientMessage {
    pub r#type: Option<String>,
    pub events: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_document() -> SessionDocument {
        let now = Utc.with_ymd_and_hms(2024, 1, 16, 1, 0, 0).unwrap();
        let mut doc = SessionDocument::empty(now);
        doc.session_start = Some(now);
        doc.session_uuid = format!("session_{}", now.timestamp_millis());
        doc.is_active = true;
        doc.fsm_state = FsmState::Imaging;
        doc.target = Some(TargetInfo {
            name: "M31".to_string(),
            project: Some("DSO".to_string()),
            coordinates: Some(Coordinates {
                ra: Some("00:42:44.31".to_string()),
                dec: Some("+41:16:09.4".to_string()),
            }),
            rotation: Some(180.0),
            started_at: now,
            scheduled_end_at: None,
            is_expired: false,
        });
        doc.filter = Some(FilterInfo {
            name: "Ha".to_string(),
        });
        doc.last_image = Some(ImageInfo {
            image_type: ImageType::Light,
            filter: Some("Ha".to_string()),
            exposure_time: Some(300.0),
            temperature: Some(-10.0),
            hfr: Some(2.1),
            stars: Some(1520),
            rms: Some(0.45),
            timestamp: now,
        });
        doc.safety = SafetyStatus {
            is_safe: Some(true),
            time: Some(now),
        };
        doc.is_guiding = true;
        doc
    }

    #[test]
    fn session_document_json_round_trip() {
        let doc = sample_document();
        let json = serde_json::to_string(&doc).unwrap();
        let back: SessionDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, back);
    }

    #[test]
    fn wire_names_are_camel_case() {
        let doc = sample_document();
        let value = serde_json::to_value(&doc).unwrap();
        assert!(value.get("sessionStart").is_some());
        assert!(value.get("fsmState").is_some());
        assert_eq!(value["fsmState"], "imaging");
        assert_eq!(value["lastImage"]["type"], "LIGHT");
        assert!(value.get("lastEquipmentChange").is_some());
    }

    #[test]
    fn same_state_ignores_last_update_only() {
        let doc = sample_document();
        let mut later = doc.clone();
        later.last_update = doc.last_update + chrono::Duration::seconds(30);
        assert!(doc.same_state(&later));

        later.is_guiding = false;
        assert!(!doc.same_state(&later));
    }

    #[test]
    fn unknown_image_types_collapse_to_unknown() {
        assert_eq!(ImageType::parse("light"), ImageType::Light);
        assert_eq!(ImageType::parse("SNAPSHOT"), ImageType::Unknown);
        assert_eq!(ImageType::parse(""), ImageType::Unknown);
    }
}
