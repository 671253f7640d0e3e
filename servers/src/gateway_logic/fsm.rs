//! Session finite state machine: a pure reducer from (state, event) to the
//! next state, projected into the derived session document.
//!
//! The reducer performs no I/O and never fails; malformed frames are
//! filtered upstream by the normalizer. All events funnel through a single
//! task, so no locking is needed here.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::gateway_logic::model::{
    ActivityInfo, Coordinates, DarksInfo, EquipmentChange, FilterInfo, FlatsInfo, FsmState,
    ImageInfo, ImageType, NormalizedEvent, SafetyStatus, SessionDocument, Subsystem, TargetInfo,
    SESSION_CURRENT,
};

/// Highest first: when several subsystems are active at once, the first
/// active entry in this order wins the activity projection.
const SUBSYSTEM_PRIORITY: &[Subsystem] = &[
    Subsystem::Autofocus,
    Subsystem::Guiding,
    Subsystem::Mount,
    Subsystem::Rotator,
    Subsystem::Sequencer,
];

/// Targets with no scheduled end expire after this much inactivity, and the
/// session is ended by the same rule.
const INACTIVITY_EXPIRY_HOURS: i64 = 8;

#[derive(Debug, Clone)]
struct SubsystemTrack {
    active: bool,
    state: String,
    since: DateTime<Utc>,
}

pub struct SessionFsm {
    doc: SessionDocument,
    subsystems: BTreeMap<Subsystem, SubsystemTrack>,
    /// State to return to when a flats interruption ends.
    resume_to: Option<FsmState>,
    /// Last image save or target start, for the inactivity fallback.
    last_activity_at: Option<DateTime<Utc>>,
}

impl SessionFsm {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            doc: SessionDocument::empty(now),
            subsystems: BTreeMap::new(),
            resume_to: None,
            last_activity_at: None,
        }
    }

    pub fn document(&self) -> &SessionDocument {
        &self.doc
    }

    /// Applies one normalized event. Returns true iff the document changed
    /// by value on any field other than `lastUpdate`.
    pub fn apply(&mut self, ev: &NormalizedEvent) -> bool {
        let before = self.doc.clone();
        let ts = ev.timestamp;

        match ev.event_type.as_str() {
            "TS-TARGETSTART" | "TS-NEWTARGETSTART" => self.on_target_start(ev),
            "SEQUENCE-STARTING" => self.on_sequence_start(ts),
            "TS-TARGETEND" | "TS-TARGETFINISHED" | "SEQUENCE-STOPPED" | "SEQUENCE-COMPLETED"
            | "SEQUENCE-FINISHED" => self.on_session_end(ts),
            "FILTERWHEEL-CHANGED" => self.on_filter_changed(ev),
            "IMAGE-SAVE" => self.on_image_save(ev),
            "SAFETY-CHANGED" => self.on_safety_changed(ev),
            "FLAT-CONNECTED" => self.on_flat_panel_connected(ts),
            "FLAT-DISCONNECTED" => self.on_flat_panel_disconnected(ts),
            "FLAT-BRIGHTNESS-CHANGED" => {
                if self.doc.flats.is_active {
                    if let Some(b) = ev.payload.get("Brightness").and_then(Value::as_f64) {
                        self.doc.flats.brightness = Some(b);
                    }
                }
            }
            other => {
                if let Some((subsystem, state, active)) = activity_event(other) {
                    self.track_subsystem(subsystem, state, active, ts);
                }
                if other == "GUIDER-START" && self.doc.fsm_state == FsmState::Paused {
                    self.doc.fsm_state = FsmState::Imaging;
                }
                if let Some((device, kind)) = equipment_event(other) {
                    self.on_equipment(device, kind, ts);
                }
            }
        }

        self.refresh_projections();
        self.finish(before, ts)
    }

    /// Applies wall-clock rules: target expiry and the inactivity fallback.
    pub fn apply_clock(&mut self, now: DateTime<Utc>) -> bool {
        let before = self.doc.clone();

        let mut no_schedule = true;
        if let Some(target) = &mut self.doc.target {
            match target.scheduled_end_at {
                Some(end) => {
                    no_schedule = false;
                    if now > end {
                        target.is_expired = true;
                    }
                }
                None => {
                    let reference = self.last_activity_at.unwrap_or(target.started_at);
                    if now - reference >= Duration::hours(INACTIVITY_EXPIRY_HOURS) {
                        target.is_expired = true;
                    }
                }
            }
        }

        // A session without a schedule winds down after prolonged silence.
        // A known scheduled end never ends the session by itself.
        if self.doc.is_active && no_schedule {
            let reference = self
                .last_activity_at
                .or(self.doc.session_start)
                .unwrap_or(now);
            if now - reference >= Duration::hours(INACTIVITY_EXPIRY_HOURS) {
                self.end_session();
            }
        }

        self.refresh_projections();
        self.finish(before, now)
    }

    /// Keeps `lastUpdate` monotonic across reseeds: a rebuilt document may
    /// derive an older instant than what clients have already seen.
    pub fn clamp_last_update(&mut self, floor: DateTime<Utc>) {
        if self.doc.last_update < floor {
            self.doc.last_update = floor;
        }
    }

    /// Seeder fallback: recent imaging activity implies an active session
    /// even when no start event is visible in the replayed history.
    pub fn assume_active_imaging(&mut self, since: DateTime<Utc>) -> bool {
        let before = self.doc.clone();
        if self.doc.fsm_state == FsmState::Idle {
            self.start_session(since);
            self.last_activity_at = Some(since);
        }
        self.refresh_projections();
        self.finish(before, since)
    }

    fn finish(&mut self, before: SessionDocument, ts: DateTime<Utc>) -> bool {
        self.doc.is_active = self.doc.fsm_state.is_active() && self.doc.session_start.is_some();
        let changed = !self.doc.same_state(&before);
        if changed {
            self.doc.last_update = ts;
        } else {
            self.doc.last_update = before.last_update;
        }
        changed
    }

    fn start_session(&mut self, ts: DateTime<Utc>) {
        self.doc.session_start = Some(ts);
        self.doc.session_uuid = format!("session_{}", ts.timestamp_millis());
        self.doc.fsm_state = FsmState::Imaging;
    }

    fn end_session(&mut self) {
        self.doc.fsm_state = FsmState::Idle;
        self.doc.session_start = None;
        self.doc.session_uuid = SESSION_CURRENT.to_string();
        self.doc.target = None;
        self.doc.flats = FlatsInfo::default();
        self.doc.darks = DarksInfo::default();
        self.resume_to = None;
    }

    fn on_target_start(&mut self, ev: &NormalizedEvent) {
        let ts = ev.timestamp;

        // A target start while calibration frames run finishes the
        // calibration block first, then applies normally.
        if self.doc.fsm_state == FsmState::Darks || self.doc.fsm_state == FsmState::Flats {
            self.end_session();
        }

        let name = ev
            .payload
            .get("TargetName")
            .and_then(Value::as_str)
            .unwrap_or("(unnamed)")
            .to_string();

        let same_target = self
            .doc
            .target
            .as_ref()
            .map(|t| t.name == name)
            .unwrap_or(false);

        // A start for a different target rolls the session; a target
        // arriving into a target-less session (sequence already running)
        // adopts it.
        if self.doc.target.is_some() && !same_target {
            self.end_session();
        }
        if self.doc.session_start.is_none() {
            self.start_session(ts);
        } else {
            self.doc.fsm_state = FsmState::Imaging;
        }

        let started_at = if same_target {
            self.doc.target.as_ref().map(|t| t.started_at).unwrap_or(ts)
        } else {
            ts
        };

        self.doc.target = Some(TargetInfo {
            name,
            project: ev
                .payload
                .get("ProjectName")
                .and_then(Value::as_str)
                .map(str::to_string),
            coordinates: parse_coordinates(&ev.payload),
            rotation: ev.payload.get("Rotation").and_then(Value::as_f64),
            started_at,
            scheduled_end_at: ev
                .enriched
                .get("scheduledEndUtc")
                .and_then(Value::as_str)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            is_expired: false,
        });

        self.track_subsystem(Subsystem::Sequencer, "running", true, ts);
        self.last_activity_at = Some(ts);
    }

    fn on_sequence_start(&mut self, ts: DateTime<Utc>) {
        self.track_subsystem(Subsystem::Sequencer, "running", true, ts);
        if self.doc.fsm_state == FsmState::Idle {
            self.start_session(ts);
        }
        self.last_activity_at = Some(ts);
    }

    fn on_session_end(&mut self, ts: DateTime<Utc>) {
        self.track_subsystem(Subsystem::Sequencer, "stopped", false, ts);
        if self.doc.fsm_state != FsmState::Idle {
            self.end_session();
        }
    }

    fn on_filter_changed(&mut self, ev: &NormalizedEvent) {
        if let Some(name) = ev.payload.pointer("/New/Name").and_then(Value::as_str) {
            self.doc.filter = Some(FilterInfo {
                name: name.to_string(),
            });
        }
    }

    fn on_image_save(&mut self, ev: &NormalizedEvent) {
        let ts = ev.timestamp;
        let stats = ev
            .enriched
            .get("ImageStatistics")
            .or_else(|| ev.payload.get("ImageStatistics"));

        let image_type = stats
            .and_then(|s| s.get("ImageType"))
            .and_then(Value::as_str)
            .map(ImageType::parse)
            .unwrap_or(ImageType::Unknown);
        let filter = stats
            .and_then(|s| s.get("Filter"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let exposure = stats.and_then(|s| s.get("ExposureTime")).and_then(Value::as_f64);

        self.doc.last_image = Some(ImageInfo {
            image_type,
            filter: filter.clone(),
            exposure_time: exposure,
            temperature: stats.and_then(|s| s.get("Temperature")).and_then(Value::as_f64),
            hfr: stats.and_then(|s| s.get("HFR")).and_then(Value::as_f64),
            stars: stats.and_then(|s| s.get("Stars")).and_then(Value::as_i64),
            rms: stats.and_then(|s| s.get("RMS")).and_then(Value::as_f64),
            timestamp: ts,
        });
        self.last_activity_at = Some(ts);

        // Any frame saved while the flat panel block runs counts as a flat.
        if self.doc.fsm_state == FsmState::Flats {
            self.doc.flats.image_count += 1;
            self.doc.flats.last_image_at = Some(ts);
            if let Some(b) = stats.and_then(|s| s.get("Brightness")).and_then(Value::as_f64) {
                self.doc.flats.brightness = Some(b);
            }
            return;
        }

        match image_type {
            ImageType::Light => {
                // A light frame during darks means the sequencer resumed
                // light acquisition within the same session.
                if self.doc.fsm_state == FsmState::Darks {
                    self.doc.darks.is_active = false;
                    self.doc.fsm_state = FsmState::Imaging;
                }
                if self.doc.fsm_state == FsmState::Imaging {
                    if let Some(name) = filter {
                        self.doc.filter = Some(FilterInfo { name });
                    }
                }
            }
            ImageType::Flat => {
                self.begin_flats(ts, filter);
                self.doc.flats.image_count += 1;
                self.doc.flats.last_image_at = Some(ts);
            }
            ImageType::Dark => {
                if self.doc.fsm_state != FsmState::Darks {
                    if self.doc.fsm_state == FsmState::Idle {
                        self.start_session(ts);
                    }
                    self.doc.fsm_state = FsmState::Darks;
                    self.doc.darks.is_active = true;
                    self.doc.darks.started_at = Some(ts);
                }
                let key = format_exposure(exposure);
                *self.doc.darks.exposure_groups.entry(key).or_insert(0) += 1;
                self.doc.darks.total_images += 1;
                self.doc.darks.current_exposure_time = exposure;
                self.doc.darks.last_image_at = Some(ts);
            }
            ImageType::Unknown => {}
        }
    }

    fn on_safety_changed(&mut self, ev: &NormalizedEvent) {
        let Some(is_safe) = ev.payload.get("IsSafe").and_then(Value::as_bool) else {
            return;
        };
        self.doc.safety = SafetyStatus {
            is_safe: Some(is_safe),
            time: Some(ev.timestamp),
        };
        if !is_safe && self.doc.fsm_state == FsmState::Imaging {
            self.doc.fsm_state = FsmState::Paused;
        } else if is_safe && self.doc.fsm_state == FsmState::Paused {
            self.doc.fsm_state = FsmState::Imaging;
        }
    }

    fn begin_flats(&mut self, ts: DateTime<Utc>, filter: Option<String>) {
        if self.doc.fsm_state == FsmState::Flats {
            return;
        }
        self.resume_to = match self.doc.fsm_state {
            FsmState::Imaging | FsmState::Paused => Some(FsmState::Imaging),
            _ => None,
        };
        if self.doc.fsm_state == FsmState::Idle {
            self.start_session(ts);
        }
        self.doc.fsm_state = FsmState::Flats;
        self.doc.darks.is_active = false;
        self.doc.flats = FlatsInfo {
            is_active: true,
            filter: filter.or_else(|| self.doc.filter.as_ref().map(|f| f.name.clone())),
            brightness: None,
            image_count: 0,
            started_at: Some(ts),
            last_image_at: None,
        };
    }

    fn on_flat_panel_connected(&mut self, ts: DateTime<Utc>) {
        self.doc.last_equipment_change = Some(EquipmentChange {
            device: "FLAT".to_string(),
            event: "CONNECTED".to_string(),
            time: ts,
        });
        if matches!(self.doc.fsm_state, FsmState::Idle | FsmState::Imaging) {
            self.begin_flats(ts, None);
        }
    }

    fn on_flat_panel_disconnected(&mut self, ts: DateTime<Utc>) {
        self.doc.last_equipment_change = Some(EquipmentChange {
            device: "FLAT".to_string(),
            event: "DISCONNECTED".to_string(),
            time: ts,
        });
        if self.doc.fsm_state != FsmState::Flats {
            return;
        }
        self.doc.flats.is_active = false;
        match self.resume_to.take() {
            Some(prior) if self.doc.session_start.is_some() => {
                self.doc.fsm_state = prior;
            }
            _ => self.end_session(),
        }
    }

    fn on_equipment(&mut self, device: &str, kind: &str, ts: DateTime<Utc>) {
        self.doc.last_equipment_change = Some(EquipmentChange {
            device: device.to_string(),
            event: kind.to_string(),
            time: ts,
        });
        // Re-established equipment while paused is treated as a resume. The
        // safety monitor itself is exempt: only SAFETY-CHANGED clears a
        // safety pause.
        if kind == "CONNECTED" && device != "SAFETY" && self.doc.fsm_state == FsmState::Paused {
            self.doc.fsm_state = FsmState::Imaging;
        }
    }

    fn track_subsystem(&mut self, subsystem: Subsystem, state: &str, active: bool, ts: DateTime<Utc>) {
        self.subsystems.insert(
            subsystem,
            SubsystemTrack {
                active,
                state: state.to_string(),
                since: ts,
            },
        );
    }

    /// Recomputes the activity projection and `isGuiding` from the
    /// subsystem tracks and the FSM state.
    fn refresh_projections(&mut self) {
        self.doc.is_guiding = self
            .subsystems
            .get(&Subsystem::Guiding)
            .map(|t| t.active)
            .unwrap_or(false);

        let winner = SUBSYSTEM_PRIORITY
            .iter()
            .filter_map(|s| self.subsystems.get(s).map(|t| (*s, t)))
            .find(|(_, t)| t.active);

        self.doc.activity = match winner {
            Some((subsystem, track)) => ActivityInfo {
                subsystem,
                state: track.state.clone(),
                since: Some(track.since),
            },
            None => match self.doc.fsm_state {
                FsmState::Flats => ActivityInfo {
                    subsystem: Subsystem::Flats,
                    state: "active".to_string(),
                    since: self.doc.flats.started_at,
                },
                FsmState::Darks => ActivityInfo {
                    subsystem: Subsystem::Darks,
                    state: "active".to_string(),
                    since: self.doc.darks.started_at,
                },
                _ => ActivityInfo::default(),
            },
        };
    }
}

/// Maps subsystem lifecycle events to (subsystem, state, active).
fn activity_event(event_type: &str) -> Option<(Subsystem, &'static str, bool)> {
    match event_type {
        "AUTOFOCUS-START" => Some((Subsystem::Autofocus, "running", true)),
        "AUTOFOCUS-FINISHED" | "AUTOFOCUS-FAILED" => Some((Subsystem::Autofocus, "idle", false)),
        "GUIDER-START" => Some((Subsystem::Guiding, "guiding", true)),
        "GUIDER-STOP" | "GUIDER-DISCONNECTED" => Some((Subsystem::Guiding, "stopped", false)),
        "MOUNT-SLEWING" => Some((Subsystem::Mount, "slewing", true)),
        "MOUNT-TRACKING" | "MOUNT-PARKED" | "MOUNT-HOMED" => Some((Subsystem::Mount, "idle", false)),
        "ROTATOR-MOVING" => Some((Subsystem::Rotator, "moving", true)),
        "ROTATOR-SYNCED" | "ROTATOR-STOPPED" => Some((Subsystem::Rotator, "idle", false)),
        _ => None,
    }
}

/// Splits `<DEVICE>-CONNECTED` / `<DEVICE>-DISCONNECTED` event names.
/// `FLAT-*` is handled separately by the flats logic.
fn equipment_event(event_type: &str) -> Option<(&str, &'static str)> {
    if let Some(device) = event_type.strip_suffix("-DISCONNECTED") {
        return Some((device, "DISCONNECTED"));
    }
    if let Some(device) = event_type.strip_suffix("-CONNECTED") {
        return Some((device, "CONNECTED"));
    }
    None
}

fn parse_coordinates(payload: &Value) -> Option<Coordinates> {
    let coords = payload.get("Coordinates")?;
    Some(Coordinates {
        ra: coords
            .get("RAString")
            .and_then(Value::as_str)
            .map(str::to_string),
        dec: coords
            .get("DecString")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Renders an exposure time as a stable map key: integral seconds without a
/// decimal point, fractional ones as given.
fn format_exposure(exposure: Option<f64>) -> String {
    match exposure {
        Some(e) if e.fract() == 0.0 => format!("{}", e as i64),
        Some(e) => format!("{e}"),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(event_type: &str, time: &str, payload: Value) -> NormalizedEvent {
        let mut body = payload;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("Event".to_string(), json!(event_type));
            obj.insert("Time".to_string(), json!(time));
        }
        NormalizedEvent {
            event_type: event_type.to_string(),
            timestamp: DateTime::parse_from_rfc3339(time)
                .unwrap()
                .with_timezone(&Utc),
            enriched: body.clone(),
            payload: body,
            session_uuid: SESSION_CURRENT.to_string(),
        }
    }

    fn fsm() -> SessionFsm {
        SessionFsm::new(
            DateTime::parse_from_rfc3339("2024-01-15T19:00:00-05:00")
                .unwrap()
                .with_timezone(&Utc),
        )
    }

    fn started_fsm() -> SessionFsm {
        let mut f = fsm();
        assert!(f.apply(&ev(
            "SEQUENCE-STARTING",
            "2024-01-15T20:00:00-05:00",
            json!({})
        )));
        assert!(f.apply(&ev(
            "TS-NEWTARGETSTART",
            "2024-01-15T20:01:00-05:00",
            json!({
                "TargetName": "M31",
                "ProjectName": "DSO",
                "Coordinates": { "RAString": "00:42:44.31", "DecString": "+41:16:09.4" },
                "Rotation": 180
            })
        )));
        f
    }

    #[test]
    fn fresh_session_start() {
        let f = started_fsm();
        let doc = f.document();

        assert!(doc.is_active);
        assert_eq!(doc.fsm_state, FsmState::Imaging);
        let target = doc.target.as_ref().unwrap();
        assert_eq!(target.name, "M31");
        assert_eq!(target.project.as_deref(), Some("DSO"));
        assert_eq!(
            target.coordinates.as_ref().unwrap().ra.as_deref(),
            Some("00:42:44.31")
        );
        assert_eq!(target.rotation, Some(180.0));
        // 20:00 -05:00 in UTC form.
        assert_eq!(
            doc.session_start.unwrap().to_rfc3339(),
            "2024-01-16T01:00:00+00:00"
        );
        assert_eq!(
            doc.session_uuid,
            format!("session_{}", doc.session_start.unwrap().timestamp_millis())
        );
    }

    #[test]
    fn filter_change_then_image() {
        let mut f = started_fsm();
        assert!(f.apply(&ev(
            "FILTERWHEEL-CHANGED",
            "2024-01-15T20:02:00-05:00",
            json!({ "Previous": { "Name": "L" }, "New": { "Name": "Ha" } })
        )));
        assert!(f.apply(&ev(
            "IMAGE-SAVE",
            "2024-01-15T20:10:00-05:00",
            json!({ "ImageStatistics": { "ImageType": "LIGHT", "Filter": "Ha", "ExposureTime": 300 } })
        )));

        let doc = f.document();
        assert_eq!(doc.filter.as_ref().unwrap().name, "Ha");
        let image = doc.last_image.as_ref().unwrap();
        assert_eq!(image.image_type, ImageType::Light);
        assert_eq!(image.exposure_time, Some(300.0));
    }

    #[test]
    fn noop_filter_change_reports_unchanged() {
        let mut f = started_fsm();
        assert!(f.apply(&ev(
            "FILTERWHEEL-CHANGED",
            "2024-01-15T20:02:00-05:00",
            json!({ "Previous": { "Name": "L" }, "New": { "Name": "Ha" } })
        )));
        let last_update = f.document().last_update;

        // Same-name change must not toggle `changed` nor move lastUpdate.
        assert!(!f.apply(&ev(
            "FILTERWHEEL-CHANGED",
            "2024-01-15T20:15:00-05:00",
            json!({ "Previous": { "Name": "Ha" }, "New": { "Name": "Ha" } })
        )));
        assert_eq!(f.document().last_update, last_update);
    }

    #[test]
    fn safety_pause_and_resume() {
        let mut f = started_fsm();
        assert!(f.apply(&ev(
            "SAFETY-CHANGED",
            "2024-01-15T21:00:00-05:00",
            json!({ "IsSafe": false })
        )));
        assert_eq!(f.document().fsm_state, FsmState::Paused);
        assert_eq!(f.document().safety.is_safe, Some(false));
        assert!(f.document().is_active);

        // SAFETY-CONNECTED must not alter the safety value nor resume.
        f.apply(&ev("SAFETY-CONNECTED", "2024-01-15T21:00:30-05:00", json!({})));
        assert_eq!(f.document().safety.is_safe, Some(false));
        assert_eq!(f.document().fsm_state, FsmState::Paused);

        assert!(f.apply(&ev(
            "SAFETY-CHANGED",
            "2024-01-15T21:01:00-05:00",
            json!({ "IsSafe": true })
        )));
        assert_eq!(f.document().fsm_state, FsmState::Imaging);
        assert_eq!(f.document().safety.is_safe, Some(true));
    }

    #[test]
    fn equipment_reconnect_resumes_paused_session() {
        let mut f = started_fsm();
        f.apply(&ev(
            "SAFETY-CHANGED",
            "2024-01-15T21:00:00-05:00",
            json!({ "IsSafe": false })
        ));
        assert_eq!(f.document().fsm_state, FsmState::Paused);

        f.apply(&ev("CAMERA-CONNECTED", "2024-01-15T21:05:00-05:00", json!({})));
        assert_eq!(f.document().fsm_state, FsmState::Imaging);
        let change = f.document().last_equipment_change.as_ref().unwrap();
        assert_eq!(change.device, "CAMERA");
        assert_eq!(change.event, "CONNECTED");
    }

    #[test]
    fn darks_grouped_by_exposure() {
        let mut f = fsm();
        for (minute, exposure) in [(0, 60), (5, 60), (10, 300)] {
            f.apply(&ev(
                "IMAGE-SAVE",
                &format!("2024-01-15T22:{minute:02}:00-05:00"),
                json!({ "ImageStatistics": { "ImageType": "DARK", "ExposureTime": exposure } }),
            ));
        }

        let doc = f.document();
        assert_eq!(doc.fsm_state, FsmState::Darks);
        assert!(doc.darks.is_active);
        assert_eq!(doc.darks.total_images, 3);
        assert_eq!(doc.darks.exposure_groups.get("60"), Some(&2));
        assert_eq!(doc.darks.exposure_groups.get("300"), Some(&1));
        assert_eq!(doc.darks.current_exposure_time, Some(300.0));
        assert_eq!(doc.activity.subsystem, Subsystem::Darks);
    }

    #[test]
    fn sequence_stop_ends_darks() {
        let mut f = fsm();
        f.apply(&ev(
            "IMAGE-SAVE",
            "2024-01-15T22:00:00-05:00",
            json!({ "ImageStatistics": { "ImageType": "DARK", "ExposureTime": 60 } }),
        ));
        assert_eq!(f.document().fsm_state, FsmState::Darks);

        f.apply(&ev("SEQUENCE-STOPPED", "2024-01-15T22:30:00-05:00", json!({})));
        let doc = f.document();
        assert_eq!(doc.fsm_state, FsmState::Idle);
        assert!(!doc.is_active);
        assert!(!doc.darks.is_active);
    }

    #[test]
    fn target_start_during_darks_finishes_darks_first() {
        let mut f = fsm();
        f.apply(&ev(
            "IMAGE-SAVE",
            "2024-01-15T22:00:00-05:00",
            json!({ "ImageStatistics": { "ImageType": "DARK", "ExposureTime": 60 } }),
        ));
        let darks_uuid = f.document().session_uuid.clone();

        f.apply(&ev(
            "TS-TARGETSTART",
            "2024-01-15T23:00:00-05:00",
            json!({ "TargetName": "NGC 7000" }),
        ));
        let doc = f.document();
        assert_eq!(doc.fsm_state, FsmState::Imaging);
        assert!(!doc.darks.is_active);
        assert_eq!(doc.darks.total_images, 0);
        assert_eq!(doc.target.as_ref().unwrap().name, "NGC 7000");
        assert_ne!(doc.session_uuid, darks_uuid);
    }

    #[test]
    fn new_target_rolls_the_session() {
        let mut f = started_fsm();
        let first_uuid = f.document().session_uuid.clone();

        assert!(f.apply(&ev(
            "TS-TARGETSTART",
            "2024-01-16T01:00:00-05:00",
            json!({ "TargetName": "M33" })
        )));
        let doc = f.document();
        assert!(doc.is_active);
        assert_eq!(doc.target.as_ref().unwrap().name, "M33");
        assert_ne!(doc.session_uuid, first_uuid);
        assert_eq!(
            doc.session_start.unwrap().to_rfc3339(),
            "2024-01-16T06:00:00+00:00"
        );
    }

    #[test]
    fn flats_interruption_returns_to_imaging() {
        let mut f = started_fsm();
        f.apply(&ev("FLAT-CONNECTED", "2024-01-15T20:30:00-05:00", json!({})));
        assert_eq!(f.document().fsm_state, FsmState::Flats);
        assert!(f.document().flats.is_active);

        f.apply(&ev(
            "IMAGE-SAVE",
            "2024-01-15T20:31:00-05:00",
            json!({ "ImageStatistics": { "ImageType": "FLAT", "Brightness": 42.0 } }),
        ));
        assert_eq!(f.document().flats.image_count, 1);
        assert_eq!(f.document().flats.brightness, Some(42.0));

        f.apply(&ev("FLAT-DISCONNECTED", "2024-01-15T20:40:00-05:00", json!({})));
        let doc = f.document();
        assert_eq!(doc.fsm_state, FsmState::Imaging);
        assert!(!doc.flats.is_active);
        assert!(doc.is_active);
        assert_eq!(doc.target.as_ref().unwrap().name, "M31");
    }

    #[test]
    fn flats_only_session_ends_on_panel_disconnect() {
        let mut f = fsm();
        f.apply(&ev("FLAT-CONNECTED", "2024-01-15T18:00:00-05:00", json!({})));
        assert_eq!(f.document().fsm_state, FsmState::Flats);
        assert!(f.document().is_active);
        assert_eq!(f.document().activity.subsystem, Subsystem::Flats);

        f.apply(&ev("FLAT-DISCONNECTED", "2024-01-15T18:20:00-05:00", json!({})));
        assert_eq!(f.document().fsm_state, FsmState::Idle);
        assert!(!f.document().is_active);
    }

    #[test]
    fn activity_priority_order_holds() {
        let mut f = started_fsm();
        f.apply(&ev("GUIDER-START", "2024-01-15T20:05:00-05:00", json!({})));
        assert_eq!(f.document().activity.subsystem, Subsystem::Guiding);
        assert!(f.document().is_guiding);

        // Autofocus outranks guiding while both are active.
        f.apply(&ev("AUTOFOCUS-START", "2024-01-15T20:06:00-05:00", json!({})));
        assert_eq!(f.document().activity.subsystem, Subsystem::Autofocus);
        assert!(f.document().is_guiding);

        f.apply(&ev("AUTOFOCUS-FINISHED", "2024-01-15T20:08:00-05:00", json!({})));
        assert_eq!(f.document().activity.subsystem, Subsystem::Guiding);

        f.apply(&ev("GUIDER-STOP", "2024-01-15T20:09:00-05:00", json!({})));
        assert_eq!(f.document().activity.subsystem, Subsystem::Sequencer);
        assert!(!f.document().is_guiding);
    }

    #[test]
    fn light_frame_infers_filter_without_wheel_event() {
        let mut f = started_fsm();
        f.apply(&ev(
            "IMAGE-SAVE",
            "2024-01-15T20:10:00-05:00",
            json!({ "ImageStatistics": { "ImageType": "LIGHT", "Filter": "OIII" } }),
        ));
        assert_eq!(f.document().filter.as_ref().unwrap().name, "OIII");
    }

    #[test]
    fn scheduled_end_marks_expired_without_ending_session() {
        let mut f = fsm();
        let mut start = ev(
            "TS-TARGETSTART",
            "2024-01-15T20:00:00-05:00",
            json!({ "TargetName": "M31" }),
        );
        start
            .enriched
            .as_object_mut()
            .unwrap()
            .insert("scheduledEndUtc".to_string(), json!("2024-01-16T02:00:00+00:00"));
        f.apply(&start);

        let now = DateTime::parse_from_rfc3339("2024-01-16T03:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        assert!(f.apply_clock(now));

        let doc = f.document();
        assert!(doc.target.as_ref().unwrap().is_expired);
        assert!(doc.is_active);
        assert_eq!(doc.fsm_state, FsmState::Imaging);
    }

    #[test]
    fn inactivity_fallback_expires_and_ends_session() {
        let mut f = started_fsm();
        f.apply(&ev(
            "IMAGE-SAVE",
            "2024-01-15T20:10:00-05:00",
            json!({ "ImageStatistics": { "ImageType": "LIGHT" } }),
        ));

        // Seven hours of silence: nothing happens.
        let seven = DateTime::parse_from_rfc3339("2024-01-16T08:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        assert!(!f.apply_clock(seven));

        // Past eight hours the target expires and the session winds down.
        let nine = DateTime::parse_from_rfc3339("2024-01-16T10:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        assert!(f.apply_clock(nine));
        let doc = f.document();
        assert!(!doc.is_active);
        assert_eq!(doc.fsm_state, FsmState::Idle);
    }

    #[test]
    fn session_end_retains_hardware_state() {
        let mut f = started_fsm();
        f.apply(&ev(
            "FILTERWHEEL-CHANGED",
            "2024-01-15T20:02:00-05:00",
            json!({ "Previous": { "Name": "L" }, "New": { "Name": "Ha" } }),
        ));
        f.apply(&ev(
            "SAFETY-CHANGED",
            "2024-01-15T20:03:00-05:00",
            json!({ "IsSafe": true }),
        ));
        f.apply(&ev("TS-TARGETEND", "2024-01-16T04:00:00-05:00", json!({})));

        let doc = f.document();
        assert_eq!(doc.fsm_state, FsmState::Idle);
        assert!(!doc.is_active);
        assert_eq!(doc.session_uuid, SESSION_CURRENT);
        assert!(doc.target.is_none());
        // Filter and safety reflect hardware, not the session.
        assert_eq!(doc.filter.as_ref().unwrap().name, "Ha");
        assert_eq!(doc.safety.is_safe, Some(true));
    }

    #[test]
    fn seeder_fallback_synthesizes_session() {
        let mut f = fsm();
        let since = DateTime::parse_from_rfc3339("2024-01-16T01:10:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        assert!(f.assume_active_imaging(since));

        let doc = f.document();
        assert!(doc.is_active);
        assert_eq!(doc.fsm_state, FsmState::Imaging);
        assert_eq!(doc.session_start, Some(since));
    }

    #[test]
    fn exposure_keys_render_stably() {
        assert_eq!(format_exposure(Some(60.0)), "60");
        assert_eq!(format_exposure(Some(300.0)), "300");
        assert_eq!(format_exposure(Some(0.5)), "0.5");
        assert_eq!(format_exposure(None), "unknown");
    }
}
