//! Event normalizer: flattens the two frame shapes the imaging host emits,
//! resolves timestamps to UTC, drops noise and short-window duplicates, and
//! enriches payloads from a small rolling context.
//!
//! The normalizer is a pure transform owned by the engine task; its dedupe
//! map and rolling context are never shared.

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use crate::gateway_logic::model::{ImageType, NormalizedEvent, SESSION_CURRENT};

/// Duplicate suppression window.
const DEDUPE_WINDOW_MS: u128 = 1_000;
/// Entries older than this are pruned from the dedupe map on every insert.
const DEDUPE_PRUNE_CUTOFF_SECS: u64 = 300;
/// Events accepted even when their timestamp lies this far in the past.
const MAX_EVENT_AGE_HOURS: i64 = 24;

/// Event types that carry no session information.
const NOISE_EVENTS: &[&str] = &["HEARTBEAT", "PING", "PONG", "KEEPALIVE", "SOCKET-HEARTBEAT"];

/// Payload keys that may carry a target's scheduled end.
const TARGET_END_KEYS: &[&str] = &["TargetEndTime", "EndTime", "ScheduledEndTime"];

/// Outcome of normalizing one raw frame, so the caller can count drops per
/// class.
#[derive(Debug)]
pub enum NormalizeOutcome {
    Event(Box<NormalizedEvent>),
    Duplicate,
    Noise,
    Malformed,
}

/// An upstream timestamp before disambiguation. Offset-less strings must be
/// resolved against the configured host offset before they become a UTC
/// instant; there is no implicit coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum RawTimestamp {
    Zoned(DateTime<FixedOffset>),
    Naive(NaiveDateTime),
}

impl RawTimestamp {
    /// Parses a timestamp string, preserving whether it carried an offset.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(RawTimestamp::Zoned(dt));
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Some(RawTimestamp::Naive(naive));
            }
        }
        None
    }

    /// Resolves to UTC, interpreting naive timestamps in the host's
    /// configured local offset.
    pub fn into_utc(self, host_offset: FixedOffset) -> Option<DateTime<Utc>> {
        match self {
            RawTimestamp::Zoned(dt) => Some(dt.with_timezone(&Utc)),
            RawTimestamp::Naive(naive) => naive
                .and_local_timezone(host_offset)
                .single()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

/// Parses an offset string like "-05:00", "+02:00" or "Z".
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match raw.split_at_checked(1)? {
        ("-", rest) => (-1i32, rest),
        ("+", rest) => (1i32, rest),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Rolling context threaded through the event stream, used to fill fields
/// the host omits from individual events.
#[derive(Debug, Default)]
struct RollingContext {
    current_filter: Option<String>,
    current_target: Option<Value>,
    flat_panel_active: bool,
    last_image_statistics: Option<Value>,
}

pub struct Normalizer {
    host_offset: FixedOffset,
    dedupe: HashMap<String, Instant>,
    context: RollingContext,
}

impl Normalizer {
    pub fn new(host_offset: FixedOffset) -> Self {
        Self {
            host_offset,
            dedupe: HashMap::new(),
            context: RollingContext::default(),
        }
    }

    /// Normalizes one raw frame. Accepts the live socket shape
    /// `{ "Response": { "Event": ... }, "Type": "Socket" }` and the
    /// historical shape `{ "Event": ..., "Time": ... }`.
    pub fn normalize(&mut self, raw: &Value) -> NormalizeOutcome {
        let inner = match extract_inner(raw) {
            Some(inner) => inner,
            None => {
                // Subscription acks and other non-event frames.
                if raw.get("Response").is_some() {
                    return NormalizeOutcome::Noise;
                }
                log::debug!("Dropping frame with no event shape: {}", raw);
                return NormalizeOutcome::Malformed;
            }
        };

        let event_type = match inner.get("Event").and_then(Value::as_str) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => {
                log::debug!("Dropping frame without event type");
                return NormalizeOutcome::Malformed;
            }
        };

        if NOISE_EVENTS
            .iter()
            .any(|n| n.eq_ignore_ascii_case(&event_type))
        {
            return NormalizeOutcome::Noise;
        }

        let timestamp = match inner.get("Time").and_then(Value::as_str) {
            Some(raw_ts) => match RawTimestamp::parse(raw_ts)
                .and_then(|ts| ts.into_utc(self.host_offset))
            {
                Some(ts) => ts,
                None => {
                    log::warn!("Dropping {} with unparseable timestamp '{}'", event_type, raw_ts);
                    return NormalizeOutcome::Malformed;
                }
            },
            // Live frames occasionally omit Time; stamp them on arrival.
            None => Utc::now(),
        };

        if Utc::now() - timestamp > ChronoDuration::hours(MAX_EVENT_AGE_HOURS) {
            log::debug!("Dropping stale {} from {}", event_type, timestamp);
            return NormalizeOutcome::Malformed;
        }

        let payload = inner.clone();

        if is_noop_filter_change(&event_type, &payload) {
            return NormalizeOutcome::Noise;
        }

        if self.is_duplicate(&event_type, timestamp, &payload) {
            log::debug!("Dropping duplicate {} at {}", event_type, timestamp);
            return NormalizeOutcome::Duplicate;
        }

        self.update_context(&event_type, &payload);
        let enriched = self.enrich(&event_type, &payload);

        NormalizeOutcome::Event(Box::new(NormalizedEvent {
            event_type,
            timestamp,
            payload,
            enriched,
            session_uuid: SESSION_CURRENT.to_string(),
        }))
    }

    /// Duplicate check keyed by event type, second bucket and payload hash.
    fn is_duplicate(&mut self, event_type: &str, timestamp: DateTime<Utc>, payload: &Value) -> bool {
        let mut hasher = DefaultHasher::new();
        payload.to_string().hash(&mut hasher);
        let key = format!("{}|{}|{:016x}", event_type, timestamp.timestamp(), hasher.finish());

        let now = Instant::now();
        self.dedupe
            .retain(|_, seen| now.duration_since(*seen).as_secs() < DEDUPE_PRUNE_CUTOFF_SECS);

        if let Some(seen) = self.dedupe.get(&key) {
            if now.duration_since(*seen).as_millis() < DEDUPE_WINDOW_MS {
                return true;
            }
        }
        self.dedupe.insert(key, now);
        false
    }

    fn update_context(&mut self, event_type: &str, payload: &Value) {
        match event_type {
            "FILTERWHEEL-CHANGED" => {
                if let Some(name) = payload
                    .pointer("/New/Name")
                    .and_then(Value::as_str)
                {
                    self.context.current_filter = Some(name.to_string());
                }
            }
            "TS-TARGETSTART" | "TS-NEWTARGETSTART" => {
                self.context.current_target = Some(payload.clone());
            }
            "FLAT-CONNECTED" => self.context.flat_panel_active = true,
            "FLAT-DISCONNECTED" => self.context.flat_panel_active = false,
            "IMAGE-SAVE" => {
                if let Some(stats) = payload.get("ImageStatistics") {
                    let is_light = stats
                        .get("ImageType")
                        .and_then(Value::as_str)
                        .map(|t| ImageType::parse(t) == ImageType::Light)
                        .unwrap_or(false);
                    if is_light {
                        if let Some(filter) = stats.get("Filter").and_then(Value::as_str) {
                            self.context.current_filter = Some(filter.to_string());
                        }
                    }
                    self.context.last_image_statistics = Some(stats.clone());
                }
            }
            _ => {}
        }
    }

    /// Produces the enriched payload: the original fields plus the rolling
    /// context, with gaps in `IMAGE-SAVE` statistics filled in.
    fn enrich(&self, event_type: &str, payload: &Value) -> Value {
        let mut enriched = match payload.as_object() {
            Some(map) => map.clone(),
            None => Map::new(),
        };

        if let Some(filter) = &self.context.current_filter {
            enriched.insert("currentFilter".to_string(), Value::String(filter.clone()));
        }
        if let Some(target) = &self.context.current_target {
            if let Some(name) = target.get("TargetName").cloned() {
                enriched.insert("currentTarget".to_string(), name);
            }
        }
        enriched.insert(
            "flatPanelActive".to_string(),
            Value::Bool(self.context.flat_panel_active),
        );
        if let Some(stats) = &self.context.last_image_statistics {
            enriched.insert("lastImageStatistics".to_string(), stats.clone());
        }

        if event_type == "IMAGE-SAVE" {
            if let Some(Value::Object(stats)) = enriched.get_mut("ImageStatistics") {
                if !stats.contains_key("Filter") {
                    if let Some(filter) = &self.context.current_filter {
                        stats.insert("Filter".to_string(), Value::String(filter.clone()));
                    }
                }
            }
        }

        if matches!(event_type, "TS-TARGETSTART" | "TS-NEWTARGETSTART") {
            let scheduled_end = TARGET_END_KEYS
                .iter()
                .filter_map(|key| payload.get(*key).and_then(Value::as_str))
                .filter_map(|raw| RawTimestamp::parse(raw).and_then(|ts| ts.into_utc(self.host_offset)))
                .next();
            if let Some(end) = scheduled_end {
                enriched.insert(
                    "scheduledEndUtc".to_string(),
                    Value::String(end.to_rfc3339()),
                );
            }
        }

        Value::Object(enriched)
    }
}

fn extract_inner(raw: &Value) -> Option<&Value> {
    // Live shape: the event sits inside a Response wrapper.
    if let Some(inner) = raw.get("Response") {
        if inner.is_object() && inner.get("Event").is_some() {
            return Some(inner);
        }
        return None;
    }
    // Historical shape: the event is the frame itself.
    if raw.get("Event").is_some() {
        return Some(raw);
    }
    None
}

fn is_noop_filter_change(event_type: &str, payload: &Value) -> bool {
    if event_type != "FILTERWHEEL-CHANGED" {
        return false;
    }
    let previous = payload.pointer("/Previous/Name").and_then(Value::as_str);
    let new = payload.pointer("/New/Name").and_then(Value::as_str);
    matches!((previous, new), (Some(p), Some(n)) if p == n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offset() -> FixedOffset {
        parse_utc_offset("-05:00").unwrap()
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(offset())
    }

    fn recent_naive() -> String {
        (Utc::now().with_timezone(&offset()) - ChronoDuration::minutes(5))
            .naive_local()
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string()
    }

    fn expect_event(outcome: NormalizeOutcome) -> NormalizedEvent {
        match outcome {
            NormalizeOutcome::Event(ev) => *ev,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn parses_offset_strings() {
        assert_eq!(parse_utc_offset("-05:00"), FixedOffset::west_opt(5 * 3600));
        assert_eq!(parse_utc_offset("+02:30"), FixedOffset::east_opt(2 * 3600 + 1800));
        assert_eq!(parse_utc_offset("Z"), FixedOffset::east_opt(0));
        assert_eq!(parse_utc_offset("05:00"), None);
        assert_eq!(parse_utc_offset("-25:00"), None);
    }

    #[test]
    fn explicit_offset_passes_through() {
        let raw = RawTimestamp::parse("2024-01-15T20:00:00-05:00").unwrap();
        let utc = raw.into_utc(parse_utc_offset("+09:00").unwrap()).unwrap();
        assert_eq!(utc.to_rfc3339(), "2024-01-16T01:00:00+00:00");
    }

    #[test]
    fn naive_timestamp_uses_configured_offset() {
        let raw = RawTimestamp::parse("2024-01-15T20:00:00").unwrap();
        let utc = raw.into_utc(offset()).unwrap();
        assert_eq!(utc.to_rfc3339(), "2024-01-16T01:00:00+00:00");
    }

    #[test]
    fn live_and_historical_shapes_normalize_identically() {
        let mut n = normalizer();
        let time = recent_naive();

        let historical = json!({ "Event": "SEQUENCE-STARTING", "Time": time });
        let live = json!({
            "Type": "Socket",
            "Response": { "Event": "SEQUENCE-STARTING", "Time": time }
        });

        let a = expect_event(n.normalize(&historical));
        // Second copy within the window is a duplicate of the first.
        assert!(matches!(n.normalize(&live), NormalizeOutcome::Duplicate));
        assert_eq!(a.event_type, "SEQUENCE-STARTING");
    }

    #[test]
    fn duplicate_within_window_is_dropped_once() {
        let mut n = normalizer();
        let frame = json!({ "Event": "IMAGE-SAVE", "Time": recent_naive() });

        assert!(matches!(n.normalize(&frame), NormalizeOutcome::Event(_)));
        assert!(matches!(n.normalize(&frame), NormalizeOutcome::Duplicate));
    }

    #[test]
    fn noise_events_are_dropped() {
        let mut n = normalizer();
        let frame = json!({ "Event": "HEARTBEAT", "Time": recent_naive() });
        assert!(matches!(n.normalize(&frame), NormalizeOutcome::Noise));

        let ack = json!({ "Response": "Subscribed", "Type": "Socket" });
        assert!(matches!(n.normalize(&ack), NormalizeOutcome::Noise));
    }

    #[test]
    fn noop_filter_change_is_dropped() {
        let mut n = normalizer();
        let frame = json!({
            "Event": "FILTERWHEEL-CHANGED",
            "Time": recent_naive(),
            "Previous": { "Name": "Ha" },
            "New": { "Name": "Ha" }
        });
        assert!(matches!(n.normalize(&frame), NormalizeOutcome::Noise));
    }

    #[test]
    fn unparseable_timestamp_is_malformed() {
        let mut n = normalizer();
        let frame = json!({ "Event": "IMAGE-SAVE", "Time": "yesterday evening" });
        assert!(matches!(n.normalize(&frame), NormalizeOutcome::Malformed));
    }

    #[test]
    fn image_save_filter_filled_from_context() {
        let mut n = normalizer();
        let change = json!({
            "Event": "FILTERWHEEL-CHANGED",
            "Time": recent_naive(),
            "Previous": { "Name": "L" },
            "New": { "Name": "OIII" }
        });
        expect_event(n.normalize(&change));

        let image = json!({
            "Event": "IMAGE-SAVE",
            "Time": recent_naive(),
            "ImageStatistics": { "ImageType": "LIGHT", "ExposureTime": 120 }
        });
        let ev = expect_event(n.normalize(&image));
        assert_eq!(
            ev.enriched.pointer("/ImageStatistics/Filter"),
            Some(&Value::String("OIII".to_string()))
        );
        assert_eq!(
            ev.enriched.get("currentFilter"),
            Some(&Value::String("OIII".to_string()))
        );
    }

    #[test]
    fn target_start_enriched_with_scheduled_end() {
        let mut n = normalizer();
        let frame = json!({
            "Event": "TS-TARGETSTART",
            "Time": recent_naive(),
            "TargetName": "M31",
            "TargetEndTime": "2024-01-16T04:00:00-05:00"
        });
        // Stale-event cutoff applies to Time, not the end time; use a recent
        // Time and check the end conversion.
        let ev = expect_event(n.normalize(&frame));
        assert_eq!(
            ev.enriched.get("scheduledEndUtc"),
            Some(&Value::String("2024-01-16T09:00:00+00:00".to_string()))
        );
    }
}
