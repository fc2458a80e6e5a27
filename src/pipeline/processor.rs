//! Message decoding and aggregation
//!
//! `Processor::parse` turns a `RawMessage` into a `ParsedEvent` (timings,
//! tags, apdex class, time bucket). `fold` merges an event into an
//! `Aggregate`. Both are pure with respect to shared state: the processor
//! only reads its settings and the injected clock.
//!
//! Payload (JSON object):
//! - `action` (string, required; frontend events may use `page` instead)
//! - `started_ms` (number) or `started_at` (RFC 3339 string), required
//! - timing fields in milliseconds, see `TimingMetric`; the apdex attribute is required
//! - tags: `code`, `method`, `severity`, `host`, `cluster`, `datacenter`,
//!   `caller_id`, `caller_action`
//! - `path` or `request_info.url` for ignored-request filtering
//!
//! Backend requests to a stream's api modules that arrive without caller
//! information are tagged `unknown-<env>-unknown` / `Unknown#unknown`.

use super::config::ImporterConfig;
use super::streams::{RequestFilter, StreamConfig, TimingMetric};
use super::types::{
    is_reserved_action, module_of, Aggregate, ApdexClass, Clock, EventKind, ParsedEvent, RawMessage,
};
use chrono::DateTime;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

const TAG_FIELDS: [&str; 8] = [
    "code",
    "method",
    "severity",
    "host",
    "cluster",
    "datacenter",
    "caller_id",
    "caller_action",
];

const UNKNOWN_CALLER_ACTION: &str = "Unknown#unknown";

/// Largest accepted timing; keeps sums of squares finite across any realistic count
pub const MAX_TIMING_MS: f64 = 1e12;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Timestamp {timestamp_ms} too far from clock {now_ms}")]
    ClockSkew { timestamp_ms: i64, now_ms: i64 },

    #[error("Ignored request: {0}")]
    IgnoredRequest(String),

    #[error("Frontend timing for backend only request: {0}")]
    BackendOnlyRequest(String),
}

#[derive(Debug, Clone)]
pub struct Processor {
    bucket_width_ms: i64,
    max_clock_skew_ms: i64,
    default_apdex_target_ms: f64,
    clock: Clock,
}

impl Processor {
    pub fn new(
        bucket_width_ms: i64,
        max_clock_skew_ms: i64,
        default_apdex_target_ms: f64,
        clock: Clock,
    ) -> Self {
        Self {
            bucket_width_ms: bucket_width_ms.max(1),
            max_clock_skew_ms,
            default_apdex_target_ms,
            clock,
        }
    }

    pub fn from_config(config: &ImporterConfig, clock: Clock) -> Self {
        Self::new(
            config.bucket_width_ms(),
            config.max_clock_skew_ms(),
            config.apdex_target_ms,
            clock,
        )
    }

    pub fn bucket_width_ms(&self) -> i64 {
        self.bucket_width_ms
    }

    /// Start of the bucket containing `timestamp_ms`
    pub fn bucket_start(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms - timestamp_ms.rem_euclid(self.bucket_width_ms)
    }

    /// Decode `raw` for `stream`, classifying apdex on `apdex_attribute`
    pub fn parse(
        &self,
        raw: &RawMessage,
        kind: EventKind,
        stream: &StreamConfig,
        apdex_attribute: TimingMetric,
    ) -> Result<ParsedEvent, ParseError> {
        let value: Value = serde_json::from_slice(&raw.payload)?;
        let obj = value.as_object().ok_or(ParseError::NotAnObject)?;

        if let (Some(prefix), Some(path)) = (&stream.ignored_request_prefix, request_path(obj)) {
            if path.starts_with(prefix.as_str()) {
                return Err(ParseError::IgnoredRequest(path.to_string()));
            }
        }

        let action = action_name(obj, kind)?;
        if kind.is_frontend() && stream.backend_only.matches_prefix(&action) {
            return Err(ParseError::BackendOnlyRequest(action));
        }

        let timestamp_ms = timestamp_ms(obj)?;
        let now_ms = self.clock.now_ms();
        if timestamp_ms.abs_diff(now_ms) > self.max_clock_skew_ms.unsigned_abs() {
            return Err(ParseError::ClockSkew {
                timestamp_ms,
                now_ms,
            });
        }

        let mut timings = BTreeMap::new();
        for metric in TimingMetric::ALL {
            let name = metric.as_str();
            let Some(field) = obj.get(name) else {
                continue;
            };
            let ms = field.as_f64().ok_or_else(|| ParseError::InvalidField {
                field: name.to_string(),
                reason: "not a number".to_string(),
            })?;
            if ms < 0.0 {
                return Err(ParseError::InvalidField {
                    field: name.to_string(),
                    reason: format!("negative duration {}", ms),
                });
            }
            if ms > MAX_TIMING_MS {
                return Err(ParseError::InvalidField {
                    field: name.to_string(),
                    reason: format!("duration {} above {}", ms, MAX_TIMING_MS),
                });
            }
            timings.insert(name.to_string(), ms);
        }

        let apdex_value_ms = *timings
            .get(apdex_attribute.as_str())
            .ok_or_else(|| ParseError::MissingField(apdex_attribute.as_str().to_string()))?;
        let target_ms = stream
            .apdex_target_ms
            .unwrap_or(self.default_apdex_target_ms);

        let mut event_tags = tags(obj);
        let http_request = request_path(obj).is_some();
        if kind == EventKind::Backend && http_request && is_api_request(stream, &action) {
            fill_caller_defaults(&mut event_tags, &stream.env);
        }

        Ok(ParsedEvent {
            stream_id: stream.stream_id.clone(),
            storage_target: stream.storage_target.clone(),
            kind,
            action,
            timestamp_ms,
            bucket_ms: self.bucket_start(timestamp_ms),
            timings,
            apdex: ApdexClass::classify(apdex_value_ms, target_ms),
            apdex_value_ms,
            tags: event_tags,
        })
    }
}

/// Merge one event into an aggregate
pub fn fold(mut aggregate: Aggregate, event: &ParsedEvent) -> Aggregate {
    aggregate.record(event);
    aggregate
}

fn action_name(obj: &Map<String, Value>, kind: EventKind) -> Result<String, ParseError> {
    let mut candidates = vec!["action"];
    if kind.is_frontend() {
        candidates.push("page");
    }
    candidates
        .into_iter()
        .filter_map(|name| obj.get(name).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .ok_or_else(|| ParseError::MissingField("action".to_string()))
        .and_then(|name| {
            if is_reserved_action(name) {
                return Err(ParseError::InvalidField {
                    field: "action".to_string(),
                    reason: format!("'{}' is a reserved rollup name", name),
                });
            }
            Ok(name.to_string())
        })
}

fn is_api_request(stream: &StreamConfig, action: &str) -> bool {
    match &stream.api_requests {
        RequestFilter::Nothing => false,
        RequestFilter::Everything => true,
        filter => module_of(action)
            .is_some_and(|module| filter.matches_exact(module.trim_start_matches(':'))),
    }
}

fn fill_caller_defaults(tags: &mut BTreeMap<String, String>, env: &str) {
    let caller_id = tags.entry("caller_id".to_string()).or_default();
    if caller_id.is_empty() {
        *caller_id = format!("unknown-{}-unknown", env);
    }
    let caller_action = tags.entry("caller_action".to_string()).or_default();
    if caller_action.is_empty() {
        *caller_action = UNKNOWN_CALLER_ACTION.to_string();
    }
}

fn timestamp_ms(obj: &Map<String, Value>) -> Result<i64, ParseError> {
    if let Some(value) = obj.get("started_ms") {
        return value
            .as_i64()
            .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .ok_or_else(|| ParseError::InvalidField {
                field: "started_ms".to_string(),
                reason: "not a number".to_string(),
            });
    }

    if let Some(value) = obj.get("started_at") {
        let text = value.as_str().ok_or_else(|| ParseError::InvalidField {
            field: "started_at".to_string(),
            reason: "not a string".to_string(),
        })?;
        return DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| ParseError::InvalidField {
                field: "started_at".to_string(),
                reason: e.to_string(),
            });
    }

    Err(ParseError::MissingField("started_ms".to_string()))
}

fn request_path(obj: &Map<String, Value>) -> Option<&str> {
    obj.get("path").and_then(Value::as_str).or_else(|| {
        obj.get("request_info")
            .and_then(|info| info.get("url"))
            .and_then(Value::as_str)
    })
}

fn tags(obj: &Map<String, Value>) -> BTreeMap<String, String> {
    TAG_FIELDS
        .iter()
        .filter_map(|name| {
            let text = match obj.get(*name)? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((name.to_string(), text))
        })
        .collect()
}
