//! Core data structures flowing through the import pipeline
//!
//! - `RawMessage` - bus message as received (routing key + payload bytes)
//! - `ParsedEvent` - decoded, apdex-classified timing event
//! - `Aggregate` / `AggregateKey` - statistics per (stream, bucket, action)
//! - `FlushRequest` - batch of aggregates handed from an updater to a writer
//!
//! All timestamps are unix milliseconds. Days are UTC calendar dates.

use chrono::{DateTime, NaiveDate, Utc};
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Action name of the stream-wide rollup every event is also folded into
pub const ALL_PAGES: &str = "all_pages";

/// Prefix of module rollup names (`Orders#create` rolls up into `::Orders`)
pub const MODULE_PREFIX: &str = "::";

/// A message exactly as it came off the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(routing_key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload: payload.into(),
        }
    }

    /// Split the routing key into event kind and stream id
    ///
    /// - `frontend.page.<stream>` → page timing event
    /// - `frontend.ajax.<stream>` → ajax timing event
    /// - `logs.<stream>` or bare `<stream>` → backend request event
    pub fn route(&self) -> (EventKind, &str) {
        let key = self.routing_key.as_str();
        if let Some(stream) = key.strip_prefix("frontend.page.") {
            (EventKind::Page, stream)
        } else if let Some(stream) = key.strip_prefix("frontend.ajax.") {
            (EventKind::Ajax, stream)
        } else if let Some(stream) = key.strip_prefix("logs.") {
            (EventKind::Backend, stream)
        } else {
            (EventKind::Backend, key)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Backend,
    Page,
    Ajax,
}

impl EventKind {
    pub fn is_frontend(&self) -> bool {
        matches!(self, EventKind::Page | EventKind::Ajax)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Backend => "backend",
            EventKind::Page => "page",
            EventKind::Ajax => "ajax",
        }
    }
}

/// Apdex satisfaction band of a single event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApdexClass {
    Satisfied,
    Tolerated,
    Frustrated,
}

impl ApdexClass {
    /// Classify a duration against target `T`: ≤ T satisfied, ≤ 4T tolerated, else frustrated
    pub fn classify(value_ms: f64, target_ms: f64) -> Self {
        if value_ms <= target_ms {
            ApdexClass::Satisfied
        } else if value_ms <= 4.0 * target_ms {
            ApdexClass::Tolerated
        } else {
            ApdexClass::Frustrated
        }
    }
}

/// A decoded event, ready to be folded into an aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedEvent {
    pub stream_id: String,
    pub storage_target: String,
    pub kind: EventKind,
    pub action: String,
    pub timestamp_ms: i64,
    pub bucket_ms: i64,
    pub timings: BTreeMap<String, f64>,
    pub apdex: ApdexClass,
    pub apdex_value_ms: f64,
    pub tags: BTreeMap<String, String>,
}

impl ParsedEvent {
    pub fn key(&self) -> AggregateKey {
        AggregateKey::new(&self.stream_id, self.bucket_ms, &self.action)
    }

    pub fn rollup_key(&self) -> AggregateKey {
        AggregateKey::new(&self.stream_id, self.bucket_ms, ALL_PAGES)
    }

    pub fn module(&self) -> Option<String> {
        module_of(&self.action)
    }

    /// Key of the module rollup, if the action names a module
    pub fn module_key(&self) -> Option<AggregateKey> {
        self.module()
            .map(|module| AggregateKey::new(&self.stream_id, self.bucket_ms, &module))
    }
}

/// Module of an action: the part before the first `::` or `#`
///
/// `Api::V1::Orders#show` → `::Api`, `Orders#create` → `::Orders`,
/// `health` → `::health`. Actions starting with a separator have no module.
pub fn module_of(action: &str) -> Option<String> {
    let end = [action.find(MODULE_PREFIX), action.find('#')]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(action.len());
    let name = &action[..end];
    if name.is_empty() {
        return None;
    }
    Some(format!("{}{}", MODULE_PREFIX, name))
}

/// Names the pipeline uses for rollups; events may not claim them as actions
pub fn is_reserved_action(action: &str) -> bool {
    action == ALL_PAGES || action.starts_with(MODULE_PREFIX)
}

/// Running statistics of one timing field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub count: u64,
    pub sum: f64,
    pub sum_sq: f64,
    pub min: f64,
    pub max: f64,
}

impl TimingStats {
    pub fn from_value(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            sum_sq: value * value,
            min: value,
            max: value,
        }
    }

    pub fn record(&mut self, value: f64) {
        self.merge(&TimingStats::from_value(value));
    }

    pub fn merge(&mut self, other: &TimingStats) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let n = self.count as f64;
        let variance = (self.sum_sq - self.sum * self.sum / n) / (n - 1.0);
        variance.max(0.0).sqrt()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApdexTally {
    pub satisfied: u64,
    pub tolerated: u64,
    pub frustrated: u64,
}

impl ApdexTally {
    pub fn record(&mut self, class: ApdexClass) {
        match class {
            ApdexClass::Satisfied => self.satisfied += 1,
            ApdexClass::Tolerated => self.tolerated += 1,
            ApdexClass::Frustrated => self.frustrated += 1,
        }
    }

    pub fn merge(&mut self, other: &ApdexTally) {
        self.satisfied += other.satisfied;
        self.tolerated += other.tolerated;
        self.frustrated += other.frustrated;
    }

    pub fn total(&self) -> u64 {
        self.satisfied + self.tolerated + self.frustrated
    }

    /// Standard apdex score: (satisfied + tolerated / 2) / total
    pub fn score(&self) -> Option<f64> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        Some((self.satisfied as f64 + self.tolerated as f64 / 2.0) / total as f64)
    }
}

/// Identity of an aggregate; also the upsert key in the document store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub stream_id: String,
    pub bucket_ms: i64,
    pub action: String,
}

impl AggregateKey {
    pub fn new(stream_id: &str, bucket_ms: i64, action: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            bucket_ms,
            action: action.to_string(),
        }
    }

    pub fn day(&self) -> NaiveDate {
        day_of(self.bucket_ms)
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.stream_id, self.bucket_ms, self.action)
    }
}

/// Time-bucketed statistics for one `AggregateKey`
///
/// Every field combines with a commutative, associative merge, so the
/// result of folding a set of events does not depend on their order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub count: u64,
    pub timings: BTreeMap<String, TimingStats>,
    pub apdex: ApdexTally,
    pub response_codes: BTreeMap<String, u64>,
    pub severities: BTreeMap<String, u64>,
    /// `<caller_id>@<caller_action>` of api requests
    #[serde(default)]
    pub callers: BTreeMap<String, u64>,
    pub first_seen_ms: Option<i64>,
    pub last_seen_ms: Option<i64>,
}

impl Aggregate {
    pub fn record(&mut self, event: &ParsedEvent) {
        self.count += 1;
        for (name, value) in &event.timings {
            self.timings
                .entry(name.clone())
                .and_modify(|stats| stats.record(*value))
                .or_insert_with(|| TimingStats::from_value(*value));
        }
        self.apdex.record(event.apdex);
        if let Some(code) = event.tags.get("code") {
            *self.response_codes.entry(code.clone()).or_insert(0) += 1;
        }
        if let Some(severity) = event.tags.get("severity") {
            *self.severities.entry(severity.clone()).or_insert(0) += 1;
        }
        if let Some(caller) = caller_of(event) {
            *self.callers.entry(caller).or_insert(0) += 1;
        }
        self.first_seen_ms = min_opt(self.first_seen_ms, Some(event.timestamp_ms));
        self.last_seen_ms = max_opt(self.last_seen_ms, Some(event.timestamp_ms));
    }

    pub fn merge(&mut self, other: &Aggregate) {
        self.count += other.count;
        for (name, stats) in &other.timings {
            self.timings
                .entry(name.clone())
                .and_modify(|mine| mine.merge(stats))
                .or_insert(*stats);
        }
        self.apdex.merge(&other.apdex);
        for (code, n) in &other.response_codes {
            *self.response_codes.entry(code.clone()).or_insert(0) += n;
        }
        for (severity, n) in &other.severities {
            *self.severities.entry(severity.clone()).or_insert(0) += n;
        }
        for (caller, n) in &other.callers {
            *self.callers.entry(caller.clone()).or_insert(0) += n;
        }
        self.first_seen_ms = min_opt(self.first_seen_ms, other.first_seen_ms);
        self.last_seen_ms = max_opt(self.last_seen_ms, other.last_seen_ms);
    }

    pub fn timing(&self, name: &str) -> Option<&TimingStats> {
        self.timings.get(name)
    }
}

fn caller_of(event: &ParsedEvent) -> Option<String> {
    let caller_id = event.tags.get("caller_id")?;
    match event.tags.get("caller_action") {
        Some(action) => Some(format!("{}@{}", caller_id, action)),
        None => Some(caller_id.clone()),
    }
}

fn min_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// A batch of aggregates for one (day, storage target), bound to one writer
///
/// `id` is unique across process runs; stores use it to make re-applying
/// the same request a no-op.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushRequest {
    pub id: String,
    pub day: NaiveDate,
    pub storage_target: String,
    pub writer: usize,
    pub entries: Vec<(AggregateKey, Aggregate)>,
}

impl FlushRequest {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// UTC calendar day containing the given unix millisecond timestamp
pub fn day_of(timestamp_ms: i64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .unwrap_or_default()
        .date_naive()
}

/// Stable partition of a (stream, bucket) pair
///
/// Every action of the same stream and bucket lands in the same partition,
/// which is what gives each aggregate key exactly one owning updater.
pub fn partition_for(stream_id: &str, bucket_ms: i64, partitions: usize) -> usize {
    let mut hasher = FnvHasher::default();
    (stream_id, bucket_ms).hash(&mut hasher);
    let partitions = partitions.max(1) as u64;
    (hasher.finish() % partitions) as usize
}

/// Wall clock in unix milliseconds, injectable for tests
#[derive(Clone)]
pub struct Clock {
    now_fn: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl Clock {
    pub fn system() -> Self {
        Self::from_fn(|| Utc::now().timestamp_millis())
    }

    pub fn from_fn(now_fn: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        Self {
            now_fn: Arc::new(now_fn),
        }
    }

    pub fn fixed(now_ms: i64) -> Self {
        Self::from_fn(move || now_ms)
    }

    pub fn now_ms(&self) -> i64 {
        (self.now_fn)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock").field("now_ms", &self.now_ms()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_event(action: &str, total_ms: f64, apdex: ApdexClass, ts: i64) -> ParsedEvent {
        let mut timings = BTreeMap::new();
        timings.insert("total_time".to_string(), total_ms);
        let mut tags = BTreeMap::new();
        tags.insert("code".to_string(), "200".to_string());
        ParsedEvent {
            stream_id: "shop-production".to_string(),
            storage_target: "logflow-shop-production".to_string(),
            kind: EventKind::Backend,
            action: action.to_string(),
            timestamp_ms: ts,
            bucket_ms: ts - ts.rem_euclid(60_000),
            timings,
            apdex,
            apdex_value_ms: total_ms,
            tags,
        }
    }

    #[test]
    fn test_route_prefixes() {
        let cases = [
            ("frontend.page.shop-production", EventKind::Page, "shop-production"),
            ("frontend.ajax.shop-production", EventKind::Ajax, "shop-production"),
            ("logs.shop-production", EventKind::Backend, "shop-production"),
            ("shop-production", EventKind::Backend, "shop-production"),
        ];
        for (key, kind, stream) in cases {
            let msg = RawMessage::new(key, b"{}".to_vec());
            assert_eq!(msg.route(), (kind, stream), "routing key {}", key);
        }
    }

    #[test]
    fn test_apdex_boundaries() {
        assert_eq!(ApdexClass::classify(100.0, 100.0), ApdexClass::Satisfied);
        assert_eq!(ApdexClass::classify(100.1, 100.0), ApdexClass::Tolerated);
        assert_eq!(ApdexClass::classify(400.0, 100.0), ApdexClass::Tolerated);
        assert_eq!(ApdexClass::classify(400.1, 100.0), ApdexClass::Frustrated);
        assert_eq!(ApdexClass::classify(0.0, 100.0), ApdexClass::Satisfied);
    }

    #[test]
    fn test_apdex_monotonic_in_duration() {
        // Test: for fixed T, a larger duration never yields a better class
        let target = 250.0;
        let mut previous = ApdexClass::Satisfied;
        for step in 0..5_000 {
            let class = ApdexClass::classify(step as f64 * 0.5, target);
            assert!(class >= previous, "class regressed at {}ms", step as f64 * 0.5);
            previous = class;
        }
        assert_eq!(previous, ApdexClass::Frustrated);
    }

    #[test]
    fn test_timing_stats_merge() {
        let mut stats = TimingStats::from_value(50.0);
        stats.record(150.0);
        stats.record(600.0);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.sum, 800.0);
        assert_eq!(stats.min, 50.0);
        assert_eq!(stats.max, 600.0);
        assert_eq!(stats.sum_sq, 50.0 * 50.0 + 150.0 * 150.0 + 600.0 * 600.0);
        assert!((stats.mean() - 266.666).abs() < 0.01);
    }

    #[test]
    fn test_aggregate_record_and_merge_agree() {
        let events = vec![
            make_event("Orders#show", 50.0, ApdexClass::Satisfied, 1_000),
            make_event("Orders#show", 150.0, ApdexClass::Tolerated, 2_000),
            make_event("Orders#show", 600.0, ApdexClass::Frustrated, 3_000),
        ];

        let mut folded = Aggregate::default();
        for event in &events {
            folded.record(event);
        }

        let mut left = Aggregate::default();
        left.record(&events[0]);
        let mut right = Aggregate::default();
        right.record(&events[2]);
        right.record(&events[1]);
        left.merge(&right);

        assert_eq!(folded, left);
        assert_eq!(folded.count, 3);
        assert_eq!(folded.first_seen_ms, Some(1_000));
        assert_eq!(folded.last_seen_ms, Some(3_000));
        assert_eq!(folded.response_codes.get("200"), Some(&3));
        assert_eq!(folded.apdex.score(), Some(0.5));
    }

    #[test]
    fn test_module_of_action() {
        assert_eq!(module_of("Orders#create").as_deref(), Some("::Orders"));
        assert_eq!(module_of("Api::V1::Orders#show").as_deref(), Some("::Api"));
        assert_eq!(module_of("health").as_deref(), Some("::health"));
        assert_eq!(module_of("#show"), None);
        assert_eq!(module_of("::Orders"), None);

        let event = make_event("Cart#add", 10.0, ApdexClass::Satisfied, 61_000);
        assert_eq!(
            event.module_key(),
            Some(AggregateKey::new("shop-production", 60_000, "::Cart"))
        );
    }

    #[test]
    fn test_rollup_names_are_reserved() {
        assert!(is_reserved_action(ALL_PAGES));
        assert!(is_reserved_action("::Orders"));
        assert!(!is_reserved_action("Orders#all_pages"));
        assert!(!is_reserved_action("Orders#show"));
    }

    #[test]
    fn test_callers_tally() {
        let mut event = make_event("Api#show", 10.0, ApdexClass::Satisfied, 1_000);
        event.tags.insert("caller_id".to_string(), "shop-production-web1".to_string());
        event.tags.insert("caller_action".to_string(), "Cart#show".to_string());
        let mut bare = make_event("Api#show", 10.0, ApdexClass::Satisfied, 2_000);
        bare.tags.insert("caller_id".to_string(), "unknown".to_string());

        let mut aggregate = Aggregate::default();
        aggregate.record(&event);
        aggregate.record(&event);
        let mut other = Aggregate::default();
        other.record(&bare);
        aggregate.merge(&other);

        assert_eq!(aggregate.callers.get("shop-production-web1@Cart#show"), Some(&2));
        assert_eq!(aggregate.callers.get("unknown"), Some(&1));

        // Documents stored without a callers tally still decode
        let legacy = r#"{"count":1,"timings":{},"apdex":{"satisfied":1,"tolerated":0,"frustrated":0},
            "response_codes":{},"severities":{},"first_seen_ms":null,"last_seen_ms":null}"#;
        let decoded: Aggregate = serde_json::from_str(legacy).unwrap();
        assert!(decoded.callers.is_empty());
    }

    #[test]
    fn test_partition_is_stable_and_in_range() {
        for bucket in 0..100 {
            let bucket_ms = bucket * 60_000;
            let p = partition_for("shop-production", bucket_ms, 7);
            assert!(p < 7);
            assert_eq!(p, partition_for("shop-production", bucket_ms, 7));
        }
        assert_eq!(partition_for("shop-production", 0, 0), 0);
    }

    #[test]
    fn test_day_of_is_utc() {
        let day = day_of(1_700_000_000_000);
        assert_eq!(day, NaiveDate::from_ymd_opt(2023, 11, 14).unwrap());
        // One millisecond before midnight stays on the previous day
        let midnight = 1_700_006_400_000;
        assert_eq!(day_of(midnight - 1), NaiveDate::from_ymd_opt(2023, 11, 14).unwrap());
        assert_eq!(day_of(midnight), NaiveDate::from_ymd_opt(2023, 11, 15).unwrap());
    }
}
