//! Stream registry: which streams this process imports and how
//!
//! Built once at startup from the stream definitions file and the
//! subscription pattern, then shared read-only (`Arc<StreamRegistry>`)
//! by every parser. Streams that are not in the registry are treated as
//! "not subscribed" and never reach the processor.
//!
//! Definitions file format:
//! ```json
//! {
//!   "shop-production": {
//!     "storage_target": "logflow-shop-production",
//!     "enabled": true,
//!     "apdex_attribute": "page_time",
//!     "apdex_target_ms": 100,
//!     "ignored_request_uri": "/_system",
//!     "backend_only_requests": "Admin,Internal",
//!     "api_requests": ["Api"]
//!   }
//! }
//! ```
//!
//! `backend_only_requests` is `*` or comma separated action prefixes whose
//! frontend timings are dropped. `api_requests` lists modules whose backend
//! requests get caller defaults; a leading `""` entry makes every request
//! an api request.

use super::config::ConfigError;
use super::types::{EventKind, ALL_PAGES};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Modules not seen for this long are forgotten
pub const MODULE_EXPIRY_MS: i64 = 24 * 60 * 60 * 1000;

/// Timing fields recognized in event payloads
///
/// This is also the fixed schema an apdex attribute override is validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingMetric {
    TotalTime,
    PageTime,
    AjaxTime,
    DbTime,
    ViewTime,
    ApiTime,
    OtherTime,
    WaitTime,
    GcTime,
    MemcacheTime,
    SearchTime,
    ConnectTime,
    ResponseTime,
    ProcessingTime,
    DomInteractive,
    LoadTime,
}

impl TimingMetric {
    pub const ALL: [TimingMetric; 16] = [
        TimingMetric::TotalTime,
        TimingMetric::PageTime,
        TimingMetric::AjaxTime,
        TimingMetric::DbTime,
        TimingMetric::ViewTime,
        TimingMetric::ApiTime,
        TimingMetric::OtherTime,
        TimingMetric::WaitTime,
        TimingMetric::GcTime,
        TimingMetric::MemcacheTime,
        TimingMetric::SearchTime,
        TimingMetric::ConnectTime,
        TimingMetric::ResponseTime,
        TimingMetric::ProcessingTime,
        TimingMetric::DomInteractive,
        TimingMetric::LoadTime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimingMetric::TotalTime => "total_time",
            TimingMetric::PageTime => "page_time",
            TimingMetric::AjaxTime => "ajax_time",
            TimingMetric::DbTime => "db_time",
            TimingMetric::ViewTime => "view_time",
            TimingMetric::ApiTime => "api_time",
            TimingMetric::OtherTime => "other_time",
            TimingMetric::WaitTime => "wait_time",
            TimingMetric::GcTime => "gc_time",
            TimingMetric::MemcacheTime => "memcache_time",
            TimingMetric::SearchTime => "search_time",
            TimingMetric::ConnectTime => "connect_time",
            TimingMetric::ResponseTime => "response_time",
            TimingMetric::ProcessingTime => "processing_time",
            TimingMetric::DomInteractive => "dom_interactive",
            TimingMetric::LoadTime => "load_time",
        }
    }

    /// Apdex attribute used when nothing overrides it
    pub fn default_for(kind: EventKind) -> Self {
        match kind {
            EventKind::Backend => TimingMetric::TotalTime,
            EventKind::Page => TimingMetric::PageTime,
            EventKind::Ajax => TimingMetric::AjaxTime,
        }
    }
}

impl fmt::Display for TimingMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimingMetric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimingMetric::ALL
            .iter()
            .copied()
            .find(|metric| metric.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownApdexAttribute(s.to_string()))
    }
}

/// One entry of the definitions file; unknown keys are ignored
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamDefinition {
    pub enabled: Option<bool>,
    pub storage_target: Option<String>,
    pub apdex_attribute: Option<String>,
    pub apdex_target_ms: Option<f64>,
    pub ignored_request_uri: Option<String>,
    pub backend_only_requests: Option<String>,
    pub api_requests: Option<Vec<String>>,
}

/// Which requests a stream setting applies to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RequestFilter {
    #[default]
    Nothing,
    Everything,
    Listed(Vec<String>),
}

impl RequestFilter {
    /// `*` → everything, otherwise comma separated names
    pub fn from_list(value: &str) -> Self {
        if value.trim() == "*" {
            return RequestFilter::Everything;
        }
        let names: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            RequestFilter::Nothing
        } else {
            RequestFilter::Listed(names)
        }
    }

    /// A leading empty name → everything
    pub fn from_names(names: &[String]) -> Self {
        match names.first() {
            None => RequestFilter::Nothing,
            Some(first) if first.is_empty() => RequestFilter::Everything,
            Some(_) => RequestFilter::Listed(
                names.iter().filter(|n| !n.is_empty()).cloned().collect(),
            ),
        }
    }

    pub fn matches_prefix(&self, value: &str) -> bool {
        match self {
            RequestFilter::Nothing => false,
            RequestFilter::Everything => true,
            RequestFilter::Listed(names) => names.iter().any(|n| value.starts_with(n.as_str())),
        }
    }

    pub fn matches_exact(&self, value: &str) -> bool {
        match self {
            RequestFilter::Nothing => false,
            RequestFilter::Everything => true,
            RequestFilter::Listed(names) => names.iter().any(|n| n == value),
        }
    }
}

/// Routing metadata for one subscribed stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub stream_id: String,
    pub app: String,
    pub env: String,
    pub enabled: bool,
    pub storage_target: String,
    pub apdex_attribute: Option<TimingMetric>,
    pub apdex_target_ms: Option<f64>,
    pub ignored_request_prefix: Option<String>,
    /// Actions whose frontend timings are not imported
    pub backend_only: RequestFilter,
    /// Modules whose backend requests get caller defaults
    pub api_requests: RequestFilter,
}

impl StreamConfig {
    /// Build from a definition; `None` if the id is not of the `app-env` form
    pub fn from_definition(stream_id: &str, def: &StreamDefinition) -> Option<Self> {
        let (app, env) = split_app_env(stream_id)?;

        let apdex_attribute = match def.apdex_attribute.as_deref() {
            Some(name) => match name.parse::<TimingMetric>() {
                Ok(metric) => Some(metric),
                Err(e) => {
                    log::warn!("⚠️  Stream {}: {}, using default", stream_id, e);
                    None
                }
            },
            None => None,
        };

        let apdex_target_ms = def
            .apdex_target_ms
            .filter(|t| t.is_finite() && *t > 0.0);

        Some(Self {
            stream_id: stream_id.to_string(),
            app: app.to_string(),
            env: env.to_string(),
            enabled: def.enabled.unwrap_or(true),
            storage_target: def
                .storage_target
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| format!("logflow-{}", stream_id)),
            apdex_attribute,
            apdex_target_ms,
            ignored_request_prefix: def.ignored_request_uri.clone().filter(|p| !p.is_empty()),
            backend_only: def
                .backend_only_requests
                .as_deref()
                .map(RequestFilter::from_list)
                .unwrap_or_default(),
            api_requests: def
                .api_requests
                .as_deref()
                .map(RequestFilter::from_names)
                .unwrap_or_default(),
        })
    }
}

/// Split `app-env` at the last dash; both parts must be non-empty
fn split_app_env(stream_id: &str) -> Option<(&str, &str)> {
    let (app, env) = stream_id.rsplit_once('-')?;
    if app.is_empty() || env.is_empty() {
        return None;
    }
    Some((app, env))
}

/// Which stream ids the process subscribes to
#[derive(Debug, Clone)]
pub enum SubscriptionPattern {
    All,
    Glob(glob::Pattern),
    Substring(String),
}

impl SubscriptionPattern {
    /// Empty → all streams; `*`, `?` or `[` → glob; anything else → substring
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        if pattern.is_empty() {
            return Ok(SubscriptionPattern::All);
        }
        if pattern.contains(['*', '?', '[']) {
            let glob = glob::Pattern::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
            return Ok(SubscriptionPattern::Glob(glob));
        }
        Ok(SubscriptionPattern::Substring(pattern.to_string()))
    }

    pub fn matches(&self, stream_id: &str) -> bool {
        match self {
            SubscriptionPattern::All => true,
            SubscriptionPattern::Glob(glob) => glob.matches(stream_id),
            SubscriptionPattern::Substring(s) => stream_id.contains(s.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamRegistry {
    streams: HashMap<String, Arc<StreamConfig>>,
    apdex_override: Option<TimingMetric>,
}

impl StreamRegistry {
    /// Load the definitions file and keep the streams matching `pattern`
    pub fn load(path: &Path, pattern: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let definitions: BTreeMap<String, StreamDefinition> =
            serde_json::from_str(&content).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_definitions(definitions, pattern)
    }

    pub fn from_definitions(
        definitions: BTreeMap<String, StreamDefinition>,
        pattern: &str,
    ) -> Result<Self, ConfigError> {
        let subscription = SubscriptionPattern::parse(pattern)?;
        let mut streams = HashMap::new();

        for (stream_id, def) in &definitions {
            if !subscription.matches(stream_id) {
                continue;
            }
            match StreamConfig::from_definition(stream_id, def) {
                Some(config) => {
                    streams.insert(stream_id.clone(), Arc::new(config));
                }
                None => log::error!("❌ Ignored invalid stream id: {}", stream_id),
            }
        }

        log::debug!(
            "📋 Stream registry: {} of {} defined streams subscribed (pattern: '{}')",
            streams.len(),
            definitions.len(),
            pattern
        );

        Ok(Self {
            streams,
            apdex_override: None,
        })
    }

    pub fn lookup(&self, stream_id: &str) -> Option<&Arc<StreamConfig>> {
        self.streams.get(stream_id)
    }

    /// Validate `name` against the known timing fields and make it the
    /// process-wide apdex attribute. Returns false (and changes nothing)
    /// for an unknown name.
    pub fn apply_apdex_override(&mut self, name: &str) -> bool {
        match name.parse::<TimingMetric>() {
            Ok(metric) => {
                self.apdex_override = Some(metric);
                true
            }
            Err(_) => false,
        }
    }

    pub fn apdex_override(&self) -> Option<TimingMetric> {
        self.apdex_override
    }

    /// Stream setting, then process override, then the default for the event kind
    pub fn apdex_attribute_for(&self, stream: &StreamConfig, kind: EventKind) -> TimingMetric {
        stream
            .apdex_attribute
            .or(self.apdex_override)
            .unwrap_or_else(|| TimingMetric::default_for(kind))
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Distinct storage targets of enabled streams
    pub fn storage_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self
            .streams
            .values()
            .filter(|s| s.enabled)
            .map(|s| s.storage_target.clone())
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }
}

/// Modules seen per stream, with the time they were last seen
///
/// Updaters report the modules they folded on every tick; entries idle for
/// longer than `MODULE_EXPIRY_MS` are dropped on the same update.
#[derive(Debug, Default)]
pub struct KnownModules {
    streams: Mutex<HashMap<String, HashMap<String, i64>>>,
}

impl KnownModules {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, i64>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `seen` (stream → modules) as seen at `now_ms`, then expire
    pub fn update(&self, now_ms: i64, seen: HashMap<String, HashSet<String>>) {
        let mut streams = self.streams();
        for (stream_id, modules) in seen {
            let known = streams.entry(stream_id).or_default();
            for module in modules {
                known.insert(module, now_ms);
            }
        }

        let threshold = now_ms.saturating_sub(MODULE_EXPIRY_MS);
        for known in streams.values_mut() {
            known.retain(|_, last_seen| *last_seen >= threshold);
        }
        streams.retain(|_, known| !known.is_empty());
    }

    /// Sorted modules of a stream, led by `all_pages` unless none is left
    pub fn modules(&self, stream_id: &str) -> Vec<String> {
        let streams = self.streams();
        let Some(known) = streams.get(stream_id) else {
            return Vec::new();
        };
        let mut modules: Vec<String> = known.keys().cloned().collect();
        modules.sort();
        modules.insert(0, ALL_PAGES.to_string());
        modules
    }

    /// Total modules across all streams
    pub fn len(&self) -> usize {
        self.streams().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
