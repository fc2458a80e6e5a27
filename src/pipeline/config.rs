//! Importer configuration from environment variables and command-line flags
//!
//! Resolution order: built-in defaults → environment (`.env` honoured by the
//! binary via dotenv) → command-line flags. `validate()` runs last and any
//! error is fatal at startup.

use super::backoff::RetryPolicy;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const MAX_PARSERS: usize = 64;
pub const MAX_UPDATERS: usize = 64;
pub const MAX_WRITERS: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("{pool} pool size {value} out of range (1..={max})")]
    PoolSize {
        pool: &'static str,
        value: usize,
        max: usize,
    },

    #[error("Unknown apdex attribute: {0}")]
    UnknownApdexAttribute(String),

    #[error("Invalid subscription pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("Failed to read stream definitions {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid stream definitions {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing value for flag {0}")]
    MissingArgument(String),

    #[error("Unknown flag {0}")]
    UnknownArgument(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(StorageBackend::Sqlite),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(ConfigError::InvalidValue {
                name: "backend".to_string(),
                reason: format!("expected sqlite or memory, got '{}'", other),
            }),
        }
    }
}

/// Where the bus messages come from
#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    Stdin,
    /// Tail a JSONL file, starting at its current end
    File(PathBuf),
}

impl InputSource {
    fn parse(value: &str) -> Self {
        if value.is_empty() || value == "-" {
            InputSource::Stdin
        } else {
            InputSource::File(PathBuf::from(value))
        }
    }
}

/// Complete importer configuration
#[derive(Debug, Clone)]
pub struct ImporterConfig {
    /// Stream definitions file (JSON object keyed by stream id)
    pub config_path: PathBuf,

    /// Subscription pattern; empty subscribes to every defined stream
    pub subscription_pattern: String,

    pub num_parsers: usize,
    pub num_updaters: usize,
    pub num_writers: usize,

    /// Process-wide apdex attribute override (validated by the stream registry)
    pub apdex_attribute: Option<String>,

    /// Default apdex target T in milliseconds
    pub apdex_target_ms: f64,

    pub bucket_secs: u64,
    pub max_clock_skew_secs: u64,

    /// Controller tick; drives updater flushes, rollover checks and diagnostics
    pub tick_interval_ms: u64,
    pub stats_interval_ticks: u64,

    /// Capacity of every inter-stage queue
    pub channel_buffer: usize,

    /// Updater buffer-pressure threshold (aggregates held per updater)
    pub max_aggregates_per_updater: usize,

    pub write_retry: RetryPolicy,

    /// Per-pool join timeout during shutdown
    pub shutdown_timeout_ms: u64,

    pub backend: StorageBackend,
    pub data_dir: PathBuf,
    pub db_prefix: String,

    pub input: InputSource,

    /// Optional append-only log of frontend timing events
    pub frontend_timings_log: Option<PathBuf>,

    pub dry_run: bool,
    pub verbose: bool,
    pub quiet: bool,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("streams.json"),
            subscription_pattern: String::new(),
            num_parsers: 4,
            num_updaters: 4,
            num_writers: 4,
            apdex_attribute: None,
            apdex_target_ms: 500.0,
            bucket_secs: 60,
            max_clock_skew_secs: 3_600,
            tick_interval_ms: 1_000,
            stats_interval_ticks: 10,
            channel_buffer: 10_000,
            max_aggregates_per_updater: 100_000,
            write_retry: RetryPolicy::default(),
            shutdown_timeout_ms: 10_000,
            backend: StorageBackend::Sqlite,
            data_dir: PathBuf::from("data"),
            db_prefix: "logflow".to_string(),
            input: InputSource::Stdin,
            frontend_timings_log: None,
            dry_run: false,
            verbose: false,
            quiet: false,
        }
    }
}

impl ImporterConfig {
    /// Environment, then `args` (without the program name), then validation
    pub fn load<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Self::from_env();
        config.apply_args(args)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables (unset or unparsable values keep the default):
    /// - `LOGFLOW_CONFIG` (default: streams.json)
    /// - `LOGFLOW_SUBSCRIPTION` (default: empty, all streams)
    /// - `LOGFLOW_PARSERS` / `LOGFLOW_UPDATERS` / `LOGFLOW_WRITERS` (default: 4)
    /// - `LOGFLOW_APDEX_ATTRIBUTE`, `LOGFLOW_APDEX_TARGET_MS` (default: 500)
    /// - `LOGFLOW_BUCKET_SECS` (default: 60), `LOGFLOW_MAX_CLOCK_SKEW_SECS` (default: 3600)
    /// - `LOGFLOW_TICK_INTERVAL_MS` (default: 1000), `LOGFLOW_STATS_INTERVAL_TICKS` (default: 10)
    /// - `LOGFLOW_CHANNEL_BUFFER` (default: 10000)
    /// - `LOGFLOW_MAX_AGGREGATES_PER_UPDATER` (default: 100000)
    /// - `LOGFLOW_WRITE_MAX_ATTEMPTS` (default: 5)
    /// - `LOGFLOW_WRITE_RETRY_INITIAL_MS` / `LOGFLOW_WRITE_RETRY_MAX_MS` (default: 500 / 30000)
    /// - `LOGFLOW_SHUTDOWN_TIMEOUT_MS` (default: 10000)
    /// - `LOGFLOW_BACKEND` (default: sqlite), `LOGFLOW_DATA_DIR`, `LOGFLOW_DB_PREFIX`
    /// - `LOGFLOW_INPUT` (default: `-`, stdin)
    /// - `LOGFLOW_FRONTEND_TIMINGS_LOG`
    /// - `LOGFLOW_DRY_RUN`, `LOGFLOW_VERBOSE`, `LOGFLOW_QUIET` (default: false)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        fn or_default<T: FromStr>(value: Option<String>, default: T) -> T {
            value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
        }

        let flag = |name: &str, default: bool| {
            parsed(name)
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(default)
        };

        let write_retry = RetryPolicy {
            max_attempts: or_default(
                parsed("LOGFLOW_WRITE_MAX_ATTEMPTS"),
                defaults.write_retry.max_attempts,
            ),
            initial_delay_ms: or_default(
                parsed("LOGFLOW_WRITE_RETRY_INITIAL_MS"),
                defaults.write_retry.initial_delay_ms,
            ),
            max_delay_ms: or_default(
                parsed("LOGFLOW_WRITE_RETRY_MAX_MS"),
                defaults.write_retry.max_delay_ms,
            ),
            jitter: defaults.write_retry.jitter,
        };

        let backend = parsed("LOGFLOW_BACKEND")
            .and_then(|v| match v.parse::<StorageBackend>() {
                Ok(backend) => Some(backend),
                Err(e) => {
                    log::warn!("⚠️  {}, defaulting to sqlite", e);
                    None
                }
            })
            .unwrap_or(defaults.backend);

        Self {
            config_path: parsed("LOGFLOW_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_path),
            subscription_pattern: lookup("LOGFLOW_SUBSCRIPTION")
                .unwrap_or(defaults.subscription_pattern),
            num_parsers: or_default(parsed("LOGFLOW_PARSERS"), defaults.num_parsers),
            num_updaters: or_default(parsed("LOGFLOW_UPDATERS"), defaults.num_updaters),
            num_writers: or_default(parsed("LOGFLOW_WRITERS"), defaults.num_writers),
            apdex_attribute: parsed("LOGFLOW_APDEX_ATTRIBUTE"),
            apdex_target_ms: or_default(parsed("LOGFLOW_APDEX_TARGET_MS"), defaults.apdex_target_ms),
            bucket_secs: or_default(parsed("LOGFLOW_BUCKET_SECS"), defaults.bucket_secs),
            max_clock_skew_secs: or_default(
                parsed("LOGFLOW_MAX_CLOCK_SKEW_SECS"),
                defaults.max_clock_skew_secs,
            ),
            tick_interval_ms: or_default(parsed("LOGFLOW_TICK_INTERVAL_MS"), defaults.tick_interval_ms),
            stats_interval_ticks: or_default(
                parsed("LOGFLOW_STATS_INTERVAL_TICKS"),
                defaults.stats_interval_ticks,
            ),
            channel_buffer: or_default(parsed("LOGFLOW_CHANNEL_BUFFER"), defaults.channel_buffer),
            max_aggregates_per_updater: or_default(
                parsed("LOGFLOW_MAX_AGGREGATES_PER_UPDATER"),
                defaults.max_aggregates_per_updater,
            ),
            write_retry,
            shutdown_timeout_ms: or_default(
                parsed("LOGFLOW_SHUTDOWN_TIMEOUT_MS"),
                defaults.shutdown_timeout_ms,
            ),
            backend,
            data_dir: parsed("LOGFLOW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            db_prefix: parsed("LOGFLOW_DB_PREFIX").unwrap_or(defaults.db_prefix),
            input: parsed("LOGFLOW_INPUT")
                .map(|v| InputSource::parse(&v))
                .unwrap_or(defaults.input),
            frontend_timings_log: parsed("LOGFLOW_FRONTEND_TIMINGS_LOG").map(PathBuf::from),
            dry_run: flag("LOGFLOW_DRY_RUN", defaults.dry_run),
            verbose: flag("LOGFLOW_VERBOSE", defaults.verbose),
            quiet: flag("LOGFLOW_QUIET", defaults.quiet),
        }
    }

    /// Apply command-line flags on top of the current values
    ///
    /// Flags:
    /// - `-n, --dry-run`            log writes instead of performing them
    /// - `-v, --verbose`            debug logging
    /// - `-q, --quiet`              warnings and errors only
    /// - `-p, --parsers N`          parser pool size
    /// - `-u, --updaters N`         updater pool size
    /// - `-w, --writers N`          writer pool size
    /// - `-s, --subscribe PATTERN`  stream subscription pattern
    /// - `-c, --config FILE`        stream definitions file
    /// - `-f, --frontend-log FILE`  frontend timings log
    /// - `-a, --apdex-attribute N`  process-wide apdex attribute
    /// - `-i, --input FILE`         JSONL input, `-` for stdin
    /// - `-d, --data-dir DIR`       SQLite data directory
    /// - `-b, --backend NAME`       sqlite | memory
    pub fn apply_args<I>(&mut self, args: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            let mut value = |flag: &str| {
                args.next()
                    .ok_or_else(|| ConfigError::MissingArgument(flag.to_string()))
            };

            match arg.as_str() {
                "-n" | "--dry-run" => self.dry_run = true,
                "-v" | "--verbose" => self.verbose = true,
                "-q" | "--quiet" => self.quiet = true,
                "-p" | "--parsers" => self.num_parsers = parse_count(&arg, &value(&arg)?)?,
                "-u" | "--updaters" => self.num_updaters = parse_count(&arg, &value(&arg)?)?,
                "-w" | "--writers" => self.num_writers = parse_count(&arg, &value(&arg)?)?,
                "-s" | "--subscribe" => self.subscription_pattern = value(&arg)?,
                "-c" | "--config" => self.config_path = PathBuf::from(value(&arg)?),
                "-f" | "--frontend-log" => {
                    self.frontend_timings_log = Some(PathBuf::from(value(&arg)?))
                }
                "-a" | "--apdex-attribute" => self.apdex_attribute = Some(value(&arg)?),
                "-i" | "--input" => self.input = InputSource::parse(&value(&arg)?),
                "-d" | "--data-dir" => self.data_dir = PathBuf::from(value(&arg)?),
                "-b" | "--backend" => self.backend = value(&arg)?.parse()?,
                _ => return Err(ConfigError::UnknownArgument(arg.clone())),
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_pool("parser", self.num_parsers, MAX_PARSERS)?;
        check_pool("updater", self.num_updaters, MAX_UPDATERS)?;
        check_pool("writer", self.num_writers, MAX_WRITERS)?;

        if !(self.apdex_target_ms.is_finite() && self.apdex_target_ms > 0.0) {
            return Err(invalid("apdex_target_ms", "must be a positive number of milliseconds"));
        }
        if self.bucket_secs == 0 {
            return Err(invalid("bucket_secs", "must be at least 1"));
        }
        if self.tick_interval_ms == 0 {
            return Err(invalid("tick_interval_ms", "must be at least 1"));
        }
        if self.channel_buffer == 0 {
            return Err(invalid("channel_buffer", "must be at least 1"));
        }
        if self.max_aggregates_per_updater == 0 {
            return Err(invalid("max_aggregates_per_updater", "must be at least 1"));
        }
        if self.write_retry.max_attempts == 0 {
            return Err(invalid("write_max_attempts", "must be at least 1"));
        }
        if self.write_retry.initial_delay_ms > self.write_retry.max_delay_ms {
            return Err(invalid(
                "write_retry_initial_ms",
                "must not exceed write_retry_max_ms",
            ));
        }
        if self.db_prefix.is_empty() || self.db_prefix.contains(std::path::MAIN_SEPARATOR) {
            return Err(invalid("db_prefix", "must be a non-empty file name prefix"));
        }

        Ok(())
    }

    pub fn bucket_width_ms(&self) -> i64 {
        (self.bucket_secs as i64).saturating_mul(1_000)
    }

    pub fn max_clock_skew_ms(&self) -> i64 {
        (self.max_clock_skew_secs as i64).saturating_mul(1_000)
    }

    /// Log level implied by verbose/quiet; verbose wins when both are set
    pub fn log_level(&self) -> log::LevelFilter {
        if self.verbose {
            log::LevelFilter::Debug
        } else if self.quiet {
            log::LevelFilter::Warn
        } else {
            log::LevelFilter::Info
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

fn parse_count(flag: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        name: flag.to_string(),
        reason: format!("'{}' is not a number", value),
    })
}

fn check_pool(pool: &'static str, value: usize, max: usize) -> Result<(), ConfigError> {
    if value == 0 || value > max {
        return Err(ConfigError::PoolSize { pool, value, max });
    }
    Ok(())
}

fn invalid(name: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_config() {
        // Test: no variables set yields documented defaults
        let config = ImporterConfig::from_lookup(|_| None);

        assert_eq!(config.config_path, PathBuf::from("streams.json"));
        assert_eq!(config.subscription_pattern, "");
        assert_eq!(config.num_parsers, 4);
        assert_eq!(config.num_updaters, 4);
        assert_eq!(config.num_writers, 4);
        assert_eq!(config.apdex_target_ms, 500.0);
        assert_eq!(config.bucket_width_ms(), 60_000);
        assert_eq!(config.max_clock_skew_ms(), 3_600_000);
        assert_eq!(config.write_retry, RetryPolicy::default());
        assert_eq!(config.backend, StorageBackend::Sqlite);
        assert_eq!(config.input, InputSource::Stdin);
        assert!(!config.dry_run);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_custom_config() {
        // Test: values come through the lookup, unparsable ones keep defaults
        let vars: HashMap<&str, &str> = [
            ("LOGFLOW_CONFIG", "/etc/logflow/streams.json"),
            ("LOGFLOW_PARSERS", "8"),
            ("LOGFLOW_UPDATERS", "not-a-number"),
            ("LOGFLOW_APDEX_TARGET_MS", "100"),
            ("LOGFLOW_BACKEND", "memory"),
            ("LOGFLOW_INPUT", "/var/log/app/events.jsonl"),
            ("LOGFLOW_WRITE_MAX_ATTEMPTS", "9"),
            ("LOGFLOW_DRY_RUN", "true"),
            ("LOGFLOW_QUIET", "1"),
        ]
        .into_iter()
        .collect();

        let config = ImporterConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.config_path, PathBuf::from("/etc/logflow/streams.json"));
        assert_eq!(config.num_parsers, 8);
        assert_eq!(config.num_updaters, 4);
        assert_eq!(config.apdex_target_ms, 100.0);
        assert_eq!(config.backend, StorageBackend::Memory);
        assert_eq!(
            config.input,
            InputSource::File(PathBuf::from("/var/log/app/events.jsonl"))
        );
        assert_eq!(config.write_retry.max_attempts, 9);
        assert!(config.dry_run);
        assert_eq!(config.log_level(), log::LevelFilter::Warn);
    }

    #[test]
    fn test_args_override_env() {
        let mut config = ImporterConfig::from_lookup(|_| None);
        config
            .apply_args(args(&[
                "-n", "-v", "-p", "2", "-u", "3", "-w", "5", "-s", "shop-*", "-c", "conf.json",
                "-f", "frontend.log", "-a", "page_time", "-i", "-", "--backend", "memory",
            ]))
            .unwrap();

        assert!(config.dry_run);
        assert_eq!(config.log_level(), log::LevelFilter::Debug);
        assert_eq!(
            (config.num_parsers, config.num_updaters, config.num_writers),
            (2, 3, 5)
        );
        assert_eq!(config.subscription_pattern, "shop-*");
        assert_eq!(config.config_path, PathBuf::from("conf.json"));
        assert_eq!(config.frontend_timings_log, Some(PathBuf::from("frontend.log")));
        assert_eq!(config.apdex_attribute.as_deref(), Some("page_time"));
        assert_eq!(config.input, InputSource::Stdin);
        assert_eq!(config.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_bad_args_are_errors() {
        let mut config = ImporterConfig::default();
        assert!(matches!(
            config.apply_args(args(&["-p"])),
            Err(ConfigError::MissingArgument(_))
        ));
        assert!(matches!(
            config.apply_args(args(&["-p", "many"])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.apply_args(args(&["--frobnicate"])),
            Err(ConfigError::UnknownArgument(_))
        ));
    }

    #[test]
    fn test_pool_size_limits() {
        let mut config = ImporterConfig::default();
        config.num_parsers = MAX_PARSERS + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PoolSize { pool: "parser", .. })
        ));

        config.num_parsers = MAX_PARSERS;
        config.num_writers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PoolSize { pool: "writer", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_nonsense_timings() {
        let mut config = ImporterConfig::default();
        config.apdex_target_ms = 0.0;
        assert!(config.validate().is_err());

        let mut config = ImporterConfig::default();
        config.bucket_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ImporterConfig::default();
        config.write_retry.initial_delay_ms = 60_000;
        assert!(config.validate().is_err());
    }
}
