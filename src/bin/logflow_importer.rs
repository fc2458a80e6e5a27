//! Logflow Importer - production runtime
//!
//! Reads bus envelopes (JSONL, one per line) from stdin or a tailed file,
//! aggregates them and writes per-day document collections.
//!
//! Usage:
//!   logflow_importer [-n] [-v|-q] [-p N] [-u N] [-w N] [-s PATTERN]
//!                    [-c streams.json] [-f frontend.jsonl] [-a ATTRIBUTE]
//!                    [-i INPUT] [-d DATA_DIR] [-b sqlite|memory]
//!
//! Every flag has a `LOGFLOW_*` environment counterpart (see
//! `ImporterConfig::from_env`); flags win over the environment.

use dotenv::dotenv;
use log::{error, info, warn};
use logflow::pipeline::bus::JsonlSource;
use logflow::pipeline::config::{ConfigError, ImporterConfig, InputSource};
use logflow::pipeline::{open_store, Clock, Controller, StreamRegistry};
use std::env;

const USAGE: &str = "\
usage: logflow_importer [options]

  -n, --dry-run              parse and aggregate, log writes instead of storing
  -v, --verbose              debug logging
  -q, --quiet                warnings and errors only
  -p, --parsers N            parser workers (1-64)
  -u, --updaters N           updater workers (1-64)
  -w, --writers N            writer workers (1-64)
  -s, --subscribe PATTERN    stream subscription (substring or glob)
  -c, --config PATH          stream definitions file
  -f, --frontend-log PATH    append frontend timing events to PATH
  -a, --apdex-attribute NAME apdex attribute for every stream
  -i, --input PATH           read envelopes from PATH (tail), '-' for stdin
  -d, --data-dir PATH        directory of the per-day databases
  -b, --backend NAME         sqlite or memory";

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("⚠️  Received SIGTERM, shutting down..."),
                    result = tokio::signal::ctrl_c() => match result {
                        Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
                        Err(e) => error!("❌ Failed to listen for CTRL+C: {}", e),
                    },
                }
                return;
            }
            Err(e) => warn!("⚠️  SIGTERM handler unavailable: {}", e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
        Err(e) => {
            error!("❌ Failed to listen for CTRL+C: {}", e);
            // Without a signal handler, run until the input ends
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();

    let config = match ImporterConfig::load(env::args().skip(1)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("logflow_importer: {}", e);
            if matches!(
                e,
                ConfigError::MissingArgument(_) | ConfigError::UnknownArgument(_)
            ) {
                eprintln!("{}", USAGE);
            }
            std::process::exit(2);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level().to_string()),
    )
    .init();

    info!("🚀 Logflow Importer");
    info!("   ├─ Version: {}", env!("CARGO_PKG_VERSION"));
    info!("   ├─ Streams file: {}", config.config_path().display());
    info!(
        "   └─ Mode: {}",
        if config.dry_run { "dry run" } else { "live" }
    );

    let registry = match StreamRegistry::load(config.config_path(), &config.subscription_pattern) {
        Ok(registry) => registry,
        Err(e) => {
            error!("❌ Failed to load stream definitions: {}", e);
            std::process::exit(1);
        }
    };
    if registry.is_empty() {
        warn!(
            "⚠️  No stream matches subscription '{}'; every message will be dropped",
            config.subscription_pattern
        );
    } else {
        info!("✅ Subscribed to {} streams", registry.len());
    }

    let store = match open_store(&config) {
        Ok(store) => store,
        Err(e) => {
            error!("❌ Failed to initialize storage: {}", e);
            std::process::exit(1);
        }
    };

    let source = match &config.input {
        InputSource::Stdin => JsonlSource::stdin(),
        InputSource::File(path) => JsonlSource::tail(path.clone()),
    };

    let controller = match Controller::new(config, registry, store, Clock::system()) {
        Ok(controller) => controller,
        Err(e) => {
            error!("❌ {}", e);
            std::process::exit(1);
        }
    };

    info!("🔄 Press CTRL+C to shutdown gracefully");
    match controller.run(source, shutdown_signal()).await {
        Ok(report) => std::process::exit(report.exit_code()),
        Err(e) => {
            error!("❌ Importer failed to start: {}", e);
            std::process::exit(1);
        }
    }
}
