//! # Log and timing event importer
//!
//! Consumes backend log events and frontend page/ajax timing events from a
//! message bus, folds them into time-bucketed per-stream aggregates with
//! apdex classification, and upserts the aggregates into per-day document
//! collections.
//!
//! ## Data flow
//!
//! ```text
//! bus → intake → Parser Pool → Updater Pool → Writer Pool → Resource Pool → store
//!                    │              ▲
//!                    │              └── Tick (controller)
//!                    └── frontend timings log (optional)
//! ```
//!
//! - Parsers are interchangeable; messages are dealt round-robin
//! - Each aggregate key (stream, bucket, action) is owned by exactly one
//!   updater and always flushed through the same writer
//! - Storage handles are opened lazily per calendar day (UTC) and closed
//!   only after every in-flight write against that day has finished
//!
//! ## Module Organization
//!
//! - `types` - messages, events, aggregates, flush requests, partitioning
//! - `config` - importer settings from env and command line
//! - `streams` - stream registry, subscription pattern, apdex attributes
//! - `processor` - payload decoding, apdex classification, fold
//! - `parser` / `updater` / `writer` - the three worker pools
//! - `resources` - per-day storage handles with in-flight tracking
//! - `store`, `db`, `memory` - document store trait and backends
//! - `bus`, `reader` - message sources (channel, stdin, tailed file)
//! - `controller` - lifecycle, ticks, rollover, graceful shutdown

pub mod backoff;
pub mod bus;
pub mod config;
pub mod controller;
pub mod db;
pub mod memory;
pub mod parser;
pub mod pool;
pub mod processor;
pub mod reader;
pub mod resources;
pub mod stats;
pub mod store;
pub mod streams;
pub mod timings_log;
pub mod types;
pub mod updater;
pub mod writer;

pub use config::{ConfigError, ImporterConfig, StorageBackend};
pub use controller::{open_store, Controller, ControllerError, ShutdownReason, ShutdownReport};
pub use store::{DayCollections, DocumentStore, StoreError};
pub use streams::StreamRegistry;
pub use types::{Aggregate, AggregateKey, ApdexClass, Clock, FlushRequest, ParsedEvent, RawMessage};
