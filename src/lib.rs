//! logtap - an ephemeral log-mirroring receiver, on-disk capture format,
//! and forwarder, built for load-testing and incident capture.
//!
//! ## Architecture
//!
//! - `config`: flag/env resolution for both binaries (`Config`, `ForwarderConfig`).
//! - `model`: the shared data types (`LogEntry`, `Shard`, `Metadata`, `Filter`).
//! - `redact`: compiled PII redaction patterns applied before a line is written.
//! - `rotate`: shard lifecycle - naming, size/disk-cap enforcement, compression.
//! - `write`: the bounded producer/consumer queue feeding the rotator.
//! - `capture`: the small framing files (`metadata.json`, `index.jsonl`, `audit.jsonl`).
//! - `reader`: opens a capture directory and streams entries back out, filtered and merged.
//! - `ingest`: the HTTP push/metrics/health surface (`axum`).
//! - `metrics`: the Prometheus registry shared by the ingest server.
//! - `lifecycle`: the audit log and webhook dispatcher.
//! - `forward`: the forwarder protocol client (tailing, batching, delivery).

pub mod capture;
pub mod config;
pub mod error;
pub mod forward;
pub mod ingest;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod reader;
pub mod redact;
pub mod rotate;
pub mod write;
