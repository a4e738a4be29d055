//! `recv`: the logtap ingest server.
//!
//! Thin CLI wrapper: parse flags, resolve [`Config`], wire the rotator /
//! writer / redactor / metrics / lifecycle components together, serve HTTP
//! (or HTTPS, per `axum_server`'s `tls-rustls` feature, the pack's
//! established TLS-serving crate) until shutdown, then rewrite the final
//! `metadata.json`. Exit codes follow spec.md §6.4 via `ErrorKind::exit_code`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tokio::sync::Semaphore;

use logtap::capture;
use logtap::config::{Config, RawArgs};
use logtap::error::LogtapError;
use logtap::ingest::{self, AppState};
use logtap::lifecycle::{AuditLog, WebhookDispatcher};
use logtap::metrics::Metrics;
use logtap::model::{Metadata, RedactionMeta};
use logtap::redact::Redactor;
use logtap::rotate::{dir_disk_usage, Rotator};
use logtap::write::Writer;

#[derive(Parser, Debug)]
#[command(name = "recv", about = "Ephemeral log-mirroring receiver and capture format")]
struct Cli {
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    dir: Option<PathBuf>,
    #[arg(long = "max-file")]
    max_file: Option<String>,
    #[arg(long = "max-disk")]
    max_disk: Option<String>,
    #[arg(long)]
    compress: bool,
    #[arg(long)]
    redact: Option<String>,
    #[arg(long = "redact-patterns")]
    redact_patterns: Option<PathBuf>,
    #[arg(long)]
    buffer: Option<usize>,
    #[arg(long)]
    headless: bool,
    #[arg(long = "tls-cert")]
    tls_cert: Option<PathBuf>,
    #[arg(long = "tls-key")]
    tls_key: Option<PathBuf>,
    #[arg(long = "webhook")]
    webhook: Vec<String>,
    #[arg(long = "webhook-events")]
    webhook_events: Vec<String>,
    /// Increase log verbosity; repeatable (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Suppress all but error-level logs.
    #[arg(short, long)]
    quiet: bool,
    /// Emit startup failures as `{"error":{"kind":...,"message":...}}`.
    #[arg(long)]
    json: bool,
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::{fmt, EnvFilter};
    let default_directive = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn parse_listen(s: &str) -> anyhow::Result<SocketAddr> {
    let full = match s.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => s.to_string(),
    };
    full.parse::<SocketAddr>()
        .with_context(|| format!("invalid --listen address: {s}"))
}

fn stats_json(writer: &Writer, dir: &std::path::Path, max_disk: u64) -> serde_json::Value {
    serde_json::json!({
        "linesWritten": writer.lines_written(),
        "bytesWritten": writer.bytes_written(),
        "diskUsage": dir_disk_usage(dir),
        "diskCap": max_disk,
    })
}

fn exit_with(err: anyhow::Error, json: bool) -> ! {
    let kind = err.downcast_ref::<LogtapError>().map(|e| e.kind());
    if json {
        let body = serde_json::json!({
            "error": {
                "kind": kind.map(|k| k.as_str()).unwrap_or("io_error"),
                "message": err.to_string(),
            }
        });
        eprintln!("{body}");
    } else {
        eprintln!("recv: {err:#}");
    }
    std::process::exit(kind.map(|k| k.exit_code()).unwrap_or(2));
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    let json_errors = cli.json;

    match run(cli).await {
        // The only clean exit path is a shutdown signal (Ctrl+C/SIGTERM);
        // there is no other trigger that stops the server loop.
        Ok(()) => std::process::exit(130),
        Err(e) => exit_with(e, json_errors),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let raw = RawArgs {
        listen: cli.listen,
        dir: cli.dir,
        max_file: cli.max_file,
        max_disk: cli.max_disk,
        compress: cli.compress,
        redact: cli.redact,
        redact_patterns: cli.redact_patterns,
        buffer: cli.buffer,
        headless: cli.headless,
        tls_cert: cli.tls_cert,
        tls_key: cli.tls_key,
        webhook: cli.webhook,
        webhook_events: cli.webhook_events,
    };
    let config = Config::resolve(raw)?;
    let addr = parse_listen(&config.listen)?;

    let metrics = Arc::new(Metrics::new(env!("CARGO_PKG_VERSION")));

    let redact_metrics = metrics.clone();
    let redactor = Redactor::new(&config.redact, config.redact_patterns.as_deref())?
        .with_hook(move |pattern| redact_metrics.redactions_total.with_label_values(&[pattern]).inc());

    let audit = Arc::new(AuditLog::open(&config.dir)?);
    let webhooks = Arc::new(WebhookDispatcher::new(
        config.webhook.clone(),
        config.webhook_events.clone(),
        config.dir.clone(),
    ));

    let mut initial_meta = Metadata::new(chrono::Utc::now());
    if redactor.is_enabled() {
        initial_meta.redaction = Some(RedactionMeta {
            enabled: true,
            patterns: redactor.pattern_names().to_vec(),
        });
    }
    capture::write_initial_metadata(&config.dir, &initial_meta)?;
    audit.record("server_started", serde_json::json!({"listen": config.listen}));
    webhooks.dispatch("start", None, None);

    let degraded = Arc::new(AtomicBool::new(false));

    let rotator = {
        let metrics = metrics.clone();
        let audit = audit.clone();
        let webhooks = webhooks.clone();
        let degraded = degraded.clone();
        let metrics_warn = metrics.clone();
        let metrics_err = metrics.clone();
        let webhooks_warn = webhooks.clone();
        Rotator::new(config.dir.clone(), config.max_file, config.max_disk, config.compress)?
            .on_rotate(move |reason| {
                metrics.rotations_total.with_label_values(&[reason]).inc();
                audit.record("rotation", serde_json::json!({"reason": reason}));
                webhooks.dispatch("rotation", Some(serde_json::json!({"reason": reason})), None);
            })
            .on_error(move |err| {
                degraded.store(true, Ordering::Release);
                metrics_err.rotation_errors_total.inc();
                tracing::error!(error = %err, "rotator error, entering degraded mode");
                webhooks_warn.dispatch("error", Some(serde_json::json!({"message": err.to_string()})), None);
            })
            .on_disk_warning(move |used, cap| {
                metrics_warn.disk_usage_bytes.set(used as i64);
                tracing::warn!(used, cap, "disk usage warning threshold crossed");
                webhooks_warn.dispatch(
                    "disk-warning",
                    Some(serde_json::json!({"used": used, "cap": cap})),
                    None,
                );
            })
    };

    let queue_gauge_metrics = metrics.clone();
    let bytes_metrics = metrics.clone();
    let writer = Writer::spawn(
        rotator,
        config.buffer,
        move |len| {
            queue_gauge_metrics.writer_queue_length.set(len as i64);
        },
        move |bytes| {
            bytes_metrics.bytes_written_total.inc_by(bytes);
        },
    );

    let state = Arc::new(AppState {
        writer: writer.clone(),
        redactor,
        metrics,
        audit: audit.clone(),
        webhooks: webhooks.clone(),
        degraded: AtomicBool::new(false),
        ready: AtomicBool::new(true),
        push_semaphore: Semaphore::new(AppState::permits(config.buffer)),
    });
    let total_permits = AppState::permits(config.buffer);

    let app = ingest::router(state.clone());

    tracing::info!(listen = %addr, dir = %config.dir.display(), "recv starting");

    let shutdown = shutdown_signal();
    if let (Some(cert), Some(key)) = (&config.tls_cert, &config.tls_key) {
        let tls = RustlsConfig::from_pem_file(cert, key)
            .await
            .with_context(|| "failed to load TLS cert/key")?;
        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown.await;
            shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
        });
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .with_context(|| "server error")?;
    } else {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .with_context(|| "server error")?;
    }

    ingest::drain(&state, total_permits).await;
    writer.close();

    let mut final_meta = initial_meta;
    final_meta.stopped = chrono::Utc::now();
    final_meta.total_lines = writer.lines_written();
    final_meta.total_bytes = writer.bytes_written();
    final_meta.labels_seen = writer.labels_seen();
    capture::rewrite_metadata_on_shutdown(&config.dir, &final_meta)?;

    audit.record(
        "server_stopped",
        serde_json::json!({"linesWritten": writer.lines_written()}),
    );
    webhooks.dispatch(
        "stop",
        None,
        Some(stats_json(&writer, &config.dir, config.max_disk)),
    );

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining");
}
