//! `forwarder`: the client-side half of the forwarder protocol (spec.md
//! §4.7) — tails a directory of container log files and ships batches to a
//! `recv` instance. Deliberately thin: flag parsing and wiring only, no
//! sidecar-injection logic (that belongs outside this core).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use logtap::config::{ForwarderConfig, RawForwarderArgs};
use logtap::error::LogtapError;
use logtap::forward;

#[derive(Parser, Debug)]
#[command(name = "forwarder", about = "Tails container logs and forwards them to a logtap receiver")]
struct Cli {
    #[arg(long = "receiver-url")]
    receiver_url: Option<String>,
    #[arg(long)]
    root: Option<PathBuf>,
    #[arg(long)]
    namespace: Option<String>,
    #[arg(long)]
    pod: Option<String>,
    #[arg(long = "container-labels")]
    container_labels: Option<String>,
    #[arg(long)]
    session: Option<String>,
    #[arg(long = "batch-size")]
    batch_size: Option<usize>,
    #[arg(long = "batch-timeout")]
    batch_timeout: Option<String>,
    #[arg(long = "max-buffer")]
    max_buffer: Option<String>,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[arg(long)]
    json: bool,
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::{fmt, EnvFilter};
    let default_directive = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    fmt().with_env_filter(filter).with_target(false).init();
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
        eprintln!("forwarder: {err:#}");
    }
    std::process::exit(kind.map(|k| k.exit_code()).unwrap_or(2));
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_errors = cli.json;

    let raw = RawForwarderArgs {
        receiver_url: cli.receiver_url,
        root: cli.root,
        namespace: cli.namespace,
        pod: cli.pod,
        container_labels: cli.container_labels,
        session: cli.session,
        batch_size: cli.batch_size,
        batch_timeout: cli.batch_timeout,
        max_buffer: cli.max_buffer,
    };

    let config = match ForwarderConfig::resolve(raw) {
        Ok(c) => c,
        Err(e) => exit_with(e.into(), json_errors),
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_signal = cancel.clone();
    if let Err(e) = ctrlc_handler(move || {
        cancel_signal.store(true, Ordering::Release);
    }) {
        tracing::warn!(error = %e, "failed to install signal handler, Ctrl+C will not flush pending batches");
    }

    tracing::info!(root = %config.root.display(), receiver = %config.receiver_url, "forwarder starting");

    match forward::run(config, cancel) {
        Ok(stats) => {
            tracing::info!(
                lines = stats.lines_tailed.load(Ordering::Relaxed),
                sent = stats.batches_sent.load(Ordering::Relaxed),
                dropped = stats.batches_dropped.load(Ordering::Relaxed),
                "forwarder stopped"
            );
            std::process::exit(130);
        }
        Err(e) => exit_with(e.into(), json_errors),
    }
}

/// Installs a Ctrl+C/SIGTERM handler for this otherwise fully synchronous
/// binary. Rather than add a signal-handling crate the rest of the pack
/// never reaches for, this spins up a single-threaded `tokio` runtime (a
/// dependency the workspace already carries for `recv`) on a background
/// thread purely to await `tokio::signal`.
fn ctrlc_handler(on_signal: impl Fn() + Send + 'static) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("signal-wait".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to start signal-waiting runtime");
                    return;
                }
            };
            rt.block_on(async {
                let ctrl_c = async {
                    let _ = tokio::signal::ctrl_c().await;
                };
                #[cfg(unix)]
                let terminate = async {
                    if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                        sig.recv().await;
                    }
                };
                #[cfg(not(unix))]
                let terminate = std::future::pending::<()>();
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = terminate => {}
                }
            });
            on_signal();
        })
        .map(|_| ())
}
