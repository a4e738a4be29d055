//! Configuration resolution.
//!
//! One immutable [`Config`] value is built once at process start from CLI
//! flags, with an environment-variable fallback under a `LOGTAP_` prefix,
//! then the built-in default. No component ever consults a global config
//! object after construction — each owns only the fields it needs.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{LogtapError, Result};

/// Parse size strings like "5KB", "10MB", "1GB" into bytes.
///
/// Case-insensitive, 1024-base, optional decimal point (e.g. "1.5GB").
/// Generalizes the teacher's `backend::rotation::parse_size_limit`, which
/// only accepted integers; the capture rotator needs fractional sizes for
/// flags like `--max-file 1.5GB`.
pub fn parse_size(size_str: &str) -> Option<u64> {
    let s = size_str.trim();
    if s.is_empty() {
        return None;
    }

    let split_at = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    if split_at == 0 {
        return None;
    }

    let (num_str, unit) = s.split_at(split_at);
    let unit = unit.trim().to_uppercase();
    let multiplier: f64 = match unit.as_str() {
        "B" | "" => 1.0,
        "KB" | "K" => 1024.0,
        "MB" | "M" => 1024.0 * 1024.0,
        "GB" | "G" => 1024.0 * 1024.0 * 1024.0,
        "TB" | "T" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };

    num_str.parse::<f64>().ok().map(|n| (n * multiplier) as u64)
}

/// Parse durations like "7d", "24h", "30m" — the day suffix means 24h, not
/// a calendar day.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let split_at = s.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    if split_at == 0 {
        return None;
    }
    let (num_str, unit) = s.split_at(split_at);
    let n: f64 = num_str.parse().ok()?;
    let secs = match unit {
        "d" => n * 86_400.0,
        "h" => n * 3_600.0,
        "m" => n * 60.0,
        "s" => n,
        _ => return None,
    };
    Some(Duration::from_secs_f64(secs))
}

fn env_or<T>(key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    std::env::var(key).ok().and_then(|v| parse(&v))
}

/// Resolved configuration for the `recv` ingest server.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub dir: PathBuf,
    pub max_file: u64,
    pub max_disk: u64,
    pub compress: bool,
    pub redact: Vec<String>,
    pub redact_patterns: Option<PathBuf>,
    pub buffer: usize,
    pub headless: bool,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub webhook: Vec<String>,
    pub webhook_events: Vec<String>,
}

/// Raw CLI flags, one field per flag in spec.md §6.4. Kept separate from
/// `Config` so `clap` can own the argument surface while resolution (env
/// fallback, validation, defaulting) stays in one place.
#[derive(Debug, Clone, Default)]
pub struct RawArgs {
    pub listen: Option<String>,
    pub dir: Option<PathBuf>,
    pub max_file: Option<String>,
    pub max_disk: Option<String>,
    pub compress: bool,
    pub redact: Option<String>,
    pub redact_patterns: Option<PathBuf>,
    pub buffer: Option<usize>,
    pub headless: bool,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub webhook: Vec<String>,
    pub webhook_events: Vec<String>,
}

impl Config {
    /// Resolve precedence: explicit CLI arg > `LOGTAP_*` env var > built-in
    /// default. Validates invariants (per spec.md §9 Open Question 1:
    /// `max_file < max_disk` is enforced here rather than left to the
    /// rotator to discover at runtime).
    pub fn resolve(args: RawArgs) -> Result<Config> {
        let listen = args
            .listen
            .or_else(|| std::env::var("LOGTAP_LISTEN").ok())
            .unwrap_or_else(|| ":3100".to_string());

        let dir = args
            .dir
            .or_else(|| std::env::var("LOGTAP_DIR").ok().map(PathBuf::from))
            .ok_or_else(|| LogtapError::config("--dir is required"))?;

        let max_file = args
            .max_file
            .as_deref()
            .and_then(parse_size)
            .or_else(|| env_or("LOGTAP_MAX_FILE", parse_size))
            .unwrap_or(256 * 1024 * 1024);

        let max_disk = args
            .max_disk
            .as_deref()
            .and_then(parse_size)
            .or_else(|| env_or("LOGTAP_MAX_DISK", parse_size))
            .unwrap_or(50 * 1024 * 1024 * 1024);

        if max_file >= max_disk {
            return Err(LogtapError::config(format!(
                "max-file ({max_file}) must be smaller than max-disk ({max_disk})"
            )));
        }

        let redact = match args.redact.or_else(|| std::env::var("LOGTAP_REDACT").ok()) {
            Some(ref s) if s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("all") => {
                vec!["all".to_string()]
            }
            Some(s) if !s.is_empty() => s.split(',').map(|p| p.trim().to_string()).collect(),
            _ => Vec::new(),
        };

        let buffer = args
            .buffer
            .or_else(|| env_or("LOGTAP_BUFFER", |s| s.parse().ok()))
            .unwrap_or(65536);

        if let (Some(cert), None) | (None, Some(cert)) = (&args.tls_cert, &args.tls_key) {
            let _ = cert;
            return Err(LogtapError::config(
                "both --tls-cert and --tls-key must be set together",
            ));
        }

        Ok(Config {
            listen,
            dir,
            max_file,
            max_disk,
            compress: args.compress,
            redact,
            redact_patterns: args.redact_patterns,
            buffer,
            headless: args.headless,
            tls_cert: args.tls_cert,
            tls_key: args.tls_key,
            webhook: args.webhook,
            webhook_events: args.webhook_events,
        })
    }
}

/// Resolved configuration for the `forwarder` binary (spec.md §4.7,
/// SPEC_FULL.md §6.4).
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub receiver_url: String,
    pub root: PathBuf,
    pub namespace: String,
    pub pod: String,
    pub container_labels: Vec<(String, String)>,
    pub session: String,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_buffer: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RawForwarderArgs {
    pub receiver_url: Option<String>,
    pub root: Option<PathBuf>,
    pub namespace: Option<String>,
    pub pod: Option<String>,
    pub container_labels: Option<String>,
    pub session: Option<String>,
    pub batch_size: Option<usize>,
    pub batch_timeout: Option<String>,
    pub max_buffer: Option<String>,
}

fn parse_label_pairs(s: &str) -> Result<Vec<(String, String)>> {
    s.split(',')
        .filter(|p| !p.trim().is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| LogtapError::config(format!("malformed label pair: {pair}")))
        })
        .collect()
}

impl ForwarderConfig {
    pub fn resolve(args: RawForwarderArgs) -> Result<ForwarderConfig> {
        let receiver_url = args
            .receiver_url
            .ok_or_else(|| LogtapError::config("--receiver-url is required"))?;
        let root = args.root.ok_or_else(|| LogtapError::config("--root is required"))?;
        let namespace = args
            .namespace
            .ok_or_else(|| LogtapError::config("--namespace is required"))?;
        let pod = args.pod.ok_or_else(|| LogtapError::config("--pod is required"))?;
        let session = args
            .session
            .ok_or_else(|| LogtapError::config("--session is required"))?;
        let container_labels = match args.container_labels {
            Some(s) => parse_label_pairs(&s)?,
            None => Vec::new(),
        };
        let batch_size = args.batch_size.unwrap_or(100);
        let batch_timeout = args
            .batch_timeout
            .as_deref()
            .map(|s| parse_duration(s).ok_or_else(|| LogtapError::config(format!("bad --batch-timeout: {s}"))))
            .transpose()?
            .unwrap_or(Duration::from_millis(500));
        let max_buffer = args
            .max_buffer
            .as_deref()
            .map(|s| parse_size(s).ok_or_else(|| LogtapError::config(format!("bad --max-buffer: {s}"))))
            .transpose()?
            .unwrap_or(16 * 1024 * 1024);

        Ok(ForwarderConfig {
            receiver_url,
            root,
            namespace,
            pod,
            container_labels,
            session,
            batch_size,
            batch_timeout,
            max_buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_units() {
        assert_eq!(parse_size("100"), Some(100));
        assert_eq!(parse_size("100B"), Some(100));
        assert_eq!(parse_size("5KB"), Some(5120));
        assert_eq!(parse_size("10mb"), Some(10 * 1024 * 1024));
        assert_eq!(parse_size("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("1.5GB"), Some((1.5 * 1024.0 * 1024.0 * 1024.0) as u64));
        assert_eq!(parse_size("invalid"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("7d"), Some(Duration::from_secs(7 * 86_400)));
        assert_eq!(parse_duration("24h"), Some(Duration::from_secs(24 * 3_600)));
        assert_eq!(parse_duration("30m"), Some(Duration::from_secs(30 * 60)));
        assert_eq!(parse_duration("bogus"), None);
    }

    #[test]
    fn rejects_max_file_ge_max_disk() {
        let args = RawArgs {
            dir: Some(PathBuf::from("/tmp/x")),
            max_file: Some("10MB".into()),
            max_disk: Some("5MB".into()),
            ..Default::default()
        };
        let err = Config::resolve(args).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn requires_dir() {
        let args = RawArgs::default();
        assert!(Config::resolve(args).is_err());
    }

    #[test]
    fn env_fallback_for_listen() {
        // SAFETY: test-only, single-threaded env mutation guarded by serial test execution
        // within this process is not guaranteed, so scope the var narrowly and restore it.
        unsafe { std::env::set_var("LOGTAP_LISTEN", ":9999") };
        let args = RawArgs {
            dir: Some(PathBuf::from("/tmp/x")),
            ..Default::default()
        };
        let cfg = Config::resolve(args).unwrap();
        assert_eq!(cfg.listen, ":9999");
        unsafe { std::env::remove_var("LOGTAP_LISTEN") };
    }

    fn forwarder_args() -> RawForwarderArgs {
        RawForwarderArgs {
            receiver_url: Some("http://localhost:3100/loki/api/v1/push".into()),
            root: Some(PathBuf::from("/var/log/containers")),
            namespace: Some("default".into()),
            pod: Some("web-0".into()),
            session: Some("sess-1".into()),
            ..Default::default()
        }
    }

    #[test]
    fn forwarder_config_defaults() {
        let cfg = ForwarderConfig::resolve(forwarder_args()).unwrap();
        assert_eq!(cfg.batch_size, 100);
        assert_eq!(cfg.batch_timeout, Duration::from_millis(500));
        assert_eq!(cfg.max_buffer, 16 * 1024 * 1024);
        assert!(cfg.container_labels.is_empty());
    }

    #[test]
    fn forwarder_config_parses_container_labels() {
        let mut args = forwarder_args();
        args.container_labels = Some("tier=frontend,team=payments".into());
        let cfg = ForwarderConfig::resolve(args).unwrap();
        assert_eq!(
            cfg.container_labels,
            vec![("tier".to_string(), "frontend".to_string()), ("team".to_string(), "payments".to_string())]
        );
    }

    #[test]
    fn forwarder_config_rejects_malformed_label() {
        let mut args = forwarder_args();
        args.container_labels = Some("not-a-pair".into());
        assert!(ForwarderConfig::resolve(args).is_err());
    }

    #[test]
    fn forwarder_config_requires_receiver_url() {
        let mut args = forwarder_args();
        args.receiver_url = None;
        assert!(ForwarderConfig::resolve(args).is_err());
    }
}
