//! Capture-scoped lifecycle plumbing: the append-only audit log and the
//! webhook dispatcher.
//!
//! The audit log generalizes the teacher's `utils::debug::debug_log`
//! (lazily-opened append file, guarded by a mutex, one record per call)
//! from a human-readable debug trace gated on a debug flag to a structured
//! `serde_json` line always written for lifecycle events. The webhook
//! dispatcher reuses `ureq` the same way the teacher's
//! `utils::version_check::fetch_latest_version` does — a blocking client on
//! a background thread, since delivery here is fire-and-forget and must
//! never block the request path.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;

use crate::capture::AUDIT_FILE;
use crate::error::Result;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(3);

/// Append-only `audit.jsonl` writer. Never rotated (spec.md §4.5 assumes
/// the file stays small); the file handle is opened once and reused.
pub struct AuditLog {
    file: Mutex<File>,
}

impl AuditLog {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(AUDIT_FILE))?;
        Ok(AuditLog { file: Mutex::new(file) })
    }

    /// Appends one event. `detail` is an arbitrary JSON value merged into
    /// the record, typically `{}` or a short map of extra fields.
    pub fn record(&self, event: &str, detail: serde_json::Value) {
        let record = json!({
            "timestamp": Utc::now(),
            "event": event,
            "detail": detail,
        });
        let mut line = match serde_json::to_vec(&record) {
            Ok(v) => v,
            Err(_) => return,
        };
        line.push(b'\n');
        let mut f = self.file.lock();
        if let Err(e) = f.write_all(&line) {
            tracing::warn!(error = %e, "failed to append audit record");
        }
        let _ = f.flush();
    }
}

/// Dispatches lifecycle events to configured webhook URLs. Construction
/// takes the subset of events the operator asked for (spec.md §6.4
/// `--webhook-events`); `dispatch` is a no-op if the event isn't in that
/// set.
pub struct WebhookDispatcher {
    urls: Vec<String>,
    events: Vec<String>,
    dir: PathBuf,
    agent: ureq::Agent,
}

impl WebhookDispatcher {
    pub fn new(urls: Vec<String>, events: Vec<String>, dir: PathBuf) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(WEBHOOK_TIMEOUT))
            .build();
        WebhookDispatcher {
            urls,
            events,
            dir,
            agent: config.into(),
        }
    }

    fn wants(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event || e == "all")
    }

    /// Fire-and-forget: spawns a background thread per configured URL,
    /// each posting `{event, dir, detail?, stats?}` with a 3 s timeout and
    /// at-most-one retry. Never blocks the caller and never propagates
    /// delivery failures — they are logged and, by the caller, counted.
    pub fn dispatch(&self, event: &str, detail: Option<serde_json::Value>, stats: Option<serde_json::Value>) {
        if self.urls.is_empty() || !self.wants(event) {
            return;
        }
        let payload = json!({
            "event": event,
            "dir": self.dir.display().to_string(),
            "detail": detail,
            "stats": stats,
        });
        for url in self.urls.clone() {
            let agent = self.agent.clone();
            let payload = payload.clone();
            std::thread::spawn(move || {
                post_with_one_retry(&agent, &url, &payload);
            });
        }
    }
}

fn post_with_one_retry(agent: &ureq::Agent, url: &str, payload: &serde_json::Value) {
    for attempt in 0..2 {
        match agent.post(url).send_json(payload.clone()) {
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(url, attempt, error = %e, "webhook delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path()).unwrap();
        log.record("server_started", json!({}));
        log.record("server_stopped", json!({"lines": 10}));

        let content = std::fs::read_to_string(dir.path().join(AUDIT_FILE)).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "server_started");
    }

    #[test]
    fn dispatcher_skips_unconfigured_events() {
        let dispatcher = WebhookDispatcher::new(vec![], vec!["rotation".to_string()], PathBuf::from("/tmp"));
        // No urls configured: dispatch must be a cheap no-op, not panic or block.
        dispatcher.dispatch("rotation", None, None);
    }

    #[test]
    fn wants_respects_event_filter_and_all() {
        let d = WebhookDispatcher::new(vec!["http://x".into()], vec!["rotation".into()], PathBuf::from("/tmp"));
        assert!(d.wants("rotation"));
        assert!(!d.wants("disk-warning"));
        let d_all = WebhookDispatcher::new(vec!["http://x".into()], vec!["all".into()], PathBuf::from("/tmp"));
        assert!(d_all.wants("disk-warning"));
    }
}
