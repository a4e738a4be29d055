//! Forwarder protocol client: tails log files under a watched root, batches
//! lines per container, and pushes them to a receiver.
//!
//! Tailing watches for filesystem events via `notify` (the crate the pack's
//! `vector` example leans on for its own log-tailing source) layered under a
//! per-file byte cursor — generalized from the teacher's lack of any
//! tailing code at all. Delivery reuses the blocking `ureq` + background
//! thread shape `lifecycle::WebhookDispatcher` already established, with
//! retry/backoff added on top since, unlike a webhook, a dropped batch here
//! is an observable, counted event (spec.md §4.7, §8 property 9).

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use notify::{RecursiveMode, Watcher};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::json;

use crate::config::ForwarderConfig;
use crate::error::{LogtapError, Result};

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 5;
const CANCEL_FLUSH_BUDGET: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// One parsed line off a tailed file.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub container: String,
    pub text: String,
}

#[derive(Default)]
pub struct ForwarderStats {
    pub lines_tailed: AtomicU64,
    pub batches_sent: AtomicU64,
    pub batches_dropped: AtomicU64,
}

/// Exponential backoff with a cap, before jitter is applied. Kept separate
/// from `jittered_delay` so the progression itself is unit-testable.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE.as_millis().saturating_mul(1u128 << attempt.min(20));
    Duration::from_millis(exp.min(RETRY_CAP.as_millis()) as u64)
}

/// `backoff_delay` with ±30% jitter, per spec.md §4.7.
fn jittered_delay(attempt: u32) -> Duration {
    let base = backoff_delay(attempt).as_millis() as f64;
    let jitter = rand::thread_rng().gen_range(-0.3..=0.3);
    Duration::from_millis((base * (1.0 + jitter)).max(0.0) as u64)
}

/// Tails one or more files under a root, maintaining a per-file read cursor
/// so a poll never re-delivers bytes already consumed. Only re-arms past a
/// complete line (trailing partial writes stay unconsumed until the next
/// poll observes a newline) — the same "don't trust a torn last line"
/// discipline `reader::next_matching` uses for shard files.
struct Tailer {
    cursors: HashMap<PathBuf, u64>,
}

impl Tailer {
    fn new() -> Self {
        Tailer { cursors: HashMap::new() }
    }

    fn container_name(path: &Path) -> String {
        path.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string()
    }

    fn poll_file(&mut self, path: &Path, mut on_line: impl FnMut(LogLine)) -> std::io::Result<()> {
        let offset = *self.cursors.get(path).unwrap_or(&0);
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < offset {
            // Truncated or replaced (log rotation): re-read from the start.
            self.cursors.insert(path.to_path_buf(), 0);
            return self.poll_file(path, on_line);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        if buf.is_empty() {
            return Ok(());
        }
        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(());
        };
        let container = Self::container_name(path);
        let text = String::from_utf8_lossy(&buf[..=last_newline]);
        for line in text.lines() {
            if !line.is_empty() {
                on_line(LogLine {
                    timestamp: Utc::now(),
                    container: container.clone(),
                    text: line.to_string(),
                });
            }
        }
        self.cursors.insert(path.to_path_buf(), offset + last_newline as u64 + 1);
        Ok(())
    }
}

struct ContainerBatch {
    lines: Vec<LogLine>,
    first_seen: Instant,
}

/// Per-container batching: flush on size, elapsed time, or container-switch
/// (spec.md §4.7). The forwarder drives a single stream of tailed lines
/// through one `Batcher`, so "switch" means the immediately-preceding line
/// belonged to a different container than the one just ingested.
struct Batcher {
    batch_size: usize,
    batch_timeout: Duration,
    batches: HashMap<String, ContainerBatch>,
    last_container: Option<String>,
}

impl Batcher {
    fn new(batch_size: usize, batch_timeout: Duration) -> Self {
        Batcher {
            batch_size,
            batch_timeout,
            batches: HashMap::new(),
            last_container: None,
        }
    }

    fn ingest(&mut self, line: LogLine) -> Vec<(String, Vec<LogLine>)> {
        let mut flushed = Vec::new();
        if let Some(prev) = self.last_container.clone()
            && prev != line.container
            && let Some(batch) = self.batches.remove(&prev)
            && !batch.lines.is_empty()
        {
            flushed.push((prev, batch.lines));
        }
        self.last_container = Some(line.container.clone());

        let container = line.container.clone();
        let entry = self.batches.entry(container.clone()).or_insert_with(|| ContainerBatch {
            lines: Vec::new(),
            first_seen: Instant::now(),
        });
        entry.lines.push(line);
        if entry.lines.len() >= self.batch_size {
            let batch = self.batches.remove(&container).expect("just inserted");
            flushed.push((container, batch.lines));
        }
        flushed
    }

    /// Flushes any batch older than `batch_timeout`; call on a regular tick.
    fn flush_timed_out(&mut self) -> Vec<(String, Vec<LogLine>)> {
        let timeout = self.batch_timeout;
        let expired: Vec<String> = self
            .batches
            .iter()
            .filter(|(_, b)| b.first_seen.elapsed() >= timeout)
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| self.batches.remove(&k).map(|b| (k, b.lines)))
            .collect()
    }

    fn drain_all(&mut self) -> Vec<(String, Vec<LogLine>)> {
        self.last_container = None;
        self.batches.drain().map(|(k, b)| (k, b.lines)).collect()
    }
}

fn build_push_body(config: &ForwarderConfig, container: &str, lines: &[LogLine]) -> Vec<u8> {
    let mut stream = serde_json::Map::new();
    stream.insert("namespace".into(), json!(config.namespace));
    stream.insert("pod".into(), json!(config.pod));
    stream.insert("container".into(), json!(container));
    stream.insert("session".into(), json!(config.session));
    for (k, v) in &config.container_labels {
        stream.insert(k.clone(), json!(v));
    }
    let values: Vec<[String; 2]> = lines
        .iter()
        .map(|l| {
            let nanos = l.timestamp.timestamp_nanos_opt().unwrap_or(0);
            [nanos.to_string(), l.text.clone()]
        })
        .collect();
    let body = json!({ "streams": [ { "stream": stream, "values": values } ] });
    serde_json::to_vec(&body).unwrap_or_default()
}

fn gzip_compress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(bytes)?;
    enc.finish()
}

/// One delivery attempt, no retry. Used both as the last step of
/// `send_with_retry` and, directly, during the cancellation flush.
fn send_once(agent: &ureq::Agent, url: &str, gz_body: &[u8]) -> Result<u16> {
    let resp = agent
        .post(url)
        .header("Content-Encoding", "gzip")
        .header("Content-Type", "application/json")
        .send(gz_body)
        .map_err(|e| LogtapError::Io(e.to_string()))?;
    Ok(resp.status().as_u16())
}

fn retry_after_capped(retry_after_secs: Option<u64>) -> Duration {
    retry_after_secs.map(Duration::from_secs).unwrap_or(RETRY_CAP).min(RETRY_CAP)
}

/// Delivers one batch, retrying up to `MAX_ATTEMPTS` times total (spec.md §8
/// property 9: "a single batch is transmitted at most 5 times"). Returns
/// whether it was ultimately delivered.
fn send_with_retry(agent: &ureq::Agent, url: &str, gz_body: &[u8]) -> bool {
    for attempt in 0..MAX_ATTEMPTS {
        match agent
            .post(url)
            .header("Content-Encoding", "gzip")
            .header("Content-Type", "application/json")
            .send(gz_body)
        {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if (200..300).contains(&status) {
                    return true;
                }
                if status == 429 {
                    let retry_after = resp
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok());
                    std::thread::sleep(retry_after_capped(retry_after));
                    continue;
                }
                if status >= 500 {
                    std::thread::sleep(jittered_delay(attempt));
                    continue;
                }
                return false; // non-retryable client error
            }
            Err(_) => {
                std::thread::sleep(jittered_delay(attempt));
            }
        }
    }
    false
}

struct PendingBatch {
    body: Vec<u8>,
}

/// Delivery side of the forwarder: a bounded outbound queue drained by one
/// background sender thread, so a slow/unreachable receiver can't block the
/// tailing loop. Before `shutdown`, the sender retries with backoff; after,
/// it switches to a single best-effort attempt per batch (spec.md §4.7
/// "flush pending batches once").
pub struct Forwarder {
    config: ForwarderConfig,
    queue: Arc<Mutex<VecDeque<PendingBatch>>>,
    queue_bytes: Arc<AtomicU64>,
    stats: Arc<ForwarderStats>,
    stop: Arc<AtomicBool>,
    sender_handle: Option<std::thread::JoinHandle<()>>,
    /// Signaled by the sender thread right before it returns. `shutdown`
    /// waits on this (not `join`) so it can bound its own wait instead of
    /// blocking on however long the sender takes to notice `stop`.
    sender_done: mpsc::Receiver<()>,
}

impl Forwarder {
    pub fn spawn(config: ForwarderConfig) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .http_status_as_error(false)
            .build();
        let agent: ureq::Agent = agent_config.into();

        let queue: Arc<Mutex<VecDeque<PendingBatch>>> = Arc::new(Mutex::new(VecDeque::new()));
        let queue_bytes = Arc::new(AtomicU64::new(0));
        let stats = Arc::new(ForwarderStats::default());
        let stop = Arc::new(AtomicBool::new(false));

        let (done_tx, sender_done) = mpsc::channel();
        let sender_handle = {
            let queue = queue.clone();
            let queue_bytes = queue_bytes.clone();
            let stats = stats.clone();
            let stop = stop.clone();
            let url = config.receiver_url.clone();
            std::thread::spawn(move || {
                sender_loop(agent, url, queue, queue_bytes, stats, stop);
                let _ = done_tx.send(());
            })
        };

        Forwarder {
            config,
            queue,
            queue_bytes,
            stats,
            stop,
            sender_handle: Some(sender_handle),
            sender_done,
        }
    }

    pub fn stats(&self) -> Arc<ForwarderStats> {
        self.stats.clone()
    }

    /// Builds the push body for `(container, lines)` and enqueues it,
    /// evicting the oldest pending batch(es) first if needed to respect the
    /// memory ceiling (spec.md §4.7).
    pub fn enqueue(&self, container: &str, lines: &[LogLine]) {
        if lines.is_empty() {
            return;
        }
        let body = build_push_body(&self.config, container, lines);
        let Ok(gz) = gzip_compress(&body) else { return };
        let len = gz.len() as u64;

        let mut q = self.queue.lock();
        while self.queue_bytes.load(Ordering::Relaxed) + len > self.config.max_buffer && !q.is_empty() {
            if let Some(dropped) = q.pop_front() {
                self.queue_bytes.fetch_sub(dropped.body.len() as u64, Ordering::Relaxed);
                self.stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        q.push_back(PendingBatch { body: gz });
        self.queue_bytes.fetch_add(len, Ordering::Relaxed);
    }

    /// Signals cancellation and waits up to 3 s total for the sender to
    /// drain the queue in single-attempt mode (spec.md §4.7 "flush pending
    /// batches once... then exit"). The wait is bounded by the remaining
    /// budget, not by however long the sender actually takes: if the
    /// receiver is unresponsive the sender thread is left running detached
    /// rather than blocking this call past the budget, and whatever is
    /// still queued at the deadline is counted dropped immediately.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        let deadline = Instant::now() + CANCEL_FLUSH_BUDGET;
        let remaining = deadline.saturating_duration_since(Instant::now());

        if self.sender_handle.is_some() {
            match self.sender_done.recv_timeout(remaining) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    // The sender already returned; join is instant.
                    if let Some(handle) = self.sender_handle.take() {
                        let _ = handle.join();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!("forwarder shutdown budget exceeded, detaching sender thread");
                    self.sender_handle.take();
                }
            }
        }

        let mut q = self.queue.lock();
        if !q.is_empty() {
            self.stats.batches_dropped.fetch_add(q.len() as u64, Ordering::Relaxed);
            q.clear();
            self.queue_bytes.store(0, Ordering::Relaxed);
        }
    }
}

fn sender_loop(
    agent: ureq::Agent,
    url: String,
    queue: Arc<Mutex<VecDeque<PendingBatch>>>,
    queue_bytes: Arc<AtomicU64>,
    stats: Arc<ForwarderStats>,
    stop: Arc<AtomicBool>,
) {
    loop {
        let shutting_down = stop.load(Ordering::Acquire);
        let next = queue.lock().pop_front();
        match next {
            Some(batch) => {
                queue_bytes.fetch_sub(batch.body.len() as u64, Ordering::Relaxed);
                let delivered = if shutting_down {
                    matches!(send_once(&agent, &url, &batch.body), Ok(s) if (200..300).contains(&s))
                } else {
                    send_with_retry(&agent, &url, &batch.body)
                };
                if delivered {
                    stats.batches_sent.fetch_add(1, Ordering::Relaxed);
                } else {
                    stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                if shutting_down {
                    return;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

fn existing_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                out.push(path);
            }
        }
    }
    out
}

/// Runs the forwarder loop until `cancel` is set: tails every current and
/// future file under `config.root`, batches, and delivers. Returns the
/// final stats snapshot once the cancellation flush completes.
pub fn run(config: ForwarderConfig, cancel: Arc<AtomicBool>) -> Result<Arc<ForwarderStats>> {
    std::fs::create_dir_all(&config.root)?;

    let (tx, rx) = mpsc::channel::<notify::Event>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })
    .map_err(|e| LogtapError::Io(e.to_string()))?;
    watcher
        .watch(&config.root, RecursiveMode::Recursive)
        .map_err(|e| LogtapError::Io(e.to_string()))?;

    let forwarder = Forwarder::spawn(config.clone());
    let stats = forwarder.stats();
    let mut tailer = Tailer::new();
    let mut batcher = Batcher::new(config.batch_size, config.batch_timeout);

    let handle_line = |tailer_stats: &Arc<ForwarderStats>, batcher: &mut Batcher, line: LogLine| {
        tailer_stats.lines_tailed.fetch_add(1, Ordering::Relaxed);
        for (container, lines) in batcher.ingest(line) {
            forwarder.enqueue(&container, &lines);
        }
    };

    for path in existing_files(&config.root) {
        let _ = tailer.poll_file(&path, |line| handle_line(&stats, &mut batcher, line));
    }

    while !cancel.load(Ordering::Acquire) {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(event) => {
                for path in event.paths {
                    if path.is_file() {
                        let _ = tailer.poll_file(&path, |line| handle_line(&stats, &mut batcher, line));
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        for (container, lines) in batcher.flush_timed_out() {
            forwarder.enqueue(&container, &lines);
        }
    }

    for (container, lines) in batcher.drain_all() {
        forwarder.enqueue(&container, &lines);
    }
    forwarder.shutdown();
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn cfg() -> ForwarderConfig {
        ForwarderConfig {
            receiver_url: "http://127.0.0.1:1/push".into(),
            root: PathBuf::from("/tmp/does-not-matter"),
            namespace: "default".into(),
            pod: "web-0".into(),
            container_labels: vec![("tier".into(), "frontend".into())],
            session: "sess-1".into(),
            batch_size: 100,
            batch_timeout: Duration::from_millis(500),
            max_buffer: 16 * 1024 * 1024,
        }
    }

    fn line(container: &str, text: &str) -> LogLine {
        LogLine {
            timestamp: Utc::now(),
            container: container.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn backoff_grows_exponentially_then_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(100));
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(2), Duration::from_millis(400));
        assert_eq!(backoff_delay(10), RETRY_CAP);
    }

    #[test]
    fn jittered_delay_stays_within_thirty_percent() {
        for attempt in 0..6 {
            let base = backoff_delay(attempt).as_millis() as f64;
            for _ in 0..20 {
                let d = jittered_delay(attempt).as_millis() as f64;
                assert!(d <= base * 1.31, "attempt {attempt}: {d} > {}", base * 1.3);
            }
        }
    }

    #[test]
    fn batcher_flushes_at_size_threshold() {
        let mut b = Batcher::new(3, Duration::from_secs(500));
        assert!(b.ingest(line("app", "1")).is_empty());
        assert!(b.ingest(line("app", "2")).is_empty());
        let flushed = b.ingest(line("app", "3"));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].1.len(), 3);
    }

    #[test]
    fn batcher_flushes_on_container_switch() {
        let mut b = Batcher::new(100, Duration::from_secs(500));
        b.ingest(line("app", "1"));
        b.ingest(line("app", "2"));
        let flushed = b.ingest(line("sidecar", "1"));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].0, "app");
        assert_eq!(flushed[0].1.len(), 2);
    }

    #[test]
    fn batcher_flushes_timed_out_batches() {
        let mut b = Batcher::new(100, Duration::from_millis(1));
        b.ingest(line("app", "1"));
        std::thread::sleep(Duration::from_millis(20));
        let flushed = b.flush_timed_out();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].0, "app");
    }

    #[test]
    fn batcher_drain_all_returns_every_pending_batch() {
        let mut b = Batcher::new(100, Duration::from_secs(500));
        b.ingest(line("app", "1"));
        b.ingest(line("sidecar", "1"));
        let mut drained = b.drain_all();
        drained.sort_by(|a, z| a.0.cmp(&z.0));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, "app");
        assert_eq!(drained[1].0, "sidecar");
    }

    #[test]
    fn push_body_carries_required_labels() {
        let config = cfg();
        let body = build_push_body(&config, "app", &[line("app", "hello")]);
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let stream = &v["streams"][0]["stream"];
        assert_eq!(stream["namespace"], "default");
        assert_eq!(stream["pod"], "web-0");
        assert_eq!(stream["container"], "app");
        assert_eq!(stream["session"], "sess-1");
        assert_eq!(stream["tier"], "frontend");
        assert_eq!(v["streams"][0]["values"][0][1], "hello");
    }

    #[test]
    fn tailer_only_advances_past_complete_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        {
            let mut f = File::create(&path).unwrap();
            f.write_all(b"one\ntwo\npartial").unwrap();
        }
        let mut tailer = Tailer::new();
        let mut seen = Vec::new();
        tailer.poll_file(&path, |l| seen.push(l.text)).unwrap();
        assert_eq!(seen, vec!["one", "two"]);

        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b" more\nthree\n").unwrap();
        }
        seen.clear();
        tailer.poll_file(&path, |l| seen.push(l.text)).unwrap();
        assert_eq!(seen, vec!["partial more", "three"]);
    }

    #[test]
    fn tailer_derives_container_from_file_stem() {
        assert_eq!(Tailer::container_name(Path::new("/var/log/containers/api.log")), "api");
    }

    #[test]
    fn enqueue_evicts_oldest_batch_over_memory_ceiling() {
        let mut config = cfg();
        config.max_buffer = 64; // force eviction almost immediately
        let forwarder = Forwarder::spawn(config);
        forwarder.enqueue("app", &[line("app", &"x".repeat(200))]);
        forwarder.enqueue("app", &[line("app", &"y".repeat(200))]);
        // The queue only holds the newest batch; the first must have been
        // evicted and counted as a drop before the sender thread could send it.
        std::thread::sleep(Duration::from_millis(10));
        assert!(forwarder.stats().batches_dropped.load(Ordering::Relaxed) >= 1);
        forwarder.shutdown();
    }
}
