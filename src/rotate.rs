//! Shard rotation, compression, disk-cap eviction, and the on-disk index.
//!
//! Grounded on the teacher's `backend::file::SimpleRollingWriter` (time/size
//! rotation, a single owned `File` handle, rotate-then-reopen) and
//! `backend::file::prune_old_files` (retention by walking the directory and
//! deleting the oldest matches) — generalized here from a log-rotation
//! writer into a capture shard rotator: periods become a monotonic counter
//! rather than a calendar bucket, and retention becomes a disk-byte cap
//! rather than a file count.

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::capture;
use crate::error::{LogtapError, Result};
use crate::model::{IndexEntry, LabelHistogram, LogEntry, Shard};

const WARN_HIGH: f64 = 0.95;
const WARN_LOW: f64 = 0.80;
const HYSTERESIS: f64 = 0.05;

struct OpenShard {
    file: File,
    path: PathBuf,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    lines: u64,
    bytes: u64,
    labels: LabelHistogram,
}

#[derive(Default)]
struct DiskWarnState {
    warned_80: bool,
    warned_95: bool,
}

impl DiskWarnState {
    /// Returns `Some(threshold)` the first time `ratio` crosses 0.80 or
    /// 0.95, `None` otherwise. Each threshold re-arms only once `ratio`
    /// falls below `threshold - HYSTERESIS` (spec.md §4.2).
    fn update(&mut self, ratio: f64) -> Option<f64> {
        let mut fired = None;
        if ratio >= WARN_HIGH && !self.warned_95 {
            self.warned_95 = true;
            self.warned_80 = true;
            fired = Some(WARN_HIGH);
        } else if ratio >= WARN_LOW && !self.warned_80 {
            self.warned_80 = true;
            fired = Some(WARN_LOW);
        }
        if ratio < WARN_HIGH - HYSTERESIS {
            self.warned_95 = false;
        }
        if ratio < WARN_LOW - HYSTERESIS {
            self.warned_80 = false;
        }
        fired
    }
}

/// Owns the currently-open shard file plus the in-memory mirror of
/// `index.jsonl`. Not `Sync`; the writer's consumer thread is the sole
/// owner and calls in are always `&mut self`.
pub struct Rotator {
    dir: PathBuf,
    max_file: u64,
    max_disk: u64,
    compress: bool,
    current: Option<OpenShard>,
    index: Vec<IndexEntry>,
    counter: u32,
    warn_state: DiskWarnState,
    on_rotate: Option<Box<dyn Fn(&str) + Send + Sync>>,
    on_error: Option<Box<dyn Fn(&LogtapError) + Send + Sync>>,
    on_disk_warning: Option<Box<dyn Fn(u64, u64) + Send + Sync>>,
}

impl Rotator {
    pub fn new(dir: PathBuf, max_file: u64, max_disk: u64, compress: bool) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Rotator {
            dir,
            max_file,
            max_disk,
            compress,
            current: None,
            index: Vec::new(),
            counter: 0,
            warn_state: DiskWarnState::default(),
            on_rotate: None,
            on_error: None,
            on_disk_warning: None,
        })
    }

    pub fn on_rotate(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_rotate = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&LogtapError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_disk_warning(mut self, f: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        self.on_disk_warning = Some(Box::new(f));
        self
    }

    pub fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    fn shard_name(&self, first_ts: DateTime<Utc>) -> String {
        format!("{}-{:03}.jsonl", first_ts.format("%Y-%m-%dT%H%M%S"), self.counter)
    }

    fn ensure_open(&mut self, first_ts: DateTime<Utc>) -> Result<()> {
        if self.current.is_some() {
            return Ok(());
        }
        let name = self.shard_name(first_ts);
        let path = self.dir.join(&name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        self.current = Some(OpenShard {
            file,
            path,
            from: None,
            to: None,
            lines: 0,
            bytes: 0,
            labels: LabelHistogram::default(),
        });
        Ok(())
    }

    /// Updates in-memory bookkeeping for the open shard. Must be called
    /// before the corresponding `write_line` for the same entry so the
    /// shard's first-seen timestamp is known at file-creation time.
    pub fn track_line(&mut self, entry: &LogEntry) -> Result<()> {
        self.ensure_open(entry.timestamp)?;
        let shard = self.current.as_mut().expect("ensure_open just populated this");
        if shard.from.is_none() {
            shard.from = Some(entry.timestamp);
        }
        shard.to = Some(entry.timestamp);
        shard.lines += 1;
        shard.labels.record(&entry.labels);
        Ok(())
    }

    /// Appends one already-serialized JSON line (without trailing newline)
    /// to the open shard, then rotates if the size trigger fires.
    pub fn write_line(&mut self, line: &[u8]) -> Result<()> {
        let result = (|| -> Result<()> {
            let shard = self
                .current
                .as_mut()
                .ok_or_else(|| LogtapError::format("write_line called before track_line"))?;
            shard.file.write_all(line)?;
            shard.file.write_all(b"\n")?;
            shard.bytes += line.len() as u64 + 1;
            Ok(())
        })();

        if let Err(e) = &result {
            if let Some(hook) = &self.on_error {
                hook(e);
            }
            return result;
        }

        let exceeded = self
            .current
            .as_ref()
            .is_some_and(|s| s.bytes > self.max_file);
        if exceeded {
            self.close("size")?;
        }
        Ok(())
    }

    /// Flushes, closes, optionally compresses, and indexes the current
    /// shard. A no-op if no shard is open. `reason` is forwarded to
    /// `OnRotate` verbatim ("size" for an automatic trigger, "shutdown" for
    /// the final close at process exit).
    pub fn close(&mut self, reason: &str) -> Result<()> {
        let Some(mut shard) = self.current.take() else {
            return Ok(());
        };

        let close_result = (|| -> Result<IndexEntry> {
            shard.file.flush()?;
            drop(shard.file);

            let (final_path, compressed) = if self.compress {
                match compress_shard(&shard.path) {
                    Ok(p) => (p, true),
                    Err(e) => {
                        if let Some(hook) = &self.on_error {
                            hook(&e);
                        }
                        (shard.path.clone(), false)
                    }
                }
            } else {
                (shard.path.clone(), false)
            };

            let from = shard.from.unwrap_or_else(Utc::now);
            let to = shard.to.unwrap_or(from);
            Ok(Shard {
                file: final_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string(),
                from,
                to,
                lines: shard.lines,
                bytes: shard.bytes,
                labels: shard.labels.into_sorted(),
                compressed,
            })
        })();

        let entry = match close_result {
            Ok(e) => e,
            Err(e) => {
                if let Some(hook) = &self.on_error {
                    hook(&e);
                }
                return Err(e);
            }
        };

        self.index.push(entry);
        self.counter += 1;
        self.rewrite_index()?;

        if let Some(hook) = &self.on_rotate {
            hook(reason);
        }

        self.evict_if_over_cap()?;
        self.check_disk_warning()?;
        Ok(())
    }

    fn rewrite_index(&self) -> Result<()> {
        capture::rewrite_index(&self.dir, &self.index)
    }

    /// Sum of on-disk sizes of every shard file (open or closed) under `dir`.
    pub fn disk_usage(&self) -> u64 {
        dir_disk_usage(&self.dir)
    }

    fn evict_if_over_cap(&mut self) -> Result<()> {
        while self.disk_usage() > self.max_disk {
            if self.index.len() <= 1 {
                tracing::warn!(
                    dir = %self.dir.display(),
                    "disk usage exceeds max_disk but no shard is safe to evict"
                );
                break;
            }
            let oldest_idx = self
                .index
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.from)
                .map(|(i, _)| i)
                .expect("index.len() > 1 checked above");
            let victim = self.index.remove(oldest_idx);
            let path = self.dir.join(&victim.file);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    if let Some(hook) = &self.on_error {
                        hook(&LogtapError::Io(e.to_string()));
                    }
                }
            }
            self.rewrite_index()?;
        }
        Ok(())
    }

    fn check_disk_warning(&mut self) -> Result<()> {
        let used = self.disk_usage();
        let ratio = if self.max_disk == 0 {
            0.0
        } else {
            used as f64 / self.max_disk as f64
        };
        if self.warn_state.update(ratio).is_some()
            && let Some(hook) = &self.on_disk_warning
        {
            hook(used, self.max_disk);
        }
        Ok(())
    }
}

/// Sum of on-disk sizes of every shard file (open or closed) under `dir`.
/// Standalone so callers that don't hold the live `Rotator` (e.g. the
/// webhook/audit stats reported at shutdown, after the rotator has moved
/// into the writer's consumer thread) can still report current usage.
pub fn dir_disk_usage(dir: &Path) -> u64 {
    let mut total = 0u64;
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let is_shard = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".jsonl") || n.ends_with(".jsonl.zst"));
            if is_shard
                && let Ok(meta) = entry.metadata()
            {
                total += meta.len();
            }
        }
    }
    total
}

/// Streams `path` through zstd into `path` + `.zst`, then atomically
/// replaces the original via rename, fsyncing the directory afterward so
/// the rename is durable before the uncompressed file is removed.
fn compress_shard(path: &Path) -> Result<PathBuf> {
    let tmp_path = path.with_extension("jsonl.zst.tmp");
    {
        let mut input = File::open(path)?;
        let output = File::create(&tmp_path)?;
        let mut encoder = zstd::stream::Encoder::new(output, 0)?;
        std::io::copy(&mut input, &mut encoder)?;
        encoder.finish()?;
    }
    let final_path = path.with_extension("jsonl.zst");
    fs::rename(&tmp_path, &final_path)?;
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
    fs::remove_file(path)?;
    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(secs: i64, msg: &str) -> LogEntry {
        LogEntry::new(DateTime::from_timestamp(secs, 0).unwrap(), Vec::new(), msg.to_string())
    }

    fn append(rotator: &mut Rotator, e: &LogEntry) {
        rotator.track_line(e).unwrap();
        let line = serde_json::to_vec(&(e.timestamp.timestamp_nanos_opt().unwrap(), &e.message)).unwrap();
        rotator.write_line(&line).unwrap();
    }

    #[test]
    fn rotates_on_size_and_names_by_first_entry_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut rotator = Rotator::new(dir.path().to_path_buf(), 20, 1_000_000, false).unwrap();
        append(&mut rotator, &entry(0, "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
        assert_eq!(rotator.index().len(), 1);
        assert!(rotator.index()[0].file.starts_with("1970-01-01T000000-000"));
    }

    #[test]
    fn close_with_no_open_shard_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut rotator = Rotator::new(dir.path().to_path_buf(), 1024, 1_000_000, false).unwrap();
        rotator.close("shutdown").unwrap();
        assert!(rotator.index().is_empty());
    }

    #[test]
    fn compress_replaces_jsonl_with_zst() {
        let dir = tempfile::tempdir().unwrap();
        let mut rotator = Rotator::new(dir.path().to_path_buf(), 1024 * 1024, 1_000_000, true).unwrap();
        append(&mut rotator, &entry(0, "hello"));
        rotator.close("shutdown").unwrap();
        assert!(rotator.index()[0].compressed);
        assert!(rotator.index()[0].file.ends_with(".jsonl.zst"));
        assert!(dir.path().join(&rotator.index()[0].file).exists());
    }

    #[test]
    fn evicts_oldest_shard_when_over_cap() {
        let dir = tempfile::tempdir().unwrap();
        // max_file tiny so every append rotates a new shard; max_disk tiny so eviction kicks in.
        let mut rotator = Rotator::new(dir.path().to_path_buf(), 1, 40, false).unwrap();
        for i in 0..5 {
            append(&mut rotator, &entry(i, "xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx"));
        }
        assert!(rotator.disk_usage() <= 80); // best-effort cap, not exact
        assert!(rotator.index().len() < 5);
    }

    #[test]
    fn on_rotate_hook_fires_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let reasons = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let reasons2 = reasons.clone();
        let mut rotator = Rotator::new(dir.path().to_path_buf(), 1024 * 1024, 1_000_000, false)
            .unwrap()
            .on_rotate(move |r| reasons2.lock().push(r.to_string()));
        append(&mut rotator, &entry(0, "hello"));
        rotator.close("shutdown").unwrap();
        assert_eq!(*reasons.lock(), vec!["shutdown".to_string()]);
    }

    #[test]
    fn disk_warning_fires_once_per_crossing() {
        let mut state = DiskWarnState::default();
        assert_eq!(state.update(0.5), None);
        assert_eq!(state.update(0.81), Some(WARN_LOW));
        assert_eq!(state.update(0.82), None);
        assert_eq!(state.update(0.96), Some(WARN_HIGH));
        assert_eq!(state.update(0.5), None);
        assert_eq!(state.update(0.81), Some(WARN_LOW));
    }

}
