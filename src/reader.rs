//! Capture reader: opens a capture directory and streams its entries back
//! out, filtered and in timestamp order.
//!
//! Grounded on the teacher's `backend::search::search_file` — a
//! `BufReader`-driven line scan with a compiled-once `Regex` — generalized
//! from "materialize every line of one file" to "lazily stream possibly
//! many, possibly zstd-compressed, shards, merged by timestamp." The
//! parallel scan variant reuses `rayon`, the pack's established
//! fan-out-over-shards tool (see `estuary-flow`'s scan workers).

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rayon::prelude::*;

use crate::capture;
use crate::error::Result;
use crate::model::{Filter, IndexEntry, LogEntry, Metadata};

/// A read-only view over an opened capture: parsed metadata plus the shard
/// index, per spec.md §4.6 step 3.
pub struct Capture {
    dir: PathBuf,
    metadata: Metadata,
    shards: Vec<IndexEntry>,
}

impl Capture {
    /// Opens `dir`, reading `metadata.json` and `index.jsonl`. Fails
    /// `NotFound`/`Format` per spec.md §4.6 step 1–2.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let metadata = capture::read_metadata(&dir)?;
        let shards = capture::read_index(&dir)?;
        Ok(Capture { dir, metadata, shards })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn shards(&self) -> &[IndexEntry] {
        &self.shards
    }

    pub fn total_lines(&self) -> u64 {
        self.shards.iter().map(|s| s.lines).sum()
    }

    /// Upper bound on the capture's time range: `metadata.stopped` if the
    /// process exited cleanly, else the last shard's `to` (spec.md §4.5).
    pub fn effective_end(&self) -> Option<DateTime<Utc>> {
        if let Some(stopped) = self.metadata.stopped_or_none() {
            return Some(stopped);
        }
        self.shards.iter().map(|s| s.to).max()
    }

    /// Shards that could possibly contribute entries to `filter`, pruned by
    /// time-range disjointness and label-summary mismatch without opening
    /// any file (spec.md §4.6).
    fn candidate_shards<'a>(&'a self, filter: &Filter) -> Vec<&'a IndexEntry> {
        self.shards
            .iter()
            .filter(|s| filter.shard_could_match_time(s) && filter.shard_could_match_labels(s))
            .collect()
    }

    /// Lazily streams matching entries across all candidate shards,
    /// k-way-merged by timestamp. Within a shard, order is file order
    /// (assumed non-decreasing, per spec.md §4.6); across shards with
    /// overlapping time ranges, the heap restores global monotonicity.
    /// Ties on timestamp break by shard creation order (the index is
    /// already in creation order, so the shard's index position serves as
    /// the tiebreak key).
    pub fn entries(&self, filter: Filter) -> Result<EntryIter> {
        let mut heads = Vec::new();
        for (shard_index, shard) in self.candidate_shards(&filter).into_iter().enumerate() {
            let mut lines = open_shard_lines(&self.dir, shard)?;
            if let Some(first) = next_matching(&mut lines, &filter)? {
                heads.push(HeapItem {
                    entry: first,
                    shard_index,
                    lines,
                });
            }
        }
        let heap = BinaryHeap::from(heads);
        Ok(EntryIter { heap, filter })
    }

    /// Fan-out scan across shards: each worker streams one shard at a time;
    /// results come back grouped per shard (spec.md §4.6 "parallel scan").
    /// The caller restores global time order itself if it needs one — this
    /// is the ungrouped, as-available variant used by triage/export tools.
    pub fn parallel_scan(&self, filter: &Filter) -> Vec<Result<Vec<LogEntry>>> {
        self.candidate_shards(filter)
            .into_par_iter()
            .map(|shard| {
                let mut lines = open_shard_lines(&self.dir, shard)?;
                let mut out = Vec::new();
                while let Some(entry) = next_matching(&mut lines, filter)? {
                    out.push(entry);
                }
                Ok(out)
            })
            .collect()
    }
}

/// A boxed line source so zstd-compressed and plain shards share one type.
type ShardLines = std::io::Lines<BufReader<Box<dyn Read + Send>>>;

fn open_shard_lines(dir: &Path, shard: &IndexEntry) -> Result<ShardLines> {
    let path = capture::shard_path(dir, shard);
    let file = File::open(&path)?;
    let reader: Box<dyn Read + Send> = if shard.compressed {
        Box::new(zstd::stream::Decoder::new(file)?)
    } else {
        Box::new(file)
    };
    Ok(BufReader::new(reader).lines())
}

/// Pulls lines from `lines` until one parses and matches `filter`, or the
/// shard is exhausted. Malformed lines are skipped (a shard is
/// append-only JSONL; a torn last line can occur if the process died
/// mid-write, which is not itself a capture-format error).
fn next_matching(lines: &mut ShardLines, filter: &Filter) -> Result<Option<LogEntry>> {
    for line in lines {
        let line = line.map_err(|e| crate::error::LogtapError::Io(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: LogEntry = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(_) => continue,
        };
        if filter.matches(&entry) {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

struct HeapItem {
    entry: LogEntry,
    shard_index: usize,
    lines: ShardLines,
}

impl Eq for HeapItem {}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.entry.timestamp == other.entry.timestamp && self.shard_index == other.shard_index
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse both keys so the earliest
        // timestamp (and, on a tie, the earliest-created shard) pops first.
        other
            .entry
            .timestamp
            .cmp(&self.entry.timestamp)
            .then_with(|| other.shard_index.cmp(&self.shard_index))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Lazy, cancellation-safe iterator over a capture's matching entries.
/// Dropping the iterator at any point releases every open shard handle and
/// decoder, since each is owned by a `HeapItem` living only in `self.heap`.
pub struct EntryIter {
    heap: BinaryHeap<HeapItem>,
    filter: Filter,
}

impl Iterator for EntryIter {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let HeapItem {
            entry,
            shard_index,
            mut lines,
        } = self.heap.pop()?;

        match next_matching(&mut lines, &self.filter) {
            Ok(Some(next_entry)) => {
                self.heap.push(HeapItem {
                    entry: next_entry,
                    shard_index,
                    lines,
                });
            }
            Ok(None) => {}
            Err(e) => return Some(Err(e)),
        }

        Some(Ok(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogEntry;
    use crate::rotate::Rotator;
    use crate::write::Writer;

    fn entry(secs: i64, msg: &str) -> LogEntry {
        LogEntry::new(DateTime::from_timestamp(secs, 0).unwrap(), Vec::new(), msg.to_string())
    }

    fn seed_capture(dir: &Path, messages: &[(i64, &str)]) {
        capture::write_initial_metadata(dir, &Metadata::new(Utc::now())).unwrap();
        let rotator = Rotator::new(dir.to_path_buf(), 1024 * 1024, 1024 * 1024 * 1024, false).unwrap();
        let writer = Writer::spawn(rotator, 1024, |_| {}, |_| {});
        for (secs, msg) in messages {
            writer.write(entry(*secs, msg)).unwrap();
        }
        writer.close();
    }

    #[test]
    fn opens_capture_and_reads_entries_in_order() {
        let dir = tempfile::tempdir().unwrap();
        seed_capture(dir.path(), &[(1, "a"), (2, "b"), (3, "c")]);

        let cap = Capture::open(dir.path()).unwrap();
        assert_eq!(cap.total_lines(), 3);
        let entries: Vec<_> = cap
            .entries(Filter::default())
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let msgs: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(msgs, vec!["a", "b", "c"]);
    }

    #[test]
    fn grep_filter_narrows_entries() {
        let dir = tempfile::tempdir().unwrap();
        seed_capture(dir.path(), &[(1, "alpha"), (2, "beta"), (3, "alpha again")]);

        let cap = Capture::open(dir.path()).unwrap();
        let mut f = Filter::default();
        f.grep = Some(regex::Regex::new("alpha").unwrap());
        let entries: Vec<_> = cap.entries(f).unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn missing_capture_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Capture::open(dir.path().join("nope")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn parallel_scan_covers_every_entry_across_shards() {
        let dir = tempfile::tempdir().unwrap();
        // Force a rotation between every entry so there are multiple shards.
        capture::write_initial_metadata(dir.path(), &Metadata::new(Utc::now())).unwrap();
        let rotator = Rotator::new(dir.path().to_path_buf(), 1, 1024 * 1024 * 1024, false).unwrap();
        let writer = Writer::spawn(rotator, 1024, |_| {}, |_| {});
        for i in 0..4 {
            writer.write(entry(i, "xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx")).unwrap();
        }
        writer.close();

        let cap = Capture::open(dir.path()).unwrap();
        let total: usize = cap
            .parallel_scan(&Filter::default())
            .into_iter()
            .map(|r| r.unwrap().len())
            .sum();
        assert_eq!(total, 4);
    }
}
