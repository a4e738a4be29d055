//! Core data types shared by the write path and the read path: see
//! spec.md §3 for the authoritative field-by-field description.

use std::collections::BTreeMap;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A single log observation, as it exists once decoded off the wire and
/// after redaction, on its way into the writer queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// Insertion order is preserved (a `Vec`, not a map) because it is
    /// observable on the wire: the shard line must serialize labels in the
    /// order the producer sent them. `label_map` renders this as a JSON
    /// object on the wire (`{"app":"web",...}`) while keeping Vec ordering
    /// internally, rather than the `[[k,v],...]` a derived impl would emit.
    #[serde(with = "label_map")]
    pub labels: Vec<(String, String)>,
    pub message: String,
}

/// Serializes/deserializes `Vec<(String, String)>` as a JSON object while
/// preserving insertion order on both ends — independent of whether
/// `serde_json`'s `preserve_order` feature is enabled, since entries are
/// read straight off the token stream rather than through an intermediate
/// map type.
pub(crate) mod label_map {
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(labels: &[(String, String)], s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(labels.len()))?;
        for (k, v) in labels {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }

    struct LabelVisitor;

    impl<'de> Visitor<'de> for LabelVisitor {
        type Value = Vec<(String, String)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "a JSON object mapping label names to string values")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((k, v)) = map.next_entry::<String, String>()? {
                out.push((k, v));
            }
            Ok(out)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<(String, String)>, D::Error> {
        d.deserialize_map(LabelVisitor)
    }
}

impl LogEntry {
    pub fn new(timestamp: DateTime<Utc>, labels: Vec<(String, String)>, message: String) -> Self {
        LogEntry {
            timestamp,
            labels,
            message,
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// One data file in a capture. Once closed and (optionally) compressed, a
/// shard is immutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Shard {
    pub file: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub lines: u64,
    pub bytes: u64,
    /// label-key -> (value -> count), ordered for deterministic serialization.
    pub labels: BTreeMap<String, BTreeMap<String, u64>>,
    pub compressed: bool,
}

/// Alias: an `IndexEntry` is exactly a closed `Shard`'s on-disk record. The
/// spec keeps these as separate named concepts (one is mutable bookkeeping
/// during the open shard's lifetime, the other is the frozen record written
/// to `index.jsonl`); in this implementation the frozen record IS a `Shard`
/// value, so `IndexEntry` is a type alias rather than a duplicate struct.
pub type IndexEntry = Shard;

/// Capture-scoped header, written on start and rewritten on graceful
/// shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub version: u32,
    pub format: String,
    pub started: DateTime<Utc>,
    /// Zero (`DateTime::<Utc>::UNIX_EPOCH`... actually the Unix epoch itself)
    /// while running; see `Metadata::stopped_or_none`.
    pub stopped: DateTime<Utc>,
    #[serde(rename = "totalLines")]
    pub total_lines: u64,
    #[serde(rename = "totalBytes")]
    pub total_bytes: u64,
    #[serde(rename = "labelsSeen")]
    pub labels_seen: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redaction: Option<RedactionMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionMeta {
    pub enabled: bool,
    pub patterns: Vec<String>,
}

impl Metadata {
    pub fn zero_time() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    pub fn new(started: DateTime<Utc>) -> Self {
        Metadata {
            version: 1,
            format: "jsonl".to_string(),
            started,
            stopped: Self::zero_time(),
            total_lines: 0,
            total_bytes: 0,
            labels_seen: Vec::new(),
            redaction: None,
        }
    }

    /// `None` while the capture is still open (§3: "stopped zero while
    /// running").
    pub fn stopped_or_none(&self) -> Option<DateTime<Utc>> {
        if self.stopped == Self::zero_time() {
            None
        } else {
            Some(self.stopped)
        }
    }
}

/// A compiled predicate over [`LogEntry`]. `None` on any field means that
/// sub-predicate is unbounded; an entirely default `Filter` matches
/// everything.
#[derive(Default)]
pub struct Filter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub labels: Vec<(String, String)>,
    pub grep: Option<Regex>,
}

impl Filter {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(from) = self.from
            && entry.timestamp < from
        {
            return false;
        }
        if let Some(to) = self.to
            && entry.timestamp >= to
        {
            return false;
        }
        for (key, want) in &self.labels {
            match entry.label(key) {
                Some(v) if v == want => {}
                _ => return false,
            }
        }
        if let Some(re) = &self.grep
            && !re.is_match(&entry.message)
        {
            return false;
        }
        true
    }

    /// Whether a shard whose summary is `shard_labels` could possibly
    /// satisfy this filter's label conjunction — used by the reader to
    /// prune shards without opening them (spec.md §4.6).
    pub fn shard_could_match_labels(&self, shard: &Shard) -> bool {
        for (key, want) in &self.labels {
            match shard.labels.get(key) {
                Some(values) if values.contains_key(want) => {}
                _ => return false,
            }
        }
        true
    }

    /// Whether `[from, to]` of a shard overlaps this filter's time window.
    pub fn shard_could_match_time(&self, shard: &Shard) -> bool {
        if let Some(want_from) = self.to
            && shard.from >= want_from
        {
            return false;
        }
        if let Some(want_to) = self.from
            && shard.to < want_to
        {
            return false;
        }
        true
    }
}

/// Running label-value histogram for the currently-open shard; folded into
/// a [`Shard`] once the shard closes.
#[derive(Debug, Default, Clone)]
pub struct LabelHistogram {
    inner: AHashMap<String, AHashMap<String, u64>>,
}

impl LabelHistogram {
    pub fn record(&mut self, labels: &[(String, String)]) {
        for (k, v) in labels {
            *self
                .inner
                .entry(k.clone())
                .or_default()
                .entry(v.clone())
                .or_insert(0) += 1;
        }
    }

    pub fn into_sorted(self) -> BTreeMap<String, BTreeMap<String, u64>> {
        self.inner
            .into_iter()
            .map(|(k, vals)| (k, vals.into_iter().collect()))
            .collect()
    }
}
