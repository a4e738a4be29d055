//! Reads and writes the two small files that frame a capture directory:
//! `metadata.json` (one value, rewritten twice) and `index.jsonl`
//! (append-only, one line per closed shard). Both are written atomically via
//! temp-file-then-rename, the same pattern the rotator uses for shard
//! compression.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};

use crate::error::{LogtapError, Result};
use crate::model::{IndexEntry, Metadata};

pub const METADATA_FILE: &str = "metadata.json";
pub const INDEX_FILE: &str = "index.jsonl";
pub const AUDIT_FILE: &str = "audit.jsonl";

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("tmp")
    ));
    {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Writes the initial `metadata.json` for a freshly-started capture.
pub fn write_initial_metadata(dir: &Path, meta: &Metadata) -> Result<()> {
    fs::create_dir_all(dir)?;
    let bytes = serde_json::to_vec_pretty(meta)?;
    atomic_write(&dir.join(METADATA_FILE), &bytes)
}

/// Rewrites `metadata.json` with final counters on graceful shutdown.
pub fn rewrite_metadata_on_shutdown(dir: &Path, meta: &Metadata) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(meta)?;
    atomic_write(&dir.join(METADATA_FILE), &bytes)
}

/// Loads `metadata.json`. `NotFound` if absent, `Format` if unparseable or
/// the schema version is newer than this reader understands (spec.md §4.6).
pub fn read_metadata(dir: &Path) -> Result<Metadata> {
    let path = dir.join(METADATA_FILE);
    let bytes = fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LogtapError::not_found(format!("{} missing in {}", METADATA_FILE, dir.display()))
        } else {
            LogtapError::Io(e.to_string())
        }
    })?;
    let meta: Metadata = serde_json::from_slice(&bytes)
        .map_err(|e| LogtapError::format(format!("malformed {}: {e}", METADATA_FILE)))?;
    if meta.version > 1 {
        return Err(LogtapError::format(format!(
            "unsupported capture version {}",
            meta.version
        )));
    }
    Ok(meta)
}

/// Loads `index.jsonl`, skipping blank lines. A malformed record is a
/// `Format` error naming the offending line number.
pub fn read_index(dir: &Path) -> Result<Vec<IndexEntry>> {
    let path = dir.join(INDEX_FILE);
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(LogtapError::Io(e.to_string())),
    };
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| LogtapError::Io(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: IndexEntry = serde_json::from_str(&line)
            .map_err(|e| LogtapError::format(format!("{}:{}: {e}", INDEX_FILE, lineno + 1)))?;
        out.push(entry);
    }
    Ok(out)
}

/// Rewrites `index.jsonl` from scratch, atomically.
pub fn rewrite_index(dir: &Path, entries: &[IndexEntry]) -> Result<()> {
    let mut buf = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut buf, entry)?;
        buf.push(b'\n');
    }
    atomic_write(&dir.join(INDEX_FILE), &buf)
}

/// Resolves `dir` + filename for a shard referenced by the index.
pub fn shard_path(dir: &Path, entry: &IndexEntry) -> PathBuf {
    dir.join(&entry.file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn metadata_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Metadata::new(Utc::now());
        write_initial_metadata(dir.path(), &meta).unwrap();
        let read_back = read_metadata(dir.path()).unwrap();
        assert_eq!(read_back.version, 1);
        assert!(read_back.stopped_or_none().is_none());
    }

    #[test]
    fn missing_metadata_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_metadata(dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn future_version_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = Metadata::new(Utc::now());
        meta.version = 2;
        write_initial_metadata(dir.path(), &meta).unwrap();
        let err = read_metadata(dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Format);
    }

    #[test]
    fn index_skips_blank_lines_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let entry = IndexEntry {
            file: "shard.jsonl".to_string(),
            from: Utc::now(),
            to: Utc::now(),
            lines: 1,
            bytes: 10,
            labels: Default::default(),
            compressed: false,
        };
        rewrite_index(dir.path(), &[entry.clone()]).unwrap();
        fs::write(
            dir.path().join(INDEX_FILE),
            format!("{}\n\n", serde_json::to_string(&entry).unwrap()),
        )
        .unwrap();
        let read_back = read_index(dir.path()).unwrap();
        assert_eq!(read_back.len(), 1);
    }

    #[test]
    fn missing_index_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_index(dir.path()).unwrap().is_empty());
    }
}
