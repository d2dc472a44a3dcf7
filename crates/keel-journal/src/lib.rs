//! Append-only journal primitive. Writes JSON Lines (one entry per line).
//!
//! # Contract
//!
//! Every append acquires an exclusive cross-process advisory lock on the
//! journal file, writes the serialized line, flushes, fsyncs, and only then
//! releases the lock. A write that lands fewer bytes than expected is a
//! [`JournalError::ShortWrite`] — never silently continued. Entries are
//! never rewritten in place; rotation/compaction is an external concern.
//!
//! Multiple OS processes may append to the same path concurrently; relative
//! ordering across processes is determined purely by lock-acquisition order.
//! Sequence numbers are monotonic **per journal instance**, seeded at
//! construction by counting existing non-blank lines.
//!
//! # Reading
//!
//! - [`Journal::iter_entries`] — lazy, for production replay. Skips blank
//!   lines; an unparseable line is skipped with a warning so a single torn
//!   line cannot brick startup.
//! - [`Journal::read_all`] — strict, for offline audit. Raises with
//!   file/line context on any malformed content.
//! - [`Journal::verify_integrity`] — recomputes every entry id; returns
//!   `false` rather than raising.

use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Length of the content-derived entry id (truncated SHA-256, lowercase hex).
pub const ENTRY_ID_LEN: usize = 16;

// ---------------------------------------------------------------------------
// JournalEntry
// ---------------------------------------------------------------------------

/// The generic envelope every domain record persists through.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub entry_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    /// First 16 hex chars of SHA-256 over entry_type + canonical data +
    /// timestamp. Recomputable from the entry itself.
    pub entry_id: String,
    /// Monotonic per journal instance.
    pub sequence: u64,
}

impl JournalEntry {
    /// Recompute the content hash and compare with the stored `entry_id`.
    pub fn id_is_consistent(&self) -> bool {
        derive_entry_id(&self.entry_type, &self.data, &self.timestamp) == self.entry_id
    }
}

// ---------------------------------------------------------------------------
// JournalError
// ---------------------------------------------------------------------------

/// Failures the journal can surface.
///
/// `Io` and `ShortWrite` are durability failures: fatal for the operation,
/// always propagated, never retried here. `Corrupt` carries file/line
/// context and is distinct from an ordinary empty read.
#[derive(Debug)]
pub enum JournalError {
    Io {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    ShortWrite {
        path: PathBuf,
        expected: usize,
        written: usize,
    },
    Corrupt {
        path: PathBuf,
        line: usize,
        detail: String,
    },
    Serialize {
        detail: String,
    },
}

impl std::fmt::Display for JournalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { op, path, source } => {
                write!(f, "journal {op} failed for {}: {source}", path.display())
            }
            Self::ShortWrite {
                path,
                expected,
                written,
            } => write!(
                f,
                "journal short write to {}: wrote {written} of {expected} bytes",
                path.display()
            ),
            Self::Corrupt { path, line, detail } => {
                write!(f, "journal corrupt at {}:{line}: {detail}", path.display())
            }
            Self::Serialize { detail } => write!(f, "journal serialize failed: {detail}"),
        }
    }
}

impl std::error::Error for JournalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Durable, locked, sequenced append-only log over one JSONL file.
pub struct Journal {
    path: PathBuf,
    next_seq: u64,
}

impl Journal {
    /// Open (or create the parent directories for) a journal at `path`.
    ///
    /// Seeds the sequence counter by counting existing non-blank lines, so
    /// a reopened journal continues where the file left off.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| JournalError::Io {
                    op: "create_dir_all",
                    path: path.clone(),
                    source,
                })?;
            }
        }

        let next_seq = match fs::read_to_string(&path) {
            Ok(content) => content.lines().filter(|l| !l.trim().is_empty()).count() as u64,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(source) => {
                return Err(JournalError::Io {
                    op: "read",
                    path,
                    source,
                })
            }
        };

        Ok(Self { path, next_seq })
    }

    /// Path of the underlying JSONL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence number the next append will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_seq
    }

    /// Append one entry and return the durable envelope.
    ///
    /// Blocks until the exclusive lock is acquired and the fsync completes.
    /// Durability over latency: the entry is never buffered only in memory.
    ///
    /// # Errors
    /// Any I/O or short-write failure propagates; the caller must treat it
    /// as fatal for the operation in flight. There is no internal retry.
    pub fn append(&mut self, entry_type: &str, data: Value) -> Result<JournalEntry, JournalError> {
        let timestamp = truncate_to_micros(Utc::now());
        let entry = JournalEntry {
            entry_id: derive_entry_id(entry_type, &data, &timestamp),
            entry_type: entry_type.to_string(),
            data,
            timestamp,
            sequence: self.next_seq,
        };

        let line = canonical_json(&entry)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io("open", source))?;

        file.lock_exclusive()
            .map_err(|source| self.io("lock", source))?;

        let result = self.write_locked(&mut file, &line);

        // Release even when the write failed; the error from the write wins.
        let unlock = FileExt::unlock(&file);
        result?;
        unlock.map_err(|source| self.io("unlock", source))?;

        self.next_seq += 1;
        tracing::debug!(
            entry_type = entry.entry_type.as_str(),
            sequence = entry.sequence,
            entry_id = entry.entry_id.as_str(),
            "journal append"
        );
        Ok(entry)
    }

    fn write_locked(&self, file: &mut File, line: &str) -> Result<(), JournalError> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        let written = file
            .write(&buf)
            .map_err(|source| self.io("write", source))?;
        if written != buf.len() {
            return Err(JournalError::ShortWrite {
                path: self.path.clone(),
                expected: buf.len(),
                written,
            });
        }

        file.flush().map_err(|source| self.io("flush", source))?;
        file.sync_all().map_err(|source| self.io("fsync", source))?;
        Ok(())
    }

    /// Lazily yield parsed entries for production consumption.
    ///
    /// Blank lines are skipped. An unparseable line is skipped with a
    /// warning — replay must survive one torn line. Use [`Journal::read_all`]
    /// when corruption should be an error.
    pub fn iter_entries(&self) -> Result<impl Iterator<Item = JournalEntry>, JournalError> {
        let reader = match File::open(&self.path) {
            Ok(f) => Some(BufReader::new(f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(self.io("open", source)),
        };

        let path = self.path.clone();
        let lines = reader
            .map(|r| r.lines())
            .into_iter()
            .flatten()
            .enumerate()
            .filter_map(move |(i, line)| {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), line = i + 1, error = %e, "unreadable journal line skipped");
                        return None;
                    }
                };
                if line.trim().is_empty() {
                    return None;
                }
                match serde_json::from_str::<JournalEntry>(&line) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), line = i + 1, error = %e, "malformed journal line skipped");
                        None
                    }
                }
            });
        Ok(lines)
    }

    /// Read every entry strictly, for offline audit.
    ///
    /// # Errors
    /// [`JournalError::Corrupt`] with line context on the first malformed
    /// line; I/O errors (including a missing file) propagate.
    pub fn read_all(&self) -> Result<Vec<JournalEntry>, JournalError> {
        let content = fs::read_to_string(&self.path).map_err(|source| self.io("read", source))?;

        let mut entries = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry =
                serde_json::from_str(line).map_err(|e| JournalError::Corrupt {
                    path: self.path.clone(),
                    line: i + 1,
                    detail: e.to_string(),
                })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Recompute every entry id against its own content.
    ///
    /// Returns `false` on any mismatch or unparseable line rather than
    /// raising. A missing file is vacuously consistent.
    pub fn verify_integrity(&self) -> bool {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(_) => return false,
        };

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) if entry.id_is_consistent() => {}
                _ => return false,
            }
        }
        true
    }

    fn io(&self, op: &'static str, source: std::io::Error) -> JournalError {
        JournalError::Io {
            op,
            path: self.path.clone(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Canonicalization + id derivation
// ---------------------------------------------------------------------------

/// Serialize with recursively sorted keys and no whitespace.
/// One entry == one JSON line.
pub fn canonical_json<T: Serialize>(v: &T) -> Result<String, JournalError> {
    let raw = serde_json::to_value(v).map_err(|e| JournalError::Serialize {
        detail: e.to_string(),
    })?;
    let sorted = sort_keys(&raw);
    serde_json::to_string(&sorted).map_err(|e| JournalError::Serialize {
        detail: e.to_string(),
    })
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for k in keys {
                sorted.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(sorted)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Content-derived entry id: first 16 hex chars of
/// SHA-256(entry_type | canonical(data) | timestamp).
pub fn derive_entry_id(entry_type: &str, data: &Value, timestamp: &DateTime<Utc>) -> String {
    let canonical_data =
        serde_json::to_string(&sort_keys(data)).unwrap_or_else(|_| String::from("null"));
    let ts = timestamp.to_rfc3339_opts(SecondsFormat::Micros, true);

    let mut hasher = Sha256::new();
    hasher.update(entry_type.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_data.as_bytes());
    hasher.update(b"|");
    hasher.update(ts.as_bytes());
    hex::encode(hasher.finalize())[..ENTRY_ID_LEN].to_string()
}

// Timestamps are hashed at microsecond precision; truncate at creation so
// the stored value and the hashed value cannot drift.
fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
