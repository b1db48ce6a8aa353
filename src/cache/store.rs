//! Backing file for a memo cache.
//!
//! # File Format
//! ```text
//! {
//!   "format": "ip-annotate-memo",
//!   "version": 1,
//!   "entries": [
//!     { "key": { "args": ["192.0.2.10"], "named": {} }, "value": "Example Org" },
//!     ...
//!   ]
//! }
//! ```
//!
//! Entries are written sorted by key so that identical tables produce
//! identical files. Writes go to `<file>.tmp` first and are renamed over the
//! target, so the target is always either the previous complete table or the
//! new complete table.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::key::CallKey;
use crate::error::CacheError;

const FORMAT: &str = "ip-annotate-memo";
const VERSION: u32 = 1;

#[derive(Serialize)]
struct CacheFileOut<'a, V> {
    format: &'a str,
    version: u32,
    entries: Vec<EntryOut<'a, V>>,
}

#[derive(Serialize)]
struct EntryOut<'a, V> {
    key: &'a CallKey,
    value: &'a V,
}

#[derive(Deserialize)]
struct CacheFileIn<V> {
    format: String,
    version: u32,
    entries: Vec<EntryIn<V>>,
}

#[derive(Deserialize)]
struct EntryIn<V> {
    key: CallKey,
    value: V,
}

/// Path of the temporary file a flush writes before replacing `path`.
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    with_suffix(path, ".tmp")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Load the table stored at `path`.
///
/// Returns `Ok(None)` when no file exists. Any file that exists but cannot
/// be decoded completely is reported as [`CacheError::Corrupt`].
pub(crate) fn load<V: DeserializeOwned>(
    path: &Path,
) -> Result<Option<HashMap<CallKey, V>>, CacheError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CacheError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let corrupt = |reason: String| CacheError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    if bytes.is_empty() {
        return Err(corrupt("file is empty".to_string()));
    }

    let file: CacheFileIn<V> =
        serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;

    if file.format != FORMAT {
        return Err(corrupt(format!("unexpected format tag '{}'", file.format)));
    }

    if file.version != VERSION {
        return Err(corrupt(format!("unsupported version {}", file.version)));
    }

    let mut entries = HashMap::with_capacity(file.entries.len());
    for entry in file.entries {
        match entries.entry(entry.key) {
            MapEntry::Occupied(occupied) => {
                return Err(corrupt(format!("duplicate key {}", occupied.key())));
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(entry.value);
            }
        }
    }

    Ok(Some(entries))
}

/// Serialize the full table into the temporary file next to `path`.
pub(crate) fn write_temp<V: Serialize>(
    path: &Path,
    entries: &HashMap<CallKey, V>,
) -> Result<PathBuf, CacheError> {
    let persist = |source: std::io::Error| CacheError::Persist {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(persist)?;
        }
    }

    let mut sorted: Vec<EntryOut<'_, V>> = entries
        .iter()
        .map(|(key, value)| EntryOut { key, value })
        .collect();
    sorted.sort_by(|a, b| a.key.cmp(b.key));

    let document = CacheFileOut {
        format: FORMAT,
        version: VERSION,
        entries: sorted,
    };

    let tmp_path = temp_path(path);
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(persist)?;

    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &document)?;
    writer.flush().map_err(persist)?;

    let file = writer
        .into_inner()
        .map_err(|e| persist(e.into_error()))?;
    file.sync_all().map_err(persist)?;

    Ok(tmp_path)
}

/// Replace `path` with the finished temporary file in one step.
pub(crate) fn commit(tmp_path: &Path, path: &Path) -> Result<(), CacheError> {
    fs::rename(tmp_path, path).map_err(|source| CacheError::Persist {
        path: path.to_path_buf(),
        source,
    })
}

/// Write the table atomically: temp file, then rename over the target.
pub(crate) fn write_atomic<V: Serialize>(
    path: &Path,
    entries: &HashMap<CallKey, V>,
) -> Result<(), CacheError> {
    let tmp_path = write_temp(path, entries)?;
    commit(&tmp_path, path)
}

/// Upper bound on `<file>.corrupt.N` names tried before giving up.
const MAX_QUARANTINE_SLOTS: u32 = 1000;

/// Move a corrupt file aside so it is not overwritten by the next flush.
///
/// The target is `<file>.corrupt`, or `<file>.corrupt.1`, `<file>.corrupt.2`
/// and so on when earlier quarantined files are still present. An existing
/// quarantined file is never replaced.
pub(crate) fn quarantine(path: &Path) -> Result<PathBuf, CacheError> {
    let persist = |source: std::io::Error| CacheError::Persist {
        path: path.to_path_buf(),
        source,
    };

    let target = (0..MAX_QUARANTINE_SLOTS)
        .map(|slot| match slot {
            0 => with_suffix(path, ".corrupt"),
            n => with_suffix(path, &format!(".corrupt.{}", n)),
        })
        .find(|candidate| !candidate.exists())
        .ok_or_else(|| {
            persist(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("{} quarantined copies already present", MAX_QUARANTINE_SLOTS),
            ))
        })?;

    fs::rename(path, &target).map_err(persist)?;
    Ok(target)
}
