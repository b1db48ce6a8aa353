//! Persistent memoizing cache.
//!
//! Wraps a deterministic lookup so each distinct [`CallKey`] is computed at
//! most once, within a run and, when a backing file is configured, across
//! runs. Entries are only ever added: a key is never removed or given a
//! different value during the life of a cache.

use log::{debug, error, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::key::CallKey;
use super::store;
use crate::error::CacheError;

/// Configuration for a [`MemoCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Backing file. `None` keeps the cache in memory only.
    pub path: Option<PathBuf>,

    /// Number of new insertions between automatic flushes.
    pub flush_interval: usize,

    /// Move a corrupt backing file aside and start empty instead of failing.
    pub recover_corrupt: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            path: None,
            flush_interval: 25,
            recover_corrupt: false,
        }
    }
}

impl CacheConfig {
    /// Cache persisted at `path` with default settings.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        CacheConfig {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_flush_interval(mut self, flush_interval: usize) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_recover_corrupt(mut self, recover_corrupt: bool) -> Self {
        self.recover_corrupt = recover_corrupt;
        self
    }
}

/// Counters describing how a cache has been used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently held
    pub entries: usize,
    /// Calls answered from the table
    pub hits: u64,
    /// Calls that invoked the wrapped function
    pub misses: u64,
    /// Misses whose computation failed (nothing stored)
    pub failures: u64,
    /// Successful flushes
    pub flushes: u64,
    /// Failed flushes
    pub flush_failures: u64,
    /// Insertions not yet written to the backing file
    pub unpersisted: u64,
}

/// Memoizing cache with optional file persistence.
///
/// Single-writer: there is no internal locking. Callers that share a cache
/// across threads must serialize access themselves.
pub struct MemoCache<V: Serialize> {
    entries: HashMap<CallKey, V>,
    path: Option<PathBuf>,
    flush_interval: u64,
    /// Insertions since construction
    inserted: u64,
    /// Value of `inserted` at the last successful flush
    persisted: u64,
    hits: u64,
    misses: u64,
    failures: u64,
    flushes: u64,
    flush_failures: u64,
    closed: bool,
}

impl<V: Serialize> std::fmt::Debug for MemoCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoCache")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .field("flush_interval", &self.flush_interval)
            .finish()
    }
}

impl<V: Serialize + DeserializeOwned> MemoCache<V> {
    /// Create a cache, loading the backing file if one exists.
    ///
    /// A backing file that exists but cannot be decoded fails with
    /// [`CacheError::Corrupt`] unless `recover_corrupt` is set, in which case
    /// the file is renamed to `<file>.corrupt` and the cache starts empty.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let entries = match &config.path {
            None => HashMap::new(),
            Some(path) => match store::load(path) {
                Ok(Some(entries)) => {
                    info!(
                        "Loaded {} cached entries from {}",
                        entries.len(),
                        path.display()
                    );
                    entries
                }
                Ok(None) => {
                    info!("No cache file at {}, starting empty", path.display());
                    HashMap::new()
                }
                Err(CacheError::Corrupt { path: bad, reason }) if config.recover_corrupt => {
                    let moved = store::quarantine(&bad)?;
                    error!(
                        "Cache file {} is corrupt ({}); moved to {} and starting empty",
                        bad.display(),
                        reason,
                        moved.display()
                    );
                    HashMap::new()
                }
                Err(e) => return Err(e),
            },
        };

        Ok(Self::with_entries(entries, &config))
    }
}

impl<V: Serialize> MemoCache<V> {
    /// Pure in-memory cache; never persisted.
    pub fn in_memory() -> Self {
        Self::with_entries(HashMap::new(), &CacheConfig::default())
    }

    fn with_entries(entries: HashMap<CallKey, V>, config: &CacheConfig) -> Self {
        Self {
            entries,
            path: config.path.clone(),
            flush_interval: config.flush_interval.max(1) as u64,
            inserted: 0,
            persisted: 0,
            hits: 0,
            misses: 0,
            failures: 0,
            flushes: 0,
            flush_failures: 0,
            closed: false,
        }
    }

    /// Look up `key`, computing and storing the value on a miss.
    ///
    /// `compute` runs only on a miss. If it fails the error is returned and
    /// nothing is stored, so the next call with the same key retries it.
    /// Every `flush_interval` insertions the table is flushed; a failure of
    /// that flush is logged and does not affect the returned value.
    pub fn call<F, E>(&mut self, key: CallKey, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
        V: Clone,
    {
        if let Some(value) = self.entries.get(&key) {
            self.hits += 1;
            return Ok(value.clone());
        }

        self.misses += 1;
        let value = match compute() {
            Ok(value) => value,
            Err(e) => {
                self.failures += 1;
                debug!("Computation for {} failed; not cached", key);
                return Err(e);
            }
        };

        self.entries.insert(key, value.clone());
        self.inserted += 1;

        if self.inserted % self.flush_interval == 0 {
            self.periodic_flush();
        }

        Ok(value)
    }

    /// Write the whole table to the backing file atomically.
    ///
    /// No-op for in-memory caches.
    pub fn flush(&mut self) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        match store::write_atomic(path, &self.entries) {
            Ok(()) => {
                self.flushes += 1;
                self.persisted = self.inserted;
                debug!(
                    "Flushed {} entries to {}",
                    self.entries.len(),
                    path.display()
                );
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                Err(e)
            }
        }
    }

    /// Final flush and shutdown.
    ///
    /// Flush failures are logged, not returned.
    pub fn close(mut self) {
        self.finish();
    }

    fn periodic_flush(&mut self) {
        if let Err(e) = self.flush() {
            error!(
                "Periodic cache flush failed ({} entries not yet persisted): {}",
                self.inserted - self.persisted,
                e
            );
        }
    }

    fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.path.is_some() && self.inserted != self.persisted {
            if let Err(e) = self.flush() {
                error!(
                    "Final cache flush failed; {} entries lost: {}",
                    self.inserted - self.persisted,
                    e
                );
            }
        }

        let stats = self.stats();
        info!(
            "Cache {} closed: {} entries, {} hits, {} misses, {} failed lookups, {} flushes ({} failed)",
            self.path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<memory>".to_string()),
            stats.entries,
            stats.hits,
            stats.misses,
            stats.failures,
            stats.flushes,
            stats.flush_failures
        );
    }

    /// Stored value for `key`, without computing anything.
    pub fn get(&self, key: &CallKey) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &CallKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CallKey, &V)> {
        self.entries.iter()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            failures: self.failures,
            flushes: self.flushes,
            flush_failures: self.flush_failures,
            unpersisted: self.inserted - self.persisted,
        }
    }
}

impl<V: Serialize> Drop for MemoCache<V> {
    fn drop(&mut self) {
        self.finish();
    }
}
