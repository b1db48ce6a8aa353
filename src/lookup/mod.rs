//! Lookup capabilities and their cache-backed wrapper.
//!
//! A [`Lookup`] resolves one IP string to one result string, or fails. It is
//! expected to be deterministic from the caller's view, which is what makes
//! memoizing it sound. [`NamedLookup`] pairs a lookup with a display name and
//! its own [`MemoCache`].

pub mod geo;
pub mod whois;

pub use geo::{GeoDatabase, GeoField, GeoLookup, GeoRecord, MaxMindDatabase};
pub use whois::{
    SharedWhois, WhoisClient, WhoisConfig, WhoisField, WhoisLookup, WhoisRecord, WhoisSource,
};

use crate::cache::{CacheStats, CallKey, MemoCache};
use crate::error::LookupError;

/// Resolve an IP address to an annotation string.
pub trait Lookup {
    fn lookup(&self, ip: &str) -> Result<String, LookupError>;
}

impl<F> Lookup for F
where
    F: Fn(&str) -> Result<String, LookupError>,
{
    fn lookup(&self, ip: &str) -> Result<String, LookupError> {
        self(ip)
    }
}

/// A named lookup whose results are memoized per IP.
pub struct NamedLookup {
    name: String,
    source: Box<dyn Lookup>,
    cache: MemoCache<String>,
}

impl std::fmt::Debug for NamedLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedLookup")
            .field("name", &self.name)
            .field("cache", &self.cache)
            .finish()
    }
}

impl NamedLookup {
    pub fn new(
        name: impl Into<String>,
        source: impl Lookup + 'static,
        cache: MemoCache<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: Box::new(source),
            cache,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve `ip`, consulting the cache first. The key is `(ip,)`.
    pub fn call(&mut self, ip: &str) -> Result<String, LookupError> {
        let source = &self.source;
        self.cache.call(CallKey::single(ip), || source.lookup(ip))
    }

    pub fn cache(&self) -> &MemoCache<String> {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Close the backing cache, flushing it.
    pub fn close(self) {
        self.cache.close();
    }
}
