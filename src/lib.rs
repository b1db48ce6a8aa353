//! # ip-annotate
//!
//! Annotates web-server access-log lines with whois and geographic data for
//! the client address, counts the annotations, and writes an enriched CSV.
//!
//! Lookups are memoized through [`cache::MemoCache`], which can persist its
//! table to a JSON file so repeated runs over the same logs do not repeat
//! remote queries that were already answered.

pub mod cache;
pub mod config;
pub mod error;
pub mod lookup;
pub mod pipeline;
pub mod tokenizer;

pub use cache::{ArgValue, CacheConfig, CacheStats, CallKey, MemoCache};
pub use config::{ExcludedLineOutput, FailurePolicy, PipelineConfig};
pub use error::{CacheError, LookupError, PipelineError};
pub use lookup::{Lookup, NamedLookup};
pub use pipeline::{AggregateCounters, Annotator, OutputRecord, RunSummary};
