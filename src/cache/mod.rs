//! Persistent memoizing lookup cache.
//!
//! - [`CallKey`]: canonical, order-preserving encoding of a call's arguments
//! - [`MemoCache`]: in-memory table with optional single-file persistence
//!
//! The cache has no eviction and no expiry. It is an append-only store for a
//! single batch process; persistence is a full-table rewrite through a
//! temporary file followed by a rename.

pub mod key;
pub mod memo;
mod store;

pub use key::{ArgValue, CallKey};
pub use memo::{CacheConfig, CacheStats, MemoCache};
