//! Result cache
//!
//! Memoizes backend outputs under a content hash of the task inputs. See
//! [`compute_key`] for key derivation and [`ResultCache`] for the locking
//! and persistence rules.

pub mod key;
pub mod store;

pub use key::{canonicalize, compute_key};
pub use store::{CacheConfig, CacheEntry, CacheStats, ResultCache, SharedResultCache};
