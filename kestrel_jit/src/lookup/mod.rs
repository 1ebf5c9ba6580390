//! Method lookup.
//!
//! Resolution of (receiver type, selector) pairs to the code implementing
//! them, memoized by the process-wide `LookupCache`.
//!
//! ```text
//! send ──► inline cache ──miss──► LookupCache ──miss──► CodeTable (compiled)
//!                                      │                     │ none
//!                                      │                     ▼
//!                                      │               ObjectModel::lookup_method
//!                                      ▼
//!                                 LookupResult { Empty | Method | Entry }
//! ```

pub mod cache;
mod key;
mod result;

pub use cache::{LookupCache, LookupCacheStats, PRIMARY_CACHE_SIZE, SECONDARY_CACHE_SIZE};
pub use key::LookupKey;
pub use result::LookupResult;
