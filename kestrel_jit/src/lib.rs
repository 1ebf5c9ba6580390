//! Adaptive call dispatch for Kestrel.
//!
//! The machinery that makes message sends cheap as they warm up:
//! - Global (type, selector) lookup cache with primary/secondary tables
//! - Per-site inline caches: empty, monomorphic, polymorphic, megamorphic
//! - Polymorphic inline caches encoded as parseable dispatch code
//! - Zombie tracking and address-based reclamation of replaced code
//! - Counter-driven recompilation with a cost/benefit frame policy
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod ic;
pub mod lookup;
pub mod recompile;
pub mod runtime;
pub mod testing;

pub use ic::{IcState, IcStats, InlineCacheSite, PolymorphicInlineCache, SendKind, SiteTarget};
pub use lookup::{LookupCache, LookupKey, LookupResult};
pub use recompile::{
    Collaborators, Continuation, Recompilation, RecompilationOutcome, RecompilationPolicy,
    RecompilationState, RecompilationStats,
};
pub use runtime::{DispatchConfig, DispatchRuntime};
