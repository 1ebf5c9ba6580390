//! # Kestrel Core
//!
//! Foundational types shared by the Kestrel dispatch core:
//!
//! - **Identities**: 32-bit handles for types, selectors, methods, compiled
//!   units, call sites and polymorphic caches
//! - **Interning**: selector names to identities for O(1) comparison
//! - **Error Handling**: the recoverable error type and result alias

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod ids;
pub mod intern;

pub use error::{DispatchError, DispatchResult};
pub use ids::{CodeId, KlassId, MethodId, ObjectRef, PicId, SelectorId, SiteId};
pub use intern::SelectorTable;

/// Kestrel runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
