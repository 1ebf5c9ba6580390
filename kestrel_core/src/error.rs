//! Error types and result definitions for the dispatch core.
//!
//! Only recoverable conditions are represented here:
//! - Resource exhaustion (executable code space full)
//! - Lookup failures (message not understood)
//! - Compiler failures and aborted recompilation attempts
//! - Stale handles passed in by collaborators
//!
//! Invariant violations (corrupt trigger methods, duplicate types in a
//! polymorphic cache, code-size mismatches) are not errors: they abort the
//! process through `panic!`/`assert!`, since continuing would execute
//! wrong code.

use crate::ids::{CodeId, KlassId, MethodId, PicId, SelectorId, SiteId};
use thiserror::Error;

/// The unified result type used throughout the dispatch core.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Recoverable error conditions of the dispatch core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Executable code space cannot satisfy an allocation.
    #[error("code space exhausted: requested {requested} bytes, {available} available")]
    CodeSpaceExhausted {
        /// Bytes requested.
        requested: usize,
        /// Bytes still free.
        available: usize,
    },

    /// Full method search found no implementation.
    #[error("{klass} does not understand {selector}")]
    MessageNotUnderstood {
        /// Receiver type.
        klass: KlassId,
        /// Selector sent.
        selector: SelectorId,
    },

    /// The code generator rejected a compilation request.
    #[error("compilation of {method} failed: {reason}")]
    CompilationFailed {
        /// Method being compiled.
        method: MethodId,
        /// Compiler-provided description.
        reason: String,
    },

    /// A block's home context could not be located on the stack.
    #[error("block {method} has no live home context")]
    DeadBlockHome {
        /// The block method.
        method: MethodId,
    },

    /// A call-site handle does not name a registered site.
    #[error("unknown call site {0}")]
    UnknownSite(SiteId),

    /// A PIC handle does not name a live cache.
    #[error("unknown polymorphic inline cache {0}")]
    UnknownPic(PicId),

    /// A compiled-unit handle does not name an installed unit.
    #[error("unknown compiled unit {0}")]
    UnknownCode(CodeId),
}

impl DispatchError {
    /// Check if this error reports exhausted executable memory.
    #[inline]
    #[must_use]
    pub const fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Self::CodeSpaceExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_exhausted() {
        let err = DispatchError::CodeSpaceExhausted {
            requested: 64,
            available: 16,
        };
        assert_eq!(
            err.to_string(),
            "code space exhausted: requested 64 bytes, 16 available"
        );
        assert!(err.is_resource_exhaustion());
    }

    #[test]
    fn test_display_dnu() {
        let err = DispatchError::MessageNotUnderstood {
            klass: KlassId::new(5),
            selector: SelectorId::new(9),
        };
        assert_eq!(err.to_string(), "klass#5 does not understand sel#9");
        assert!(!err.is_resource_exhaustion());
    }

    #[test]
    fn test_display_compile_failed() {
        let err = DispatchError::CompilationFailed {
            method: MethodId::new(3),
            reason: "too many temporaries".into(),
        };
        assert_eq!(
            err.to_string(),
            "compilation of method#3 failed: too many temporaries"
        );
    }
}
