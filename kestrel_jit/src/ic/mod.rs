//! Inline Caching (IC) System
//!
//! Per-call-site caches for message sends, backed by generated
//! polymorphic inline caches.
//!
//! # Architecture
//!
//! Each call site progresses through states as it observes receiver types:
//!
//! ```text
//! Uninitialized → Monomorphic → Polymorphic → Megamorphic
//!                     ↑              ↑              ↑
//!                 1 type      2..cap types   cap+1 types (or generic)
//! ```
//!
//! ## Components
//!
//! - **InlineCacheSite**: what a call site currently calls
//! - **PolymorphicInlineCache**: generated multi-entry dispatch code
//! - **PicHeap**: allocation, rebuild and reclamation of PIC bodies
//! - **Miss handler**: drives a site to its next state on a miss
//! - **Sweeper**: re-validates every site against current lookups
//!
//! ## Cost per state
//!
//! | State        | Dispatch                                     |
//! |--------------|----------------------------------------------|
//! | Monomorphic  | One type compare, direct call                |
//! | Polymorphic  | Tag test, compare chain, interpreted stub    |
//! | Megamorphic  | Stub call into the lookup cache              |

mod miss;
pub mod pic;
mod site;
mod sweeper;


pub use pic::{
    AllocateOutcome, CleanupOutcome, EmbeddedRef, IterState, PicContents, PicDispatch, PicHeap,
    PicHeapStats, PicIterator, PicShape, PicTarget, PolymorphicInlineCache, PreviousTarget,
};
pub(crate) use miss::resolve_send;
pub use site::{InlineCacheSite, SiteOwner, SiteTable, SiteTarget};
pub use sweeper::SweepReport;

use kestrel_core::KlassId;

// =============================================================================
// IC State
// =============================================================================

/// The state of an inline cache site.
///
/// Sites only move forward, except that sweeping, recompilation and
/// method invalidation may reset a site to `Uninitialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum IcState {
    /// No send has completed through the site yet.
    #[default]
    Uninitialized = 0,

    /// One receiver type, called directly.
    Monomorphic = 1,

    /// Several receiver types, dispatched by a PIC.
    Polymorphic = 2,

    /// Unspecialized: megamorphic PIC or generic lookup.
    Megamorphic = 3,
}

impl IcState {
    /// Check if this state has type feedback.
    #[inline]
    pub const fn has_feedback(self) -> bool {
        !matches!(self, Self::Uninitialized)
    }

    /// Check if this is the optimal monomorphic state.
    #[inline]
    pub const fn is_monomorphic(self) -> bool {
        matches!(self, Self::Monomorphic)
    }

    /// Check if the site can still specialize (not megamorphic).
    #[inline]
    pub const fn can_specialize(self) -> bool {
        !matches!(self, Self::Megamorphic)
    }
}

// =============================================================================
// Send Kind
// =============================================================================

/// How a send selects the method to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SendKind {
    /// Look up from the receiver's type.
    #[default]
    Normal,
    /// Look up from a fixed ancestor of the sending method's holder.
    Super {
        /// Type the search starts at.
        ancestor: KlassId,
    },
}

impl SendKind {
    /// Check for a super send.
    #[inline]
    pub const fn is_super(&self) -> bool {
        matches!(self, Self::Super { .. })
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Inline cache statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IcStats {
    /// Sends satisfied by the site's own cache.
    pub hits: u64,
    /// Sends handled by the miss handler.
    pub misses: u64,
    /// Sends resolved through the megamorphic stub or generic lookup.
    pub megamorphic_lookups: u64,
    /// Transitions into the monomorphic state.
    pub to_monomorphic: u64,
    /// Transitions into (or growth of) the polymorphic state.
    pub to_polymorphic: u64,
    /// Transitions into the megamorphic state.
    pub to_megamorphic: u64,
}

impl IcStats {
    /// Total sends seen.
    #[inline]
    pub fn total(&self) -> u64 {
        self.hits + self.misses + self.megamorphic_lookups
    }

    /// Fraction of sends that hit the site cache.
    #[inline]
    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
