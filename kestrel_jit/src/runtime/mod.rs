//! Dispatch Runtime Module
//!
//! The process-wide state of the dispatch core and the interfaces it
//! consumes from the rest of the VM.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        DispatchRuntime                              │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐              │
//! │  │ LookupCache  │  │  CodeTable   │  │   PicHeap    │              │
//! │  │              │  │              │  │              │              │
//! │  │ (type, sel)  │  │ Live and     │  │ Live and     │              │
//! │  │ → result     │  │ zombie units │  │ retired PICs │              │
//! │  └──────────────┘  └──────────────┘  └──────────────┘              │
//! │  ┌──────────────┐  ┌──────────────┐                                │
//! │  │  SiteTable   │  │  CodeSpace   │                                │
//! │  └──────────────┘  └──────────────┘                                │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing here is global: the runtime is an explicit value handed to
//! the miss handler, the sweeper, the collector hooks and recompilation.
//!
//! # Usage
//!
//! ```ignore
//! use kestrel_jit::runtime::{DispatchConfig, DispatchRuntime};
//!
//! let mut rt = DispatchRuntime::new(DispatchConfig::default());
//! let site = rt.register_interpreted_site(method, selector, SendKind::Normal);
//! let target = rt.send(site, receiver_klass, &model)?;
//! ```

pub mod code_space;
pub mod code_table;
pub mod collaborators;
pub mod dispatch;

pub use code_space::{CODE_ALIGNMENT, CODE_SPACE_BASE, CodeSpace};
pub use code_table::{CodeTable, CodeTableStats, CompiledUnit, UnitSpec, UnitState};
pub use collaborators::{
    BlockHome, CodeGenerator, CompileReason, CompileRequest, CompiledCode, FrameInfo, FrameKind,
    MethodInfo, MethodKind, ObjectModel, SendSpec, StackWalker,
};
pub use dispatch::{DispatchRuntime, ReclaimReport};

use crate::ic::pic::layout::MAX_INTERPRETED_PIC_STUB;

// =============================================================================
// Dispatch Configuration
// =============================================================================

/// Configuration for the dispatch core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Most entries a PIC may hold before the site goes megamorphic.
    /// Never more than one interpreted-PIC stub can serve.
    pub max_pic_entries: usize,
    /// Switch to the megamorphic shape past the cap (else go generic).
    pub use_megamorphic_caches: bool,
    /// Enable adaptive recompilation.
    pub use_recompilation: bool,
    /// Invocation count at which a method or unit triggers.
    pub invocation_counter_limit: u32,
    /// Size of executable code space in bytes.
    pub code_space_bytes: usize,
    /// Most frames the policy walks up from the trigger.
    pub max_recompilation_search_length: usize,
    /// Largest callee footprint worth inlining into its caller.
    pub max_inline_cost: u32,
    /// Largest combined footprint of a recompilation.
    pub max_recompilation_size: u32,
    /// Percent of a caller's sends a callee must cause to walk past it.
    pub min_caller_send_ratio: u32,
    /// Benefit multiplier per loop nesting level.
    pub loop_weight: u32,
    /// Highest optimization level.
    pub max_optimization_level: u8,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_pic_entries: 4,
            use_megamorphic_caches: true,
            use_recompilation: true,
            invocation_counter_limit: 10_000,
            code_space_bytes: 8 * 1024 * 1024, // 8MB
            max_recompilation_search_length: 10,
            max_inline_cost: 150,
            max_recompilation_size: 4_000,
            min_caller_send_ratio: 10,
            loop_weight: 4,
            max_optimization_level: 3,
        }
    }
}

impl DispatchConfig {
    /// Create a config for testing (small limits, quick triggers).
    pub fn for_testing() -> Self {
        Self {
            invocation_counter_limit: 10,
            code_space_bytes: 64 * 1024, // 64KB
            ..Self::default()
        }
    }

    /// Set the PIC entry cap, clamped to `1..=MAX_INTERPRETED_PIC_STUB`.
    pub fn with_max_pic_entries(mut self, n: usize) -> Self {
        self.max_pic_entries = n.clamp(1, MAX_INTERPRETED_PIC_STUB);
        self
    }

    /// The PIC entry cap actually enforced.
    #[inline]
    pub fn pic_entry_cap(&self) -> usize {
        self.max_pic_entries.min(MAX_INTERPRETED_PIC_STUB)
    }

    /// Enable or disable the megamorphic shape.
    pub fn with_megamorphic_caches(mut self, enabled: bool) -> Self {
        self.use_megamorphic_caches = enabled;
        self
    }

    /// Enable or disable recompilation.
    pub fn with_recompilation(mut self, enabled: bool) -> Self {
        self.use_recompilation = enabled;
        self
    }

    /// Set the size of code space.
    pub fn with_code_space_bytes(mut self, bytes: usize) -> Self {
        self.code_space_bytes = bytes;
        self
    }

    /// Set the policy's frame search length.
    pub fn with_search_length(mut self, frames: usize) -> Self {
        self.max_recompilation_search_length = frames;
        self
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DispatchConfig::default();
        assert_eq!(config.max_pic_entries, 4);
        assert_eq!(config.code_space_bytes, 8 * 1024 * 1024);
        assert!(config.use_megamorphic_caches);
        assert!(config.use_recompilation);
    }

    #[test]
    fn test_testing_config() {
        let config = DispatchConfig::for_testing();
        assert_eq!(config.invocation_counter_limit, 10);
        assert_eq!(config.max_pic_entries, 4);
    }

    #[test]
    fn test_builders() {
        let config = DispatchConfig::for_testing()
            .with_max_pic_entries(3)
            .with_megamorphic_caches(false)
            .with_recompilation(false)
            .with_search_length(2);
        assert_eq!(config.max_pic_entries, 3);
        assert!(!config.use_megamorphic_caches);
        assert!(!config.use_recompilation);
        assert_eq!(config.max_recompilation_search_length, 2);
    }

    #[test]
    fn test_pic_cap_is_clamped() {
        let config = DispatchConfig::default().with_max_pic_entries(1000);
        assert_eq!(config.max_pic_entries, MAX_INTERPRETED_PIC_STUB);
        assert_eq!(DispatchConfig::default().with_max_pic_entries(0).max_pic_entries, 1);

        let raw = DispatchConfig {
            max_pic_entries: usize::MAX,
            ..DispatchConfig::default()
        };
        assert_eq!(raw.pic_entry_cap(), MAX_INTERPRETED_PIC_STUB);
    }
}
