//! Recompiler frames.
//!
//! A `RecompilerFrame` is the policy's view of one real activation: what
//! it runs, what it has cost so far and how much work it causes. Frames
//! are materialized lazily from the stack walker, outward from the
//! trigger, and memoized in an `RFrameChain` so that a frame is never
//! built twice during one recompilation.

use crate::ic::{SiteOwner, SiteTable};
use crate::lookup::LookupKey;
use crate::runtime::code_table::CodeTable;
use crate::runtime::collaborators::{FrameKind, ObjectModel, StackWalker};
use kestrel_core::{CodeId, KlassId, MethodId, SiteId};
use rustc_hash::FxHashSet;

/// What a recompiler frame executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RFrameKind {
    /// Bytecode run by the interpreter.
    Interpreted,
    /// A compiled unit.
    Compiled {
        /// The executing unit.
        code: CodeId,
        /// The unit hit an uncommon trap.
        uncommon_trap: bool,
    },
}

/// One logical frame on the recompilation chain.
#[derive(Debug, Clone, PartialEq)]
pub struct RecompilerFrame {
    /// Distance from the trigger frame (0 is the trigger).
    pub depth: usize,
    /// Interpreted or compiled.
    pub kind: RFrameKind,
    /// Customization key of the code the frame runs.
    pub key: LookupKey,
    /// Source method.
    pub method: MethodId,
    /// Times the code was invoked since its counter was last reset.
    pub invocations: u32,
    /// Sends executed through the frame's own call sites.
    pub sends: u64,
    /// Sends including those of non-inlined nested blocks.
    pub cumul_sends: u64,
    /// Sends executed through the call site that invoked this frame.
    pub calling_site_sends: u64,
    /// Loop nesting at the current position.
    pub loop_depth: u8,
    /// Size estimate of recompiling the frame's code.
    pub cost: u32,
    /// Optimization level (0 when interpreted).
    pub level: u8,
    /// Call site in the caller that invoked this frame.
    pub calling_site: Option<SiteId>,
    /// Return address into the caller.
    pub return_address: usize,
    /// The frame runs a block body.
    pub is_block: bool,
    /// Arguments pushed for the call.
    pub arg_count: u8,
}

impl RecompilerFrame {
    /// Check for an interpreted frame.
    #[inline]
    pub fn is_interpreted(&self) -> bool {
        matches!(self.kind, RFrameKind::Interpreted)
    }

    /// Check for a compiled frame.
    #[inline]
    pub fn is_compiled(&self) -> bool {
        !self.is_interpreted()
    }

    /// The compiled unit, if any.
    #[inline]
    pub fn code(&self) -> Option<CodeId> {
        match self.kind {
            RFrameKind::Compiled { code, .. } => Some(code),
            RFrameKind::Interpreted => None,
        }
    }

    /// Check if the frame's unit hit an uncommon trap.
    #[inline]
    pub fn is_uncommon_trapped(&self) -> bool {
        matches!(
            self.kind,
            RFrameKind::Compiled {
                uncommon_trap: true,
                ..
            }
        )
    }

    /// Receiver type of the activation.
    #[inline]
    pub fn receiver_klass(&self) -> KlassId {
        self.key.klass
    }
}

// =============================================================================
// Frame Chain
// =============================================================================

/// Lazily materialized chain of recompiler frames.
pub struct RFrameChain<'a> {
    stack: &'a dyn StackWalker,
    model: &'a dyn ObjectModel,
    codes: &'a CodeTable,
    sites: &'a SiteTable,
    frames: Vec<RecompilerFrame>,
    ended: bool,
}

impl<'a> RFrameChain<'a> {
    /// Create an empty chain over the given stack.
    pub fn new(
        stack: &'a dyn StackWalker,
        model: &'a dyn ObjectModel,
        codes: &'a CodeTable,
        sites: &'a SiteTable,
    ) -> Self {
        Self {
            stack,
            model,
            codes,
            sites,
            frames: Vec::new(),
            ended: false,
        }
    }

    /// The frame at `depth`, materializing it and every frame below it.
    ///
    /// Returns `None` past the outermost frame, or at the first frame that
    /// does not describe legitimate code.
    pub fn frame(&mut self, depth: usize) -> Option<&RecompilerFrame> {
        while self.frames.len() <= depth && !self.ended {
            match self.materialize(self.frames.len()) {
                Some(frame) => self.frames.push(frame),
                None => self.ended = true,
            }
        }
        self.frames.get(depth)
    }

    /// Frames materialized so far.
    #[inline]
    pub fn materializations(&self) -> usize {
        self.frames.len()
    }

    /// The stack walker the chain reads from.
    #[inline]
    pub fn stack(&self) -> &'a dyn StackWalker {
        self.stack
    }

    fn materialize(&self, depth: usize) -> Option<RecompilerFrame> {
        let info = self.stack.frame(depth)?;
        let calling_site_sends = info
            .calling_site
            .and_then(|s| self.sites.get(s))
            .map_or(0, |s| u64::from(s.send_count()));

        let (kind, key, method, invocations, cost, level, owner) = match info.kind {
            FrameKind::Interpreted {
                method,
                receiver_klass,
            } => {
                let m = self.model.method_info(method)?;
                (
                    RFrameKind::Interpreted,
                    LookupKey::new(receiver_klass, m.selector),
                    method,
                    self.model.invocation_count(method),
                    m.size,
                    0,
                    SiteOwner::Interpreted(method),
                )
            }
            FrameKind::Compiled { code } => {
                let unit = self.codes.get(code)?;
                (
                    RFrameKind::Compiled {
                        code,
                        uncommon_trap: unit.is_uncommon_trapped(),
                    },
                    unit.key,
                    unit.method,
                    unit.invocation_counter(),
                    unit.footprint(),
                    unit.level(),
                    SiteOwner::Compiled(code),
                )
            }
        };

        let method_info = self.model.method_info(method);
        let sends = self.sites.sends_of(owner);
        let mut seen = FxHashSet::default();
        seen.insert(method);
        let cumul_sends = sends + self.block_sends(method, &mut seen);

        Some(RecompilerFrame {
            depth,
            kind,
            key,
            method,
            invocations,
            sends,
            cumul_sends,
            calling_site_sends,
            loop_depth: info.loop_depth,
            cost,
            level,
            calling_site: info.calling_site,
            return_address: info.return_address,
            is_block: method_info.as_ref().is_some_and(|m| m.is_block()),
            arg_count: method_info.map_or(0, |m| m.arg_count),
        })
    }

    /// Sends caused by the non-inlined blocks of `method`, recursively.
    fn block_sends(&self, method: MethodId, seen: &mut FxHashSet<MethodId>) -> u64 {
        let Some(info) = self.model.method_info(method) else {
            return 0;
        };
        let mut total = 0;
        for &block in &info.nested_blocks {
            if !seen.insert(block) {
                continue;
            }
            total += self.sites.sends_of(SiteOwner::Interpreted(block));
            total += self.block_sends(block, seen);
        }
        total
    }
}

impl std::fmt::Debug for RFrameChain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RFrameChain")
            .field("frames", &self.frames)
            .field("ended", &self.ended)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
