//! Collaborator interfaces.
//!
//! The dispatch core consumes the object model, the code generator and
//! stack introspection through these narrow traits. The interpreter,
//! compiler backend and collector implement them; tests implement them
//! with scripted tables (see `crate::testing`).

use crate::ic::SendKind;
use crate::lookup::LookupKey;
use kestrel_core::{CodeId, DispatchResult, KlassId, MethodId, ObjectRef, SelectorId, SiteId};
use smallvec::SmallVec;

// =============================================================================
// Object Model
// =============================================================================

/// Whether a method is an ordinary method or a block body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// An ordinary method.
    Normal,
    /// A block body, lexically nested in `outer`.
    Block {
        /// The lexically enclosing method.
        outer: MethodId,
    },
}

/// Static facts about an interpretable method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    /// Selector the method implements.
    pub selector: SelectorId,
    /// Type whose method dictionary holds the method.
    pub holder: KlassId,
    /// Bytecode footprint, the cost estimate for compiling it.
    pub size: u32,
    /// Number of arguments (not counting the receiver).
    pub arg_count: u8,
    /// Ordinary method or block.
    pub kind: MethodKind,
    /// Non-inlined blocks created by this method.
    pub nested_blocks: SmallVec<[MethodId; 2]>,
}

impl MethodInfo {
    /// Create info for an ordinary method.
    pub fn new(selector: SelectorId, holder: KlassId, size: u32) -> Self {
        Self {
            selector,
            holder,
            size,
            arg_count: 0,
            kind: MethodKind::Normal,
            nested_blocks: SmallVec::new(),
        }
    }

    /// Set the argument count.
    pub fn with_arg_count(mut self, arg_count: u8) -> Self {
        self.arg_count = arg_count;
        self
    }

    /// Mark as a block nested in `outer`.
    pub fn as_block(mut self, outer: MethodId) -> Self {
        self.kind = MethodKind::Block { outer };
        self
    }

    /// Record a nested, non-inlined block.
    pub fn with_block(mut self, block: MethodId) -> Self {
        self.nested_blocks.push(block);
        self
    }

    /// Check if this is a block body.
    #[inline]
    pub fn is_block(&self) -> bool {
        matches!(self.kind, MethodKind::Block { .. })
    }
}

/// The home context a block value closes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHome {
    /// Receiver type of the home activation.
    pub receiver_klass: KlassId,
    /// The home method.
    pub method: MethodId,
}

/// Type system and method objects.
pub trait ObjectModel {
    /// Full method-dictionary search starting at `klass` and walking up
    /// the superclass chain.
    fn lookup_method(&self, klass: KlassId, selector: SelectorId) -> Option<MethodId>;

    /// Static facts about a method, or `None` when `method` does not name
    /// a legitimate method object.
    fn method_info(&self, method: MethodId) -> Option<MethodInfo>;

    /// Current interpreter invocation counter of a method.
    fn invocation_count(&self, method: MethodId) -> u32;

    /// Reset a method's invocation counter to zero.
    fn reset_invocation_counter(&mut self, method: MethodId);

    /// Home context of a block value, or `None` if the home activation
    /// has already returned.
    fn block_home(&self, block: ObjectRef) -> Option<BlockHome>;

    /// Clear memoized `perform:`-style dispatch results.
    fn flush_perform_caches(&mut self) {}
}

// =============================================================================
// Code Generator
// =============================================================================

/// Why a compilation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileReason {
    /// An invocation counter overflowed.
    CounterOverflow,
    /// A compiled unit hit an uncommon trap and must be rebuilt.
    UncommonTrap,
}

/// A request handed to the code generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    /// Customization key (receiver type, selector).
    pub key: LookupKey,
    /// Method to compile.
    pub method: MethodId,
    /// Optimization level to compile at.
    pub level: u8,
    /// Trigger reason.
    pub reason: CompileReason,
}

/// A non-inlined send emitted into a compiled body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSpec {
    /// Selector sent.
    pub selector: SelectorId,
    /// Normal or super send.
    pub kind: SendKind,
}

/// Description of a freshly generated machine-code body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCode {
    /// Machine-code size in bytes.
    pub code_size: usize,
    /// Total bytecode footprint including inlined callees.
    pub footprint: u32,
    /// Call sites left in the body.
    pub sends: Vec<SendSpec>,
}

/// Produces compiled units.
pub trait CodeGenerator {
    /// Generate code for `request.method` customized to `request.key`.
    fn compile(&mut self, request: &CompileRequest) -> DispatchResult<CompiledCode>;
}

// =============================================================================
// Stack Introspection
// =============================================================================

/// What kind of code an activation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// An interpreter activation.
    Interpreted {
        /// Executing method.
        method: MethodId,
        /// Receiver type.
        receiver_klass: KlassId,
    },
    /// An activation of compiled code.
    Compiled {
        /// Executing compiled unit.
        code: CodeId,
    },
}

/// One real activation, as reported by the stack walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Interpreted or compiled.
    pub kind: FrameKind,
    /// Inline cache in the caller that invoked this activation.
    pub calling_site: Option<SiteId>,
    /// Loop nesting depth at the current position.
    pub loop_depth: u8,
    /// Return address into the caller.
    pub return_address: usize,
}

/// Walks real stack frames outward from the counter-overflow point.
pub trait StackWalker {
    /// The activation `depth` frames below the top (0 is the trigger).
    fn frame(&self, depth: usize) -> Option<FrameInfo>;

    /// A value on the expression stack of frame `depth`, counted from the
    /// top of that frame's stack (0 is the topmost pushed value).
    fn stack_value(&self, depth: usize, slot_from_top: usize) -> Option<ObjectRef>;

    /// Every return address and program counter held by a live
    /// activation, used to decide when retired code may be reclaimed.
    fn active_addresses(&self) -> Vec<usize>;
}
