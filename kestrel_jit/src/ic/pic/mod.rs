//! Polymorphic Inline Caches
//!
//! A PIC is a block of generated dispatch code plus a small header. The
//! code is the only representation of the cached (type → target) pairs:
//! introspection goes through `PicIterator`, which decodes the bytes.
//!
//! # Mutation rules
//!
//! A PIC body may be on a suspended activation's stack at any time, so it
//! is only ever changed in two ways:
//!
//! - one 32-bit target immediate is overwritten in place, when the type
//!   set and the entry kinds stay the same;
//! - a complete new PIC is built and the old one retired to the heap's
//!   graveyard, for everything else.
//!
//! Megamorphic PICs hold no per-type data and are never rebuilt.

pub mod contents;
pub mod heap;
pub mod iterator;
pub mod layout;

pub use contents::PicContents;
pub use heap::{AllocateOutcome, CleanupOutcome, PicHeap, PicHeapStats, PreviousTarget};
pub use iterator::{IterState, PicIterator};
pub use layout::PicShape;

use crate::lookup::LookupResult;
use kestrel_core::{CodeId, KlassId, MethodId, PicId, SelectorId, SiteId};

// =============================================================================
// Targets
// =============================================================================

/// Where a PIC entry sends a matching receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PicTarget {
    /// Jump straight into a compiled unit.
    Compiled(CodeId),
    /// Interpret a method.
    Interpreted(MethodId),
}

impl PicTarget {
    /// Convert a lookup result; `None` for an empty result.
    #[inline]
    pub fn from_result(result: LookupResult) -> Option<Self> {
        match result {
            LookupResult::Empty => None,
            LookupResult::Method(method) => Some(Self::Interpreted(method)),
            LookupResult::Entry { code, .. } => Some(Self::Compiled(code)),
        }
    }

    /// Check if the target is compiled code.
    #[inline]
    pub const fn is_compiled(&self) -> bool {
        matches!(self, Self::Compiled(_))
    }

    /// Check whether this target is what `result` currently resolves to.
    #[inline]
    pub fn agrees_with(&self, result: &LookupResult) -> bool {
        match *self {
            Self::Compiled(code) => result.matches_code(code),
            Self::Interpreted(method) => result.matches_method(method),
        }
    }
}

/// Outcome of executing a PIC body for one receiver type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicDispatch {
    /// Entered compiled code.
    Compiled(CodeId),
    /// Handed off to the interpreter.
    Interpreted(MethodId),
    /// No entry matched; the miss stub runs.
    Miss,
    /// Megamorphic stub lookup for the embedded selector.
    Megamorphic(SelectorId),
}

/// An object reference embedded in PIC code, as seen by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddedRef {
    /// A receiver type compared against.
    Klass(KlassId),
    /// An interpreted target.
    Method(MethodId),
    /// The selector of a megamorphic PIC.
    Selector(SelectorId),
}

// =============================================================================
// Polymorphic Inline Cache
// =============================================================================

/// A generated multi-entry inline cache.
#[derive(Debug, Clone)]
pub struct PolymorphicInlineCache {
    id: PicId,
    /// Call site that owns (and calls) this PIC.
    owner: SiteId,
    /// Logical entry count; `0` marks the megamorphic shape.
    entry_count: u16,
    /// Address of the first code byte.
    address: usize,
    code: Vec<u8>,
}

impl PolymorphicInlineCache {
    /// Build a dispatch PIC (interpreted-only or mixed shape).
    pub(crate) fn build(id: PicId, owner: SiteId, address: usize, contents: &PicContents) -> Self {
        debug_assert!(contents.verify(), "duplicate types in PIC contents");
        let code = layout::emit_dispatch(contents);
        Self {
            id,
            owner,
            entry_count: contents.len() as u16,
            address,
            code,
        }
    }

    /// Build a megamorphic PIC.
    pub(crate) fn build_megamorphic(
        id: PicId,
        owner: SiteId,
        address: usize,
        selector: SelectorId,
    ) -> Self {
        Self {
            id,
            owner,
            entry_count: 0,
            address,
            code: layout::emit_megamorphic(selector),
        }
    }

    /// Identity of this PIC.
    #[inline]
    pub fn id(&self) -> PicId {
        self.id
    }

    /// Owning call site.
    #[inline]
    pub fn owner(&self) -> SiteId {
        self.owner
    }

    /// Address of the first code byte.
    #[inline]
    pub fn address(&self) -> usize {
        self.address
    }

    /// Generated code length in bytes.
    #[inline]
    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    /// The generated code.
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Number of entries; zero for a megamorphic PIC.
    #[inline]
    pub fn entry_count(&self) -> usize {
        usize::from(self.entry_count)
    }

    /// Check for the megamorphic shape.
    #[inline]
    pub fn is_megamorphic(&self) -> bool {
        self.entry_count == 0
    }

    /// Code shape, recognised from the first instruction.
    #[inline]
    pub fn shape(&self) -> PicShape {
        layout::shape_of(&self.code)
    }

    /// Check if `addr` lies inside the code.
    #[inline]
    pub fn contains_address(&self, addr: usize) -> bool {
        addr >= self.address && addr < self.address + self.code.len()
    }

    /// Selector embedded in a megamorphic PIC.
    pub fn selector(&self) -> Option<SelectorId> {
        self.is_megamorphic()
            .then(|| SelectorId::new(layout::read_u32(&self.code, layout::CALL_LEN)))
    }

    /// Cursor over the entries.
    #[inline]
    pub fn iter(&self) -> PicIterator<&[u8]> {
        PicIterator::new(self.code.as_slice())
    }

    #[inline]
    fn iter_mut(&mut self) -> PicIterator<&mut [u8]> {
        PicIterator::new(self.code.as_mut_slice())
    }

    /// All entries in decoding order.
    pub fn entries(&self) -> Vec<(KlassId, PicTarget)> {
        iterator::collect_entries(&self.code)
    }

    /// Rebuild a contents builder from the code.
    pub fn contents(&self) -> PicContents {
        let mut contents = PicContents::new();
        let mut it = self.iter();
        while !it.at_end() {
            contents.append(it.klass(), it.target());
            it.advance();
        }
        contents
    }

    /// Target cached for `klass`.
    pub fn target_for(&self, klass: KlassId) -> Option<PicTarget> {
        let mut it = self.iter();
        while !it.at_end() {
            if it.klass() == klass {
                return Some(it.target());
            }
            it.advance();
        }
        None
    }

    /// Execute the code for a receiver of type `klass`.
    ///
    /// Interprets the generated instructions directly, without the
    /// iterator, so it doubles as a check that both decoders agree.
    pub fn dispatch(&self, klass: KlassId) -> PicDispatch {
        use layout::*;

        let code = &self.code;
        let mut pc = 0;
        let mut zero_flag = false;
        let mut loaded = 0u32;
        loop {
            match code[pc] {
                OP_TEST_TAG => {
                    zero_flag = klass.is_small_integer();
                    pc += TEST_TAG_LEN;
                }
                OP_JZ_COMPILED if zero_flag => {
                    return PicDispatch::Compiled(CodeId::new(read_u32(code, pc + 1)));
                }
                OP_JZ_INTERPRETED if zero_flag => {
                    return PicDispatch::Interpreted(MethodId::new(read_u32(code, pc + 1)));
                }
                OP_JZ_COMPILED | OP_JZ_INTERPRETED => pc += JZ_LEN,
                OP_LOAD_KLASS => {
                    loaded = klass.raw();
                    pc += LOAD_KLASS_LEN;
                }
                OP_CMP_KLASS => {
                    zero_flag = read_u32(code, pc + 1) == loaded;
                    pc += CMP_LEN;
                }
                OP_JE if zero_flag => {
                    return PicDispatch::Compiled(CodeId::new(read_u32(code, pc + 1)));
                }
                OP_JE => pc += JE_LEN,
                OP_CALL => {
                    let stub = read_u32(code, pc + 1);
                    let data = pc + CALL_LEN;
                    if stub == MEGAMORPHIC_STUB {
                        return PicDispatch::Megamorphic(SelectorId::new(read_u32(code, data)));
                    }
                    let Some(n) = interpreted_stub_entries(stub) else {
                        panic!("PIC {} calls unknown stub {stub:#x}", self.id);
                    };
                    return (0..n)
                        .map(|i| data + i * INTERPRETED_ENTRY_LEN)
                        .find(|&at| read_u32(code, at) == klass.raw())
                        .map_or(PicDispatch::Miss, |at| {
                            PicDispatch::Interpreted(MethodId::new(read_u32(code, at + 4)))
                        });
                }
                OP_JMP => return PicDispatch::Miss,
                op => panic!("PIC {} has bad opcode {op:#04x} at {pc}", self.id),
            }
        }
    }

    /// Patch the compiled entry for `klass` to enter `code`.
    ///
    /// Returns `false` if `klass` has no compiled entry; the caller must
    /// then rebuild.
    pub(crate) fn patch_compiled(&mut self, klass: KlassId, code: CodeId) -> bool {
        let mut it = self.iter_mut();
        while !it.at_end() {
            if it.klass() == klass {
                if !it.is_compiled() {
                    return false;
                }
                it.set_compiled_code(code);
                return true;
            }
            it.advance();
        }
        false
    }

    /// Re-validate every entry against `resolve`.
    ///
    /// Targets of the same kind are patched in place; anything that
    /// changes the layout yields a plan for the heap to carry out.
    pub(crate) fn cleanup(&mut self, mut resolve: impl FnMut(KlassId) -> LookupResult) -> CleanupPlan {
        if self.is_megamorphic() {
            return CleanupPlan::Kept { patched: 0 };
        }

        let mut survivors = PicContents::new();
        let mut patches = Vec::new();
        let mut layout_changed = false;
        for (klass, target) in self.entries() {
            let result = resolve(klass);
            match PicTarget::from_result(result) {
                None => layout_changed = true,
                Some(current) if current == target => survivors.append(klass, target),
                Some(current) => {
                    if current.is_compiled() != target.is_compiled() {
                        layout_changed = true;
                    } else {
                        patches.push((klass, current));
                    }
                    survivors.append(klass, current);
                }
            }
        }

        if layout_changed {
            return match survivors.len() {
                0 => CleanupPlan::Discard,
                1 => match survivors.entries()[0].1 {
                    PicTarget::Compiled(code) => CleanupPlan::Collapse(code),
                    PicTarget::Interpreted(_) => CleanupPlan::Rebuild(survivors),
                },
                _ => CleanupPlan::Rebuild(survivors),
            };
        }

        let patched = patches.len();
        if patched > 0 {
            let mut it = self.iter_mut();
            while !it.at_end() {
                let klass = it.klass();
                if let Some(&(_, target)) = patches.iter().find(|(k, _)| *k == klass) {
                    let same_kind = it.set_target(target);
                    debug_assert!(same_kind);
                }
                it.advance();
            }
        }
        CleanupPlan::Kept { patched }
    }

    /// Visit every embedded object reference, writing back any the
    /// visitor relocates.
    ///
    /// The fast-path type is implicit in the tag test and not visited.
    pub fn oops_do(&mut self, f: &mut dyn FnMut(&mut EmbeddedRef)) {
        if let Some(selector) = self.selector() {
            let mut r = EmbeddedRef::Selector(selector);
            f(&mut r);
            let EmbeddedRef::Selector(moved) = r else {
                panic!("relocation changed the kind of a PIC reference");
            };
            layout::write_u32(&mut self.code, layout::CALL_LEN, moved.raw());
            return;
        }

        let mut it = self.iter_mut();
        while !it.at_end() {
            if it.state() != IterState::AtSmiEntry {
                let mut r = EmbeddedRef::Klass(it.klass());
                f(&mut r);
                let EmbeddedRef::Klass(moved) = r else {
                    panic!("relocation changed the kind of a PIC reference");
                };
                it.set_klass(moved);
            }
            if it.is_interpreted() {
                let mut r = EmbeddedRef::Method(it.interpreted_method());
                f(&mut r);
                let EmbeddedRef::Method(moved) = r else {
                    panic!("relocation changed the kind of a PIC reference");
                };
                it.set_interpreted_method(moved);
            }
            it.advance();
        }
    }

    /// Check the header against the code and type uniqueness.
    pub fn verify(&self) -> bool {
        if self.is_megamorphic() {
            return self.code.len() == layout::MEGAMORPHIC_CODE_SIZE
                && self.shape() == PicShape::Megamorphic;
        }
        let contents = self.contents();
        contents.len() == self.entry_count()
            && contents.code_size() == self.code.len()
            && contents.verify()
    }
}

/// What a cleanup pass decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CleanupPlan {
    /// Same layout; `patched` targets were rewritten in place.
    Kept {
        /// Entries patched in place.
        patched: usize,
    },
    /// Layout changed; build a new PIC from these contents.
    Rebuild(PicContents),
    /// A single compiled entry remains; call it directly.
    Collapse(CodeId),
    /// Nothing remains.
    Discard,
}

// =============================================================================
// Tests
// =============================================================================
