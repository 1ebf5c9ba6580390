//! PIC iterator.
//!
//! A cursor over the entries of a PIC body that works across all three
//! shapes. The cursor's state is recovered from the opcode it sits on:
//!
//! ```text
//!   test ──► AtSmiEntry ──► cmp ──► AtCompiledEntry ─┐
//!     │                      │                ▲      │
//!     │                      │                └──────┘ cmp
//!     │                      ├── call ──► AtInterpretedEntry × n ──► AtEnd
//!     │                      └── jmp  ──► AtEnd
//!   mov ─► cmp ...
//!   call (interpreted stub) ──► AtInterpretedEntry × n ──► AtEnd
//!   call (megamorphic stub) ──► AtEnd
//! ```
//!
//! The iterator is generic over the buffer so the same code serves both
//! read-only traversal (`&[u8]`) and in-place patching (`&mut [u8]`).

use super::PicTarget;
use super::layout::{
    self, CMP_LEN, COMPILED_ENTRY_LEN, INTERPRETED_ENTRY_LEN, JZ_LEN, LOAD_KLASS_LEN, OP_CALL,
    OP_CMP_KLASS, OP_JMP, OP_JZ_COMPILED, OP_JZ_INTERPRETED, OP_LOAD_KLASS, OP_TEST_TAG, PicShape,
    TEST_TAG_LEN,
};
use kestrel_core::{CodeId, KlassId, MethodId};

/// Position of the cursor within the PIC body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterState {
    /// At the small-integer fast-path branch.
    AtSmiEntry,
    /// At a compare/branch pair.
    AtCompiledEntry,
    /// At an embedded (type, method) pair.
    AtInterpretedEntry,
    /// Past the last entry.
    AtEnd,
}

/// Cursor over the entries of a PIC body.
#[derive(Debug)]
pub struct PicIterator<C> {
    code: C,
    pos: usize,
    state: IterState,
    interpreted_left: usize,
}

impl<C: AsRef<[u8]>> PicIterator<C> {
    /// Position a new cursor at the first entry of `code`.
    pub fn new(code: C) -> Self {
        let mut it = Self {
            code,
            pos: 0,
            state: IterState::AtEnd,
            interpreted_left: 0,
        };
        match layout::shape_of(it.bytes()) {
            PicShape::Megamorphic => {}
            PicShape::Interpreted => it.compute_next_state(),
            PicShape::Mixed => {
                if it.bytes()[0] == OP_TEST_TAG {
                    it.pos = TEST_TAG_LEN;
                    it.state = IterState::AtSmiEntry;
                } else {
                    it.compute_next_state();
                }
            }
        }
        it
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        self.code.as_ref()
    }

    #[inline]
    fn read(&self, offset: usize) -> u32 {
        layout::read_u32(self.bytes(), self.pos + offset)
    }

    /// Decode the instruction at the cursor into the next state.
    fn compute_next_state(&mut self) {
        if self.bytes()[self.pos] == OP_LOAD_KLASS {
            self.pos += LOAD_KLASS_LEN;
        }
        match self.bytes()[self.pos] {
            OP_CMP_KLASS => self.state = IterState::AtCompiledEntry,
            OP_CALL => {
                let stub = self.read(1);
                let Some(n) = layout::interpreted_stub_entries(stub) else {
                    panic!("PIC calls unknown stub {stub:#x} at offset {}", self.pos);
                };
                self.pos += layout::CALL_LEN;
                self.interpreted_left = n;
                self.state = IterState::AtInterpretedEntry;
            }
            OP_JMP => self.state = IterState::AtEnd,
            op => panic!("unexpected opcode {op:#04x} at PIC offset {}", self.pos),
        }
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> IterState {
        self.state
    }

    /// Byte offset of the cursor.
    #[inline]
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Check if the traversal is finished.
    #[inline]
    pub fn at_end(&self) -> bool {
        self.state == IterState::AtEnd
    }

    /// Move to the next entry.
    pub fn advance(&mut self) {
        match self.state {
            IterState::AtSmiEntry => {
                self.pos += JZ_LEN;
                self.compute_next_state();
            }
            IterState::AtCompiledEntry => {
                self.pos += COMPILED_ENTRY_LEN;
                self.compute_next_state();
            }
            IterState::AtInterpretedEntry => {
                self.pos += INTERPRETED_ENTRY_LEN;
                self.interpreted_left -= 1;
                if self.interpreted_left == 0 {
                    self.state = IterState::AtEnd;
                }
            }
            IterState::AtEnd => panic!("advancing a PIC iterator past the end"),
        }
    }

    /// Receiver type of the current entry.
    pub fn klass(&self) -> KlassId {
        match self.state {
            IterState::AtSmiEntry => KlassId::SMALL_INTEGER,
            IterState::AtCompiledEntry => KlassId::new(self.read(1)),
            IterState::AtInterpretedEntry => KlassId::new(self.read(0)),
            IterState::AtEnd => panic!("klass() of a PIC iterator at end"),
        }
    }

    /// Check if the current entry jumps into compiled code.
    pub fn is_compiled(&self) -> bool {
        match self.state {
            IterState::AtSmiEntry => self.bytes()[self.pos] == OP_JZ_COMPILED,
            IterState::AtCompiledEntry => true,
            _ => false,
        }
    }

    /// Check if the current entry dispatches to the interpreter.
    pub fn is_interpreted(&self) -> bool {
        match self.state {
            IterState::AtSmiEntry => self.bytes()[self.pos] == OP_JZ_INTERPRETED,
            IterState::AtInterpretedEntry => true,
            _ => false,
        }
    }

    /// Compiled unit of the current entry.
    ///
    /// # Panics
    ///
    /// Panics if the entry is not compiled.
    pub fn compiled_code(&self) -> CodeId {
        assert!(self.is_compiled(), "entry at offset {} is not compiled", self.pos);
        CodeId::new(self.read(self.target_offset()))
    }

    /// Interpreted method of the current entry.
    ///
    /// # Panics
    ///
    /// Panics if the entry is not interpreted.
    pub fn interpreted_method(&self) -> MethodId {
        assert!(
            self.is_interpreted(),
            "entry at offset {} is not interpreted",
            self.pos
        );
        MethodId::new(self.read(self.target_offset()))
    }

    /// Target of the current entry.
    pub fn target(&self) -> PicTarget {
        if self.is_compiled() {
            PicTarget::Compiled(self.compiled_code())
        } else {
            PicTarget::Interpreted(self.interpreted_method())
        }
    }

    /// Offset of the target immediate relative to the cursor.
    fn target_offset(&self) -> usize {
        match self.state {
            IterState::AtSmiEntry => 1,
            IterState::AtCompiledEntry => CMP_LEN + 1,
            IterState::AtInterpretedEntry => 4,
            IterState::AtEnd => panic!("target of a PIC iterator at end"),
        }
    }

    /// Offset of the type immediate relative to the cursor.
    fn klass_offset(&self) -> usize {
        match self.state {
            IterState::AtCompiledEntry => 1,
            IterState::AtInterpretedEntry => 0,
            IterState::AtSmiEntry => panic!("the fast-path type is implicit"),
            IterState::AtEnd => panic!("klass of a PIC iterator at end"),
        }
    }
}

impl<C: AsRef<[u8]> + AsMut<[u8]>> PicIterator<C> {
    #[inline]
    fn write(&mut self, offset: usize, value: u32) {
        let at = self.pos + offset;
        layout::write_u32(self.code.as_mut(), at, value);
    }

    /// Overwrite the type of the current entry.
    ///
    /// # Panics
    ///
    /// Panics at the fast-path entry, whose type is implicit.
    pub fn set_klass(&mut self, klass: KlassId) {
        let offset = self.klass_offset();
        self.write(offset, klass.raw());
    }

    /// Repoint the current compiled entry at another unit.
    ///
    /// # Panics
    ///
    /// Panics if the entry is not compiled.
    pub fn set_compiled_code(&mut self, code: CodeId) {
        assert!(self.is_compiled(), "entry at offset {} is not compiled", self.pos);
        let offset = self.target_offset();
        self.write(offset, code.raw());
    }

    /// Repoint the current interpreted entry at another method.
    ///
    /// # Panics
    ///
    /// Panics if the entry is not interpreted.
    pub fn set_interpreted_method(&mut self, method: MethodId) {
        assert!(
            self.is_interpreted(),
            "entry at offset {} is not interpreted",
            self.pos
        );
        let offset = self.target_offset();
        self.write(offset, method.raw());
    }

    /// Repoint the current entry at a target of the same kind.
    ///
    /// Returns `false`, leaving the code untouched, when the kinds differ:
    /// such a change alters the layout and needs a rebuild.
    pub fn set_target(&mut self, target: PicTarget) -> bool {
        match target {
            PicTarget::Compiled(code) if self.is_compiled() => {
                self.set_compiled_code(code);
                true
            }
            PicTarget::Interpreted(method) if self.is_interpreted() => {
                self.set_interpreted_method(method);
                true
            }
            _ => false,
        }
    }
}

/// Collect every (type, target) pair of a PIC body in decoding order.
pub fn collect_entries(code: &[u8]) -> Vec<(KlassId, PicTarget)> {
    let mut out = Vec::new();
    let mut it = PicIterator::new(code);
    while !it.at_end() {
        out.push((it.klass(), it.target()));
        it.advance();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ic::pic::contents::PicContents;
    use kestrel_core::SelectorId;

    fn mixed() -> Vec<u8> {
        let mut c = PicContents::new();
        c.append(KlassId::SMALL_INTEGER, PicTarget::Compiled(CodeId::new(1)));
        c.append(KlassId::new(5), PicTarget::Compiled(CodeId::new(2)));
        c.append(KlassId::new(6), PicTarget::Compiled(CodeId::new(3)));
        c.append(KlassId::new(7), PicTarget::Interpreted(MethodId::new(4)));
        layout::emit_dispatch(&c)
    }

    #[test]
    fn test_walk_mixed() {
        let code = mixed();
        let mut it = PicIterator::new(code.as_slice());
        assert_eq!(it.state(), IterState::AtSmiEntry);
        assert_eq!(it.klass(), KlassId::SMALL_INTEGER);
        assert_eq!(it.compiled_code(), CodeId::new(1));
        it.advance();
        assert_eq!(it.state(), IterState::AtCompiledEntry);
        assert_eq!(it.klass(), KlassId::new(5));
        it.advance();
        assert_eq!(it.compiled_code(), CodeId::new(3));
        it.advance();
        assert_eq!(it.state(), IterState::AtInterpretedEntry);
        assert_eq!(it.interpreted_method(), MethodId::new(4));
        it.advance();
        assert!(it.at_end());
    }

    #[test]
    fn test_walk_compiled_only_ends_at_jump() {
        let mut c = PicContents::new();
        c.append(KlassId::new(5), PicTarget::Compiled(CodeId::new(2)));
        let code = layout::emit_dispatch(&c);
        let entries = collect_entries(&code);
        assert_eq!(entries, vec![(KlassId::new(5), PicTarget::Compiled(CodeId::new(2)))]);
    }

    #[test]
    fn test_walk_megamorphic_is_empty() {
        let code = layout::emit_megamorphic(SelectorId::new(3));
        let it = PicIterator::new(code.as_slice());
        assert!(it.at_end());
    }

    #[test]
    fn test_traversal_is_idempotent() {
        let code = mixed();
        assert_eq!(collect_entries(&code), collect_entries(&code));
        assert_eq!(collect_entries(&code).len(), 4);
    }

    #[test]
    fn test_patch_in_place() {
        let mut code = mixed();
        let len = code.len();
        {
            let mut it = PicIterator::new(code.as_mut_slice());
            it.advance();
            it.set_compiled_code(CodeId::new(42));
            it.advance();
            it.advance();
            it.set_klass(KlassId::new(70));
            assert!(!it.set_target(PicTarget::Compiled(CodeId::new(9))));
            assert!(it.set_target(PicTarget::Interpreted(MethodId::new(40))));
        }
        assert_eq!(code.len(), len);
        let entries = collect_entries(&code);
        assert_eq!(entries[1], (KlassId::new(5), PicTarget::Compiled(CodeId::new(42))));
        assert_eq!(
            entries[3],
            (KlassId::new(70), PicTarget::Interpreted(MethodId::new(40)))
        );
    }

    #[test]
    #[should_panic(expected = "implicit")]
    fn test_set_smi_klass_panics() {
        let mut code = mixed();
        let mut it = PicIterator::new(code.as_mut_slice());
        it.set_klass(KlassId::new(9));
    }

    #[test]
    #[should_panic(expected = "past the end")]
    fn test_advance_past_end_panics() {
        let code = layout::emit_megamorphic(SelectorId::new(3));
        let mut it = PicIterator::new(code.as_slice());
        it.advance();
    }
}
