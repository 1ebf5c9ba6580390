//! PIC code layout.
//!
//! Encoders for the three PIC code shapes, and the instruction constants
//! the iterator and the dispatcher decode. Bodies are plain byte buffers:
//! every function here is a pure mapping between contents and bytes, so
//! it can be tested without executable memory.
//!
//! # Shapes
//!
//! ```text
//! interpreted-only           mixed                          megamorphic
//! ─────────────────          ─────────────────────          ─────────────────
//! call  pic_stub_n           [test tag, SMI_MASK]           call  mega_stub
//! .data klass_1, method_1    [jz   smi_target    ]          .data selector
//! ...                        [mov  klass, [recv] ]
//! .data klass_n, method_n    [cmp  klass, k_i    ]  × c
//!                            [je   code_i        ]
//!                            call pic_stub_n + data  |  jmp ic_miss
//! ```
//!
//! All immediates are 32-bit little endian. The shape is recognised from
//! the first instruction alone: `test`/`mov` start the mixed shape, `call`
//! into an interpreted-PIC stub starts the interpreted-only shape, `call`
//! into the megamorphic stub is the megamorphic shape.

use super::PicTarget;
use super::contents::PicContents;
use kestrel_core::SelectorId;

// =============================================================================
// Opcodes
// =============================================================================

/// `test receiver, imm8`: sets the tag flag for small integers.
pub const OP_TEST_TAG: u8 = 0xA8;
/// `jz imm32`: small-integer fast path into compiled code.
pub const OP_JZ_COMPILED: u8 = 0x74;
/// `jz imm32`: small-integer fast path into the interpreter.
pub const OP_JZ_INTERPRETED: u8 = 0x75;
/// `mov klass, [receiver + KLASS_OFFSET]`: load the receiver's type.
pub const OP_LOAD_KLASS: u8 = 0x8B;
/// `cmp klass, imm32`: compare the loaded type.
pub const OP_CMP_KLASS: u8 = 0x81;
/// `je imm32`: enter a compiled unit on a type match.
pub const OP_JE: u8 = 0x84;
/// `call imm32`: call a stub routine.
pub const OP_CALL: u8 = 0xE8;
/// `jmp imm32`: leave the PIC (always to the miss stub).
pub const OP_JMP: u8 = 0xE9;

/// Tag bits tested by the fast path.
pub const SMI_TAG_MASK: u8 = 0x03;
/// ModRM byte of the type load.
pub const LOAD_KLASS_MODRM: u8 = 0x50;
/// Offset of the type word in an object header.
pub const KLASS_OFFSET: u8 = 0x07;

// =============================================================================
// Instruction lengths
// =============================================================================

/// Length of the tag test.
pub const TEST_TAG_LEN: usize = 2;
/// Length of a fast-path branch.
pub const JZ_LEN: usize = 5;
/// Length of the type load.
pub const LOAD_KLASS_LEN: usize = 3;
/// Length of a type compare.
pub const CMP_LEN: usize = 5;
/// Length of a compiled-entry branch.
pub const JE_LEN: usize = 5;
/// Length of one compiled entry (compare + branch).
pub const COMPILED_ENTRY_LEN: usize = CMP_LEN + JE_LEN;
/// Length of a stub call.
pub const CALL_LEN: usize = 5;
/// Length of the miss jump.
pub const JMP_LEN: usize = 5;
/// Length of one embedded (type, method) pair.
pub const INTERPRETED_ENTRY_LEN: usize = 8;
/// Size of the megamorphic shape: stub call plus embedded selector.
pub const MEGAMORPHIC_CODE_SIZE: usize = CALL_LEN + 4;

// =============================================================================
// Stub routines
// =============================================================================

/// Inline-cache miss handler.
pub const IC_MISS_STUB: u32 = 0xFFFF_0000;
/// Megamorphic lookup stub.
pub const MEGAMORPHIC_STUB: u32 = 0xFFFF_0100;
/// First interpreted-PIC stub; stub `n` handles `n` embedded pairs.
pub const INTERPRETED_PIC_STUB_BASE: u32 = 0xFFFF_1000;
const INTERPRETED_PIC_STUB_STRIDE: u32 = 0x10;
/// Largest pair count with a dedicated interpreted-PIC stub.
pub const MAX_INTERPRETED_PIC_STUB: usize = 255;

/// Address of the interpreted-PIC stub for `entries` pairs.
///
/// # Panics
///
/// Panics if `entries` is zero or exceeds `MAX_INTERPRETED_PIC_STUB`.
#[inline]
pub fn interpreted_pic_stub(entries: usize) -> u32 {
    assert!(
        (1..=MAX_INTERPRETED_PIC_STUB).contains(&entries),
        "no interpreted PIC stub for {entries} entries"
    );
    INTERPRETED_PIC_STUB_BASE + entries as u32 * INTERPRETED_PIC_STUB_STRIDE
}

/// Pair count handled by an interpreted-PIC stub address.
#[inline]
pub fn interpreted_stub_entries(stub: u32) -> Option<usize> {
    let offset = stub.checked_sub(INTERPRETED_PIC_STUB_BASE)?;
    if offset % INTERPRETED_PIC_STUB_STRIDE != 0 {
        return None;
    }
    let n = (offset / INTERPRETED_PIC_STUB_STRIDE) as usize;
    (1..=MAX_INTERPRETED_PIC_STUB).contains(&n).then_some(n)
}

// =============================================================================
// Shapes
// =============================================================================

/// The three PIC code shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicShape {
    /// Only interpreted targets, dispatched by the shared stub.
    Interpreted,
    /// Fast path and/or compiled compare chain, optional interpreted tail.
    Mixed,
    /// Unspecialized: stub call plus selector.
    Megamorphic,
}

/// Recognise the shape of a PIC body from its first instruction.
///
/// # Panics
///
/// Panics on bytes that do not start a PIC body.
pub fn shape_of(code: &[u8]) -> PicShape {
    match code.first().copied() {
        Some(OP_TEST_TAG | OP_LOAD_KLASS) => PicShape::Mixed,
        Some(OP_CALL) => {
            let stub = read_u32(code, 1);
            if stub == MEGAMORPHIC_STUB {
                PicShape::Megamorphic
            } else if interpreted_stub_entries(stub).is_some() {
                PicShape::Interpreted
            } else {
                panic!("PIC body calls unknown stub {stub:#x}")
            }
        }
        // A body holding only the fast path and nothing else starts with
        // the tag test too; a bare miss jump is never emitted.
        other => panic!("not a PIC body: first opcode {other:?}"),
    }
}

/// Exact size of the dispatch code for the given entry counts.
#[inline]
pub const fn dispatch_code_size(smi: bool, compiled: usize, interpreted: usize) -> usize {
    let mut size = 0;
    if smi {
        size += TEST_TAG_LEN + JZ_LEN;
    }
    if compiled > 0 {
        size += LOAD_KLASS_LEN + compiled * COMPILED_ENTRY_LEN;
    }
    if interpreted > 0 {
        size += CALL_LEN + interpreted * INTERPRETED_ENTRY_LEN;
    } else {
        size += JMP_LEN;
    }
    size
}

// =============================================================================
// Encoding
// =============================================================================

/// Read a little-endian 32-bit immediate.
#[inline]
pub fn read_u32(code: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&code[at..at + 4]);
    u32::from_le_bytes(bytes)
}

/// Overwrite a little-endian 32-bit immediate in place.
///
/// A single aligned-size store: the only kind of write ever made to a
/// body that may be executing.
#[inline]
pub fn write_u32(code: &mut [u8], at: usize, value: u32) {
    code[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Append-only emitter for PIC bodies.
struct CodeBuffer {
    bytes: Vec<u8>,
}

impl CodeBuffer {
    fn with_capacity(size: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(size),
        }
    }

    fn emit_u8(&mut self, b: u8) {
        self.bytes.push(b);
    }

    fn emit_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn test_tag(&mut self) {
        self.emit_u8(OP_TEST_TAG);
        self.emit_u8(SMI_TAG_MASK);
    }

    fn jz(&mut self, target: PicTarget) {
        match target {
            PicTarget::Compiled(code) => {
                self.emit_u8(OP_JZ_COMPILED);
                self.emit_u32(code.raw());
            }
            PicTarget::Interpreted(method) => {
                self.emit_u8(OP_JZ_INTERPRETED);
                self.emit_u32(method.raw());
            }
        }
    }

    fn load_klass(&mut self) {
        self.emit_u8(OP_LOAD_KLASS);
        self.emit_u8(LOAD_KLASS_MODRM);
        self.emit_u8(KLASS_OFFSET);
    }

    fn cmp_klass(&mut self, klass: u32) {
        self.emit_u8(OP_CMP_KLASS);
        self.emit_u32(klass);
    }

    fn je(&mut self, code: u32) {
        self.emit_u8(OP_JE);
        self.emit_u32(code);
    }

    fn call(&mut self, stub: u32) {
        self.emit_u8(OP_CALL);
        self.emit_u32(stub);
    }

    fn jmp(&mut self, stub: u32) {
        self.emit_u8(OP_JMP);
        self.emit_u32(stub);
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// Emit the interpreted-only or mixed shape for `contents`.
///
/// # Panics
///
/// Panics on empty contents, or if the emitted length differs from
/// `dispatch_code_size`.
pub fn emit_dispatch(contents: &PicContents) -> Vec<u8> {
    assert!(!contents.is_empty(), "emitting an empty PIC");
    let size = contents.code_size();
    let mut buf = CodeBuffer::with_capacity(size);

    if let Some(target) = contents.smi_target() {
        buf.test_tag();
        buf.jz(target);
    }

    if !contents.compiled().is_empty() {
        buf.load_klass();
        for &(klass, code) in contents.compiled() {
            buf.cmp_klass(klass.raw());
            buf.je(code.raw());
        }
    }

    let interpreted = contents.interpreted();
    if interpreted.is_empty() {
        buf.jmp(IC_MISS_STUB);
    } else {
        buf.call(interpreted_pic_stub(interpreted.len()));
        for &(klass, method) in interpreted {
            buf.emit_u32(klass.raw());
            buf.emit_u32(method.raw());
        }
    }

    let code = buf.finish();
    assert_eq!(code.len(), size, "PIC code size mismatch");
    code
}

/// Emit the megamorphic shape for `selector`.
pub fn emit_megamorphic(selector: SelectorId) -> Vec<u8> {
    let mut buf = CodeBuffer::with_capacity(MEGAMORPHIC_CODE_SIZE);
    buf.call(MEGAMORPHIC_STUB);
    buf.emit_u32(selector.raw());
    let code = buf.finish();
    assert_eq!(code.len(), MEGAMORPHIC_CODE_SIZE, "PIC code size mismatch");
    code
}

// =============================================================================
// Tests
// =============================================================================
