//! Code buffer for building JIT code.
//!
//! The buffer exposes four emission primitives: literal bytes, relocatable
//! displacements, label binding at the current position and label references
//! from the current position. Displacements are left as zero placeholders and
//! filled in by the linker.

use super::label::LabelTable;
use crate::bytecode::ByteOffset;

/// Kind of a relocatable displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// 32-bit displacement relative to the end of the field.
    Rel32,
}

impl RelocKind {
    /// Width of the displacement field in bytes.
    pub fn width(self) -> usize {
        match self {
            RelocKind::Rel32 => 4,
        }
    }
}

/// An outstanding displacement to patch at link time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Position of the displacement field in the code.
    pub site: usize,
    /// Bytecode offset of the referenced label.
    pub target: ByteOffset,
    pub kind: RelocKind,
}

/// A buffer for building machine code.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    labels: LabelTable,
    relocs: Vec<Relocation>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Current native position.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit value (little-endian).
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Bind the label for bytecode `offset` at the current position.
    ///
    /// Returns `Err(previous)` if the label was already bound.
    pub fn bind_label(&mut self, offset: ByteOffset) -> Result<(), usize> {
        let pos = self.code.len();
        self.labels.bind(offset, pos).map(|_| ())
    }

    /// Reference the label for bytecode `offset` from the current position.
    pub fn reference_label(&mut self, offset: ByteOffset) -> Option<usize> {
        let site = self.code.len();
        self.labels.reference(offset, site)
    }

    /// Emit a placeholder displacement of `kind` pointing at the label for
    /// bytecode `target`.
    pub fn emit_reloc(&mut self, kind: RelocKind, target: ByteOffset) {
        self.reference_label(target);
        self.relocs.push(Relocation {
            site: self.code.len(),
            target,
            kind,
        });
        self.code.resize(self.code.len() + kind.width(), 0);
    }

    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocs
    }

    /// Unpatched code bytes.
    pub fn code(&self) -> &[u8] {
        &self.code
    }
}
