//! The callable produced by a compilation.

use super::compiler::CompileStats;
use super::memory::{Region, Sealed};
use crate::bytecode::ByteOffset;
use std::collections::BTreeMap;

/// Native entry point: takes the address of the input buffer, returns nothing.
pub type EntryFn = unsafe extern "C" fn(input: *const i64);

/// Sealed native code for one program.
///
/// The code is read-only once built, so a `CompiledFunction` can be shared
/// and invoked from several threads at once; each invocation runs on the
/// caller's own stack with its own input buffer. The executable mapping is
/// released when the value is dropped.
pub struct CompiledFunction {
    region: Region<Sealed>,
    /// Bytecode offset -> native offset of each instruction's template.
    offsets: BTreeMap<ByteOffset, usize>,
    stats: CompileStats,
}

impl CompiledFunction {
    pub(crate) fn new(
        region: Region<Sealed>,
        offsets: BTreeMap<ByteOffset, usize>,
        stats: CompileStats,
    ) -> Self {
        Self {
            region,
            offsets,
            stats,
        }
    }

    fn entry(&self) -> EntryFn {
        // SAFETY: the region holds sealed code starting with the prologue
        // emitted for this calling convention.
        unsafe { std::mem::transmute::<*const u8, EntryFn>(self.region.as_ptr()) }
    }

    /// Run the program with a raw input pointer.
    ///
    /// # Safety
    /// `input` must point to at least as many readable words as the program
    /// executes INPUT instructions, and the program must be well formed
    /// (balanced stack, in-range GET/SET, reaches HALT).
    pub unsafe fn call(&self, input: *const i64) {
        let entry = self.entry();
        unsafe { entry(input) }
    }

    /// Run the program over `input`.
    ///
    /// # Safety
    /// The length of `input` is not checked; see [`CompiledFunction::call`].
    pub unsafe fn run(&self, input: &[i64]) {
        unsafe { self.call(input.as_ptr()) }
    }

    pub fn entry_ptr(&self) -> *const u8 {
        self.region.as_ptr()
    }

    /// Native code bytes.
    pub fn code(&self) -> &[u8] {
        self.region.code()
    }

    pub fn code_size(&self) -> usize {
        self.region.len()
    }

    /// Mapped size of the executable region.
    pub fn region_size(&self) -> usize {
        self.region.size()
    }

    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }

    /// Native offset at which the instruction at `offset` begins.
    pub fn native_offset(&self, offset: ByteOffset) -> Option<usize> {
        self.offsets.get(&offset).copied()
    }

    /// All instruction boundaries, in bytecode order.
    pub fn instruction_offsets(&self) -> impl Iterator<Item = (ByteOffset, usize)> + '_ {
        self.offsets.iter().map(|(k, v)| (*k, *v))
    }
}

impl std::fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("entry", &self.entry_ptr())
            .field("code_size", &self.code_size())
            .field("region_size", &self.region_size())
            .field("instructions", &self.offsets.len())
            .finish()
    }
}
