//! Template JIT for tjit bytecode.
//!
//! Pipeline:
//! - `compiler`: decode the bytecode and emit one template per instruction
//! - `codebuf` / `label` / `x86_64`: byte emission, branch labels, encoding
//! - `linker`: resolve labels, fix the size, encode into the destination
//! - `memory`: page-granular W^X regions (writable → filled → sealed)
//! - `function`: the callable result

pub mod codebuf;
pub mod compiler;
pub mod function;
pub mod label;
pub mod linker;
pub mod memory;
pub mod x86_64;

use crate::bytecode::DecodeError;
use linker::LinkError;
use memory::MemoryError;
use thiserror::Error;

pub use compiler::{CompileOptions, CompileStats, Compiler, PrintFn, print_i64};
pub use function::CompiledFunction;

/// Everything that can go wrong between bytecode and callable code.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("link error: {0}")]
    Link(#[from] LinkError),
    #[error("resource error: {0}")]
    Resource(#[from] MemoryError),
    #[error("native code generation requires an x86-64 Unix host")]
    UnsupportedHost,
}

/// Compile `program` with default options (PRINT writes to stdout).
pub fn compile(program: &[u8]) -> Result<CompiledFunction, JitError> {
    Compiler::default().compile(program)
}

/// Compile `program` with the given options.
pub fn compile_with(program: &[u8], options: CompileOptions) -> Result<CompiledFunction, JitError> {
    Compiler::new(options).compile(program)
}
