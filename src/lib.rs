//! tjit - a template JIT for a tiny stack bytecode
//!
//! This library decodes tjit bytecode, translates each instruction into a
//! fixed x86-64 template, and returns the result as callable native code.

pub mod bytecode;
pub mod config;
pub mod jit;

// Re-export commonly used types
pub use bytecode::{ByteOffset, DecodeError, Instruction, Op, ProgramBuilder, sample_multiply};
pub use config::{RuntimeConfig, StatsFormat};
pub use jit::{CompileOptions, CompileStats, CompiledFunction, Compiler, JitError, compile, compile_with};
