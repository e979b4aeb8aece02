//! Template JIT compiler for tjit bytecode on x86-64.
//!
//! Every bytecode instruction maps to one fixed machine-code template,
//! parameterized only by its own operand or branch target. No temporaries are
//! carried between templates: the value stack lives on the native stack
//! (RSP is the value-stack pointer) and the input cursor lives in a
//! callee-saved register.

use super::JitError;
use super::codebuf::CodeBuffer;
use super::function::CompiledFunction;
use super::linker::{LinkError, link};
use super::memory::ExecutableMemoryArena;
use super::x86_64::{Cond, Reg, X86_64Assembler};
use crate::bytecode::{Decoder, Instruction, Op};
use serde::Serialize;
use std::io::Write;
use std::time::Instant;
use tracing::{debug, trace};

/// External routine invoked by PRINT.
pub type PrintFn = extern "C" fn(i64);

/// Default PRINT routine: the value in decimal followed by a newline on stdout.
pub extern "C" fn print_i64(value: i64) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{}", value);
}

/// Fixed registers used by the generated code.
pub mod regs {
    use super::Reg;

    /// First integer argument (System V).
    pub const ARG0: Reg = Reg::Rdi;
    pub const FRAME: Reg = Reg::Rbp;
    /// Native stack pointer, doubling as the value-stack pointer.
    pub const VSTACK: Reg = Reg::Rsp;

    // Temporaries, dead at every instruction boundary
    pub const TMP0: Reg = Reg::Rax;
    pub const TMP1: Reg = Reg::Rcx;
    pub const TMP2: Reg = Reg::Rdx;
}

/// Size of one value-stack slot.
pub const SLOT_SIZE: i32 = 8;

/// Size of one input element.
pub const INPUT_WORD_SIZE: i32 = 8;

/// Registers holding VM state for the lifetime of a compiled function.
///
/// Both must be callee-saved: the prologue saves them and HALT restores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Live input cursor.
    pub input: Reg,
    /// Holds the value-stack pointer across the PRINT call while RSP is
    /// realigned to 16 bytes.
    pub call_sp: Reg,
}

impl FrameLayout {
    pub const SYSV: FrameLayout = FrameLayout {
        input: Reg::Rbx,
        call_sp: Reg::R12,
    };

    /// Callee-saved registers pushed by the prologue, in push order.
    pub fn saved(&self) -> [Reg; 2] {
        [self.input, self.call_sp]
    }
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self::SYSV
    }
}

/// Options controlling code generation.
#[derive(Debug, Clone, Copy)]
pub struct CompileOptions {
    pub print: PrintFn,
    /// Emit `int3` at every instruction boundary.
    pub breakpoints: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            print: print_i64,
            breakpoints: false,
        }
    }
}

/// Numbers describing one compilation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompileStats {
    pub instructions: usize,
    pub branches: usize,
    pub code_size: usize,
    pub region_size: usize,
    pub compile_micros: u64,
}

/// JIT compiler for tjit programs on x86-64.
pub struct Compiler {
    buf: CodeBuffer,
    frame: FrameLayout,
    options: CompileOptions,
    arena: ExecutableMemoryArena,
    stats: CompileStats,
}

impl Compiler {
    pub fn new(options: CompileOptions) -> Self {
        Self {
            buf: CodeBuffer::new(),
            frame: FrameLayout::default(),
            options,
            arena: ExecutableMemoryArena::new(),
            stats: CompileStats::default(),
        }
    }

    /// Compile a program into sealed, callable native code.
    pub fn compile(mut self, program: &[u8]) -> Result<CompiledFunction, JitError> {
        if !cfg!(all(target_arch = "x86_64", unix)) {
            return Err(JitError::UnsupportedHost);
        }

        let start = Instant::now();
        self.translate(program)?;

        let linked = link(&self.buf)?;
        let size = linked.size();
        let region = self.arena.acquire(size)?;
        let filled = region.fill_with(size, |dst| linked.encode(dst).map_err(JitError::from))?;
        let sealed = filled.seal()?;

        self.stats.code_size = size;
        self.stats.region_size = sealed.size();
        self.stats.compile_micros = start.elapsed().as_micros() as u64;
        debug!(
            instructions = self.stats.instructions,
            branches = self.stats.branches,
            code_size = self.stats.code_size,
            region_size = self.stats.region_size,
            "compiled program"
        );

        let offsets = self.buf.labels().bound().collect();
        Ok(CompiledFunction::new(sealed, offsets, self.stats))
    }

    /// Decode and translate a program without linking it.
    pub fn assemble(mut self, program: &[u8]) -> Result<CodeBuffer, JitError> {
        self.translate(program)?;
        Ok(self.buf)
    }

    fn translate(&mut self, program: &[u8]) -> Result<(), JitError> {
        let frame = self.frame;
        self.emit_prologue(&frame);

        for insn in Decoder::new(program) {
            let insn = insn?;
            self.buf
                .bind_label(insn.offset)
                .map_err(|first| LinkError::DuplicateLabel {
                    offset: insn.offset,
                    first,
                })?;
            trace!(
                offset = insn.offset,
                native = self.buf.offset(),
                op = insn.op.mnemonic(),
                "translate"
            );

            if self.options.breakpoints {
                X86_64Assembler::new(&mut self.buf).int3();
            }
            self.compile_op(&frame, &insn);
            self.stats.instructions += 1;
        }

        // Trap if execution runs off the end of a program lacking HALT.
        X86_64Assembler::new(&mut self.buf).int3();
        Ok(())
    }

    /// Establish the frame, save VM-state registers, load the input cursor.
    fn emit_prologue(&mut self, frame: &FrameLayout) {
        let mut asm = X86_64Assembler::new(&mut self.buf);

        asm.push(regs::FRAME);
        asm.mov_rr(regs::FRAME, Reg::Rsp);
        for reg in frame.saved() {
            asm.push(reg);
        }

        asm.mov_rr(frame.input, regs::ARG0);
    }

    /// Drop whatever is left on the value stack, restore saved registers and
    /// return.
    fn emit_epilogue(&mut self, frame: &FrameLayout) {
        let mut asm = X86_64Assembler::new(&mut self.buf);
        let saved = frame.saved();

        asm.lea(Reg::Rsp, regs::FRAME, -SLOT_SIZE * saved.len() as i32);
        for reg in saved.iter().rev() {
            asm.pop(*reg);
        }
        asm.pop(regs::FRAME);
        asm.ret();
    }

    fn compile_op(&mut self, frame: &FrameLayout, insn: &Instruction) {
        match insn.op {
            Op::Constant => self.emit_constant(insn.imm()),
            Op::Add => self.emit_add(),
            Op::Print => self.emit_print(frame),
            Op::Input => self.emit_input(frame),
            Op::Discard => self.emit_discard(),
            Op::Get => self.emit_get(insn.imm()),
            Op::Set => self.emit_set(insn.imm()),
            Op::Cmp => self.emit_cmp(),
            Op::Jgt => {
                // Branch targets are relative to the JGT itself.
                let target = insn.offset + insn.imm() as i64;
                self.emit_jgt(target);
                self.stats.branches += 1;
            }
            Op::Halt => self.emit_epilogue(frame),
        }
    }

    /// Push an immediate (sign-extended into its slot).
    fn emit_constant(&mut self, value: i32) {
        X86_64Assembler::new(&mut self.buf).push_imm32(value);
    }

    /// Pop b, pop a, push a + b with 32-bit wraparound.
    fn emit_add(&mut self) {
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.pop(regs::TMP1); // b
        asm.pop(regs::TMP0); // a
        asm.add_rr32(regs::TMP0, regs::TMP1);
        asm.movsxd(regs::TMP0, regs::TMP0);
        asm.push(regs::TMP0);
    }

    /// Pop a value and pass it to the external print routine.
    fn emit_print(&mut self, frame: &FrameLayout) {
        let print = self.options.print as usize as i64;
        let mut asm = X86_64Assembler::new(&mut self.buf);

        asm.pop(regs::ARG0);
        // The value stack can leave RSP at any 8-byte boundary; the callee
        // expects 16.
        asm.mov_rr(frame.call_sp, regs::VSTACK);
        asm.and_ri32(regs::VSTACK, -16);
        asm.mov_ri64(regs::TMP0, print);
        asm.call_r(regs::TMP0);
        asm.mov_rr(regs::VSTACK, frame.call_sp);
    }

    /// Push the low 32 bits of the next input word and advance the cursor.
    fn emit_input(&mut self, frame: &FrameLayout) {
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.movsxd_rm(regs::TMP0, frame.input, 0);
        asm.push(regs::TMP0);
        asm.add_ri32(frame.input, INPUT_WORD_SIZE);
    }

    fn emit_discard(&mut self) {
        X86_64Assembler::new(&mut self.buf).add_ri32(regs::VSTACK, SLOT_SIZE);
    }

    /// Push a copy of the slot `depth` below the top.
    fn emit_get(&mut self, depth: i32) {
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.mov_rm(regs::TMP0, regs::VSTACK, depth.wrapping_mul(SLOT_SIZE));
        asm.push(regs::TMP0);
    }

    /// Pop a value into the slot `depth` below the new top.
    fn emit_set(&mut self, depth: i32) {
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.pop(regs::TMP0);
        asm.mov_mr(regs::VSTACK, depth.wrapping_mul(SLOT_SIZE), regs::TMP0);
    }

    /// Pop b, pop a, push the sign of a - b as -1, 0 or 1.
    fn emit_cmp(&mut self) {
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.pop(regs::TMP1); // b
        asm.pop(regs::TMP2); // a
        asm.xor_rr(regs::TMP0, regs::TMP0);
        asm.cmp_rr32(regs::TMP2, regs::TMP1);
        asm.setcc(Cond::G, regs::TMP0);
        asm.setcc(Cond::L, regs::TMP1);
        asm.movzx_r64_r8(regs::TMP1, regs::TMP1);
        asm.sub_rr(regs::TMP0, regs::TMP1);
        asm.push(regs::TMP0);
    }

    /// Pop a value and branch to `target` if it is positive.
    fn emit_jgt(&mut self, target: i64) {
        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.pop(regs::TMP0);
        // Slots hold sign-extended 32-bit values, so a 64-bit test is exact.
        asm.test_rr(regs::TMP0, regs::TMP0);
        asm.jcc_label(Cond::G, target);
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompileOptions::default())
    }
}
