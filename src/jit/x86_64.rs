//! x86-64 instruction encoding for JIT compilation.
//!
//! Only the instructions used by the bytecode templates are provided.
//! Uses System V AMD64 ABI conventions.

use super::codebuf::{CodeBuffer, RelocKind};
use crate::bytecode::ByteOffset;

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,  // Return value
    Rcx = 1,  // 4th argument
    Rdx = 2,  // 3rd argument
    Rbx = 3,  // Callee-saved
    Rsp = 4,  // Stack pointer
    Rbp = 5,  // Frame pointer (callee-saved)
    Rsi = 6,  // 2nd argument
    Rdi = 7,  // 1st argument
    R8 = 8,   // 5th argument
    R9 = 9,   // 6th argument
    R10 = 10, // Caller-saved
    R11 = 11, // Caller-saved
    R12 = 12, // Callee-saved
    R13 = 13, // Callee-saved
    R14 = 14, // Callee-saved
    R15 = 15, // Callee-saved
}

impl Reg {
    /// Get the register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Check if this register requires REX.B or REX.R extension.
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }

    /// Get the REX.B bit for this register (when used as base/rm).
    pub fn rex_b(self) -> u8 {
        if self.needs_rex_ext() { 0x01 } else { 0x00 }
    }

    /// Get the REX.R bit for this register (when used as reg).
    pub fn rex_r(self) -> u8 {
        if self.needs_rex_ext() { 0x04 } else { 0x00 }
    }
}

/// x86-64 condition codes (for Jcc, SETcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,  // Overflow
    No = 0x1, // Not overflow
    B = 0x2,  // Below (unsigned <)
    Ae = 0x3, // Above or equal (unsigned >=)
    E = 0x4,  // Equal
    Ne = 0x5, // Not equal
    Be = 0x6, // Below or equal (unsigned <=)
    A = 0x7,  // Above (unsigned >)
    S = 0x8,  // Sign (negative)
    Ns = 0x9, // Not sign (non-negative)
    P = 0xA,  // Parity even
    Np = 0xB, // Parity odd
    L = 0xC,  // Less (signed <)
    Ge = 0xD, // Greater or equal (signed >=)
    Le = 0xE, // Less or equal (signed <=)
    G = 0xF,  // Greater (signed >)
}

/// x86-64 assembler writing into a [`CodeBuffer`].
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    // ==================== REX prefix helpers ====================

    /// Emit REX.W prefix for 64-bit operations.
    fn emit_rex_w(&mut self, reg: Reg, rm: Reg) {
        let rex = 0x48 | reg.rex_r() | rm.rex_b();
        self.buf.emit_u8(rex);
    }

    /// Emit REX.W prefix for single register operations.
    fn emit_rex_w_single(&mut self, rm: Reg) {
        let rex = 0x48 | rm.rex_b();
        self.buf.emit_u8(rex);
    }

    /// Emit REX prefix if needed (without W bit).
    fn emit_rex_if_needed(&mut self, reg: Reg, rm: Reg) {
        let rex = 0x40 | reg.rex_r() | rm.rex_b();
        if rex != 0x40 {
            self.buf.emit_u8(rex);
        }
    }

    // ==================== ModR/M helpers ====================

    /// Encode ModR/M byte.
    /// mod: 2 bits, reg: 3 bits, rm: 3 bits
    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// Emit the ModR/M (+SIB, +displacement) for `[base + disp]`.
    fn emit_mem_operand(&mut self, reg: u8, base: Reg, disp: i32) {
        // RBP/R13 have no disp-less form; RSP/R12 need a SIB byte.
        let mode = if disp == 0 && base.code() != 0b101 {
            0b00
        } else if (-128..=127).contains(&disp) {
            0b01
        } else {
            0b10
        };

        self.buf.emit_u8(Self::modrm(mode, reg, base.code()));
        if base.code() == 0b100 {
            self.buf.emit_u8(0x24); // SIB: no index, base=RSP/R12
        }
        match mode {
            0b01 => self.buf.emit_u8(disp as u8),
            0b10 => self.buf.emit_u32(disp as u32),
            _ => {}
        }
    }

    // ==================== Data Movement ====================

    /// MOV r64, r64 (register to register)
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x89); // MOV r/m64, r64
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r64, imm64 (move 64-bit immediate to register)
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.emit_rex_w_single(dst);
        self.buf.emit_u8(0xB8 + dst.code()); // MOV r64, imm64
        self.buf.emit_u64(imm as u64);
    }

    /// MOV r64, [r64 + disp32] (load from memory)
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex_w(dst, base);
        self.buf.emit_u8(0x8B); // MOV r64, r/m64
        self.emit_mem_operand(dst.code(), base, disp);
    }

    /// MOV [r64 + disp32], r64 (store to memory)
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.emit_rex_w(src, base);
        self.buf.emit_u8(0x89); // MOV r/m64, r64
        self.emit_mem_operand(src.code(), base, disp);
    }

    /// MOVSXD r64, DWORD PTR [r64 + disp32] (load 32 bits, sign-extend)
    pub fn movsxd_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex_w(dst, base);
        self.buf.emit_u8(0x63);
        self.emit_mem_operand(dst.code(), base, disp);
    }

    /// MOVSXD r64, r32 (sign-extend 32-bit to 64-bit)
    pub fn movsxd(&mut self, dst: Reg, src: Reg) {
        // REX.W 63 /r - MOVSXD r64, r/m32
        self.emit_rex_w(dst, src);
        self.buf.emit_u8(0x63);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// MOVZX r64, r8 (zero-extend byte to qword)
    pub fn movzx_r64_r8(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(dst, src);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6); // MOVZX r64, r/m8
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// LEA r64, [r64 + disp32]
    pub fn lea(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.emit_rex_w(dst, base);
        self.buf.emit_u8(0x8D);
        self.emit_mem_operand(dst.code(), base, disp);
    }

    // ==================== Arithmetic Operations ====================

    /// ADD r32, r32 (upper half of the destination is zeroed)
    pub fn add_rr32(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_if_needed(src, dst);
        self.buf.emit_u8(0x01); // ADD r/m32, r32
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// ADD r64, imm32 (sign-extended)
    pub fn add_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83); // ADD r/m64, imm8
            self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81); // ADD r/m64, imm32
            self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// SUB r64, r64
    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x29); // SUB r/m64, r64
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// AND r64, imm32 (sign-extended)
    pub fn and_ri32(&mut self, dst: Reg, imm: i32) {
        self.emit_rex_w_single(dst);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83); // AND r/m64, imm8
            self.buf.emit_u8(Self::modrm(0b11, 4, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81); // AND r/m64, imm32
            self.buf.emit_u8(Self::modrm(0b11, 4, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// XOR r64, r64
    pub fn xor_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x31); // XOR r/m64, r64
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// CMP r32, r32
    pub fn cmp_rr32(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_if_needed(src, dst);
        self.buf.emit_u8(0x39); // CMP r/m32, r32
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// TEST r64, r64 (bitwise AND, set flags, discard result)
    pub fn test_rr(&mut self, dst: Reg, src: Reg) {
        self.emit_rex_w(src, dst);
        self.buf.emit_u8(0x85); // TEST r/m64, r64
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    // ==================== Stack Operations ====================

    /// PUSH r64
    pub fn push(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    /// PUSH imm32 (sign-extended to 64 bits)
    pub fn push_imm32(&mut self, imm: i32) {
        self.buf.emit_u8(0x68);
        self.buf.emit_u32(imm as u32);
    }

    /// POP r64
    pub fn pop(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    // ==================== Control Flow ====================

    /// Jcc rel32 to the label of bytecode offset `target`, patched at link time.
    pub fn jcc_label(&mut self, cond: Cond, target: ByteOffset) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8); // Jcc rel32
        self.buf.emit_reloc(RelocKind::Rel32, target);
    }

    /// CALL r64 (indirect call through register)
    pub fn call_r(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41); // REX.B
        }
        self.buf.emit_u8(0xFF); // CALL r/m64
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    /// RET (return)
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    /// INT3 (debug breakpoint)
    pub fn int3(&mut self) {
        self.buf.emit_u8(0xCC);
    }

    // ==================== Conditional Set ====================

    /// SETcc r8 (set byte based on condition)
    pub fn setcc(&mut self, cond: Cond, dst: Reg) {
        if dst.needs_rex_ext()
            || dst == Reg::Rsp
            || dst == Reg::Rbp
            || dst == Reg::Rsi
            || dst == Reg::Rdi
        {
            // Need REX prefix to access SPL, BPL, SIL, DIL or R8B-R15B
            self.buf.emit_u8(0x40 | dst.rex_b());
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x90 + cond as u8); // SETcc r/m8
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(f: impl FnOnce(&mut X86_64Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        f(&mut X86_64Assembler::new(&mut buf));
        buf.code().to_vec()
    }

    #[test]
    fn test_mov_rr() {
        // MOV RBX, RDI = 48 89 FB
        assert_eq!(assemble(|a| a.mov_rr(Reg::Rbx, Reg::Rdi)), [0x48, 0x89, 0xFB]);
        // MOV R12, RSP = 49 89 E4
        assert_eq!(assemble(|a| a.mov_rr(Reg::R12, Reg::Rsp)), [0x49, 0x89, 0xE4]);
        // MOV RSP, R12 = 4C 89 E4
        assert_eq!(assemble(|a| a.mov_rr(Reg::Rsp, Reg::R12)), [0x4C, 0x89, 0xE4]);
    }

    #[test]
    fn test_mov_ri64() {
        // MOV RAX, imm64 = 48 B8 F0 DE BC 9A 78 56 34 12
        assert_eq!(
            assemble(|a| a.mov_ri64(Reg::Rax, 0x123456789ABCDEF0u64 as i64)),
            [0x48, 0xB8, 0xF0, 0xDE, 0xBC, 0x9A, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_mov_rm_rsp_base() {
        // MOV RAX, [RSP] = 48 8B 04 24
        assert_eq!(assemble(|a| a.mov_rm(Reg::Rax, Reg::Rsp, 0)), [0x48, 0x8B, 0x04, 0x24]);
        // MOV RAX, [RSP+8] = 48 8B 44 24 08
        assert_eq!(
            assemble(|a| a.mov_rm(Reg::Rax, Reg::Rsp, 8)),
            [0x48, 0x8B, 0x44, 0x24, 0x08]
        );
        // MOV RAX, [RSP+0x200] = 48 8B 84 24 00 02 00 00
        assert_eq!(
            assemble(|a| a.mov_rm(Reg::Rax, Reg::Rsp, 0x200)),
            [0x48, 0x8B, 0x84, 0x24, 0x00, 0x02, 0x00, 0x00]
        );
    }

    #[test]
    fn test_mov_rm_special_bases() {
        // MOV RAX, [RBP] needs a zero disp8: 48 8B 45 00
        assert_eq!(
            assemble(|a| a.mov_rm(Reg::Rax, Reg::Rbp, 0)),
            [0x48, 0x8B, 0x45, 0x00]
        );
        // MOV RAX, [R12] needs a SIB byte: 49 8B 04 24
        assert_eq!(assemble(|a| a.mov_rm(Reg::Rax, Reg::R12, 0)), [0x49, 0x8B, 0x04, 0x24]);
        // MOV RAX, [RBX+16] = 48 8B 43 10
        assert_eq!(assemble(|a| a.mov_rm(Reg::Rax, Reg::Rbx, 16)), [0x48, 0x8B, 0x43, 0x10]);
    }

    #[test]
    fn test_mov_mr() {
        // MOV [RSP+16], RAX = 48 89 44 24 10
        assert_eq!(
            assemble(|a| a.mov_mr(Reg::Rsp, 16, Reg::Rax)),
            [0x48, 0x89, 0x44, 0x24, 0x10]
        );
    }

    #[test]
    fn test_movsxd() {
        // MOVSXD RAX, DWORD [RBX] = 48 63 03
        assert_eq!(assemble(|a| a.movsxd_rm(Reg::Rax, Reg::Rbx, 0)), [0x48, 0x63, 0x03]);
        // MOVSXD RAX, EAX = 48 63 C0
        assert_eq!(assemble(|a| a.movsxd(Reg::Rax, Reg::Rax)), [0x48, 0x63, 0xC0]);
    }

    #[test]
    fn test_lea() {
        // LEA RSP, [RBP-16] = 48 8D 65 F0
        assert_eq!(assemble(|a| a.lea(Reg::Rsp, Reg::Rbp, -16)), [0x48, 0x8D, 0x65, 0xF0]);
    }

    #[test]
    fn test_arithmetic() {
        // ADD EAX, ECX = 01 C8
        assert_eq!(assemble(|a| a.add_rr32(Reg::Rax, Reg::Rcx)), [0x01, 0xC8]);
        // ADD RSP, 8 = 48 83 C4 08
        assert_eq!(assemble(|a| a.add_ri32(Reg::Rsp, 8)), [0x48, 0x83, 0xC4, 0x08]);
        // ADD RAX, 256 = 48 81 C0 00 01 00 00
        assert_eq!(
            assemble(|a| a.add_ri32(Reg::Rax, 256)),
            [0x48, 0x81, 0xC0, 0x00, 0x01, 0x00, 0x00]
        );
        // SUB RAX, RCX = 48 29 C8
        assert_eq!(assemble(|a| a.sub_rr(Reg::Rax, Reg::Rcx)), [0x48, 0x29, 0xC8]);
        // AND RSP, -16 = 48 83 E4 F0
        assert_eq!(assemble(|a| a.and_ri32(Reg::Rsp, -16)), [0x48, 0x83, 0xE4, 0xF0]);
        // XOR RAX, RAX = 48 31 C0
        assert_eq!(assemble(|a| a.xor_rr(Reg::Rax, Reg::Rax)), [0x48, 0x31, 0xC0]);
    }

    #[test]
    fn test_compare() {
        // CMP EDX, ECX = 39 CA
        assert_eq!(assemble(|a| a.cmp_rr32(Reg::Rdx, Reg::Rcx)), [0x39, 0xCA]);
        // TEST RAX, RAX = 48 85 C0
        assert_eq!(assemble(|a| a.test_rr(Reg::Rax, Reg::Rax)), [0x48, 0x85, 0xC0]);
        // SETG AL = 0F 9F C0
        assert_eq!(assemble(|a| a.setcc(Cond::G, Reg::Rax)), [0x0F, 0x9F, 0xC0]);
        // SETL CL = 0F 9C C1
        assert_eq!(assemble(|a| a.setcc(Cond::L, Reg::Rcx)), [0x0F, 0x9C, 0xC1]);
        // MOVZX RCX, CL = 48 0F B6 C9
        assert_eq!(assemble(|a| a.movzx_r64_r8(Reg::Rcx, Reg::Rcx)), [0x48, 0x0F, 0xB6, 0xC9]);
    }

    #[test]
    fn test_push_pop() {
        // PUSH RBX = 53, PUSH R12 = 41 54, POP R12 = 41 5C, POP RBX = 5B
        let code = assemble(|a| {
            a.push(Reg::Rbx);
            a.push(Reg::R12);
            a.pop(Reg::R12);
            a.pop(Reg::Rbx);
        });
        assert_eq!(code, [0x53, 0x41, 0x54, 0x41, 0x5C, 0x5B]);
    }

    #[test]
    fn test_push_imm32() {
        // PUSH -1 = 68 FF FF FF FF
        assert_eq!(assemble(|a| a.push_imm32(-1)), [0x68, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_jcc_label_emits_placeholder() {
        let mut buf = CodeBuffer::new();
        X86_64Assembler::new(&mut buf).jcc_label(Cond::G, 7);

        // JG rel32 = 0F 8F + 4-byte displacement
        assert_eq!(buf.code(), &[0x0F, 0x8F, 0, 0, 0, 0]);
        assert_eq!(buf.relocations()[0].site, 2);
        assert_eq!(buf.relocations()[0].target, 7);
    }

    #[test]
    fn test_call_ret_int3() {
        // CALL RAX = FF D0, CALL R12 = 41 FF D4
        assert_eq!(assemble(|a| a.call_r(Reg::Rax)), [0xFF, 0xD0]);
        assert_eq!(assemble(|a| a.call_r(Reg::R12)), [0x41, 0xFF, 0xD4]);
        assert_eq!(assemble(|a| a.ret()), [0xC3]);
        assert_eq!(assemble(|a| a.int3()), [0xCC]);
    }
}
