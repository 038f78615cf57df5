//! Tools for generating code using the x86_64 instruction set.
//!
//! The focus here is in concrete x86_64 instructions. One method call on an
//! Assembler generates one instruction. This ensures that documentation about
//! the x86_64 instruction set applies to the code we assemble. For example,
//! you can look up the costs of instructions.
//!
//! We make no attempt to be exhaustive. We implement a subset of x86_64 which
//! is sufficient for the regexp code generator. Where we have freedom to do
//! so, we choose to make the subset as regular as possible, sometimes
//! ignoring more efficient encodings.

use super::super::{Label, LabelTable, Patch};
use crate::buffer::{Buffer};

/**
 * All x86_64 registers that can be used interchangeably in our chosen subset
 * of x86_64. `RSP` and `R12` require a SIB fix when used as a memory base in
 * the `rm` field of a ModR/M byte; the `write_sib_fix()` method handles it.
 *
 * All register names include a leading `R`, and omit a trailing `X`. This is
 * not intended to imply anything about the operand width, which is specified
 * in another way.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum Register {
    RA = 0,
    RC = 1,
    RD = 2,
    RB = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

use Register::*;

impl Register {
    /** Returns a bit pattern which includes `self` in all useful positions. */
    pub fn mask(self) -> u64 {
        [
            0x0000000000,
            0x0909090900, // 1
            0x1212121200, // 2
            0x1B1B1B1B00,
            0x2424242400, // 4
            0x2D2D2D2D00,
            0x3636363600,
            0x3F3F3F3F00,
            0x0000000007, // 8
            0x0909090907,
            0x1212121207,
            0x1B1B1B1B07,
            0x2424242407,
            0x2D2D2D2D07,
            0x3636363607,
            0x3F3F3F3F07,
        ][self as usize]
    }
}

//-----------------------------------------------------------------------------

/**
 * Represents the precision of an arithmetic operation.
 * With P32, the arithmetic is performed with 32-bit precision, and written
 * into the bottom 32 bits of the destination. The top 32 bits are 0.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Precision {
    P32 = 0,
    P64 = 1,
}

use Precision::*;

impl Precision {
    pub fn w_bit(self) -> u64 {
        (self as u64) << 3
    }
}

//-----------------------------------------------------------------------------

/**
 * The binary ALU operations we use. The discriminants are the `reg` field
 * values of the x86_64 "group 1" encodings.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BinaryOp {
    Add = 0,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

use BinaryOp::*;

impl BinaryOp {
    pub fn rm_imm(self, rm_is_reg: bool) -> u64 {
        0x808140 | (rm_is_reg as u64) << 22 | (self as u64) << 19
    }

    pub fn rm_reg(self, rm_is_reg: bool) -> u64 {
        0x800140 | (rm_is_reg as u64) << 22 | (self as u64) << 11
    }

    pub fn reg_rm(self, rm_is_reg: bool) -> u64 {
        0x800340 | (rm_is_reg as u64) << 22 | (self as u64) << 11
    }
}

//-----------------------------------------------------------------------------

/**
 * The shift operations we use, by immediate shift counts only. The
 * discriminants are the `reg` field values of the "group 2" encodings.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShiftOp {
    Shl = 4,
    Sar = 7,
}

impl ShiftOp {
    pub fn rm_imm(self, rm_is_reg: bool) -> u64 {
        0x80C140 | (rm_is_reg as u64) << 22 | (self as u64) << 19
    }
}

//-----------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum Condition {
    O  = 0x0,
    NO = 0x1,
    B  = 0x2,
    AE = 0x3,
    Z  = 0x4,
    NZ = 0x5,
    BE = 0x6,
    A  = 0x7,
    S  = 0x8,
    NS = 0x9,
    P  = 0xA,
    NP = 0xB,
    L  = 0xC,
    GE = 0xD,
    LE = 0xE,
    G  = 0xF,
}

impl Condition {
    pub fn jump_if(self, is_true: bool) -> u64 {
        0x800F | ((!is_true as u64) ^ (self as u64)) << 8
    }
}

//-----------------------------------------------------------------------------

/** Memory operand widths narrower than 32 bits; loads zero-extend. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Width {U8, U16}

use Width::*;

/** An index scaling factor, encoded as the `ss` field of a SIB byte. */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Scale {
    Times1 = 0,
    Times2 = 1,
    Times4 = 2,
    Times8 = 3,
}

/**
 * The memory addressing mode `base + index * scale + disp`. The index must
 * not be `RSP`, which the SIB encoding reserves to mean "no index".
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BaseIndex(pub Register, pub Register, pub Scale, pub i32);

//-----------------------------------------------------------------------------

/** Computes the displacement from `from` to `to`. */
pub fn disp(from: usize, to: usize) -> isize {
    if from > isize::MAX as usize || to > isize::MAX as usize {
        panic!("Displacements greater than isize::MAX are not supported");
    }
    (to as isize) - (from as isize)
}

/** Computes the i32 displacement from `from` to `to`, if possible. */
pub fn disp32(from: usize, to: usize) -> i32 {
    let disp = disp(from, to);
    if disp > i32::MAX as isize || disp < i32::MIN as isize {
        panic!("The displacement does not fit in 32 bits");
    }
    disp as i32
}

/**
 * A value which, if used as the `rel32` part of a control-flow instruction,
 * is likely to result in an immediate crash.
 */
pub const UNKNOWN_DISP: i32 = -0x80000000;

/** Like [`disp32()`] but returns `UNKNOWN_DISP` if `to` is `None`. */
pub fn optional_disp32(from: usize, to: Option<usize>) -> i32 {
    to.map_or(UNKNOWN_DISP, |to| disp32(from, to))
}

/**
 * An assembler, implementing a regularish subset of x86_64.
 *
 * You probably don't need to call the `write_x()` methods directly, but you
 * can if necessary (e.g. to assemble an instruction that is not provided by
 * Assembler itself). There is a `write_x()` method for each encoding pattern
 * `x`. A typical pattern is "ROM" meaning a REX byte, an opcode byte, and a
 * ModR/M byte; "S" adds a SIB byte. There are also `write_x()` methods for
 * immediate constants, for displacements, and for raw bytes.
 *
 * Instead, call the methods that assemble a single instruction. These
 * include:
 *  - Variants of [`const_()`], [`load()`], and [`store()`], which assemble
 *    `MOV` instructions, and [`lea()`] variants for address arithmetic.
 *  - Variants of [`op()`], which assemble arithmetic instructions, including
 *    `CMP` instructions, in register, immediate and memory forms.
 *  - [`jump_if()`], [`ret()`], and variants of [`jump()`] and [`call()`],
 *    which assemble control-flow instructions.
 *  - [`push()`] and [`pop()`], which assemble `PUSH` and `POP` instructions.
 *
 * The assembler owns the [`LabelTable`] its control-flow targets live in;
 * make fresh labels with [`label()`], and resolve them with [`define()`].
 *
 * [`const_()`]: Assembler::const_
 * [`load()`]: Assembler::load
 * [`store()`]: Assembler::store
 * [`lea()`]: Assembler::lea
 * [`op()`]: Assembler::op
 * [`jump_if()`]: Assembler::jump_if
 * [`ret()`]: Assembler::ret
 * [`jump()`]: Assembler::jump
 * [`call()`]: Assembler::call
 * [`push()`]: Assembler::push
 * [`pop()`]: Assembler::pop
 * [`label()`]: Assembler::label
 * [`define()`]: Assembler::define
 */
pub struct Assembler<B: Buffer> {
    /// The area we're filling with code.
    buffer: B,
    labels: LabelTable,
}

impl<B: Buffer> Assembler<B> {
    /** Construct an Assembler that writes to `buffer`. */
    pub fn new(buffer: B) -> Self {
        Assembler {buffer, labels: LabelTable::new()}
    }

    /** The assembled bytes so far. */
    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    /** Get the assembly pointer. */
    pub fn get_pos(&self) -> usize {
        self.buffer.get_pos()
    }

    /** Set the assembly pointer. */
    pub fn set_pos(&mut self, pos: usize) {
        self.buffer.set_pos(pos);
    }

    // Labels.

    /** Constructs a fresh undefined [`Label`]. */
    pub fn label(&mut self) -> Label {
        self.labels.fresh()
    }

    /** Tests whether any instruction so far jumps or calls to `label`. */
    pub fn is_used(&self, label: Label) -> bool {
        self.labels.is_used(label)
    }

    /** Returns the offset `label` was defined at, if any. */
    pub fn target(&self, label: Label) -> Option<usize> {
        self.labels.target(label)
    }

    /**
     * Define `label` to be the current assembly position, and rewrite the
     * `rel32` of every instruction that has already jumped to it.
     */
    pub fn define(&mut self, label: Label) {
        let target = self.get_pos();
        for patch in self.labels.define(label, target) {
            self.patch(patch, target);
        }
    }

    /**
     * Change the target of the control-flow instruction at `patch` to
     * `target`, checking that its `rel32` still holds [`UNKNOWN_DISP`].
     */
    fn patch(&mut self, patch: Patch, target: usize) {
        let pos = patch.address();
        let at = if self.buffer.read_byte(pos) == 0x0F
                && (self.buffer.read_byte(pos + 1) & 0xF0) == 0x80 {
            // jump_if
            pos + 2
        } else if self.buffer.read_byte(pos) == 0x40
                && (self.buffer.read_byte(pos + 1) == 0xE9
                    || self.buffer.read_byte(pos + 1) == 0xE8) {
            // const_jump or const_call
            pos + 2
        } else {
            panic!("not a jump or call instruction");
        };
        assert_eq!(self.buffer.read(at, 4) as u32 as i32, UNKNOWN_DISP);
        let old_pos = self.buffer.get_pos();
        self.buffer.set_pos(at);
        self.write_rel32(Some(target));
        self.buffer.set_pos(old_pos);
    }

    // Patterns and constants.

    /** Writes an 8-bit signed immediate constant. */
    pub fn write_imm8(&mut self, immediate: i8) {
        self.buffer.write(u64::from(immediate as u8), 1);
    }

    /** Writes a 32-bit signed immediate constant. */
    pub fn write_imm32(&mut self, immediate: i32) {
        self.buffer.write(u64::from(immediate as u32), 4);
    }

    /** Writes a 64-bit signed immediate constant. */
    pub fn write_imm64(&mut self, immediate: i64) {
        self.buffer.write(immediate as u64, 8);
    }

    /** Writes a 32-bit displacement from `self.get_pos()+4` to `target`. */
    pub fn write_rel32(&mut self, target: Option<usize>) {
        let pos = self.get_pos();
        self.write_imm32(optional_disp32(pos + 4, target));
    }

    /** Writes an instruction with pattern "OO", and no registers. */
    pub fn write_oo_0(&mut self, opcode: u64) {
        self.buffer.write(opcode, 2);
    }

    /** Writes an instruction with pattern "RO", and no registers. */
    pub fn write_ro_0(&mut self, opcode: u64) {
        self.buffer.write(opcode, 2);
    }

    /** Writes an instruction with pattern "RO", and one register. */
    pub fn write_ro_1(&mut self, mut opcode: u64, prec: Precision, rd: Register) {
        opcode |= prec.w_bit();
        opcode |= 0x0701 & rd.mask();
        self.buffer.write(opcode, 2);
    }

    /** Writes an instruction with pattern "ROM" and one register. */
    pub fn write_rom_1(&mut self, mut opcode: u64, prec: Precision, rm: Register) {
        opcode |= prec.w_bit();
        opcode |= 0x070001 & rm.mask();
        self.buffer.write(opcode, 3);
    }

    /** Writes an instruction with pattern "ROM" and two registers. */
    pub fn write_rom_2(&mut self, mut opcode: u64, prec: Precision, rm: Register, reg: Register) {
        opcode |= prec.w_bit();
        opcode |= 0x070001 & rm.mask();
        opcode |= 0x380004 & reg.mask();
        self.buffer.write(opcode, 3);
    }

    /** Writes an instruction with pattern "ROOM" and two registers. */
    pub fn write_room_2(&mut self, mut opcode: u64, prec: Precision, rm: Register, reg: Register) {
        opcode |= prec.w_bit();
        opcode |= 0x07000001 & rm.mask();
        opcode |= 0x38000004 & reg.mask();
        self.buffer.write(opcode, 4);
    }

    /**
     * Writes an instruction with pattern "ROMS" and a register, addressing
     * memory as `base + index * scale`, followed by a 32-bit displacement.
     * The ModR/M byte embedded in `opcode` must select the SIB form.
     */
    pub fn write_roms_2(&mut self, mut opcode: u64, prec: Precision, mem: BaseIndex, reg: Register) {
        let BaseIndex(base, index, scale, displacement) = mem;
        assert!(index != RSP, "RSP cannot be an index register");
        opcode |= prec.w_bit();
        opcode |= (scale as u64) << 30;
        opcode |= 0x07000001 & base.mask();
        opcode |= 0x38000002 & index.mask();
        opcode |= 0x00380004 & reg.mask();
        self.buffer.write(opcode, 4);
        self.write_imm32(displacement);
    }

    /** As [`write_roms_2`](Self::write_roms_2), with pattern "ROOMS". */
    pub fn write_rooms_2(&mut self, mut opcode: u64, prec: Precision, mem: BaseIndex, reg: Register) {
        let BaseIndex(base, index, scale, displacement) = mem;
        assert!(index != RSP, "RSP cannot be an index register");
        opcode |= prec.w_bit();
        opcode |= (scale as u64) << 38;
        opcode |= 0x0700000001 & base.mask();
        opcode |= 0x3800000002 & index.mask();
        opcode |= 0x0038000004 & reg.mask();
        self.buffer.write(opcode, 5);
        self.write_imm32(displacement);
    }

    /**
     * If `rm` is `RSP` or `R12`, writes the byte `0x24`, otherwise does
     * nothing.
     *
     * This is necessary after a ModR/M byte if `rm` is used as a memory
     * operand, because the bit pattern 100 in the `rm` field indicates the
     * presence of a SIB byte. `0x24` is a SIB byte with 100 in the `index`
     * field, indicating no index, and 100 in the `base` field, matching `rm`.
     */
    pub fn write_sib_fix(&mut self, rm: Register) {
        if (rm as usize) & 7 == 4 {
            self.buffer.write_byte(0x24);
        }
    }

    // Instructions.

    /** Move register to register. */
    pub fn move_(&mut self, prec: Precision, dest: Register, src: Register) {
        self.write_rom_2(0xC08B40, prec, src, dest);
    }

    /** Move memory to register. */
    pub fn load(&mut self, prec: Precision, dest: Register, src: (Register, i32)) {
        self.write_rom_2(0x808B40, prec, src.0, dest);
        self.write_sib_fix(src.0);
        self.write_imm32(src.1);
    }

    /** Move base + index * scale memory to register. */
    pub fn load_index(&mut self, prec: Precision, dest: Register, src: BaseIndex) {
        self.write_roms_2(0x848B40, prec, src, dest);
    }

    /** Move register to memory. */
    pub fn store(&mut self, prec: Precision, dest: (Register, i32), src: Register) {
        self.write_rom_2(0x808940, prec, dest.0, src);
        self.write_sib_fix(dest.0);
        self.write_imm32(dest.1);
    }

    /** Move register to base + index * scale memory. */
    pub fn store_index(&mut self, prec: Precision, dest: BaseIndex, src: Register) {
        self.write_roms_2(0x848940, prec, dest, src);
    }

    /** Move a sign-extended 32-bit constant to memory. */
    pub fn store_imm(&mut self, prec: Precision, dest: (Register, i32), imm: i32) {
        self.write_rom_1(0x80C740, prec, dest.0);
        self.write_sib_fix(dest.0);
        self.write_imm32(dest.1);
        self.write_imm32(imm);
    }

    /**
     * Move constant to register.
     * If `imm` is zero, this will assemble the "zero idiom" xor instruction,
     * which corrupts the status flags. Use `const_preserving_flags` to avoid
     * this problem.
     */
    pub fn const_(&mut self, prec: Precision, dest: Register, mut imm: i64) {
        if prec == P32 {
            imm &= 0xFFFFFFFF;
        }
        if imm == 0 {
            self.op(Xor, prec, dest, dest);
        } else {
            self.const_preserving_flags(prec, dest, imm);
        }
    }

    /** Move constant to register. */
    pub fn const_preserving_flags(&mut self, prec: Precision, dest: Register, mut imm: i64) {
        if prec == P32 {
            imm &= 0xFFFFFFFF;
        }
        if i64::from(imm as u32) == imm {
            self.write_ro_1(0xB840, P32, dest);
            self.write_imm32(imm as i32);
        } else if i64::from(imm as i32) == imm {
            self.write_rom_1(0xC0C740, P64, dest);
            self.write_imm32(imm as i32);
        } else {
            self.write_ro_1(0xB840, P64, dest);
            self.write_imm64(imm);
        }
    }

    /**
     * Move a pointer-sized placeholder constant to register, and return the
     * buffer offset of its 8-byte immediate, which a later pass overwrites
     * with the real value. The placeholder is zero.
     */
    pub fn const_patch(&mut self, dest: Register) -> usize {
        self.write_ro_1(0xB840, P64, dest);
        let at = self.get_pos();
        self.write_imm64(0);
        at
    }

    /** Compute `base + disp` into `dest` without touching flags or memory. */
    pub fn lea(&mut self, dest: Register, src: (Register, i32)) {
        self.write_rom_2(0x808D40, P64, src.0, dest);
        self.write_sib_fix(src.0);
        self.write_imm32(src.1);
    }

    /** Compute `base + index * scale + disp` into `dest`. */
    pub fn lea_index(&mut self, dest: Register, src: BaseIndex) {
        self.write_roms_2(0x848D40, P64, src, dest);
    }

    /** Op register to register. */
    pub fn op(&mut self, op: BinaryOp, prec: Precision, dest: Register, src: Register) {
        self.write_rom_2(op.rm_reg(true), prec, dest, src);
    }

    /** Op constant to register. */
    pub fn const_op(&mut self, op: BinaryOp, prec: Precision, dest: Register, imm: i32) {
        self.write_rom_1(op.rm_imm(true), prec, dest);
        self.write_imm32(imm);
    }

    /** Op a memory location to a register. */
    pub fn load_op(&mut self, op: BinaryOp, prec: Precision, dest: Register, src: (Register, i32)) {
        self.write_rom_2(op.reg_rm(false), prec, src.0, dest);
        self.write_sib_fix(src.0);
        self.write_imm32(src.1);
    }

    /** Op a constant to a memory location. */
    pub fn mem_op(&mut self, op: BinaryOp, prec: Precision, dest: (Register, i32), imm: i32) {
        self.write_rom_1(op.rm_imm(false), prec, dest.0);
        self.write_sib_fix(dest.0);
        self.write_imm32(dest.1);
        self.write_imm32(imm);
    }

    /** Op a register to a memory location. */
    pub fn mem_op_reg(&mut self, op: BinaryOp, prec: Precision, dest: (Register, i32), src: Register) {
        self.write_rom_2(op.rm_reg(false), prec, dest.0, src);
        self.write_sib_fix(dest.0);
        self.write_imm32(dest.1);
    }

    /** AND `r1` with `r2`, discarding the result but setting flags. */
    pub fn test(&mut self, prec: Precision, r1: Register, r2: Register) {
        self.write_rom_2(0xC08540, prec, r1, r2);
    }

    /** AND register with a constant, discarding the result but setting flags. */
    pub fn const_test(&mut self, prec: Precision, r1: Register, imm: i32) {
        self.write_rom_1(0xC0F740, prec, r1);
        self.write_imm32(imm);
    }

    /** Shift register by constant. */
    pub fn const_shift(&mut self, op: ShiftOp, prec: Precision, dest: Register, imm: u8) {
        assert!(imm < if prec == P64 { 64 } else { 32 });
        self.write_rom_1(op.rm_imm(true), prec, dest);
        self.write_imm8(imm as i8);
    }

    /** Load narrow data, zero-extending to the given precision. */
    pub fn load_narrow(&mut self, prec: Precision, width: Width, dest: Register, src: (Register, i32)) {
        match width {
            U8 => self.write_room_2(0x80B60F40, prec, src.0, dest),
            U16 => self.write_room_2(0x80B70F40, prec, src.0, dest),
        }
        self.write_sib_fix(src.0);
        self.write_imm32(src.1);
    }

    /** Load narrow data from base + index * scale memory, zero-extending. */
    pub fn load_narrow_index(&mut self, prec: Precision, width: Width, dest: Register, src: BaseIndex) {
        match width {
            U8 => self.write_rooms_2(0x84B60F40, prec, src, dest),
            U16 => self.write_rooms_2(0x84B70F40, prec, src, dest),
        }
    }

    /** Conditional branch. */
    pub fn jump_if(&mut self, cc: Condition, is_true: bool, label: Label) {
        let patch = Patch::new(self.get_pos());
        self.write_oo_0(cc.jump_if(is_true));
        let target = self.labels.reference(label, patch);
        self.write_rel32(target);
    }

    /** Unconditional jump to a register. */
    pub fn jump(&mut self, target: Register) {
        self.write_rom_1(0xE0FF40, P32, target);
    }

    /** Unconditional jump to a label. */
    pub fn const_jump(&mut self, label: Label) {
        let patch = Patch::new(self.get_pos());
        self.write_ro_0(0xE940);
        let target = self.labels.reference(label, patch);
        self.write_rel32(target);
    }

    /** Unconditional call to a register. */
    pub fn call(&mut self, target: Register) {
        self.write_rom_1(0xD0FF40, P32, target);
    }

    /** Unconditional call to a label. */
    pub fn const_call(&mut self, label: Label) {
        let patch = Patch::new(self.get_pos());
        self.write_ro_0(0xE840);
        let target = self.labels.reference(label, patch);
        self.write_rel32(target);
    }

    /**
     * Call the C function at address `target`, realigning the stack to
     * [`STACK_ALIGNMENT`] around the call. `scratch` must be a volatile
     * register that is not an argument register; it is corrupted. Argument
     * registers must already hold their values, and `shadow` bytes of spill
     * space (a multiple of the alignment) are left above the return address.
     *
     * [`STACK_ALIGNMENT`]: super::STACK_ALIGNMENT
     */
    pub fn abi_call(&mut self, target: usize, scratch: Register, shadow: usize) {
        assert_eq!(shadow % super::STACK_ALIGNMENT, 0);
        self.move_(P64, scratch, RSP);
        self.const_op(And, P64, RSP, -(super::STACK_ALIGNMENT as i32));
        self.push(scratch);
        self.const_op(Sub, P64, RSP, (8 + shadow) as i32);
        self.const_(P64, scratch, target as i64);
        self.call(scratch);
        self.const_op(Add, P64, RSP, (8 + shadow) as i32);
        self.pop(RSP);
    }

    pub fn ret(&mut self) {
        self.write_ro_0(0xC340);
    }

    /** An invalid instruction, for unreachable code paths. */
    pub fn ud2(&mut self) {
        self.write_oo_0(0x0B0F);
    }

    /** Push a register. */
    pub fn push(&mut self, rd: Register) {
        self.write_ro_1(0x5040, P64, rd);
    }

    /** Pop a register. */
    pub fn pop(&mut self, rd: Register) {
        self.write_ro_1(0x5840, P64, rd);
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
pub mod tests {
    use super::*;
    use ShiftOp::*;
    use Condition::*;
    use Scale::*;

    use std::cmp::{max};

    use iced_x86::{Decoder, Formatter, NasmFormatter};

    use crate::buffer::{VecU8, Mmap};

    fn new_assembler() -> Assembler<VecU8> {
        Assembler::new(VecU8::new())
    }

    /**
     * Disassemble the given x86_64 `code_bytes` and compare them against
     * `expected` NASM-formatted text, one line per instruction.
     */
    pub fn disassemble(code_bytes: &[u8], expected: Vec<&str>)
    -> Result<(), Vec<String>> {
        // Disassemble the code.
        let mut decoder = Decoder::new(64, code_bytes, 0);
        decoder.set_ip(0);
        let mut formatter = NasmFormatter::new();
        let mut ips = Vec::new();
        let mut byteses = Vec::new();
        let mut observed = Vec::new();
        for instruction in decoder {
            let start = instruction.ip() as usize;
            let len = instruction.len();
            ips.push(start);
            byteses.push(code_bytes[start..][..len].iter().rev().map(
                |b| format!("{:02X}", b)
            ).collect::<Vec<String>>().join(" "));
            let mut assembly = String::with_capacity(80);
            formatter.format(&instruction, &mut assembly);
            observed.push(assembly);
        }

        // Search for differences.
        let mut error = false;
        for i in 0..max(expected.len(), observed.len()) {
            let e_line = if i < expected.len() { expected[i] } else { "missing" };
            let o_line = if i < observed.len() { &observed[i] } else { "missing" };
            if e_line != o_line {
                println!("Difference in line {}", i + 1);
                println!("{:016X}   {:>32}   {}", ips[i], byteses[i], o_line);
                println!("{:>16}   {:>32}   {}", "Expected", "", e_line);
                error = true;
            }
        }
        if error { Err(observed) } else { Ok(()) }
    }

    const IMM: i32 = 0x76543210;
    const DISP: i32 = 0x12345678;

    #[test]
    fn add5() {
        let buffer = Mmap::new(0x1000).expect("Couldn't allocate");
        let mut a = Assembler::new(buffer);
        a.move_(P64, RA, RDI);
        a.const_op(Add, P64, RA, 5);
        a.ret();
        let mut buffer = a.buffer;
        let result = buffer.execute(|bytes| {
            let f: extern "C" fn(i32) -> i32 = unsafe {std::mem::transmute(&bytes[0])};
            f(42)
        }).expect("Couldn't change permissions");
        assert_eq!(result, 42 + 5);
    }

    #[test]
    fn test_disassemble() {
        let example_code = &[0x48, 0x89, 0x5C, 0x24, 0x10, 0x55];
        disassemble(example_code, vec![
            "mov [rsp+10h],rbx",
            "push rbp",
        ]).unwrap();
    }

    /** Test the MOV variants, including the SIB-fix bases. */
    #[test]
    fn move_() {
        let mut a = new_assembler();
        for &p in &[P32, P64] {
            a.move_(p, R10, R9);
            a.store(p, (R8, DISP), R10);
            a.store(p, (R12, DISP), R10);
            a.load(p, R11, (R8, DISP));
            a.load(p, R11, (RSP, DISP));
        }
        a.store_imm(P64, (RSP, DISP), 7);
        a.store_imm(P32, (R13, 4), -1);
        disassemble(&a.buffer, vec![
            "mov r10d,r9d",
            "mov [r8+12345678h],r10d",
            "mov [r12+12345678h],r10d",
            "mov r11d,[r8+12345678h]",
            "mov r11d,[rsp+12345678h]",
            "mov r10,r9",
            "mov [r8+12345678h],r10",
            "mov [r12+12345678h],r10",
            "mov r11,[r8+12345678h]",
            "mov r11,[rsp+12345678h]",
            "mov qword [rsp+12345678h],7",
            "mov dword [r13+4],0FFFFFFFFh",
        ]).unwrap();
    }

    /** Test the base + index * scale addressing forms. */
    #[test]
    fn base_index() {
        let mut a = new_assembler();
        a.load_index(P64, RA, BaseIndex(RB, R12, Times1, DISP));
        a.load_index(P32, RC, BaseIndex(R13, RC, Times2, DISP));
        a.store_index(P64, BaseIndex(RSP, RC, Times1, 8), RA);
        a.lea(RA, (RBP, 2));
        a.lea_index(RD, BaseIndex(RB, R12, Times2, 4));
        a.load_narrow_index(P32, U16, RBP, BaseIndex(RB, R12, Times1, 6));
        a.load_narrow_index(P32, U8, RA, BaseIndex(RA, RC, Times1, 2));
        disassemble(&a.buffer, vec![
            "mov rax,[rbx+r12+12345678h]",
            "mov ecx,[r13+rcx*2+12345678h]",
            "mov [rsp+rcx+8],rax",
            "lea rax,[rbp+2]",
            "lea rdx,[rbx+r12*2+4]",
            "movzx ebp,word [rbx+r12+6]",
            "movzx eax,byte [rax+rcx+2]",
        ]).unwrap();
    }

    /** Negative displacements, byte-exactly. */
    #[test]
    fn negative_disp() {
        let mut a = new_assembler();
        a.load(P64, RA, (R13, -8));
        assert_eq!(&a.buffer[..], &[0x49, 0x8B, 0x85, 0xF8, 0xFF, 0xFF, 0xFF]);
        let mut a = new_assembler();
        a.lea(RC, (RBP, -2));
        assert_eq!(&a.buffer[..], &[0x48, 0x8D, 0x8D, 0xFE, 0xFF, 0xFF, 0xFF]);
        let mut a = new_assembler();
        a.load_narrow_index(P32, U16, RBP, BaseIndex(RB, R12, Times1, -2));
        assert_eq!(&a.buffer[..], &[0x42, 0x0F, 0xB7, 0xAC, 0x23, 0xFE, 0xFF, 0xFF, 0xFF]);
    }

    /** Test the ALU operation forms. */
    #[test]
    fn binary_op() {
        let mut a = new_assembler();
        for &op in &[Add, And, Sub, Xor, Cmp] {
            a.op(op, P32, R10, R9);
        }
        for &p in &[P32, P64] {
            a.op(Add, p, R10, R9);
            a.const_op(Add, p, R10, IMM);
            a.load_op(Add, p, R9, (R8, DISP));
            a.load_op(Sub, p, R9, (RSP, DISP));
            a.mem_op(Add, p, (RSP, DISP), 8);
            a.mem_op(Cmp, p, (R8, DISP), 0);
            a.mem_op_reg(Cmp, p, (RSP, DISP), R9);
        }
        disassemble(&a.buffer, vec![
            "add r10d,r9d",
            "and r10d,r9d",
            "sub r10d,r9d",
            "xor r10d,r9d",
            "cmp r10d,r9d",
            "add r10d,r9d",
            "add r10d,76543210h",
            "add r9d,[r8+12345678h]",
            "sub r9d,[rsp+12345678h]",
            "add dword [rsp+12345678h],8",
            "cmp dword [r8+12345678h],0",
            "cmp [rsp+12345678h],r9d",
            "add r10,r9",
            "add r10,76543210h",
            "add r9,[r8+12345678h]",
            "sub r9,[rsp+12345678h]",
            "add qword [rsp+12345678h],8",
            "cmp qword [r8+12345678h],0",
            "cmp [rsp+12345678h],r9",
        ]).unwrap();
    }

    /** Test TEST, shifts, narrow loads and UD2. */
    #[test]
    fn misc() {
        let mut a = new_assembler();
        a.test(P32, RA, RA);
        a.test(P64, R12, R12);
        a.const_test(P32, RC, 0x40);
        a.const_shift(Shl, P64, RC, 1);
        a.const_shift(Sar, P64, RA, 1);
        a.load_narrow(P32, U16, RBP, (RB, DISP));
        a.load_narrow(P32, U8, RA, (RSP, 8));
        a.ud2();
        disassemble(&a.buffer, vec![
            "test eax,eax",
            "test r12,r12",
            "test ecx,40h",
            "shl rcx,1",
            "sar rax,1",
            "movzx ebp,word [rbx+12345678h]",
            "movzx eax,byte [rsp+8]",
            "ud2",
        ]).unwrap();
    }

    /** Test that we can assemble all the different sizes of constant. */
    #[test]
    fn const_() {
        let mut a = new_assembler();
        for &c in &[0, 1, 1000, 0x76543210, 0x76543210FEDCBA98] {
            a.const_(P64, R8, c);
            a.const_(P64, R15, !c);
        }
        disassemble(&a.buffer, vec![
            "xor r8,r8",
            "mov r15,0FFFFFFFFFFFFFFFFh",
            "mov r8d,1",
            "mov r15,0FFFFFFFFFFFFFFFEh",
            "mov r8d,3E8h",
            "mov r15,0FFFFFFFFFFFFFC17h",
            "mov r8d,76543210h",
            "mov r15,0FFFFFFFF89ABCDEFh",
            "mov r8,76543210FEDCBA98h",
            "mov r15,89ABCDEF01234567h",
        ]).unwrap();
    }

    /** Test the stack and control-flow instructions. */
    #[test]
    fn control_flow() {
        let mut a = new_assembler();
        a.push(RA);
        a.push(R13);
        a.pop(R13);
        a.pop(RSP);
        a.jump(RA);
        a.call(R11);
        a.ret();
        disassemble(&a.buffer, vec![
            "push rax",
            "push r13",
            "pop r13",
            "pop rsp",
            "jmp rax",
            "call r11",
            "ret",
        ]).unwrap();
    }

    /** Test the C-ABI call sequence. */
    #[test]
    fn abi_call() {
        let mut a = new_assembler();
        a.abi_call(0x76543210FEDCBA98, R11, 0);
        disassemble(&a.buffer, vec![
            "mov r11,rsp",
            "and rsp,0FFFFFFFFFFFFFFF0h",
            "push r11",
            "sub rsp,8",
            "mov r11,76543210FEDCBA98h",
            "call r11",
            "add rsp,8",
            "pop rsp",
        ]).unwrap();
    }

    /** Test forward and backward label references, byte-exactly. */
    #[test]
    fn labels() {
        let mut a = new_assembler();
        let label = a.label();
        assert!(!a.is_used(label));
        a.const_jump(label);            // 0..6
        assert!(a.is_used(label));
        a.jump_if(Z, true, label);      // 6..12
        assert_eq!(a.buffer.read(2, 4) as u32 as i32, UNKNOWN_DISP);
        a.define(label);                // target = 12
        assert_eq!(a.target(label), Some(12));
        assert_eq!(a.buffer.read(2, 4) as u32 as i32, 6);
        assert_eq!(a.buffer.read(8, 4) as u32 as i32, 0);
        a.const_call(label);            // 12..18: disp = 12 - 18
        assert_eq!(a.buffer.read(14, 4) as u32 as i32, -6);
        a.jump_if(NZ, false, label);    // jump-if-false inverts the condition
        assert_eq!(a.buffer.read_byte(19), 0x84);
    }

    /** Test the patchable pointer-sized constant. */
    #[test]
    fn const_patch() {
        let mut a = new_assembler();
        let at = a.const_patch(RA);
        assert_eq!(at, 2);
        assert_eq!(a.get_pos(), 10);
        assert_eq!(a.buffer.read(at, 8), 0);
        disassemble(&a.buffer, vec![
            "mov rax,0",
        ]).unwrap();
    }
}
