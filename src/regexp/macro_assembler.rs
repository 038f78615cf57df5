//! The macro assembler the regexp compiler drives: one method per regexp
//! "macro" instruction, each emitting a short machine-code sequence, and a
//! final [`generate_code()`] that wraps the emitted body in a prologue,
//! success/exit paths and the backtrack machinery.
//!
//! Register usage in generated code:
//!  - `CURRENT_CHARACTER` holds the character(s) most recently fetched by a
//!    `load_current_character*` op; the dispatch ops test it.
//!  - `CURRENT_POSITION` is the position in the input as a negative byte
//!    offset from the end of the string (not a character offset).
//!  - `INPUT_END_POINTER` points to the byte after the last input character.
//!  - `BACKTRACK_STACK_POINTER` points to the tip of the heap-allocated
//!    backtrack stack.
//!  - `RSP` addresses the frame: arguments, [`FrameData`] and the regex
//!    register file.
//!  - `TEMP0`..`TEMP2` are free for scratch within a single op.
//!
//! [`generate_code()`]: MacroAssembler::generate_code

use std::mem::{size_of};

use log::{debug, trace};

use crate::buffer::{Buffer, Mmap, VecU8};
use crate::target::{Label};
use crate::target::x86_64::{self, Abi, Assembler, BaseIndex, Register};
use crate::target::x86_64::Register::*;
use crate::target::x86_64::Precision::*;
use crate::target::x86_64::BinaryOp::*;
use crate::target::x86_64::ShiftOp::*;
use crate::target::x86_64::Condition::*;
use crate::target::x86_64::Width::*;
use crate::target::x86_64::Scale::*;

use super::{
    case_insensitive_compare_strings, CodeError, GlobalMode, InputOutputData,
    MatchPairs, Mode, RegExpCode, Runtime,
    RUN_STATUS_ERROR, RUN_STATUS_SUCCESS, RUN_STATUS_SUCCESS_NOT_FOUND,
};
use super::frame::{FrameData};
use super::stack::{self, grow_backtrack_stack};

//-----------------------------------------------------------------------------

// The fixed assignment of engine state to physical registers. The four
// long-lived values live in callee-save registers so that ABI calls from
// generated code cannot corrupt them; TEMP0 is RAX so a call result lands
// in it, and TEMP2 is sacrificed to argument setup.
const INPUT_END_POINTER: Register = RB;
const CURRENT_CHARACTER: Register = RBP;
const CURRENT_POSITION: Register = R12;
const BACKTRACK_STACK_POINTER: Register = R13;
const TEMP0: Register = RA;
const TEMP1: Register = RC;
const TEMP2: Register = RD;

const STATE_REGISTERS: [Register; 7] = [
    INPUT_END_POINTER, CURRENT_CHARACTER, CURRENT_POSITION,
    BACKTRACK_STACK_POINTER, TEMP0, TEMP1, TEMP2,
];

const POINTER_SIZE: i32 = size_of::<usize>() as i32;

/** The size of the tables [`check_bit_in_table()`] indexes.
 *
 * [`check_bit_in_table()`]: MacroAssembler::check_bit_in_table
 */
pub const TABLE_SIZE: usize = 128;

/** A pending absolute-address rewrite recorded by `push_backtrack`. */
struct LabelPatch {
    label: Label,
    /** Buffer offset of the 8-byte placeholder immediate. */
    patch_offset: usize,
}

//-----------------------------------------------------------------------------

/**
 * Generates native code for one regular expression. The compiler emits a
 * linear sequence of macro ops interleaved with [`bind()`]s, then calls
 * [`generate_code()`] exactly once.
 *
 * [`bind()`]: MacroAssembler::bind
 * [`generate_code()`]: MacroAssembler::generate_code
 */
pub struct MacroAssembler<'rt> {
    masm: Assembler<VecU8>,
    runtime: &'rt Runtime,
    mode: Mode,
    global_mode: GlobalMode,
    num_saved_registers: usize,
    num_registers: usize,
    saved_non_volatile_registers: Vec<Register>,
    abi: Abi,
    label_patches: Vec<LabelPatch>,
    entry_label: Label,
    start_label: Label,
    success_label: Label,
    exit_label: Label,
    backtrack_label: Label,
    stack_overflow_label: Label,
    exit_with_exception_label: Label,
}

impl<'rt> MacroAssembler<'rt> {
    /**
     * Constructs a macro assembler for a regexp with
     * `num_saved_registers / 2` capture pairs, matching against `runtime`'s
     * backtrack stack and stack limit. The first emitted instruction jumps
     * over the body to the prologue that `generate_code` will place after
     * it.
     */
    pub fn new(runtime: &'rt Runtime, mode: Mode, num_saved_registers: usize) -> Self {
        assert!(num_saved_registers > 0);
        assert_eq!(num_saved_registers % 2, 0);

        let abi = x86_64::host_abi();
        let saved_non_volatile_registers: Vec<Register> = abi.callee_saved_registers
            .iter()
            .copied()
            .filter(|r| STATE_REGISTERS.contains(r))
            .collect();

        let mut masm = Assembler::new(VecU8::new());
        let entry_label = masm.label();
        let start_label = masm.label();
        let success_label = masm.label();
        let exit_label = masm.label();
        let backtrack_label = masm.label();
        let stack_overflow_label = masm.label();
        let exit_with_exception_label = masm.label();

        masm.const_jump(entry_label);
        masm.define(start_label);

        MacroAssembler {
            masm,
            runtime,
            mode,
            global_mode: GlobalMode::NotGlobal,
            num_saved_registers,
            num_registers: num_saved_registers,
            saved_non_volatile_registers,
            abi,
            label_patches: Vec::new(),
            entry_label,
            start_label,
            success_label,
            exit_label,
            backtrack_label,
            stack_overflow_label,
            exit_with_exception_label,
        }
    }

    pub fn set_global_mode(&mut self, mode: GlobalMode) {
        self.global_mode = mode;
    }

    fn global(&self) -> bool {
        self.global_mode != GlobalMode::NotGlobal
    }

    fn global_with_zero_length_check(&self) -> bool {
        self.global_mode == GlobalMode::Global
    }

    fn char_size(&self) -> i32 {
        match self.mode {
            Mode::Ascii => 1,
            Mode::Char16 => 2,
        }
    }

    fn factor(&self) -> x86_64::Scale {
        match self.mode {
            Mode::Ascii => Times1,
            Mode::Char16 => Times2,
        }
    }

    /** The spare headroom of the backtrack arena, in entries. */
    pub fn stack_limit_slack() -> usize {
        stack::STACK_LIMIT_SLACK
    }

    pub fn can_read_unaligned() -> bool {
        true
    }

    /** Constructs a fresh label for the compiler to target and bind. */
    pub fn label(&mut self) -> Label {
        self.masm.label()
    }

    /**
     * The frame address of regex register `reg`, growing the register file
     * to cover it.
     */
    fn register_location(&mut self, reg: usize) -> (Register, i32) {
        if reg >= self.num_registers {
            self.num_registers = reg + 1;
        }
        (RSP, FrameData::register_offset(reg))
    }

    /** Branch on `cc` to `to`, or to the backtrack code if `to` is `None`. */
    fn branch_or_backtrack(&mut self, cc: x86_64::Condition, to: Option<Label>) {
        let target = to.unwrap_or(self.backtrack_label);
        self.masm.jump_if(cc, true, target);
    }

    /** Jump to `to`, or pop a backtrack target and jump to it. */
    pub fn jump_or_backtrack(&mut self, to: Option<Label>) {
        match to {
            Some(label) => self.masm.const_jump(label),
            None => self.backtrack(),
        }
    }

    // The macro operations, in the order the compiler's contract lists them.

    /** `current_position += by` characters. */
    pub fn advance_current_position(&mut self, by: i32) {
        trace!("advance_current_position({by})");
        if by != 0 {
            self.masm.const_op(Add, P64, CURRENT_POSITION, by * self.char_size());
        }
    }

    /** `register[reg] += by` (pointer-wide). */
    pub fn advance_register(&mut self, reg: usize, by: i32) {
        trace!("advance_register({reg}, {by})");
        if by != 0 {
            let location = self.register_location(reg);
            self.masm.mem_op(Add, P64, location, by);
        }
    }

    /** Pop a code location off the backtrack stack and jump to it. */
    pub fn backtrack(&mut self) {
        trace!("backtrack");
        self.pop_backtrack(TEMP0);
        self.masm.jump(TEMP0);
    }

    /** Mark `label` as addressing the next emitted instruction. */
    pub fn bind(&mut self, label: Label) {
        trace!("bind");
        self.masm.define(label);
    }

    /**
     * As [`bind()`], for a label that `push_backtrack` targets. The bound
     * offset is read from the label table when the pending patches are
     * applied after code materialization.
     *
     * [`bind()`]: MacroAssembler::bind
     */
    pub fn bind_backtrack(&mut self, label: Label) {
        trace!("bind_backtrack");
        self.masm.define(label);
    }

    /**
     * Branch iff matching started at the very beginning of the input and
     * `current_position` is still there.
     */
    pub fn check_at_start(&mut self, on_at_start: Option<Label>) {
        trace!("check_at_start");
        let not_at_start = self.masm.label();

        // Did we start the match at the start of the string at all?
        self.masm.mem_op(Cmp, P64, (RSP, FrameData::START_INDEX), 0);
        self.branch_or_backtrack(NZ, Some(not_at_start));

        // If we did, are we still at the start of the input?
        self.masm.lea_index(TEMP0, BaseIndex(INPUT_END_POINTER, CURRENT_POSITION, Times1, 0));
        self.masm.mem_op_reg(Cmp, P64, (RSP, FrameData::INPUT_START), TEMP0);
        self.branch_or_backtrack(Z, on_at_start);
        self.masm.define(not_at_start);
    }

    pub fn check_not_at_start(&mut self, on_not_at_start: Option<Label>) {
        trace!("check_not_at_start");

        // Did we start the match at the start of the string at all?
        self.masm.mem_op(Cmp, P64, (RSP, FrameData::START_INDEX), 0);
        self.branch_or_backtrack(NZ, on_not_at_start);

        // If we did, are we still at the start of the input?
        self.masm.lea_index(TEMP0, BaseIndex(INPUT_END_POINTER, CURRENT_POSITION, Times1, 0));
        self.masm.mem_op_reg(Cmp, P64, (RSP, FrameData::INPUT_START), TEMP0);
        self.branch_or_backtrack(NZ, on_not_at_start);
    }

    pub fn check_character(&mut self, c: u32, on_equal: Option<Label>) {
        trace!("check_character({c})");
        self.masm.const_op(Cmp, P32, CURRENT_CHARACTER, c as i32);
        self.branch_or_backtrack(Z, on_equal);
    }

    pub fn check_not_character(&mut self, c: u32, on_not_equal: Option<Label>) {
        trace!("check_not_character({c})");
        self.masm.const_op(Cmp, P32, CURRENT_CHARACTER, c as i32);
        self.branch_or_backtrack(NZ, on_not_equal);
    }

    /** Branch iff `current_character & and_with == c`. */
    pub fn check_character_after_and(&mut self, c: u32, and_with: u32, on_equal: Option<Label>) {
        trace!("check_character_after_and({c}, {and_with})");
        if c == 0 {
            self.masm.const_test(P32, CURRENT_CHARACTER, and_with as i32);
            self.branch_or_backtrack(Z, on_equal);
        } else {
            self.masm.const_(P64, TEMP0, i64::from(and_with));
            self.masm.op(And, P32, TEMP0, CURRENT_CHARACTER);
            self.masm.const_op(Cmp, P32, TEMP0, c as i32);
            self.branch_or_backtrack(Z, on_equal);
        }
    }

    pub fn check_not_character_after_and(&mut self, c: u32, and_with: u32, on_not_equal: Option<Label>) {
        trace!("check_not_character_after_and({c}, {and_with})");
        if c == 0 {
            self.masm.const_test(P32, CURRENT_CHARACTER, and_with as i32);
            self.branch_or_backtrack(NZ, on_not_equal);
        } else {
            self.masm.const_(P64, TEMP0, i64::from(and_with));
            self.masm.op(And, P32, TEMP0, CURRENT_CHARACTER);
            self.masm.const_op(Cmp, P32, TEMP0, c as i32);
            self.branch_or_backtrack(NZ, on_not_equal);
        }
    }

    /** Signed comparison, observable for packed two-character loads. */
    pub fn check_character_gt(&mut self, c: u16, on_greater: Option<Label>) {
        trace!("check_character_gt({c})");
        self.masm.const_op(Cmp, P32, CURRENT_CHARACTER, i32::from(c));
        self.branch_or_backtrack(G, on_greater);
    }

    pub fn check_character_lt(&mut self, c: u16, on_less: Option<Label>) {
        trace!("check_character_lt({c})");
        self.masm.const_op(Cmp, P32, CURRENT_CHARACTER, i32::from(c));
        self.branch_or_backtrack(L, on_less);
    }

    /**
     * If the top of the backtrack stack equals `current_position`, pop it
     * and branch. Used to cut repeated zero-progress iterations of greedy
     * loops.
     */
    pub fn check_greedy_loop(&mut self, on_tos_equals_current_position: Option<Label>) {
        trace!("check_greedy_loop");
        let fallthrough = self.masm.label();
        self.masm.mem_op_reg(Cmp, P64, (BACKTRACK_STACK_POINTER, -POINTER_SIZE), CURRENT_POSITION);
        self.masm.jump_if(NZ, true, fallthrough);
        self.masm.const_op(Sub, P64, BACKTRACK_STACK_POINTER, POINTER_SIZE); // Pop.
        self.jump_or_backtrack(on_tos_equals_current_position);
        self.masm.define(fallthrough);
    }

    /**
     * Compare the capture in `(start_reg, start_reg + 1)` against the text
     * at `current_position`; on match, advance past it, otherwise branch.
     */
    pub fn check_not_back_reference(&mut self, start_reg: usize, on_no_match: Option<Label>) {
        trace!("check_not_back_reference({start_reg})");
        let fallthrough = self.masm.label();
        let success = self.masm.label();
        let fail = self.masm.label();

        // Find length of back-referenced capture.
        let start_location = self.register_location(start_reg);
        let end_location = self.register_location(start_reg + 1);
        self.masm.load(P64, CURRENT_CHARACTER, start_location);
        self.masm.load(P64, TEMP0, end_location);
        self.masm.op(Sub, P64, TEMP0, CURRENT_CHARACTER); // Length to check.
        self.masm.const_op(Cmp, P64, TEMP0, 0);

        // Fail on partial or illegal capture (start after end).
        self.branch_or_backtrack(L, on_no_match);

        // Succeed on empty capture (including no capture).
        self.masm.jump_if(Z, true, fallthrough);

        // Check that there are sufficient characters left in the input.
        self.masm.move_(P64, TEMP1, CURRENT_POSITION);
        self.masm.op(Add, P64, TEMP1, TEMP0);
        self.masm.const_op(Cmp, P64, TEMP1, 0);
        self.branch_or_backtrack(G, on_no_match);

        // Save the backtrack stack pointer, freeing it for use below.
        self.masm.push(BACKTRACK_STACK_POINTER);

        // Compute pointers to match string and capture string.
        self.masm.lea_index(TEMP1, BaseIndex(INPUT_END_POINTER, CURRENT_POSITION, Times1, 0)); // Start of match.
        self.masm.op(Add, P64, CURRENT_CHARACTER, INPUT_END_POINTER); // Start of capture.
        self.masm.lea_index(BACKTRACK_STACK_POINTER, BaseIndex(TEMP0, TEMP1, Times1, 0)); // End of match.

        let loop_ = self.masm.label();
        self.masm.define(loop_);
        match self.mode {
            Mode::Ascii => unimplemented!("latin-1 back-reference comparison"),
            Mode::Char16 => {
                self.masm.load_narrow(P32, U16, TEMP0, (CURRENT_CHARACTER, 0));
                self.masm.load_narrow(P32, U16, TEMP2, (TEMP1, 0));
            }
        }
        self.masm.op(Cmp, P32, TEMP0, TEMP2);
        self.masm.jump_if(NZ, true, fail);

        // Increment pointers into capture and match string.
        self.masm.const_op(Add, P64, CURRENT_CHARACTER, self.char_size());
        self.masm.const_op(Add, P64, TEMP1, self.char_size());

        // Check if we have reached the end of the match area.
        self.masm.op(Cmp, P64, TEMP1, BACKTRACK_STACK_POINTER);
        self.masm.jump_if(B, true, loop_);
        self.masm.const_jump(success);

        self.masm.define(fail);
        self.masm.pop(BACKTRACK_STACK_POINTER);
        self.jump_or_backtrack(on_no_match);

        self.masm.define(success);

        // Move current character position to position after the match.
        self.masm.move_(P64, CURRENT_POSITION, BACKTRACK_STACK_POINTER);
        self.masm.op(Sub, P64, CURRENT_POSITION, INPUT_END_POINTER);
        self.masm.pop(BACKTRACK_STACK_POINTER);

        self.masm.define(fallthrough);
    }

    /**
     * As [`check_not_back_reference()`], under simple case folding, by
     * calling out to [`case_insensitive_compare_strings`].
     *
     * [`check_not_back_reference()`]: MacroAssembler::check_not_back_reference
     */
    pub fn check_not_back_reference_ignore_case(&mut self, start_reg: usize, on_no_match: Option<Label>) {
        trace!("check_not_back_reference_ignore_case({start_reg})");
        let fallthrough = self.masm.label();

        let start_location = self.register_location(start_reg);
        let end_location = self.register_location(start_reg + 1);
        self.masm.load(P64, CURRENT_CHARACTER, start_location); // Offset of start of capture.
        self.masm.load(P64, TEMP1, end_location);
        self.masm.op(Sub, P64, TEMP1, CURRENT_CHARACTER); // Length of capture.
        self.masm.const_op(Cmp, P64, TEMP1, 0);

        // A negative length only happens for an unrecorded or inverted
        // capture; fail the check.
        self.branch_or_backtrack(L, on_no_match);

        // An empty or absent capture matches trivially.
        self.masm.jump_if(Z, true, fallthrough);

        // Check that there are sufficient characters left in the input.
        self.masm.move_(P64, TEMP0, CURRENT_POSITION);
        self.masm.op(Add, P64, TEMP0, TEMP1);
        self.masm.const_op(Cmp, P64, TEMP0, 0);
        self.branch_or_backtrack(G, on_no_match);

        match self.mode {
            Mode::Ascii => unimplemented!("latin-1 case-insensitive back-reference"),
            Mode::Char16 => {
                // TEMP1 (the byte length) is needed after the call, so it
                // stays in the saved volatile set.
                let volatiles: Vec<Register> = self.abi.volatile_registers
                    .iter()
                    .copied()
                    .filter(|&r| r != TEMP0 && r != TEMP2)
                    .collect();
                for &r in &volatiles {
                    self.masm.push(r);
                }

                // Arguments: capture start address, current position
                // address, byte length. Set up in reverse so the length
                // survives any overlap with the argument registers.
                let [arg0, arg1, arg2] = self.abi.arg_registers;
                self.masm.move_(P64, arg2, TEMP1);
                self.masm.lea_index(arg1, BaseIndex(INPUT_END_POINTER, CURRENT_POSITION, Times1, 0));
                self.masm.lea_index(arg0, BaseIndex(INPUT_END_POINTER, CURRENT_CHARACTER, Times1, 0));
                self.masm.abi_call(
                    case_insensitive_compare_strings as usize, R11, self.abi.shadow_space);

                for &r in volatiles.iter().rev() {
                    self.masm.pop(r);
                }

                // Zero return means mismatch.
                self.masm.test(P32, TEMP0, TEMP0);
                self.branch_or_backtrack(Z, on_no_match);

                // On success, advance position by the length of the capture.
                self.masm.op(Add, P64, CURRENT_POSITION, TEMP1);
            }
        }

        self.masm.define(fallthrough);
    }

    /** Branch iff `(current_character - minus) & and_with != c`. */
    pub fn check_not_character_after_minus_and(
        &mut self, c: u16, minus: u16, and_with: u16, on_not_equal: Option<Label>,
    ) {
        trace!("check_not_character_after_minus_and({c}, {minus}, {and_with})");
        self.masm.lea(TEMP0, (CURRENT_CHARACTER, -i32::from(minus)));
        if c == 0 {
            self.masm.const_test(P32, TEMP0, i32::from(and_with));
            self.branch_or_backtrack(NZ, on_not_equal);
        } else {
            self.masm.const_op(And, P32, TEMP0, i32::from(and_with));
            self.masm.const_op(Cmp, P32, TEMP0, i32::from(c));
            self.branch_or_backtrack(NZ, on_not_equal);
        }
    }

    /**
     * Branch iff `from <= current_character <= to`, as the unsigned
     * comparison `current_character - from <= to - from`.
     */
    pub fn check_character_in_range(&mut self, from: u16, to: u16, on_in_range: Option<Label>) {
        trace!("check_character_in_range({from}, {to})");
        assert!(from <= to);
        self.masm.lea(TEMP0, (CURRENT_CHARACTER, -i32::from(from)));
        self.masm.const_op(Cmp, P32, TEMP0, i32::from(to) - i32::from(from));
        self.branch_or_backtrack(BE, on_in_range);
    }

    pub fn check_character_not_in_range(&mut self, from: u16, to: u16, on_not_in_range: Option<Label>) {
        trace!("check_character_not_in_range({from}, {to})");
        assert!(from <= to);
        self.masm.lea(TEMP0, (CURRENT_CHARACTER, -i32::from(from)));
        self.masm.const_op(Cmp, P32, TEMP0, i32::from(to) - i32::from(from));
        self.branch_or_backtrack(A, on_not_in_range);
    }

    /** Branch iff `table[current_character & (TABLE_SIZE - 1)]` is nonzero. */
    pub fn check_bit_in_table(&mut self, table: &'static [u8; TABLE_SIZE], on_bit_set: Option<Label>) {
        trace!("check_bit_in_table");
        match self.mode {
            Mode::Ascii => unimplemented!("latin-1 table dispatch"),
            Mode::Char16 => {}
        }
        self.masm.const_(P64, TEMP0, table.as_ptr() as i64);
        self.masm.const_(P64, TEMP1, (TABLE_SIZE - 1) as i64);
        self.masm.op(And, P32, TEMP1, CURRENT_CHARACTER);
        self.masm.load_narrow_index(P32, U8, TEMP0, BaseIndex(TEMP0, TEMP1, Times1, 0));
        self.masm.test(P32, TEMP0, TEMP0);
        self.branch_or_backtrack(NZ, on_bit_set);
    }

    /** Record "no match" (unless global) and exit. */
    pub fn fail(&mut self) {
        trace!("fail");
        if !self.global() {
            self.masm.const_(P64, TEMP0, RUN_STATUS_SUCCESS_NOT_FOUND as i64);
        }
        self.masm.const_jump(self.exit_label);
    }

    pub fn if_register_ge(&mut self, reg: usize, comparand: i32, if_ge: Option<Label>) {
        trace!("if_register_ge({reg}, {comparand})");
        let location = self.register_location(reg);
        self.masm.mem_op(Cmp, P64, location, comparand);
        self.branch_or_backtrack(GE, if_ge);
    }

    pub fn if_register_lt(&mut self, reg: usize, comparand: i32, if_lt: Option<Label>) {
        trace!("if_register_lt({reg}, {comparand})");
        let location = self.register_location(reg);
        self.masm.mem_op(Cmp, P64, location, comparand);
        self.branch_or_backtrack(L, if_lt);
    }

    pub fn if_register_eq_pos(&mut self, reg: usize, if_eq: Option<Label>) {
        trace!("if_register_eq_pos({reg})");
        let location = self.register_location(reg);
        self.masm.mem_op_reg(Cmp, P64, location, CURRENT_POSITION);
        self.branch_or_backtrack(Z, if_eq);
    }

    /**
     * Fetch `characters` characters at `current_position + cp_offset` into
     * `current_character`, after an optional bounds check.
     */
    pub fn load_current_character(
        &mut self, cp_offset: i32, on_end_of_input: Option<Label>,
        check_bounds: bool, characters: i32,
    ) {
        trace!("load_current_character({cp_offset}, {characters})");
        assert!(cp_offset >= -1); // ^ and \b can look behind one character.
        assert!(cp_offset < (1 << 30));
        if check_bounds {
            self.check_position(cp_offset + characters - 1, on_end_of_input);
        }
        self.load_current_character_unchecked(cp_offset, characters);
    }

    pub fn load_current_character_unchecked(&mut self, cp_offset: i32, characters: i32) {
        trace!("load_current_character_unchecked({cp_offset}, {characters})");
        match self.mode {
            Mode::Ascii => unimplemented!("latin-1 loads"),
            Mode::Char16 => {
                assert!(characters == 1 || characters == 2);
                let address = BaseIndex(
                    INPUT_END_POINTER, CURRENT_POSITION, Times1,
                    cp_offset * self.char_size());
                if characters == 2 {
                    self.masm.load_index(P32, CURRENT_CHARACTER, address);
                } else {
                    self.masm.load_narrow_index(P32, U16, CURRENT_CHARACTER, address);
                }
            }
        }
    }

    pub fn pop_current_position(&mut self) {
        trace!("pop_current_position");
        self.pop_backtrack(CURRENT_POSITION);
    }

    pub fn push_current_position(&mut self) {
        trace!("push_current_position");
        self.push_backtrack_register(CURRENT_POSITION);
    }

    pub fn pop_register(&mut self, reg: usize) {
        trace!("pop_register({reg})");
        self.pop_backtrack(TEMP0);
        let location = self.register_location(reg);
        self.masm.store(P64, location, TEMP0);
    }

    pub fn push_register(&mut self, reg: usize, check_stack_limit: bool) {
        trace!("push_register({reg})");
        let location = self.register_location(reg);
        self.masm.load(P64, TEMP0, location);
        self.push_backtrack_register(TEMP0);
        if check_stack_limit {
            self.check_backtrack_stack_limit();
        }
    }

    /**
     * Push the eventual address of `label` as a backtrack target. The
     * address is not known yet: a placeholder constant is emitted and a
     * patch is recorded against the label, to be resolved after the code
     * is materialized.
     */
    pub fn push_backtrack(&mut self, label: Label) {
        trace!("push_backtrack");
        debug_assert!(self.masm.target(label).is_none());
        let patch_offset = self.masm.const_patch(TEMP0);
        self.label_patches.push(LabelPatch {label, patch_offset});
        self.push_backtrack_register(TEMP0);
        self.check_backtrack_stack_limit();
    }

    /**
     * Push a constant as a backtrack entry. The entry is pointer-wide with
     * zero upper bits; `value` must be nonnegative.
     */
    pub fn push_backtrack_constant(&mut self, value: i32) {
        trace!("push_backtrack_constant({value})");
        debug_assert!(value >= 0);
        // This updates flags, unlike a canonical push.
        self.masm.store_imm(P64, (BACKTRACK_STACK_POINTER, 0), value);
        self.masm.const_op(Add, P64, BACKTRACK_STACK_POINTER, POINTER_SIZE);
    }

    /** Raw push of `source`. Updates flags, unlike a canonical push. */
    fn push_backtrack_register(&mut self, source: Register) {
        assert!(source != BACKTRACK_STACK_POINTER);
        self.masm.store(P64, (BACKTRACK_STACK_POINTER, 0), source);
        self.masm.const_op(Add, P64, BACKTRACK_STACK_POINTER, POINTER_SIZE);
    }

    /** Raw pop into `target`. Updates flags, unlike a canonical pop. */
    fn pop_backtrack(&mut self, target: Register) {
        assert!(target != BACKTRACK_STACK_POINTER);
        self.masm.const_op(Sub, P64, BACKTRACK_STACK_POINTER, POINTER_SIZE);
        self.masm.load(P64, target, (BACKTRACK_STACK_POINTER, 0));
    }

    /**
     * If the backtrack stack has passed its limit, call the overflow code
     * to grow it, exiting with an exception if the growth failed.
     */
    pub fn check_backtrack_stack_limit(&mut self) {
        trace!("check_backtrack_stack_limit");
        let no_stack_overflow = self.masm.label();

        let limit_address = self.runtime.regexp_stack().limit_address();
        self.masm.const_(P64, TEMP1, limit_address as i64);
        self.masm.mem_op_reg(Cmp, P64, (TEMP1, 0), BACKTRACK_STACK_POINTER);
        self.masm.jump_if(AE, true, no_stack_overflow);

        // Copy the stack pointer before the call() instruction modifies it;
        // the overflow code addresses FrameData through it.
        self.masm.move_(P64, TEMP2, RSP);
        self.masm.const_call(self.stack_overflow_label);

        // A zero result means the arena could not grow.
        self.masm.test(P32, TEMP0, TEMP0);
        self.masm.jump_if(Z, true, self.exit_with_exception_label);

        self.masm.define(no_stack_overflow);
    }

    pub fn read_current_position_from_register(&mut self, reg: usize) {
        trace!("read_current_position_from_register({reg})");
        let location = self.register_location(reg);
        self.masm.load(P64, CURRENT_POSITION, location);
    }

    pub fn write_current_position_to_register(&mut self, reg: usize, cp_offset: i32) {
        trace!("write_current_position_to_register({reg}, {cp_offset})");
        let location = self.register_location(reg);
        if cp_offset == 0 {
            self.masm.store(P64, location, CURRENT_POSITION);
        } else {
            self.masm.lea(TEMP0, (CURRENT_POSITION, cp_offset * self.char_size()));
            self.masm.store(P64, location, TEMP0);
        }
    }

    /**
     * The saved value is the offset from the arena base, not an absolute
     * address, so it stays valid across an arena relocation.
     */
    pub fn read_backtrack_stack_pointer_from_register(&mut self, reg: usize) {
        trace!("read_backtrack_stack_pointer_from_register({reg})");
        let location = self.register_location(reg);
        self.masm.load(P64, BACKTRACK_STACK_POINTER, location);
        self.masm.load_op(Add, P64, BACKTRACK_STACK_POINTER, (RSP, FrameData::BACKTRACK_STACK_BASE));
    }

    pub fn write_backtrack_stack_pointer_to_register(&mut self, reg: usize) {
        trace!("write_backtrack_stack_pointer_to_register({reg})");
        let location = self.register_location(reg);
        self.masm.move_(P64, TEMP0, BACKTRACK_STACK_POINTER);
        self.masm.load_op(Sub, P64, TEMP0, (RSP, FrameData::BACKTRACK_STACK_BASE));
        self.masm.store(P64, location, TEMP0);
    }

    /**
     * Clamp `current_position` to at most `by` characters before the end
     * of input, reloading the lookbehind character if it moved.
     */
    pub fn set_current_position_from_end(&mut self, by: i32) {
        trace!("set_current_position_from_end({by})");
        let after_position = self.masm.label();
        self.masm.const_op(Cmp, P64, CURRENT_POSITION, -by * self.char_size());
        self.masm.jump_if(GE, true, after_position);
        self.masm.const_(P64, CURRENT_POSITION, i64::from(-by * self.char_size()));

        // The character before the current position is expected to be
        // already loaded, and we have moved the position, so reload it.
        self.load_current_character_unchecked(-1, 1);
        self.masm.define(after_position);
    }

    pub fn set_register(&mut self, reg: usize, to: i32) {
        trace!("set_register({reg}, {to})");
        assert!(reg >= self.num_saved_registers); // Reserved for positions!
        let location = self.register_location(reg);
        self.masm.store_imm(P64, location, to);
    }

    /**
     * Jump to the success handling. Returns whether the regexp is global,
     * in which case more matching work may follow.
     */
    pub fn succeed(&mut self) -> bool {
        trace!("succeed");
        self.masm.const_jump(self.success_label);
        self.global()
    }

    /** Fill registers `reg_from..=reg_to` with the unset-capture sentinel. */
    pub fn clear_registers(&mut self, reg_from: usize, reg_to: usize) {
        trace!("clear_registers({reg_from}, {reg_to})");
        assert!(reg_from <= reg_to);
        self.masm.load(P64, TEMP0, (RSP, FrameData::INPUT_START_MINUS_ONE));
        for reg in reg_from..=reg_to {
            let location = self.register_location(reg);
            self.masm.store(P64, location, TEMP0);
        }
    }

    /** Branch iff `current_position + cp_offset` is outside the input. */
    pub fn check_position(&mut self, cp_offset: i32, on_outside_input: Option<Label>) {
        trace!("check_position({cp_offset})");
        self.masm.const_op(Cmp, P64, CURRENT_POSITION, -cp_offset * self.char_size());
        self.branch_or_backtrack(GE, on_outside_input);
    }

    /**
     * Emit a fast path for a character-class shorthand, returning whether
     * one exists; on `false` the compiler falls back to generic code.
     */
    pub fn check_special_character_class(&mut self, kind: char, on_no_match: Option<Label>) -> bool {
        trace!("check_special_character_class({kind:?})");
        // Range checks (c in min..max) are generally implemented by an
        // unsigned (c - min) <= (max - min) check.
        match kind {
            's' => {
                // Match space characters.
                match self.mode {
                    Mode::Ascii => unimplemented!("latin-1 space class"),
                    Mode::Char16 => false,
                }
            }
            'S' => {
                // The generic character-class code is good enough.
                false
            }
            'd' => {
                // Match ASCII digits ('0'..'9').
                if self.mode == Mode::Ascii {
                    unimplemented!("latin-1 digit class");
                }
                self.masm.lea(TEMP0, (CURRENT_CHARACTER, -i32::from(b'0')));
                self.masm.const_op(Cmp, P32, TEMP0, i32::from(b'9' - b'0'));
                self.branch_or_backtrack(A, on_no_match);
                true
            }
            'D' => {
                // Match non ASCII-digits.
                if self.mode == Mode::Ascii {
                    unimplemented!("latin-1 digit class");
                }
                self.masm.lea(TEMP0, (CURRENT_CHARACTER, -i32::from(b'0')));
                self.masm.const_op(Cmp, P32, TEMP0, i32::from(b'9' - b'0'));
                self.branch_or_backtrack(BE, on_no_match);
                true
            }
            '.' => {
                // Match non-newlines: not 0x0a ('\n'), 0x0d ('\r'), 0x2028
                // or 0x2029.
                self.masm.move_(P64, TEMP0, CURRENT_CHARACTER);
                self.masm.const_op(Xor, P32, TEMP0, 0x01);

                // See if the character is '\n'^1 or '\r'^1, i.e. 0x0b or 0x0c.
                self.masm.const_op(Sub, P32, TEMP0, 0x0b);
                self.masm.const_op(Cmp, P32, TEMP0, 0x0c - 0x0b);
                self.branch_or_backtrack(BE, on_no_match);
                if self.mode == Mode::Char16 {
                    // Compare against 0x2028 and 0x2029 using the already
                    // computed (c ^ 0x01) - 0x0b, i.e. check for 0x201d or
                    // 0x201e.
                    self.masm.const_op(Sub, P32, TEMP0, 0x2028 - 0x0b);
                    self.masm.const_op(Cmp, P32, TEMP0, 0x2029 - 0x2028);
                    self.branch_or_backtrack(BE, on_no_match);
                }
                true
            }
            'n' => {
                // Match newlines; the complement of '.'.
                self.masm.move_(P64, TEMP0, CURRENT_CHARACTER);
                self.masm.const_op(Xor, P32, TEMP0, 0x01);
                self.masm.const_op(Sub, P32, TEMP0, 0x0b);
                self.masm.const_op(Cmp, P32, TEMP0, 0x0c - 0x0b);
                match self.mode {
                    Mode::Ascii => {
                        self.branch_or_backtrack(A, on_no_match);
                    }
                    Mode::Char16 => {
                        let done = self.masm.label();
                        self.masm.jump_if(BE, true, done);
                        self.masm.const_op(Sub, P32, TEMP0, 0x2028 - 0x0b);
                        self.masm.const_op(Cmp, P32, TEMP0, 0x2029 - 0x2028);
                        self.branch_or_backtrack(A, on_no_match);
                        self.masm.define(done);
                    }
                }
                true
            }
            'w' => {
                if self.mode == Mode::Ascii {
                    unimplemented!("latin-1 word class");
                }
                // The table covers ASCII; everything above 'z' is a non-word
                // character.
                self.masm.const_op(Cmp, P32, CURRENT_CHARACTER, i32::from(b'z'));
                self.branch_or_backtrack(A, on_no_match);
                self.masm.const_(P64, TEMP0, WORD_CHARACTER_MAP.as_ptr() as i64);
                self.masm.load_narrow_index(
                    P32, U8, TEMP0, BaseIndex(TEMP0, CURRENT_CHARACTER, Times1, 0));
                self.masm.test(P32, TEMP0, TEMP0);
                self.branch_or_backtrack(Z, on_no_match);
                true
            }
            'W' => {
                if self.mode == Mode::Ascii {
                    unimplemented!("latin-1 word class");
                }
                let done = self.masm.label();
                self.masm.const_op(Cmp, P32, CURRENT_CHARACTER, i32::from(b'z'));
                self.masm.jump_if(A, true, done);
                self.masm.const_(P64, TEMP0, WORD_CHARACTER_MAP.as_ptr() as i64);
                self.masm.load_narrow_index(
                    P32, U8, TEMP0, BaseIndex(TEMP0, CURRENT_CHARACTER, Times1, 0));
                self.masm.test(P32, TEMP0, TEMP0);
                self.branch_or_backtrack(NZ, on_no_match);
                self.masm.define(done);
                true
            }
            '*' => {
                // Match any character.
                true
            }
            _ => {
                // No custom implementation.
                false
            }
        }
    }

    //-------------------------------------------------------------------------

    /**
     * Wraps the emitted body in the entry/exit code and produces the
     * executable routine:
     *
     * ```text
     * extern "C" fn execute(*mut InputOutputData)
     * ```
     *
     * Fails only if executable memory cannot be obtained.
     */
    pub fn generate_code(mut self) -> Result<RegExpCode<'rt>, CodeError> {
        trace!("generate_code");

        // We need an even number of registers, for stack alignment.
        if self.num_registers % 2 == 1 {
            self.num_registers += 1;
        }
        let num_saved = self.num_saved_registers;
        let char_size = self.char_size();

        let return_temp0 = self.masm.label();
        let load_char_start_regexp = self.masm.label();
        let start_regexp = self.masm.label();

        // The entry point code, now that we know how many registers the
        // body uses.
        self.masm.define(self.entry_label);

        // Push non-volatile registers which the body modifies.
        let saved = self.saved_non_volatile_registers.clone();
        for &reg in &saved {
            self.masm.push(reg);
        }

        // The InputOutputData* argument is stored on the stack immediately
        // above the frame.
        self.masm.push(self.abi.arg_registers[0]);
        let pushed = (saved.len() + 1) * size_of::<usize>();

        let raw_frame_size = size_of::<FrameData>() + self.num_registers * size_of::<usize>();
        let alignment = x86_64::STACK_ALIGNMENT;
        let frame_size = ((raw_frame_size + pushed + alignment - 1) & !(alignment - 1)) - pushed;
        let io_address = (RSP, frame_size as i32);

        self.masm.const_op(Sub, P64, RSP, frame_size as i32);

        // Check if we have space on the native stack; exit with an error
        // result if not.
        let stack_ok = self.masm.label();
        self.masm.const_(P64, TEMP0, self.runtime.jit_stack_limit_address() as i64);
        self.masm.mem_op_reg(Cmp, P64, (TEMP0, 0), RSP);
        self.masm.jump_if(B, true, stack_ok);
        self.masm.const_(P64, TEMP0, RUN_STATUS_ERROR as i64);
        self.masm.const_jump(return_temp0);
        self.masm.define(stack_ok);

        if self.abi.touch_frame_pages {
            // Write to each reserved stack page in descending order;
            // skipping a page can fault.
            let mut offset = frame_size as i64 - POINTER_SIZE as i64;
            while offset >= 0 {
                self.masm.store(P64, (RSP, offset as i32), TEMP0);
                offset -= self.abi.page_size as i64;
            }
        }

        self.masm.load(P64, TEMP0, io_address);

        // Copy the capture output description to FrameData.
        {
            let match_pairs = INPUT_END_POINTER; // Not yet loaded; borrow it.
            self.masm.load(P64, match_pairs, (TEMP0, InputOutputData::MATCHES));
            self.masm.load(P64, TEMP1, (match_pairs, MatchPairs::PAIRS));
            self.masm.store(P64, (RSP, FrameData::OUTPUT_REGISTERS), TEMP1);
            self.masm.load(P32, TEMP1, (match_pairs, MatchPairs::PAIR_COUNT));
            self.masm.const_shift(Shl, P64, TEMP1, 1);
            self.masm.store(P32, (RSP, FrameData::NUM_OUTPUT_REGISTERS), TEMP1);

            if cfg!(debug_assertions) {
                // Bounds check numOutputRegisters.
                let enough_registers = self.masm.label();
                self.masm.const_op(Cmp, P64, TEMP1, num_saved as i32);
                self.masm.jump_if(GE, true, enough_registers);
                self.masm.ud2();
                self.masm.define(enough_registers);
            }
        }

        // Load the string end pointer.
        self.masm.load(P64, INPUT_END_POINTER, (TEMP0, InputOutputData::INPUT_END));

        // Load the input start pointer and the start index, copying both to
        // FrameData.
        self.masm.load(P64, CURRENT_POSITION, (TEMP0, InputOutputData::INPUT_START));
        self.masm.store(P64, (RSP, FrameData::INPUT_START), CURRENT_POSITION);
        self.masm.load(P64, TEMP1, (TEMP0, InputOutputData::START_INDEX));
        self.masm.store(P64, (RSP, FrameData::START_INDEX), TEMP1);

        // Set up the input position as a negative offset from the string
        // end, and keep the address of the character before the start as
        // the unset-capture sentinel.
        self.masm.op(Sub, P64, CURRENT_POSITION, INPUT_END_POINTER);
        self.masm.lea(TEMP0, (CURRENT_POSITION, -char_size));
        self.masm.store(P64, (RSP, FrameData::INPUT_START_MINUS_ONE), TEMP0);

        // Update the current position for the start index.
        self.masm.lea_index(
            CURRENT_POSITION,
            BaseIndex(CURRENT_POSITION, TEMP1, self.factor(), 0));

        if self.global() {
            self.masm.store_imm(P32, (RSP, FrameData::SUCCESSFUL_CAPTURES), 0);
        }

        // Load newline if the index is at the start, the previous character
        // otherwise.
        self.masm.mem_op(Cmp, P64, (RSP, FrameData::START_INDEX), 0);
        self.masm.jump_if(NZ, true, load_char_start_regexp);
        self.masm.const_(P64, CURRENT_CHARACTER, i64::from(b'\n'));
        self.masm.const_jump(start_regexp);

        // A global regexp restarts matching here.
        self.masm.define(load_char_start_regexp);
        self.load_current_character_unchecked(-1, 1);
        self.masm.define(start_regexp);

        // Fill the saved registers with the sentinel (still in TEMP0), in
        // ascending address order to respect the page-touch discipline.
        if num_saved > 8 {
            self.masm.const_(P64, TEMP1, i64::from(FrameData::register_offset(0)));
            let init_loop = self.masm.label();
            self.masm.define(init_loop);
            self.masm.store_index(P64, BaseIndex(RSP, TEMP1, Times1, 0), TEMP0);
            self.masm.const_op(Add, P64, TEMP1, POINTER_SIZE);
            self.masm.const_op(Cmp, P64, TEMP1, FrameData::register_offset(num_saved));
            self.masm.jump_if(L, true, init_loop);
        } else {
            for i in 0..num_saved {
                self.masm.store(P64, (RSP, FrameData::register_offset(i)), TEMP0);
            }
        }

        // Initialize the backtrack stack pointer from the arena base.
        let base_address = self.runtime.regexp_stack().base_address();
        self.masm.const_(P64, BACKTRACK_STACK_POINTER, base_address as i64);
        self.masm.load(P64, BACKTRACK_STACK_POINTER, (BACKTRACK_STACK_POINTER, 0));
        self.masm.store(P64, (RSP, FrameData::BACKTRACK_STACK_BASE), BACKTRACK_STACK_POINTER);

        self.masm.const_jump(self.start_label);

        // Exit code.
        if self.masm.is_used(self.success_label) {
            self.masm.define(self.success_label);

            // Copy captures to the output. Registers on the frame are
            // pointer-wide, output slots are int32.
            {
                let output_registers = TEMP1;
                let input_byte_length = BACKTRACK_STACK_POINTER;

                self.masm.load(P64, output_registers, (RSP, FrameData::OUTPUT_REGISTERS));
                self.masm.load(P64, TEMP0, io_address);
                self.masm.load(P64, input_byte_length, (TEMP0, InputOutputData::INPUT_END));
                self.masm.load_op(Sub, P64, input_byte_length, (TEMP0, InputOutputData::INPUT_START));

                for i in 0..num_saved {
                    self.masm.load(P64, TEMP0, (RSP, FrameData::register_offset(i)));
                    if i == 0 && self.global_with_zero_length_check() {
                        // Keep the capture start for the zero-length check.
                        self.masm.move_(P64, CURRENT_CHARACTER, TEMP0);
                    }

                    // Convert to an index from the start of the string, in
                    // characters rather than bytes.
                    self.masm.op(Add, P64, TEMP0, input_byte_length);
                    if self.mode == Mode::Char16 {
                        self.masm.const_shift(Sar, P64, TEMP0, 1);
                    }

                    self.masm.store(P32, (output_registers, (i * size_of::<i32>()) as i32), TEMP0);
                }
            }

            if self.global() {
                // Restart matching: count the success, then check whether
                // the output buffer can take another capture set.
                self.masm.mem_op(Add, P32, (RSP, FrameData::SUCCESSFUL_CAPTURES), 1);
                self.masm.load(P32, TEMP0, (RSP, FrameData::NUM_OUTPUT_REGISTERS));
                self.masm.const_op(Sub, P32, TEMP0, num_saved as i32);
                self.masm.const_op(Cmp, P32, TEMP0, num_saved as i32);
                self.masm.jump_if(L, true, self.exit_label);
                self.masm.store(P32, (RSP, FrameData::NUM_OUTPUT_REGISTERS), TEMP0);

                // Advance the output past the stored capture set.
                self.masm.mem_op(
                    Add, P64, (RSP, FrameData::OUTPUT_REGISTERS),
                    (num_saved * size_of::<i32>()) as i32);

                // The restart path refills the registers from TEMP0.
                self.masm.load(P64, TEMP0, (RSP, FrameData::INPUT_START_MINUS_ONE));

                if self.global_with_zero_length_check() {
                    // The capture start is still in CURRENT_CHARACTER. A
                    // nonempty match restarts as-is; an empty one at the
                    // end of input exits, elsewhere it first advances one
                    // character.
                    self.masm.op(Cmp, P64, CURRENT_POSITION, CURRENT_CHARACTER);
                    self.masm.jump_if(NZ, true, load_char_start_regexp);
                    self.masm.test(P64, CURRENT_POSITION, CURRENT_POSITION);
                    self.masm.jump_if(Z, true, self.exit_label);
                    self.masm.const_op(Add, P64, CURRENT_POSITION, char_size);
                }

                self.masm.const_jump(load_char_start_regexp);
            } else {
                self.masm.const_(P64, TEMP0, RUN_STATUS_SUCCESS as i64);
            }
        }

        self.masm.define(self.exit_label);
        if self.global() {
            // The result is the number of successful capture sets.
            self.masm.load(P32, TEMP0, (RSP, FrameData::SUCCESSFUL_CAPTURES));
        }

        self.masm.define(return_temp0);
        self.masm.load(P64, TEMP1, io_address);
        self.masm.store(P64, (TEMP1, InputOutputData::RESULT), TEMP0);

        // Free the frame, including the InputOutputData* slot, and restore
        // the saved registers in reverse order.
        self.masm.const_op(Add, P64, RSP, (frame_size + size_of::<usize>()) as i32);
        for &reg in saved.iter().rev() {
            self.masm.pop(reg);
        }
        self.masm.ret();

        // Backtrack code: the shared target of failed checks.
        if self.masm.is_used(self.backtrack_label) {
            self.masm.define(self.backtrack_label);
            self.backtrack();
        }

        // Backtrack stack overflow code. Entered by a direct call; TEMP2
        // holds the frame stack pointer.
        if self.masm.is_used(self.stack_overflow_label) {
            self.masm.define(self.stack_overflow_label);

            self.masm.const_(P64, TEMP1, self.runtime as *const Runtime as i64);

            // Save the volatile registers around the C call; TEMP0 carries
            // the result out and TEMP1 only the argument in.
            let volatiles: Vec<Register> = self.abi.volatile_registers
                .iter()
                .copied()
                .filter(|&r| r != TEMP0 && r != TEMP1)
                .collect();
            for &r in &volatiles {
                self.masm.push(r);
            }

            self.masm.move_(P64, self.abi.arg_registers[0], TEMP1);
            self.masm.abi_call(grow_backtrack_stack as usize, R11, self.abi.shadow_space);

            for &r in volatiles.iter().rev() {
                self.masm.pop(r);
            }

            // On failure return zero to the caller, which raises the
            // exception; the stack must be adjusted by our own return.
            let return_from_overflow_handler = self.masm.label();
            self.masm.test(P32, TEMP0, TEMP0);
            self.masm.jump_if(Z, true, return_from_overflow_handler);

            // The arena moved: rebase the backtrack stack pointer from the
            // old base to the new one, and record the new base.
            self.masm.load_op(Sub, P64, BACKTRACK_STACK_POINTER, (TEMP2, FrameData::BACKTRACK_STACK_BASE));
            self.masm.const_(P64, TEMP1, base_address as i64);
            self.masm.load(P64, TEMP1, (TEMP1, 0));
            self.masm.store(P64, (TEMP2, FrameData::BACKTRACK_STACK_BASE), TEMP1);
            self.masm.op(Add, P64, BACKTRACK_STACK_POINTER, TEMP1);

            self.masm.define(return_from_overflow_handler);
            self.masm.ret();
        }

        if self.masm.is_used(self.exit_with_exception_label) {
            self.masm.define(self.exit_with_exception_label);
            self.masm.const_(P64, TEMP0, RUN_STATUS_ERROR as i64);
            self.masm.const_jump(return_temp0);
        }

        // Materialize the code and patch the recorded backtrack targets
        // with absolute addresses.
        let code_len = self.masm.buffer().len();
        let mut memory = Mmap::new(code_len)?;
        memory[..code_len].copy_from_slice(&self.masm.buffer()[..code_len]);

        let code_base = memory.as_ptr() as usize;
        for patch in &self.label_patches {
            let offset = self.masm.target(patch.label)
                .expect("push_backtrack to a label that was never bound");
            assert_eq!(memory.read(patch.patch_offset, 8), 0);
            memory.set_pos(patch.patch_offset);
            memory.write((code_base + offset) as u64, 8);
        }

        debug!(
            "generated regexp code: {} bytes, {} registers, {} backtrack patches",
            code_len, self.num_registers, self.label_patches.len());

        Ok(RegExpCode::new(memory))
    }
}

//-----------------------------------------------------------------------------

/**
 * Nonzero at the word characters `0-9`, `A-Z`, `_` and `a-z`; zero
 * everywhere else, including the whole upper half of the Latin-1 range.
 */
pub static WORD_CHARACTER_MAP: [u8; 256] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,

    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // '0' - '7'
    0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // '8' - '9'

    0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // 'A' - 'G'
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // 'H' - 'O'
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // 'P' - 'W'
    0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0xff, // 'X' - 'Z', '_'

    0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // 'a' - 'g'
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // 'h' - 'o'
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // 'p' - 'w'
    0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, // 'x' - 'z'

    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,

    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,

    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,

    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
