//! The regexp code generator: data structures shared between the host and
//! generated code, the backtrack stack, and the macro assembler itself.

use std::marker::{PhantomData};
use std::mem::{offset_of};

use thiserror::Error;

use super::buffer::{Mmap};

pub mod stack;
pub use stack::{BacktrackStack, Runtime, grow_backtrack_stack};

pub mod frame;

mod macro_assembler;
pub use macro_assembler::{MacroAssembler, WORD_CHARACTER_MAP, TABLE_SIZE};


//-----------------------------------------------------------------------------

/**
 * The character width the generated code reads. `Char16` reads 16-bit
 * units; the `Ascii` (Latin-1) paths of the emitter are deliberately
 * unimplemented and panic if reached.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    Ascii,
    Char16,
}

/**
 * Whether the regexp restarts matching after each success, and if so
 * whether the restart logic must cope with zero-length matches. A regexp
 * that cannot match the empty string can skip the zero-length check.
 */
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GlobalMode {
    NotGlobal,
    Global,
    GlobalNoZeroLengthCheck,
}

/** Written to [`InputOutputData::result`] by generated code. */
pub const RUN_STATUS_ERROR: isize = -1;
/** As [`RUN_STATUS_ERROR`]: the regexp did not match. */
pub const RUN_STATUS_SUCCESS_NOT_FOUND: isize = 0;
/** As [`RUN_STATUS_ERROR`]: the regexp matched; captures are filled in. */
pub const RUN_STATUS_SUCCESS: isize = 1;

//-----------------------------------------------------------------------------

/** One capture: character indices, or `-1`/`-1` if the group is unset. */
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MatchPair {
    pub start: i32,
    pub limit: i32,
}

/**
 * Where generated code writes captures: a caller-owned array of
 * [`MatchPair`]s. The field offsets are read by the generated prologue and
 * must not change.
 */
#[repr(C)]
pub struct MatchPairs {
    pub pair_count: u32,
    pub pairs: *mut MatchPair,
}

impl MatchPairs {
    /**
     * Wraps `pairs` for passing to generated code. The slice must outlive
     * every use of the returned value; it is written through the raw
     * pointer kept here.
     */
    pub fn new(pairs: &mut [MatchPair]) -> Self {
        MatchPairs {
            pair_count: u32::try_from(pairs.len()).expect("too many pairs"),
            pairs: pairs.as_mut_ptr(),
        }
    }

    pub const PAIR_COUNT: i32 = offset_of!(MatchPairs, pair_count) as i32;
    pub const PAIRS: i32 = offset_of!(MatchPairs, pairs) as i32;
}

/**
 * The argument block of generated code. The caller fills in the input
 * bounds, the start index and the capture buffer; the generated routine
 * writes `result`.
 */
#[repr(C)]
pub struct InputOutputData {
    pub input_start: *const u8,
    pub input_end: *const u8,
    pub start_index: usize,
    pub matches: *mut MatchPairs,
    pub result: isize,
}

impl InputOutputData {
    /** Describes a match of 16-bit `input` starting at `start_index`. */
    pub fn new(input: &[u16], start_index: usize, matches: &mut MatchPairs) -> Self {
        assert!(start_index <= input.len());
        let range = input.as_ptr_range();
        InputOutputData {
            input_start: range.start as *const u8,
            input_end: range.end as *const u8,
            start_index,
            matches,
            result: RUN_STATUS_SUCCESS_NOT_FOUND,
        }
    }

    pub const INPUT_START: i32 = offset_of!(InputOutputData, input_start) as i32;
    pub const INPUT_END: i32 = offset_of!(InputOutputData, input_end) as i32;
    pub const START_INDEX: i32 = offset_of!(InputOutputData, start_index) as i32;
    pub const MATCHES: i32 = offset_of!(InputOutputData, matches) as i32;
    pub const RESULT: i32 = offset_of!(InputOutputData, result) as i32;
}

//-----------------------------------------------------------------------------

/** [`MacroAssembler::generate_code`] failed to produce executable code. */
#[derive(Debug, Error)]
pub enum CodeError {
    #[error("could not allocate executable code: {0}")]
    Jit(#[from] std::io::Error),
}

/**
 * An executable compiled regexp. The code holds baked absolute addresses
 * into the [`Runtime`] it was generated against, hence the borrow.
 */
pub struct RegExpCode<'rt> {
    memory: Mmap,
    runtime: PhantomData<&'rt Runtime>,
}

impl<'rt> RegExpCode<'rt> {
    pub(crate) fn new(memory: Mmap) -> Self {
        RegExpCode {memory, runtime: PhantomData}
    }

    /**
     * Runs the compiled regexp over the input described by `io`, writing
     * captures and `io.result`.
     *
     * # Safety
     *
     * The pointers inside `io` must be valid for the duration of the call,
     * and nothing else may be using the [`Runtime`] this code was generated
     * against (the generated code pushes to its backtrack arena and may
     * grow it).
     */
    pub unsafe fn execute(&mut self, io: &mut InputOutputData) -> std::io::Result<()> {
        let io = io as *mut InputOutputData;
        self.memory.execute(|bytes| {
            let f: extern "C" fn(*mut InputOutputData) =
                unsafe {std::mem::transmute(&bytes[0])};
            f(io)
        })
    }
}

//-----------------------------------------------------------------------------

/**
 * Compares two 16-bit strings of `byte_length` bytes for equality under
 * simple case folding. Returns 1 if they are equal, 0 if not. Called from
 * generated code by C ABI on behalf of case-insensitive back-references.
 *
 * # Safety
 *
 * `a` and `b` must point to `byte_length / 2` readable 16-bit units.
 */
pub unsafe extern "C" fn case_insensitive_compare_strings(
    a: *const u16,
    b: *const u16,
    byte_length: usize,
) -> usize {
    fn fold(unit: u16) -> u32 {
        match char::from_u32(u32::from(unit)) {
            Some(c) => {
                let mut lower = c.to_lowercase();
                match (lower.next(), lower.next()) {
                    (Some(l), None) => l as u32,
                    _ => c as u32,
                }
            }
            None => u32::from(unit), // unpaired surrogate half
        }
    }

    let length = byte_length / std::mem::size_of::<u16>();
    let a = std::slice::from_raw_parts(a, length);
    let b = std::slice::from_raw_parts(b, length);
    let equal = a.iter().zip(b).all(|(&x, &y)| x == y || fold(x) == fold(y));
    equal as usize
}
