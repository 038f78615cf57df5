mod assembler;
pub use assembler::{
    Assembler, Register, Precision, BinaryOp, ShiftOp, Condition, Width,
    Scale, BaseIndex, UNKNOWN_DISP,
};
use Register::*;

/** The required alignment of the stack pointer at a C-ABI call. */
pub const STACK_ALIGNMENT: usize = 16;

/**
 * In the System V amd64 calling convention, these registers must be
 * preserved by subroutines, as must `RSP`.
 */
pub const CALLEE_SAVES: [Register; 6] = [RB, RBP, R12, R13, R14, R15];

/**
 * In the System V amd64 calling convention, these registers may be
 * corrupted by subroutines.
 */
pub const CALLER_SAVES: [Register; 9] = [RDI, RSI, RD, RC, R8, R9, R10, R11, RA];

/** As [`CALLEE_SAVES`], for the Windows x64 convention. */
pub const CALLEE_SAVES_WIN64: [Register; 8] = [RB, RBP, RSI, RDI, R12, R13, R14, R15];

/** As [`CALLER_SAVES`], for the Windows x64 convention. */
pub const CALLER_SAVES_WIN64: [Register; 7] = [RC, RD, R8, R9, R10, R11, RA];

/**
 * The platform-dependent properties of the C calling convention and stack
 * discipline that code generators consult. Generators branch on these
 * capability flags rather than on `cfg!` directly.
 */
pub struct Abi {
    /** The registers in which the first integer arguments arrive. */
    pub arg_registers: [Register; 3],
    /** Registers a C callee may corrupt. */
    pub volatile_registers: &'static [Register],
    /** Registers a C callee must preserve. */
    pub callee_saved_registers: &'static [Register],
    /**
     * Whether a freshly reserved stack frame must be written to page by
     * page, in descending address order, before arbitrary use.
     */
    pub touch_frame_pages: bool,
    /** The page granularity for `touch_frame_pages`. */
    pub page_size: usize,
    /** Bytes of spill space a C callee expects above its return address. */
    pub shadow_space: usize,
}

/** The [`Abi`] of the host operating system. */
pub fn host_abi() -> Abi {
    if cfg!(windows) {
        Abi {
            arg_registers: [RC, RD, R8],
            volatile_registers: &CALLER_SAVES_WIN64,
            callee_saved_registers: &CALLEE_SAVES_WIN64,
            touch_frame_pages: true,
            page_size: 4096,
            shadow_space: 32,
        }
    } else {
        Abi {
            arg_registers: [RDI, RSI, RD],
            volatile_registers: &CALLER_SAVES,
            callee_saved_registers: &CALLEE_SAVES,
            touch_frame_pages: false,
            page_size: 4096,
            shadow_space: 0,
        }
    }
}
