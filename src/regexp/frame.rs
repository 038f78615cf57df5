use std::mem::{offset_of, size_of};

/**
 * The stack frame the generated prologue builds, addressed from the stack
 * pointer. The regex register file (pointer-sized slots) follows
 * immediately after this structure; see [`register_offset()`].
 *
 * The field order is ABI between the emitter and generated code.
 *
 * [`register_offset()`]: FrameData::register_offset
 */
#[repr(C)]
pub struct FrameData {
    /** Copy of `InputOutputData::input_start`. */
    pub input_start: *const u8,
    /** Copy of `InputOutputData::start_index`. */
    pub start_index: usize,
    /** Where the next set of captures is written (int32 slots). */
    pub output_registers: *mut i32,
    /** Remaining capacity of `output_registers`, in int32 slots. */
    pub num_output_registers: i32,
    /** The "unset capture" sentinel: one character before the input. */
    pub input_start_minus_one: *const u8,
    /** The arena base at the last point the running code observed it. */
    pub backtrack_stack_base: *const u8,
    /** Successful capture sets stored so far; meaningful only if global. */
    pub successful_captures: i32,
}

impl FrameData {
    pub const INPUT_START: i32 = offset_of!(FrameData, input_start) as i32;
    pub const START_INDEX: i32 = offset_of!(FrameData, start_index) as i32;
    pub const OUTPUT_REGISTERS: i32 = offset_of!(FrameData, output_registers) as i32;
    pub const NUM_OUTPUT_REGISTERS: i32 = offset_of!(FrameData, num_output_registers) as i32;
    pub const INPUT_START_MINUS_ONE: i32 = offset_of!(FrameData, input_start_minus_one) as i32;
    pub const BACKTRACK_STACK_BASE: i32 = offset_of!(FrameData, backtrack_stack_base) as i32;
    pub const SUCCESSFUL_CAPTURES: i32 = offset_of!(FrameData, successful_captures) as i32;

    /** The offset from the stack pointer of regex register `index`. */
    pub fn register_offset(index: usize) -> i32 {
        (size_of::<FrameData>() + index * size_of::<usize>()) as i32
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_file_is_aligned() {
        // Register slots are pointer-sized; the frame must not skew them.
        assert_eq!(size_of::<FrameData>() % size_of::<usize>(), 0);
        assert_eq!(FrameData::register_offset(0), size_of::<FrameData>() as i32);
        assert_eq!(
            FrameData::register_offset(3) - FrameData::register_offset(2),
            size_of::<usize>() as i32,
        );
    }
}
