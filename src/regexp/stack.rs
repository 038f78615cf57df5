use std::cell::{Cell, UnsafeCell};
use std::mem::{size_of};

/**
 * Spare entries between the overflow-check limit and the true end of the
 * arena, so that an op may push a bounded burst of entries after a single
 * limit check.
 */
pub const STACK_LIMIT_SLACK: usize = 32;

/** Initial arena size in bytes. */
const INITIAL_SIZE: usize = 1024;

/** The arena refuses to grow beyond this many bytes. */
const MAXIMUM_SIZE: usize = 64 * 1024 * 1024;

/**
 * The heap-allocated arena that generated code pushes backtrack state onto:
 * resume code addresses, saved positions and saved register values, one
 * pointer-sized entry each.
 *
 * The `base` and `limit` fields have stable addresses for the lifetime of
 * the stack; generated code reads them via absolute addresses, and
 * [`grow()`] rewrites them. Entries keep their offsets from `base` across a
 * grow, so code that saved an offset (rather than an absolute entry
 * address) is unaffected by relocation.
 *
 * [`grow()`]: BacktrackStack::grow
 */
#[repr(C)]
pub struct BacktrackStack {
    base: Cell<*mut u8>,
    limit: Cell<*mut u8>,
    memory: UnsafeCell<Vec<usize>>,
}

impl BacktrackStack {
    pub fn new() -> Self {
        let mut memory = vec![0usize; INITIAL_SIZE / size_of::<usize>()];
        let base = memory.as_mut_ptr() as *mut u8;
        let stack = BacktrackStack {
            base: Cell::new(base),
            limit: Cell::new(std::ptr::null_mut()),
            memory: UnsafeCell::new(memory),
        };
        stack.update_limit(INITIAL_SIZE);
        stack
    }

    fn update_limit(&self, size: usize) {
        let slack = STACK_LIMIT_SLACK * size_of::<usize>();
        self.limit.set(self.base.get().wrapping_add(size - slack));
    }

    /** The current base of the arena. */
    pub fn base(&self) -> *mut u8 {
        self.base.get()
    }

    /** The current size of the arena in bytes. */
    pub fn size(&self) -> usize {
        (unsafe {(*self.memory.get()).len()}) * size_of::<usize>()
    }

    /** The address of the `base` field itself, for baking into code. */
    pub fn base_address(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /** The address of the `limit` field itself, for baking into code. */
    pub fn limit_address(&self) -> usize {
        self.limit.as_ptr() as usize
    }

    /**
     * Doubles the arena, preserving every entry at its old offset from
     * `base`, and updates both `base` and `limit` before returning. Returns
     * `false`, changing nothing, if the arena is already at its maximum
     * size.
     */
    pub fn grow(&self) -> bool {
        let old = unsafe {&mut *self.memory.get()};
        let new_size = old.len() * size_of::<usize>() * 2;
        if new_size > MAXIMUM_SIZE {
            return false;
        }
        let mut memory = vec![0usize; new_size / size_of::<usize>()];
        memory[..old.len()].copy_from_slice(old);
        self.base.set(memory.as_mut_ptr() as *mut u8);
        *old = memory;
        self.update_limit(new_size);
        true
    }
}

impl Default for BacktrackStack {
    fn default() -> Self { BacktrackStack::new() }
}

/**
 * Grows `runtime`'s backtrack stack. Called from generated code by C ABI
 * when the stack pointer passes the limit; returns nonzero on success.
 *
 * # Safety
 *
 * `runtime` must point to the live [`Runtime`] the calling code was
 * generated against.
 */
pub unsafe extern "C" fn grow_backtrack_stack(runtime: *const Runtime) -> usize {
    (*runtime).regexp_stack().grow() as usize
}

//-----------------------------------------------------------------------------

/**
 * The per-thread state a compiled regexp runs against: the backtrack arena
 * and the native-stack guard. Generated code addresses fields of this
 * structure absolutely, so a `Runtime` must not move while any
 * [`RegExpCode`] generated against it is alive; the code's borrow enforces
 * this.
 *
 * [`RegExpCode`]: super::RegExpCode
 */
pub struct Runtime {
    regexp_stack: BacktrackStack,
    jit_stack_limit: Cell<usize>,
}

impl Runtime {
    pub fn new() -> Self {
        Runtime {
            regexp_stack: BacktrackStack::new(),
            jit_stack_limit: Cell::new(0),
        }
    }

    pub fn regexp_stack(&self) -> &BacktrackStack {
        &self.regexp_stack
    }

    /**
     * Sets the lowest native stack address generated code may run at.
     * The prologue refuses to run, with an error result, if the stack
     * pointer is at or below this. The default of 0 never refuses.
     */
    pub fn set_jit_stack_limit(&self, limit: usize) {
        self.jit_stack_limit.set(limit);
    }

    /** The address of the limit word itself, for baking into code. */
    pub fn jit_stack_limit_address(&self) -> usize {
        self.jit_stack_limit.as_ptr() as usize
    }
}

impl Default for Runtime {
    fn default() -> Self { Runtime::new() }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_slack() {
        let stack = BacktrackStack::new();
        let headroom = stack.limit.get() as usize - stack.base() as usize;
        assert_eq!(headroom, stack.size() - STACK_LIMIT_SLACK * size_of::<usize>());
    }

    #[test]
    fn grow_preserves_entries() {
        let stack = BacktrackStack::new();
        let old_size = stack.size();
        unsafe {
            let entries = stack.base() as *mut usize;
            entries.write(0xDEAD);
            entries.add(1).write(0xBEEF);
        }
        assert!(stack.grow());
        assert_eq!(stack.size(), old_size * 2);
        unsafe {
            let entries = stack.base() as *mut usize;
            assert_eq!(entries.read(), 0xDEAD);
            assert_eq!(entries.add(1).read(), 0xBEEF);
        }
    }

    #[test]
    fn grow_stops_at_maximum() {
        let stack = BacktrackStack::new();
        while stack.grow() {}
        assert_eq!(stack.size(), MAXIMUM_SIZE);
        assert!(!stack.grow());
        assert_eq!(stack.size(), MAXIMUM_SIZE);
    }
}
