use std::ops::{Deref, DerefMut};
use memmap::{MmapMut};
use super::{Buffer};

/**
 * A block of memory claimed from the operating system using `mmap()`,
 * with a fixed size chosen at allocation. Memory allocated in this way
 * can be made executable.
 *
 * The address of the block never changes: protection changes are done in
 * place, so absolute addresses written into the block stay valid while it
 * is executing.
 */
pub enum Mmap {
    Mut(MmapMut, usize),
    Poisoned,
}

impl Mmap {
    /** Allocates a writeable block of at least `size` bytes. */
    pub fn new(size: usize) -> std::io::Result<Self> {
        let memory = MmapMut::map_anon(size.max(1))?;
        Ok(Self::Mut(memory, 0))
    }

    /**
     * Make this [`Mmap`] executable, pass it to `callback`, then make it
     * writeable again.
     *
     * If the protection change fails you get an [`Err`] and the [`Mmap`] is
     * gone. `T` can itself be a `Result` if necessary to represent errors
     * returned by `callback`.
     */
    pub fn execute<T>(&mut self, callback: impl FnOnce(&[u8]) -> T) -> std::io::Result<T> {
        let mut new_self = Self::Poisoned;
        std::mem::swap(self, &mut new_self);
        match new_self {
            Self::Mut(memory, pos) => {
                let executable_memory = memory.make_exec()?;
                let result = callback(&executable_memory);
                let memory = executable_memory.make_mut()?;
                *self = Self::Mut(memory, pos);
                Ok(result)
            },
            Self::Poisoned => panic!("Poisoned by an earlier error"),
        }
    }
}

impl Deref for Mmap {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Mut(ref m, _) => &*m,
            Self::Poisoned => panic!("Poisoned by an earlier error"),
        }
    }
}

impl DerefMut for Mmap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::Mut(ref mut m, _) => &mut *m,
            Self::Poisoned => panic!("Poisoned by an earlier error"),
        }
    }
}

impl Buffer for Mmap {
    fn get_pos(&self) -> usize {
        match self {
            Self::Mut(_, pos) => *pos,
            Self::Poisoned => panic!("Poisoned by an earlier error"),
        }
    }

    fn set_pos(&mut self, new_pos: usize) {
        match self {
            Self::Mut(_, ref mut pos) => *pos = new_pos,
            Self::Poisoned => panic!("Poisoned by an earlier error"),
        }
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn api() {
        let buffer = Mmap::new(0x1000).expect("Couldn't allocate");
        super::super::tests::api(buffer)
    }

    #[test]
    fn execute() {
        let mut buffer = Mmap::new(0x1000).expect("Couldn't allocate");
        let result = buffer.execute(|_bytes| 42).expect("Couldn't change permissions");
        assert_eq!(result, 42);
    }
}
