pub mod buffer;

pub mod target;

pub mod regexp;
