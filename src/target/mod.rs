mod label;
pub use label::{Patch, Label, LabelTable};

pub mod x86_64;
