//! Data model types

pub mod vm;

pub use vm::VmRecord;
