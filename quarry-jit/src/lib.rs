//! The in-process x86-64 (SysV) JIT backend of the Quarry query compiler.
//!
//! [`AsmBackend`] lowers a finished KHIR program to machine code in an
//! executable buffer, with a pluggable register-allocation strategy:
//! [`RegAllocStrategy::StackSpill`] for fastest compilation,
//! [`RegAllocStrategy::LinearScan`] for faster generated code.

#![deny(unused_must_use)]

pub mod backend;
pub mod buffer;
pub mod encoder;
pub mod regalloc;

pub use backend::AsmBackend;
pub use buffer::{CodeBuffer, ExecBuffer, Label};
pub use regalloc::RegAllocStrategy;
