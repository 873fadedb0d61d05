//! KHIR: the packed 64-bit SSA intermediate representation of the Quarry
//! query compiler.
//!
//! A planner drives the [`builder::ProgramBuilder`] to produce a
//! [`program::Program`]: interned types, a constant pool, and per-function
//! instruction streams with explicit basic-block structure. Backends
//! implementing [`backend::Backend`] lower the finished program to
//! callable native code.

#![deny(unused_must_use)]

pub mod backend;
pub mod builder;
pub mod error;
pub mod instruction;
pub mod opcode;
pub mod printer;
pub mod program;
pub mod types;
pub mod value;

pub use backend::Backend;
pub use builder::ProgramBuilder;
pub use error::{BackendError, KhirError};
pub use opcode::{CompType, InstrFormat, Opcode};
pub use program::{ArrayConstant, Function, Global, Program, StructConstant};
pub use types::{Layout, TypeId, TypeKind, TypeManager};
pub use value::{BlockId, FuncId, Value};
