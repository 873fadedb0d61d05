//! The seam between a built program and a code generator.

use crate::error::BackendError;
use crate::program::Program;

/// A code generator that turns a [`Program`] into callable native
/// functions.
///
/// The backend borrows the program only for the duration of
/// [`Backend::translate`]; afterwards it owns nothing but its emitted code
/// and symbol table.
pub trait Backend {
    /// Lower the whole program.
    fn translate(&mut self, program: &Program) -> Result<(), BackendError>;

    /// Finalize the emitted artifact: make the code buffer executable, or
    /// run the external optimizer/linker.
    fn compile(&mut self) -> Result<(), BackendError>;

    /// Address of a compiled public function.
    ///
    /// Only meaningful after [`Backend::compile`] succeeded. Calling
    /// through the returned pointer is `unsafe`; the caller must transmute
    /// it to the matching `extern "C"` signature.
    fn entry(&self, name: &str) -> Option<*const u8>;
}
