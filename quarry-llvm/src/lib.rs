//! The optimizing backend of the Quarry query compiler.
//!
//! Mirrors the JIT backend's interface but emits a textual LLVM module,
//! runs a fixed optimization pipeline through the host `opt`/`llc`
//! toolchain, links a shared library with the system C compiler and
//! resolves entry points through the dynamic loader. Much slower to
//! compile than the assembler path, much faster to execute; the adaptive
//! policy decides which one a pipeline gets.

#![deny(unused_must_use)]

mod emit;
pub mod toolchain;

use quarry_khir::{Backend, BackendError, Program};
use tracing::debug;

pub use toolchain::available;

/// The textual-IR optimizing backend.
#[derive(Default)]
pub struct LlvmBackend {
    module_text: Option<String>,
    /// Keeps the artifact directory alive while the library is mapped.
    _scratch: Option<tempfile::TempDir>,
    library: Option<libloading::Library>,
}

impl LlvmBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The emitted module, for diagnostics.
    pub fn module_text(&self) -> Option<&str> {
        self.module_text.as_deref()
    }
}

impl Backend for LlvmBackend {
    fn translate(&mut self, program: &Program) -> Result<(), BackendError> {
        let text = emit::emit_module(program)?;
        debug!(bytes = text.len(), "llvm module emitted");
        self.module_text = Some(text);
        Ok(())
    }

    fn compile(&mut self) -> Result<(), BackendError> {
        let text = self
            .module_text
            .as_ref()
            .ok_or_else(|| BackendError::BackendBuildFailed("nothing translated".into()))?;
        let scratch = tempfile::tempdir()
            .map_err(|e| BackendError::BackendBuildFailed(format!("scratch dir: {e}")))?;
        let dylib = toolchain::build_dylib(scratch.path(), text)?;

        // SAFETY: the library was produced by the toolchain above; its
        // initialisers are the C runtime's only.
        let library = unsafe { libloading::Library::new(&dylib) }
            .map_err(|e| BackendError::DynamicLoaderFailed(e.to_string()))?;
        debug!(path = %dylib.display(), "optimized module loaded");

        self._scratch = Some(scratch);
        self.library = Some(library);
        Ok(())
    }

    fn entry(&self, name: &str) -> Option<*const u8> {
        let library = self.library.as_ref()?;
        // SAFETY: the pointer is only transmuted to the signature the
        // planner declared for this symbol. The address stays valid as
        // long as `self` keeps the library mapped.
        let f = unsafe {
            let symbol: libloading::Symbol<'_, unsafe extern "C" fn()> =
                library.get(name.as_bytes()).ok()?;
            *symbol
        };
        Some(f as *const u8)
    }
}
