//! Error taxonomy shared by the builder, the type manager and the backends.

use crate::opcode::Opcode;
use crate::types::TypeId;

/// Errors raised while constructing types or IR.
///
/// Every variant is a contract violation by the caller; once one is
/// returned the in-flight entity was left untouched, so the program is
/// never observable in a half-built state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KhirError {
    /// A named struct, opaque type or public function name was re-declared.
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// Lookup of a name that was never declared.
    #[error("unknown name: {0}")]
    UnknownName(String),

    /// `type_of` on an opcode with no per-instruction typing.
    #[error("no per-instruction type for {0:?}")]
    UntypedFragment(Opcode),

    /// Appending to a basic block that already ends in a terminator.
    #[error("basic block is terminated")]
    Terminated,

    /// Switching block focus away from a non-terminated block.
    #[error("current basic block is not terminated")]
    UnterminatedSwitch,

    /// The constant DAG has a cycle or a dangling reference.
    #[error("constant pool is not topologically emittable")]
    InvalidConstantDependency,

    /// Layout query on a type with no in-memory size (void, function,
    /// opaque).
    #[error("type {0:?} has no layout")]
    Unsized(TypeId),

    /// A pointer-offset path indexed into a non-aggregate type.
    #[error("cannot index into type {0:?}")]
    InvalidIndex(TypeId),
}

/// Errors raised while a backend lowers or finalizes a program.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The emitter rejected the program, or an external toolchain step
    /// exited non-zero.
    #[error("backend build failed: {0}")]
    BackendBuildFailed(String),

    /// Loading the optimizing backend's artifact failed.
    #[error("dynamic loader failed: {0}")]
    DynamicLoaderFailed(String),

    /// A malformed program reached the backend.
    #[error(transparent)]
    Khir(#[from] KhirError),
}
