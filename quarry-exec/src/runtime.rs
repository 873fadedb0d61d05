//! The seam to the runtime libraries.
//!
//! The runtime owns its aggregates (hash tables, buffer vectors, tuple
//! index tables, column readers, the skinner-join executors) and exposes
//! them to generated code as opaque types plus C entry points. The
//! planner declares both here before translating any operator.

use quarry_khir::{FuncId, KhirError, ProgramBuilder, TypeId};

use crate::error::ExecError;
use crate::pipeline::PipelineId;

/// Handles to the forward-declared opaque runtime aggregates.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeTypes {
    pub hash_table: TypeId,
    pub vector: TypeId,
    pub tuple_idx_table: TypeId,
    pub column_data: TypeId,
    pub skinner_join_executor: TypeId,
}

/// Declares the runtime-owned opaque types on a fresh builder.
pub fn forward_declare(builder: &mut ProgramBuilder) -> Result<RuntimeTypes, KhirError> {
    Ok(RuntimeTypes {
        hash_table: builder.opaque_type("runtime.HashTable")?,
        vector: builder.opaque_type("runtime.Vector")?,
        tuple_idx_table: builder.opaque_type("runtime.TupleIdxTable")?,
        column_data: builder.opaque_type("runtime.ColumnData")?,
        skinner_join_executor: builder.opaque_type("runtime.SkinnerJoinExecutor")?,
    })
}

/// One runtime entry point to bind.
pub struct ExternalFn<'a> {
    pub name: &'a str,
    pub result: TypeId,
    pub args: &'a [TypeId],
    pub addr: *const u8,
}

/// Binds a batch of runtime entry points on the builder.
pub fn declare_external_functions(
    builder: &mut ProgramBuilder,
    fns: &[ExternalFn<'_>],
) -> Result<Vec<FuncId>, KhirError> {
    fns.iter()
        .map(|f| builder.declare_external_function(f.name, f.result, f.args, f.addr))
        .collect()
}

/// The object the recompiling skinner-join executor calls back into when
/// adaptive reordering needs the join body re-lowered under a new table
/// order rather than flag-toggled.
pub trait RecompilingJoinTranslator {
    /// Compiles (or fetches from the cache) the join body for `order` and
    /// returns its entry pointer.
    fn compile_join_order(&mut self, order: &[PipelineId]) -> Result<*const u8, ExecError>;
}
