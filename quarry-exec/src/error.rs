//! Driver-level errors.

use quarry_khir::BackendError;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The topological order ended in a pipeline that still has
    /// successors; the graph is structurally broken.
    #[error("output pipeline has a successor")]
    OutputPipelineHasSuccessor,

    /// A pipeline symbol the driver needs was not compiled.
    #[error("missing entry point: {0}")]
    MissingEntry(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}
