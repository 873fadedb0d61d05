//! Execution layer of the Quarry query compiler: pipeline scheduling,
//! the adaptive static-vs-optimized dispatch policy, and the join-order
//! compilation cache.
//!
//! The driver is single-threaded and cooperative: pipelines run
//! sequentially in topological order, and the only background activity is
//! the optimizing backend building while the JIT executes.

#![deny(unused_must_use)]

pub mod cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod pipeline;
pub mod runtime;

pub use cache::{CacheEntry, CompilationCache};
pub use config::{AdaptiveParams, BackendKind, ExecConfig, PipelineMode, RegAllocKind};
pub use driver::ExecutableQuery;
pub use error::ExecError;
pub use pipeline::{Pipeline, PipelineBuilder, PipelineId};
pub use runtime::{forward_declare, RecompilingJoinTranslator, RuntimeTypes};
