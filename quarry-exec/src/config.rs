//! Process-wide configuration, supplied by the host as a plain value.

use strum::{Display, EnumString};

/// Which backend compiles a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum BackendKind {
    /// The in-process x86-64 assembler.
    Asm,
    /// The optimizing textual-IR path.
    Llvm,
}

/// Which register allocator the assembler backend uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RegAllocKind {
    StackSpill,
    LinearScan,
}

impl From<RegAllocKind> for quarry_jit::RegAllocStrategy {
    fn from(kind: RegAllocKind) -> Self {
        match kind {
            RegAllocKind::StackSpill => quarry_jit::RegAllocStrategy::StackSpill,
            RegAllocKind::LinearScan => quarry_jit::RegAllocStrategy::LinearScan,
        }
    }
}

/// Whether split pipelines may switch to the optimized backend mid-query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PipelineMode {
    Static,
    Adaptive,
}

/// Tunables of the adaptive switchover model. The defaults are measured,
/// not platform-invariant.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveParams {
    /// Assumed speedup of the optimized backend's code.
    pub speedup: f64,
    /// Assumed one-off switchover cost, in milliseconds.
    pub switch_overhead_ms: f64,
    /// Morsels to time on the fast backend before deciding.
    pub probe_morsels: u32,
    /// Rows per morsel.
    pub chunk_size: i32,
}

impl Default for AdaptiveParams {
    fn default() -> Self {
        Self {
            speedup: 1.2,
            switch_overhead_ms: 10.0,
            probe_morsels: 2,
            chunk_size: 8192,
        }
    }
}

/// Everything the driver needs to know, read once per program compile.
#[derive(Debug, Clone, Copy)]
pub struct ExecConfig {
    pub backend: BackendKind,
    pub reg_alloc: RegAllocKind,
    pub mode: PipelineMode,
    pub adaptive: AdaptiveParams,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Asm,
            reg_alloc: RegAllocKind::StackSpill,
            mode: PipelineMode::Static,
            adaptive: AdaptiveParams::default(),
        }
    }
}
