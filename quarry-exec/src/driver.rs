//! The pipeline execution driver.
//!
//! Pipelines run sequentially in topological order. A split pipeline's
//! input is consumed in fixed-width morsels; in adaptive mode the first
//! few morsels run on the fast assembler backend under a timer, and the
//! remainder switches to the optimizing backend when the measured model
//! says the one-off cost pays for itself.

use std::time::Instant;

use tracing::debug;

use quarry_jit::AsmBackend;
use quarry_khir::{Backend, BackendError, Program};
use quarry_llvm::LlvmBackend;

use crate::config::{BackendKind, ExecConfig, PipelineMode};
use crate::error::ExecError;
use crate::pipeline::{Pipeline, PipelineId};

type InitFn = unsafe extern "C" fn();
type ResetFn = unsafe extern "C" fn();
type BodyFn = unsafe extern "C" fn();
type SplitBodyFn = unsafe extern "C" fn(i32, i32);
type SizeFn = unsafe extern "C" fn() -> i32;

/// A fully-built program plus its pipeline graph, ready to execute.
pub struct ExecutableQuery<'p> {
    program: &'p Program,
    pipelines: Vec<Pipeline>,
    config: ExecConfig,
}

/// The optimizing backend, either still building on its thread or ready.
enum OptimizedBuild<'scope> {
    Pending(std::thread::ScopedJoinHandle<'scope, Result<LlvmBackend, BackendError>>),
    Ready(LlvmBackend),
}

impl<'p> ExecutableQuery<'p> {
    pub fn new(program: &'p Program, pipelines: Vec<Pipeline>, config: ExecConfig) -> Self {
        Self { program, pipelines, config }
    }

    pub fn execute(&self) -> Result<(), ExecError> {
        match self.config.mode {
            PipelineMode::Static => {
                let backend = self.build_static_backend()?;
                self.run(backend.as_ref(), &mut None)
            }
            PipelineMode::Adaptive => {
                // The JIT compiles eagerly; the optimizing backend starts
                // building in the background for the same program.
                let mut jit = AsmBackend::new(self.config.reg_alloc.into());
                jit.translate(self.program)?;
                jit.compile()?;
                std::thread::scope(|scope| {
                    let program = self.program;
                    let handle = scope.spawn(move || {
                        let mut opt = LlvmBackend::new();
                        opt.translate(program)?;
                        opt.compile()?;
                        Ok::<_, BackendError>(opt)
                    });
                    self.run(&jit, &mut Some(OptimizedBuild::Pending(handle)))
                })
            }
        }
    }

    fn build_static_backend(&self) -> Result<Box<dyn Backend>, ExecError> {
        let mut backend: Box<dyn Backend> = match self.config.backend {
            BackendKind::Asm => Box::new(AsmBackend::new(self.config.reg_alloc.into())),
            BackendKind::Llvm => Box::new(LlvmBackend::new()),
        };
        backend.translate(self.program)?;
        backend.compile()?;
        Ok(backend)
    }

    fn run(
        &self,
        backend: &dyn Backend,
        optimized: &mut Option<OptimizedBuild<'_>>,
    ) -> Result<(), ExecError> {
        let order = topological_order(&self.pipelines);
        let mut users = vec![0usize; self.pipelines.len()];

        for &id in &order {
            let pipeline = &self.pipelines[id];
            unsafe { self.entry::<InitFn>(backend, &pipeline.init_name())?() };

            if pipeline.split() {
                self.run_split(backend, optimized, id)?;
            } else {
                unsafe { self.entry::<BodyFn>(backend, &pipeline.body_name())?() };
            }

            for &pred in pipeline.predecessors() {
                users[pred] += 1;
                if users[pred] == self.pipelines[pred].successors().len() {
                    unsafe {
                        self.entry::<ResetFn>(backend, &self.pipelines[pred].reset_name())?()
                    };
                }
            }
        }

        if let Some(&last) = order.last() {
            if !self.pipelines[last].successors().is_empty() {
                return Err(ExecError::OutputPipelineHasSuccessor);
            }
            unsafe {
                self.entry::<ResetFn>(backend, &self.pipelines[last].reset_name())?()
            };
        }
        Ok(())
    }

    fn run_split(
        &self,
        backend: &dyn Backend,
        optimized: &mut Option<OptimizedBuild<'_>>,
        id: PipelineId,
    ) -> Result<(), ExecError> {
        let pipeline = &self.pipelines[id];
        let input_size = match pipeline.driver() {
            Some(driver) => unsafe {
                self.entry::<SizeFn>(backend, &self.pipelines[driver].size_name())?()
            },
            None => 0,
        };
        let body = self.entry::<SplitBodyFn>(backend, &pipeline.body_name())?;
        let params = self.config.adaptive;
        let chunk = params.chunk_size;
        let mut next_tuple = 0i32;

        if optimized.is_some() {
            // Probe: time the first morsels on the fast backend.
            let mut probed = 0u32;
            let mut total_ms = 0.0f64;
            while next_tuple < input_size && probed < params.probe_morsels {
                let start = next_tuple;
                let end = (next_tuple + chunk - 1).min(input_size - 1);
                next_tuple = end + 1;
                let at = Instant::now();
                unsafe { body(start, end) };
                total_ms += at.elapsed().as_secs_f64() * 1e3;
                probed += 1;
            }

            if next_tuple < input_size {
                let per_morsel = total_ms / f64::from(params.probe_morsels);
                let opt_per_morsel = per_morsel / params.speedup;
                let morsels_left = f64::from((input_size - next_tuple) / chunk);
                let stay = per_morsel * morsels_left;
                let switch = opt_per_morsel * morsels_left + params.switch_overhead_ms;

                let mut exec = body;
                if switch < stay {
                    debug!(
                        pipeline = id,
                        stay_ms = stay,
                        switch_ms = switch,
                        "switching to the optimized backend"
                    );
                    exec = optimized_entry(optimized, &pipeline.body_name())?;
                }

                while next_tuple < input_size {
                    let start = next_tuple;
                    let end = (next_tuple + chunk - 1).min(input_size - 1);
                    unsafe { exec(start, end) };
                    next_tuple = end + 1;
                }
            }
        } else {
            while next_tuple < input_size {
                let start = next_tuple;
                let end = (next_tuple + chunk - 1).min(input_size - 1);
                unsafe { body(start, end) };
                next_tuple = end + 1;
            }
        }
        Ok(())
    }

    /// Resolves and transmutes one pipeline symbol.
    fn entry<F: Copy>(&self, backend: &dyn Backend, name: &str) -> Result<F, ExecError> {
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*const u8>());
        let ptr = backend
            .entry(name)
            .ok_or_else(|| ExecError::MissingEntry(name.to_owned()))?;
        // SAFETY: F is one of the pipeline function-pointer types and the
        // symbol was compiled from a function of that shape.
        Ok(unsafe { *std::ptr::addr_of!(ptr).cast::<F>() })
    }
}

/// Waits for the optimizing backend if needed and resolves a body symbol.
fn optimized_entry(
    slot: &mut Option<OptimizedBuild<'_>>,
    name: &str,
) -> Result<SplitBodyFn, ExecError> {
    let built = match slot.take() {
        Some(OptimizedBuild::Pending(handle)) => handle.join().map_err(|_| {
            ExecError::Backend(BackendError::BackendBuildFailed(
                "optimizing backend thread panicked".into(),
            ))
        })??,
        Some(OptimizedBuild::Ready(backend)) => backend,
        None => unreachable!("optimized entry requested outside adaptive mode"),
    };
    let ptr = built
        .entry(name)
        .ok_or_else(|| ExecError::MissingEntry(name.to_owned()))?;
    *slot = Some(OptimizedBuild::Ready(built));
    // SAFETY: split bodies are compiled as `void(i32, i32)`.
    Ok(unsafe { std::mem::transmute::<*const u8, SplitBodyFn>(ptr) })
}

/// Every pipeline before its successors.
fn topological_order(pipelines: &[Pipeline]) -> Vec<PipelineId> {
    fn visit(
        current: PipelineId,
        pipelines: &[Pipeline],
        visited: &mut [bool],
        order: &mut Vec<PipelineId>,
    ) {
        visited[current] = true;
        for &next in pipelines[current].successors() {
            if !visited[next] {
                visit(next, pipelines, visited, order);
            }
        }
        order.push(current);
    }

    let mut visited = vec![false; pipelines.len()];
    let mut order = Vec::with_capacity(pipelines.len());
    for id in 0..pipelines.len() {
        if !visited[id] {
            visit(id, pipelines, &mut visited, &mut order);
        }
    }
    order.reverse();
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineBuilder;

    #[test]
    fn topological_order_respects_edges() {
        let mut b = PipelineBuilder::new();
        let a = b.create_pipeline();
        let c = b.create_pipeline();
        let d = b.create_pipeline();
        let e = b.create_pipeline();
        b.add_predecessor(c, a);
        b.add_predecessor(d, a);
        b.add_predecessor(e, c);
        b.add_predecessor(e, d);
        let pipelines = b.finish();

        let order = topological_order(&pipelines);
        let pos = |x: PipelineId| order.iter().position(|&y| y == x).unwrap();
        assert!(pos(a) < pos(c));
        assert!(pos(a) < pos(d));
        assert!(pos(c) < pos(e));
        assert!(pos(d) < pos(e));
        assert_eq!(order.len(), 4);
    }
}
