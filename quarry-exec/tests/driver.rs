//! Driver scenarios: a three-pipeline DAG executed end-to-end through the
//! JIT, with every `init`/`body`/`reset` call recorded by a runtime stub.

#![cfg(all(target_arch = "x86_64", unix))]

use std::sync::Mutex;

use quarry_exec::{ExecConfig, ExecutableQuery, PipelineBuilder, PipelineMode};
use quarry_khir::{FuncId, Program, ProgramBuilder, Value};

const INIT: i64 = 0;
const BODY: i64 = 1;
const RESET: i64 = 2;

static EVENTS: Mutex<Vec<(i64, i64, i64)>> = Mutex::new(Vec::new());
// run the recording tests one at a time
static SERIAL: Mutex<()> = Mutex::new(());

extern "C" fn record(kind: i64, pipeline: i64, payload: i64) {
    EVENTS.lock().unwrap().push((kind, pipeline, payload));
}

struct QueryScaffold {
    builder: ProgramBuilder,
    record: FuncId,
}

impl QueryScaffold {
    fn new() -> Self {
        let mut builder = ProgramBuilder::new();
        let i64t = builder.i64_type();
        let void = builder.void_type();
        let record_addr = record as extern "C" fn(i64, i64, i64) as *const u8;
        let record = builder
            .declare_external_function("record", void, &[i64t, i64t, i64t], record_addr)
            .unwrap();
        Self { builder, record }
    }

    /// A `fn()` that records `(kind, pipeline, 0)`.
    fn notifier(&mut self, name: &str, kind: i64, pipeline: i64) {
        let void = self.builder.void_type();
        self.builder.create_public_function(void, &[], name).unwrap();
        let kind = self.builder.const_i64(kind);
        let pipeline = self.builder.const_i64(pipeline);
        let zero = self.builder.const_i64(0);
        self.builder.call(self.record, &[kind, pipeline, zero]).unwrap();
        self.builder.ret().unwrap();
    }

    /// A `fn() -> i32` returning a constant.
    fn size_fn(&mut self, name: &str, size: i32) {
        let i32t = self.builder.i32_type();
        self.builder.create_public_function(i32t, &[], name).unwrap();
        let size = self.builder.const_i32(size);
        self.builder.ret_value(size).unwrap();
    }

    /// A `fn(i32, i32)` recording `(BODY, pipeline, start * 10000 + end)`.
    fn split_body(&mut self, name: &str, pipeline: i64) {
        let (void, i32t) = (self.builder.void_type(), self.builder.i32_type());
        self.builder
            .create_public_function(void, &[i32t, i32t], name)
            .unwrap();
        let f = self.builder.get_function(name).unwrap();
        let args: Vec<Value> = self.builder.function_arguments(f).to_vec();
        let start = self.builder.zext_i32_i64(args[0]).unwrap();
        let end = self.builder.zext_i32_i64(args[1]).unwrap();
        let scale = self.builder.const_i64(10_000);
        let scaled = self.builder.mul_i64(start, scale).unwrap();
        let payload = self.builder.add_i64(scaled, end).unwrap();
        let kind = self.builder.const_i64(BODY);
        let pipeline = self.builder.const_i64(pipeline);
        self.builder.call(self.record, &[kind, pipeline, payload]).unwrap();
        self.builder.ret().unwrap();
    }

    fn finish(self) -> Program {
        self.builder.finish()
    }
}

/// Pipeline 0 feeds split pipeline 1 (as its driver), which feeds sink
/// pipeline 2.
fn three_stage_query() -> (Program, Vec<quarry_exec::Pipeline>) {
    let mut scaffold = QueryScaffold::new();
    scaffold.notifier("init_0", INIT, 0);
    scaffold.notifier("body_0", BODY, 0);
    scaffold.notifier("reset_0", RESET, 0);
    scaffold.size_fn("size_0", 3);
    scaffold.notifier("init_1", INIT, 1);
    scaffold.split_body("body_1", 1);
    scaffold.notifier("reset_1", RESET, 1);
    scaffold.notifier("init_2", INIT, 2);
    scaffold.notifier("body_2", BODY, 2);
    scaffold.notifier("reset_2", RESET, 2);
    let program = scaffold.finish();

    let mut pipelines = PipelineBuilder::new();
    let source = pipelines.create_pipeline();
    let split = pipelines.create_pipeline();
    let sink = pipelines.create_pipeline();
    pipelines.set_driver(split, source);
    pipelines.set_split(split, true);
    pipelines.add_predecessor(sink, split);
    (program, pipelines.finish())
}

#[test]
fn pipelines_run_in_order_with_morsels_and_resets() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    EVENTS.lock().unwrap().clear();

    let (program, pipelines) = three_stage_query();
    let query = ExecutableQuery::new(&program, pipelines, ExecConfig::default());
    query.execute().unwrap();

    let events = EVENTS.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            (INIT, 0, 0),
            (BODY, 0, 0),
            (INIT, 1, 0),
            // size() returned 3, consumed by one morsel [0, 2]
            (BODY, 1, 2),
            (RESET, 0, 0),
            (INIT, 2, 0),
            (BODY, 2, 0),
            (RESET, 1, 0),
            (RESET, 2, 0),
        ]
    );

    for pipeline in 0..3 {
        let inits = events.iter().filter(|e| e.0 == INIT && e.1 == pipeline).count();
        let resets = events.iter().filter(|e| e.0 == RESET && e.1 == pipeline).count();
        assert_eq!(inits, 1);
        assert_eq!(resets, 1);
    }
}

#[test]
fn adaptive_mode_stays_on_the_jit_for_tiny_inputs() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    EVENTS.lock().unwrap().clear();

    let (program, pipelines) = three_stage_query();
    let config = ExecConfig { mode: PipelineMode::Adaptive, ..ExecConfig::default() };
    let query = ExecutableQuery::new(&program, pipelines, config);
    // one morsel covers the whole input, so the probe finishes the
    // pipeline and the optimized backend is never consulted
    query.execute().unwrap();

    let events = EVENTS.lock().unwrap().clone();
    assert!(events.contains(&(BODY, 1, 2)));
    assert_eq!(events.last(), Some(&(RESET, 2, 0)));
}

#[test]
fn sink_with_successor_is_a_structural_bug() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    EVENTS.lock().unwrap().clear();

    let mut scaffold = QueryScaffold::new();
    scaffold.notifier("init_0", INIT, 0);
    scaffold.notifier("body_0", BODY, 0);
    scaffold.notifier("reset_0", RESET, 0);
    scaffold.notifier("init_1", INIT, 1);
    scaffold.notifier("body_1", BODY, 1);
    scaffold.notifier("reset_1", RESET, 1);
    let program = scaffold.finish();

    // a cycle: each pipeline claims the other as predecessor
    let mut pipelines = PipelineBuilder::new();
    let a = pipelines.create_pipeline();
    let b = pipelines.create_pipeline();
    pipelines.add_predecessor(b, a);
    pipelines.add_predecessor(a, b);

    let query = ExecutableQuery::new(&program, pipelines.finish(), ExecConfig::default());
    assert!(matches!(
        query.execute(),
        Err(quarry_exec::ExecError::OutputPipelineHasSuccessor)
    ));
}
