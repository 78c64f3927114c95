//! GPU-backed integration tests.
//!
//! Every test acquires a real adapter and returns early when none is
//! available, so the suite is safe on headless machines without a usable
//! GPU backend.

use std::path::{Path, PathBuf};

use futures::executor::block_on;

use sluice::{
    Block, Context, ContextBuilder, Registry, Runner, Script, SubmitPool, ValueType,
};

fn context() -> Option<Context> {
    block_on(ContextBuilder::new().build()).ok()
}

fn assets() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("assets")
}

#[test]
fn block_upload_roundtrips_bit_for_bit() {
    let Some(context) = context() else { return };

    let types = [ValueType::F32, ValueType::Vec2, ValueType::U32];
    let values = [1.5, -2.0, 0.25, 7.0, 0.0, 3.5, 9.75, 11.0];
    let block = Block::from_values(&types, &values).unwrap();

    let mut registry = Registry::new(context);
    registry.declare_storage("records", &block).unwrap();

    let bytes = registry.read_back("records").unwrap();
    assert_eq!(bytes, block.bytes());
}

#[test]
fn bound_pipeline_mutates_declared_buffer() {
    let Some(context) = context() else { return };

    // pipeline `advect` references buffer `pos` by name only
    const ADVECT: &str = r#"
        @group(0) @binding(0) var<storage, read_write> pos: array<vec4<f32>>;

        @compute @workgroup_size(4)
        fn main(@builtin(global_invocation_id) id: vec3<u32>) {
            if (id.x < arrayLength(&pos)) {
                pos[id.x] = pos[id.x] * 2.0;
            }
        }
    "#;

    let block = Block::from_values(&[ValueType::Vec4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let mut registry = Registry::new(context.clone());
    registry.declare_storage("pos", &block).unwrap();
    registry.declare_pipeline("advect", ADVECT).unwrap();
    registry.bind_all().unwrap();

    let mut pool = SubmitPool::new(context.device.clone(), context.queue.clone());
    pool.begin_batch();
    let mut recorder = pool.begin();
    pool.dispatch(&mut recorder, registry.pipeline("advect").unwrap(), [1, 1, 1]);
    pool.end(recorder);
    pool.submit_batch().unwrap();

    let lanes: Vec<f32> = bytemuck::pod_collect_to_vec(&registry.read_back("pos").unwrap());
    assert_eq!(lanes, [2.0, 4.0, 6.0, 8.0]);
}

#[test]
fn undeclared_binding_is_rejected() {
    let Some(context) = context() else { return };

    const ORPHAN: &str = r#"
        @group(0) @binding(0) var<storage, read_write> missing: array<f32>;

        @compute @workgroup_size(1)
        fn main() {
            missing[0] = 1.0;
        }
    "#;

    let mut registry = Registry::new(context);
    registry.declare_pipeline("orphan", ORPHAN).unwrap();
    assert!(registry.bind_all().is_err());
}

/// Inline script reusing the asset shaders: one vec4 record, a clock the
/// shader advances by 1.0 per execution.
fn tick_script(flow: &str) -> Script {
    let source = format!(
        r#"{{
            "pipelines": [{{ "name": "decay", "path": "../shaders/decay.wgsl" }}],
            "storages": [
                {{ "name": "field", "layout": "Vec4", "resource": {{ "length": 1 }} }},
                {{ "name": "clock", "layout": "F32", "resource": [0.0] }}
            ],
            "uniforms": [{{ "name": "params", "layout": "F32", "resource": [1.0] }}],
            "passes": [{{ "name": "tick", "shader": "decay", "groupCounts": [1, 1, 1] }}],
            "flow": [{flow}]
        }}"#
    );
    Script::from_str(&source).unwrap()
}

fn read_clock(runner: &Runner) -> f32 {
    let bytes = runner.registry().read_back("clock").unwrap();
    let lanes: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
    lanes[0]
}

#[test]
fn iterable_node_executes_exactly_count_times() {
    let Some(context) = context() else { return };

    let script = tick_script(
        r#"{ "nodeName": "spin", "type": 1, "passes": ["tick"], "count": 3 }"#,
    );
    let mut runner = Runner::load(context, &script, &assets().join("scripts")).unwrap();
    runner.run().unwrap();

    assert_eq!(read_clock(&runner), 3.0);
}

#[test]
fn pollable_node_stops_at_threshold() {
    let Some(context) = context() else { return };

    let script = tick_script(
        r#"{ "nodeName": "relax", "type": 3, "passes": ["tick"],
             "flagBuffer": "clock", "operation": "gEqual", "flagIndex": 0, "flag": 5.0 }"#,
    );
    let mut runner = Runner::load(context, &script, &assets().join("scripts")).unwrap();
    runner.run().unwrap();

    // +1.0 per pass from 0.0 under `gEqual 5.0`: exactly 5 passes
    assert_eq!(read_clock(&runner), 5.0);
}

#[test]
fn pollable_flag_index_outside_buffer_is_rejected() {
    let Some(context) = context() else { return };

    // `clock` is a single padded F32 record: 16 bytes, flag slots 0..=3
    let script = tick_script(
        r#"{ "nodeName": "relax", "type": 3, "passes": ["tick"],
             "flagBuffer": "clock", "operation": "gEqual", "flagIndex": 4, "flag": 5.0 }"#,
    );
    let result = Runner::load(context, &script, &assets().join("scripts"));
    assert!(matches!(
        result,
        Err(sluice::RunError::FlagOutOfRange { index: 4, .. })
    ));
}

#[test]
fn step_mode_prunes_completed_nodes() {
    let Some(context) = context() else { return };

    let script = tick_script(
        r#"{ "nodeName": "spin", "type": 1, "passes": ["tick"], "count": 2 }"#,
    );
    let mut runner = Runner::load(context, &script, &assets().join("scripts")).unwrap();

    assert_eq!(runner.pending(), 1);
    assert!(runner.step().unwrap());
    assert!(!runner.step().unwrap());
    assert_eq!(runner.pending(), 0);
    assert_eq!(read_clock(&runner), 2.0);
}

#[test]
fn script_file_runs_to_completion() {
    let Some(context) = context() else { return };

    let path = assets().join("scripts").join("decay.json");
    let mut runner = Runner::load_file(context, path).unwrap();
    runner.run().unwrap();

    // the clock crosses its 10.0 threshold exactly
    assert_eq!(read_clock(&runner), 10.0);

    // seeded by the __INIT__ node, then halved ten times
    let bytes = runner.registry().read_back("field").unwrap();
    let lanes: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
    let scale = 0.5f32.powi(10);
    for (index, chunk) in lanes.chunks_exact(4).enumerate() {
        for lane in chunk {
            assert_eq!(*lane, index as f32 * scale);
        }
    }
}
