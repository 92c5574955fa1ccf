//! Drives the fixed Stage-1/Stage-2 pass pipeline directly over a
//! hand-built `matmul(x, w) + bias -> relu` subgraph, checking both the
//! structural outcome of bias and post-op fusion and the numeric result
//! of executing the fused graph.

mod common;

use common::{buffer_from, read_buffer};
use graph_core::dispatcher::{Dispatcher, Runtime};
use graph_core::engine::{DeviceBuffer, HeapAllocator};
use graph_core::exec_args::ExecutionArgSet;
use graph_core::memory_planner::MemoryPlanner;
use graph_core::op::{Attribute, Op, OpKind};
use graph_core::pass::PassPipeline;
use graph_core::passes::{setup_pipeline_stage1, setup_pipeline_stage2};
use graph_core::subgraph::{EngineKind, FloatingPointMode, Subgraph};
use graph_core::value::{ElementType, OpId, Shape, ValueId};
use std::sync::Arc;

fn build_unfused_graph() -> Subgraph {
    let mut sg = Subgraph::new(EngineKind::Cpu, FloatingPointMode::Any, false);

    let x = sg.declare_value(ElementType::F32, Shape::static_dims([2, 3]));
    let w = sg.declare_value(ElementType::F32, Shape::static_dims([3, 4]));
    let bias = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
    let mm_out = sg.declare_value(ElementType::F32, Shape::static_dims([2, 4]));
    let add_out = sg.declare_value(ElementType::F32, Shape::static_dims([2, 4]));
    let relu_out = sg.declare_value(ElementType::F32, Shape::static_dims([2, 4]));
    sg.inputs = vec![x, w, bias];
    sg.outputs = vec![relu_out];

    let mut mm = Op::new(OpId(0), OpKind::MatMul, vec![x, w], vec![mm_out]);
    mm.attrs.insert("m".to_string(), Attribute::Int(2));
    mm.attrs.insert("k".to_string(), Attribute::Int(3));
    mm.attrs.insert("n".to_string(), Attribute::Int(4));
    sg.push_op(mm);

    let mut add = Op::new(OpId(1), OpKind::Binary, vec![mm_out, bias], vec![add_out]);
    add.attrs.insert("algorithm".to_string(), Attribute::String("add".to_string()));
    sg.push_op(add);

    let mut relu = Op::new(OpId(2), OpKind::Eltwise, vec![add_out], vec![relu_out]);
    relu.attrs.insert("algorithm".to_string(), Attribute::String("relu".to_string()));
    sg.push_op(relu);

    sg
}

#[test]
fn bias_add_and_relu_fold_into_the_matmul() {
    let mut sg = build_unfused_graph();

    let mut stage1 = PassPipeline::new();
    setup_pipeline_stage1(&mut stage1);
    stage1.run(&mut sg).unwrap();
    sg.compact();
    sg.verify_topological_order().unwrap();

    // The bias-add and relu ops have folded into the matmul; a rank-1
    // bias operand gets unsqueezed to broadcast against the matmul
    // output, so one extra op remains alongside the fused matmul.
    assert_eq!(sg.op_count(), 2);
    assert_eq!(sg.ops_of_kind(OpKind::Unsqueeze).count(), 1);

    let matmul = sg.ops_of_kind(OpKind::MatMul).next().expect("matmul survives fusion");
    assert_eq!(matmul.inputs.len(), 3);
    assert_eq!(matmul.post_ops.len(), 1);
    assert_eq!(matmul.post_ops[0].kind, OpKind::Eltwise);
    assert_eq!(matmul.attrs.get("has_bias").and_then(Attribute::as_bool), Some(true));
}

#[test]
fn fused_matmul_bias_relu_computes_the_expected_values() {
    let mut sg = build_unfused_graph();

    let mut stage1 = PassPipeline::new();
    setup_pipeline_stage1(&mut stage1);
    stage1.run(&mut sg).unwrap();
    sg.compact();
    sg.verify_topological_order().unwrap();

    let mut stage2 = PassPipeline::new();
    let planner_cell = setup_pipeline_stage2(&mut stage2, MemoryPlanner::new(), false);
    stage2.run(&mut sg).unwrap();
    sg.compact();
    sg.verify_topological_order().unwrap();

    let planner = planner_cell.lock();
    let all_values: Vec<ValueId> = sg.values().map(|v| v.id).collect();
    let arg_set = ExecutionArgSet::build(&planner, all_values.into_iter());
    drop(planner);

    let dispatcher = Dispatcher {
        partition_id: 1,
        allocator: Arc::new(HeapAllocator),
        constant_cache: None,
        persistent_digest: [0u8; 32],
    };

    // x @ w, where w selects x's first 3 columns into an extra all-zero
    // 4th column, then + bias, then relu.
    let x = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
    let w = vec![1.0f32, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0];
    let bias = vec![10.0f32, 20.0, 30.0, -100.0];
    let inputs = vec![buffer_from(&x), buffer_from(&w), buffer_from(&bias)];
    let outputs = vec![DeviceBuffer::zeroed(2 * 4 * 4)];

    dispatcher.execute(&sg, &arg_set, &inputs, &outputs, &[], Runtime::Cpu, &[]).unwrap();

    let expected = vec![11.0f32, 22.0, 33.0, 0.0, 14.0, 25.0, 36.0, 0.0];
    assert_eq!(read_buffer(&outputs[0]), expected);
}
