//! Property: for any randomly shaped subgraph, the full Stage-1 pass
//! pipeline leaves `Subgraph::verify_topological_order` satisfied — the
//! explicitly maintained order never falls out of sync with the
//! independent `petgraph` toposort, regardless of which passes fired.

use graph_core::op::{Attribute, Op, OpKind};
use graph_core::passes::setup_pipeline_stage1;
use graph_core::pass::PassPipeline;
use graph_core::subgraph::{EngineKind, FloatingPointMode, Subgraph};
use graph_core::value::{ElementType, Shape};
use proptest::prelude::*;

const UNARY_ALGORITHMS: &[&str] = &["relu", "sigmoid", "swish", "reciprocal"];

/// Builds a chain `input -> eltwise -> eltwise -> ... -> output` of
/// `algorithms.len()` ops, each tagged with the given algorithm, over a
/// single rank-1 tensor of `width` elements.
fn chain_subgraph(width: i64, algorithms: &[&str]) -> Subgraph {
    let mut sg = Subgraph::new(EngineKind::Cpu, FloatingPointMode::Any, false);
    let shape = Shape::static_dims([width]);
    let mut prev = sg.declare_value(ElementType::F32, shape.clone());
    sg.inputs.push(prev);
    for &algo in algorithms {
        let next = sg.declare_value(ElementType::F32, shape.clone());
        let op_id = sg.fresh_op_id();
        let mut op = Op::new(op_id, OpKind::Eltwise, vec![prev], vec![next]);
        op.attrs.insert("algorithm".to_string(), Attribute::String(algo.to_string()));
        sg.push_op(op);
        prev = next;
    }
    sg.outputs.push(prev);
    sg
}

proptest! {
    #[test]
    fn stage1_pipeline_preserves_topological_order(
        width in 1i64..64,
        algo_indices in prop::collection::vec(0usize..UNARY_ALGORITHMS.len(), 0..24),
    ) {
        let algorithms: Vec<&str> = algo_indices.iter().map(|&i| UNARY_ALGORITHMS[i]).collect();
        let mut sg = chain_subgraph(width, &algorithms);
        sg.check_io_invariants().unwrap();
        sg.verify_topological_order().unwrap();

        let mut pipeline = PassPipeline::new();
        setup_pipeline_stage1(&mut pipeline);
        pipeline.run(&mut sg).unwrap();
        sg.compact();

        prop_assert!(sg.verify_topological_order().is_ok());

        // Every surviving op's inputs must still trace back to either a
        // live producer earlier in order or a declared subgraph input.
        let seen_inputs: std::collections::BTreeSet<_> = sg.inputs.iter().copied().collect();
        for op in sg.ops_in_order() {
            for &input in &op.inputs {
                let has_producer = sg.value(input).and_then(|v| v.producer).is_some();
                prop_assert!(has_producer || seen_inputs.contains(&input));
            }
        }
    }
}
