//! Property: running the full Stage-1 pipeline a second time over its own
//! output is a no-op. Stage 1 rewrites reciprocal/mul into div and
//! sigmoid/mul into swish, among others; once a graph has settled into
//! that canonical form, re-running the same pipeline must not find
//! anything new to fuse.

use graph_core::op::{Attribute, Op, OpKind};
use graph_core::passes::setup_pipeline_stage1;
use graph_core::pass::PassPipeline;
use graph_core::subgraph::{EngineKind, FloatingPointMode, Subgraph};
use graph_core::value::{ElementType, Shape};
use proptest::prelude::*;

/// One step in a randomly generated unary/binary op chain: either a unary
/// `Eltwise` algorithm applied to the running value, or a `Binary`
/// algorithm that combines the running value with a second subgraph
/// input.
#[derive(Debug, Clone, Copy)]
enum Step {
    Eltwise(&'static str),
    Binary(&'static str),
}

const ELTWISE_ALGORITHMS: &[&str] = &["relu", "sigmoid", "reciprocal"];
const BINARY_ALGORITHMS: &[&str] = &["add", "mul", "sub"];

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..ELTWISE_ALGORITHMS.len()).prop_map(|i| Step::Eltwise(ELTWISE_ALGORITHMS[i])),
        (0..BINARY_ALGORITHMS.len()).prop_map(|i| Step::Binary(BINARY_ALGORITHMS[i])),
    ]
}

fn build_subgraph(width: i64, steps: &[Step]) -> Subgraph {
    let mut sg = Subgraph::new(EngineKind::Cpu, FloatingPointMode::Any, false);
    let shape = Shape::static_dims([width]);
    let mut prev = sg.declare_value(ElementType::F32, shape.clone());
    sg.inputs.push(prev);

    for step in steps {
        let out = sg.declare_value(ElementType::F32, shape.clone());
        let op_id = sg.fresh_op_id();
        match step {
            Step::Eltwise(algo) => {
                let mut op = Op::new(op_id, OpKind::Eltwise, vec![prev], vec![out]);
                op.attrs.insert("algorithm".to_string(), Attribute::String(algo.to_string()));
                sg.push_op(op);
            }
            Step::Binary(algo) => {
                let side = sg.declare_value(ElementType::F32, shape.clone());
                sg.inputs.push(side);
                let mut op = Op::new(op_id, OpKind::Binary, vec![prev, side], vec![out]);
                op.attrs.insert("algorithm".to_string(), Attribute::String(algo.to_string()));
                sg.push_op(op);
            }
        }
        prev = out;
    }
    sg.outputs.push(prev);
    sg
}

/// Multiset of `(op kind, algorithm)` pairs among live ops, order-independent
/// so the check is about *what* survives, not position.
fn op_signature(sg: &Subgraph) -> Vec<(OpKind, Option<String>)> {
    let mut sig: Vec<_> = sg
        .ops_in_order()
        .map(|op| {
            let algo = match op.attrs.get("algorithm") {
                Some(Attribute::String(s)) => Some(s.clone()),
                _ => None,
            };
            (op.kind, algo)
        })
        .collect();
    sig.sort_by(|a, b| format!("{:?}{:?}", a.0, a.1).cmp(&format!("{:?}{:?}", b.0, b.1)));
    sig
}

proptest! {
    #[test]
    fn stage1_is_a_fixed_point_after_one_run(
        width in 1i64..32,
        steps in prop::collection::vec(step_strategy(), 0..16),
    ) {
        let mut sg = build_subgraph(width, &steps);

        let mut first = PassPipeline::new();
        setup_pipeline_stage1(&mut first);
        first.run(&mut sg).unwrap();
        sg.compact();
        sg.verify_topological_order().unwrap();

        let settled_count = sg.op_count();
        let settled_signature = op_signature(&sg);

        let mut second = PassPipeline::new();
        setup_pipeline_stage1(&mut second);
        second.run(&mut sg).unwrap();
        sg.compact();

        prop_assert_eq!(sg.op_count(), settled_count);
        prop_assert_eq!(op_signature(&sg), settled_signature);
    }
}
