//! Property: for a subgraph built from a varied interval graph of
//! temporaries (random chain count, random chain length, random element
//! width per chain), any two `InternalTemporary` values whose liveness
//! windows overlap are packed into disjoint byte ranges.

use graph_core::memory_planner::{MemoryPlan, MemoryPlanner};
use graph_core::op::{Op, OpKind};
use graph_core::subgraph::{EngineKind, FloatingPointMode, Subgraph};
use graph_core::value::{ElementType, Shape, ValueId};
use proptest::prelude::*;

/// Builds `num_chains` independent `Typecast` chains of varying length and
/// element width, round-robin interleaved in push order so different
/// chains' temporaries overlap in topological position, then joins every
/// chain's final value into one `Sum` output.
fn build_interval_graph(chain_widths: &[i64], chain_lengths: &[usize]) -> (Subgraph, ValueId) {
    let mut sg = Subgraph::new(EngineKind::Cpu, FloatingPointMode::Any, false);
    let n = chain_widths.len();
    let shapes: Vec<Shape> = chain_widths.iter().map(|&w| Shape::static_dims([w])).collect();

    let mut heads: Vec<ValueId> = (0..n)
        .map(|i| {
            let v = sg.declare_value(ElementType::F32, shapes[i].clone());
            sg.inputs.push(v);
            v
        })
        .collect();

    let max_len = chain_lengths.iter().copied().max().unwrap_or(0);
    for step in 0..max_len {
        for i in 0..n {
            if step >= chain_lengths[i] {
                continue;
            }
            let next = sg.declare_value(ElementType::F32, shapes[i].clone());
            let op_id = sg.fresh_op_id();
            sg.push_op(Op::new(op_id, OpKind::Typecast, vec![heads[i]], vec![next]));
            heads[i] = next;
        }
    }

    // Each chain's final value is a subgraph output in its own right —
    // `Subgraph::outputs` isn't restricted to a single value — so every
    // intermediate value strictly between a chain's input and its final
    // value is the internal temporary this test is probing.
    sg.outputs = heads.clone();
    (sg, heads[0])
}

/// Mirrors `MemoryPlanner`'s own lifetime computation using only public
/// `Subgraph` accessors, independent of the planner's internal packing —
/// analogous to `Subgraph::verify_topological_order`'s independent
/// `petgraph` cross-check.
fn liveness_window(sg: &Subgraph, value: ValueId) -> (usize, usize) {
    let position: std::collections::BTreeMap<_, _> =
        sg.ops_in_order().enumerate().map(|(i, op)| (op.id, i)).collect();
    let v = sg.value(value).unwrap();
    let first = v.producer.and_then(|p| position.get(&p).copied()).unwrap_or(0);
    let last = v
        .consumers
        .iter()
        .filter_map(|c| position.get(c).copied())
        .max()
        .unwrap_or(first);
    (first, last)
}

proptest! {
    #[test]
    fn overlapping_temporaries_get_disjoint_offsets(
        chain_widths in prop::collection::vec(1i64..9, 2..6),
        chain_lengths in prop::collection::vec(1usize..6, 2..6),
    ) {
        let n = chain_widths.len().min(chain_lengths.len());
        let chain_widths = &chain_widths[..n];
        let chain_lengths = &chain_lengths[..n];
        let (mut sg, _) = build_interval_graph(chain_widths, chain_lengths);

        let mut planner = MemoryPlanner::new();
        planner.run(&mut sg).unwrap();

        let temporaries: Vec<(ValueId, usize, usize)> = sg
            .values()
            .filter_map(|v| match planner.plan_of(v.id) {
                Some(MemoryPlan::InternalTemporary { offset, size }) => Some((v.id, *offset, *size)),
                _ => None,
            })
            .collect();

        for i in 0..temporaries.len() {
            for j in (i + 1)..temporaries.len() {
                let (v1, off1, size1) = temporaries[i];
                let (v2, off2, size2) = temporaries[j];
                let (f1, l1) = liveness_window(&sg, v1);
                let (f2, l2) = liveness_window(&sg, v2);
                let windows_overlap = f1 <= l2 && f2 <= l1;
                if windows_overlap {
                    let byte_ranges_disjoint = off1 + size1 <= off2 || off2 + size2 <= off1;
                    prop_assert!(byte_ranges_disjoint);
                }
            }
        }
    }
}
