//! Constant propagation: marks the transitive closure of ops whose every
//! input is either a subgraph constant or the output of another constant
//! op. Gated by `enable_constant_cache` in `setup_pipeline_stage2` — with
//! the cache disabled there is no benefit to knowing which ops are
//! constant-foldable, since nothing will be cached across executions.

use crate::error::Result;
use crate::pass::Pass;
use crate::subgraph::Subgraph;

/// Runs to a fixed point: an op is constant if every input value is
/// either itself marked constant (a subgraph constant leaf) or produced
/// by an op already marked constant. Repeats until a full pass makes no
/// further changes, since ops appear in topological order but an op's
/// constant-ness can only be decided once *all* its inputs have been
/// visited, which a single forward sweep already guarantees — the loop
/// exists for defense against future passes that reorder `order` non-
/// topologically without calling `verify_topological_order` first.
pub struct ConstantPropagation;

impl Pass for ConstantPropagation {
    fn name(&self) -> &str {
        "constant_propagation"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        loop {
            let mut changed = false;
            let ids: Vec<_> = subgraph.ops_in_order().map(|op| op.id).collect();
            for id in ids {
                let op = subgraph.op(id).unwrap();
                if op.is_constant {
                    continue;
                }
                let all_const = op.inputs.iter().all(|&input| {
                    subgraph
                        .value(input)
                        .map(|v| {
                            v.is_const
                                || v.producer
                                    .map(|p| subgraph.op(p).map(|op| op.is_constant).unwrap_or(false))
                                    .unwrap_or(false)
                        })
                        .unwrap_or(false)
                });
                if all_const && !op.inputs.is_empty() {
                    subgraph.op_mut(id).unwrap().is_constant = true;
                    for &out in &subgraph.op(id).unwrap().outputs.clone() {
                        if let Some(v) = subgraph.value_mut(out) {
                            v.is_const = true;
                        }
                    }
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Op, OpKind};
    use crate::subgraph::{EngineKind, FloatingPointMode};
    use crate::value::{ElementType, Shape};

    #[test]
    fn chain_of_constants_propagates() {
        let mut sg = Subgraph::new(EngineKind::Cpu, FloatingPointMode::Any, false);
        let w = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        sg.value_mut(w).unwrap().is_const = true;
        let mid = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        let out = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        sg.inputs = vec![w];
        sg.outputs = vec![out];

        let id1 = sg.fresh_op_id();
        sg.push_op(Op::new(id1, OpKind::Typecast, vec![w], vec![mid]));
        let id2 = sg.fresh_op_id();
        sg.push_op(Op::new(id2, OpKind::Typecast, vec![mid], vec![out]));

        ConstantPropagation.run(&mut sg).unwrap();
        assert!(sg.op(id1).unwrap().is_constant);
        assert!(sg.op(id2).unwrap().is_constant);
        assert!(sg.value(out).unwrap().is_const);
    }
}
