//! Layout-reorder canonicalization and elimination. The stage-1 pass
//! only stamps canonical layout-tag attributes on `Reorder` ops already
//! present in the frontend graph; the stage-2 passes remove the ones
//! layout propagation (upstream of this file) made redundant.

use crate::error::Result;
use crate::op::{Attribute, OpKind};
use crate::pass::Pass;
use crate::subgraph::Subgraph;
use crate::value::OpId;

fn sole_consumer(subgraph: &Subgraph, value_id: crate::value::ValueId) -> Option<OpId> {
    let value = subgraph.value(value_id)?;
    if value.consumers.len() == 1 && !subgraph.outputs.contains(&value_id) {
        value.consumers.iter().copied().next()
    } else {
        None
    }
}

fn layout_tag(subgraph: &Subgraph, value_id: crate::value::ValueId) -> String {
    match subgraph.value(value_id).map(|v| &v.layout) {
        Some(crate::value::Layout::Any) | None => "any".to_string(),
        Some(crate::value::Layout::Strided(_)) => "strided".to_string(),
        Some(crate::value::Layout::Blocked { tag, .. }) => tag.clone(),
    }
}

/// Stamps every `Reorder` op with explicit `from_layout`/`to_layout`
/// string attributes derived from its input/output values, so the
/// stage-2 elimination passes below have a uniform representation to
/// compare regardless of how the reorder was introduced.
pub struct ReorderCanonicalization;

impl Pass for ReorderCanonicalization {
    fn name(&self) -> &str {
        "reorder_canonicalization"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph.ops_of_kind(OpKind::Reorder).map(|op| op.id).collect();
        for id in ids {
            let (input, output) = {
                let op = subgraph.op(id).unwrap();
                (op.inputs[0], op.outputs[0])
            };
            let from = layout_tag(subgraph, input);
            let to = layout_tag(subgraph, output);
            if let Some(op) = subgraph.op_mut(id) {
                op.attrs.insert("from_layout".to_string(), Attribute::String(from));
                op.attrs.insert("to_layout".to_string(), Attribute::String(to));
            }
        }
        Ok(())
    }
}

/// Removes a `Reorder` whose `from_layout`/`to_layout` tags are equal —
/// layout propagation resolved both sides to the same concrete layout,
/// so the reorder is a no-op copy.
pub struct CommonReorderElimination;

impl Pass for CommonReorderElimination {
    fn name(&self) -> &str {
        "common_reorder_elimination"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph
            .ops_of_kind(OpKind::Reorder)
            .filter(|op| {
                matches!(
                    (op.attrs.get("from_layout"), op.attrs.get("to_layout")),
                    (Some(Attribute::String(a)), Some(Attribute::String(b))) if a == b
                )
            })
            .map(|op| op.id)
            .collect();

        for id in ids {
            let (input, output) = {
                let op = subgraph.op(id).unwrap();
                (op.inputs[0], op.outputs[0])
            };
            if subgraph.outputs.contains(&output) {
                continue;
            }
            let consumers: Vec<_> = subgraph
                .value(output)
                .map(|v| v.consumers.iter().copied().collect())
                .unwrap_or_default();
            for consumer_id in consumers {
                if let Some(consumer) = subgraph.op_mut(consumer_id) {
                    for inp in consumer.inputs.iter_mut() {
                        if *inp == output {
                            *inp = input;
                        }
                    }
                }
                if let Some(v) = subgraph.value_mut(input) {
                    v.consumers.insert(consumer_id);
                }
            }
            subgraph.mark_dead(id);
        }
        Ok(())
    }
}

/// Collapses a `reorder(to=B)` feeding a sole-consumer `reorder(to=A)`
/// into a single direct reorder (or, when `A` equals the first
/// reorder's own source layout, removes both entirely).
pub struct FuseAdjacentReorders;

impl Pass for FuseAdjacentReorders {
    fn name(&self) -> &str {
        "fuse_adjacent_reorders"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let outer_ids: Vec<OpId> = subgraph.ops_of_kind(OpKind::Reorder).map(|op| op.id).collect();
        for outer_id in outer_ids {
            let Some(outer) = subgraph.op(outer_id).cloned() else {
                continue;
            };
            let input = outer.inputs[0];
            let Some(inner_id) = subgraph.value(input).and_then(|v| v.producer) else {
                continue;
            };
            let Some(inner) = subgraph.op(inner_id).cloned() else {
                continue;
            };
            if inner.kind != OpKind::Reorder || sole_consumer(subgraph, input) != Some(outer_id) {
                continue;
            }

            let from = inner.attrs.get("from_layout").cloned();
            let to = outer.attrs.get("to_layout").cloned();
            let orig_input = inner.inputs[0];
            let outer_out = outer.outputs[0];

            let cancels = matches!(
                (&from, &to),
                (Some(Attribute::String(a)), Some(Attribute::String(b))) if a == b
            );

            if cancels {
                if subgraph.outputs.contains(&outer_out) {
                    continue;
                }
                let consumers: Vec<_> = subgraph
                    .value(outer_out)
                    .map(|v| v.consumers.iter().copied().collect())
                    .unwrap_or_default();
                for consumer_id in consumers {
                    if let Some(consumer) = subgraph.op_mut(consumer_id) {
                        for inp in consumer.inputs.iter_mut() {
                            if *inp == outer_out {
                                *inp = orig_input;
                            }
                        }
                    }
                    if let Some(v) = subgraph.value_mut(orig_input) {
                        v.consumers.insert(consumer_id);
                    }
                }
                subgraph.mark_dead(inner_id);
                subgraph.mark_dead(outer_id);
            } else {
                if let Some(op) = subgraph.op_mut(outer_id) {
                    op.inputs = vec![orig_input];
                    if let Some(from) = from {
                        op.attrs.insert("from_layout".to_string(), from);
                    }
                }
                if let Some(v) = subgraph.value_mut(orig_input) {
                    v.consumers.remove(&inner_id);
                    v.consumers.insert(outer_id);
                }
                if let Some(v) = subgraph.value_mut(outer_out) {
                    v.producer = Some(outer_id);
                }
                subgraph.mark_dead(inner_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Op;
    use crate::subgraph::{EngineKind, FloatingPointMode};
    use crate::value::{ElementType, Layout, Shape};

    fn fresh_sg() -> Subgraph {
        Subgraph::new(EngineKind::Cpu, FloatingPointMode::Any, false)
    }

    /// `reorder(to=B) -> reorder(to=A==orig) -> op`: after canonicalization
    /// and both stage-2 elimination passes run, the reorders cancel and
    /// `op` consumes the original value directly.
    #[test]
    fn reorder_then_inverse_reorder_cancels() {
        let mut sg = fresh_sg();
        let x = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        sg.value_mut(x).unwrap().layout = Layout::Strided(vec![1]);
        let blocked = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        sg.value_mut(blocked).unwrap().layout =
            Layout::Blocked { tag: "aBc".to_string(), strides: vec![1] };
        let back = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        sg.value_mut(back).unwrap().layout = Layout::Strided(vec![1]);
        let relu_out = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        sg.inputs = vec![x];
        sg.outputs = vec![relu_out];

        let r1 = sg.fresh_op_id();
        sg.push_op(Op::new(r1, OpKind::Reorder, vec![x], vec![blocked]));
        let r2 = sg.fresh_op_id();
        sg.push_op(Op::new(r2, OpKind::Reorder, vec![blocked], vec![back]));
        let relu_id = sg.fresh_op_id();
        let mut relu = Op::new(relu_id, OpKind::Eltwise, vec![back], vec![relu_out]);
        relu.attrs
            .insert("algorithm".into(), Attribute::String("relu".into()));
        sg.push_op(relu);

        ReorderCanonicalization.run(&mut sg).unwrap();
        CommonReorderElimination.run(&mut sg).unwrap();
        FuseAdjacentReorders.run(&mut sg).unwrap();
        sg.compact();

        assert_eq!(sg.op_count(), 1);
        let remaining = sg.ops_in_order().next().unwrap();
        assert_eq!(remaining.kind, OpKind::Eltwise);
        assert_eq!(remaining.inputs, vec![x]);
    }
}
