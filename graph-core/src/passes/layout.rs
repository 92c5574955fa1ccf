//! Layout propagation: chooses a concrete [`Layout`](crate::value::Layout)
//! for every value, inserting an explicit `Reorder` op wherever a
//! producer and consumer disagree.

use crate::error::Result;
use crate::op::{Op, OpKind};
use crate::pass::Pass;
use crate::subgraph::Subgraph;
use crate::value::{Layout, OpId, ValueId};

fn strided_row_major(subgraph: &Subgraph, value_id: ValueId) -> Option<Vec<i64>> {
    let dims = subgraph.value(value_id)?.shape.static_dims_vec();
    let mut strides = vec![1i64; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    Some(strides)
}

fn preferred_layout(subgraph: &Subgraph, value_id: ValueId, use_blocked: bool) -> Layout {
    let is_weight_like = subgraph.value(value_id).map(|v| v.is_const).unwrap_or(false);
    if use_blocked && is_weight_like {
        Layout::Blocked {
            tag: "blocked_weight".to_string(),
            strides: strided_row_major(subgraph, value_id).unwrap_or_default(),
        }
    } else {
        Layout::Strided(strided_row_major(subgraph, value_id).unwrap_or_default())
    }
}

/// Assigns every `Layout::Any` value a concrete layout (strided, or
/// blocked for constant operands when `use_blocked_layout` is set), then
/// inserts a `Reorder` between any producer/consumer pair whose chosen
/// layouts differ. Later stage-2 passes (`common_reorder_elimination`,
/// `fuse_adjacent_reorders`) clean up reorders layout propagation itself
/// cannot avoid introducing when two consumers of the same value prefer
/// different layouts.
pub struct LayoutPropagation;

impl Pass for LayoutPropagation {
    fn name(&self) -> &str {
        "layout_propagation"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let use_blocked = subgraph.use_blocked_layout;
        let value_ids: Vec<ValueId> = subgraph.values().map(|v| v.id).collect();
        for id in value_ids {
            let needs_layout = subgraph.value(id).map(|v| v.layout == Layout::Any).unwrap_or(false);
            if needs_layout {
                let layout = preferred_layout(subgraph, id, use_blocked);
                if let Some(v) = subgraph.value_mut(id) {
                    v.layout = layout;
                }
            }
        }

        // Only matmul/convolution kernels accept a blocked weight layout;
        // every other consumer of a blocked-layout value needs a reorder to
        // a plain strided view.
        let supports_blocked = |kind: OpKind| matches!(kind, OpKind::MatMul | OpKind::Convolution);

        let op_ids: Vec<OpId> = subgraph.ops_in_order().map(|op| op.id).collect();
        for op_id in op_ids {
            let op = subgraph.op(op_id).unwrap().clone();
            if supports_blocked(op.kind) {
                continue;
            }
            for (idx, &input) in op.inputs.iter().enumerate() {
                let is_blocked = matches!(subgraph.value(input).map(|v| &v.layout), Some(Layout::Blocked { .. }));
                if !is_blocked {
                    continue;
                }
                let shape = subgraph.value(input).unwrap().shape.clone();
                let elem_type = subgraph.value(input).unwrap().elem_type;
                let strides = strided_row_major(subgraph, input).unwrap_or_default();
                let reordered = subgraph.declare_value(elem_type, shape);
                if let Some(v) = subgraph.value_mut(reordered) {
                    v.layout = Layout::Strided(strides);
                }
                let reorder_id = subgraph.fresh_op_id();
                subgraph.insert_op_before(
                    op_id,
                    Op::new(reorder_id, OpKind::Reorder, vec![input], vec![reordered]),
                )?;
                if let Some(op) = subgraph.op_mut(op_id) {
                    op.inputs[idx] = reordered;
                }
                if let Some(v) = subgraph.value_mut(reordered) {
                    v.consumers.insert(op_id);
                }
            }
        }
        Ok(())
    }
}
