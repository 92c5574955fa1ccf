//! Stage-2 transpose-fusion family, run after layout is still abstract
//! but shapes are known.

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

fn is_transpose_permute(subgraph: &Subgraph, op_id: OpId) -> bool {
    let Some(op) = subgraph.op(op_id) else {
        return false;
    };
    if op.kind != OpKind::Permute {
        return false;
    }
    match op.attrs.get("perm") {
        Some(Attribute::IntArray(perm)) => {
            perm.len() >= 2 && {
                let n = perm.len();
                perm[n - 1] == (n - 2) as i64 && perm[n - 2] == (n - 1) as i64
            }
        }
        _ => false,
    }
}

/// Folds a `Permute` that swaps a matmul operand's last two axes
/// directly into the matmul's `transpose_a`/`transpose_b` attribute,
/// avoiding a materialized transpose when the kernel can read the
/// operand strided.
pub struct FuseSrcTransposeToMatmul;

impl Pass for FuseSrcTransposeToMatmul {
    fn name(&self) -> &str {
        "fuse_src_transpose_to_matmul"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let matmuls: Vec<OpId> = subgraph.ops_of_kind(OpKind::MatMul).map(|op| op.id).collect();
        for mm_id in matmuls {
            for (idx, attr_name) in [(0usize, "transpose_a"), (1usize, "transpose_b")] {
                let Some(input) = subgraph.op(mm_id).unwrap().inputs.get(idx).copied() else {
                    continue;
                };
                let Some(producer_id) = subgraph.value(input).and_then(|v| v.producer) else {
                    continue;
                };
                if !is_transpose_permute(subgraph, producer_id) || sole_consumer(subgraph, input) != Some(mm_id) {
                    continue;
                }
                let orig_input = subgraph.op(producer_id).unwrap().inputs[0];
                if let Some(op) = subgraph.op_mut(mm_id) {
                    op.inputs[idx] = orig_input;
                    op.attrs.insert(attr_name.to_string(), Attribute::Bool(true));
                }
                if let Some(v) = subgraph.value_mut(orig_input) {
                    v.consumers.insert(mm_id);
                }
                subgraph.mark_dead(producer_id);
            }
        }
        Ok(())
    }
}

/// Folds a `Permute` that transposes a primary op's output into the
/// producing op's `output_transposed` attribute when the transpose is
/// the op's sole consumer, shifting the layout fixup into the kernel.
pub struct FuseDstTransposeToPredecessor;

impl Pass for FuseDstTransposeToPredecessor {
    fn name(&self) -> &str {
        "fuse_dst_transpose_to_predecessor"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let permutes: Vec<OpId> = subgraph.ops_of_kind(OpKind::Permute).map(|op| op.id).collect();
        for perm_id in permutes {
            if !is_transpose_permute(subgraph, perm_id) {
                continue;
            }
            let input = subgraph.op(perm_id).unwrap().inputs[0];
            let Some(pred_id) = subgraph.value(input).and_then(|v| v.producer) else {
                continue;
            };
            let Some(pred) = subgraph.op(pred_id) else {
                continue;
            };
            if !matches!(pred.kind, OpKind::MatMul | OpKind::Convolution) {
                continue;
            }
            if sole_consumer(subgraph, input) != Some(perm_id) {
                continue;
            }
            let out = subgraph.op(perm_id).unwrap().outputs[0];
            if let Some(op) = subgraph.op_mut(pred_id) {
                op.outputs = vec![out];
                op.attrs
                    .insert("output_transposed".to_string(), Attribute::Bool(true));
            }
            if let Some(v) = subgraph.value_mut(out) {
                v.producer = Some(pred_id);
            }
            subgraph.mark_dead(perm_id);
        }
        Ok(())
    }
}
