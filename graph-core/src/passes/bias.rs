//! Bias handling family: folds standalone bias-add ops into a preceding
//! matmul/convolution's bias slot.

use crate::error::{GraphError, Result};
use crate::op::{Attribute, Op, OpKind};
use crate::pass::{Pass, Transactionality};
use crate::subgraph::Subgraph;
use crate::value::{ElementType, OpId};

fn sole_consumer(subgraph: &Subgraph, value_id: crate::value::ValueId) -> Option<OpId> {
    let value = subgraph.value(value_id)?;
    if value.consumers.len() == 1 && !subgraph.outputs.contains(&value_id) {
        value.consumers.iter().copied().next()
    } else {
        None
    }
}

/// Folds `matmul(x, w) + bias` / `conv(x, w) + bias` into the primary
/// op's own input list (a third, bias, input) rather than a post-op —
/// most kernel implementations have a dedicated bias path distinct from
/// the general post-op chain.
pub struct FuseBiasAdd;

impl Pass for FuseBiasAdd {
    fn name(&self) -> &str {
        "fuse_bias_add"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let primaries: Vec<OpId> = subgraph
            .ops_in_order()
            .filter(|op| matches!(op.kind, OpKind::MatMul | OpKind::Convolution))
            .filter(|op| op.attrs.get("has_bias").and_then(Attribute::as_bool) != Some(true))
            .map(|op| op.id)
            .collect();

        for primary_id in primaries {
            let out = subgraph.op(primary_id).unwrap().outputs[0];
            let Some(add_id) = sole_consumer(subgraph, out) else {
                continue;
            };
            let Some(add) = subgraph.op(add_id).cloned() else {
                continue;
            };
            let is_add = add.kind == OpKind::Binary
                && matches!(add.attrs.get("algorithm"), Some(Attribute::String(s)) if s == "add");
            if !is_add {
                continue;
            }
            let Some(bias) = add.inputs.iter().copied().find(|&v| v != out) else {
                continue;
            };
            let is_bias_shaped = subgraph
                .value(bias)
                .map(|v| v.shape.rank() <= 1)
                .unwrap_or(false);
            if !is_bias_shaped {
                continue;
            }

            let add_out = add.outputs[0];
            if let Some(op) = subgraph.op_mut(primary_id) {
                op.inputs.push(bias);
                op.outputs = vec![add_out];
                op.attrs.insert("has_bias".to_string(), Attribute::Bool(true));
            }
            if let Some(v) = subgraph.value_mut(bias) {
                v.consumers.insert(primary_id);
            }
            if let Some(v) = subgraph.value_mut(add_out) {
                v.producer = Some(primary_id);
            }
            subgraph.mark_dead(add_id);
        }
        Ok(())
    }
}

/// Folds a `BatchNorm` whose sole input is a `Convolution`'s output, and
/// whose scale/shift operands are constants, directly into the
/// convolution's post-op chain.
pub struct InsertBnFolding;

impl Pass for InsertBnFolding {
    fn name(&self) -> &str {
        "insert_bn_folding"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let convs: Vec<OpId> = subgraph.ops_of_kind(OpKind::Convolution).map(|op| op.id).collect();
        for conv_id in convs {
            let out = subgraph.op(conv_id).unwrap().outputs[0];
            let Some(bn_id) = sole_consumer(subgraph, out) else {
                continue;
            };
            let Some(bn) = subgraph.op(bn_id).cloned() else {
                continue;
            };
            if bn.kind != OpKind::BatchNorm {
                continue;
            }
            let all_const = bn.inputs[1..]
                .iter()
                .all(|&v| subgraph.value(v).map(|val| val.is_const).unwrap_or(false));
            if !all_const {
                continue;
            }

            let bn_out = bn.outputs[0];
            if let Some(op) = subgraph.op_mut(conv_id) {
                op.outputs = vec![bn_out];
                op.post_ops.push(crate::op::PostOp {
                    kind: OpKind::BatchNorm,
                    attrs: bn.attrs.clone(),
                    extra_input: None,
                });
            }
            if let Some(v) = subgraph.value_mut(bn_out) {
                v.producer = Some(conv_id);
            }
            subgraph.mark_dead(bn_id);
        }
        Ok(())
    }
}

/// Validates that every op tagged `has_bias` really carries a third
/// (bias) input — a transactional invariant check, not a rewrite.
pub struct CheckWithBias;

impl Pass for CheckWithBias {
    fn name(&self) -> &str {
        "check_with_bias"
    }

    fn transactionality(&self) -> Transactionality {
        Transactionality::Transactional
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        for op in subgraph.ops_in_order() {
            if op.attrs.get("has_bias").and_then(Attribute::as_bool) == Some(true)
                && op.inputs.len() < 3
            {
                return Err(GraphError::invariant(
                    self.name(),
                    format!("op {:?} tagged has_bias but only has {} inputs", op.id, op.inputs.len()),
                ));
            }
        }
        Ok(())
    }
}

/// Inserts an f32 typecast on the bias input of any op tagged
/// `has_bias` whose bias element type is not already f32 — kernels
/// accumulate bias in f32 regardless of the primary op's working type.
pub struct ConvertBiasToF32;

impl Pass for ConvertBiasToF32 {
    fn name(&self) -> &str {
        "convert_bias_to_f32"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let targets: Vec<(OpId, crate::value::ValueId, usize)> = subgraph
            .ops_in_order()
            .filter(|op| op.attrs.get("has_bias").and_then(Attribute::as_bool) == Some(true))
            .filter_map(|op| {
                let idx = op.inputs.len() - 1;
                let bias = op.inputs[idx];
                Some((op.id, bias, idx))
            })
            .filter(|(_, bias, _)| {
                subgraph
                    .value(*bias)
                    .map(|v| v.elem_type != ElementType::F32)
                    .unwrap_or(false)
            })
            .collect();

        for (op_id, bias, idx) in targets {
            let shape = subgraph.value(bias).unwrap().shape.clone();
            let cast_out = subgraph.declare_value(ElementType::F32, shape);
            let cast_id = subgraph.fresh_op_id();
            subgraph.insert_op_before(
                op_id,
                Op::new(cast_id, OpKind::Typecast, vec![bias], vec![cast_out]),
            )?;
            if let Some(op) = subgraph.op_mut(op_id) {
                op.inputs[idx] = cast_out;
            }
            if let Some(v) = subgraph.value_mut(cast_out) {
                v.consumers.insert(op_id);
            }
        }
        Ok(())
    }
}
