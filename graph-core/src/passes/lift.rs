//! Reshape-aware lift and typecast-fusion families.

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

/// Tags a depthwise convolution's weight-reshape so downstream fusions
/// can see through it without re-deriving the reshape's source shape.
pub struct LiftUpWeightReshapeForDepthwiseConv;

impl Pass for LiftUpWeightReshapeForDepthwiseConv {
    fn name(&self) -> &str {
        "lift_up_weight_reshape_for_depthwiseconv"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let convs: Vec<OpId> = subgraph
            .ops_of_kind(OpKind::Convolution)
            .filter(|op| op.attrs.get("depthwise").and_then(Attribute::as_bool) == Some(true))
            .map(|op| op.id)
            .collect();

        for conv_id in convs {
            let weight = subgraph.op(conv_id).unwrap().inputs.get(1).copied();
            let Some(weight) = weight else { continue };
            let Some(producer) = subgraph.value(weight).and_then(|v| v.producer) else {
                continue;
            };
            let is_reshape = subgraph
                .op(producer)
                .map(|op| op.kind == OpKind::Reshape)
                .unwrap_or(false);
            if is_reshape {
                if let Some(op) = subgraph.op_mut(producer) {
                    op.attrs
                        .insert("lifted_for_depthwise".to_string(), Attribute::Bool(true));
                }
                if let Some(op) = subgraph.op_mut(conv_id) {
                    op.attrs
                        .insert("weight_prereshaped".to_string(), Attribute::Bool(true));
                }
            }
        }
        Ok(())
    }
}

/// Swaps a `Typecast` above an adjacent, single-consumer `Reshape` or
/// `Permute` so later fusions (which match on the op immediately feeding
/// a primary op) can see through the shape-only op to the typecast.
fn lift_up(subgraph: &mut Subgraph, kind: OpKind) {
    let casts: Vec<OpId> = subgraph.ops_of_kind(kind).map(|op| op.id).collect();
    for cast_id in casts {
        let Some(cast) = subgraph.op(cast_id).cloned() else {
            continue;
        };
        let Some(&cast_input) = cast.inputs.first() else {
            continue;
        };
        let Some(producer_id) = subgraph.value(cast_input).and_then(|v| v.producer) else {
            continue;
        };
        let Some(producer) = subgraph.op(producer_id).cloned() else {
            continue;
        };
        if !matches!(producer.kind, OpKind::Reshape | OpKind::Permute) {
            continue;
        }
        if sole_consumer(subgraph, cast_input) != Some(cast_id) {
            continue;
        }

        let orig_src = producer.inputs[0];
        let cast_out = cast.outputs[0];

        // New chain: orig_src -> cast' -> producer' -> cast_out.
        if let Some(op) = subgraph.op_mut(cast_id) {
            op.inputs = vec![orig_src];
            op.outputs = vec![cast_input];
        }
        if let Some(op) = subgraph.op_mut(producer_id) {
            op.inputs = vec![cast_input];
            op.outputs = vec![cast_out];
        }
        if let Some(v) = subgraph.value_mut(cast_input) {
            v.producer = Some(cast_id);
            v.consumers.clear();
            v.consumers.insert(producer_id);
        }
        if let Some(v) = subgraph.value_mut(cast_out) {
            v.producer = Some(producer_id);
        }
        if let Some(v) = subgraph.value_mut(orig_src) {
            v.consumers.remove(&producer_id);
            v.consumers.insert(cast_id);
        }
    }
}

pub struct LiftUpTypecast;

impl Pass for LiftUpTypecast {
    fn name(&self) -> &str {
        "lift_up_typecast"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        lift_up(subgraph, OpKind::Typecast);
        Ok(())
    }
}

pub struct LiftUpQuantize;

impl Pass for LiftUpQuantize {
    fn name(&self) -> &str {
        "lift_up_quantize"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        lift_up(subgraph, OpKind::Quantize);
        Ok(())
    }
}

/// Folds a `Typecast` whose sole consumer is a `MatMul`/`Convolution`
/// into that op's attribute bag (`cast_input_<idx>`), removing the cast
/// node. The kernel-selection layer (out of scope) is expected to pick a
/// mixed-precision implementation based on this attribute.
fn fuse_typecast_into_consumer(subgraph: &mut Subgraph, eligible: impl Fn(OpKind) -> bool) {
    let casts: Vec<OpId> = subgraph.ops_of_kind(OpKind::Typecast).map(|op| op.id).collect();
    for cast_id in casts {
        let Some(cast) = subgraph.op(cast_id).cloned() else {
            continue;
        };
        let cast_out = cast.outputs[0];
        let Some(consumer_id) = sole_consumer(subgraph, cast_out) else {
            continue;
        };
        let Some(consumer) = subgraph.op(consumer_id).cloned() else {
            continue;
        };
        if !eligible(consumer.kind) {
            continue;
        }
        let Some(input_idx) = consumer.inputs.iter().position(|&v| v == cast_out) else {
            continue;
        };
        let cast_input = cast.inputs[0];
        let from_type = subgraph
            .value(cast_input)
            .map(|v| format!("{:?}", v.elem_type))
            .unwrap_or_default();

        if let Some(op) = subgraph.op_mut(consumer_id) {
            op.inputs[input_idx] = cast_input;
            op.attrs.insert(
                format!("cast_input_{}", input_idx),
                Attribute::String(from_type),
            );
        }
        if let Some(v) = subgraph.value_mut(cast_input) {
            v.consumers.insert(consumer_id);
        }
        subgraph.mark_dead(cast_id);
    }
}

pub struct FuseTypecastToMatmulOrConv;

impl Pass for FuseTypecastToMatmulOrConv {
    fn name(&self) -> &str {
        "fuse_typecast_to_matmul_or_conv"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        fuse_typecast_into_consumer(subgraph, |k| {
            matches!(k, OpKind::MatMul | OpKind::Convolution)
        });
        Ok(())
    }
}

pub struct FuseTypecastToAdd;

impl Pass for FuseTypecastToAdd {
    fn name(&self) -> &str {
        "fuse_typecast_to_add"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        fuse_typecast_into_consumer(subgraph, |k| k == OpKind::Binary);
        Ok(())
    }
}

pub struct FuseTypecastToMulScales;

impl Pass for FuseTypecastToMulScales {
    fn name(&self) -> &str {
        "fuse_typecast_to_mul_scales"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        fuse_typecast_into_consumer(subgraph, |k| k == OpKind::ScalesMul);
        Ok(())
    }
}

/// Folds a `Typecast` that immediately follows a primary op (its sole
/// consumer) into the predecessor's output-cast attribute, eliminating
/// the standalone cast — the mirror image of
/// [`fuse_typecast_into_consumer`].
pub struct FusePostTypecastToPredecessor;

impl Pass for FusePostTypecastToPredecessor {
    fn name(&self) -> &str {
        "fuse_post_typecast_to_predecessor"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let casts: Vec<OpId> = subgraph.ops_of_kind(OpKind::Typecast).map(|op| op.id).collect();
        for cast_id in casts {
            let Some(cast) = subgraph.op(cast_id).cloned() else {
                continue;
            };
            let cast_in = cast.inputs[0];
            let Some(pred_id) = subgraph.value(cast_in).and_then(|v| v.producer) else {
                continue;
            };
            let Some(pred) = subgraph.op(pred_id).cloned() else {
                continue;
            };
            if !matches!(
                pred.kind,
                OpKind::MatMul
                    | OpKind::Convolution
                    | OpKind::Eltwise
                    | OpKind::Binary
                    | OpKind::Sum
                    | OpKind::BatchNorm
            ) {
                continue;
            }
            if sole_consumer(subgraph, cast_in) != Some(cast_id) {
                continue;
            }

            let cast_out = cast.outputs[0];
            let to_type = subgraph
                .value(cast_out)
                .map(|v| format!("{:?}", v.elem_type))
                .unwrap_or_default();

            if let Some(op) = subgraph.op_mut(pred_id) {
                op.outputs = vec![cast_out];
                op.attrs
                    .insert("output_cast_to".to_string(), Attribute::String(to_type));
            }
            if let Some(v) = subgraph.value_mut(cast_out) {
                v.producer = Some(pred_id);
            }
            subgraph.mark_dead(cast_id);
        }
        Ok(())
    }
}

/// Marks a `Binary(add)` that sits between a `MatMul` and further
/// consumers as a post-add candidate for the MQA (multi-query attention)
/// fusion pattern; the generic `fuse_post_ops` pass (which runs
/// immediately after, per the fixed Stage-1 order) performs the actual
/// fold once the candidate is tagged.
pub struct LiftUpPostAddForMatmul;

impl Pass for LiftUpPostAddForMatmul {
    fn name(&self) -> &str {
        "lift_up_post_add_for_matmul"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let matmuls: Vec<OpId> = subgraph.ops_of_kind(OpKind::MatMul).map(|op| op.id).collect();
        for mm_id in matmuls {
            let Some(out) = subgraph.op(mm_id).unwrap().outputs.first().copied() else {
                continue;
            };
            if let Some(consumer_id) = sole_consumer(subgraph, out) {
                let is_add = subgraph
                    .op(consumer_id)
                    .map(|op| {
                        op.kind == OpKind::Binary
                            && matches!(op.attrs.get("algorithm"), Some(Attribute::String(s)) if s == "add")
                    })
                    .unwrap_or(false);
                if is_add {
                    if let Some(op) = subgraph.op_mut(mm_id) {
                        op.attrs
                            .insert("mqa_post_add_candidate".to_string(), Attribute::Bool(true));
                    }
                }
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
    use crate::value::{ElementType, Shape};

    /// bf16 input cast up to f32 feeding a matmul: after Stage-1's
    /// typecast-fusion family runs, exactly one matmul op remains,
    /// consuming the original bf16 value directly and recording the
    /// absorbed source type on `cast_input_0`.
    #[test]
    fn typecast_into_matmul_input_fuses_away() {
        let mut sg = Subgraph::new(EngineKind::Cpu, FloatingPointMode::Any, false);
        let bf16_in = sg.declare_value(ElementType::Bf16, Shape::static_dims([4, 4]));
        let f32_in = sg.declare_value(ElementType::F32, Shape::static_dims([4, 4]));
        let b = sg.declare_value(ElementType::F32, Shape::static_dims([4, 4]));
        let mm_out = sg.declare_value(ElementType::F32, Shape::static_dims([4, 4]));
        sg.inputs = vec![bf16_in, b];
        sg.outputs = vec![mm_out];

        let cast_id = sg.fresh_op_id();
        sg.push_op(Op::new(cast_id, OpKind::Typecast, vec![bf16_in], vec![f32_in]));
        let mm_id = sg.fresh_op_id();
        sg.push_op(Op::new(mm_id, OpKind::MatMul, vec![f32_in, b], vec![mm_out]));

        FuseTypecastToMatmulOrConv.run(&mut sg).unwrap();
        sg.compact();

        assert_eq!(sg.op_count(), 1);
        let matmul = sg.ops_in_order().next().unwrap();
        assert_eq!(matmul.kind, OpKind::MatMul);
        assert_eq!(matmul.inputs[0], bf16_in);
        assert_eq!(
            matmul.attrs.get("cast_input_0"),
            Some(&Attribute::String("Bf16".to_string()))
        );
    }
}
