//! Algebraic fusion (N-to-1) family, plus generic post-op folding
//! (`fuse_post_ops`).
//!
//! Eltwise/Binary ops carry an `"algorithm"` string attribute (e.g.
//! `"reciprocal"`, `"sigmoid"`, `"mul"`, `"add"`) that these passes match
//! against; this is the abstracted stand-in for oneDNN's algorithm enum.

use crate::error::Result;
use crate::op::{Attribute, Op, OpKind, PostOp};
use crate::pass::{Pass, Transactionality};
use crate::subgraph::Subgraph;
use crate::value::OpId;

fn algorithm(op: &crate::op::Op) -> Option<&str> {
    match op.attrs.get("algorithm") {
        Some(Attribute::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

fn sole_consumer(subgraph: &Subgraph, value_id: crate::value::ValueId) -> Option<OpId> {
    let value = subgraph.value(value_id)?;
    if value.consumers.len() == 1 && !subgraph.outputs.contains(&value_id) {
        value.consumers.iter().copied().next()
    } else {
        None
    }
}

/// `reciprocal(x) * y` → `y / x`, whenever the reciprocal's output feeds
/// exactly one multiply and is not itself a subgraph output.
pub struct FuseReciprocalMulToDiv;

impl Pass for FuseReciprocalMulToDiv {
    fn name(&self) -> &str {
        "fuse_reciprocal_mul_to_div"
    }

    fn transactionality(&self) -> Transactionality {
        Transactionality::Transactional
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let candidates: Vec<_> = subgraph
            .ops_of_kind(OpKind::Eltwise)
            .filter(|op| algorithm(op) == Some("reciprocal"))
            .filter_map(|op| {
                let out = *op.outputs.first()?;
                let consumer = sole_consumer(subgraph, out)?;
                let consumer_op = subgraph.op(consumer)?;
                if consumer_op.kind == OpKind::Binary && algorithm(consumer_op) == Some("mul") {
                    Some((op.id, consumer))
                } else {
                    None
                }
            })
            .collect();

        for (recip_id, mul_id) in candidates {
            let recip_input = subgraph.op(recip_id).unwrap().inputs[0];
            let recip_output = subgraph.op(recip_id).unwrap().outputs[0];
            let mul_op = subgraph.op(mul_id).unwrap().clone();
            let other_operand = mul_op
                .inputs
                .iter()
                .copied()
                .find(|&v| v != recip_output)
                .unwrap_or(recip_output);

            if let Some(div_op) = subgraph.op_mut(mul_id) {
                div_op.kind = OpKind::Binary;
                div_op
                    .attrs
                    .insert("algorithm".to_string(), Attribute::String("div".to_string()));
                div_op.inputs = vec![other_operand, recip_input];
            }
            subgraph.mark_dead(recip_id);
            if let Some(v) = subgraph.value_mut(recip_output) {
                v.consumers.remove(&mul_id);
            }
        }
        Ok(())
    }
}

/// `x * sigmoid(x)` → `swish(x)`.
pub struct FuseMulSigmoidToSwish;

impl Pass for FuseMulSigmoidToSwish {
    fn name(&self) -> &str {
        "fuse_mul_sigmoid_to_swish"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let candidates: Vec<_> = subgraph
            .ops_of_kind(OpKind::Eltwise)
            .filter(|op| algorithm(op) == Some("sigmoid"))
            .filter_map(|op| {
                let sig_input = *op.inputs.first()?;
                let sig_output = *op.outputs.first()?;
                let consumer = sole_consumer(subgraph, sig_output)?;
                let consumer_op = subgraph.op(consumer)?;
                if consumer_op.kind == OpKind::Binary
                    && algorithm(consumer_op) == Some("mul")
                    && consumer_op.inputs.contains(&sig_input)
                {
                    Some((op.id, sig_input, consumer))
                } else {
                    None
                }
            })
            .collect();

        for (sig_id, sig_input, mul_id) in candidates {
            let mul_output = subgraph.op(mul_id).unwrap().outputs[0];
            subgraph.mark_dead(mul_id);
            let swish_id = subgraph.fresh_op_id();
            let mut swish = Op::new(swish_id, OpKind::Eltwise, vec![sig_input], vec![mul_output]);
            swish
                .attrs
                .insert("algorithm".to_string(), Attribute::String("swish".to_string()));
            subgraph.insert_op_before(sig_id, swish)?;
            subgraph.mark_dead(sig_id);
        }
        Ok(())
    }
}

/// Collapses a chain of `add` binaries (A+B, (A+B)+C, ...) into a single
/// `Sum` op over all operands.
pub struct FuseToSum;

impl Pass for FuseToSum {
    fn name(&self) -> &str {
        "fuse_to_dnnl_sum"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let adds: Vec<OpId> = subgraph
            .ops_of_kind(OpKind::Binary)
            .filter(|op| algorithm(op) == Some("add"))
            .map(|op| op.id)
            .collect();

        for add_id in adds {
            let op = match subgraph.op(add_id) {
                Some(op) if !op.dead => op.clone(),
                _ => continue,
            };
            // Only chase a chain if one operand is itself a live add whose
            // output is consumed solely by this op.
            let mut operands = Vec::new();
            let mut chain = Vec::new();
            let mut frontier = op.inputs.clone();
            chain.push(add_id);

            // Greedily absorb a left-leaning chain of adds.
            if let Some(&first) = frontier.first() {
                if let Some(producer_id) = subgraph.value(first).and_then(|v| v.producer) {
                    if producer_id != add_id {
                        if let Some(producer) = subgraph.op(producer_id) {
                            if producer.kind == OpKind::Binary
                                && algorithm(producer) == Some("add")
                                && sole_consumer(subgraph, first) == Some(add_id)
                            {
                                operands.extend(producer.inputs.clone());
                                chain.insert(0, producer_id);
                                frontier.remove(0);
                            }
                        }
                    }
                }
            }
            if chain.len() < 2 {
                continue;
            }
            operands.extend(frontier);

            let out = op.outputs[0];
            let sum_id = subgraph.fresh_op_id();
            let sum_op = Op::new(sum_id, OpKind::Sum, operands, vec![out]);
            subgraph.insert_op_before(add_id, sum_op)?;
            for id in chain {
                subgraph.mark_dead(id);
            }
        }
        Ok(())
    }
}

/// `Reshape -> Permute -> Reshape` collapses to a single `Shuffle` op
/// when the middle permute only exchanges the split group axis.
pub struct FuseToShuffle;

impl Pass for FuseToShuffle {
    fn name(&self) -> &str {
        "fuse_to_shuffle"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let reshapes: Vec<OpId> = subgraph.ops_of_kind(OpKind::Reshape).map(|op| op.id).collect();
        for first_id in reshapes {
            let first = match subgraph.op(first_id) {
                Some(op) if !op.dead => op.clone(),
                _ => continue,
            };
            let first_out = first.outputs[0];
            let Some(mid_id) = sole_consumer(subgraph, first_out) else {
                continue;
            };
            let Some(mid) = subgraph.op(mid_id).cloned() else {
                continue;
            };
            if mid.kind != OpKind::Permute {
                continue;
            }
            let mid_out = mid.outputs[0];
            let Some(last_id) = sole_consumer(subgraph, mid_out) else {
                continue;
            };
            let Some(last) = subgraph.op(last_id).cloned() else {
                continue;
            };
            if last.kind != OpKind::Reshape {
                continue;
            }

            let shuffle_id = subgraph.fresh_op_id();
            let mut shuffle = Op::new(
                shuffle_id,
                OpKind::Shuffle,
                vec![first.inputs[0]],
                vec![last.outputs[0]],
            );
            shuffle.attrs = mid.attrs.clone();
            subgraph.insert_op_before(first_id, shuffle)?;
            subgraph.mark_dead(first_id);
            subgraph.mark_dead(mid_id);
            subgraph.mark_dead(last_id);
        }
        Ok(())
    }
}

/// Marks an int8 `Concat` whose every input is produced by a `Quantize`
/// op as fusable — the concat kernel can then read pre-scale inputs
/// directly instead of materializing dequantized intermediates.
pub struct FuseToInt8Concat;

impl Pass for FuseToInt8Concat {
    fn name(&self) -> &str {
        "fuse_to_int8_concat"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let concats: Vec<OpId> = subgraph.ops_of_kind(OpKind::Concat).map(|op| op.id).collect();
        for id in concats {
            let all_quantized = subgraph
                .op(id)
                .unwrap()
                .inputs
                .iter()
                .all(|&v| {
                    subgraph
                        .value(v)
                        .and_then(|val| val.producer)
                        .and_then(|p| subgraph.op(p))
                        .map(|op| op.kind == OpKind::Quantize)
                        .unwrap_or(false)
                });
            if all_quantized {
                if let Some(op) = subgraph.op_mut(id) {
                    op.attrs
                        .insert("fused_int8".to_string(), Attribute::Bool(true));
                }
            }
        }
        Ok(())
    }
}

/// Generic post-op folding: if a primary op's sole output feeds exactly
/// one consumer that is post-op eligible (`Eltwise`/`Sum`/`Binary`) and
/// that consumer is not a subgraph output, the consumer is appended to
/// the primary op's post-op chain and removed from the graph. Runs twice
/// in the full pipeline to catch post-ops newly created by quantization
/// fusion.
pub struct FusePostOps;

impl Pass for FusePostOps {
    fn name(&self) -> &str {
        "fuse_post_ops"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let primaries: Vec<OpId> = subgraph
            .ops_in_order()
            .filter(|op| {
                matches!(
                    op.kind,
                    OpKind::MatMul | OpKind::Convolution | OpKind::Pooling | OpKind::BatchNorm
                )
            })
            .map(|op| op.id)
            .collect();

        for primary_id in primaries {
            loop {
                let primary = match subgraph.op(primary_id) {
                    Some(op) if !op.dead => op.clone(),
                    _ => break,
                };
                let Some(&out) = primary.outputs.first() else {
                    break;
                };
                let Some(consumer_id) = sole_consumer(subgraph, out) else {
                    break;
                };
                let Some(consumer) = subgraph.op(consumer_id).cloned() else {
                    break;
                };
                if !consumer.kind.is_postop_eligible() {
                    break;
                }

                let extra_input = consumer.inputs.iter().copied().find(|&v| v != out);
                let new_out = consumer.outputs[0];

                if let Some(op) = subgraph.op_mut(primary_id) {
                    op.outputs = vec![new_out];
                    op.post_ops.push(PostOp {
                        kind: consumer.kind,
                        attrs: consumer.attrs.clone(),
                        extra_input,
                    });
                }
                if let Some(v) = subgraph.value_mut(new_out) {
                    v.producer = Some(primary_id);
                }
                subgraph.mark_dead(consumer_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subgraph::{EngineKind, FloatingPointMode};
    use crate::value::{ElementType, Shape};

    fn fresh_sg() -> Subgraph {
        Subgraph::new(EngineKind::Cpu, FloatingPointMode::Any, false)
    }

    #[test]
    fn reciprocal_mul_becomes_div() {
        let mut sg = fresh_sg();
        let x = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        let y = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        let recip_out = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        let mul_out = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        sg.inputs = vec![x, y];
        sg.outputs = vec![mul_out];

        let recip_id = sg.fresh_op_id();
        let mut recip = Op::new(recip_id, OpKind::Eltwise, vec![x], vec![recip_out]);
        recip
            .attrs
            .insert("algorithm".into(), Attribute::String("reciprocal".into()));
        sg.push_op(recip);

        let mul_id = sg.fresh_op_id();
        let mut mul = Op::new(mul_id, OpKind::Binary, vec![recip_out, y], vec![mul_out]);
        mul.attrs
            .insert("algorithm".into(), Attribute::String("mul".into()));
        sg.push_op(mul);

        FuseReciprocalMulToDiv.run(&mut sg).unwrap();
        sg.compact();

        assert_eq!(sg.op_count(), 1);
        let div = sg.ops_in_order().next().unwrap();
        assert_eq!(div.kind, OpKind::Binary);
        assert_eq!(algorithm(div), Some("div"));
    }

    #[test]
    fn fuse_post_ops_is_idempotent() {
        let mut sg = fresh_sg();
        let a = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        let b = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        let mm_out = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        let relu_out = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        sg.inputs = vec![a, b];
        sg.outputs = vec![relu_out];

        let mm_id = sg.fresh_op_id();
        sg.push_op(Op::new(mm_id, OpKind::MatMul, vec![a, b], vec![mm_out]));
        let relu_id = sg.fresh_op_id();
        let mut relu = Op::new(relu_id, OpKind::Eltwise, vec![mm_out], vec![relu_out]);
        relu.attrs
            .insert("algorithm".into(), Attribute::String("relu".into()));
        sg.push_op(relu);

        FusePostOps.run(&mut sg).unwrap();
        sg.compact();
        let once = sg.op_count();
        FusePostOps.run(&mut sg).unwrap();
        sg.compact();
        assert_eq!(once, sg.op_count());
        assert_eq!(sg.op_count(), 1);
        assert_eq!(sg.ops_in_order().next().unwrap().post_ops.len(), 1);
    }
}
