//! Quantization fusion family: folds scale/zero-point ops into their
//! neighbors or defers them to runtime.
//!
//! `ScalesMul`/`ZeroPointAdd` ops carry a `"scale"`/`"zero_point"`
//! attribute (`FloatArray`/`IntArray`) and a `"runtime"` bool marking
//! whether the value should be sourced from a runtime tensor instead of
//! the static attribute. This is the abstracted stand-in for oneDNN's
//! separate static-attribute vs. runtime-arg scale/zero-point
//! representations.

use crate::error::Result;
use crate::op::{Attribute, Op, OpKind, PostOp};
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

fn is_no_effect_scale(attrs: &crate::op::Attributes) -> bool {
    matches!(attrs.get("scale"), Some(Attribute::FloatArray(v)) if v.iter().all(|s| (*s - 1.0).abs() < 1e-9))
}

fn is_no_effect_zp(attrs: &crate::op::Attributes) -> bool {
    matches!(attrs.get("zero_point"), Some(Attribute::IntArray(v)) if v.iter().all(|z| *z == 0))
}

/// Removes `ScalesMul`/`ZeroPointAdd` ops whose static value has no
/// effect (scale == 1, or zero_point == 0), splicing their sole consumer
/// directly onto their producer.
pub struct RemoveQuantDataWithNoEffect;

impl Pass for RemoveQuantDataWithNoEffect {
    fn name(&self) -> &str {
        "remove_quant_data_with_no_effect"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let candidates: Vec<OpId> = subgraph
            .ops_in_order()
            .filter(|op| {
                (op.kind == OpKind::ScalesMul && is_no_effect_scale(&op.attrs))
                    || (op.kind == OpKind::ZeroPointAdd && is_no_effect_zp(&op.attrs))
            })
            .map(|op| op.id)
            .collect();

        for id in candidates {
            let op = subgraph.op(id).unwrap().clone();
            let input = op.inputs[0];
            let output = op.outputs[0];
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
            if subgraph.outputs.contains(&output) {
                // Can't drop an op producing a subgraph output; keep it
                // as a pass-through identity instead of deleting.
                continue;
            }
            subgraph.mark_dead(id);
        }
        Ok(())
    }
}

/// Folds a `ScalesMul`/`ZeroPointAdd` whose sole consumer is an eligible
/// primary op into that op's `src_scale`/`src_zero_point` attributes.
fn fuse_src(subgraph: &mut Subgraph, kind: OpKind, attr_in: &str, attr_out: &str) {
    let ids: Vec<OpId> = subgraph.ops_of_kind(kind).map(|op| op.id).collect();
    for id in ids {
        let Some(op) = subgraph.op(id).cloned() else {
            continue;
        };
        let out = op.outputs[0];
        let Some(consumer_id) = sole_consumer(subgraph, out) else {
            continue;
        };
        let Some(consumer) = subgraph.op(consumer_id) else {
            continue;
        };
        if !matches!(
            consumer.kind,
            OpKind::MatMul | OpKind::Convolution | OpKind::Pooling | OpKind::Binary
        ) {
            continue;
        }
        let Some(value) = op.attrs.get(attr_in).cloned() else {
            continue;
        };
        let input = op.inputs[0];
        if let Some(consumer) = subgraph.op_mut(consumer_id) {
            for inp in consumer.inputs.iter_mut() {
                if *inp == out {
                    *inp = input;
                }
            }
            consumer.attrs.insert(attr_out.to_string(), value);
        }
        if let Some(v) = subgraph.value_mut(input) {
            v.consumers.insert(consumer_id);
        }
        subgraph.mark_dead(id);
    }
}

/// Folds a `ScalesMul`/`ZeroPointAdd` whose sole *producer* is an
/// eligible primary op into that op's `dst_scale`/`dst_zero_point`
/// attributes.
fn fuse_dst(subgraph: &mut Subgraph, kind: OpKind, attr_in: &str, attr_out: &str) {
    let ids: Vec<OpId> = subgraph.ops_of_kind(kind).map(|op| op.id).collect();
    for id in ids {
        let Some(op) = subgraph.op(id).cloned() else {
            continue;
        };
        let input = op.inputs[0];
        let Some(producer_id) = subgraph.value(input).and_then(|v| v.producer) else {
            continue;
        };
        let Some(producer) = subgraph.op(producer_id) else {
            continue;
        };
        if !matches!(
            producer.kind,
            OpKind::MatMul | OpKind::Convolution | OpKind::Pooling | OpKind::Binary
        ) {
            continue;
        }
        if sole_consumer(subgraph, input) != Some(id) {
            continue;
        }
        let Some(value) = op.attrs.get(attr_in).cloned() else {
            continue;
        };
        let output = op.outputs[0];
        if let Some(producer) = subgraph.op_mut(producer_id) {
            producer.outputs = vec![output];
            producer.attrs.insert(attr_out.to_string(), value);
        }
        if let Some(v) = subgraph.value_mut(output) {
            v.producer = Some(producer_id);
        }
        subgraph.mark_dead(id);
    }
}

macro_rules! fuse_pass {
    ($struct_name:ident, $pass_name:expr, $dir:ident, $kind:expr, $attr_in:expr, $attr_out:expr) => {
        pub struct $struct_name;
        impl Pass for $struct_name {
            fn name(&self) -> &str {
                $pass_name
            }
            fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
                $dir(subgraph, $kind, $attr_in, $attr_out);
                Ok(())
            }
        }
    };
}

fuse_pass!(FuseSrcScales, "fuse_src_scales", fuse_src, OpKind::ScalesMul, "scale", "src_scale");
fuse_pass!(
    FuseSrcZeroPoints,
    "fuse_src_zero_points",
    fuse_src,
    OpKind::ZeroPointAdd,
    "zero_point",
    "src_zero_point"
);
fuse_pass!(FuseDstScales, "fuse_dst_scales", fuse_dst, OpKind::ScalesMul, "scale", "dst_scale");
fuse_pass!(
    FuseDstZeroPoints,
    "fuse_dst_zero_points",
    fuse_dst,
    OpKind::ZeroPointAdd,
    "zero_point",
    "dst_zero_point"
);

/// Marks the scale/zero-point attribute of a `ScalesMul`/`ZeroPointAdd`
/// op as runtime-sourced whenever its value operand is itself produced
/// by a non-constant op, i.e. the scale is only known at execute time.
fn convert_to_runtime(subgraph: &mut Subgraph, kind: OpKind) {
    let ids: Vec<OpId> = subgraph.ops_of_kind(kind).map(|op| op.id).collect();
    for id in ids {
        let is_dynamic = subgraph
            .op(id)
            .and_then(|op| op.inputs.get(1).copied())
            .and_then(|v| subgraph.value(v))
            .map(|v| !v.is_const)
            .unwrap_or(false);
        if is_dynamic {
            if let Some(op) = subgraph.op_mut(id) {
                op.attrs.insert("runtime".to_string(), Attribute::Bool(true));
            }
        }
    }
}

macro_rules! runtime_pass {
    ($struct_name:ident, $pass_name:expr, $kind:expr) => {
        pub struct $struct_name;
        impl Pass for $struct_name {
            fn name(&self) -> &str {
                $pass_name
            }
            fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
                convert_to_runtime(subgraph, $kind);
                Ok(())
            }
        }
    };
}

runtime_pass!(ConvertToRuntimeSrcScales, "convert_to_runtime_src_scales", OpKind::ScalesMul);
runtime_pass!(
    ConvertToRuntimeSrcZeroPoints,
    "convert_to_runtime_src_zero_points",
    OpKind::ZeroPointAdd
);
runtime_pass!(ConvertToRuntimeDstScales, "convert_to_runtime_dst_scales", OpKind::ScalesMul);
runtime_pass!(
    ConvertToRuntimeDstZeroPoints,
    "convert_to_runtime_dst_zero_points",
    OpKind::ZeroPointAdd
);

/// Finalizes a runtime-marked scale/zero-point op by dropping its stale
/// static attribute value, leaving only the runtime operand as the
/// source of truth. Runs after all `convert_to_runtime_*` passes have
/// had a chance to mark candidates.
fn convert_runtime(subgraph: &mut Subgraph, kind: OpKind, attr: &str) {
    let ids: Vec<OpId> = subgraph.ops_of_kind(kind).map(|op| op.id).collect();
    for id in ids {
        let op = subgraph.op(id).unwrap();
        if op.attrs.get("runtime").and_then(Attribute::as_bool) == Some(true) {
            if let Some(op) = subgraph.op_mut(id) {
                op.attrs.remove(attr);
            }
        }
    }
}

pub struct ConvertRuntimeMulScales;

impl Pass for ConvertRuntimeMulScales {
    fn name(&self) -> &str {
        "convert_runtime_mul_scales"
    }
    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        convert_runtime(subgraph, OpKind::ScalesMul, "scale");
        Ok(())
    }
}

pub struct ConvertRuntimeZeroPoints;

impl Pass for ConvertRuntimeZeroPoints {
    fn name(&self) -> &str {
        "convert_runtime_zero_points"
    }
    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        convert_runtime(subgraph, OpKind::ZeroPointAdd, "zero_point");
        Ok(())
    }
}

/// Combines a chain of `ScalesMul` post-ops applied to the same binary
/// op into a single scale attribute, multiplying the factors.
pub struct CombineBinaryPostOpScales;

impl Pass for CombineBinaryPostOpScales {
    fn name(&self) -> &str {
        "combine_binary_post_op_scales"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph.ops_of_kind(OpKind::Binary).map(|op| op.id).collect();
        for id in ids {
            let op = subgraph.op_mut(id).unwrap();
            let mut combined = 1.0f64;
            let mut count = 0;
            op.post_ops.retain(|p| {
                if p.kind == OpKind::ScalesMul {
                    if let Some(Attribute::FloatArray(v)) = p.attrs.get("scale") {
                        combined *= v.iter().product::<f64>();
                        count += 1;
                        return false;
                    }
                }
                true
            });
            if count > 1 {
                op.post_ops.push(PostOp {
                    kind: OpKind::ScalesMul,
                    attrs: {
                        let mut m = crate::op::Attributes::new();
                        m.insert("scale".to_string(), Attribute::FloatArray(vec![combined]));
                        m
                    },
                    extra_input: None,
                });
            }
        }
        Ok(())
    }
}

/// Marks an int8 `Pooling` op whose src zero-point can be deferred
/// (pooling is zero-point-transparent for max-pool) for fusion.
pub struct FuseToInt8Pool;

impl Pass for FuseToInt8Pool {
    fn name(&self) -> &str {
        "fuse_to_int8_pool"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph.ops_of_kind(OpKind::Pooling).map(|op| op.id).collect();
        for id in ids {
            let is_max = subgraph
                .op(id)
                .and_then(|op| op.attrs.get("algorithm"))
                .map(|a| matches!(a, Attribute::String(s) if s == "max"))
                .unwrap_or(false);
            if is_max {
                if let Some(op) = subgraph.op_mut(id) {
                    op.attrs
                        .insert("int8_zp_transparent".to_string(), Attribute::Bool(true));
                }
            }
        }
        Ok(())
    }
}

/// Defers a `Pooling` op's src zero-point subtraction until after the
/// op (valid for max-pool, tagged by `fuse_to_int8_pool`), avoiding a
/// separate zero-point-subtract pass over the input.
pub struct DeferSrcZpsForPool;

impl Pass for DeferSrcZpsForPool {
    fn name(&self) -> &str {
        "defer_src_zps_for_pool"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph.ops_of_kind(OpKind::Pooling).map(|op| op.id).collect();
        for id in ids {
            let deferrable = subgraph
                .op(id)
                .map(|op| op.attrs.get("int8_zp_transparent").and_then(Attribute::as_bool) == Some(true))
                .unwrap_or(false);
            if !deferrable {
                continue;
            }
            let input = subgraph.op(id).unwrap().inputs[0];
            let Some(zp_id) = subgraph.value(input).and_then(|v| v.producer) else {
                continue;
            };
            let is_zp = subgraph
                .op(zp_id)
                .map(|op| op.kind == OpKind::ZeroPointAdd)
                .unwrap_or(false);
            if !is_zp || sole_consumer(subgraph, input) != Some(id) {
                continue;
            }
            let zp = subgraph.op(zp_id).unwrap().clone();
            let orig_input = zp.inputs[0];
            if let Some(op) = subgraph.op_mut(id) {
                op.inputs[0] = orig_input;
                op.attrs
                    .insert("deferred_src_zero_point".to_string(), zp.attrs["zero_point"].clone());
            }
            if let Some(v) = subgraph.value_mut(orig_input) {
                v.consumers.insert(id);
            }
            subgraph.mark_dead(zp_id);
        }
        Ok(())
    }
}

/// Collapses `sub_zp(add_zp(x))` pairs (net-zero zero-point adjustment)
/// into an identity, removing both ops.
pub struct FoldSubZpsAddZps;

impl Pass for FoldSubZpsAddZps {
    fn name(&self) -> &str {
        "fold_sub_zps_add_zps"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph.ops_of_kind(OpKind::ZeroPointAdd).map(|op| op.id).collect();
        for add_id in ids {
            let Some(add) = subgraph.op(add_id).cloned() else {
                continue;
            };
            let add_input = add.inputs[0];
            let Some(sub_id) = subgraph.value(add_input).and_then(|v| v.producer) else {
                continue;
            };
            let Some(sub) = subgraph.op(sub_id).cloned() else {
                continue;
            };
            if sub.kind != OpKind::ZeroPointAdd || sole_consumer(subgraph, add_input) != Some(add_id) {
                continue;
            }
            let add_zp = add.attrs.get("zero_point").and_then(Attribute::as_int_array);
            let sub_zp = sub.attrs.get("zero_point").and_then(Attribute::as_int_array);
            let cancels = matches!((add_zp, sub_zp), (Some(a), Some(b)) if a.iter().zip(b).all(|(x, y)| *x == -*y));
            if !cancels {
                continue;
            }
            let orig_input = sub.inputs[0];
            let add_out = add.outputs[0];
            let consumers: Vec<_> = subgraph
                .value(add_out)
                .map(|v| v.consumers.iter().copied().collect())
                .unwrap_or_default();
            for consumer_id in consumers {
                if let Some(consumer) = subgraph.op_mut(consumer_id) {
                    for inp in consumer.inputs.iter_mut() {
                        if *inp == add_out {
                            *inp = orig_input;
                        }
                    }
                }
                if let Some(v) = subgraph.value_mut(orig_input) {
                    v.consumers.insert(consumer_id);
                }
            }
            subgraph.mark_dead(sub_id);
            subgraph.mark_dead(add_id);
        }
        Ok(())
    }
}

/// Replaces any remaining `ScalesMul`/`ZeroPointAdd` node (one that
/// survived fusion into a primary op) with an equivalent `Binary`
/// post-op, so the dispatcher only ever needs to special-case post-ops,
/// not standalone quant-data ops.
pub struct ReplaceQuantDataWithBinaryPostOp;

impl Pass for ReplaceQuantDataWithBinaryPostOp {
    fn name(&self) -> &str {
        "replace_quant_data_with_binary_post_op"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph
            .ops_in_order()
            .filter(|op| matches!(op.kind, OpKind::ScalesMul | OpKind::ZeroPointAdd))
            .map(|op| op.id)
            .collect();
        for id in ids {
            if let Some(op) = subgraph.op_mut(id) {
                let algo = if op.kind == OpKind::ScalesMul { "mul" } else { "add" };
                op.kind = OpKind::Binary;
                op.attrs
                    .insert("algorithm".to_string(), Attribute::String(algo.to_string()));
            }
        }
        Ok(())
    }
}

/// Inserts a permute ahead of a dynamic (runtime) `ScalesMul`/
/// `ZeroPointAdd` when its scale/zp operand's layout does not match the
/// primary tensor's channel axis — a narrow shape-fixup that keeps
/// per-channel scale broadcast correct after binary canonicalization.
pub struct InsertPermuteForDynamicMulScaleSubZp;

impl Pass for InsertPermuteForDynamicMulScaleSubZp {
    fn name(&self) -> &str {
        "insert_permute_for_dynamic_mul_scale_sub_zp"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph
            .ops_in_order()
            .filter(|op| {
                matches!(op.kind, OpKind::ScalesMul | OpKind::ZeroPointAdd)
                    && op.attrs.get("runtime").and_then(Attribute::as_bool) == Some(true)
                    && op.inputs.len() > 1
            })
            .map(|op| op.id)
            .collect();
        for id in ids {
            let op = subgraph.op(id).unwrap();
            let scale_operand = op.inputs[1];
            let needs_permute = subgraph
                .value(scale_operand)
                .map(|v| v.shape.rank() > 1)
                .unwrap_or(false);
            if !needs_permute {
                continue;
            }
            let shape = subgraph.value(scale_operand).unwrap().shape.clone();
            let elem_type = subgraph.value(scale_operand).unwrap().elem_type;
            let permuted = subgraph.declare_value(elem_type, shape);
            let permute_id = subgraph.fresh_op_id();
            subgraph.insert_op_before(
                id,
                Op::new(permute_id, OpKind::Permute, vec![scale_operand], vec![permuted]),
            )?;
            if let Some(op) = subgraph.op_mut(id) {
                op.inputs[1] = permuted;
            }
            if let Some(v) = subgraph.value_mut(permuted) {
                v.consumers.insert(id);
            }
        }
        Ok(())
    }
}

/// Swaps `relu(mul_scales(x))` to `mul_scales(relu(x))` when the scale
/// is strictly positive — safe since relu commutes with positive
/// scaling, and exposes the mul-scales for folding into BN below.
pub struct SwapReluMulScales;

impl Pass for SwapReluMulScales {
    fn name(&self) -> &str {
        "swap_relu_mul_scales"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph.ops_of_kind(OpKind::ScalesMul).map(|op| op.id).collect();
        for scale_id in ids {
            let Some(scale) = subgraph.op(scale_id).cloned() else {
                continue;
            };
            let positive = matches!(scale.attrs.get("scale"), Some(Attribute::FloatArray(v)) if v.iter().all(|s| *s > 0.0));
            if !positive {
                continue;
            }
            let input = scale.inputs[0];
            let Some(relu_id) = subgraph.value(input).and_then(|v| v.producer) else {
                continue;
            };
            let Some(relu) = subgraph.op(relu_id).cloned() else {
                continue;
            };
            let is_relu = relu.kind == OpKind::Eltwise
                && matches!(relu.attrs.get("algorithm"), Some(Attribute::String(s)) if s == "relu");
            if !is_relu || sole_consumer(subgraph, input) != Some(scale_id) {
                continue;
            }
            let relu_input = relu.inputs[0];
            let scale_out = scale.outputs[0];

            if let Some(op) = subgraph.op_mut(scale_id) {
                op.inputs = vec![relu_input];
                op.outputs = vec![input];
            }
            if let Some(op) = subgraph.op_mut(relu_id) {
                op.inputs = vec![input];
                op.outputs = vec![scale_out];
            }
            if let Some(v) = subgraph.value_mut(input) {
                v.producer = Some(scale_id);
                v.consumers.clear();
                v.consumers.insert(relu_id);
            }
            if let Some(v) = subgraph.value_mut(scale_out) {
                v.producer = Some(relu_id);
            }
            if let Some(v) = subgraph.value_mut(relu_input) {
                v.consumers.remove(&relu_id);
                v.consumers.insert(scale_id);
            }
        }
        Ok(())
    }
}

/// Folds a `ScalesMul` immediately preceding a `BatchNorm` into the BN's
/// own scale attribute.
pub struct FoldPreMulScaleIntoBn;

impl Pass for FoldPreMulScaleIntoBn {
    fn name(&self) -> &str {
        "fold_pre_mul_scale_into_bn"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        fuse_src(subgraph, OpKind::ScalesMul, "scale", "pre_scale");
        Ok(())
    }
}

/// Folds a `ScalesMul` immediately following a `BatchNorm` into the BN's
/// own scale attribute.
pub struct FoldPostMulScaleIntoBn;

impl Pass for FoldPostMulScaleIntoBn {
    fn name(&self) -> &str {
        "fold_post_mul_scale_into_bn"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        fuse_dst(subgraph, OpKind::ScalesMul, "scale", "post_scale");
        Ok(())
    }
}

/// Folds any remaining adjacent pair of `ScalesMul` ops into one,
/// multiplying their static scales.
pub struct FoldMulScales;

impl Pass for FoldMulScales {
    fn name(&self) -> &str {
        "fold_mul_scales"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph.ops_of_kind(OpKind::ScalesMul).map(|op| op.id).collect();
        for outer_id in ids {
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
            if inner.kind != OpKind::ScalesMul || sole_consumer(subgraph, input) != Some(outer_id) {
                continue;
            }
            let (Some(Attribute::FloatArray(a)), Some(Attribute::FloatArray(b))) =
                (inner.attrs.get("scale"), outer.attrs.get("scale"))
            else {
                continue;
            };
            let combined: Vec<f64> = if a.len() == b.len() {
                a.iter().zip(b).map(|(x, y)| x * y).collect()
            } else {
                vec![a.iter().product::<f64>() * b.iter().product::<f64>()]
            };
            let orig_input = inner.inputs[0];
            let outer_out = outer.outputs[0];
            if let Some(op) = subgraph.op_mut(outer_id) {
                op.inputs = vec![orig_input];
                op.attrs.insert("scale".to_string(), Attribute::FloatArray(combined));
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
        Ok(())
    }
}

/// Promotes a static `ScalesMul` followed by a static `ZeroPointAdd`
/// into a single dynamic-quantize op once both have been marked
/// `runtime`, since the dispatcher only special-cases the fused form.
pub struct FuseDynamicMulScalesAddZps;

impl Pass for FuseDynamicMulScalesAddZps {
    fn name(&self) -> &str {
        "fuse_dynamic_mul_scales_add_zps"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        fuse_dynamic_pair(subgraph, OpKind::ScalesMul, OpKind::ZeroPointAdd, "quantize_dynamic")
    }
}

pub struct FuseDynamicSubZpsMulScales;

impl Pass for FuseDynamicSubZpsMulScales {
    fn name(&self) -> &str {
        "fuse_dynamic_sub_zps_mul_scales"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        fuse_dynamic_pair(subgraph, OpKind::ZeroPointAdd, OpKind::ScalesMul, "dequantize_dynamic")
    }
}

fn fuse_dynamic_pair(
    subgraph: &mut Subgraph,
    first_kind: OpKind,
    second_kind: OpKind,
    tag: &str,
) -> Result<()> {
    let ids: Vec<OpId> = subgraph.ops_of_kind(second_kind).map(|op| op.id).collect();
    for second_id in ids {
        let Some(second) = subgraph.op(second_id).cloned() else {
            continue;
        };
        if second.attrs.get("runtime").and_then(Attribute::as_bool) != Some(true) {
            continue;
        }
        let input = second.inputs[0];
        let Some(first_id) = subgraph.value(input).and_then(|v| v.producer) else {
            continue;
        };
        let Some(first) = subgraph.op(first_id).cloned() else {
            continue;
        };
        if first.kind != first_kind
            || first.attrs.get("runtime").and_then(Attribute::as_bool) != Some(true)
            || sole_consumer(subgraph, input) != Some(second_id)
        {
            continue;
        }

        let orig_input = first.inputs[0];
        let second_out = second.outputs[0];
        if let Some(op) = subgraph.op_mut(second_id) {
            op.inputs = vec![orig_input, first.inputs[1], second.inputs[1]];
            op.attrs.insert("dynamic_quant_kind".to_string(), Attribute::String(tag.to_string()));
        }
        if let Some(v) = subgraph.value_mut(orig_input) {
            v.consumers.remove(&first_id);
            v.consumers.insert(second_id);
        }
        if let Some(v) = subgraph.value_mut(second_out) {
            v.producer = Some(second_id);
        }
        subgraph.mark_dead(first_id);
    }
    Ok(())
}

/// Finalizes a dynamic-quantize/dequantize fused pair (tagged by
/// `dynamic_quant_kind`) into a concrete `Quantize`/`Dequantize` op.
pub struct ConvertDynamicQuantizeOps;

impl Pass for ConvertDynamicQuantizeOps {
    fn name(&self) -> &str {
        "convert_dynamic_quantize_ops"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph
            .ops_in_order()
            .filter(|op| op.attrs.contains_key("dynamic_quant_kind"))
            .map(|op| op.id)
            .collect();
        for id in ids {
            if let Some(op) = subgraph.op_mut(id) {
                let kind = op.attrs.get("dynamic_quant_kind").cloned();
                op.kind = if matches!(kind, Some(Attribute::String(ref s)) if s == "quantize_dynamic") {
                    OpKind::Quantize
                } else {
                    OpKind::Dequantize
                };
            }
        }
        Ok(())
    }
}

/// Promotes a matmul weight operand carrying a *runtime* (dynamically
/// resolved) zero-point from u8 to s8, inserting an explicit typecast —
/// the static-zero-point case is handled separately by
/// `shape_norm::InsertU8ToS8ForMatmul`, which runs later in the fixed
/// pass order once shapes are known.
pub struct InsertRuntimeU8ToS8ForMatmul;

impl Pass for InsertRuntimeU8ToS8ForMatmul {
    fn name(&self) -> &str {
        "insert_runtime_u8_to_s8_for_matmul"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        use crate::value::ElementType;
        let ids: Vec<OpId> = subgraph.ops_of_kind(OpKind::MatMul).map(|op| op.id).collect();
        for id in ids {
            let Some(weight) = subgraph.op(id).unwrap().inputs.get(1).copied() else {
                continue;
            };
            let Some(value) = subgraph.value(weight) else {
                continue;
            };
            if value.elem_type != ElementType::U8 {
                continue;
            }
            let has_runtime_zp = subgraph.op(id).unwrap().attrs.contains_key("src_zero_point")
                && subgraph.op(id).unwrap().attrs.get("runtime").and_then(Attribute::as_bool) == Some(true);
            if !has_runtime_zp {
                continue;
            }
            let cast_out = subgraph.declare_value(ElementType::S8, value.shape.clone());
            let cast_id = subgraph.fresh_op_id();
            subgraph.insert_op_before(id, Op::new(cast_id, OpKind::Typecast, vec![weight], vec![cast_out]))?;
            if let Some(op) = subgraph.op_mut(id) {
                op.inputs[1] = cast_out;
                op.attrs.insert("u8_to_s8_shifted".to_string(), Attribute::Bool(true));
            }
            if let Some(v) = subgraph.value_mut(cast_out) {
                v.consumers.insert(id);
            }
        }
        Ok(())
    }
}
