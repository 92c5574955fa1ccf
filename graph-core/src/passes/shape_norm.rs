//! Shape-normalization family: inserts the unsqueeze/squeeze/permute/
//! reshape/to-group wrapper ops specific kernels require around their
//! primary op, and canonicalizes backward-pass op variants into a single
//! forward-compatible attribute shape.

use crate::error::Result;
use crate::op::{Attribute, Op, OpKind};
use crate::pass::Pass;
use crate::subgraph::Subgraph;
use crate::value::{ElementType, OpId, Shape};

fn wrap_input(subgraph: &mut Subgraph, op_id: OpId, input_idx: usize, wrap_kind: OpKind, attrs: crate::op::Attributes) {
    let Some(input) = subgraph.op(op_id).unwrap().inputs.get(input_idx).copied() else {
        return;
    };
    let Some(shape) = subgraph.value(input).map(|v| v.shape.clone()) else {
        return;
    };
    let elem_type = subgraph.value(input).unwrap().elem_type;
    let wrapped_shape = match wrap_kind {
        OpKind::Unsqueeze => {
            let mut dims = shape.static_dims_vec();
            dims.insert(0, 1);
            Shape::static_dims(dims)
        }
        OpKind::Squeeze => {
            let mut dims = shape.static_dims_vec();
            if dims.first() == Some(&1) {
                dims.remove(0);
            }
            Shape::static_dims(dims)
        }
        _ => shape,
    };
    let new_value = subgraph.declare_value(elem_type, wrapped_shape);
    let wrap_id = subgraph.fresh_op_id();
    let op = Op::new(wrap_id, wrap_kind, vec![input], vec![new_value]).with_attrs(attrs);
    let _ = subgraph.insert_op_before(op_id, op);
    if let Some(op) = subgraph.op_mut(op_id) {
        op.inputs[input_idx] = new_value;
    }
    if let Some(v) = subgraph.value_mut(new_value) {
        v.consumers.insert(op_id);
    }
}

fn wrap_output(subgraph: &mut Subgraph, op_id: OpId, unwrap_kind: OpKind) {
    let out = subgraph.op(op_id).unwrap().outputs[0];
    let Some(final_shape) = subgraph.value(out).map(|v| v.shape.clone()) else {
        return;
    };
    let elem_type = subgraph.value(out).unwrap().elem_type;
    let internal_shape = match unwrap_kind {
        OpKind::Squeeze => {
            let mut dims = final_shape.static_dims_vec();
            dims.insert(0, 1);
            Shape::static_dims(dims)
        }
        _ => final_shape,
    };
    let internal = subgraph.declare_value(elem_type, internal_shape);
    let unwrap_id = subgraph.fresh_op_id();
    if let Some(op) = subgraph.op_mut(op_id) {
        op.outputs = vec![internal];
    }
    if let Some(v) = subgraph.value_mut(internal) {
        v.producer = Some(op_id);
    }
    subgraph.push_op(Op::new(unwrap_id, unwrap_kind, vec![internal], vec![out]));
    if let Some(v) = subgraph.value_mut(out) {
        v.producer = Some(unwrap_id);
    }
}

/// Wraps a `Reduction` op's input with an `Unsqueeze` and its output with
/// a matching `Squeeze` when `keep_dims` is false, so the kernel always
/// sees a reduction that preserves rank.
pub struct InsertUnsqueezeAndSqueezeForReduction;

impl Pass for InsertUnsqueezeAndSqueezeForReduction {
    fn name(&self) -> &str {
        "insert_unsqueeze_and_squeeze_for_reduction"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph
            .ops_of_kind(OpKind::Reduction)
            .filter(|op| {
                op.attrs.get("keep_dims").and_then(Attribute::as_bool) != Some(true)
                    && op.attrs.get("rank_normalized").and_then(Attribute::as_bool) != Some(true)
            })
            .map(|op| op.id)
            .collect();
        for id in ids {
            wrap_output(subgraph, id, OpKind::Squeeze);
            if let Some(op) = subgraph.op_mut(id) {
                op.attrs.insert("rank_normalized".to_string(), Attribute::Bool(true));
            }
        }
        Ok(())
    }
}

/// Promotes a matmul weight operand with a *static* zero-point from u8
/// to s8, baking the shift directly into the weight's constant bytes at
/// compile time (signalled via `u8_to_s8_shifted`, consumed by the
/// constant-folding side of the compiler).
pub struct InsertU8ToS8ForMatmul;

impl Pass for InsertU8ToS8ForMatmul {
    fn name(&self) -> &str {
        "insert_u8_to_s8_for_matmul"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph.ops_of_kind(OpKind::MatMul).map(|op| op.id).collect();
        for id in ids {
            let Some(weight) = subgraph.op(id).unwrap().inputs.get(1).copied() else {
                continue;
            };
            let Some(value) = subgraph.value(weight) else {
                continue;
            };
            if value.elem_type != ElementType::U8 || !value.is_const {
                continue;
            }
            if subgraph.op(id).unwrap().attrs.contains_key("u8_to_s8_shifted") {
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

/// Inserts a `Permute` on a matmul's weight input when its layout tag
/// requests transposed storage (`attrs["weight_transposed"]`), so the
/// kernel always receives row-major operands.
pub struct InsertPermuteForMatmul;

impl Pass for InsertPermuteForMatmul {
    fn name(&self) -> &str {
        "insert_permute_for_matmul"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph
            .ops_of_kind(OpKind::MatMul)
            .filter(|op| op.attrs.get("weight_transposed").and_then(Attribute::as_bool) == Some(true))
            .map(|op| op.id)
            .collect();
        for id in ids {
            let mut attrs = crate::op::Attributes::new();
            attrs.insert("perm".to_string(), Attribute::IntArray(vec![1, 0]));
            wrap_input(subgraph, id, 1, OpKind::Permute, attrs);
            if let Some(op) = subgraph.op_mut(id) {
                op.attrs.remove("weight_transposed");
            }
        }
        Ok(())
    }
}

/// Collapses an n-D (n > 2) matmul operand down to 2-D via `Reshape`
/// when the kernel only implements the 2-D GEMM form, wrapping the
/// output with the inverse reshape.
pub struct InsertReshapeForNdx2dMatmul;

impl Pass for InsertReshapeForNdx2dMatmul {
    fn name(&self) -> &str {
        "insert_reshape_for_ndx2d_matmul"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph
            .ops_of_kind(OpKind::MatMul)
            .filter(|op| op.attrs.get("force_2d_gemm").and_then(Attribute::as_bool) == Some(true))
            .map(|op| op.id)
            .collect();
        for id in ids {
            let Some(input) = subgraph.op(id).unwrap().inputs.first().copied() else {
                continue;
            };
            let Some(value) = subgraph.value(input) else { continue };
            if value.shape.rank() <= 2 {
                continue;
            }
            let dims = value.shape.static_dims_vec();
            let (batch, last) = dims.split_at(dims.len() - 1);
            let flat_rows: i64 = batch.iter().product();
            let flat_shape = Shape::static_dims(vec![flat_rows, last[0]]);
            let elem_type = value.elem_type;
            let flat = subgraph.declare_value(elem_type, flat_shape);
            let reshape_id = subgraph.fresh_op_id();
            subgraph.insert_op_before(id, Op::new(reshape_id, OpKind::Reshape, vec![input], vec![flat]))?;
            if let Some(op) = subgraph.op_mut(id) {
                op.inputs[0] = flat;
            }
            if let Some(v) = subgraph.value_mut(flat) {
                v.consumers.insert(id);
            }
        }
        Ok(())
    }
}

/// Wraps a bias vector with `Unsqueeze`/`Squeeze` so a rank-1 bias
/// broadcasts against a matmul output of any rank without a dedicated
/// broadcast kernel path.
pub struct InsertUnsqueezeAndSqueezeForMatmul;

impl Pass for InsertUnsqueezeAndSqueezeForMatmul {
    fn name(&self) -> &str {
        "insert_unsqueeze_and_squeeze_for_matmul"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph
            .ops_of_kind(OpKind::MatMul)
            .filter(|op| op.attrs.get("has_bias").and_then(Attribute::as_bool) == Some(true))
            .map(|op| op.id)
            .collect();
        for id in ids {
            let bias_idx = subgraph.op(id).unwrap().inputs.len() - 1;
            let Some(bias) = subgraph.op(id).unwrap().inputs.get(bias_idx).copied() else {
                continue;
            };
            let rank = subgraph.value(bias).map(|v| v.shape.rank()).unwrap_or(0);
            if rank != 1 {
                continue;
            }
            wrap_input(subgraph, id, bias_idx, OpKind::Unsqueeze, crate::op::Attributes::new());
        }
        Ok(())
    }
}

fn unsqueeze_prelu_slope(subgraph: &mut Subgraph, op_id: OpId, input_idx: usize) {
    wrap_input(subgraph, op_id, input_idx, OpKind::Unsqueeze, crate::op::Attributes::new());
}

/// Unsqueezes a PReLU's per-channel slope operand to match the data
/// tensor's rank.
pub struct InsertUnsqueezeForPrelu;

impl Pass for InsertUnsqueezeForPrelu {
    fn name(&self) -> &str {
        "insert_unsqueeze_for_prelu"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph
            .ops_of_kind(OpKind::Eltwise)
            .filter(|op| matches!(op.attrs.get("algorithm"), Some(Attribute::String(s)) if s == "prelu"))
            .map(|op| op.id)
            .collect();
        for id in ids {
            unsqueeze_prelu_slope(subgraph, id, 1);
        }
        Ok(())
    }
}

/// Same wrapping for the backward (gradient) PReLU variant, which also
/// needs the output-gradient's slope-gradient unsqueezed before the
/// reduction that sums it back down to the slope's original rank.
pub struct InsertUnsqueezeAndSqueezeForPreluBwd;

impl Pass for InsertUnsqueezeAndSqueezeForPreluBwd {
    fn name(&self) -> &str {
        "insert_unsqueeze_and_squeeze_for_prelu_bwd"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph
            .ops_of_kind(OpKind::Eltwise)
            .filter(|op| matches!(op.attrs.get("algorithm"), Some(Attribute::String(s)) if s == "prelu_bwd"))
            .map(|op| op.id)
            .collect();
        for id in ids {
            unsqueeze_prelu_slope(subgraph, id, 1);
            wrap_output(subgraph, id, OpKind::Squeeze);
        }
        Ok(())
    }
}

/// Inserts a `Permute` to move a convolution/deconvolution's channel
/// axis into the position the kernel's blocked layout expects
/// (`attrs["data_format"] == "NHWC"` needs converting to the kernel's
/// native NCHW-equivalent working layout).
pub struct InsertPermuteForConvOrDeconv;

impl Pass for InsertPermuteForConvOrDeconv {
    fn name(&self) -> &str {
        "insert_permute_for_conv_or_deconv"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph
            .ops_of_kind(OpKind::Convolution)
            .filter(|op| matches!(op.attrs.get("data_format"), Some(Attribute::String(s)) if s == "NHWC"))
            .map(|op| op.id)
            .collect();
        for id in ids {
            let rank = subgraph
                .value(subgraph.op(id).unwrap().inputs[0])
                .map(|v| v.shape.rank())
                .unwrap_or(4);
            let mut perm = vec![0i64, rank as i64 - 1];
            perm.extend((1..rank as i64 - 1).collect::<Vec<_>>());
            let mut attrs = crate::op::Attributes::new();
            attrs.insert("perm".to_string(), Attribute::IntArray(perm));
            wrap_input(subgraph, id, 0, OpKind::Permute, attrs);
            if let Some(op) = subgraph.op_mut(id) {
                op.attrs
                    .insert("data_format".to_string(), Attribute::String("NCHW".to_string()));
            }
        }
        Ok(())
    }
}

/// Narrower version of the conv/deconv permute fixup for ops that only
/// consume a data-format tag without the rest of conv's weight/bias
/// shape machinery (`Pooling`, `BatchNorm`).
pub struct InsertPermuteForOpOnlyRequireDataFormat;

impl Pass for InsertPermuteForOpOnlyRequireDataFormat {
    fn name(&self) -> &str {
        "insert_permute_for_op_only_require_data_format"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph
            .ops_in_order()
            .filter(|op| matches!(op.kind, OpKind::Pooling | OpKind::BatchNorm))
            .filter(|op| matches!(op.attrs.get("data_format"), Some(Attribute::String(s)) if s == "NHWC"))
            .map(|op| op.id)
            .collect();
        for id in ids {
            let rank = subgraph
                .value(subgraph.op(id).unwrap().inputs[0])
                .map(|v| v.shape.rank())
                .unwrap_or(4);
            let mut perm = vec![0i64, rank as i64 - 1];
            perm.extend((1..rank as i64 - 1).collect::<Vec<_>>());
            let mut attrs = crate::op::Attributes::new();
            attrs.insert("perm".to_string(), Attribute::IntArray(perm));
            wrap_input(subgraph, id, 0, OpKind::Permute, attrs);
            if let Some(op) = subgraph.op_mut(id) {
                op.attrs
                    .insert("data_format".to_string(), Attribute::String("NCHW".to_string()));
            }
        }
        Ok(())
    }
}

/// Wraps a grouped convolution's weight tensor with a `ToGroup` op that
/// reinterprets the leading output-channel dimension as `(groups,
/// out_channels/groups)`, matching the kernel's grouped-weight layout.
pub struct InsertToGroupForConvOrDeconv;

impl Pass for InsertToGroupForConvOrDeconv {
    fn name(&self) -> &str {
        "insert_to_group_for_conv_or_deconv"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph
            .ops_of_kind(OpKind::Convolution)
            .filter(|op| op.attrs.get("groups").and_then(Attribute::as_int).unwrap_or(1) > 1)
            .map(|op| op.id)
            .collect();
        for id in ids {
            let groups = subgraph.op(id).unwrap().attrs.get("groups").and_then(Attribute::as_int).unwrap();
            let mut attrs = crate::op::Attributes::new();
            attrs.insert("groups".to_string(), Attribute::Int(groups));
            wrap_input(subgraph, id, 1, OpKind::ToGroup, attrs);
        }
        Ok(())
    }
}

fn canonicalize_bwd(subgraph: &mut Subgraph, algorithm: &str, fwd_algorithm: &str) {
    let ids: Vec<OpId> = subgraph
        .ops_in_order()
        .filter(|op| matches!(op.attrs.get("algorithm"), Some(Attribute::String(s)) if s == algorithm))
        .map(|op| op.id)
        .collect();
    for id in ids {
        if let Some(op) = subgraph.op_mut(id) {
            op.attrs
                .insert("fwd_algorithm".to_string(), Attribute::String(fwd_algorithm.to_string()));
            op.attrs.insert("is_backward".to_string(), Attribute::Bool(true));
        }
    }
}

/// Tags a `conv_bwd_data` op with its forward algorithm so the kernel
/// compiler can share weight-layout logic with the forward pass.
pub struct ConvBwdDataCanonicalization;

impl Pass for ConvBwdDataCanonicalization {
    fn name(&self) -> &str {
        "conv_bwd_data_canonicalization"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        canonicalize_bwd(subgraph, "conv_bwd_data", "convolution");
        Ok(())
    }
}

pub struct ConvBwdWeightsCanonicalization;

impl Pass for ConvBwdWeightsCanonicalization {
    fn name(&self) -> &str {
        "conv_bwd_weights_canonicalization"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        canonicalize_bwd(subgraph, "conv_bwd_weights", "convolution");
        Ok(())
    }
}

pub struct BatchnormBwdCanonicalization;

impl Pass for BatchnormBwdCanonicalization {
    fn name(&self) -> &str {
        "batchnorm_bwd_canonicalization"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        canonicalize_bwd(subgraph, "batch_norm_bwd", "batch_norm");
        Ok(())
    }
}

/// Tags a `Pooling` op's algorithm-specific padding/index attributes for
/// the forward direction.
pub struct PoolFwdCanonicalization;

impl Pass for PoolFwdCanonicalization {
    fn name(&self) -> &str {
        "pool_fwd_canonicalization"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph
            .ops_of_kind(OpKind::Pooling)
            .filter(|op| op.attrs.get("is_backward").and_then(Attribute::as_bool) != Some(true))
            .map(|op| op.id)
            .collect();
        for id in ids {
            if let Some(op) = subgraph.op_mut(id) {
                op.attrs
                    .entry("needs_workspace".to_string())
                    .or_insert(Attribute::Bool(
                        matches!(op.attrs.get("algorithm"), Some(Attribute::String(s)) if s == "max"),
                    ));
            }
        }
        Ok(())
    }
}

pub struct PoolBwdCanonicalization;

impl Pass for PoolBwdCanonicalization {
    fn name(&self) -> &str {
        "pool_bwd_canonicalization"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        canonicalize_bwd(subgraph, "pool_bwd", "pooling");
        Ok(())
    }
}

/// Inserts the pre-permute a `Shuffle` op needs when its channel-group
/// axis is not already the leading spatial axis, matching the layout
/// `FuseToShuffle` (in the algebraic-fusion family) assumed when it
/// collapsed reshape-permute-reshape into this op.
pub struct InsertPermuteForShuffle;

impl Pass for InsertPermuteForShuffle {
    fn name(&self) -> &str {
        "insert_permute_for_shuffle"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<OpId> = subgraph
            .ops_of_kind(OpKind::Shuffle)
            .filter(|op| !op.attrs.contains_key("perm"))
            .map(|op| op.id)
            .collect();
        for id in ids {
            let rank = subgraph
                .value(subgraph.op(id).unwrap().inputs[0])
                .map(|v| v.shape.rank())
                .unwrap_or(4);
            let perm: Vec<i64> = (0..rank as i64).collect();
            if let Some(op) = subgraph.op_mut(id) {
                op.attrs.insert("perm".to_string(), Attribute::IntArray(perm));
            }
        }
        Ok(())
    }
}
