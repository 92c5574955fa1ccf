//! Output-shape inference. Runs once per stage-2 pipeline and must be
//! deterministic: running it twice over the same subgraph must not
//! change the already-resolved shapes.

use crate::error::{GraphError, Result};
use crate::op::{Attribute, Op, OpKind};
use crate::pass::Pass;
use crate::subgraph::Subgraph;
use crate::value::{Dim, Shape};

fn broadcast_shape(a: &Shape, b: &Shape) -> Option<Shape> {
    let rank = a.rank().max(b.rank());
    let mut dims = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = a.0.iter().rev().nth(i).copied().unwrap_or(Dim::Static(1));
        let db = b.0.iter().rev().nth(i).copied().unwrap_or(Dim::Static(1));
        let d = match (da, db) {
            (Dim::Static(x), Dim::Static(y)) if x == y || y == 1 => Dim::Static(x),
            (Dim::Static(x), Dim::Static(y)) if x == 1 => Dim::Static(y),
            (Dim::Dynamic, _) | (_, Dim::Dynamic) => Dim::Dynamic,
            _ => return None,
        };
        dims.push(d);
    }
    dims.reverse();
    Some(Shape(dims))
}

fn infer_one(subgraph: &Subgraph, op: &Op) -> Result<Option<Shape>> {
    let input_shape = |idx: usize| -> Option<Shape> {
        op.inputs.get(idx).and_then(|&v| subgraph.value(v)).map(|v| v.shape.clone())
    };

    let shape = match op.kind {
        OpKind::Binary | OpKind::Sum => {
            let mut acc = input_shape(0).ok_or_else(|| {
                GraphError::invariant("infer_shape", format!("op {:?} missing input 0", op.id))
            })?;
            for idx in 1..op.inputs.len() {
                let Some(next) = input_shape(idx) else { continue };
                acc = broadcast_shape(&acc, &next).ok_or_else(|| {
                    GraphError::invariant("infer_shape", format!("op {:?} has incompatible broadcast shapes", op.id))
                })?;
            }
            Some(acc)
        }
        OpKind::Eltwise | OpKind::Typecast | OpKind::Quantize | OpKind::Dequantize | OpKind::ScalesMul
        | OpKind::ZeroPointAdd | OpKind::Reorder | OpKind::BatchNorm | OpKind::ToGroup => input_shape(0),
        OpKind::Reshape => match op.attrs.get("target_shape") {
            Some(Attribute::IntArray(dims)) => Some(Shape::static_dims(dims.iter().copied())),
            _ => input_shape(0),
        },
        OpKind::Permute | OpKind::Shuffle => {
            let Some(src) = input_shape(0) else {
                return Ok(None);
            };
            match op.attrs.get("perm") {
                Some(Attribute::IntArray(perm)) => {
                    let dims: Option<Vec<Dim>> = perm.iter().map(|&p| src.0.get(p as usize).copied()).collect();
                    dims.map(Shape)
                }
                _ => Some(src),
            }
        }
        OpKind::Unsqueeze => {
            let Some(mut dims) = input_shape(0).map(|s| s.0) else {
                return Ok(None);
            };
            dims.insert(0, Dim::Static(1));
            Some(Shape(dims))
        }
        OpKind::Squeeze => {
            let Some(mut dims) = input_shape(0).map(|s| s.0) else {
                return Ok(None);
            };
            if dims.first() == Some(&Dim::Static(1)) {
                dims.remove(0);
            }
            Some(Shape(dims))
        }
        OpKind::Reduction => {
            let Some(src) = input_shape(0) else {
                return Ok(None);
            };
            let keep_dims = op.attrs.get("keep_dims").and_then(Attribute::as_bool).unwrap_or(false);
            let axes: Vec<usize> = match op.attrs.get("axes") {
                Some(Attribute::IntArray(a)) => a.iter().map(|&x| x as usize).collect(),
                _ => (0..src.rank()).collect(),
            };
            let dims: Vec<Dim> = src
                .0
                .iter()
                .enumerate()
                .filter_map(|(i, &d)| {
                    if axes.contains(&i) {
                        if keep_dims { Some(Dim::Static(1)) } else { None }
                    } else {
                        Some(d)
                    }
                })
                .collect();
            Some(Shape(dims))
        }
        OpKind::MatMul => {
            let (Some(a), Some(b)) = (input_shape(0), input_shape(1)) else {
                return Ok(None);
            };
            if a.rank() < 2 || b.rank() < 2 {
                return Err(GraphError::invariant("infer_shape", format!("matmul op {:?} has rank < 2 operand", op.id)));
            }
            let mut dims = a.0[..a.rank() - 1].to_vec();
            dims.push(b.0[b.rank() - 1]);
            Some(Shape(dims))
        }
        OpKind::Concat => {
            let axis = match op.attrs.get("axis") {
                Some(Attribute::Int(a)) => *a as usize,
                _ => 0,
            };
            let Some(mut base) = input_shape(0) else {
                return Ok(None);
            };
            let mut total = base.0.get(axis).and_then(|d| d.as_static()).unwrap_or(0);
            for idx in 1..op.inputs.len() {
                let Some(next) = input_shape(idx) else { continue };
                total += next.0.get(axis).and_then(|d| d.as_static()).unwrap_or(0);
            }
            if let Some(d) = base.0.get_mut(axis) {
                *d = Dim::Static(total);
            }
            Some(base)
        }
        OpKind::Convolution | OpKind::Pooling | OpKind::HostScalarImport => input_shape(0),
    };
    Ok(shape)
}

/// Computes and fills in every output value's shape that isn't already
/// fully static, in topological order so each op's inputs are resolved
/// before it runs. Fails with `InvariantViolation` when an op's output
/// shape cannot be determined (e.g. a still-dynamic input reaching a
/// shape-sensitive op like `MatMul`).
pub struct InferShape;

impl Pass for InferShape {
    fn name(&self) -> &str {
        "infer_shape"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<_> = subgraph.ops_in_order().map(|op| op.id).collect();
        for id in ids {
            let op = subgraph.op(id).unwrap().clone();
            let already_static = op
                .outputs
                .iter()
                .all(|&v| subgraph.value(v).map(|v| v.shape.is_fully_static()).unwrap_or(false));
            if already_static {
                continue;
            }
            let inferred = infer_one(subgraph, &op)?.ok_or_else(|| {
                GraphError::invariant(
                    self.name(),
                    format!("could not determine output shape for op {:?} ({:?})", op.id, op.kind),
                )
            })?;
            if let Some(&out) = op.outputs.first() {
                if let Some(v) = subgraph.value_mut(out) {
                    v.shape = inferred;
                }
            }
        }
        Ok(())
    }
}
