//! Per-op compiled kernels. Real kernel selection/codegen against a
//! concrete primitive library is out of scope; this module provides the
//! `CompiledOp` seam plus f32 reference implementations for a core set
//! of op kinds, mirroring a one-entry-point-per-runtime
//! (`execute`/`execute_sycl`/`execute_ocl`) trio sharing the same
//! argument binding.

use crate::engine::DeviceBuffer;
use crate::error::{GraphError, Result};
use crate::op::{Attribute, Op, OpKind};

fn read_f32(buf: &DeviceBuffer) -> Vec<f32> {
    let bytes = buf.data.lock();
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn write_f32(buf: &DeviceBuffer, values: &[f32]) {
    let mut bytes = buf.data.lock();
    bytes.clear();
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
}

fn algorithm(op: &Op) -> Option<&str> {
    match op.attrs.get("algorithm") {
        Some(Attribute::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

fn apply_eltwise(algo: &str, x: f32) -> f32 {
    match algo {
        "relu" => x.max(0.0),
        "sigmoid" => 1.0 / (1.0 + (-x).exp()),
        "swish" => x / (1.0 + (-x).exp()),
        "reciprocal" => 1.0 / x,
        _ => x,
    }
}

fn apply_post_ops(op: &Op, mut acc: Vec<f32>, extra_operands: &[Vec<f32>]) -> Vec<f32> {
    let mut extra_iter = extra_operands.iter();
    for post in &op.post_ops {
        match post.kind {
            OpKind::Eltwise => {
                if let Some(Attribute::String(algo)) = post.attrs.get("algorithm") {
                    for v in acc.iter_mut() {
                        *v = apply_eltwise(algo, *v);
                    }
                }
            }
            OpKind::Sum | OpKind::Binary => {
                if let Some(operand) = extra_iter.next() {
                    for (a, b) in acc.iter_mut().zip(operand.iter().cycle()) {
                        *a += b;
                    }
                }
            }
            _ => {}
        }
    }
    acc
}

/// The execution seam every compiled op implements. Real backends would
/// additionally need the active [`crate::engine::Stream`]; the CPU
/// reference kernels here ignore it since they run synchronously inline.
pub trait CompiledOp: Send + Sync {
    fn execute(&self, op: &Op, inputs: &[DeviceBuffer], outputs: &[DeviceBuffer]) -> Result<()>;

    #[cfg(feature = "ocl_runtime")]
    fn execute_ocl(
        &self,
        op: &Op,
        inputs: &[DeviceBuffer],
        outputs: &[DeviceBuffer],
        _chain: &mut crate::engine::ocl::OclEventChain,
    ) -> Result<()> {
        self.execute(op, inputs, outputs)
    }

    #[cfg(feature = "sycl_runtime")]
    fn execute_sycl(
        &self,
        op: &Op,
        inputs: &[DeviceBuffer],
        outputs: &[DeviceBuffer],
        _chain: &mut crate::engine::sycl::SyclEventChain,
    ) -> Result<()> {
        self.execute(op, inputs, outputs)
    }
}

/// Copies input 0 to output 0 byte-for-byte. Used for shape-only ops
/// (`Reshape`/`Permute`/`Squeeze`/`Unsqueeze`/`Reorder`/`Typecast`
/// between same-width types) whose memory-planner slot already gives
/// them the right byte layout.
pub struct IdentityKernel;

impl CompiledOp for IdentityKernel {
    fn execute(&self, op: &Op, inputs: &[DeviceBuffer], outputs: &[DeviceBuffer]) -> Result<()> {
        let Some(input) = inputs.first() else {
            return Err(GraphError::runtime("identity", 0, "missing input"));
        };
        let Some(output) = outputs.first() else {
            return Err(GraphError::runtime("identity", 0, "missing output"));
        };
        let _ = op;
        *output.data.lock() = input.data.lock().clone();
        Ok(())
    }
}

/// `Binary` reference kernel: elementwise add/mul/sub/max/min over f32
/// operands, broadcasting a shorter rhs by cycling it against the lhs.
pub struct BinaryKernel;

impl CompiledOp for BinaryKernel {
    fn execute(&self, op: &Op, inputs: &[DeviceBuffer], outputs: &[DeviceBuffer]) -> Result<()> {
        let algo = algorithm(op).unwrap_or("add").to_string();
        let (Some(lhs), Some(rhs)) = (inputs.first(), inputs.get(1)) else {
            return Err(GraphError::runtime("binary", 0, "missing operand"));
        };
        let Some(output) = outputs.first() else {
            return Err(GraphError::runtime("binary", 0, "missing output"));
        };
        let a = read_f32(lhs);
        let b = read_f32(rhs);
        if b.is_empty() {
            return Err(GraphError::runtime("binary", 0, "empty rhs operand"));
        }
        let result: Vec<f32> = a
            .iter()
            .zip(b.iter().cycle())
            .map(|(&x, &y)| match algo.as_str() {
                "mul" => x * y,
                "sub" => x - y,
                "max" => x.max(y),
                "min" => x.min(y),
                _ => x + y,
            })
            .collect();
        write_f32(output, &apply_post_ops(op, result, &[]));
        Ok(())
    }
}

/// `Eltwise` reference kernel.
pub struct EltwiseKernel;

impl CompiledOp for EltwiseKernel {
    fn execute(&self, op: &Op, inputs: &[DeviceBuffer], outputs: &[DeviceBuffer]) -> Result<()> {
        let algo = algorithm(op).unwrap_or("relu").to_string();
        let Some(input) = inputs.first() else {
            return Err(GraphError::runtime("eltwise", 0, "missing input"));
        };
        let Some(output) = outputs.first() else {
            return Err(GraphError::runtime("eltwise", 0, "missing output"));
        };
        let result: Vec<f32> = read_f32(input).into_iter().map(|x| apply_eltwise(&algo, x)).collect();
        write_f32(output, &result);
        Ok(())
    }
}

/// `MatMul` reference kernel: naive row-major GEMM over rank-2 f32
/// operands, with an optional fused bias (third input, `has_bias`) and
/// any further post-ops (e.g. ReLU) applied inline — compute the primary
/// op, then walk the post-op chain.
pub struct MatMulKernel;

impl CompiledOp for MatMulKernel {
    fn execute(&self, op: &Op, inputs: &[DeviceBuffer], outputs: &[DeviceBuffer]) -> Result<()> {
        let (Some(lhs_buf), Some(rhs_buf)) = (inputs.first(), inputs.get(1)) else {
            return Err(GraphError::runtime("matmul", 0, "missing operand"));
        };
        let Some(output) = outputs.first() else {
            return Err(GraphError::runtime("matmul", 0, "missing output"));
        };

        let m = op.attrs.get("m").and_then(Attribute::as_int).unwrap_or(0) as usize;
        let k = op.attrs.get("k").and_then(Attribute::as_int).unwrap_or(0) as usize;
        let n = op.attrs.get("n").and_then(Attribute::as_int).unwrap_or(0) as usize;
        if m == 0 || k == 0 || n == 0 {
            return Err(GraphError::runtime("matmul", 0, "missing m/k/n shape attributes"));
        }

        let lhs = ndarray::Array2::from_shape_vec((m, k), read_f32(lhs_buf))
            .map_err(|e| GraphError::runtime("matmul", 0, e.to_string()))?;
        let rhs = ndarray::Array2::from_shape_vec((k, n), read_f32(rhs_buf))
            .map_err(|e| GraphError::runtime("matmul", 0, e.to_string()))?;
        let mut result = lhs.dot(&rhs);

        if op.attrs.get("has_bias").and_then(Attribute::as_bool) == Some(true) {
            if let Some(bias_buf) = inputs.get(2) {
                let bias = read_f32(bias_buf);
                for mut row in result.rows_mut() {
                    for (v, b) in row.iter_mut().zip(bias.iter().cycle()) {
                        *v += b;
                    }
                }
            }
        }

        let flat: Vec<f32> = result.into_raw_vec();
        write_f32(output, &apply_post_ops(op, flat, &[]));
        Ok(())
    }
}

/// `Sum` reference kernel: elementwise sum of N same-shape f32 operands.
pub struct SumKernel;

impl CompiledOp for SumKernel {
    fn execute(&self, op: &Op, inputs: &[DeviceBuffer], outputs: &[DeviceBuffer]) -> Result<()> {
        let Some(output) = outputs.first() else {
            return Err(GraphError::runtime("sum", 0, "missing output"));
        };
        let mut acc: Vec<f32> = Vec::new();
        for (idx, input) in inputs.iter().enumerate() {
            let values = read_f32(input);
            if idx == 0 {
                acc = values;
            } else {
                for (a, b) in acc.iter_mut().zip(values.iter()) {
                    *a += b;
                }
            }
        }
        write_f32(output, &apply_post_ops(op, acc, &[]));
        Ok(())
    }
}

/// Selects the reference kernel for a live op kind. Ops with no
/// reference implementation (e.g. `Convolution`, `Quantize`) are out of
/// scope for the executable reference path but still participate fully
/// in compilation and memory planning — this crate covers the
/// *scheduling and graph-transformation* system, not a full kernel
/// library.
pub fn kernel_for(kind: OpKind) -> Option<Box<dyn CompiledOp>> {
    match kind {
        OpKind::MatMul => Some(Box::new(MatMulKernel)),
        OpKind::Binary => Some(Box::new(BinaryKernel)),
        OpKind::Eltwise => Some(Box::new(EltwiseKernel)),
        OpKind::Sum => Some(Box::new(SumKernel)),
        OpKind::Reshape
        | OpKind::Permute
        | OpKind::Squeeze
        | OpKind::Unsqueeze
        | OpKind::Reorder
        | OpKind::Typecast
        | OpKind::HostScalarImport => Some(Box::new(IdentityKernel)),
        _ => None,
    }
}
