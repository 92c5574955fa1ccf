//! Op nodes: kind enumeration, attribute bag, and the fused post-op chain.

use crate::value::{OpId, ValueId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The enumerated set of op kinds a subgraph may contain. Kept closed
/// rather than open-ended since passes pattern-match on kind throughout
/// the pipeline — each op kind is a tagged variant, not an open string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    MatMul,
    Convolution,
    Pooling,
    Binary,
    Eltwise,
    Reduction,
    Reshape,
    Permute,
    Unsqueeze,
    Squeeze,
    Quantize,
    Dequantize,
    ScalesMul,
    ZeroPointAdd,
    Reorder,
    Sum,
    Shuffle,
    Typecast,
    BatchNorm,
    HostScalarImport,
    Concat,
    ToGroup,
}

impl OpKind {
    /// Whether this kind may appear in a fused post-op chain.
    pub fn is_postop_eligible(self) -> bool {
        matches!(self, OpKind::Eltwise | OpKind::Sum | OpKind::Binary)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
}

impl Attribute {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Attribute::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Attribute::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int_array(&self) -> Option<&[i64]> {
        match self {
            Attribute::IntArray(v) => Some(v),
            _ => None,
        }
    }
}

pub type Attributes = BTreeMap<String, Attribute>;

/// A fused op appended to a primary op's kernel, executed inline. Carries
/// its own kind and attributes but no independent input/output value
/// list — it reads the primary op's accumulator and, for `Binary`/`Sum`
/// variants, one extra operand value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostOp {
    pub kind: OpKind,
    pub attrs: Attributes,
    pub extra_input: Option<ValueId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Op {
    pub id: OpId,
    pub kind: OpKind,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub attrs: Attributes,
    pub post_ops: Vec<PostOp>,
    /// Set by constant-propagation passes; not part of the original
    /// frontend op, only meaningful once stage-2 has run.
    pub is_constant: bool,
    /// Marked by passes that logically delete an op; removed by the next
    /// compaction step rather than mutating the arena during traversal.
    pub dead: bool,
}

impl Op {
    pub fn new(id: OpId, kind: OpKind, inputs: Vec<ValueId>, outputs: Vec<ValueId>) -> Self {
        Op {
            id,
            kind,
            inputs,
            outputs,
            attrs: Attributes::new(),
            post_ops: Vec::new(),
            is_constant: false,
            dead: false,
        }
    }

    pub fn with_attrs(mut self, attrs: Attributes) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn with_post_ops(mut self, post_ops: Vec<PostOp>) -> Self {
        self.post_ops = post_ops;
        self
    }
}
