//! Tensor value edges: element types, shapes, layouts, and the `Value`
//! struct itself.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Stable identifier for a value, preserved across pass rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Stable identifier for an op, preserved across pass rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    F32,
    F16,
    Bf16,
    S32,
    S8,
    U8,
}

impl ElementType {
    pub fn byte_size(self) -> usize {
        match self {
            ElementType::F32 => 4,
            ElementType::F16 => 2,
            ElementType::Bf16 => 2,
            ElementType::S32 => 4,
            ElementType::S8 => 1,
            ElementType::U8 => 1,
        }
    }
}

/// A single dimension, either a known size or dynamic ("any size at
/// execute time"). Dynamic dimensions block shape inference until
/// resolved by an earlier pass or by the caller's logical tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    Static(i64),
    Dynamic,
}

impl Dim {
    pub fn as_static(self) -> Option<i64> {
        match self {
            Dim::Static(v) => Some(v),
            Dim::Dynamic => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(pub Vec<Dim>);

impl Shape {
    pub fn static_dims(dims: impl IntoIterator<Item = i64>) -> Self {
        Shape(dims.into_iter().map(Dim::Static).collect())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn is_fully_static(&self) -> bool {
        self.0.iter().all(|d| matches!(d, Dim::Static(_)))
    }

    /// Total element count, or `None` if any dimension is dynamic.
    pub fn numel(&self) -> Option<i64> {
        self.0.iter().try_fold(1i64, |acc, d| match d {
            Dim::Static(v) => Some(acc * v),
            Dim::Dynamic => None,
        })
    }

    /// Known dimensions as plain `i64`s, treating any dynamic dimension
    /// as `1`. Used by shape-rewriting passes that need a concrete dim
    /// list to build a reshape/unsqueeze target and run after dynamic
    /// dims should already be resolved.
    pub fn static_dims_vec(&self) -> Vec<i64> {
        self.0.iter().map(|d| d.as_static().unwrap_or(1)).collect()
    }
}

/// Opaque backend-specific layout tag plus the concrete stride set chosen
/// for a value once layout propagation has run. Before layout propagation
/// a value's layout is `Layout::Any`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    /// No concrete layout chosen yet — producer/consumer are free to pick.
    Any,
    /// Plain row-major strides for the given shape.
    Strided(Vec<i64>),
    /// An opaque blocked/packed layout, identified by a backend tag.
    /// `use_blocked_layout` in `PartitionConfig` governs whether layout
    /// propagation is allowed to choose this variant.
    Blocked { tag: String, strides: Vec<i64> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Value {
    pub id: ValueId,
    pub elem_type: ElementType,
    pub shape: Shape,
    pub layout: Layout,
    pub is_const: bool,
    pub producer: Option<OpId>,
    #[serde(skip)]
    pub consumers: BTreeSet<OpId>,
}

impl Value {
    pub fn new(id: ValueId, elem_type: ElementType, shape: Shape) -> Self {
        Value {
            id,
            elem_type,
            shape,
            layout: Layout::Any,
            is_const: false,
            producer: None,
            consumers: BTreeSet::new(),
        }
    }

    pub fn with_const(mut self, is_const: bool) -> Self {
        self.is_const = is_const;
        self
    }
}
