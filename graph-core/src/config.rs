//! The external input/output surface of the crate: the partition
//! descriptor a caller hands to [`crate::kernel::PartitionKernel::compile`],
//! the logical tensors it carries, and its configuration knobs.

use crate::op::Op;
use crate::subgraph::{EngineKind, FloatingPointMode};
use crate::value::{ElementType, Shape, ValueId};
use serde::{Deserialize, Serialize};

/// Property flags a caller attaches to a logical tensor, independent of
/// its element type and shape. `is_constant` is the one flag every pass
/// in `passes::constant_prop` and the memory planner actually reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorProperties {
    pub is_constant: bool,
}

/// A single input/output tensor as handed across the compile/execute
/// boundary: `(id, element type, shape, layout tag, property flags)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalTensor {
    pub id: ValueId,
    pub elem_type: ElementType,
    pub shape: Shape,
    /// Opaque backend layout tag as supplied by the caller; `"any"` lets
    /// layout propagation choose freely. Mutated in place by `compile` to
    /// reflect the concrete layout chosen.
    pub layout_tag: String,
    pub properties: TensorProperties,
}

impl LogicalTensor {
    pub fn new(id: ValueId, elem_type: ElementType, shape: Shape) -> Self {
        LogicalTensor {
            id,
            elem_type,
            shape,
            layout_tag: "any".to_string(),
            properties: TensorProperties::default(),
        }
    }

    pub fn constant(mut self) -> Self {
        self.properties.is_constant = true;
        self
    }
}

/// The configuration surface threaded through `compile`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// If false, skip all constant-cache paths; constant ops run on every
    /// execute.
    pub enable_constant_cache: bool,
    pub floating_point_mode: FloatingPointMode,
    /// Guides layout propagation (`passes::layout::LayoutPropagation`)
    /// toward blocked layouts for constant operands.
    pub use_blocked_layout: bool,
    /// Drives `PassPipeline::set_visualize` from outside the pipeline
    /// construction code; defaults to off.
    pub enable_visualize: bool,
    /// Upper bound, in bytes, on the process-wide constant cache. Only
    /// consulted the first time a [`crate::constant_cache::ConstantTensorCache`]
    /// is constructed for a given partition kernel.
    pub constant_cache_capacity_bytes: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        PartitionConfig {
            enable_constant_cache: true,
            floating_point_mode: FloatingPointMode::Any,
            use_blocked_layout: false,
            enable_visualize: false,
            constant_cache_capacity_bytes: 256 << 20,
        }
    }
}

/// The input to `compile`: an ordered op list plus the engine, mode, and
/// layout-preference metadata, plus the input/output logical tensor
/// descriptors whose layout tags `compile` mutates in place once layout
/// propagation has chosen concrete layouts.
///
/// `values` carries every value id the op list references — inputs,
/// outputs, and internal intermediates alike — since a `Subgraph` needs
/// element type and shape metadata for every edge, not only the external
/// ones. `input_ids`/`output_ids` pick out which of those are external,
/// mirroring `Subgraph::inputs`/`Subgraph::outputs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub id: u64,
    pub ops: Vec<Op>,
    pub values: Vec<LogicalTensor>,
    pub input_ids: Vec<ValueId>,
    pub output_ids: Vec<ValueId>,
    pub engine: EngineKind,
    pub config: PartitionConfig,
}

impl PartitionDescriptor {
    pub fn new(id: u64, engine: EngineKind, config: PartitionConfig) -> Self {
        PartitionDescriptor {
            id,
            ops: Vec::new(),
            values: Vec::new(),
            input_ids: Vec::new(),
            output_ids: Vec::new(),
            engine,
            config,
        }
    }

    /// The logical tensors named in `input_ids`, in order — the external
    /// interface a caller binds `execute`'s `inputs` slice against.
    pub fn inputs(&self) -> Vec<&LogicalTensor> {
        self.input_ids
            .iter()
            .filter_map(|id| self.values.iter().find(|v| v.id == *id))
            .collect()
    }

    /// The logical tensors named in `output_ids`, in order.
    pub fn outputs(&self) -> Vec<&LogicalTensor> {
        self.output_ids
            .iter()
            .filter_map(|id| self.values.iter().find(|v| v.id == *id))
            .collect()
    }
}
