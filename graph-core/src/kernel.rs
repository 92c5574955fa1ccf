//! The user-facing compiled object: [`PartitionKernel`]. Owns the
//! transformed subgraph, the memory plan's derived execution-arg-set
//! template, and a dispatcher bound to a device engine.
//!
//! `compile` is idempotent after the first call on a given kernel object
//! — guarded by a `call_once` — even though two threads racing to
//! compile the same kernel both return successfully, with exactly one
//! of them having actually built the pipeline.

use crate::config::PartitionDescriptor;
use crate::constant_cache::ConstantTensorCache;
use crate::dispatcher::{Dispatcher, Runtime};
use crate::engine::{Allocator, DeviceBuffer, HeapAllocator, Stream};
#[cfg(any(feature = "ocl_runtime", feature = "sycl_runtime"))]
use crate::engine::DeviceEvent;
use crate::error::{GraphError, Result};
use crate::exec_args::{ExecutionArgSet, HostScalarInfo};
use crate::memory_planner::MemoryPlanner;
use crate::pass::{PassPipeline, TracingVisualizeSink};
use crate::passes::{setup_pipeline_stage1, setup_pipeline_stage2};
use crate::subgraph::Subgraph;
use crate::value::Layout;
use parking_lot::{Once, RwLock};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

thread_local! {
    /// Per-thread execution-arg-set cache, keyed by partition-kernel
    /// identity (`spec.md` §4.4 step 1 / §9's thread-local design note).
    /// First access on a thread for a given kernel clones the immutable
    /// template stored on `Inner`; later accesses on the same thread
    /// reuse that clone. Entries are owned by the thread and torn down
    /// at thread exit along with the `thread_local!` itself.
    static ARG_SETS: RefCell<HashMap<usize, Arc<ExecutionArgSet>>> = RefCell::new(HashMap::new());
}

struct Inner {
    subgraph: Subgraph,
    arg_set: ExecutionArgSet,
    dispatcher: Dispatcher,
    persistent_digest: [u8; 32],
}

enum CompileState {
    Pending,
    Ready(Arc<Inner>),
    Failed(GraphError),
}

/// Compiles a [`PartitionDescriptor`] once, then dispatches `execute`
/// calls against the result from any number of threads. A fresh
/// `PartitionKernel` is created per partition; `compile` is safe to call
/// concurrently and safe to call more than once on the same object — only
/// the first call's outcome is observed by every caller.
pub struct PartitionKernel {
    once: Once,
    state: RwLock<CompileState>,
}

impl Default for PartitionKernel {
    fn default() -> Self {
        PartitionKernel {
            once: Once::new(),
            state: RwLock::new(CompileState::Pending),
        }
    }
}

impl PartitionKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the subgraph from `descriptor`, runs the full Stage-1 +
    /// Stage-2 pipeline, plans memory, and records a dispatcher ready for
    /// `execute`. Mutates `descriptor`'s input/output logical tensors'
    /// `layout_tag` in place to reflect the concrete layouts layout
    /// propagation chose.
    ///
    /// Safe to call from multiple threads racing to compile the same
    /// kernel object: exactly one thread runs the pipeline; every caller
    /// (including the racing ones) observes its outcome.
    pub fn compile(
        &self,
        descriptor: &mut PartitionDescriptor,
        allocator: Arc<dyn Allocator>,
        constant_cache: Option<Arc<ConstantTensorCache>>,
    ) -> Result<()> {
        let mut canonicalized_layouts = None;
        self.once.call_once(|| {
            let result = Self::build(descriptor, allocator, constant_cache);
            let mut state = self.state.write();
            *state = match result {
                Ok((inner, layouts)) => {
                    canonicalized_layouts = Some(layouts);
                    CompileState::Ready(Arc::new(inner))
                }
                Err(e) => CompileState::Failed(e),
            };
        });
        if let Some(layouts) = canonicalized_layouts {
            for (tensor, tag) in descriptor.values.iter_mut().zip(layouts) {
                tensor.layout_tag = tag;
            }
        }
        match &*self.state.read() {
            CompileState::Ready(_) => Ok(()),
            CompileState::Failed(e) => Err(e.clone()),
            CompileState::Pending => Err(GraphError::invariant(
                "compile",
                "pipeline did not initialize on first call",
            )),
        }
    }

    fn build(
        descriptor: &PartitionDescriptor,
        allocator: Arc<dyn Allocator>,
        constant_cache: Option<Arc<ConstantTensorCache>>,
    ) -> Result<(Inner, Vec<String>)> {
        let mut subgraph = Subgraph::new(
            descriptor.engine,
            descriptor.config.floating_point_mode,
            descriptor.config.use_blocked_layout,
        );

        for tensor in &descriptor.values {
            subgraph.declare_value_with_id(tensor.id, tensor.elem_type, tensor.shape.clone());
            if let Some(v) = subgraph.value_mut(tensor.id) {
                v.is_const = tensor.properties.is_constant;
            }
        }
        subgraph.inputs = descriptor.input_ids.clone();
        subgraph.outputs = descriptor.output_ids.clone();
        subgraph.check_io_invariants()?;

        for op in &descriptor.ops {
            subgraph.bump_op_id(op.id);
            subgraph.push_op(op.clone());
        }
        subgraph.verify_topological_order()?;

        let mut pipeline = if descriptor.config.enable_visualize {
            PassPipeline::with_sink(Box::new(TracingVisualizeSink))
        } else {
            PassPipeline::new()
        };
        if descriptor.config.enable_visualize {
            pipeline.set_visualize(true, true);
        }
        setup_pipeline_stage1(&mut pipeline);
        pipeline.run(&mut subgraph)?;
        subgraph.compact();
        subgraph.verify_topological_order()?;

        let mut pipeline2 = if descriptor.config.enable_visualize {
            PassPipeline::with_sink(Box::new(TracingVisualizeSink))
        } else {
            PassPipeline::new()
        };
        let planner_cell = setup_pipeline_stage2(
            &mut pipeline2,
            MemoryPlanner::new(),
            descriptor.config.enable_constant_cache,
        );
        pipeline2.run(&mut subgraph)?;
        subgraph.compact();
        subgraph.verify_topological_order()?;

        let planner = planner_cell.lock();
        let all_value_ids: Vec<_> = subgraph.values().map(|v| v.id).collect();
        let arg_set = ExecutionArgSet::build(&planner, all_value_ids.into_iter());

        let mut hasher = blake3::Hasher::new();
        for (id, offset, size) in planner.persistent_mem_desc_list() {
            hasher.update(&id.0.to_le_bytes());
            hasher.update(&offset.to_le_bytes());
            hasher.update(&size.to_le_bytes());
        }
        let persistent_digest = *hasher.finalize().as_bytes();
        drop(planner);

        let dispatcher = Dispatcher {
            partition_id: descriptor.id,
            allocator,
            constant_cache: if descriptor.config.enable_constant_cache {
                constant_cache
            } else {
                None
            },
            persistent_digest,
        };

        let layout_tags = descriptor
            .values
            .iter()
            .map(|tensor| match subgraph.value(tensor.id).map(|v| &v.layout) {
                Some(Layout::Any) | None => "any".to_string(),
                Some(Layout::Strided(_)) => "strided".to_string(),
                Some(Layout::Blocked { tag, .. }) => tag.clone(),
            })
            .collect();

        Ok((
            Inner {
                subgraph,
                arg_set,
                dispatcher,
                persistent_digest,
            },
            layout_tags,
        ))
    }

    fn ready(&self) -> Result<Arc<Inner>> {
        match &*self.state.read() {
            CompileState::Ready(inner) => Ok(inner.clone()),
            CompileState::Failed(e) => Err(e.clone()),
            CompileState::Pending => Err(GraphError::invariant(
                "execute",
                "execute called before a successful compile",
            )),
        }
    }

    /// Content-addressed hash of the persistent memory descriptor list,
    /// as used in the constant-cache key. Exposed so callers that keep
    /// their own partition-id → kernel map can precompute keys without
    /// re-deriving the digest.
    pub fn persistent_digest(&self) -> Result<[u8; 32]> {
        Ok(self.ready()?.persistent_digest)
    }

    pub fn scratchpad_size(&self) -> Result<usize> {
        Ok(self.ready()?.arg_set.scratchpad_size)
    }

    /// The host-scalar slot layout a caller must supply to `execute`'s
    /// `host_scalars` argument: one entry per rank-0 value
    /// `passes::lowering::InsertHostScalar` promoted during Stage 1,
    /// giving the originating graph value alongside its slot index so a
    /// caller (e.g. `graph-cli`) can size and order the array correctly
    /// without guessing at the memory planner's internal classification.
    pub fn host_scalars(&self) -> Result<Vec<HostScalarInfo>> {
        Ok(self.ready()?.arg_set.host_scalars.clone())
    }

    /// Number of host-scalar slots this compiled partition expects.
    pub fn host_scalar_count(&self) -> Result<usize> {
        Ok(self.ready()?.arg_set.host_scalars.len())
    }

    /// Returns this thread's `ExecutionArgSet` clone, cloning the
    /// immutable template on first access from this thread and reusing
    /// it on every later call — `spec.md` §4.4 step 1.
    fn thread_local_arg_set(&self, inner: &Inner) -> Arc<ExecutionArgSet> {
        let key = self as *const PartitionKernel as usize;
        ARG_SETS.with(|cache| {
            cache
                .borrow_mut()
                .entry(key)
                .or_insert_with(|| Arc::new(inner.arg_set.clone()))
                .clone()
        })
    }

    /// Synchronous execution: the CPU runtime variant of the six-step
    /// execute algorithm. `inputs`/`outputs` are positional, matching
    /// `Subgraph::inputs`/`Subgraph::outputs` order; `host_scalars` are
    /// positional against the host-scalar slots `InsertHostScalar`
    /// introduced during Stage 1 (see `Self::host_scalars`).
    pub fn execute(
        &self,
        _stream: &dyn Stream,
        inputs: &[DeviceBuffer],
        outputs: &[DeviceBuffer],
        host_scalars: &[DeviceBuffer],
    ) -> Result<()> {
        let inner = self.ready()?;
        let arg_set = self.thread_local_arg_set(&inner);
        inner
            .dispatcher
            .execute(&inner.subgraph, &arg_set, inputs, outputs, host_scalars, Runtime::Cpu, &[])?;
        Ok(())
    }

    /// OpenCL runtime variant: takes the caller's input dependency events
    /// and returns one completion event chaining every dispatch issued.
    /// Each op is routed through `CompiledOp::execute_ocl` rather than the
    /// CPU `execute` entry point, per `spec.md` §9's "only the variant
    /// matching the runtime is invoked."
    #[cfg(feature = "ocl_runtime")]
    pub fn execute_ocl(
        &self,
        _stream: &dyn Stream,
        inputs: &[DeviceBuffer],
        outputs: &[DeviceBuffer],
        host_scalars: &[DeviceBuffer],
        deps: &[DeviceEvent],
    ) -> Result<DeviceEvent> {
        let inner = self.ready()?;
        let arg_set = self.thread_local_arg_set(&inner);
        inner
            .dispatcher
            .execute(&inner.subgraph, &arg_set, inputs, outputs, host_scalars, Runtime::Ocl, deps)
    }

    /// SYCL runtime variant; see `execute_ocl`.
    #[cfg(feature = "sycl_runtime")]
    pub fn execute_sycl(
        &self,
        _stream: &dyn Stream,
        inputs: &[DeviceBuffer],
        outputs: &[DeviceBuffer],
        host_scalars: &[DeviceBuffer],
        deps: &[DeviceEvent],
    ) -> Result<DeviceEvent> {
        let inner = self.ready()?;
        let arg_set = self.thread_local_arg_set(&inner);
        inner
            .dispatcher
            .execute(&inner.subgraph, &arg_set, inputs, outputs, host_scalars, Runtime::Sycl, deps)
    }
}

/// Convenience constructor for the CPU-only path exercised by
/// `graph-cli` and most integration tests: a heap allocator and an
/// optional, freshly created constant cache.
pub fn cpu_allocator() -> Arc<dyn Allocator> {
    Arc::new(HeapAllocator)
}

pub fn new_constant_cache(capacity_bytes: usize) -> Arc<ConstantTensorCache> {
    Arc::new(ConstantTensorCache::new(capacity_bytes))
}
