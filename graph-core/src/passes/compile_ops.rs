//! The final two stage-2 steps: running the memory planner over the
//! fully shape-and-layout-resolved subgraph, then a last validation pass
//! before the subgraph is handed to [`crate::kernel::PartitionKernel`]
//! for execution-argument-set construction.

use crate::error::{GraphError, Result};
use crate::memory_planner::MemoryPlanner;
use crate::pass::Pass;
use crate::subgraph::Subgraph;
use parking_lot::Mutex;
use std::sync::Arc;

/// Runs [`MemoryPlanner::run`] over the subgraph, writing the result
/// into the shared planner handle `setup_pipeline_stage2`'s caller will
/// read after the pipeline finishes.
pub struct MemoryPlan {
    pub planner: Arc<Mutex<MemoryPlanner>>,
}

impl Pass for MemoryPlan {
    fn name(&self) -> &str {
        "memory_plan"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        self.planner.lock().run(subgraph)
    }
}

/// Final validation: every live op's inputs/outputs must now carry a
/// memory plan, and every op's output shape must be fully static — a
/// kernel cannot be compiled around a still-dynamic dimension. This is
/// the last pass in the fixed stage-2 order; anything it rejects means
/// an earlier pass left the subgraph in a state the dispatcher could
/// not safely execute.
pub struct CompileOps {
    pub planner: Arc<Mutex<MemoryPlanner>>,
}

impl Pass for CompileOps {
    fn name(&self) -> &str {
        "compile_ops"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let planner = self.planner.lock();
        for op in subgraph.ops_in_order() {
            for &output in &op.outputs {
                let Some(value) = subgraph.value(output) else {
                    continue;
                };
                if !value.shape.is_fully_static() {
                    return Err(GraphError::invariant(
                        self.name(),
                        format!("op {:?} output {:?} has a non-static shape after shape inference", op.id, output),
                    ));
                }
                if planner.plan_of(output).is_none() {
                    return Err(GraphError::invariant(
                        self.name(),
                        format!("value {:?} has no memory plan entry", output),
                    ));
                }
            }
        }
        Ok(())
    }
}
