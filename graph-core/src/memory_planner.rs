//! Memory planning: classifies every value in a subgraph into one of a
//! fixed set of memory-plan categories, then greedily arranges the
//! internal-temporary category into a best-fit arena.

use crate::error::Result;
use crate::subgraph::Subgraph;
use crate::value::{OpId, ValueId};
use std::collections::BTreeMap;

/// Maximum alignment any kernel on any supported engine requires for a
/// memory-plan offset. Chosen once for the whole planner rather than
/// per-value: 64 bytes covers AVX-512 and typical GPU cacheline
/// granularity.
pub const MAX_ALIGNMENT: usize = 64;

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) / align * align
}

/// How a single value's backing memory is sourced at execute time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryPlan {
    /// Bound directly to the caller-supplied input tensor at slot index.
    ExternalInput(usize),
    /// Bound directly to the caller-supplied output tensor at slot index.
    ExternalOutput(usize),
    /// Lives in the scratchpad arena for the duration of one execute call,
    /// at the given byte offset, reused once its last consumer has run.
    InternalTemporary { offset: usize, size: usize },
    /// Lives in a persistent allocation that survives across executes of
    /// the same compiled partition (e.g. constant-folded weights).
    InternalPersistent { offset: usize, size: usize },
    /// A rank-0 value materialized from a host-side scalar at dispatch
    /// time rather than backed by a device buffer.
    HostScalar(usize),
}

#[derive(Debug, Clone)]
struct Lifetime {
    value: ValueId,
    size: usize,
    first_use: usize,
    last_use: usize,
}

/// Computes and holds the finished memory plan for one subgraph. A
/// fresh planner is constructed per `PartitionKernel::compile` call and
/// wrapped in `Arc<Mutex<_>>` by `setup_pipeline_stage2` so the
/// `MemoryPlan`/`CompileOps` pipeline steps can populate it in place.
#[derive(Debug, Default)]
pub struct MemoryPlanner {
    plans: BTreeMap<ValueId, MemoryPlan>,
    internal_temporary_size: usize,
    internal_persistent_size: usize,
}

impl MemoryPlanner {
    pub fn new() -> Self {
        MemoryPlanner::default()
    }

    pub fn plan_of(&self, value: ValueId) -> Option<&MemoryPlan> {
        self.plans.get(&value)
    }

    pub fn total_internal_temporary_size(&self) -> usize {
        self.internal_temporary_size
    }

    pub fn total_internal_persistent_size(&self) -> usize {
        self.internal_persistent_size
    }

    /// Ordered list of persistent memory descriptors (`(value, offset,
    /// size)`, sorted by offset), used to key the constant cache. Two
    /// compiles that produce the same persistent layout hash identically
    /// regardless of `BTreeMap` iteration order, since offsets — not
    /// value ids — decide the sort key.
    pub fn persistent_mem_desc_list(&self) -> Vec<(ValueId, usize, usize)> {
        let mut list: Vec<(ValueId, usize, usize)> = self
            .plans
            .iter()
            .filter_map(|(&id, plan)| match *plan {
                MemoryPlan::InternalPersistent { offset, size } => Some((id, offset, size)),
                _ => None,
            })
            .collect();
        list.sort_by_key(|&(_, offset, _)| offset);
        list
    }

    /// Classifies every value, then greedily best-fit packs the
    /// internal-temporary set by decreasing size over an interval graph
    /// keyed on first/last topological use, freeing a block for reuse as
    /// soon as its last consumer has executed.
    pub fn run(&mut self, subgraph: &mut Subgraph) -> Result<()> {
        self.plans.clear();
        self.internal_temporary_size = 0;
        self.internal_persistent_size = 0;

        let order: Vec<OpId> = subgraph.ops_in_order().map(|op| op.id).collect();
        let position: BTreeMap<OpId, usize> = order.iter().enumerate().map(|(i, &id)| (id, i)).collect();

        // Subgraph inputs split into two disjoint slot spaces: rank-0
        // values (`passes::lowering::InsertHostScalar`'s trigger
        // condition) are bound from the caller's `host_scalars` array at
        // execute time rather than the `inputs` array, so each gets a
        // stable slot counted only among other host scalars, in the
        // order they appear in `subgraph.inputs` — independent of
        // anything else about the subgraph's classification order.
        let mut external_slot_of: BTreeMap<ValueId, usize> = BTreeMap::new();
        let mut host_scalar_slot_of: BTreeMap<ValueId, usize> = BTreeMap::new();
        {
            let mut external_slot = 0usize;
            let mut host_scalar_slot = 0usize;
            for &id in &subgraph.inputs {
                let is_host_scalar = subgraph.value(id).map(|v| v.shape.rank() == 0).unwrap_or(false);
                if is_host_scalar {
                    host_scalar_slot_of.insert(id, host_scalar_slot);
                    host_scalar_slot += 1;
                } else {
                    external_slot_of.insert(id, external_slot);
                    external_slot += 1;
                }
            }
        }

        let mut lifetimes = Vec::new();
        for value in subgraph.values() {
            if let Some(&slot) = host_scalar_slot_of.get(&value.id) {
                self.plans.insert(value.id, MemoryPlan::HostScalar(slot));
                continue;
            }
            if let Some(&slot) = external_slot_of.get(&value.id) {
                self.plans.insert(value.id, MemoryPlan::ExternalInput(slot));
                continue;
            }
            if let Some(slot) = subgraph.outputs.iter().position(|&v| v == value.id) {
                self.plans.insert(value.id, MemoryPlan::ExternalOutput(slot));
                continue;
            }

            let size = value.shape.numel().map(|n| n as usize * value.elem_type.byte_size()).unwrap_or(0);
            if value.is_const {
                let offset = align_up(self.internal_persistent_size, MAX_ALIGNMENT);
                self.internal_persistent_size = offset + size;
                self.plans.insert(value.id, MemoryPlan::InternalPersistent { offset, size });
                continue;
            }

            let first_use = value.producer.and_then(|p| position.get(&p).copied()).unwrap_or(0);
            let last_use = value.consumers.iter().filter_map(|c| position.get(c).copied()).max().unwrap_or(first_use);
            lifetimes.push(Lifetime { value: value.id, size, first_use, last_use });
        }

        self.pack_temporaries(lifetimes);
        Ok(())
    }

    /// Best-fit arena packing: processes lifetimes in decreasing size
    /// order, reusing the smallest already-freed block that fits, and
    /// only growing the arena when nothing free is large enough. A
    /// value's block becomes free for reuse immediately after its
    /// `last_use` position has been assigned, modeling scratchpad reuse
    /// across ops within a single execute call.
    fn pack_temporaries(&mut self, mut lifetimes: Vec<Lifetime>) {
        lifetimes.sort_by(|a, b| b.size.cmp(&a.size).then(a.first_use.cmp(&b.first_use)));

        struct Block {
            offset: usize,
            size: usize,
            free_after: usize,
        }
        let mut blocks: Vec<Block> = Vec::new();
        let mut arena_size = 0usize;

        for lt in &lifetimes {
            let candidate = blocks
                .iter()
                .enumerate()
                .filter(|(_, b)| b.free_after <= lt.first_use && b.size >= lt.size)
                .min_by_key(|(_, b)| b.size);

            let offset = if let Some((idx, _)) = candidate {
                let block = &mut blocks[idx];
                let offset = block.offset;
                block.free_after = lt.last_use;
                offset
            } else {
                let offset = align_up(arena_size, MAX_ALIGNMENT);
                arena_size = offset + lt.size;
                blocks.push(Block { offset, size: lt.size, free_after: lt.last_use });
                offset
            };

            self.plans.insert(lt.value, MemoryPlan::InternalTemporary { offset, size: lt.size });
        }

        self.internal_temporary_size = arena_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Op;
    use crate::subgraph::{EngineKind, FloatingPointMode};
    use crate::value::{ElementType, Shape};

    #[test]
    fn disjoint_temporaries_reuse_arena_space() {
        let mut sg = Subgraph::new(EngineKind::Cpu, FloatingPointMode::Any, false);
        let input = sg.declare_value(ElementType::F32, Shape::static_dims([16]));
        let mid1 = sg.declare_value(ElementType::F32, Shape::static_dims([16]));
        let mid2 = sg.declare_value(ElementType::F32, Shape::static_dims([16]));
        let out = sg.declare_value(ElementType::F32, Shape::static_dims([16]));
        sg.inputs = vec![input];
        sg.outputs = vec![out];

        let id1 = sg.fresh_op_id();
        sg.push_op(Op::new(id1, OpKind::Typecast, vec![input], vec![mid1]));
        let id2 = sg.fresh_op_id();
        sg.push_op(Op::new(id2, OpKind::Typecast, vec![mid1], vec![mid2]));
        let id3 = sg.fresh_op_id();
        sg.push_op(Op::new(id3, OpKind::Typecast, vec![mid2], vec![out]));

        let mut planner = MemoryPlanner::new();
        planner.run(&mut sg).unwrap();

        // mid1 is dead by the time mid2 is produced, so the arena should
        // be sized for one live temporary, not two.
        let single_size = match planner.plan_of(mid1).unwrap() {
            MemoryPlan::InternalTemporary { size, .. } => *size,
            _ => panic!("expected internal temporary"),
        };
        assert!(planner.total_internal_temporary_size() <= single_size + MAX_ALIGNMENT);
    }
}
