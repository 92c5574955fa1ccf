//! The execution argument-set template: a per-value binding description
//! derived once from a finished [`MemoryPlanner`](crate::memory_planner::MemoryPlanner)
//! and reused, read-only, across every execute call of a compiled
//! partition. [`ExecutionArgSet`] is cheap to clone (it holds only
//! offsets, not buffers) — each thread that dispatches the partition
//! clones the template and pairs it with its own thread-local scratchpad
//! allocation.

use crate::memory_planner::{MemoryPlan, MemoryPlanner};
use crate::value::ValueId;
use std::collections::BTreeMap;

/// Where a value's backing memory comes from at execute time, resolved
/// from the compile-time [`MemoryPlan`] classification into the
/// concrete handle the dispatcher binds against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryHandle {
    ExternalInput(usize),
    ExternalOutput(usize),
    Arena { offset: usize, size: usize },
    Persistent { offset: usize, size: usize },
    HostScalar(usize),
}

impl From<&MemoryPlan> for MemoryHandle {
    fn from(plan: &MemoryPlan) -> Self {
        match *plan {
            MemoryPlan::ExternalInput(slot) => MemoryHandle::ExternalInput(slot),
            MemoryPlan::ExternalOutput(slot) => MemoryHandle::ExternalOutput(slot),
            MemoryPlan::InternalTemporary { offset, size } => MemoryHandle::Arena { offset, size },
            MemoryPlan::InternalPersistent { offset, size } => MemoryHandle::Persistent { offset, size },
            MemoryPlan::HostScalar(slot) => MemoryHandle::HostScalar(slot),
        }
    }
}

/// Broad category a binding falls into, used by the dispatcher to
/// decide which repatch list (external in/out, scratchpad, persistent,
/// host scalar) a value belongs to without re-matching on
/// [`MemoryHandle`] at every execute call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgRole {
    ExternalInput,
    ExternalOutput,
    Temporary,
    Persistent,
    HostScalar,
}

impl MemoryHandle {
    pub fn role(&self) -> ArgRole {
        match self {
            MemoryHandle::ExternalInput(_) => ArgRole::ExternalInput,
            MemoryHandle::ExternalOutput(_) => ArgRole::ExternalOutput,
            MemoryHandle::Arena { .. } => ArgRole::Temporary,
            MemoryHandle::Persistent { .. } => ArgRole::Persistent,
            MemoryHandle::HostScalar(_) => ArgRole::HostScalar,
        }
    }
}

/// A host-side scalar value's slot in the caller-supplied host-scalar
/// array, paired with the graph value it was imported into.
#[derive(Debug, Clone, Copy)]
pub struct HostScalarInfo {
    pub value: ValueId,
    pub slot: usize,
}

/// The immutable per-partition binding template. Built once, after
/// `compile_ops::CompileOps` has run, from the finished
/// [`MemoryPlanner`]; every execute call works from a clone of this
/// plus its own scratchpad buffer.
#[derive(Debug, Clone, Default)]
pub struct ExecutionArgSet {
    bindings: BTreeMap<ValueId, MemoryHandle>,
    pub scratchpad_size: usize,
    pub persistent_size: usize,
    pub external_input_slots: Vec<ValueId>,
    pub external_output_slots: Vec<ValueId>,
    pub host_scalars: Vec<HostScalarInfo>,
}

impl ExecutionArgSet {
    pub fn build(planner: &MemoryPlanner, all_values: impl Iterator<Item = ValueId>) -> Self {
        let mut set = ExecutionArgSet {
            scratchpad_size: planner.total_internal_temporary_size(),
            persistent_size: planner.total_internal_persistent_size(),
            ..Default::default()
        };
        for value in all_values {
            let Some(plan) = planner.plan_of(value) else {
                continue;
            };
            let handle = MemoryHandle::from(plan);
            match &handle {
                MemoryHandle::ExternalInput(slot) => {
                    if set.external_input_slots.len() <= *slot {
                        set.external_input_slots.resize(slot + 1, value);
                    }
                    set.external_input_slots[*slot] = value;
                }
                MemoryHandle::ExternalOutput(slot) => {
                    if set.external_output_slots.len() <= *slot {
                        set.external_output_slots.resize(slot + 1, value);
                    }
                    set.external_output_slots[*slot] = value;
                }
                MemoryHandle::HostScalar(slot) => {
                    set.host_scalars.push(HostScalarInfo { value, slot: *slot });
                }
                _ => {}
            }
            set.bindings.insert(value, handle);
        }
        set
    }

    pub fn handle_of(&self, value: ValueId) -> Option<&MemoryHandle> {
        self.bindings.get(&value)
    }
}
