//! The backend's mutable in-memory representation of a partition.
//!
//! Ops live in an arena keyed by a stable [`OpId`] that never changes
//! across rewrites, even when a pass inserts or marks-dead other ops.
//! Passes that want to delete an op set its `dead` flag; a later
//! `compact` call removes tombstoned ops in one pass. This avoids the
//! pointer/index churn that an in-place `Vec::remove` would cause while a
//! pass is mid-traversal.
//!
//! Topological order is tracked explicitly as a `Vec<OpId>` rather than
//! recomputed from scratch on every mutation; [`Subgraph::verify_topological_order`]
//! cross-checks it against an independently computed `petgraph` toposort.

use crate::error::{GraphError, Result};
use crate::op::{Op, OpKind};
use crate::value::{ElementType, OpId, Shape, Value, ValueId};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineKind {
    Cpu,
    Ocl,
    Sycl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FloatingPointMode {
    Strict,
    Relaxed,
    Any,
}

#[derive(Debug, Clone)]
pub struct Subgraph {
    ops: BTreeMap<OpId, Op>,
    /// Topological order of *live* (non-dead) ops. Maintained by whichever
    /// pass mutates the arena; validated independently via petgraph.
    order: Vec<OpId>,
    values: BTreeMap<ValueId, Value>,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub engine: EngineKind,
    pub fp_mode: FloatingPointMode,
    pub use_blocked_layout: bool,
    next_op_id: u32,
    next_value_id: u32,
}

impl Subgraph {
    pub fn new(engine: EngineKind, fp_mode: FloatingPointMode, use_blocked_layout: bool) -> Self {
        Subgraph {
            ops: BTreeMap::new(),
            order: Vec::new(),
            values: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            engine,
            fp_mode,
            use_blocked_layout,
            next_op_id: 0,
            next_value_id: 0,
        }
    }

    pub fn fresh_op_id(&mut self) -> OpId {
        let id = OpId(self.next_op_id);
        self.next_op_id += 1;
        id
    }

    pub fn fresh_value_id(&mut self) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        id
    }

    pub fn declare_value(&mut self, elem_type: ElementType, shape: Shape) -> ValueId {
        let id = self.fresh_value_id();
        self.values.insert(id, Value::new(id, elem_type, shape));
        id
    }

    /// Declares a value under a caller-chosen id rather than minting a
    /// fresh one, for building a [`Subgraph`] out of a
    /// [`crate::config::PartitionDescriptor`] whose ids were assigned by
    /// the frontend. Bumps the internal id counter so later `fresh_value_id`
    /// calls (e.g. from `passes::lowering::InsertHostScalar`) never
    /// collide with an id the descriptor already used.
    pub fn declare_value_with_id(&mut self, id: ValueId, elem_type: ElementType, shape: Shape) {
        self.values.insert(id, Value::new(id, elem_type, shape));
        if id.0 >= self.next_value_id {
            self.next_value_id = id.0 + 1;
        }
    }

    /// Bumps the internal op-id counter so a subsequently minted
    /// `fresh_op_id` never collides with a caller-assigned id. Called
    /// once per op while ingesting a `PartitionDescriptor`, before
    /// `push_op`.
    pub fn bump_op_id(&mut self, id: OpId) {
        if id.0 >= self.next_op_id {
            self.next_op_id = id.0 + 1;
        }
    }

    pub fn value(&self, id: ValueId) -> Option<&Value> {
        self.values.get(&id)
    }

    pub fn value_mut(&mut self, id: ValueId) -> Option<&mut Value> {
        self.values.get_mut(&id)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.values()
    }

    pub fn op(&self, id: OpId) -> Option<&Op> {
        self.ops.get(&id)
    }

    pub fn op_mut(&mut self, id: OpId) -> Option<&mut Op> {
        self.ops.get_mut(&id)
    }

    /// Live ops in topological order. This is the sequence passes iterate
    /// and the sequence the dispatcher executes in.
    pub fn ops_in_order(&self) -> impl Iterator<Item = &Op> {
        self.order
            .iter()
            .filter_map(move |id| self.ops.get(id))
            .filter(|op| !op.dead)
    }

    pub fn op_count(&self) -> usize {
        self.order.iter().filter(|id| !self.ops[id].dead).count()
    }

    /// Appends a new op at the end of topological order, wiring producer
    /// bookkeeping on its output values and consumer bookkeeping on its
    /// input values.
    pub fn push_op(&mut self, op: Op) {
        for &out in &op.outputs {
            if let Some(v) = self.values.get_mut(&out) {
                v.producer = Some(op.id);
            }
        }
        for &inp in &op.inputs {
            if let Some(v) = self.values.get_mut(&inp) {
                v.consumers.insert(op.id);
            }
        }
        self.order.push(op.id);
        self.ops.insert(op.id, op);
    }

    /// Inserts `op` immediately before `anchor` in topological order.
    /// Used by passes that splice a new op between an existing producer
    /// and consumer (e.g. reorder insertion, unsqueeze/squeeze wrapping).
    pub fn insert_op_before(&mut self, anchor: OpId, op: Op) -> Result<()> {
        let pos = self
            .order
            .iter()
            .position(|&id| id == anchor)
            .ok_or_else(|| {
                GraphError::invariant("subgraph", format!("unknown anchor op {:?}", anchor))
            })?;
        for &out in &op.outputs {
            if let Some(v) = self.values.get_mut(&out) {
                v.producer = Some(op.id);
            }
        }
        for &inp in &op.inputs {
            if let Some(v) = self.values.get_mut(&inp) {
                v.consumers.insert(op.id);
            }
        }
        self.order.insert(pos, op.id);
        self.ops.insert(op.id, op);
        Ok(())
    }

    pub fn mark_dead(&mut self, id: OpId) {
        if let Some(op) = self.ops.get_mut(&id) {
            op.dead = true;
        }
    }

    /// Removes tombstoned ops from the arena and topological order. Called
    /// between pass families, not after every single pass, so that dead
    /// ops remain inspectable (e.g. by the visualizer) for one step.
    pub fn compact(&mut self) {
        self.order.retain(|id| !self.ops[id].dead);
        self.ops.retain(|_, op| !op.dead);
    }

    pub fn ops_of_kind(&self, kind: OpKind) -> impl Iterator<Item = &Op> {
        self.ops_in_order().filter(move |op| op.kind == kind)
    }

    /// Cross-checks the explicitly maintained topological order against an
    /// independent toposort over a freshly built `petgraph::DiGraph`. Used
    /// by the pipeline after every pass and directly by the
    /// `stage1_pipeline_preserves_topological_order` property test
    /// (`tests/property_topological_soundness.rs`).
    pub fn verify_topological_order(&self) -> Result<()> {
        let mut g = DiGraph::<OpId, ()>::new();
        let mut node_for = BTreeMap::new();
        for op in self.ops_in_order() {
            node_for.insert(op.id, g.add_node(op.id));
        }
        for op in self.ops_in_order() {
            for &input in &op.inputs {
                if let Some(value) = self.values.get(&input) {
                    if let Some(producer) = value.producer {
                        if let (Some(&from), Some(&to)) =
                            (node_for.get(&producer), node_for.get(&op.id))
                        {
                            g.add_edge(from, to, ());
                        }
                    } else if !self.inputs.contains(&input) {
                        return Err(GraphError::invariant(
                            "subgraph",
                            format!(
                                "value {:?} consumed by op {:?} has no producer and is not a subgraph input",
                                input, op.id
                            ),
                        ));
                    }
                }
            }
        }
        if toposort(&g, None).is_err() {
            return Err(GraphError::invariant(
                "subgraph",
                "cycle detected among live ops",
            ));
        }
        // The maintained order must itself already be a valid topological
        // order: every input must be produced strictly earlier.
        let mut seen = std::collections::BTreeSet::new();
        for op in self.ops_in_order() {
            for &input in &op.inputs {
                if let Some(value) = self.values.get(&input) {
                    if let Some(producer) = value.producer {
                        if !seen.contains(&producer) {
                            return Err(GraphError::invariant(
                                "subgraph",
                                format!(
                                    "op {:?} consumes value {:?} before its producer {:?} runs",
                                    op.id, input, producer
                                ),
                            ));
                        }
                    }
                }
            }
            seen.insert(op.id);
        }
        Ok(())
    }

    pub fn check_io_invariants(&self) -> Result<()> {
        let mut seen_in = std::collections::BTreeSet::new();
        for &id in &self.inputs {
            if !seen_in.insert(id) {
                return Err(GraphError::invariant(
                    "subgraph",
                    format!("input value {:?} listed more than once", id),
                ));
            }
        }
        let mut seen_out = std::collections::BTreeSet::new();
        for &id in &self.outputs {
            if !seen_out.insert(id) {
                return Err(GraphError::invariant(
                    "subgraph",
                    format!("output value {:?} listed more than once", id),
                ));
            }
        }
        Ok(())
    }
}
