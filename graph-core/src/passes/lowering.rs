//! Lowering family: 1-to-1 frontend→backend mapping and host-scalar
//! insertion.

use crate::error::Result;
use crate::op::{Attribute, Op, OpKind};
use crate::pass::{Pass, Transactionality};
use crate::subgraph::Subgraph;

/// Direct 1-to-1 lowering of every op. In this crate the frontend and
/// backend op vocabularies are already unified (`OpKind`), so lowering
/// has nothing structural left to do beyond stamping ops as lowered —
/// later invariant checks use this to reject ops that bypassed the
/// pipeline's entry point.
pub struct LowerDown;

impl Pass for LowerDown {
    fn name(&self) -> &str {
        "lower_down"
    }

    fn transactionality(&self) -> Transactionality {
        Transactionality::Transactional
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<_> = subgraph.ops_in_order().map(|op| op.id).collect();
        for id in ids {
            if let Some(op) = subgraph.op_mut(id) {
                op.attrs
                    .entry("lowered".to_string())
                    .or_insert(Attribute::Bool(true));
            }
        }
        Ok(())
    }
}

/// Promotes rank-0 ("scalar") subgraph inputs to proper memory values by
/// inserting a `HostScalarImport` op ahead of their first consumer. This
/// is what lets a host scalar with no attached engine still execute: the
/// import op is the seam where the dispatcher later synthesizes a host
/// engine.
pub struct InsertHostScalar;

impl Pass for InsertHostScalar {
    fn name(&self) -> &str {
        "insert_host_scalar"
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let scalar_inputs: Vec<_> = subgraph
            .inputs
            .iter()
            .copied()
            .filter(|&id| {
                subgraph
                    .value(id)
                    .map(|v| v.shape.rank() == 0)
                    .unwrap_or(false)
            })
            .collect();

        for value_id in scalar_inputs {
            let first_consumer = subgraph
                .value(value_id)
                .and_then(|v| v.consumers.iter().copied().next());
            let Some(anchor) = first_consumer else {
                continue;
            };

            let elem_type = subgraph.value(value_id).unwrap().elem_type;
            let shape = subgraph.value(value_id).unwrap().shape.clone();
            let imported = subgraph.declare_value(elem_type, shape);

            let op_id = subgraph.fresh_op_id();
            let import_op =
                Op::new(op_id, OpKind::HostScalarImport, vec![value_id], vec![imported]);
            subgraph.insert_op_before(anchor, import_op)?;

            // Rewire the anchor (and any other original consumer) to read
            // from the imported value instead of the raw scalar input.
            let consumer_ids: Vec<_> = subgraph
                .value(value_id)
                .unwrap()
                .consumers
                .iter()
                .copied()
                .filter(|&c| c != op_id)
                .collect();
            for consumer_id in consumer_ids {
                if let Some(op) = subgraph.op_mut(consumer_id) {
                    for input in op.inputs.iter_mut() {
                        if *input == value_id {
                            *input = imported;
                        }
                    }
                }
                if let Some(v) = subgraph.value_mut(imported) {
                    v.consumers.insert(consumer_id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subgraph::{EngineKind, FloatingPointMode};
    use crate::value::{ElementType, Shape};

    #[test]
    fn host_scalar_input_gets_an_import_op() {
        let mut sg = Subgraph::new(EngineKind::Cpu, FloatingPointMode::Any, false);
        let scalar = sg.declare_value(ElementType::F32, Shape(vec![]));
        let out = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        sg.inputs.push(scalar);
        sg.outputs.push(out);
        let op_id = sg.fresh_op_id();
        sg.push_op(Op::new(op_id, OpKind::Eltwise, vec![scalar], vec![out]));

        InsertHostScalar.run(&mut sg).unwrap();

        assert_eq!(sg.op_count(), 2);
        assert!(sg
            .ops_in_order()
            .any(|op| op.kind == OpKind::HostScalarImport));
    }
}
