//! Binary canonicalization family: operand ordering for commutative ops
//! and broadcast-operand placement.

use crate::error::Result;
use crate::op::{Attribute, OpKind};
use crate::pass::{Pass, Transactionality};
use crate::subgraph::Subgraph;

fn is_commutative(algorithm: Option<&str>) -> bool {
    matches!(algorithm, Some("add") | Some("mul") | Some("max") | Some("min"))
}

fn algorithm_str(attrs: &crate::op::Attributes) -> Option<&str> {
    match attrs.get("algorithm") {
        Some(Attribute::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

/// For commutative binary ops, ensures the non-constant ("data") operand
/// is input 0 and any constant operand is input 1 — kernels expect the
/// runtime tensor first.
pub struct BinaryCanonicalization;

impl Pass for BinaryCanonicalization {
    fn name(&self) -> &str {
        "binary_canonicalization"
    }

    fn transactionality(&self) -> Transactionality {
        Transactionality::Transactional
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<_> = subgraph.ops_of_kind(OpKind::Binary).map(|op| op.id).collect();
        for id in ids {
            let op = subgraph.op(id).unwrap();
            if op.inputs.len() != 2 || !is_commutative(algorithm_str(&op.attrs)) {
                continue;
            }
            let lhs_const = subgraph.value(op.inputs[0]).map(|v| v.is_const).unwrap_or(false);
            let rhs_const = subgraph.value(op.inputs[1]).map(|v| v.is_const).unwrap_or(false);
            if lhs_const && !rhs_const {
                if let Some(op) = subgraph.op_mut(id) {
                    op.inputs.swap(0, 1);
                }
            }
        }
        Ok(())
    }
}

/// For commutative binary ops, ensures the broadcasting (lower-rank)
/// operand is input 1, matching the kernel's expected broadcast
/// direction.
pub struct BinaryBroadcastSwap;

impl Pass for BinaryBroadcastSwap {
    fn name(&self) -> &str {
        "binary_broadcast_swap"
    }

    fn transactionality(&self) -> Transactionality {
        Transactionality::Transactional
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let ids: Vec<_> = subgraph.ops_of_kind(OpKind::Binary).map(|op| op.id).collect();
        for id in ids {
            let op = subgraph.op(id).unwrap();
            if op.inputs.len() != 2 || !is_commutative(algorithm_str(&op.attrs)) {
                continue;
            }
            let lhs_rank = subgraph.value(op.inputs[0]).map(|v| v.shape.rank()).unwrap_or(0);
            let rhs_rank = subgraph.value(op.inputs[1]).map(|v| v.shape.rank()).unwrap_or(0);
            if rhs_rank > lhs_rank {
                if let Some(op) = subgraph.op_mut(id) {
                    op.inputs.swap(0, 1);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Op;
    use crate::subgraph::{EngineKind, FloatingPointMode};
    use crate::value::{ElementType, Shape};

    #[test]
    fn broadcasting_operand_moves_to_second_slot() {
        let mut sg = Subgraph::new(EngineKind::Cpu, FloatingPointMode::Any, false);
        let small = sg.declare_value(ElementType::F32, Shape::static_dims([4]));
        let big = sg.declare_value(ElementType::F32, Shape::static_dims([2, 4]));
        let out = sg.declare_value(ElementType::F32, Shape::static_dims([2, 4]));
        sg.inputs = vec![small, big];
        sg.outputs = vec![out];
        let id = sg.fresh_op_id();
        let mut op = Op::new(id, OpKind::Binary, vec![small, big], vec![out]);
        op.attrs.insert("algorithm".into(), Attribute::String("add".into()));
        sg.push_op(op);

        BinaryBroadcastSwap.run(&mut sg).unwrap();
        assert_eq!(sg.op(id).unwrap().inputs, vec![big, small]);
    }
}
