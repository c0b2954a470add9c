//! Tensor allocation map: which consumer decides the layout of each source.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{InstId, Module, OpKind};

/// An instruction output that has no layout of its own. Tuple-shaped
/// instructions are addressed per flattened leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorSource {
    pub instruction: InstId,
    pub output_index: usize,
}

impl TensorSource {
    pub fn new(instruction: InstId, output_index: usize) -> Self {
        Self { instruction, output_index }
    }
}

/// The consumer whose layout a source adopts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorTarget {
    pub target: InstId,
    /// Operand of `target` the source flows into.
    pub input_index: usize,
    /// Instruction whose layout `target` wants the source to match. Seeds
    /// recorded by the allocation finder have none.
    pub layout_producer: Option<InstId>,
    /// Tuple element of the layout producer that reaches the target.
    pub layout_output_index: usize,
    /// Interior nodes from the layout producer to the target.
    pub layout_path: Vec<InstId>,
    /// Interior nodes from the source to the target, prefixed by the
    /// get-tuple-element chain of flattened tuple sources.
    pub source_path: Vec<InstId>,
}

pub type TensorAllocationMap = BTreeMap<TensorSource, TensorTarget>;

/// Sources, targets and layout-path instructions of every recorded entry.
pub fn ops_with_layout(map: &TensorAllocationMap) -> BTreeSet<InstId> {
    let mut ops = BTreeSet::new();
    for (source, target) in map {
        ops.insert(source.instruction);
        ops.insert(target.target);
        ops.extend(target.layout_path.iter().copied());
    }
    ops
}

/// One non-tuple leaf of a (possibly tuple-shaped) instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleLeaf {
    pub flat_index: usize,
    /// Instruction producing the leaf: the source itself, or the last
    /// get-tuple-element of the chain.
    pub leaf: InstId,
    pub gte_chain: Vec<InstId>,
}

/// Flattens `inst` through chains of get-tuple-element users.
pub fn tuple_leaves(module: &Module, inst: InstId) -> Vec<TupleLeaf> {
    let mut leaves = Vec::new();
    let mut stack = vec![(inst, 0usize, Vec::new())];
    while let Some((id, base, chain)) = stack.pop() {
        let shape = module.inst(id).shape();
        if !shape.is_tuple() {
            leaves.push(TupleLeaf {
                flat_index: base,
                leaf: id,
                gte_chain: chain,
            });
            continue;
        }
        for &user in module.inst(id).users() {
            let user_inst = module.inst(user);
            if user_inst.kind() != OpKind::GetTupleElement {
                continue;
            }
            let Some(index) = user_inst.tuple_index() else {
                continue;
            };
            let mut next = chain.clone();
            next.push(user);
            stack.push((user, base + shape.flat_leaf_offset(index), next));
        }
    }
    leaves.sort_by_key(|l| (l.flat_index, l.leaf));
    leaves
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Opcode, PrimitiveType, Shape};

    #[test]
    fn test_tuple_leaves() {
        let leaf = Shape::array(PrimitiveType::F32, &[2]);
        let inner = Shape::tuple(vec![leaf.clone(), leaf.clone()]);
        let outer = Shape::tuple(vec![leaf.clone(), inner]);
        let mut m = Module::new("m");
        let c = m.add_computation("main");
        let p = m.add_parameter(c, 0, outer, Some("p"));
        let g0 = m.add_gte(c, p, 0).unwrap();
        let g1 = m.add_gte(c, p, 1).unwrap();
        let g11 = m.add_gte(c, g1, 1).unwrap();
        let t = m.add_instruction(c, Opcode::Add, leaf, vec![g0, g11], None);
        m.set_root(c, t);

        let leaves = tuple_leaves(&m, p);
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0], TupleLeaf { flat_index: 0, leaf: g0, gte_chain: vec![g0] });
        assert_eq!(leaves[1], TupleLeaf { flat_index: 2, leaf: g11, gte_chain: vec![g1, g11] });

        assert_eq!(tuple_leaves(&m, g0), vec![TupleLeaf { flat_index: 0, leaf: g0, gte_chain: vec![] }]);
    }

    #[test]
    fn test_ops_with_layout() {
        let mut map = TensorAllocationMap::new();
        map.insert(
            TensorSource::new(InstId(1), 0),
            TensorTarget {
                target: InstId(5),
                input_index: 1,
                layout_producer: Some(InstId(3)),
                layout_output_index: 0,
                layout_path: vec![InstId(4)],
                source_path: vec![InstId(2)],
            },
        );
        assert_eq!(ops_with_layout(&map), BTreeSet::from([InstId(1), InstId(4), InstId(5)]));
    }
}
