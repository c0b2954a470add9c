// This module implements forward allocation: propagating known tensor layouts to sources
// (parameters and infeeds) that have none. Instructions already in the allocation map are
// the layout producers. Everything reachable from a producer through non-producing
// instructions is an allocation dependent; the transposed relation gives each dependent
// its producer ancestors. For each unallocated source leaf the pass collects the consumers
// reachable through plain instructions (stopping at, but including, dependents), keeps the
// layout-sensitive dependents that are mutually independent (bias adds first, then
// normalisations, then the rest), and accepts the first one whose unique layout producer
// is connected to it by a valid path and can be ordered before the source. Acceptance adds
// control edges producer -> source and target -> every other candidate target; if any
// edge would close a cycle, every edge added for the candidate is removed again and the
// reachability index is refreshed for each touched instruction before moving on.

//! Forward allocation of layouts to unallocated sources.

use std::collections::BTreeSet;

use super::map::{ops_with_layout, tuple_leaves, TensorAllocationMap, TensorSource, TensorTarget};
use crate::analysis::{MetaGraph, ReachabilityMap};
use crate::core::{PassResult, PassSession};
use crate::ir::{CompId, InstId, Module, OpKind};
use crate::passes::Pass;

#[derive(Debug, Default)]
pub struct ForwardAllocation;

/// An unallocated source leaf and the instructions it can reach.
struct Candidate {
    source: TensorSource,
    leaf: InstId,
    gte_chain: Vec<InstId>,
    consumers: BTreeSet<InstId>,
}

fn output_and_all_operands_same_type(module: &Module, id: InstId) -> bool {
    let inst = module.inst(id);
    let ty = inst.shape().element_type();
    ty.is_some() && inst.operands().iter().all(|&op| module.inst(op).shape().element_type() == ty)
}

/// Interior nodes between a source and its target.
fn is_source_path_ok(module: &Module, path: &[InstId]) -> bool {
    MetaGraph::is_path_ok(path, |id, _, _| {
        let inst = module.inst(id);
        (inst.is_elementwise() || matches!(inst.kind(), OpKind::Reshape | OpKind::Transpose))
            && output_and_all_operands_same_type(module, id)
    })
}

/// Interior nodes between a layout producer and the target. A trailing
/// get-tuple-element is allowed; its index is the layout output index.
fn layout_path_output_index(module: &Module, path: &[InstId]) -> Option<usize> {
    let ok = MetaGraph::is_path_ok(path, |id, index, len| {
        let inst = module.inst(id);
        match inst.kind() {
            OpKind::GetTupleElement => index + 1 == len,
            OpKind::Reshape | OpKind::Transpose => output_and_all_operands_same_type(module, id),
            _ => inst.is_elementwise() && output_and_all_operands_same_type(module, id),
        }
    });
    if !ok {
        return None;
    }
    Some(path.last().and_then(|&id| module.inst(id).tuple_index()).unwrap_or(0))
}

/// Which operand of `target` (fed by `operand`) must follow the layout of
/// `layout_producer`, if any.
fn layout_sensitive_operand(
    module: &Module,
    target: InstId,
    operand: InstId,
    layout_producer: InstId,
) -> PassResult<Option<usize>> {
    let inst = module.inst(target);
    let Some(index) = inst.operand_index(operand) else {
        return Ok(None);
    };
    if inst.is_elementwise_binary() {
        return Ok(Some(index));
    }
    if inst.is_norm() {
        // Scale and offset follow the layout of operand 0.
        let sensitive = inst.operand(0) == Some(layout_producer) && (index == 1 || index == 2);
        return Ok(sensitive.then_some(index));
    }
    if let Some(deps) = inst.layout_dependencies()? {
        let sensitive = deps
            .get(&(index as i64))
            .and_then(|&dep| usize::try_from(dep).ok())
            .and_then(|dep| inst.operand(dep))
            == Some(layout_producer);
        return Ok(sensitive.then_some(index));
    }
    Ok(None)
}

/// Keeps the candidates no other candidate reaches, ordered bias adds
/// first, then normalisations, then everything else.
fn independent_targets(module: &Module, reachability: &ReachabilityMap, candidates: &[InstId]) -> Vec<InstId> {
    let independent: Vec<InstId> = candidates
        .iter()
        .copied()
        .filter(|&inst| {
            candidates
                .iter()
                .all(|&dep| dep == inst || !reachability.is_reachable(dep, inst))
        })
        .collect();
    let rank = |id: InstId| {
        let inst = module.inst(id);
        if inst.is_bias_add() {
            0
        } else if inst.is_norm() {
            1
        } else {
            2
        }
    };
    let mut ordered = independent;
    ordered.sort_by_key(|&id| (rank(id), id));
    ordered
}

impl ForwardAllocation {
    pub fn new() -> Self {
        Self
    }

    /// Adds producer -> leaf and target -> other target edges. Returns false
    /// after undoing every added edge if one of them would close a cycle.
    fn add_ordering(
        module: &mut Module,
        reachability: &mut ReachabilityMap,
        leaf: InstId,
        producer: InstId,
        target: InstId,
        targets: &[InstId],
    ) -> PassResult<bool> {
        let had_source_edge = module.inst(producer).control_successors().contains(&leaf);
        module.add_control_dependency(producer, leaf)?;
        reachability.update_through_instruction(module, leaf);

        let mut added = Vec::new();
        let mut ok = true;
        for &other in targets {
            if other == target {
                continue;
            }
            if reachability.is_reachable(other, target) {
                ok = false;
                break;
            }
            if !module.inst(target).control_successors().contains(&other) {
                module.add_control_dependency(target, other)?;
                reachability.update_through_instruction(module, other);
                added.push(other);
            }
        }
        if ok {
            return Ok(true);
        }

        log::trace!(
            "Rolling back ordering for %{} -> %{}",
            module.inst(producer).name(),
            module.inst(leaf).name()
        );
        if !had_source_edge {
            module.remove_control_dependency(producer, leaf);
            reachability.update_through_instruction(module, leaf);
        }
        for other in added {
            module.remove_control_dependency(target, other);
            reachability.update_through_instruction(module, other);
        }
        Ok(false)
    }

    fn run_on_computation(
        &self,
        module: &mut Module,
        comp: CompId,
        ops_with_layout: &BTreeSet<InstId>,
        map: &mut TensorAllocationMap,
        session: &PassSession<'_>,
    ) -> PassResult<bool> {
        let root = module.root(comp)?;
        let g = MetaGraph::from_operands(module, root);
        let is_layout_producer = |id: InstId| ops_with_layout.contains(&id);
        let layout_producing_ops = g.find_vertices(is_layout_producer);
        if layout_producing_ops.is_empty() {
            return Ok(false);
        }

        let layout_op_consumers = MetaGraph::from_vertices(layout_producing_ops.iter().copied(), |v| {
            g.find_consumers(v, |id| !is_layout_producer(id), false)
        });
        let alloc_dependencies = layout_op_consumers.transpose();

        let mut candidates = Vec::new();
        for source in g.find_vertices(|id| matches!(module.inst(id).kind(), OpKind::Parameter | OpKind::Infeed)) {
            for leaf in tuple_leaves(module, source) {
                let key = TensorSource::new(source, leaf.flat_index);
                if map.contains_key(&key) || !g.contains(leaf.leaf) {
                    continue;
                }
                let consumers = g.find_consumers(
                    leaf.leaf,
                    |id| !is_layout_producer(id) && !alloc_dependencies.contains(id) && !layout_producing_ops.contains(&id),
                    true,
                );
                if !consumers.is_empty() {
                    candidates.push(Candidate {
                        source: key,
                        leaf: leaf.leaf,
                        gte_chain: leaf.gte_chain,
                        consumers,
                    });
                }
            }
        }

        let mut reachability = ReachabilityMap::build(module, comp);
        let mut found_target = false;

        for candidate in candidates {
            let mut possible = Vec::new();
            for &id in &candidate.consumers {
                if alloc_dependencies.contains(id) && module.inst(id).is_layout_sensitive_target()? {
                    possible.push(id);
                }
            }
            let targets = independent_targets(module, &reachability, &possible);

            for &target in &targets {
                let Some(deps) = alloc_dependencies.get(target) else {
                    continue;
                };
                let producers: Vec<InstId> = deps.iter().copied().filter(|&d| !alloc_dependencies.contains(d)).collect();
                let [producer] = producers[..] else {
                    log::trace!(
                        "%{} has {} layout producers, skipping",
                        module.inst(target).name(),
                        producers.len()
                    );
                    continue;
                };

                let (Some(prefix), Some(suffix)) =
                    (g.shortest_path(candidate.leaf, target), g.shortest_path(producer, target))
                else {
                    continue;
                };
                if prefix.len() < 2 || suffix.len() < 2 {
                    continue;
                }
                let Some(input_index) = layout_sensitive_operand(module, target, prefix[prefix.len() - 2], producer)?
                else {
                    continue;
                };

                let source_interior = &prefix[1..prefix.len() - 1];
                let layout_interior = &suffix[1..suffix.len() - 1];
                if !is_source_path_ok(module, source_interior) {
                    log::trace!("Source path to %{} rejected", module.inst(target).name());
                    continue;
                }
                let Some(layout_output_index) = layout_path_output_index(module, layout_interior) else {
                    log::trace!("Layout path to %{} rejected", module.inst(target).name());
                    continue;
                };
                if candidate.consumers.contains(&producer) || reachability.is_reachable(candidate.leaf, producer) {
                    continue;
                }
                if !Self::add_ordering(module, &mut reachability, candidate.leaf, producer, target, &targets)? {
                    continue;
                }

                let mut source_path = candidate.gte_chain.clone();
                source_path.extend_from_slice(source_interior);
                log::debug!(
                    "Forwarding layout of %{} to %{}[{}] through %{} operand {}",
                    module.inst(producer).name(),
                    module.inst(candidate.source.instruction).name(),
                    candidate.source.output_index,
                    module.inst(target).name(),
                    input_index
                );
                map.insert(
                    candidate.source,
                    TensorTarget {
                        target,
                        input_index,
                        layout_producer: Some(producer),
                        layout_output_index,
                        layout_path: layout_interior.to_vec(),
                        source_path,
                    },
                );
                session.record_target_found();
                found_target = true;
                break;
            }
        }

        Ok(found_target)
    }
}

impl Pass for ForwardAllocation {
    fn name(&self) -> &str {
        "forward-allocation"
    }

    fn run(&mut self, module: &mut Module, session: &PassSession<'_>) -> PassResult<bool> {
        let mut annotations = session.annotations_mut();
        let map = &mut annotations.tensor_allocation_map;
        let ops_with_layout = ops_with_layout(map);

        let mut found_target = false;
        for comp in module.computation_ids() {
            if module.is_fusion_computation(comp) || module.is_repeat_body(comp) {
                continue;
            }
            found_target |= self.run_on_computation(module, comp, &ops_with_layout, map, session)?;
        }
        Ok(found_target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Opcode, PrimitiveType, Shape};

    #[test]
    fn test_layout_path_allows_trailing_gte_only() {
        let f = Shape::array(PrimitiveType::F32, &[4]);
        let mut m = Module::new("m");
        let c = m.add_computation("main");
        let p = m.add_parameter(c, 0, Shape::tuple(vec![f.clone(), f.clone()]), None);
        let g = m.add_gte(c, p, 1).unwrap();
        let e = m.add_instruction(c, Opcode::Exp, f.clone(), vec![g], None);
        let conv = m.add_instruction(c, Opcode::Convert, Shape::array(PrimitiveType::F16, &[4]), vec![e], None);
        m.set_root(c, conv);

        assert_eq!(layout_path_output_index(&m, &[e, g]), Some(1));
        assert_eq!(layout_path_output_index(&m, &[]), Some(0));
        assert_eq!(layout_path_output_index(&m, &[g, e]), None);
        assert!(is_source_path_ok(&m, &[e]));
        assert!(!is_source_path_ok(&m, &[conv]));
        assert!(!is_source_path_ok(&m, &[g]));
    }

    #[test]
    fn test_ordering_rolls_back_when_targets_depend_on_each_other() {
        let f = Shape::array(PrimitiveType::F32, &[4]);
        let mut m = Module::new("m");
        let c = m.add_computation("main");
        let x = m.add_parameter(c, 0, f.clone(), Some("x"));
        let w = m.add_parameter(c, 1, f.clone(), Some("w"));
        let p = m.add_parameter(c, 2, f.clone(), Some("p"));
        let q = m.add_parameter(c, 3, f.clone(), Some("q"));
        let prod = m.add_instruction(c, Opcode::Dot, f.clone(), vec![x, w], Some("prod"));
        let t1 = m.add_instruction(c, Opcode::Add, f.clone(), vec![prod, q], Some("t1"));
        let t2 = m.add_instruction(c, Opcode::Multiply, f.clone(), vec![t1, p], Some("t2"));
        let t3 = m.add_instruction(c, Opcode::Negate, f.clone(), vec![q], Some("t3"));
        let root = m.add_tuple(c, vec![t2, t3]);
        m.set_root(c, root);

        // t2 -> t3 is added first, then t1 already reaching t2 forces the undo.
        let mut reachability = ReachabilityMap::build(&m, c);
        let ok = ForwardAllocation::add_ordering(&mut m, &mut reachability, p, prod, t2, &[t3, t1, t2]).unwrap();
        assert!(!ok);
        m.verify().unwrap();

        assert!(m.inst(prod).control_successors().is_empty());
        assert!(m.inst(p).control_predecessors().is_empty());
        assert!(m.inst(t2).control_successors().is_empty());
        assert!(m.inst(t3).control_predecessors().is_empty());

        let fresh = ReachabilityMap::build(&m, c);
        let all = m.computation(c).instructions().to_vec();
        for &a in &all {
            for &b in &all {
                assert_eq!(
                    reachability.is_reachable(a, b),
                    fresh.is_reachable(a, b),
                    "{} -> {}",
                    m.inst(a).name(),
                    m.inst(b).name()
                );
            }
        }
        assert!(!reachability.is_reachable(prod, p));
        assert!(!reachability.is_reachable(t2, t3));
    }

    #[test]
    fn test_ordering_keeps_edges_for_independent_targets() {
        let f = Shape::array(PrimitiveType::F32, &[4]);
        let mut m = Module::new("m");
        let c = m.add_computation("main");
        let x = m.add_parameter(c, 0, f.clone(), Some("x"));
        let w = m.add_parameter(c, 1, f.clone(), Some("w"));
        let p = m.add_parameter(c, 2, f.clone(), Some("p"));
        let prod = m.add_instruction(c, Opcode::Dot, f.clone(), vec![x, w], Some("prod"));
        let t1 = m.add_instruction(c, Opcode::Add, f.clone(), vec![p, prod], Some("t1"));
        let t2 = m.add_instruction(c, Opcode::Multiply, f.clone(), vec![p, w], Some("t2"));
        let root = m.add_tuple(c, vec![t1, t2]);
        m.set_root(c, root);

        let mut reachability = ReachabilityMap::build(&m, c);
        assert!(ForwardAllocation::add_ordering(&mut m, &mut reachability, p, prod, t1, &[t1, t2]).unwrap());
        assert_eq!(m.inst(p).control_predecessors(), &[prod]);
        assert_eq!(m.inst(t1).control_successors(), &[t2]);
        assert!(reachability.is_reachable(prod, p));
        assert!(reachability.is_reachable(t1, t2));
    }
}
