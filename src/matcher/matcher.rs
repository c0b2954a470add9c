// This module implements the structural pattern matcher. Patterns are tried at every
// instruction of every eligible computation in post order; at each anchor the first pattern
// (in list order) whose match is accepted wins. A match starts by binding the pattern root
// (its first output) to the anchor and then resolves pattern edges one at a time: operand
// edges of bound fused nodes first, then user edges towards unbound nodes. Every choice
// point (several users, or several look-through candidates) is explored depth first with
// backtracking on a cloned search state. Look-through lets a node with an associative
// opcode find a wanted operand deeper inside a chain of single-user instructions of the
// same opcode and shape; the chain is recorded as a trace and re-associated before
// outlining. Accepted matches are handed to a MatchHandler. A match is rejected when it
// reuses an instruction consumed earlier in the run, when a fused non-output value escapes
// the match, when outlining would create a cycle, or when fused shardings disagree and
// unique sharding is required.

//! Pattern matching over computations.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use hashbrown::HashSet;

use super::pattern::{NodeId, OpcodeTarget, Pattern};
use crate::analysis::ReachabilityMap;
use crate::core::{MidendConfig, PassResult, PassSession};
use crate::ir::{CompId, InstId, Module};

/// One operand slot of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandRef {
    pub instruction: InstId,
    pub operand_index: usize,
}

/// A look-through path. The first entry is the slot the pattern wanted
/// filled; the rest walk the associative chain, and the operand of the
/// last entry is the instruction that was found.
pub type Trace = Vec<OperandRef>;

/// A successful structural match, consumed immediately by a handler.
#[derive(Debug, Clone)]
pub struct Match {
    pub computation: CompId,
    pub pattern_index: usize,
    pub instruction_mapping: BTreeMap<NodeId, InstId>,
    /// Bindings of negative (anonymous external parameter) operand ids.
    pub external_parameters: BTreeMap<NodeId, InstId>,
    pub replacement_traces: Vec<Trace>,
    /// Control predecessors of fused instructions that are not themselves fused.
    pub dependency_predecessors: Vec<InstId>,
}

impl Match {
    pub fn get(&self, node: NodeId) -> Option<InstId> {
        self.instruction_mapping.get(&node).copied()
    }

    /// Instructions bound to non-input nodes.
    pub fn fused_instructions(&self, pattern: &Pattern) -> BTreeSet<InstId> {
        self.instruction_mapping
            .iter()
            .filter(|(node, _)| !pattern.is_input(**node))
            .map(|(_, &inst)| inst)
            .collect()
    }

    /// Input instructions in pattern input order, deduplicated.
    pub fn input_instructions(&self, pattern: &Pattern) -> Vec<InstId> {
        let mut inputs = Vec::new();
        for &node in pattern.inputs() {
            if let Some(inst) = self.get(node) {
                if !inputs.contains(&inst) {
                    inputs.push(inst);
                }
            }
        }
        inputs
    }

    /// External parameter bindings ordered -1, -2, ..., deduplicated.
    pub fn external_instructions(&self) -> Vec<InstId> {
        let mut externals = Vec::new();
        for (_, &inst) in self.external_parameters.iter().rev() {
            if !externals.contains(&inst) {
                externals.push(inst);
            }
        }
        externals
    }

    /// Chain instructions walked by look-through.
    pub fn chain_members(&self) -> BTreeSet<InstId> {
        self.replacement_traces
            .iter()
            .flat_map(|t| t.iter().skip(1).map(|s| s.instruction))
            .collect()
    }
}

/// Receives accepted matches. Returns whether the module was changed.
pub trait MatchHandler {
    fn handle_match(
        &mut self,
        module: &mut Module,
        pattern: &Pattern,
        matched: &Match,
        sharding: Option<i64>,
        session: &PassSession<'_>,
    ) -> PassResult<bool>;
}

#[derive(Clone)]
struct SearchState {
    computation: CompId,
    bound: Vec<Option<InstId>>,
    externals: BTreeMap<NodeId, InstId>,
    /// Look-through traces keyed by (node, operand index).
    traces: BTreeMap<(usize, usize), Trace>,
}

impl SearchState {
    fn node_of(&self, inst: InstId) -> Option<usize> {
        self.bound.iter().position(|&b| b == Some(inst))
    }
}

#[derive(Debug, Clone)]
pub struct PatternMatcher {
    patterns: Vec<Pattern>,
    root_computation_only: bool,
    requires_unique_sharding: bool,
    look_through_max_depth: usize,
}

impl PatternMatcher {
    pub fn new(patterns: Vec<Pattern>, config: &MidendConfig) -> Self {
        Self {
            patterns,
            root_computation_only: config.root_computation_only,
            requires_unique_sharding: config.requires_unique_sharding,
            look_through_max_depth: config.look_through_max_depth,
        }
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    /// Structural match of pattern `pattern_index` rooted at `anchor`.
    /// None of the run-level rejection rules are applied.
    pub fn match_pattern(&self, module: &Module, anchor: InstId, pattern_index: usize) -> Option<Match> {
        let pattern = self.patterns.get(pattern_index)?;
        let mut state = SearchState {
            computation: module.inst(anchor).parent(),
            bound: vec![None; pattern.nodes().len()],
            externals: BTreeMap::new(),
            traces: BTreeMap::new(),
        };
        let root = pattern.root() as usize;
        if !self.can_bind(module, pattern, &state, root, anchor) {
            return None;
        }
        state.bound[root] = Some(anchor);
        let state = self.solve(module, pattern, state)?;

        let instruction_mapping: BTreeMap<NodeId, InstId> = state
            .bound
            .iter()
            .enumerate()
            .filter_map(|(n, b)| b.map(|inst| (n as NodeId, inst)))
            .collect();
        let fused: BTreeSet<InstId> = instruction_mapping
            .iter()
            .filter(|(node, _)| !pattern.is_input(**node))
            .map(|(_, &inst)| inst)
            .collect();
        let mut dependency_predecessors = Vec::new();
        for &inst in &fused {
            for &pred in module.inst(inst).control_predecessors() {
                if !fused.contains(&pred) && !dependency_predecessors.contains(&pred) {
                    dependency_predecessors.push(pred);
                }
            }
        }
        Some(Match {
            computation: state.computation,
            pattern_index,
            instruction_mapping,
            external_parameters: state.externals,
            replacement_traces: state.traces.into_values().collect(),
            dependency_predecessors,
        })
    }

    fn can_bind(&self, module: &Module, pattern: &Pattern, state: &SearchState, node: usize, inst: InstId) -> bool {
        if !module.is_live(inst) || module.inst(inst).parent() != state.computation {
            return false;
        }
        let pattern_node = &pattern.nodes()[node];
        if !pattern_node.accepts(module, inst) {
            return false;
        }
        let is_input = pattern.is_input(node as NodeId);
        match state.node_of(inst) {
            None => {}
            Some(other) => {
                // An instruction may back several input nodes, never a fused one.
                if !is_input || !pattern.is_input(other as NodeId) {
                    return false;
                }
            }
        }
        is_input || module.inst(inst).operand_count() == pattern_node.operands.len()
    }

    fn solve(&self, module: &Module, pattern: &Pattern, mut state: SearchState) -> Option<SearchState> {
        let nodes = pattern.nodes();

        // Operand edges of bound fused nodes.
        for n in 0..nodes.len() {
            let Some(inst) = state.bound[n] else {
                continue;
            };
            if pattern.is_input(n as NodeId) {
                continue;
            }
            for (k, &op) in nodes[n].operands.iter().enumerate() {
                let actual = module.inst(inst).operand(k)?;
                if op < 0 {
                    match state.externals.get(&op) {
                        Some(&bound) if bound != actual => return None,
                        Some(_) => {}
                        None => {
                            state.externals.insert(op, actual);
                        }
                    }
                    continue;
                }
                let o = op as usize;
                if let Some(bound) = state.bound[o] {
                    let traced = state
                        .traces
                        .get(&(n, k))
                        .and_then(|t| t.last())
                        .and_then(|s| module.inst(s.instruction).operand(s.operand_index));
                    if bound != actual && traced != Some(bound) {
                        return None;
                    }
                    continue;
                }

                let mut candidates: Vec<(InstId, Option<Trace>)> = Vec::new();
                if self.can_bind(module, pattern, &state, o, actual) {
                    candidates.push((actual, None));
                } else if self.look_through_max_depth > 0
                    && module.inst(inst).kind().is_associative()
                    && matches!(nodes[o].target, OpcodeTarget::Exact(_))
                {
                    for (found, trace) in self.look_through(module, inst, k) {
                        if self.can_bind(module, pattern, &state, o, found) {
                            candidates.push((found, Some(trace)));
                        }
                    }
                }
                for (candidate, trace) in candidates {
                    let mut next = state.clone();
                    next.bound[o] = Some(candidate);
                    if let Some(trace) = trace {
                        next.traces.insert((n, k), trace);
                    }
                    if let Some(done) = self.solve(module, pattern, next) {
                        return Some(done);
                    }
                }
                return None;
            }
        }

        // User edges towards unbound fused nodes.
        for n in 0..nodes.len() {
            if state.bound[n].is_some() || pattern.is_input(n as NodeId) {
                continue;
            }
            let Some((k, operand)) = nodes[n]
                .operands
                .iter()
                .enumerate()
                .find_map(|(k, &op)| (op >= 0).then(|| state.bound[op as usize]).flatten().map(|i| (k, i)))
            else {
                continue;
            };
            for &user in module.inst(operand).users() {
                if module.inst(user).operand(k) != Some(operand) || !self.can_bind(module, pattern, &state, n, user) {
                    continue;
                }
                let mut next = state.clone();
                next.bound[n] = Some(user);
                if let Some(done) = self.solve(module, pattern, next) {
                    return Some(done);
                }
            }
            return None;
        }

        if state.bound.iter().any(Option::is_none) {
            return None;
        }
        // Chain instructions are rewired by re-association and must not be fused.
        let chain_is_fused = state.traces.values().flat_map(|t| t.iter().skip(1)).any(|s| {
            state
                .node_of(s.instruction)
                .is_some_and(|node| !pattern.is_input(node as NodeId))
        });
        if chain_is_fused {
            return None;
        }
        Some(state)
    }

    /// Candidates for operand `k` of `inst` found inside its associative
    /// chain, breadth first, with the trace leading to each.
    fn look_through(&self, module: &Module, inst: InstId, k: usize) -> Vec<(InstId, Trace)> {
        let root = module.inst(inst);
        let is_link = |parent: InstId, id: InstId| {
            let candidate = module.inst(id);
            candidate.kind() == root.kind() && candidate.shape() == root.shape() && candidate.users() == [parent]
        };

        let mut found = Vec::new();
        let mut queue = VecDeque::new();
        for (j, &op) in root.operands().iter().enumerate() {
            if j != k && is_link(inst, op) {
                queue.push_back((op, vec![OperandRef { instruction: inst, operand_index: k }], 1usize));
            }
        }
        while let Some((member, trace, depth)) = queue.pop_front() {
            for (j, &op) in module.inst(member).operands().iter().enumerate() {
                let mut next = trace.clone();
                next.push(OperandRef {
                    instruction: member,
                    operand_index: j,
                });
                if is_link(member, op) && depth < self.look_through_max_depth {
                    queue.push_back((op, next.clone(), depth + 1));
                }
                found.push((op, next));
            }
        }
        found
    }

    /// Users of `inst` once every trace has been re-associated.
    fn effective_users(module: &Module, traces: &[Trace], inst: InstId) -> BTreeSet<InstId> {
        let mut users: BTreeSet<InstId> = module.inst(inst).users().iter().copied().collect();
        for trace in traces {
            let (Some(slot), Some(last)) = (trace.first(), trace.last()) else {
                continue;
            };
            let leaf = module.inst(slot.instruction).operand(slot.operand_index);
            let found = module.inst(last.instruction).operand(last.operand_index);
            if found == Some(inst) {
                users.remove(&last.instruction);
                users.insert(slot.instruction);
            }
            if leaf == Some(inst) {
                users.remove(&slot.instruction);
                users.insert(last.instruction);
            }
        }
        users
    }

    /// Whether any of `targets` is reachable from `from` over data and
    /// control edges once every trace has been re-associated.
    fn reaches_after_reassociation(
        module: &Module,
        traces: &[Trace],
        from: &BTreeSet<InstId>,
        targets: &[InstId],
    ) -> bool {
        let mut visited: HashSet<InstId> = from.iter().copied().collect();
        let mut stack: Vec<InstId> = from.iter().copied().collect();
        while let Some(id) = stack.pop() {
            let users = Self::effective_users(module, traces, id);
            for next in users.into_iter().chain(module.inst(id).control_successors().iter().copied()) {
                if targets.contains(&next) {
                    return true;
                }
                if visited.insert(next) {
                    stack.push(next);
                }
            }
        }
        false
    }

    /// Run-level acceptance. Returns the sharding the outlined call gets.
    fn check_match(
        &self,
        module: &Module,
        pattern: &Pattern,
        matched: &Match,
        reachability: &ReachabilityMap,
        consumed: &HashSet<InstId>,
    ) -> Result<Option<i64>, &'static str> {
        let fused = matched.fused_instructions(pattern);
        if fused.iter().chain(&matched.chain_members()).any(|i| consumed.contains(i)) {
            return Err("instruction already consumed by an earlier match");
        }

        let outputs: BTreeSet<InstId> = pattern.outputs().iter().filter_map(|&n| matched.get(n)).collect();
        for &inst in fused.difference(&outputs) {
            if !Self::effective_users(module, &matched.replacement_traces, inst).is_subset(&fused) {
                return Err("fused value is used outside the match");
            }
        }

        // The call is ordered after every input and every outside control
        // predecessor, so no fused instruction may reach any of them.
        let inputs: Vec<InstId> = matched
            .input_instructions(pattern)
            .into_iter()
            .chain(matched.external_instructions())
            .chain(matched.dependency_predecessors.iter().copied())
            .collect();
        let creates_cycle = if matched.replacement_traces.is_empty() {
            fused.iter().any(|&f| inputs.iter().any(|&i| reachability.is_reachable(f, i)))
        } else {
            Self::reaches_after_reassociation(module, &matched.replacement_traces, &fused, &inputs)
        };
        if creates_cycle {
            return Err("outlining would create a cycle");
        }

        let shardings: BTreeSet<Option<i64>> = fused.iter().map(|&f| module.inst(f).sharding()).collect();
        if shardings.len() > 1 {
            if self.requires_unique_sharding {
                return Err("fused instructions disagree on sharding");
            }
            return Ok(None);
        }
        Ok(shardings.into_iter().next().flatten())
    }

    fn match_computation(
        &self,
        module: &mut Module,
        comp: CompId,
        handler: &mut dyn MatchHandler,
        consumed: &mut HashSet<InstId>,
        session: &PassSession<'_>,
    ) -> PassResult<bool> {
        let mut reachability = ReachabilityMap::build(module, comp);
        let mut changed = false;
        for anchor in module.post_order(comp) {
            if !module.is_live(anchor) || consumed.contains(&anchor) {
                continue;
            }
            for (index, pattern) in self.patterns.iter().enumerate() {
                let Some(matched) = self.match_pattern(module, anchor, index) else {
                    continue;
                };
                let sharding = match self.check_match(module, pattern, &matched, &reachability, consumed) {
                    Ok(sharding) => sharding,
                    Err(reason) => {
                        log::trace!("{} at %{} rejected: {}", pattern.ty(), module.inst(anchor).name(), reason);
                        continue;
                    }
                };
                let fused = matched.fused_instructions(pattern);
                let chain = matched.chain_members();
                if handler.handle_match(module, pattern, &matched, sharding, session)? {
                    consumed.extend(fused);
                    consumed.extend(chain);
                    reachability = ReachabilityMap::build(module, comp);
                    changed = true;
                    break;
                }
            }
        }
        Ok(changed)
    }

    /// Matches every pattern over the module, handing accepted matches to
    /// `handler`. Returns whether any handler changed the module.
    pub fn run(
        &self,
        module: &mut Module,
        handler: &mut dyn MatchHandler,
        session: &PassSession<'_>,
    ) -> PassResult<bool> {
        let computations = if self.root_computation_only {
            vec![module.entry_computation()?]
        } else {
            module.computation_ids()
        };
        let mut consumed = HashSet::new();
        let mut changed = false;
        for comp in computations {
            if module.is_fusion_computation(comp) {
                continue;
            }
            changed |= self.match_computation(module, comp, handler, &mut consumed, session)?;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{OpKind, Opcode, PrimitiveType, Shape};
    use crate::matcher::pattern::PatternNode;

    fn f32v() -> Shape {
        Shape::array(PrimitiveType::F32, &[4])
    }

    fn add_of_anything() -> Pattern {
        Pattern::new(
            "add",
            0,
            vec![1, 2],
            vec![],
            vec![0],
            vec![PatternNode::new(OpKind::Add, &[1, 2]), PatternNode::input(), PatternNode::input()],
        )
        .unwrap()
    }

    fn matcher(patterns: Vec<Pattern>, depth: usize) -> PatternMatcher {
        let config = MidendConfig {
            look_through_max_depth: depth,
            ..MidendConfig::default()
        };
        PatternMatcher::new(patterns, &config)
    }

    #[test]
    fn test_add_pattern_matches_add_not_multiply() {
        let mut m = Module::new("m");
        let c = m.add_computation("main");
        let a = m.add_parameter(c, 0, f32v(), Some("a"));
        let b = m.add_parameter(c, 1, f32v(), Some("b"));
        let e = m.add_instruction(c, Opcode::Exp, f32v(), vec![a], Some("e"));
        let add = m.add_instruction(c, Opcode::Add, f32v(), vec![e, b], Some("add"));
        let mul = m.add_instruction(c, Opcode::Multiply, f32v(), vec![add, b], Some("mul"));
        m.set_root(c, mul);

        let matcher = matcher(vec![add_of_anything()], 0);
        let found = matcher.match_pattern(&m, add, 0).unwrap();
        assert_eq!(found.get(0), Some(add));
        assert_eq!(found.get(1), Some(e));
        assert_eq!(found.get(2), Some(b));
        assert!(matcher.match_pattern(&m, mul, 0).is_none());
    }

    #[test]
    fn test_negative_operands_must_agree() {
        let pattern = Pattern::new(
            "square",
            0,
            vec![],
            vec![],
            vec![0],
            vec![PatternNode::new(OpKind::Multiply, &[-1, -1])],
        )
        .unwrap();
        let mut m = Module::new("m");
        let c = m.add_computation("main");
        let a = m.add_parameter(c, 0, f32v(), Some("a"));
        let b = m.add_parameter(c, 1, f32v(), Some("b"));
        let sq = m.add_instruction(c, Opcode::Multiply, f32v(), vec![a, a], Some("sq"));
        let ab = m.add_instruction(c, Opcode::Multiply, f32v(), vec![sq, b], Some("ab"));
        m.set_root(c, ab);

        let matcher = matcher(vec![pattern], 0);
        let found = matcher.match_pattern(&m, sq, 0).unwrap();
        assert_eq!(found.external_instructions(), vec![a]);
        assert!(matcher.match_pattern(&m, ab, 0).is_none());
    }

    #[test]
    fn test_look_through_finds_operand_in_chain() {
        // x = add(y, c), y = add(z, e), e = exp(p): wanted add(?, exp(?)).
        let pattern = Pattern::new(
            "add_exp",
            0,
            vec![1, 3],
            vec![],
            vec![0],
            vec![
                PatternNode::new(OpKind::Add, &[1, 2]),
                PatternNode::input(),
                PatternNode::new(OpKind::Exp, &[3]),
                PatternNode::input(),
            ],
        )
        .unwrap();
        let mut m = Module::new("m");
        let c = m.add_computation("main");
        let p = m.add_parameter(c, 0, f32v(), Some("p"));
        let z = m.add_parameter(c, 1, f32v(), Some("z"));
        let k = m.add_parameter(c, 2, f32v(), Some("k"));
        let e = m.add_instruction(c, Opcode::Exp, f32v(), vec![p], Some("e"));
        let y = m.add_instruction(c, Opcode::Add, f32v(), vec![z, e], Some("y"));
        let x = m.add_instruction(c, Opcode::Add, f32v(), vec![y, k], Some("x"));
        m.set_root(c, x);

        assert!(matcher(vec![pattern.clone()], 0).match_pattern(&m, x, 0).is_none());

        let found = matcher(vec![pattern], 2).match_pattern(&m, x, 0).unwrap();
        assert_eq!(found.get(2), Some(e));
        assert_eq!(found.get(1), Some(y));
        assert_eq!(
            found.replacement_traces,
            vec![vec![
                OperandRef { instruction: x, operand_index: 1 },
                OperandRef { instruction: y, operand_index: 1 },
            ]]
        );
        assert_eq!(found.chain_members(), BTreeSet::from([y]));
    }

    #[test]
    fn test_user_edges_are_followed() {
        // Two outputs: exp(a) and the add consuming it.
        let pattern = Pattern::new(
            "exp_and_add",
            1,
            vec![2, 3],
            vec![],
            vec![0, 1],
            vec![
                PatternNode::new(OpKind::Exp, &[2]),
                PatternNode::new(OpKind::Add, &[0, 3]),
                PatternNode::input(),
                PatternNode::input(),
            ],
        )
        .unwrap();
        let mut m = Module::new("m");
        let c = m.add_computation("main");
        let a = m.add_parameter(c, 0, f32v(), Some("a"));
        let b = m.add_parameter(c, 1, f32v(), Some("b"));
        let e = m.add_instruction(c, Opcode::Exp, f32v(), vec![a], Some("e"));
        let s = m.add_instruction(c, Opcode::Add, f32v(), vec![e, b], Some("s"));
        let t = m.add_tuple(c, vec![e, s]);
        m.set_root(c, t);

        let found = matcher(vec![pattern], 0).match_pattern(&m, e, 0).unwrap();
        assert_eq!(found.get(1), Some(s));
        assert_eq!(found.get(3), Some(b));
    }
}
