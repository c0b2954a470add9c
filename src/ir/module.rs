// This module implements the Module, the single owner of every computation and
// instruction of a compilation unit. Instructions and computations live in two module-wide
// arenas indexed by InstId/CompId; removal only marks an entry dead, so ids stay stable for
// the lifetime of the module. Every mutation (adding instructions, rewiring operands,
// replacing uses, adding or removing control edges, removing instructions and whole
// computations, cloning computations) is a Module method that updates operand lists, user
// lists and control edge lists together. The module also provides the post-order traversal
// all passes iterate in, caller lookup for computations, and a structural verifier used
// by tests and after each pass in debug runs.

//! Module: arenas of computations and instructions plus the mutation API.

use hashbrown::{HashMap, HashSet};

use super::computation::Computation;
use super::instruction::Instruction;
use super::opcode::{CallKind, Opcode};
use super::{CompId, InstId, Shape};
use crate::core::{PassError, PassResult};

#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    instructions: Vec<Instruction>,
    computations: Vec<Computation>,
    entry: Option<CompId>,
    inst_names: HashSet<String>,
    comp_names: HashSet<String>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Vec::new(),
            computations: Vec::new(),
            entry: None,
            inst_names: HashSet::new(),
            comp_names: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ---------------------------------------------------------------------
    // Lookup
    // ---------------------------------------------------------------------

    #[inline]
    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.instructions[id.index()]
    }

    #[inline]
    fn inst_mut(&mut self, id: InstId) -> &mut Instruction {
        &mut self.instructions[id.index()]
    }

    #[inline]
    pub fn computation(&self, id: CompId) -> &Computation {
        &self.computations[id.index()]
    }

    #[inline]
    fn computation_mut(&mut self, id: CompId) -> &mut Computation {
        &mut self.computations[id.index()]
    }

    /// Live computations in creation order.
    pub fn computation_ids(&self) -> Vec<CompId> {
        self.computations.iter().filter(|c| !c.removed).map(|c| c.id).collect()
    }

    pub fn entry(&self) -> Option<CompId> {
        self.entry
    }

    pub fn entry_computation(&self) -> PassResult<CompId> {
        self.entry
            .ok_or_else(|| PassError::failed_precondition(format!("module {} has no entry computation", self.name)))
    }

    pub fn set_entry(&mut self, comp: CompId) {
        self.entry = Some(comp);
    }

    pub fn find_computation(&self, name: &str) -> Option<CompId> {
        self.computations.iter().find(|c| !c.removed && c.name == name).map(|c| c.id)
    }

    pub fn find_instruction(&self, name: &str) -> Option<InstId> {
        self.instructions.iter().find(|i| !i.removed && i.name == name).map(|i| i.id)
    }

    pub fn is_live(&self, id: InstId) -> bool {
        self.instructions.get(id.index()).is_some_and(|i| !i.removed)
    }

    pub fn root(&self, comp: CompId) -> PassResult<InstId> {
        self.computation(comp)
            .root
            .ok_or_else(|| PassError::internal(format!("computation {} has no root", self.computation(comp).name)))
    }

    pub fn is_root(&self, id: InstId) -> bool {
        self.computation(self.inst(id).parent).root == Some(id)
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.iter().filter(|i| !i.removed).count()
    }

    /// Call instructions that invoke `comp`.
    pub fn callers(&self, comp: CompId) -> Vec<InstId> {
        self.instructions
            .iter()
            .filter(|i| !i.removed && i.called_computation() == Some(comp))
            .map(|i| i.id)
            .collect()
    }

    /// Whether `comp` is the body of a fusion.
    pub fn is_fusion_computation(&self, comp: CompId) -> bool {
        self.callers(comp).iter().any(|&c| self.inst(c).is_fusion())
    }

    /// Whether `comp` is the body of a repeat loop.
    pub fn is_repeat_body(&self, comp: CompId) -> bool {
        self.callers(comp).iter().any(|&c| self.inst(c).is_repeat_loop())
    }

    // ---------------------------------------------------------------------
    // Construction
    // ---------------------------------------------------------------------

    fn unique_name(names: &mut HashSet<String>, base: &str) -> String {
        if names.insert(base.to_string()) {
            return base.to_string();
        }
        let mut n = 1usize;
        loop {
            let candidate = format!("{}.{}", base, n);
            if names.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn add_computation(&mut self, name: &str) -> CompId {
        let id = CompId(self.computations.len() as u32);
        let name = Self::unique_name(&mut self.comp_names, name);
        self.computations.push(Computation::new(id, name));
        id
    }

    /// Adds an instruction to `comp` and links it into its operands' user lists.
    pub fn add_instruction(
        &mut self,
        comp: CompId,
        opcode: Opcode,
        shape: Shape,
        operands: Vec<InstId>,
        name: Option<&str>,
    ) -> InstId {
        let id = InstId(self.instructions.len() as u32);
        let name = Self::unique_name(&mut self.inst_names, name.unwrap_or(opcode.name()));
        let parameter = match opcode {
            Opcode::Parameter(n) => Some(n),
            _ => None,
        };
        for &op in &operands {
            let users = &mut self.instructions[op.index()].users;
            if !users.contains(&id) {
                users.push(id);
            }
        }
        self.instructions.push(Instruction {
            id,
            name,
            parent: comp,
            opcode,
            shape,
            operands,
            users: Vec::new(),
            control_predecessors: Vec::new(),
            control_successors: Vec::new(),
            sharding: None,
            metadata: None,
            backend_config: None,
            removed: false,
        });
        let computation = self.computation_mut(comp);
        computation.instructions.push(id);
        if let Some(n) = parameter {
            if computation.parameters.len() <= n {
                computation.parameters.resize(n + 1, None);
            }
            computation.parameters[n] = Some(id);
        }
        id
    }

    pub fn add_parameter(&mut self, comp: CompId, number: usize, shape: Shape, name: Option<&str>) -> InstId {
        self.add_instruction(comp, Opcode::Parameter(number), shape, Vec::new(), name)
    }

    pub fn add_gte(&mut self, comp: CompId, operand: InstId, index: usize) -> PassResult<InstId> {
        let shape = self.inst(operand).shape.tuple_element(index).cloned().ok_or_else(|| {
            PassError::internal(format!(
                "get-tuple-element index {} out of range for {}",
                index,
                self.inst(operand).short_string()
            ))
        })?;
        Ok(self.add_instruction(comp, Opcode::GetTupleElement(index), shape, vec![operand], None))
    }

    pub fn add_tuple(&mut self, comp: CompId, elements: Vec<InstId>) -> InstId {
        let shape = Shape::tuple(elements.iter().map(|&e| self.inst(e).shape.clone()).collect());
        self.add_instruction(comp, Opcode::Tuple, shape, elements, None)
    }

    /// Adds a call to `callee`; the output shape is the callee's root shape.
    pub fn add_call(
        &mut self,
        comp: CompId,
        callee: CompId,
        kind: CallKind,
        operands: Vec<InstId>,
        name: Option<&str>,
    ) -> PassResult<InstId> {
        let shape = self.inst(self.root(callee)?).shape.clone();
        Ok(self.add_instruction(comp, Opcode::Call { computation: callee, kind }, shape, operands, name))
    }

    /// Clones `src` into `comp` with new operands, carrying over its derived
    /// attributes (sharding, metadata, backend config).
    pub fn clone_instruction(&mut self, comp: CompId, src: InstId, operands: Vec<InstId>) -> InstId {
        let opcode = self.inst(src).opcode.clone();
        let shape = self.inst(src).shape.clone();
        let name = self.inst(src).name.clone();
        let id = self.add_instruction(comp, opcode, shape, operands, Some(&name));
        self.copy_derived_attributes(src, id);
        id
    }

    /// Copies sharding, metadata and backend config from `from` to `to`.
    pub fn copy_derived_attributes(&mut self, from: InstId, to: InstId) {
        let src = self.inst(from);
        let (sharding, metadata, config) = (src.sharding, src.metadata.clone(), src.backend_config.clone());
        let dst = self.inst_mut(to);
        dst.sharding = sharding;
        dst.metadata = metadata;
        dst.backend_config = config;
    }

    pub fn set_root(&mut self, comp: CompId, root: InstId) {
        self.computation_mut(comp).root = Some(root);
    }

    pub fn set_sharding(&mut self, id: InstId, sharding: Option<i64>) {
        self.inst_mut(id).sharding = sharding;
    }

    pub fn set_metadata(&mut self, id: InstId, metadata: Option<String>) {
        self.inst_mut(id).metadata = metadata;
    }

    pub fn set_backend_config(&mut self, id: InstId, config: Option<String>) {
        self.inst_mut(id).backend_config = config;
    }

    pub fn set_call_target(&mut self, call: InstId, callee: CompId) -> PassResult<()> {
        match &mut self.inst_mut(call).opcode {
            Opcode::Call { computation, .. } => {
                *computation = callee;
                Ok(())
            }
            other => Err(PassError::internal(format!("{} is not a call", other.name()))),
        }
    }

    // ---------------------------------------------------------------------
    // Rewiring
    // ---------------------------------------------------------------------

    fn unlink_user_if_unused(&mut self, operand: InstId, user: InstId) {
        if !self.inst(user).operands.contains(&operand) {
            self.inst_mut(operand).users.retain(|&u| u != user);
        }
    }

    fn link_user(&mut self, operand: InstId, user: InstId) {
        let users = &mut self.inst_mut(operand).users;
        if !users.contains(&user) {
            users.push(user);
        }
    }

    pub fn replace_operand_with(&mut self, user: InstId, index: usize, new: InstId) -> PassResult<()> {
        let old = self.inst(user).operand(index).ok_or_else(|| {
            PassError::internal(format!("operand {} out of range for {}", index, self.inst(user).short_string()))
        })?;
        if old == new {
            return Ok(());
        }
        self.inst_mut(user).operands[index] = new;
        self.unlink_user_if_unused(old, user);
        self.link_user(new, user);
        Ok(())
    }

    /// Replaces every use of `old` in `user` with `new`.
    pub fn replace_use_with(&mut self, old: InstId, user: InstId, new: InstId) -> PassResult<()> {
        let indices = self.inst(user).operand_indices(old);
        if indices.is_empty() {
            return Err(PassError::internal(format!(
                "{} is not an operand of {}",
                self.inst(old).short_string(),
                self.inst(user).short_string()
            )));
        }
        for index in indices {
            self.replace_operand_with(user, index, new)?;
        }
        Ok(())
    }

    /// Points every user of `old` (other than `new` itself) at `new`, and
    /// moves the computation root if `old` was it.
    pub fn replace_all_uses_with(&mut self, old: InstId, new: InstId) -> PassResult<()> {
        if old == new {
            return Ok(());
        }
        let users = self.inst(old).users.clone();
        for user in users {
            if user != new {
                self.replace_use_with(old, user, new)?;
            }
        }
        let comp = self.inst(old).parent;
        if self.computation(comp).root == Some(old) {
            self.set_root(comp, new);
        }
        Ok(())
    }

    pub fn add_control_dependency(&mut self, from: InstId, to: InstId) -> PassResult<()> {
        if self.inst(from).parent != self.inst(to).parent {
            return Err(PassError::internal(format!(
                "control edge {} -> {} crosses computations",
                self.inst(from).name,
                self.inst(to).name
            )));
        }
        if !self.inst(from).control_successors.contains(&to) {
            self.inst_mut(from).control_successors.push(to);
            self.inst_mut(to).control_predecessors.push(from);
        }
        Ok(())
    }

    pub fn remove_control_dependency(&mut self, from: InstId, to: InstId) {
        self.inst_mut(from).control_successors.retain(|&s| s != to);
        self.inst_mut(to).control_predecessors.retain(|&p| p != from);
    }

    /// Drops all control edges of `id`, relaying its predecessors to its
    /// successors so ordering is preserved.
    pub fn drop_all_control_deps(&mut self, id: InstId) -> PassResult<()> {
        let preds = std::mem::take(&mut self.inst_mut(id).control_predecessors);
        let succs = std::mem::take(&mut self.inst_mut(id).control_successors);
        for &p in &preds {
            self.inst_mut(p).control_successors.retain(|&s| s != id);
        }
        for &s in &succs {
            self.inst_mut(s).control_predecessors.retain(|&p| p != id);
        }
        for &p in &preds {
            for &s in &succs {
                self.add_control_dependency(p, s)?;
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Removal
    // ---------------------------------------------------------------------

    /// Removes an instruction that has no users and is not its computation's root.
    pub fn remove_instruction(&mut self, id: InstId) -> PassResult<()> {
        let inst = self.inst(id);
        if inst.removed {
            return Ok(());
        }
        if !inst.users.is_empty() {
            return Err(PassError::internal(format!("cannot remove {} which still has users", inst.short_string())));
        }
        if self.is_root(id) {
            return Err(PassError::internal(format!("cannot remove root {}", inst.short_string())));
        }
        self.drop_all_control_deps(id)?;
        let operands = std::mem::take(&mut self.inst_mut(id).operands);
        for op in operands {
            self.inst_mut(op).users.retain(|&u| u != id);
        }
        let inst = self.inst_mut(id);
        inst.removed = true;
        let (parent, parameter) = (inst.parent, inst.parameter_number());
        let comp = self.computation_mut(parent);
        comp.instructions.retain(|&i| i != id);
        if let Some(n) = parameter {
            if comp.parameters.get(n) == Some(&Some(id)) {
                comp.parameters[n] = None;
            }
        }
        Ok(())
    }

    /// Removes `id` and then every operand that became dead because of it.
    /// Parameters and roots are never removed this way.
    pub fn remove_instruction_and_unused_operands(&mut self, id: InstId) -> PassResult<()> {
        let mut worklist = vec![id];
        while let Some(next) = worklist.pop() {
            if self.inst(next).removed {
                continue;
            }
            let mut operands = self.inst(next).operands.clone();
            operands.dedup();
            self.remove_instruction(next)?;
            for op in operands {
                let inst = self.inst(op);
                if !inst.removed
                    && inst.users.is_empty()
                    && inst.control_successors.is_empty()
                    && inst.parameter_number().is_none()
                    && !self.is_root(op)
                {
                    worklist.push(op);
                }
            }
        }
        Ok(())
    }

    /// Removes a computation and all of its instructions. It must no longer be called.
    pub fn remove_computation(&mut self, comp: CompId) -> PassResult<()> {
        if let Some(&caller) = self.callers(comp).first() {
            return Err(PassError::internal(format!(
                "cannot remove computation {} still called by {}",
                self.computation(comp).name,
                self.inst(caller).short_string()
            )));
        }
        let members = std::mem::take(&mut self.computation_mut(comp).instructions);
        for id in members {
            let inst = self.inst_mut(id);
            inst.removed = true;
            inst.operands.clear();
            inst.users.clear();
            inst.control_predecessors.clear();
            inst.control_successors.clear();
        }
        let c = self.computation_mut(comp);
        c.parameters.clear();
        c.root = None;
        c.removed = true;
        if self.entry == Some(comp) {
            self.entry = None;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Traversal
    // ---------------------------------------------------------------------

    /// Every instruction of `comp` after all of its operands and control
    /// predecessors. Ties follow insertion order.
    pub fn post_order(&self, comp: CompId) -> Vec<InstId> {
        let computation = self.computation(comp);
        let mut order = Vec::with_capacity(computation.instructions.len());
        let mut visited: HashSet<InstId> = HashSet::with_capacity(computation.instructions.len());
        let mut stack: Vec<(InstId, bool)> = Vec::new();

        for &start in &computation.instructions {
            if visited.contains(&start) {
                continue;
            }
            stack.push((start, false));
            while let Some((id, expanded)) = stack.pop() {
                if expanded {
                    order.push(id);
                    continue;
                }
                if !visited.insert(id) {
                    continue;
                }
                stack.push((id, true));
                let inst = self.inst(id);
                // Reverse so the first operand is emitted first.
                for &pred in inst.control_predecessors.iter().rev().chain(inst.operands.iter().rev()) {
                    if !visited.contains(&pred) {
                        stack.push((pred, false));
                    }
                }
            }
        }
        order
    }

    /// Deep copy of `comp` as a new computation named `<name>.<suffix>`.
    pub fn clone_computation(&mut self, comp: CompId, suffix: &str) -> PassResult<CompId> {
        let name = format!("{}.{}", self.computation(comp).name, suffix);
        let new_comp = self.add_computation(&name);
        let mut mapping: HashMap<InstId, InstId> = HashMap::new();
        for old in self.post_order(comp) {
            let operands = self
                .inst(old)
                .operands
                .iter()
                .map(|op| mapping.get(op).copied())
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| PassError::internal("operand outside the cloned computation"))?;
            let new = self.clone_instruction(new_comp, old, operands);
            mapping.insert(old, new);
        }
        for (&old, &new) in &mapping {
            for pred in self.inst(old).control_predecessors.clone() {
                if let Some(&new_pred) = mapping.get(&pred) {
                    self.add_control_dependency(new_pred, new)?;
                }
            }
        }
        let root = self.root(comp)?;
        let new_root = mapping
            .get(&root)
            .copied()
            .ok_or_else(|| PassError::internal("root outside the cloned computation"))?;
        self.set_root(new_comp, new_root);
        Ok(new_comp)
    }

    // ---------------------------------------------------------------------
    // Verification
    // ---------------------------------------------------------------------

    /// Checks operand/user/control symmetry, parameter numbering and roots.
    pub fn verify(&self) -> PassResult<()> {
        for comp in self.computations.iter().filter(|c| !c.removed) {
            let root = comp
                .root
                .ok_or_else(|| PassError::internal(format!("computation {} has no root", comp.name)))?;
            if self.inst(root).removed || self.inst(root).parent != comp.id {
                return Err(PassError::internal(format!("computation {} has an invalid root", comp.name)));
            }
            for (n, p) in comp.parameters.iter().enumerate() {
                if p.is_none() {
                    return Err(PassError::internal(format!("computation {} is missing parameter {}", comp.name, n)));
                }
            }
            for &id in &comp.instructions {
                let inst = self.inst(id);
                if inst.removed || inst.parent != comp.id {
                    return Err(PassError::internal(format!("{} is listed in the wrong computation", inst.name)));
                }
                for &op in &inst.operands {
                    let operand = self.inst(op);
                    if operand.removed || operand.parent != comp.id {
                        return Err(PassError::internal(format!("{} has a dangling operand", inst.name)));
                    }
                    if !operand.users.contains(&id) {
                        return Err(PassError::internal(format!("{} is missing user {}", operand.name, inst.name)));
                    }
                }
                let mut seen = HashSet::new();
                for &user in &inst.users {
                    if !seen.insert(user) {
                        return Err(PassError::internal(format!("{} lists user {} twice", inst.name, user)));
                    }
                    if !self.inst(user).operands.contains(&id) {
                        return Err(PassError::internal(format!("{} lists stale user {}", inst.name, user)));
                    }
                }
                for &succ in &inst.control_successors {
                    if !self.inst(succ).control_predecessors.contains(&id) {
                        return Err(PassError::internal(format!("{} has a one-sided control edge", inst.name)));
                    }
                }
                if let Some(callee) = inst.called_computation() {
                    if self.computation(callee).removed {
                        return Err(PassError::internal(format!("{} calls a removed computation", inst.name)));
                    }
                    if self.computation(callee).num_parameters() != inst.operands.len() {
                        return Err(PassError::internal(format!(
                            "{} passes {} operands to {} which takes {}",
                            inst.name,
                            inst.operands.len(),
                            self.computation(callee).name,
                            self.computation(callee).num_parameters()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
