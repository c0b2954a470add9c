// This module implements the rewrites the pipeline fixer is built from. The central one
// splices instructions of the pipeline body into a stage: the stage body is cloned, the
// spliced instructions are cloned after it with their outside operands turned into new
// stage parameters (existing parameters and the stage's own outputs are reused), values
// still needed outside the stage become extra root tuple outputs reached through one
// get-tuple-element per use, and the old call and body are dropped. The dual rewrites
// remove parameters or outputs from a stage and renumber what remains. The repair
// rewrites establish what the splice relies on: each stage has a private body, is only
// used through get-tuple-element instructions, and every such instruction has one user.

//! Stage rewrites over a pipeline body.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::{HashMap, HashSet};

use super::stages::PipelineStages;
use crate::core::{PassError, PassResult};
use crate::ir::{CompId, InstId, Module, OpKind};

fn stage_body(module: &Module, stage: InstId) -> PassResult<CompId> {
    module
        .inst(stage)
        .called_computation()
        .ok_or_else(|| PassError::internal(format!("{} is not a pipeline stage", module.inst(stage).short_string())))
}

fn tuple_root(module: &Module, comp: CompId) -> PassResult<InstId> {
    let root = module.root(comp)?;
    if module.inst(root).kind() != OpKind::Tuple {
        return Err(PassError::unimplemented(format!(
            "expected the root of {} to be a tuple",
            module.computation(comp).name()
        )));
    }
    Ok(root)
}

/// Clones `comp` without the parameters numbered in `skip`, renumbering the
/// remaining parameters contiguously. Skipped parameters must be unused.
fn clone_body(module: &mut Module, comp: CompId, skip: &BTreeSet<usize>) -> PassResult<CompId> {
    let name = module.computation(comp).name().to_string();
    let new_comp = module.add_computation(&name);
    let mut mapping: HashMap<InstId, InstId> = HashMap::new();
    for old in module.post_order(comp) {
        let inst = module.inst(old);
        if let Some(number) = inst.parameter_number() {
            if skip.contains(&number) {
                if inst.user_count() != 0 || module.is_root(old) {
                    return Err(PassError::failed_precondition(format!(
                        "cannot remove parameter {} of {} which is still used",
                        number,
                        module.computation(comp).name()
                    )));
                }
                continue;
            }
            let renumbered = number - skip.range(..number).count();
            let (shape, param_name) = (inst.shape().clone(), inst.name().to_string());
            let param = module.add_parameter(new_comp, renumbered, shape, Some(&param_name));
            module.copy_derived_attributes(old, param);
            mapping.insert(old, param);
            continue;
        }
        let operands = inst
            .operands()
            .iter()
            .map(|op| mapping.get(op).copied())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| PassError::internal("operand outside the cloned stage body"))?;
        let new = module.clone_instruction(new_comp, old, operands);
        mapping.insert(old, new);
    }
    for (&old, &new) in &mapping {
        for pred in module.inst(old).control_predecessors().to_vec() {
            if let Some(&new_pred) = mapping.get(&pred) {
                module.add_control_dependency(new_pred, new)?;
            }
        }
    }
    let root = module.root(comp)?;
    let new_root = mapping
        .get(&root)
        .copied()
        .ok_or_else(|| PassError::internal("stage root was not cloned"))?;
    module.set_root(new_comp, new_root);
    Ok(new_comp)
}

/// Replaces `stage` by a call of the same kind to `new_body` with `operands`,
/// moving every use and control edge over. The old body is removed once it
/// has no callers left.
pub fn replace_pipeline_stage_with(
    module: &mut Module,
    stage: InstId,
    new_body: CompId,
    operands: Vec<InstId>,
    remove_unused_operands: bool,
) -> PassResult<InstId> {
    let pipeline = module.inst(stage).parent();
    let old_body = stage_body(module, stage)?;
    let kind = module
        .inst(stage)
        .call_kind()
        .cloned()
        .ok_or_else(|| PassError::internal("pipeline stage without a call kind"))?;
    let name = module.inst(stage).name().to_string();
    let new_stage = module.add_call(pipeline, new_body, kind, operands, Some(&name))?;
    module.copy_derived_attributes(stage, new_stage);

    for pred in module.inst(stage).control_predecessors().to_vec() {
        module.remove_control_dependency(pred, stage);
        module.add_control_dependency(pred, new_stage)?;
    }
    for succ in module.inst(stage).control_successors().to_vec() {
        module.remove_control_dependency(stage, succ);
        module.add_control_dependency(new_stage, succ)?;
    }
    module.replace_all_uses_with(stage, new_stage)?;
    if remove_unused_operands {
        module.remove_instruction_and_unused_operands(stage)?;
    } else {
        module.remove_instruction(stage)?;
    }
    if module.callers(old_body).is_empty() {
        module.remove_computation(old_body)?;
    }
    Ok(new_stage)
}

/// Removes get-tuple-element users of `stage` that became dead, and the
/// dead instruction hanging off a single-user one.
fn remove_pipeline_stage_dead_users(module: &mut Module, stage: InstId) -> PassResult<()> {
    for user in module.inst(stage).users().to_vec() {
        if !module.is_live(user) || module.inst(user).tuple_index().is_none() || module.is_root(user) {
            continue;
        }
        let users = module.inst(user).users().to_vec();
        match users[..] {
            [] => module.remove_instruction(user)?,
            [next] => {
                let inst = module.inst(next);
                if inst.user_count() == 0
                    && inst.called_computation().is_none()
                    && inst.control_successors().is_empty()
                    && !module.is_root(next)
                {
                    module.remove_instruction_and_unused_operands(next)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Splices `ordered` (in dependency order) into `stage` and returns the new
/// stage call.
///
/// Operands of spliced instructions that are not spliced themselves become
/// stage parameters, reusing existing ones; a get-tuple-element on `stage`
/// itself reads the stage's root tuple directly. `replace_params` maps
/// stage parameter numbers to spliced instructions that replace them inside
/// the body. `forced_params` become parameters even when nothing spliced
/// uses them. Spliced values used outside the stage are appended to the
/// root tuple and each use is rewired through its own get-tuple-element.
pub fn add_instructions_to_pipeline_stage(
    module: &mut Module,
    stage: InstId,
    ordered: &[InstId],
    replace_params: &BTreeMap<usize, InstId>,
    forced_params: &[InstId],
) -> PassResult<InstId> {
    let pipeline = module.inst(stage).parent();
    let body = stage_body(module, stage)?;
    tuple_root(module, body)?;
    let splice: BTreeSet<InstId> = ordered.iter().copied().collect();
    if splice.len() != ordered.len() {
        return Err(PassError::internal("instruction spliced into a stage more than once"));
    }
    for &inst in ordered {
        if module.inst(inst).parent() != pipeline || module.is_root(inst) || inst == stage {
            return Err(PassError::internal(format!(
                "cannot splice {} into pipeline stage {}",
                module.inst(inst).short_string(),
                module.inst(stage).name()
            )));
        }
    }

    let new_body = clone_body(module, body, &BTreeSet::new())?;
    let root = tuple_root(module, new_body)?;
    let old_num_outputs = module.inst(root).operand_count();
    let mut operands = module.inst(stage).operands().to_vec();
    let mut lowered: HashMap<InstId, InstId> = HashMap::new();

    let add_operand = |module: &mut Module, operands: &mut Vec<InstId>, op: InstId| -> PassResult<InstId> {
        if let Some(index) = operands.iter().position(|&o| o == op) {
            return module
                .computation(new_body)
                .parameter(index)
                .ok_or_else(|| PassError::internal(format!("stage body is missing parameter {}", index)));
        }
        let number = operands.len();
        let shape = module.inst(op).shape().clone();
        operands.push(op);
        Ok(module.add_parameter(new_body, number, shape, None))
    };

    for &inst in ordered {
        let mut new_operands = Vec::with_capacity(module.inst(inst).operand_count());
        for op in module.inst(inst).operands().to_vec() {
            let new_op = if let Some(&l) = lowered.get(&op) {
                l
            } else if splice.contains(&op) {
                return Err(PassError::internal(format!(
                    "spliced instructions are not in dependency order at {}",
                    module.inst(op).short_string()
                )));
            } else if let Some(index) = module
                .inst(op)
                .tuple_index()
                .filter(|_| module.inst(op).operand(0) == Some(stage))
            {
                module.inst(root).operand(index).ok_or_else(|| {
                    PassError::internal(format!("stage {} has no output {}", module.inst(stage).name(), index))
                })?
            } else {
                add_operand(module, &mut operands, op)?
            };
            lowered.insert(op, new_op);
            new_operands.push(new_op);
        }
        let new = module.clone_instruction(new_body, inst, new_operands);
        lowered.insert(inst, new);
    }
    for &forced in forced_params {
        if !lowered.contains_key(&forced) {
            let param = add_operand(module, &mut operands, forced)?;
            lowered.insert(forced, param);
        }
    }

    let mut outputs: Vec<InstId> = Vec::new();
    for &inst in ordered.iter().chain(forced_params) {
        let external = module.inst(inst).users().iter().any(|&u| u != stage && !splice.contains(&u));
        if external && !outputs.contains(&inst) {
            outputs.push(inst);
        }
    }

    for (&number, &inst) in replace_params {
        let param = module.computation(new_body).parameter(number).ok_or_else(|| {
            PassError::internal(format!("stage {} has no parameter {}", module.inst(stage).name(), number))
        })?;
        let replacement = lowered
            .get(&inst)
            .copied()
            .filter(|_| splice.contains(&inst))
            .ok_or_else(|| PassError::internal("parameter replacement was not spliced into the stage"))?;
        module.replace_all_uses_with(param, replacement)?;
    }

    let mut elements = module.inst(root).operands().to_vec();
    for output in &outputs {
        elements.push(
            lowered
                .get(output)
                .copied()
                .ok_or_else(|| PassError::internal("stage output was not lowered"))?,
        );
    }
    let new_root = module.add_tuple(new_body, elements);
    module.set_root(new_body, new_root);
    module.remove_instruction(root)?;

    let new_stage = replace_pipeline_stage_with(module, stage, new_body, operands, false)?;

    for (offset, &output) in outputs.iter().enumerate() {
        let index = old_num_outputs + offset;
        let users: Vec<InstId> = module
            .inst(output)
            .users()
            .iter()
            .copied()
            .filter(|&u| u != new_stage && !splice.contains(&u))
            .collect();
        for user in users {
            for operand_index in module.inst(user).operand_indices(output) {
                let gte = module.add_gte(pipeline, new_stage, index)?;
                module.replace_operand_with(user, operand_index, gte)?;
            }
        }
    }

    for &inst in ordered.iter().rev() {
        if module.inst(inst).user_count() == 0 && !module.is_root(inst) {
            module.remove_instruction(inst)?;
        }
    }
    remove_pipeline_stage_dead_users(module, new_stage)?;
    log::debug!(
        "Lowered {} instruction(s) into pipeline stage %{}",
        ordered.len(),
        module.inst(new_stage).name()
    );
    Ok(new_stage)
}

/// Parameter numbers of `stage`'s body that nothing uses.
pub fn unused_parameters(module: &Module, stage: InstId) -> PassResult<BTreeSet<usize>> {
    let body = stage_body(module, stage)?;
    Ok(module
        .computation(body)
        .parameters()
        .filter(|&p| module.inst(p).user_count() == 0 && !module.is_root(p))
        .filter_map(|p| module.inst(p).parameter_number())
        .collect())
}

/// Output indices of `stage` that no get-tuple-element reads.
pub fn unused_outputs(module: &Module, stage: InstId) -> PassResult<BTreeSet<usize>> {
    let root = tuple_root(module, stage_body(module, stage)?)?;
    let inst = module.inst(stage);
    if module.is_root(stage) || inst.users().iter().any(|&u| module.inst(u).tuple_index().is_none()) {
        return Ok(BTreeSet::new());
    }
    let used: BTreeSet<usize> = inst.users().iter().filter_map(|&u| module.inst(u).tuple_index()).collect();
    Ok((0..module.inst(root).operand_count()).filter(|i| !used.contains(i)).collect())
}

/// First position of each repeated element -> its other positions.
fn duplicates(items: &[InstId]) -> BTreeMap<usize, BTreeSet<usize>> {
    let mut first: HashMap<InstId, usize> = HashMap::new();
    let mut result: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for (index, &item) in items.iter().enumerate() {
        match first.get(&item) {
            Some(&f) => {
                result.entry(f).or_default().insert(index);
            }
            None => {
                first.insert(item, index);
            }
        }
    }
    result
}

/// Root tuple positions of `stage` that repeat an earlier output.
pub fn duplicate_outputs(module: &Module, stage: InstId) -> PassResult<BTreeMap<usize, BTreeSet<usize>>> {
    let root = tuple_root(module, stage_body(module, stage)?)?;
    Ok(duplicates(module.inst(root).operands()))
}

/// Operand positions of `stage` that repeat an earlier operand.
pub fn duplicate_inputs(module: &Module, stage: InstId) -> PassResult<BTreeMap<usize, BTreeSet<usize>>> {
    Ok(duplicates(module.inst(stage).operands()))
}

/// Drops the parameters numbered in `params` (which must be unused) and
/// the matching call operands. Operands left without users are removed.
pub fn remove_parameters_from_stage(
    module: &mut Module,
    stage: InstId,
    params: &BTreeSet<usize>,
) -> PassResult<InstId> {
    if params.is_empty() {
        return Ok(stage);
    }
    let body = stage_body(module, stage)?;
    for &number in params {
        let param = module.computation(body).parameter(number).ok_or_else(|| {
            PassError::internal(format!("stage {} has no parameter {}", module.inst(stage).name(), number))
        })?;
        if module.inst(param).user_count() != 0 {
            return Err(PassError::failed_precondition(format!(
                "cannot remove parameter {} of stage {} which is still used",
                number,
                module.inst(stage).name()
            )));
        }
    }
    let new_body = clone_body(module, body, params)?;
    let operands: Vec<InstId> = module
        .inst(stage)
        .operands()
        .iter()
        .enumerate()
        .filter(|(i, _)| !params.contains(i))
        .map(|(_, &op)| op)
        .collect();
    let new_stage = replace_pipeline_stage_with(module, stage, new_body, operands, true)?;
    log::trace!(
        "Removed {} parameter(s) from pipeline stage %{}",
        params.len(),
        module.inst(new_stage).name()
    );
    Ok(new_stage)
}

/// Drops the root tuple outputs numbered in `outputs` (which must be unread)
/// and renumbers the get-tuple-element users of the remaining ones.
pub fn remove_outputs_from_stage(
    module: &mut Module,
    stage: InstId,
    outputs: &BTreeSet<usize>,
) -> PassResult<InstId> {
    if outputs.is_empty() {
        return Ok(stage);
    }
    for &user in module.inst(stage).users() {
        match module.inst(user).tuple_index() {
            Some(index) if !outputs.contains(&index) => {}
            _ => {
                return Err(PassError::failed_precondition(format!(
                    "cannot remove outputs of {} used by {}",
                    module.inst(stage).name(),
                    module.inst(user).short_string()
                )))
            }
        }
    }
    let pipeline = module.inst(stage).parent();
    let body = stage_body(module, stage)?;
    let new_body = clone_body(module, body, &BTreeSet::new())?;
    let root = tuple_root(module, new_body)?;
    let kept: Vec<InstId> = module
        .inst(root)
        .operands()
        .iter()
        .enumerate()
        .filter(|(i, _)| !outputs.contains(i))
        .map(|(_, &op)| op)
        .collect();
    let new_root = module.add_tuple(new_body, kept);
    module.set_root(new_body, new_root);
    module.remove_instruction_and_unused_operands(root)?;

    let operands = module.inst(stage).operands().to_vec();
    let new_stage = replace_pipeline_stage_with(module, stage, new_body, operands, false)?;
    for gte in module.inst(new_stage).users().to_vec() {
        let Some(index) = module.inst(gte).tuple_index() else {
            continue;
        };
        let renumbered = index - outputs.range(..index).count();
        if renumbered != index {
            let replacement = module.add_gte(pipeline, new_stage, renumbered)?;
            module.copy_derived_attributes(gte, replacement);
            module.replace_all_uses_with(gte, replacement)?;
            module.remove_instruction(gte)?;
        }
    }
    Ok(new_stage)
}

/// Routes every non-get-tuple-element use of a stage through a tuple of
/// get-tuple-elements on it.
pub fn insert_gte_edges(module: &mut Module, stages: &PipelineStages) -> PassResult<bool> {
    let mut changed = false;
    for (_, stage) in stages.all() {
        let users: Vec<InstId> = module
            .inst(stage)
            .users()
            .iter()
            .copied()
            .filter(|&u| module.inst(u).tuple_index().is_none())
            .collect();
        if users.is_empty() || !module.inst(stage).shape().is_tuple() {
            continue;
        }
        let pipeline = module.inst(stage).parent();
        let count = module.inst(stage).shape().tuple_element_count();
        let elements = (0..count)
            .map(|i| module.add_gte(pipeline, stage, i))
            .collect::<PassResult<Vec<_>>>()?;
        let tuple = module.add_tuple(pipeline, elements);
        for user in users {
            module.replace_use_with(stage, user, tuple)?;
        }
        changed = true;
    }
    Ok(changed)
}

/// Gives every get-tuple-element on a stage exactly one user by cloning it
/// per additional user.
pub fn duplicate_gte_edges(module: &mut Module, stages: &PipelineStages) -> PassResult<bool> {
    let mut changed = false;
    for (id, stage) in stages.all() {
        let pipeline = module.inst(stage).parent();
        for gte in module.inst(stage).users().to_vec() {
            let Some(index) = module.inst(gte).tuple_index() else {
                return Err(PassError::failed_precondition(format!(
                    "expected all users of pipeline stage {} to be get-tuple-elements, found {}",
                    id,
                    module.inst(gte).short_string()
                )));
            };
            let users = module.inst(gte).users().to_vec();
            if users.is_empty() && !module.is_root(gte) {
                module.remove_instruction(gte)?;
                changed = true;
                continue;
            }
            if users.len() <= 1 {
                continue;
            }
            for user in users {
                let clone = module.add_gte(pipeline, stage, index)?;
                module.copy_derived_attributes(gte, clone);
                module.replace_use_with(gte, user, clone)?;
            }
            if !module.is_root(gte) {
                module.remove_instruction(gte)?;
            }
            changed = true;
        }
    }
    Ok(changed)
}

/// Gives every stage its own body, cloning bodies shared with an earlier
/// stage.
pub fn uniquify_pipeline_stage_callsites(module: &mut Module, stages: &PipelineStages) -> PassResult<bool> {
    let mut seen: HashSet<CompId> = HashSet::new();
    let mut changed = false;
    for (id, stage) in stages.all() {
        let body = stage_body(module, stage)?;
        if seen.insert(body) {
            continue;
        }
        let clone = module.clone_computation(body, "clone")?;
        module.set_call_target(stage, clone)?;
        log::trace!("Stage {} now calls its own copy {}", id, module.computation(clone).name());
        changed = true;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CallKind, Opcode, PrimitiveType, Shape, StageKind};

    fn f32s() -> Shape {
        Shape::array(PrimitiveType::F32, &[2])
    }

    const FWD: CallKind = CallKind::PipelineStage(StageKind::Forward);

    /// A stage body returning `exp` of each parameter.
    fn exp_body(m: &mut Module, name: &str, params: usize) -> CompId {
        let body = m.add_computation(name);
        let exps: Vec<InstId> = (0..params)
            .map(|n| {
                let p = m.add_parameter(body, n, f32s(), None);
                m.add_instruction(body, Opcode::Exp, f32s(), vec![p], None)
            })
            .collect();
        let t = m.add_tuple(body, exps);
        m.set_root(body, t);
        body
    }

    #[test]
    fn test_remove_parameter_renumbers_contiguously() {
        let mut m = Module::new("m");
        let p = m.add_computation("pipeline");
        let args: Vec<InstId> = (0..4).map(|n| m.add_parameter(p, n, f32s(), None)).collect();
        let body = m.add_computation("stage_0");
        let params: Vec<InstId> = (0..4)
            .map(|n| m.add_parameter(body, n, f32s(), Some(&format!("p{}", n))))
            .collect();
        let a = m.add_instruction(body, Opcode::Add, f32s(), vec![params[0], params[1]], None);
        let b = m.add_instruction(body, Opcode::Multiply, f32s(), vec![a, params[3]], None);
        let t = m.add_tuple(body, vec![b]);
        m.set_root(body, t);
        let stage = m.add_call(p, body, FWD, args.clone(), Some("stage")).unwrap();
        let out = m.add_gte(p, stage, 0).unwrap();
        let root = m.add_tuple(p, vec![out]);
        m.set_root(p, root);

        assert_eq!(unused_parameters(&m, stage).unwrap(), BTreeSet::from([2]));
        let new_stage = remove_parameters_from_stage(&mut m, stage, &BTreeSet::from([2])).unwrap();
        m.verify().unwrap();

        assert!(!m.is_live(stage));
        assert_eq!(m.inst(new_stage).operands(), &[args[0], args[1], args[3]]);
        assert_eq!(m.inst(out).operand(0), Some(new_stage));
        let new_body = m.inst(new_stage).called_computation().unwrap();
        assert_eq!(m.computation(new_body).num_parameters(), 3);
        let last = m.computation(new_body).parameter(2).unwrap();
        assert!(m.inst(last).name().starts_with("p3"));
        assert_eq!(m.inst(last).users().len(), 1);
        assert!(m.computation(body).is_removed());
        assert!(unused_parameters(&m, new_stage).unwrap().is_empty());
    }

    #[test]
    fn test_remove_used_parameter_fails() {
        let mut m = Module::new("m");
        let p = m.add_computation("pipeline");
        let x = m.add_parameter(p, 0, f32s(), None);
        let body = exp_body(&mut m, "s", 1);
        let stage = m.add_call(p, body, FWD, vec![x], None).unwrap();
        let out = m.add_gte(p, stage, 0).unwrap();
        m.set_root(p, out);
        let err = remove_parameters_from_stage(&mut m, stage, &BTreeSet::from([0])).unwrap_err();
        assert!(matches!(err, PassError::FailedPrecondition(_)));
    }

    #[test]
    fn test_splice_rewires_external_uses_through_new_output() {
        let mut m = Module::new("m");
        let p = m.add_computation("pipeline");
        let x = m.add_parameter(p, 0, f32s(), Some("x"));
        let y = m.add_parameter(p, 1, f32s(), Some("y"));
        let b0 = exp_body(&mut m, "f0", 1);
        let f0 = m.add_call(p, b0, FWD, vec![x], Some("f0")).unwrap();
        let f0_out = m.add_gte(p, f0, 0).unwrap();
        let b1 = exp_body(&mut m, "f1", 1);
        let f1 = m.add_call(p, b1, FWD, vec![f0_out], Some("f1")).unwrap();
        let f1_out = m.add_gte(p, f1, 0).unwrap();
        let f1_leak = m.add_gte(p, f1, 0).unwrap();
        let leak = m.add_instruction(p, Opcode::Add, f32s(), vec![f1_leak, y], Some("leak"));
        let root = m.add_tuple(p, vec![f1_out, leak]);
        m.set_root(p, root);

        let new_stage = add_instructions_to_pipeline_stage(&mut m, f1, &[leak], &BTreeMap::new(), &[]).unwrap();
        m.verify().unwrap();

        assert!(!m.is_live(leak));
        assert!(!m.is_live(f1_leak));
        assert!(m.computation(b1).is_removed());
        assert_eq!(m.inst(new_stage).operands(), &[f0_out, y]);
        assert_eq!(m.inst(f1_out).operand(0), Some(new_stage));

        let leak_out = m.inst(root).operand(1).unwrap();
        assert_eq!(m.inst(leak_out).tuple_index(), Some(1));
        assert_eq!(m.inst(leak_out).operand(0), Some(new_stage));

        let body = m.inst(new_stage).called_computation().unwrap();
        let body_root = m.root(body).unwrap();
        assert_eq!(m.inst(body_root).operand_count(), 2);
        let lowered = m.inst(body_root).operand(1).unwrap();
        assert_eq!(m.inst(lowered).kind(), OpKind::Add);
        assert_eq!(m.inst(lowered).operand(0), m.inst(body_root).operand(0));
        assert_eq!(m.inst(lowered).operand(1), m.computation(body).parameter(1));
    }

    #[test]
    fn test_splice_with_parameter_replacement() {
        let mut m = Module::new("m");
        let p = m.add_computation("pipeline");
        let x = m.add_parameter(p, 0, f32s(), Some("x"));
        let neg = m.add_instruction(p, Opcode::Negate, f32s(), vec![x], Some("neg"));
        let body = exp_body(&mut m, "f0", 1);
        let f0 = m.add_call(p, body, FWD, vec![neg], Some("f0")).unwrap();
        let out = m.add_gte(p, f0, 0).unwrap();
        m.set_root(p, out);

        let replace = BTreeMap::from([(0, neg)]);
        let stage = add_instructions_to_pipeline_stage(&mut m, f0, &[neg], &replace, &[]).unwrap();
        assert_eq!(m.inst(stage).operands(), &[neg, x]);
        assert_eq!(unused_parameters(&m, stage).unwrap(), BTreeSet::from([0]));

        let stage = remove_parameters_from_stage(&mut m, stage, &BTreeSet::from([0])).unwrap();
        m.verify().unwrap();
        assert!(!m.is_live(neg));
        assert_eq!(m.inst(stage).operands(), &[x]);
        let body = m.inst(stage).called_computation().unwrap();
        let exp = m.inst(m.root(body).unwrap()).operand(0).unwrap();
        let inner_neg = m.inst(exp).operand(0).unwrap();
        assert_eq!(m.inst(inner_neg).kind(), OpKind::Negate);
        assert_eq!(m.inst(inner_neg).operand(0), m.computation(body).parameter(0));
    }

    #[test]
    fn test_remove_outputs_renumbers_gtes() {
        let mut m = Module::new("m");
        let p = m.add_computation("pipeline");
        let args: Vec<InstId> = (0..3).map(|n| m.add_parameter(p, n, f32s(), None)).collect();
        let body = exp_body(&mut m, "s", 3);
        let stage = m.add_call(p, body, FWD, args, None).unwrap();
        let first = m.add_gte(p, stage, 0).unwrap();
        let last = m.add_gte(p, stage, 2).unwrap();
        let root = m.add_tuple(p, vec![first, last]);
        m.set_root(p, root);

        assert_eq!(unused_outputs(&m, stage).unwrap(), BTreeSet::from([1]));
        let stage = remove_outputs_from_stage(&mut m, stage, &BTreeSet::from([1])).unwrap();
        m.verify().unwrap();
        assert_eq!(m.inst(stage).shape().tuple_element_count(), 2);
        let renumbered = m.inst(root).operand(1).unwrap();
        assert_eq!(m.inst(renumbered).tuple_index(), Some(1));
        assert!(!m.is_live(last));
        assert_eq!(m.inst(root).operand(0), Some(first));

        let body = m.inst(stage).called_computation().unwrap();
        let unused = unused_parameters(&m, stage).unwrap();
        assert_eq!(unused, BTreeSet::from([1]));
        assert_eq!(m.computation(body).num_parameters(), 3);
    }

    #[test]
    fn test_duplicate_inputs_and_outputs() {
        let mut m = Module::new("m");
        let p = m.add_computation("pipeline");
        let x = m.add_parameter(p, 0, f32s(), None);
        let y = m.add_parameter(p, 1, f32s(), None);
        let body = m.add_computation("s");
        let p0 = m.add_parameter(body, 0, f32s(), None);
        let p1 = m.add_parameter(body, 1, f32s(), None);
        let p2 = m.add_parameter(body, 2, f32s(), None);
        let t = m.add_tuple(body, vec![p0, p1, p0, p2, p0]);
        m.set_root(body, t);
        let stage = m.add_call(p, body, FWD, vec![x, y, x], None).unwrap();
        m.set_root(p, stage);

        assert_eq!(duplicate_inputs(&m, stage).unwrap(), BTreeMap::from([(0, BTreeSet::from([2]))]));
        assert_eq!(duplicate_outputs(&m, stage).unwrap(), BTreeMap::from([(0, BTreeSet::from([2, 4]))]));
    }

    #[test]
    fn test_repair_rewrites() {
        let mut m = Module::new("m");
        let p = m.add_computation("pipeline");
        let x = m.add_parameter(p, 0, f32s(), None);
        let body = exp_body(&mut m, "shared", 1);
        let f0 = m.add_call(p, body, FWD, vec![x], Some("f0")).unwrap();
        let f0_out = m.add_gte(p, f0, 0).unwrap();
        let f1 = m.add_call(p, body, FWD, vec![f0_out], Some("f1")).unwrap();
        let a = m.add_instruction(p, Opcode::Negate, f32s(), vec![f0_out], None);
        let root = m.add_tuple(p, vec![f1, a]);
        m.set_root(p, root);

        let stages = PipelineStages {
            computation: p,
            forward: vec![f0, f1],
            backward: vec![],
            recomputation: BTreeMap::new(),
        };
        assert!(uniquify_pipeline_stage_callsites(&mut m, &stages).unwrap());
        assert_ne!(m.inst(f0).called_computation(), m.inst(f1).called_computation());
        assert!(!uniquify_pipeline_stage_callsites(&mut m, &stages).unwrap());

        assert!(insert_gte_edges(&mut m, &stages).unwrap());
        let through = m.inst(root).operand(0).unwrap();
        assert_eq!(m.inst(through).kind(), OpKind::Tuple);
        assert!(m.inst(f1).users().iter().all(|&u| m.inst(u).tuple_index().is_some()));

        assert!(duplicate_gte_edges(&mut m, &stages).unwrap());
        assert!(!m.is_live(f0_out));
        for &gte in m.inst(f0).users() {
            assert_eq!(m.inst(gte).user_count(), 1);
        }
        assert_eq!(m.inst(f0).users().len(), 2);
        m.verify().unwrap();
    }
}
