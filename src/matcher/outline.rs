//! Outlining of matched subgraphs into called computations.

use std::collections::BTreeSet;

use hashbrown::HashMap;

use super::matcher::{Match, Trace};
use super::pattern::Pattern;
use crate::core::{PassError, PassResult};
use crate::ir::{CallKind, InstId, Module};

/// Swaps the wanted slot of each trace with the operand found deeper in its
/// associative chain, so the matched structure exists literally.
pub fn reassociate(module: &mut Module, traces: &[Trace]) -> PassResult<()> {
    for trace in traces {
        let (Some(&slot), Some(&last)) = (trace.first(), trace.last()) else {
            continue;
        };
        if trace.len() < 2 {
            continue;
        }
        let missing = || PassError::internal("look-through trace points at a missing operand");
        let leaf = module.inst(slot.instruction).operand(slot.operand_index).ok_or_else(missing)?;
        let found = module.inst(last.instruction).operand(last.operand_index).ok_or_else(missing)?;
        log::trace!(
            "Re-associating %{} into %{}",
            module.inst(found).name(),
            module.inst(slot.instruction).name()
        );
        module.replace_operand_with(slot.instruction, slot.operand_index, found)?;
        module.replace_operand_with(last.instruction, last.operand_index, leaf)?;
    }
    Ok(())
}

/// Extracts `matched` into a new computation named `name` and replaces it
/// with a fusion call. Returns the call.
///
/// Parameters are the pattern inputs in order, then anonymous external
/// parameters, then `forced_parameters`, each deduplicated.
pub fn outline(
    module: &mut Module,
    pattern: &Pattern,
    matched: &Match,
    name: &str,
    sharding: Option<i64>,
    forced_parameters: &[InstId],
) -> PassResult<InstId> {
    reassociate(module, &matched.replacement_traces)?;

    let comp = matched.computation;
    let fused = matched.fused_instructions(pattern);
    let mut arguments: Vec<InstId> = Vec::new();
    for inst in matched
        .input_instructions(pattern)
        .into_iter()
        .chain(matched.external_instructions())
        .chain(forced_parameters.iter().copied())
    {
        if !arguments.contains(&inst) && !fused.contains(&inst) {
            arguments.push(inst);
        }
    }

    let body = module.add_computation(name);
    let mut mapping: HashMap<InstId, InstId> = HashMap::new();
    for (number, &arg) in arguments.iter().enumerate() {
        let shape = module.inst(arg).shape().clone();
        let param_name = format!("arg_{}", number);
        let param = module.add_parameter(body, number, shape, Some(&param_name));
        mapping.insert(arg, param);
    }

    let order: Vec<InstId> = module.post_order(comp).into_iter().filter(|i| fused.contains(i)).collect();
    for &old in &order {
        let operands = module
            .inst(old)
            .operands()
            .iter()
            .map(|op| mapping.get(op).copied())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                PassError::internal(format!(
                    "operand of fused {} is neither fused nor an input",
                    module.inst(old).short_string()
                ))
            })?;
        let new = module.clone_instruction(body, old, operands);
        mapping.insert(old, new);
    }

    let outputs: Vec<InstId> = pattern
        .outputs()
        .iter()
        .map(|&n| matched.get(n).ok_or_else(|| PassError::internal("unbound pattern output")))
        .collect::<PassResult<_>>()?;
    let body_outputs: Vec<InstId> = outputs
        .iter()
        .map(|o| mapping.get(o).copied().ok_or_else(|| PassError::internal("pattern output was not fused")))
        .collect::<PassResult<_>>()?;
    let body_root = match body_outputs[..] {
        [single] => single,
        _ => module.add_tuple(body, body_outputs),
    };
    module.set_root(body, body_root);

    let call = module.add_call(comp, body, CallKind::Fusion(pattern.ty().to_string()), arguments, Some(name))?;
    if let Some(meta) = matched.get(pattern.meta_target()) {
        let metadata = module.inst(meta).metadata().map(str::to_string);
        module.set_metadata(call, metadata);
    }
    module.set_sharding(call, sharding);
    if !pattern.inplace_input_indices().is_empty() {
        let indices: Vec<String> = pattern.inplace_input_indices().iter().map(|i| i.to_string()).collect();
        module.set_backend_config(call, Some(format!("inplace_operands={}", indices.join(","))));
    }

    // Rewire external uses of every output.
    let single_output = outputs.len() == 1;
    for (index, &output) in outputs.iter().enumerate() {
        let external: Vec<InstId> = module
            .inst(output)
            .users()
            .iter()
            .copied()
            .filter(|u| !fused.contains(u) && *u != call)
            .collect();
        let is_root = module.is_root(output);
        if external.is_empty() && !is_root {
            continue;
        }
        let replacement = if single_output { call } else { module.add_gte(comp, call, index)? };
        for user in external {
            module.replace_use_with(output, user, replacement)?;
        }
        if is_root {
            module.set_root(comp, replacement);
        }
    }

    let mut successors = BTreeSet::new();
    for &inst in &fused {
        for &succ in module.inst(inst).control_successors() {
            if !fused.contains(&succ) {
                successors.insert(succ);
            }
        }
    }
    for &pred in &matched.dependency_predecessors {
        module.add_control_dependency(pred, call)?;
    }
    for succ in successors {
        module.add_control_dependency(call, succ)?;
    }

    for &old in order.iter().rev() {
        module.remove_instruction(old)?;
    }
    log::debug!(
        "Outlined {} instruction(s) into %{} ({})",
        order.len(),
        module.inst(call).name(),
        pattern.ty()
    );
    Ok(call)
}
