//! The pipeline fixer pass.
//!
//! For every pipeline body in the module the fixer first establishes the
//! structural prerequisites (private stage bodies, get-tuple-element edges
//! with one user each), then repeatedly rebuilds the dataflow analysis and
//! moves the first instruction that still has to be lowered into a stage:
//!
//! - an instruction that reads stage outputs goes into the latest of those
//!   stages in execution order;
//! - an instruction that reads no stage output and only feeds stages is
//!   copied into each of them, replacing the stage parameter it fed;
//! - a dead instruction is removed.
//!
//! Afterwards duplicate and unused stage inputs and outputs are removed and
//! the locality rule is checked over the whole body.

use std::collections::BTreeMap;

use super::dataflow::{verify_pipeline_after_fixing, PipelineDataflowAnalysis};
use super::rewrite::{
    add_instructions_to_pipeline_stage, duplicate_gte_edges, duplicate_inputs, duplicate_outputs, insert_gte_edges,
    remove_outputs_from_stage, remove_parameters_from_stage, uniquify_pipeline_stage_callsites, unused_outputs,
    unused_parameters,
};
use super::stages::{get_pipeline_stages, verify_stages_before_fixing};
use crate::core::{PassError, PassResult, PassSession};
use crate::ir::{CompId, InstId, Module};
use crate::passes::Pass;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Lowering {
    Remove,
    IntoStage(InstId),
    IntoConsumers(Vec<InstId>),
}

#[derive(Debug, Default)]
pub struct PipelineFixer;

impl PipelineFixer {
    pub fn new() -> Self {
        Self
    }

    fn plan(module: &Module, analysis: &PipelineDataflowAnalysis<'_>, inst: InstId) -> PassResult<Option<Lowering>> {
        let instruction = module.inst(inst);
        if instruction.user_count() == 0 && instruction.control_successors().is_empty() {
            return Ok(Some(Lowering::Remove));
        }
        let stages = analysis.stages();
        let latest = analysis
            .producing_stages(inst)
            .into_iter()
            .max_by_key(|&id| stages.execution_position(id));
        if let Some(id) = latest {
            let stage = stages
                .get(id)
                .ok_or_else(|| PassError::internal(format!("no pipeline stage {}", id)))?;
            return Ok(Some(Lowering::IntoStage(stage)));
        }
        let users = instruction.users();
        if users.iter().all(|&u| analysis.is_stage(u)) {
            return Ok(Some(Lowering::IntoConsumers(users.to_vec())));
        }
        Ok(None)
    }

    fn apply(module: &mut Module, pipeline: CompId, inst: InstId, lowering: Lowering) -> PassResult<()> {
        match lowering {
            Lowering::Remove => {
                log::trace!("Removing dead %{} from the pipeline", module.inst(inst).name());
                module.remove_instruction_and_unused_operands(inst)?;
            }
            Lowering::IntoStage(stage) => {
                add_instructions_to_pipeline_stage(module, stage, &[inst], &BTreeMap::new(), &[])?;
            }
            Lowering::IntoConsumers(users) => {
                let (&first, rest) = users
                    .split_first()
                    .ok_or_else(|| PassError::internal("lowering into consumers without users"))?;
                // One copy per additional consumer; each copy is lowered on its own later.
                for &user in rest {
                    let operands = module.inst(inst).operands().to_vec();
                    let copy = module.clone_instruction(pipeline, inst, operands);
                    module.replace_use_with(inst, user, copy)?;
                }
                let replace: BTreeMap<usize, InstId> = module
                    .inst(first)
                    .operand_indices(inst)
                    .into_iter()
                    .map(|index| (index, inst))
                    .collect();
                let stage = add_instructions_to_pipeline_stage(module, first, &[inst], &replace, &[])?;
                remove_parameters_from_stage(module, stage, &replace.keys().copied().collect())?;
            }
        }
        Ok(())
    }

    /// Lowers one instruction. Returns false once nothing needs lowering.
    fn lower_next(&self, module: &mut Module, pipeline: CompId, session: &PassSession<'_>) -> PassResult<bool> {
        let stages = get_pipeline_stages(module, pipeline)?;
        let analysis = PipelineDataflowAnalysis::get_analysis(module, &stages, session.arena())?;
        let mut stuck = None;
        for inst in module.post_order(pipeline) {
            if !analysis.has_to_be_lowered(module, inst)? {
                continue;
            }
            match Self::plan(module, &analysis, inst)? {
                Some(lowering) => {
                    log::debug!("Lowering %{} ({:?})", module.inst(inst).name(), lowering);
                    Self::apply(module, pipeline, inst, lowering)?;
                    session.record_lowered(1);
                    return Ok(true);
                }
                None => {
                    stuck.get_or_insert(inst);
                }
            }
        }
        match stuck {
            Some(inst) => Err(PassError::failed_precondition(format!(
                "{} cannot be lowered into any stage of pipeline {}",
                module.inst(inst).short_string(),
                module.computation(pipeline).name()
            ))),
            None => Ok(false),
        }
    }

    /// Merges duplicate inputs and outputs of `stage` and drops the unused
    /// ones. Returns the (possibly new) stage call.
    fn tidy_stage(module: &mut Module, stage: InstId) -> PassResult<InstId> {
        let pipeline = module.inst(stage).parent();
        let body = module
            .inst(stage)
            .called_computation()
            .ok_or_else(|| PassError::internal("pipeline stage is not a call"))?;
        for (first, others) in duplicate_inputs(module, stage)? {
            let missing = || PassError::internal("stage body is missing a parameter");
            let keep = module.computation(body).parameter(first).ok_or_else(missing)?;
            for other in others {
                let param = module.computation(body).parameter(other).ok_or_else(missing)?;
                module.replace_all_uses_with(param, keep)?;
            }
        }
        for (first, others) in duplicate_outputs(module, stage)? {
            for gte in module.inst(stage).users().to_vec() {
                if module.inst(gte).tuple_index().is_some_and(|i| others.contains(&i)) {
                    let replacement = module.add_gte(pipeline, stage, first)?;
                    module.copy_derived_attributes(gte, replacement);
                    module.replace_all_uses_with(gte, replacement)?;
                    module.remove_instruction(gte)?;
                }
            }
        }
        let outputs = unused_outputs(module, stage)?;
        let stage = remove_outputs_from_stage(module, stage, &outputs)?;
        let params = unused_parameters(module, stage)?;
        remove_parameters_from_stage(module, stage, &params)
    }

    fn fix_pipeline(&self, module: &mut Module, pipeline: CompId, session: &PassSession<'_>) -> PassResult<bool> {
        let stages = get_pipeline_stages(module, pipeline)?;
        if stages.forward.is_empty() {
            return Ok(false);
        }
        let mut changed = uniquify_pipeline_stage_callsites(module, &stages)?;
        changed |= insert_gte_edges(module, &stages)?;
        verify_stages_before_fixing(module, &stages)?;
        changed |= duplicate_gte_edges(module, &stages)?;

        let mut lowered = 0usize;
        while self.lower_next(module, pipeline, session)? {
            lowered += 1;
        }
        changed |= lowered > 0;

        for (_, stage) in get_pipeline_stages(module, pipeline)?.all() {
            changed |= Self::tidy_stage(module, stage)? != stage;
        }

        let stages = get_pipeline_stages(module, pipeline)?;
        verify_pipeline_after_fixing(module, &stages, session.arena())?;
        log::debug!(
            "Fixed pipeline {}: {} lowering step(s), {} stage(s)",
            module.computation(pipeline).name(),
            lowered,
            stages.len()
        );
        Ok(changed)
    }
}

impl Pass for PipelineFixer {
    fn name(&self) -> &str {
        "pipeline-fixer"
    }

    fn run(&mut self, module: &mut Module, session: &PassSession<'_>) -> PassResult<bool> {
        let mut pipelines: Vec<CompId> = Vec::new();
        for comp in module.computation_ids() {
            for &id in module.computation(comp).instructions() {
                let inst = module.inst(id);
                if let Some(body) = inst.called_computation().filter(|_| inst.is_pipeline()) {
                    if !pipelines.contains(&body) {
                        pipelines.push(body);
                    }
                }
            }
        }
        let mut changed = false;
        for pipeline in pipelines {
            changed |= self.fix_pipeline(module, pipeline, session)?;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CallKind, Opcode, OpKind, PrimitiveType, Shape, StageKind};
    use bumpalo::Bump;

    fn f32s() -> Shape {
        Shape::array(PrimitiveType::F32, &[2])
    }

    fn stage(m: &mut Module, pipeline: CompId, kind: StageKind, input: InstId, name: &str) -> InstId {
        let body = m.add_computation(name);
        let p = m.add_parameter(body, 0, f32s(), None);
        let e = m.add_instruction(body, Opcode::Exp, f32s(), vec![p], None);
        let t = m.add_tuple(body, vec![e]);
        m.set_root(body, t);
        m.add_call(pipeline, body, CallKind::PipelineStage(kind), vec![input], Some(name)).unwrap()
    }

    /// Three forward and three backward stages; F1 also leaks into an add.
    fn leaking_pipeline() -> (Module, CompId, InstId) {
        let mut m = Module::new("m");
        let p = m.add_computation("pipeline");
        let x = m.add_parameter(p, 0, f32s(), Some("x"));
        let y = m.add_parameter(p, 1, f32s(), Some("y"));
        let mut input = x;
        for (i, kind) in [StageKind::Forward; 3].into_iter().chain([StageKind::Backward; 3]).enumerate() {
            let s = stage(&mut m, p, kind, input, &format!("s{}", i));
            input = m.add_gte(p, s, 0).unwrap();
        }
        let f1 = m.find_instruction("s1").unwrap();
        let f1_leak = m.add_gte(p, f1, 0).unwrap();
        let leak = m.add_instruction(p, Opcode::Add, f32s(), vec![f1_leak, y], Some("leak"));
        let root = m.add_tuple(p, vec![input, leak]);
        m.set_root(p, root);

        let main = m.add_computation("main");
        let a = m.add_parameter(main, 0, f32s(), None);
        let b = m.add_parameter(main, 1, f32s(), None);
        let call = m.add_call(main, p, CallKind::Pipeline, vec![a, b], None).unwrap();
        m.set_root(main, call);
        m.set_entry(main);
        (m, p, leak)
    }

    #[test]
    fn test_leak_is_lowered_into_producing_stage() {
        let (mut m, p, leak) = leaking_pipeline();
        let arena = Bump::new();
        let session = PassSession::new(&arena);
        let mut fixer = PipelineFixer::new();
        assert!(fixer.run(&mut m, &session).unwrap());
        m.verify().unwrap();
        assert!(!m.is_live(leak));
        assert_eq!(session.stats().instructions_lowered, 1);

        let root = m.root(p).unwrap();
        let leak_out = m.inst(root).operand(1).unwrap();
        assert_eq!(m.inst(leak_out).tuple_index(), Some(1));
        let stage = m.inst(leak_out).operand(0).unwrap();
        assert_eq!(m.inst(stage).stage_kind(), Some(StageKind::Forward));
        let stages = get_pipeline_stages(&m, p).unwrap();
        assert_eq!(stages.forward[1], stage);

        let body = m.inst(stage).called_computation().unwrap();
        let inner = m.inst(m.root(body).unwrap()).operand(1).unwrap();
        assert_eq!(m.inst(inner).kind(), OpKind::Add);

        assert!(!fixer.run(&mut m, &session).unwrap());
    }

    #[test]
    fn test_free_instruction_without_a_stage_is_reported() {
        let mut m = Module::new("m");
        let p = m.add_computation("pipeline");
        let x = m.add_parameter(p, 0, f32s(), None);
        let s = stage(&mut m, p, StageKind::Forward, x, "f0");
        let out = m.add_gte(p, s, 0).unwrap();
        let y = m.add_parameter(p, 1, f32s(), None);
        let free = m.add_instruction(p, Opcode::Negate, f32s(), vec![y], Some("free"));
        let root = m.add_tuple(p, vec![out, free]);
        m.set_root(p, root);
        let main = m.add_computation("main");
        let a = m.add_parameter(main, 0, f32s(), None);
        let call = m.add_call(main, p, CallKind::Pipeline, vec![a, a], None).unwrap();
        m.set_root(main, call);

        let arena = Bump::new();
        let session = PassSession::new(&arena);
        let err = PipelineFixer::new().run(&mut m, &session).unwrap_err();
        assert!(matches!(err, PassError::FailedPrecondition(_)));
        assert!(err.to_string().contains("free"));
    }
}
