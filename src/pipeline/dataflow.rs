// This module implements the dataflow analysis over a pipeline body. Parameters and stage
// calls are producers: each creates a fresh Value. Every other instruction passes through
// the union of its operands' value sets. Value sets are sorted slices bump-allocated in
// the pass session arena, so rebuilding the analysis after every rewrite costs no heap
// churn beyond the arena itself. While visiting a stage call the analysis records which
// stages use each value and checks the operand values against the locality rule: stage
// outputs may only reach the next stage in execution order or the paired backward (or
// recomputation) stage, and a pipeline parameter may only be used by stages of one index.
// HasToBeLowered classifies the instructions the fixer still has to move into a stage.

//! Pipeline dataflow analysis and the locality rule.

use std::collections::BTreeSet;
use std::fmt;

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use hashbrown::HashMap;

use super::stages::{PipelineStages, StageId};
use crate::core::{PassError, PassResult};
use crate::ir::{InstId, Module, StageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A value created by a producer (a parameter or a stage call).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Value {
    pub id: ValueId,
    pub producer: InstId,
}

/// Whether `producer` may feed `consumer` under the locality rule.
pub fn is_legal_stage_usage(producer: StageId, consumer: StageId) -> bool {
    if producer == consumer {
        return true;
    }
    let (p, c) = (producer.index, consumer.index);
    match (producer.kind, consumer.kind) {
        (StageKind::Forward, StageKind::Forward) => c == p + 1,
        (StageKind::Forward, StageKind::Recomputation) => c == p + 1,
        (StageKind::Forward, StageKind::Backward) => c == p,
        (StageKind::Backward, StageKind::Backward) => c + 1 == p,
        (StageKind::Recomputation, StageKind::Backward) => c == p,
        _ => false,
    }
}

pub struct PipelineDataflowAnalysis<'arena> {
    arena: &'arena Bump,
    stages: PipelineStages,
    stage_ids: HashMap<InstId, StageId>,
    values: Vec<Value>,
    value_sets: HashMap<InstId, &'arena [ValueId]>,
    used_by_stages: HashMap<ValueId, BTreeSet<StageId>>,
}

impl<'arena> PipelineDataflowAnalysis<'arena> {
    /// Runs the analysis over the pipeline body of `stages`. Fails when a
    /// stage already uses a value it may not.
    pub fn get_analysis(module: &Module, stages: &PipelineStages, arena: &'arena Bump) -> PassResult<Self> {
        let stage_ids = stages.all().into_iter().map(|(id, inst)| (inst, id)).collect();
        let mut analysis = Self {
            arena,
            stages: stages.clone(),
            stage_ids,
            values: Vec::new(),
            value_sets: HashMap::new(),
            used_by_stages: HashMap::new(),
        };
        if !stages.forward.is_empty() {
            for inst in module.post_order(stages.computation) {
                analysis.update_through_instruction(module, inst)?;
            }
        }
        Ok(analysis)
    }

    pub fn stages(&self) -> &PipelineStages {
        &self.stages
    }

    pub fn stage_id(&self, stage: InstId) -> PassResult<StageId> {
        self.stage_ids
            .get(&stage)
            .copied()
            .ok_or_else(|| PassError::internal(format!("{} is not a known pipeline stage", stage)))
    }

    pub fn is_stage(&self, inst: InstId) -> bool {
        self.stage_ids.contains_key(&inst)
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0 as usize]
    }

    /// Values that may flow into the output of `inst`.
    pub fn value_set(&self, inst: InstId) -> &'arena [ValueId] {
        self.value_sets.get(&inst).copied().unwrap_or(&[])
    }

    /// Stages whose outputs reach `inst`.
    pub fn producing_stages(&self, inst: InstId) -> Vec<StageId> {
        self.value_set(inst)
            .iter()
            .filter_map(|&v| self.stage_ids.get(&self.value(v).producer).copied())
            .collect()
    }

    fn operands_value_set(&self, module: &Module, inst: InstId) -> &'arena [ValueId] {
        let operands = module.inst(inst).operands();
        if let [single] = operands {
            return self.value_set(*single);
        }
        let mut set = BumpVec::new_in(self.arena);
        for &op in operands {
            set.extend_from_slice(self.value_set(op));
        }
        set.sort_unstable();
        set.dedup();
        set.into_bump_slice()
    }

    fn create_value(&mut self, producer: InstId) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(Value { id, producer });
        id
    }

    fn update_through_instruction(&mut self, module: &Module, inst: InstId) -> PassResult<()> {
        let operand_values = self.operands_value_set(module, inst);
        let is_stage = self.is_stage(inst);
        if is_stage || module.inst(inst).parameter_number().is_some() {
            if is_stage {
                let stage = self.stage_id(inst)?;
                for &value in operand_values {
                    self.used_by_stages.entry(value).or_default().insert(stage);
                }
                self.verify_pipeline_stage_operands(module, inst, operand_values)?;
            }
            let value = self.create_value(inst);
            self.value_sets.insert(inst, self.arena.alloc_slice_copy(&[value]));
        } else {
            self.value_sets.insert(inst, operand_values);
        }
        Ok(())
    }

    fn verify_pipeline_stage_operands(&self, module: &Module, stage: InstId, values: &[ValueId]) -> PassResult<()> {
        for &value in values {
            let producer = self.value(value).producer;
            if module.inst(producer).parameter_number().is_some() {
                self.verify_parameter_usage(value, stage)?;
            } else if self.is_stage(producer) {
                self.verify_pipeline_usage(producer, stage)?;
            } else {
                return Err(PassError::internal(format!(
                    "invalid producer {} in the pipeline",
                    module.inst(producer).short_string()
                )));
            }
        }
        Ok(())
    }

    /// A stage output may be used by the same stage, the next stage in
    /// execution order or its paired backward stage.
    pub fn verify_pipeline_usage(&self, producer: InstId, consumer: InstId) -> PassResult<()> {
        if producer == consumer {
            return Ok(());
        }
        let (p, c) = (self.stage_id(producer)?, self.stage_id(consumer)?);
        if is_legal_stage_usage(p, c) {
            return Ok(());
        }
        Err(PassError::internal(format!(
            "trying to use an output of pipeline stage {} as an input to pipeline stage {}, \
             which violates the data flow constraints for pipelines",
            p, c
        )))
    }

    /// A pipeline parameter may only be used by stages of one index.
    pub fn verify_parameter_usage(&self, value: ValueId, consumer: InstId) -> PassResult<()> {
        let stage = self.stage_id(consumer)?;
        let Some(users) = self.used_by_stages.get(&value) else {
            return Ok(());
        };
        if let Some(other) = users.iter().find(|u| u.index != stage.index) {
            return Err(PassError::unimplemented(format!(
                "pipeline stage {} is trying to use an input already used by pipeline stage {}; \
                 an input can only be used by a single pipeline stage",
                stage, other
            )));
        }
        Ok(())
    }

    /// Whether `inst`, an instruction of the pipeline body, still has to be
    /// moved into a stage.
    pub fn has_to_be_lowered(&self, module: &Module, inst: InstId) -> PassResult<bool> {
        if module.is_root(inst) {
            return Ok(false);
        }
        let instruction = module.inst(inst);
        if instruction.called_computation().is_some() {
            return Ok(!self.is_stage(inst));
        }
        if instruction.parameter_number().is_some() {
            return Ok(false);
        }
        if instruction.tuple_index().is_none() {
            return Ok(true);
        }
        let Some(input) = instruction.operand(0).filter(|&op| self.is_stage(op)) else {
            return Ok(true);
        };
        if instruction.user_count() != 1 {
            return Err(PassError::internal(format!(
                "expected {} to have exactly one user",
                instruction.short_string()
            )));
        }
        let user = instruction.users()[0];
        if self.is_stage(user) {
            self.verify_pipeline_usage(input, user)?;
        }
        Ok(false)
    }
}

/// Post-condition of the fixer: nothing in the pipeline body needs lowering
/// and every stage input respects the locality rule.
pub fn verify_pipeline_after_fixing(module: &Module, stages: &PipelineStages, arena: &Bump) -> PassResult<()> {
    let analysis = PipelineDataflowAnalysis::get_analysis(module, stages, arena)?;
    for inst in module.post_order(stages.computation) {
        if analysis.has_to_be_lowered(module, inst)? {
            return Err(PassError::failed_precondition(format!(
                "{} in pipeline {} has not been lowered into a pipeline stage",
                module.inst(inst).short_string(),
                module.computation(stages.computation).name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CallKind, CompId, Opcode, PrimitiveType, Shape};
    use crate::pipeline::stages::get_pipeline_stages;

    fn f32s() -> Shape {
        Shape::array(PrimitiveType::F32, &[2])
    }

    fn add_stage(m: &mut Module, pipeline: CompId, kind: StageKind, inputs: Vec<InstId>, name: &str) -> InstId {
        let body = m.add_computation(name);
        let params: Vec<InstId> = (0..inputs.len()).map(|n| m.add_parameter(body, n, f32s(), None)).collect();
        let t = m.add_tuple(body, params);
        m.set_root(body, t);
        let call = m.add_call(pipeline, body, CallKind::PipelineStage(kind), inputs, Some(name)).unwrap();
        m.add_gte(pipeline, call, 0).unwrap()
    }

    #[test]
    fn test_locality_rule() {
        use StageId as S;
        assert!(is_legal_stage_usage(S::forward(0), S::forward(1)));
        assert!(!is_legal_stage_usage(S::forward(0), S::forward(2)));
        assert!(is_legal_stage_usage(S::forward(1), S::backward(1)));
        assert!(is_legal_stage_usage(S::forward(0), S::recomputation(1)));
        assert!(is_legal_stage_usage(S::backward(2), S::backward(1)));
        assert!(!is_legal_stage_usage(S::backward(1), S::backward(2)));
        assert!(is_legal_stage_usage(S::recomputation(1), S::backward(1)));
        assert!(!is_legal_stage_usage(S::backward(1), S::forward(2)));
    }

    #[test]
    fn test_value_sets_and_lowering_classification() {
        let mut m = Module::new("m");
        let p = m.add_computation("pipeline");
        let x = m.add_parameter(p, 0, f32s(), Some("x"));
        let y = m.add_parameter(p, 1, f32s(), Some("y"));
        let f0 = add_stage(&mut m, p, StageKind::Forward, vec![x], "f0");
        let f1 = add_stage(&mut m, p, StageKind::Forward, vec![f0], "f1");
        let f1_call = m.inst(f1).operand(0).unwrap();
        let f1_out = m.add_gte(p, f1_call, 0).unwrap();
        let leak = m.add_instruction(p, Opcode::Add, f32s(), vec![f1_out, y], Some("leak"));
        let root = m.add_tuple(p, vec![f1, leak]);
        m.set_root(p, root);

        let stages = get_pipeline_stages(&m, p).unwrap();
        let arena = Bump::new();
        let analysis = PipelineDataflowAnalysis::get_analysis(&m, &stages, &arena).unwrap();

        assert_eq!(stages.forward[1], f1_call);
        assert_eq!(analysis.producing_stages(leak), vec![StageId::forward(1)]);
        assert_eq!(analysis.value_set(leak).len(), 2);
        assert!(analysis.has_to_be_lowered(&m, leak).unwrap());
        assert!(!analysis.has_to_be_lowered(&m, f1_out).unwrap());
        assert!(!analysis.has_to_be_lowered(&m, f1_call).unwrap());
        assert!(!analysis.has_to_be_lowered(&m, y).unwrap());
        assert!(!analysis.has_to_be_lowered(&m, root).unwrap());

        let err = verify_pipeline_after_fixing(&m, &stages, &arena).unwrap_err();
        assert!(err.to_string().contains("leak"));
    }

    #[test]
    fn test_skipping_a_stage_is_rejected() {
        let mut m = Module::new("m");
        let p = m.add_computation("pipeline");
        let x = m.add_parameter(p, 0, f32s(), None);
        let f0 = add_stage(&mut m, p, StageKind::Forward, vec![x], "f0");
        let f1 = add_stage(&mut m, p, StageKind::Forward, vec![f0], "f1");
        let f0_call = m.inst(f0).operand(0).unwrap();
        let f0_again = m.add_gte(p, f0_call, 0).unwrap();
        let f2 = add_stage(&mut m, p, StageKind::Forward, vec![f1, f0_again], "f2");
        let root = m.add_tuple(p, vec![f2]);
        m.set_root(p, root);

        let stages = get_pipeline_stages(&m, p).unwrap();
        let arena = Bump::new();
        let err = PipelineDataflowAnalysis::get_analysis(&m, &stages, &arena).err().unwrap();
        assert!(matches!(err, PassError::Internal(_)));
        assert!(err.to_string().contains("F0"));
    }

    #[test]
    fn test_parameter_shared_across_indices_is_unimplemented() {
        let mut m = Module::new("m");
        let p = m.add_computation("pipeline");
        let x = m.add_parameter(p, 0, f32s(), None);
        let f0 = add_stage(&mut m, p, StageKind::Forward, vec![x], "f0");
        let f1 = add_stage(&mut m, p, StageKind::Forward, vec![f0, x], "f1");
        let root = m.add_tuple(p, vec![f1]);
        m.set_root(p, root);

        let stages = get_pipeline_stages(&m, p).unwrap();
        let arena = Bump::new();
        let err = PipelineDataflowAnalysis::get_analysis(&m, &stages, &arena).err().unwrap();
        assert!(matches!(err, PassError::Unimplemented(_)));
    }
}
