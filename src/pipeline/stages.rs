//! Discovery and structural checks of the stages of a pipeline body.

use std::collections::BTreeMap;
use std::fmt;

use crate::core::{PassError, PassResult};
use crate::ir::{CompId, InstId, Module, OpKind, StageKind};

/// Position of a stage: its kind plus its index. Backward and recomputation
/// stage `i` pair with forward stage `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId {
    pub kind: StageKind,
    pub index: usize,
}

impl StageId {
    pub fn new(kind: StageKind, index: usize) -> Self {
        Self { kind, index }
    }

    pub fn forward(index: usize) -> Self {
        Self::new(StageKind::Forward, index)
    }

    pub fn backward(index: usize) -> Self {
        Self::new(StageKind::Backward, index)
    }

    pub fn recomputation(index: usize) -> Self {
        Self::new(StageKind::Recomputation, index)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            StageKind::Forward => "F",
            StageKind::Backward => "B",
            StageKind::Recomputation => "R",
        };
        write!(f, "{}{}", prefix, self.index)
    }
}

/// Stage calls of one pipeline body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStages {
    pub computation: CompId,
    pub forward: Vec<InstId>,
    /// Reversed so that `backward[i]` pairs with `forward[i]`.
    pub backward: Vec<InstId>,
    pub recomputation: BTreeMap<usize, InstId>,
}

impl PipelineStages {
    /// Every stage call with its id, in execution order.
    pub fn all(&self) -> Vec<(StageId, InstId)> {
        let mut stages: Vec<(StageId, InstId)> = Vec::with_capacity(self.len());
        stages.extend(self.forward.iter().enumerate().map(|(i, &s)| (StageId::forward(i), s)));
        for i in (0..self.backward.len()).rev() {
            if let Some(&r) = self.recomputation.get(&i) {
                stages.push((StageId::recomputation(i), r));
            }
            stages.push((StageId::backward(i), self.backward[i]));
        }
        stages
    }

    pub fn len(&self) -> usize {
        self.forward.len() + self.backward.len() + self.recomputation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: StageId) -> Option<InstId> {
        match id.kind {
            StageKind::Forward => self.forward.get(id.index).copied(),
            StageKind::Backward => self.backward.get(id.index).copied(),
            StageKind::Recomputation => self.recomputation.get(&id.index).copied(),
        }
    }

    pub fn stage_id(&self, stage: InstId) -> Option<StageId> {
        if let Some(i) = self.forward.iter().position(|&s| s == stage) {
            return Some(StageId::forward(i));
        }
        if let Some(i) = self.backward.iter().position(|&s| s == stage) {
            return Some(StageId::backward(i));
        }
        self.recomputation
            .iter()
            .find(|(_, &s)| s == stage)
            .map(|(&i, _)| StageId::recomputation(i))
    }

    /// Rank of a stage in execution order: F0..Fn-1, then for i = n-1..0
    /// recomputation Ri followed by backward Bi.
    pub fn execution_position(&self, id: StageId) -> usize {
        let n = self.forward.len();
        let mirrored = n.saturating_sub(1).saturating_sub(id.index);
        match id.kind {
            StageKind::Forward => id.index,
            StageKind::Recomputation => n + 2 * mirrored,
            StageKind::Backward => n + 2 * mirrored + 1,
        }
    }
}

/// The backward stage a recomputation stage feeds, looking through
/// get-tuple-element users.
fn recomputation_consumer(module: &Module, stage: InstId, backward: &[InstId]) -> Option<usize> {
    let mut consumers = Vec::new();
    for &user in module.inst(stage).users() {
        if module.inst(user).tuple_index().is_some() {
            consumers.extend_from_slice(module.inst(user).users());
        } else {
            consumers.push(user);
        }
    }
    consumers.iter().find_map(|c| backward.iter().position(|b| b == c))
}

/// Collects the stage calls of `pipeline`, a pipeline body computation.
pub fn get_pipeline_stages(module: &Module, pipeline: CompId) -> PassResult<PipelineStages> {
    let mut forward = Vec::new();
    let mut backward = Vec::new();
    let mut recomputation_calls = Vec::new();
    for inst in module.post_order(pipeline) {
        match module.inst(inst).stage_kind() {
            Some(StageKind::Forward) => forward.push(inst),
            Some(StageKind::Backward) => backward.push(inst),
            Some(StageKind::Recomputation) => recomputation_calls.push(inst),
            None => {}
        }
    }
    backward.reverse();

    if !backward.is_empty() && backward.len() != forward.len() {
        return Err(PassError::failed_precondition(format!(
            "pipeline {} has {} forward stages and {} backward stages",
            module.computation(pipeline).name(),
            forward.len(),
            backward.len()
        )));
    }

    let mut recomputation = BTreeMap::new();
    for stage in recomputation_calls {
        let index = recomputation_consumer(module, stage, &backward).ok_or_else(|| {
            PassError::failed_precondition(format!(
                "recomputation stage {} does not feed a backward stage",
                module.inst(stage).name()
            ))
        })?;
        if recomputation.insert(index, stage).is_some() {
            return Err(PassError::failed_precondition(format!(
                "more than one recomputation stage for stage {}",
                index
            )));
        }
    }

    Ok(PipelineStages {
        computation: pipeline,
        forward,
        backward,
        recomputation,
    })
}

/// Structural prerequisites of the fixer: every stage returns a tuple, is
/// only used through get-tuple-element and is not the pipeline root.
pub fn verify_stages_before_fixing(module: &Module, stages: &PipelineStages) -> PassResult<()> {
    for (id, stage) in stages.all() {
        let inst = module.inst(stage);
        let body = inst
            .called_computation()
            .ok_or_else(|| PassError::internal(format!("stage {} is not a call", inst.name())))?;
        let root = module.root(body)?;
        if module.inst(root).kind() != OpKind::Tuple {
            return Err(PassError::unimplemented(format!(
                "expected the root of pipeline stage {} ({}) to be a tuple",
                id,
                inst.name()
            )));
        }
        if let Some(&user) = inst.users().iter().find(|&&u| module.inst(u).tuple_index().is_none()) {
            return Err(PassError::unimplemented(format!(
                "pipeline stage {} is used by {}, expected only get-tuple-element users",
                id,
                module.inst(user).short_string()
            )));
        }
        if module.is_root(stage) {
            return Err(PassError::unimplemented(format!(
                "pipeline stage {} cannot be the root of the pipeline",
                id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CallKind, PrimitiveType, Shape};

    fn f32s() -> Shape {
        Shape::array(PrimitiveType::F32, &[2])
    }

    fn stage_body(m: &mut Module, name: &str) -> CompId {
        let c = m.add_computation(name);
        let p = m.add_parameter(c, 0, f32s(), None);
        let t = m.add_tuple(c, vec![p]);
        m.set_root(c, t);
        c
    }

    fn add_stage(m: &mut Module, pipeline: CompId, kind: StageKind, input: InstId, name: &str) -> InstId {
        let body = stage_body(m, name);
        let call = m.add_call(pipeline, body, CallKind::PipelineStage(kind), vec![input], Some(name)).unwrap();
        m.add_gte(pipeline, call, 0).unwrap()
    }

    #[test]
    fn test_stage_order_and_recomputation_pairing() {
        let mut m = Module::new("m");
        let p = m.add_computation("pipeline");
        let x = m.add_parameter(p, 0, f32s(), None);
        let f0 = add_stage(&mut m, p, StageKind::Forward, x, "f0");
        let f1 = add_stage(&mut m, p, StageKind::Forward, f0, "f1");
        let r0 = add_stage(&mut m, p, StageKind::Recomputation, f0, "r0");
        let b1 = add_stage(&mut m, p, StageKind::Backward, f1, "b1");
        let b0 = add_stage(&mut m, p, StageKind::Backward, r0, "b0");
        let root = m.add_tuple(p, vec![b0, b1]);
        m.set_root(p, root);

        let stages = get_pipeline_stages(&m, p).unwrap();
        let names = |v: &[InstId]| v.iter().map(|&s| m.inst(s).name().to_string()).collect::<Vec<_>>();
        assert_eq!(names(&stages.forward), vec!["f0", "f1"]);
        assert_eq!(names(&stages.backward), vec!["b0", "b1"]);
        let r0_call = m.inst(r0).operand(0).unwrap();
        assert_eq!(stages.recomputation.get(&0), Some(&r0_call));
        assert_eq!(stages.stage_id(r0_call), Some(StageId::recomputation(0)));

        let order: Vec<String> = stages.all().iter().map(|(id, _)| id.to_string()).collect();
        assert_eq!(order, vec!["F0", "F1", "B1", "R0", "B0"]);
        assert!(
            stages.execution_position(StageId::recomputation(0)) < stages.execution_position(StageId::backward(0))
        );
        assert!(stages.execution_position(StageId::backward(1)) < stages.execution_position(StageId::backward(0)));
    }

    #[test]
    fn test_mismatched_backward_count_is_rejected() {
        let mut m = Module::new("m");
        let p = m.add_computation("pipeline");
        let x = m.add_parameter(p, 0, f32s(), None);
        let f0 = add_stage(&mut m, p, StageKind::Forward, x, "f0");
        let f1 = add_stage(&mut m, p, StageKind::Forward, f0, "f1");
        let b = add_stage(&mut m, p, StageKind::Backward, f1, "b");
        let root = m.add_tuple(p, vec![b]);
        m.set_root(p, root);
        let err = get_pipeline_stages(&m, p).unwrap_err();
        assert!(matches!(err, PassError::FailedPrecondition(_)));
    }

    #[test]
    fn test_stage_used_without_gte_is_unimplemented() {
        let mut m = Module::new("m");
        let p = m.add_computation("pipeline");
        let x = m.add_parameter(p, 0, f32s(), None);
        let body = stage_body(&mut m, "f0");
        let call = m.add_call(p, body, CallKind::PipelineStage(StageKind::Forward), vec![x], None).unwrap();
        let root = m.add_tuple(p, vec![call]);
        m.set_root(p, root);
        let stages = get_pipeline_stages(&m, p).unwrap();
        let err = verify_stages_before_fixing(&m, &stages).unwrap_err();
        assert!(matches!(err, PassError::Unimplemented(_)));
    }
}
