//! A single node of the dataflow graph.
//!
//! Instructions are plain data; the id lists are kept consistent by the
//! owning [`Module`](super::Module). Capability queries live here because they
//! only look at the opcode and, for custom calls, its attributes.

use super::opcode::{CallKind, CustomCall, Elementwise, OpKind, Opcode, StageKind};
use super::{CompId, InstId, Shape};
use crate::core::{PassError, PassResult};

/// Fusion type produced by the bias-add pattern.
pub const BIAS_ADD_FUSION: &str = "bias_add";

#[derive(Debug, Clone)]
pub struct Instruction {
    pub(crate) id: InstId,
    pub(crate) name: String,
    pub(crate) parent: CompId,
    pub(crate) opcode: Opcode,
    pub(crate) shape: Shape,
    pub(crate) operands: Vec<InstId>,
    pub(crate) users: Vec<InstId>,
    pub(crate) control_predecessors: Vec<InstId>,
    pub(crate) control_successors: Vec<InstId>,
    pub(crate) sharding: Option<i64>,
    pub(crate) metadata: Option<String>,
    pub(crate) backend_config: Option<String>,
    pub(crate) removed: bool,
}

impl Instruction {
    pub fn id(&self) -> InstId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> CompId {
        self.parent
    }

    pub fn opcode(&self) -> &Opcode {
        &self.opcode
    }

    pub fn kind(&self) -> OpKind {
        self.opcode.kind()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn operands(&self) -> &[InstId] {
        &self.operands
    }

    pub fn operand(&self, index: usize) -> Option<InstId> {
        self.operands.get(index).copied()
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    /// Every position at which `operand` is used.
    pub fn operand_indices(&self, operand: InstId) -> Vec<usize> {
        self.operands
            .iter()
            .enumerate()
            .filter(|(_, &op)| op == operand)
            .map(|(i, _)| i)
            .collect()
    }

    /// First position at which `operand` is used.
    pub fn operand_index(&self, operand: InstId) -> Option<usize> {
        self.operands.iter().position(|&op| op == operand)
    }

    pub fn users(&self) -> &[InstId] {
        &self.users
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn control_predecessors(&self) -> &[InstId] {
        &self.control_predecessors
    }

    pub fn control_successors(&self) -> &[InstId] {
        &self.control_successors
    }

    pub fn sharding(&self) -> Option<i64> {
        self.sharding
    }

    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    pub fn backend_config(&self) -> Option<&str> {
        self.backend_config.as_deref()
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn parameter_number(&self) -> Option<usize> {
        match self.opcode {
            Opcode::Parameter(n) => Some(n),
            _ => None,
        }
    }

    pub fn tuple_index(&self) -> Option<usize> {
        match self.opcode {
            Opcode::GetTupleElement(i) => Some(i),
            _ => None,
        }
    }

    pub fn literal(&self) -> Option<&str> {
        match &self.opcode {
            Opcode::Constant(text) => Some(text),
            _ => None,
        }
    }

    /// Computation invoked by a call instruction.
    pub fn called_computation(&self) -> Option<CompId> {
        match &self.opcode {
            Opcode::Call { computation, .. } => Some(*computation),
            _ => None,
        }
    }

    pub fn call_kind(&self) -> Option<&CallKind> {
        match &self.opcode {
            Opcode::Call { kind, .. } => Some(kind),
            _ => None,
        }
    }

    pub fn custom_call(&self) -> Option<&CustomCall> {
        match &self.opcode {
            Opcode::CustomCall(cc) => Some(cc),
            _ => None,
        }
    }

    pub fn stage_kind(&self) -> Option<StageKind> {
        match self.call_kind() {
            Some(CallKind::PipelineStage(kind)) => Some(*kind),
            _ => None,
        }
    }

    /// Forward, backward or recomputation stage call.
    pub fn is_pipeline_stage(&self) -> bool {
        self.stage_kind().is_some()
    }

    pub fn is_pipeline(&self) -> bool {
        matches!(self.call_kind(), Some(CallKind::Pipeline))
    }

    pub fn is_fusion(&self) -> bool {
        matches!(self.call_kind(), Some(CallKind::Fusion(_)))
    }

    pub fn fusion_type(&self) -> Option<&str> {
        match self.call_kind() {
            Some(CallKind::Fusion(ty)) => Some(ty),
            _ => None,
        }
    }

    pub fn is_repeat_loop(&self) -> bool {
        matches!(self.call_kind(), Some(CallKind::RepeatLoop))
    }

    pub fn is_bias_add(&self) -> bool {
        self.fusion_type() == Some(BIAS_ADD_FUSION)
    }

    pub fn is_norm(&self) -> bool {
        matches!(self.kind(), OpKind::BatchNormInference | OpKind::BatchNormTraining)
    }

    /// Elementwise ops, including custom calls flagged `elementwise=true`
    /// and bias-add fusions.
    pub fn is_elementwise(&self) -> bool {
        if let Some(cc) = self.custom_call() {
            return cc.bool_attr("elementwise");
        }
        self.is_bias_add() || self.kind().info().elementwise != Elementwise::No
    }

    pub fn is_elementwise_binary(&self) -> bool {
        if self.is_bias_add() {
            return true;
        }
        self.is_elementwise() && self.operands.len() == 2
    }

    /// Whether the op wants one of its operands laid out like another one.
    ///
    /// A custom call flagged `layout_sensitive` must carry a
    /// `layout_dependencies` map; without it the configuration is broken and
    /// the fatal [`PassError::MissingLayoutDependencies`] is returned.
    pub fn is_layout_sensitive_target(&self) -> PassResult<bool> {
        if self.is_norm() {
            return Ok(true);
        }
        if let Some(deps) = self.layout_dependencies()? {
            return Ok(!deps.is_empty());
        }
        Ok(self.is_elementwise_binary())
    }

    /// The `layout_dependencies` map of a layout-sensitive custom call.
    /// `Ok(None)` for every other instruction.
    pub fn layout_dependencies(&self) -> PassResult<Option<&std::collections::BTreeMap<i64, i64>>> {
        let Some(cc) = self.custom_call() else {
            return Ok(None);
        };
        if !cc.bool_attr("layout_sensitive") {
            return Ok(None);
        }
        match cc.int_map_attr("layout_dependencies") {
            Some(map) => Ok(Some(map)),
            None => Err(PassError::MissingLayoutDependencies {
                instruction: format!("%{} ({})", self.name, cc.target),
            }),
        }
    }

    /// Operand indices a custom call allocates itself.
    pub fn allocating_indices(&self) -> &[i64] {
        self.custom_call()
            .and_then(|cc| cc.int_list_attr("allocating_indices"))
            .unwrap_or(&[])
    }

    pub fn short_string(&self) -> String {
        format!("%{} = {} {}", self.name, self.shape, self.opcode.name())
    }
}
