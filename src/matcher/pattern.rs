//! Declarative subgraph patterns.
//!
//! A [`Pattern`] is an ordered list of [`PatternNode`]s. Node operands refer
//! to other nodes by position; negative operands are anonymous external
//! parameters that match anything (equal negative ids must bind the same
//! instruction). Input nodes become parameters of the outlined computation,
//! every other node is fused.

use std::fmt;

use crate::analysis::MetaGraph;
use crate::core::{PassError, PassResult};
use crate::ir::{InstId, Instruction, Module, OpKind};

/// Index of a node within its pattern, or a negative external parameter id.
pub type NodeId = i64;

/// Extra check on a candidate instruction.
pub type NodeCondition = fn(&Module, &Instruction) -> bool;

/// Which opcodes a node accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeTarget {
    Exact(OpKind),
    Any,
}

impl OpcodeTarget {
    pub fn accepts(self, kind: OpKind) -> bool {
        match self {
            OpcodeTarget::Exact(k) => k == kind,
            OpcodeTarget::Any => true,
        }
    }
}

impl From<OpKind> for OpcodeTarget {
    fn from(kind: OpKind) -> Self {
        OpcodeTarget::Exact(kind)
    }
}

#[derive(Clone)]
pub struct PatternNode {
    pub target: OpcodeTarget,
    pub operands: Vec<NodeId>,
    pub conditions: Vec<NodeCondition>,
}

impl PatternNode {
    pub fn new(target: impl Into<OpcodeTarget>, operands: &[NodeId]) -> Self {
        Self {
            target: target.into(),
            operands: operands.to_vec(),
            conditions: Vec::new(),
        }
    }

    /// An input node: any opcode, operands not inspected.
    pub fn input() -> Self {
        Self::new(OpcodeTarget::Any, &[])
    }

    pub fn with_condition(mut self, condition: NodeCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Opcode and predicates only; operands are checked by the matcher.
    pub fn accepts(&self, module: &Module, id: InstId) -> bool {
        let inst = module.inst(id);
        self.target.accepts(inst.kind()) && self.conditions.iter().all(|c| c(module, inst))
    }
}

impl fmt::Debug for PatternNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternNode")
            .field("target", &self.target)
            .field("operands", &self.operands)
            .field("conditions", &self.conditions.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Pattern {
    ty: String,
    meta_target: NodeId,
    inputs: Vec<NodeId>,
    inplace_inputs: Vec<NodeId>,
    inplace_input_indices: Vec<usize>,
    outputs: Vec<NodeId>,
    nodes: Vec<PatternNode>,
}

impl Pattern {
    /// Builds and validates a pattern.
    ///
    /// `ty` names the outlined computation, `meta_target` is the node whose
    /// metadata the call inherits, `inputs` become parameters in the given
    /// order and `outputs` become the root (a tuple when more than one).
    pub fn new(
        ty: impl Into<String>,
        meta_target: NodeId,
        inputs: Vec<NodeId>,
        inplace_inputs: Vec<NodeId>,
        outputs: Vec<NodeId>,
        nodes: Vec<PatternNode>,
    ) -> PassResult<Self> {
        let ty = ty.into();
        let invalid = |reason: String| PassError::InvalidPattern {
            pattern: ty.clone(),
            reason,
        };
        let valid_id = |id: NodeId| id >= 0 && (id as usize) < nodes.len();

        if outputs.is_empty() {
            return Err(invalid("pattern has no outputs".into()));
        }
        for &id in outputs.iter().chain(&inputs).chain(&inplace_inputs).chain([&meta_target]) {
            if !valid_id(id) {
                return Err(invalid(format!("node id {} out of range", id)));
            }
        }
        for (index, node) in nodes.iter().enumerate() {
            for &op in &node.operands {
                if op >= 0 && !valid_id(op) {
                    return Err(invalid(format!("node {} has out of range operand {}", index, op)));
                }
            }
        }
        for &id in &outputs {
            if inputs.contains(&id) {
                return Err(invalid(format!("node {} is both an input and an output", id)));
            }
        }
        if inputs.contains(&meta_target) {
            return Err(invalid("meta target is an input".into()));
        }
        let mut inplace_input_indices = Vec::with_capacity(inplace_inputs.len());
        for &id in &inplace_inputs {
            match inputs.iter().position(|&i| i == id) {
                Some(index) => inplace_input_indices.push(index),
                None => return Err(invalid(format!("in-place input {} is not an input", id))),
            }
        }

        let pattern = Self {
            ty,
            meta_target,
            inputs,
            inplace_inputs,
            inplace_input_indices,
            outputs,
            nodes,
        };
        if !pattern.node_graph().is_weakly_connected() {
            return Err(PassError::InvalidPattern {
                pattern: pattern.ty,
                reason: "pattern graph is not connected".into(),
            });
        }
        Ok(pattern)
    }

    pub fn ty(&self) -> &str {
        &self.ty
    }

    pub fn meta_target(&self) -> NodeId {
        self.meta_target
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn inplace_inputs(&self) -> &[NodeId] {
        &self.inplace_inputs
    }

    /// Positions within `inputs` of the in-place inputs.
    pub fn inplace_input_indices(&self) -> &[usize] {
        &self.inplace_input_indices
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn nodes(&self) -> &[PatternNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &PatternNode {
        &self.nodes[id as usize]
    }

    /// Node where matching starts.
    pub fn root(&self) -> NodeId {
        self.outputs[0]
    }

    pub fn is_input(&self, id: NodeId) -> bool {
        self.inputs.contains(&id)
    }

    /// Node -> operand node edges (external parameters excluded).
    pub fn node_graph(&self) -> MetaGraph<NodeId> {
        let mut graph = MetaGraph::new();
        for (index, node) in self.nodes.iter().enumerate() {
            let index = index as NodeId;
            graph.add_vertex(index);
            if self.is_input(index) {
                continue;
            }
            for &op in node.operands.iter().filter(|&&op| op >= 0) {
                graph.add_edge(index, op);
            }
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exp_add(outputs: Vec<NodeId>) -> PassResult<Pattern> {
        Pattern::new(
            "exp_add",
            0,
            vec![2, 3],
            vec![],
            outputs,
            vec![
                PatternNode::new(OpKind::Add, &[1, 3]),
                PatternNode::new(OpKind::Exp, &[2]),
                PatternNode::input(),
                PatternNode::input(),
            ],
        )
    }

    #[test]
    fn test_valid_pattern() {
        let p = exp_add(vec![0]).unwrap();
        assert_eq!(p.root(), 0);
        assert!(p.is_input(3));
        assert!(!p.is_input(1));
    }

    #[test]
    fn test_rejects_missing_outputs() {
        let err = exp_add(vec![]).unwrap_err();
        assert!(matches!(err, PassError::InvalidPattern { .. }));
        assert!(err.to_string().contains("no outputs"));
    }

    #[test]
    fn test_rejects_bad_ids_and_disconnected_graphs() {
        assert!(exp_add(vec![7]).is_err());
        let disconnected = Pattern::new(
            "split",
            0,
            vec![],
            vec![],
            vec![0],
            vec![PatternNode::new(OpKind::Exp, &[-1]), PatternNode::new(OpKind::Log, &[-1])],
        );
        assert!(disconnected.unwrap_err().to_string().contains("not connected"));
    }

    #[test]
    fn test_inplace_inputs_must_be_inputs() {
        let p = Pattern::new(
            "bad",
            0,
            vec![1],
            vec![0],
            vec![0],
            vec![PatternNode::new(OpKind::Exp, &[1]), PatternNode::input()],
        );
        assert!(p.is_err());
        let p = Pattern::new(
            "ok",
            0,
            vec![1],
            vec![1],
            vec![0],
            vec![PatternNode::new(OpKind::Exp, &[1]), PatternNode::input()],
        )
        .unwrap();
        assert_eq!(p.inplace_input_indices(), &[0]);
    }
}
