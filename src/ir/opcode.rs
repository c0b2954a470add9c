// This module defines the op vocabulary of the graph IR. Opcode is a tagged union over a
// fixed set of operations; the few variants that carry data (parameter number, literal,
// tuple index, called computation, custom-call target and attributes) hold it inline. OpKind is
// the payload-free discriminant used by patterns and the text format, with a const info
// table in the same spirit as a classic opcode table (name, arity, elementwise class).
// Custom calls are the open extension point: they carry a string target and an attribute
// map that capability queries inspect instead of hard-coding targets.

//! Opcodes, opcode kinds and custom-call attributes.

use std::collections::BTreeMap;
use std::fmt;

use super::CompId;

/// Payload-free discriminant of an [`Opcode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Parameter,
    Constant,
    Infeed,
    Abs,
    Exp,
    Log,
    Negate,
    Tanh,
    Logistic,
    Sqrt,
    Rsqrt,
    Convert,
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
    Power,
    And,
    Or,
    Compare,
    Select,
    Clamp,
    Broadcast,
    Reshape,
    Transpose,
    Slice,
    Concatenate,
    Reduce,
    Convolution,
    Dot,
    BatchNormInference,
    BatchNormTraining,
    Tuple,
    GetTupleElement,
    Call,
    CustomCall,
}

/// Elementwise class of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elementwise {
    No,
    Unary,
    Binary,
    Ternary,
}

#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    pub elementwise: Elementwise,
    /// Number of operands, `!0` when variadic.
    pub op_count: u32,
}

const VARIADIC: u32 = !0;

impl OpKind {
    pub const fn info(self) -> OpInfo {
        use Elementwise::*;
        use OpKind::*;
        const fn i(name: &'static str, elementwise: Elementwise, op_count: u32) -> OpInfo {
            OpInfo { name, elementwise, op_count }
        }
        match self {
            Parameter => i("parameter", No, 0),
            Constant => i("constant", No, 0),
            Infeed => i("infeed", No, 0),
            Abs => i("abs", Unary, 1),
            Exp => i("exponential", Unary, 1),
            Log => i("log", Unary, 1),
            Negate => i("negate", Unary, 1),
            Tanh => i("tanh", Unary, 1),
            Logistic => i("logistic", Unary, 1),
            Sqrt => i("sqrt", Unary, 1),
            Rsqrt => i("rsqrt", Unary, 1),
            Convert => i("convert", Unary, 1),
            Add => i("add", Binary, 2),
            Subtract => i("subtract", Binary, 2),
            Multiply => i("multiply", Binary, 2),
            Divide => i("divide", Binary, 2),
            Maximum => i("maximum", Binary, 2),
            Minimum => i("minimum", Binary, 2),
            Power => i("power", Binary, 2),
            And => i("and", Binary, 2),
            Or => i("or", Binary, 2),
            Compare => i("compare", Binary, 2),
            Select => i("select", Ternary, 3),
            Clamp => i("clamp", Ternary, 3),
            Broadcast => i("broadcast", No, 1),
            Reshape => i("reshape", No, 1),
            Transpose => i("transpose", No, 1),
            Slice => i("slice", No, 1),
            Concatenate => i("concatenate", No, VARIADIC),
            Reduce => i("reduce", No, 2),
            Convolution => i("convolution", No, 2),
            Dot => i("dot", No, 2),
            BatchNormInference => i("batch-norm-inference", No, 5),
            BatchNormTraining => i("batch-norm-training", No, 3),
            Tuple => i("tuple", No, VARIADIC),
            GetTupleElement => i("get-tuple-element", No, 1),
            Call => i("call", No, VARIADIC),
            CustomCall => i("custom-call", No, VARIADIC),
        }
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub const ALL: [OpKind; 38] = {
        use OpKind::*;
        [
            Parameter, Constant, Infeed, Abs, Exp, Log, Negate, Tanh, Logistic, Sqrt, Rsqrt,
            Convert, Add, Subtract, Multiply, Divide, Maximum, Minimum, Power, And, Or, Compare,
            Select, Clamp, Broadcast, Reshape, Transpose, Slice, Concatenate, Reduce, Convolution,
            Dot, BatchNormInference, BatchNormTraining, Tuple, GetTupleElement, Call, CustomCall,
        ]
    };

    pub fn from_name(s: &str) -> Option<Self> {
        OpKind::ALL.iter().copied().find(|k| k.name() == s)
    }

    /// Ops whose chains may be re-associated by the matcher.
    pub fn is_associative(self) -> bool {
        matches!(
            self,
            OpKind::Add | OpKind::Multiply | OpKind::Maximum | OpKind::Minimum | OpKind::And | OpKind::Or
        )
    }

    pub fn has_payload(self) -> bool {
        matches!(
            self,
            OpKind::Parameter | OpKind::Constant | OpKind::GetTupleElement | OpKind::Call | OpKind::CustomCall
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of pipeline stage a call instruction represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageKind {
    Forward,
    Backward,
    Recomputation,
}

/// What a `call` instruction means to the passes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallKind {
    Plain,
    /// Outlined by the matcher; carries the pattern type.
    Fusion(String),
    /// A whole pipeline; the called computation is the pipeline body.
    Pipeline,
    PipelineStage(StageKind),
    /// Body of a repeat loop.
    RepeatLoop,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::Plain => f.write_str("plain"),
            CallKind::Fusion(ty) => write!(f, "fusion:{}", ty),
            CallKind::Pipeline => f.write_str("pipeline"),
            CallKind::PipelineStage(StageKind::Forward) => f.write_str("stage:fwd"),
            CallKind::PipelineStage(StageKind::Backward) => f.write_str("stage:bwd"),
            CallKind::PipelineStage(StageKind::Recomputation) => f.write_str("stage:recomp"),
            CallKind::RepeatLoop => f.write_str("repeat"),
        }
    }
}

impl CallKind {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "plain" => CallKind::Plain,
            "pipeline" => CallKind::Pipeline,
            "stage:fwd" => CallKind::PipelineStage(StageKind::Forward),
            "stage:bwd" => CallKind::PipelineStage(StageKind::Backward),
            "stage:recomp" => CallKind::PipelineStage(StageKind::Recomputation),
            "repeat" => CallKind::RepeatLoop,
            _ => CallKind::Fusion(s.strip_prefix("fusion:")?.to_string()),
        })
    }
}

/// Attribute value carried by custom calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Str(String),
    IntList(Vec<i64>),
    IntMap(BTreeMap<i64, i64>),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::Str(s) => write!(f, "\"{}\"", s),
            AttrValue::IntList(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            AttrValue::IntMap(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

pub type Attributes = BTreeMap<String, AttrValue>;

/// Opaque backend op: a target name plus attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomCall {
    pub target: String,
    pub attributes: Attributes,
}

impl CustomCall {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn bool_attr(&self, key: &str) -> bool {
        matches!(self.attributes.get(key), Some(AttrValue::Bool(true)))
    }

    pub fn int_map_attr(&self, key: &str) -> Option<&BTreeMap<i64, i64>> {
        match self.attributes.get(key) {
            Some(AttrValue::IntMap(map)) => Some(map),
            _ => None,
        }
    }

    pub fn int_list_attr(&self, key: &str) -> Option<&[i64]> {
        match self.attributes.get(key) {
            Some(AttrValue::IntList(items)) => Some(items),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opcode {
    Parameter(usize),
    /// Literal text of the constant, e.g. `0` or `1.5`.
    Constant(String),
    Infeed,
    Abs,
    Exp,
    Log,
    Negate,
    Tanh,
    Logistic,
    Sqrt,
    Rsqrt,
    Convert,
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
    Power,
    And,
    Or,
    Compare,
    Select,
    Clamp,
    Broadcast,
    Reshape,
    Transpose,
    Slice,
    Concatenate,
    Reduce,
    Convolution,
    Dot,
    BatchNormInference,
    BatchNormTraining,
    Tuple,
    GetTupleElement(usize),
    Call { computation: CompId, kind: CallKind },
    CustomCall(CustomCall),
}

impl Opcode {
    pub fn kind(&self) -> OpKind {
        match self {
            Opcode::Parameter(_) => OpKind::Parameter,
            Opcode::Constant(_) => OpKind::Constant,
            Opcode::Infeed => OpKind::Infeed,
            Opcode::Abs => OpKind::Abs,
            Opcode::Exp => OpKind::Exp,
            Opcode::Log => OpKind::Log,
            Opcode::Negate => OpKind::Negate,
            Opcode::Tanh => OpKind::Tanh,
            Opcode::Logistic => OpKind::Logistic,
            Opcode::Sqrt => OpKind::Sqrt,
            Opcode::Rsqrt => OpKind::Rsqrt,
            Opcode::Convert => OpKind::Convert,
            Opcode::Add => OpKind::Add,
            Opcode::Subtract => OpKind::Subtract,
            Opcode::Multiply => OpKind::Multiply,
            Opcode::Divide => OpKind::Divide,
            Opcode::Maximum => OpKind::Maximum,
            Opcode::Minimum => OpKind::Minimum,
            Opcode::Power => OpKind::Power,
            Opcode::And => OpKind::And,
            Opcode::Or => OpKind::Or,
            Opcode::Compare => OpKind::Compare,
            Opcode::Select => OpKind::Select,
            Opcode::Clamp => OpKind::Clamp,
            Opcode::Broadcast => OpKind::Broadcast,
            Opcode::Reshape => OpKind::Reshape,
            Opcode::Transpose => OpKind::Transpose,
            Opcode::Slice => OpKind::Slice,
            Opcode::Concatenate => OpKind::Concatenate,
            Opcode::Reduce => OpKind::Reduce,
            Opcode::Convolution => OpKind::Convolution,
            Opcode::Dot => OpKind::Dot,
            Opcode::BatchNormInference => OpKind::BatchNormInference,
            Opcode::BatchNormTraining => OpKind::BatchNormTraining,
            Opcode::Tuple => OpKind::Tuple,
            Opcode::GetTupleElement(_) => OpKind::GetTupleElement,
            Opcode::Call { .. } => OpKind::Call,
            Opcode::CustomCall(_) => OpKind::CustomCall,
        }
    }

    /// Builds the opcode for a kind that carries no payload.
    pub fn from_kind(kind: OpKind) -> Option<Self> {
        Some(match kind {
            OpKind::Infeed => Opcode::Infeed,
            OpKind::Abs => Opcode::Abs,
            OpKind::Exp => Opcode::Exp,
            OpKind::Log => Opcode::Log,
            OpKind::Negate => Opcode::Negate,
            OpKind::Tanh => Opcode::Tanh,
            OpKind::Logistic => Opcode::Logistic,
            OpKind::Sqrt => Opcode::Sqrt,
            OpKind::Rsqrt => Opcode::Rsqrt,
            OpKind::Convert => Opcode::Convert,
            OpKind::Add => Opcode::Add,
            OpKind::Subtract => Opcode::Subtract,
            OpKind::Multiply => Opcode::Multiply,
            OpKind::Divide => Opcode::Divide,
            OpKind::Maximum => Opcode::Maximum,
            OpKind::Minimum => Opcode::Minimum,
            OpKind::Power => Opcode::Power,
            OpKind::And => Opcode::And,
            OpKind::Or => Opcode::Or,
            OpKind::Compare => Opcode::Compare,
            OpKind::Select => Opcode::Select,
            OpKind::Clamp => Opcode::Clamp,
            OpKind::Broadcast => Opcode::Broadcast,
            OpKind::Reshape => Opcode::Reshape,
            OpKind::Transpose => Opcode::Transpose,
            OpKind::Slice => Opcode::Slice,
            OpKind::Concatenate => Opcode::Concatenate,
            OpKind::Reduce => Opcode::Reduce,
            OpKind::Convolution => Opcode::Convolution,
            OpKind::Dot => Opcode::Dot,
            OpKind::BatchNormInference => Opcode::BatchNormInference,
            OpKind::BatchNormTraining => Opcode::BatchNormTraining,
            OpKind::Tuple => Opcode::Tuple,
            OpKind::Parameter
            | OpKind::Constant
            | OpKind::GetTupleElement
            | OpKind::Call
            | OpKind::CustomCall => {
                return None
            }
        })
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in OpKind::ALL {
            assert_eq!(OpKind::from_name(kind.name()), Some(kind));
            if let Some(op) = Opcode::from_kind(kind) {
                assert_eq!(op.kind(), kind);
            } else {
                assert!(kind.has_payload());
            }
        }
    }

    #[test]
    fn test_call_kind_parse() {
        assert_eq!(CallKind::parse("stage:bwd"), Some(CallKind::PipelineStage(StageKind::Backward)));
        assert_eq!(CallKind::parse("fusion:bias_add"), Some(CallKind::Fusion("bias_add".into())));
        assert_eq!(CallKind::parse("nonsense"), None);
        assert_eq!(CallKind::Fusion("relu".into()).to_string(), "fusion:relu");
    }

    #[test]
    fn test_elementwise_classes() {
        assert_eq!(OpKind::Add.info().elementwise, Elementwise::Binary);
        assert_eq!(OpKind::Exp.info().elementwise, Elementwise::Unary);
        assert_eq!(OpKind::Reshape.info().elementwise, Elementwise::No);
        assert!(OpKind::Maximum.is_associative());
        assert!(!OpKind::Subtract.is_associative());
    }
}
