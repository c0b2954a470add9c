//! Built-in fusion patterns and the pass that outlines them.

use super::matcher::{Match, MatchHandler, PatternMatcher};
use super::outline::outline;
use super::pattern::{Pattern, PatternNode};
use crate::core::{MidendConfig, PassResult, PassSession};
use crate::ir::{Instruction, Module, OpKind, PrimitiveType, BIAS_ADD_FUSION};
use crate::passes::Pass;

fn is_float(_: &Module, inst: &Instruction) -> bool {
    matches!(inst.shape().element_type(), Some(PrimitiveType::F16 | PrimitiveType::F32))
}

fn is_vector(_: &Module, inst: &Instruction) -> bool {
    !inst.shape().is_tuple() && inst.shape().dims().len() == 1
}

fn is_scalar_constant(_: &Module, inst: &Instruction) -> bool {
    inst.literal().is_some() && inst.shape().dims().is_empty() && !inst.shape().is_tuple()
}

fn is_zero_constant(module: &Module, inst: &Instruction) -> bool {
    is_scalar_constant(module, inst) && inst.literal().and_then(|l| l.parse::<f64>().ok()) == Some(0.0)
}

/// The patterns `FuseOps` tries, in priority order.
pub fn builtin_patterns() -> PassResult<Vec<Pattern>> {
    Ok(vec![
        // add(x, broadcast(bias)) with a vector bias; x is updated in place.
        Pattern::new(
            BIAS_ADD_FUSION,
            0,
            vec![2, 3],
            vec![2],
            vec![0],
            vec![
                PatternNode::new(OpKind::Add, &[2, 1]).with_condition(is_float),
                PatternNode::new(OpKind::Broadcast, &[3]),
                PatternNode::input(),
                PatternNode::input().with_condition(is_vector),
            ],
        )?,
        // x + y * broadcast(scale)
        Pattern::new(
            "scaled_add",
            0,
            vec![2, 3],
            vec![2],
            vec![0],
            vec![
                PatternNode::new(OpKind::Add, &[2, 1]).with_condition(is_float),
                PatternNode::new(OpKind::Multiply, &[3, 4]),
                PatternNode::input(),
                PatternNode::input(),
                PatternNode::new(OpKind::Broadcast, &[5]),
                PatternNode::new(OpKind::Constant, &[]).with_condition(is_scalar_constant),
            ],
        )?,
        // max(x, broadcast(0))
        Pattern::new(
            "relu",
            0,
            vec![2],
            vec![],
            vec![0],
            vec![
                PatternNode::new(OpKind::Maximum, &[2, 1]).with_condition(is_float),
                PatternNode::new(OpKind::Broadcast, &[3]),
                PatternNode::input(),
                PatternNode::new(OpKind::Constant, &[]).with_condition(is_zero_constant),
            ],
        )?,
        Pattern::new(
            "sigmoid",
            0,
            vec![1],
            vec![],
            vec![0],
            vec![PatternNode::new(OpKind::Logistic, &[1]).with_condition(is_float), PatternNode::input()],
        )?,
        // exp(x) + y
        Pattern::new(
            "exp_add",
            0,
            vec![2, 3],
            vec![],
            vec![0],
            vec![
                PatternNode::new(OpKind::Add, &[1, 3]),
                PatternNode::new(OpKind::Exp, &[2]),
                PatternNode::input(),
                PatternNode::input(),
            ],
        )?,
    ])
}

/// Outlines every accepted match into a fusion named after its pattern.
#[derive(Debug, Default)]
pub struct FusionOutliner;

impl MatchHandler for FusionOutliner {
    fn handle_match(
        &mut self,
        module: &mut Module,
        pattern: &Pattern,
        matched: &Match,
        sharding: Option<i64>,
        session: &PassSession<'_>,
    ) -> PassResult<bool> {
        let fused = matched.fused_instructions(pattern).len();
        outline(module, pattern, matched, pattern.ty(), sharding, &[])?;
        session.record_outlined(fused);
        Ok(true)
    }
}

pub struct FuseOps {
    matcher: PatternMatcher,
    outliner: FusionOutliner,
}

impl FuseOps {
    pub fn new(config: &MidendConfig) -> PassResult<Self> {
        Ok(Self::with_patterns(builtin_patterns()?, config))
    }

    pub fn with_patterns(patterns: Vec<Pattern>, config: &MidendConfig) -> Self {
        Self {
            matcher: PatternMatcher::new(patterns, config),
            outliner: FusionOutliner,
        }
    }
}

impl Pass for FuseOps {
    fn name(&self) -> &str {
        "fuse-ops"
    }

    fn run(&mut self, module: &mut Module, session: &PassSession<'_>) -> PassResult<bool> {
        self.matcher.run(module, &mut self.outliner, session)
    }
}
