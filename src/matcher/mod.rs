// This module hosts the pattern matcher and outliner. Patterns describe small subgraphs
// declaratively (nodes with opcode targets, positional operand references and predicates,
// plus the inputs, in-place inputs and outputs of the fused region). The matcher finds
// them in a module, optionally looking through associative chains, and hands each
// accepted match to a MatchHandler. The default handler outlines the match into a fusion
// computation; FuseOps packages that with the built-in pattern library as a pass.

//! Pattern matching and outlining into fusions.
//!
//! # Key Types
//!
//! - [`Pattern`] / [`PatternNode`] - validated subgraph descriptions
//! - [`PatternMatcher`] - finds and filters matches over a module
//! - [`MatchHandler`] - what to do with an accepted [`Match`]
//! - [`FuseOps`] - the fusion pass over [`builtin_patterns`]

pub mod fuse_ops;
#[allow(clippy::module_inception)]
pub mod matcher;
pub mod outline;
pub mod pattern;

pub use fuse_ops::{builtin_patterns, FuseOps, FusionOutliner};
pub use matcher::{Match, MatchHandler, OperandRef, PatternMatcher, Trace};
pub use outline::{outline, reassociate};
pub use pattern::{NodeCondition, NodeId, OpcodeTarget, Pattern, PatternNode};
