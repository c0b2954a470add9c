// This module hosts the graph model shared by every pass: an HLO-like dataflow IR made of
// instructions with typed outputs, ordered operand lists, user lists and ordering-only
// control edges, grouped into computations that each have one root and positional
// parameters. A Module owns every computation and every instruction in module-wide arenas
// addressed by stable integer ids (InstId, CompId), so the instruction/user back-references
// never form owning cycles. All mutation goes through Module methods, which keep operand,
// user and control lists consistent with each other.

//! Graph model: instructions, computations and the owning module.
//!
//! # Key Types
//!
//! - [`Module`] - arena owner and the only mutation entry point
//! - [`Instruction`] - opcode, shape, operands, users and control edges
//! - [`Computation`] - instruction list, parameters and root
//! - [`Opcode`] / [`OpKind`] - the op vocabulary and its payload-free discriminant
//! - [`Shape`] - array or tuple output shape

pub mod computation;
pub mod instruction;
pub mod module;
pub mod opcode;
pub mod shape;

use std::fmt;

pub use computation::Computation;
pub use instruction::{Instruction, BIAS_ADD_FUSION};
pub use module::Module;
pub use opcode::{AttrValue, Attributes, CallKind, CustomCall, Elementwise, OpInfo, OpKind, Opcode, StageKind};
pub use shape::{PrimitiveType, Shape};

/// Stable id of an instruction within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

impl InstId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stable id of a computation within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompId(pub u32);

impl CompId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CompId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "comp#{}", self.0)
    }
}
