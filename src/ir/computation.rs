//! A computation: an ordered instruction list with positional parameters and one root.

use super::{CompId, InstId};

#[derive(Debug, Clone)]
pub struct Computation {
    pub(crate) id: CompId,
    pub(crate) name: String,
    /// Live instructions in insertion order.
    pub(crate) instructions: Vec<InstId>,
    /// Parameter instruction per parameter number.
    pub(crate) parameters: Vec<Option<InstId>>,
    pub(crate) root: Option<InstId>,
    pub(crate) removed: bool,
}

impl Computation {
    pub(crate) fn new(id: CompId, name: String) -> Self {
        Self {
            id,
            name,
            instructions: Vec::new(),
            parameters: Vec::new(),
            root: None,
            removed: false,
        }
    }

    pub fn id(&self) -> CompId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &[InstId] {
        &self.instructions
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn root(&self) -> Option<InstId> {
        self.root
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters.len()
    }

    pub fn parameter(&self, number: usize) -> Option<InstId> {
        self.parameters.get(number).copied().flatten()
    }

    /// Parameter instructions in parameter-number order.
    pub fn parameters(&self) -> impl Iterator<Item = InstId> + '_ {
        self.parameters.iter().filter_map(|p| *p)
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }
}
