// This module provides arena-based pass session management using the bumpalo crate. A
// PassSession is created once per compilation and handed to every pass the pipeline runs.
// It borrows the arena that analyses bump-allocate their scratch data into (the pipeline
// dataflow analysis keeps its value sets there), owns the CompilerAnnotations that passes
// share (the tensor allocation map filled by the allocation finder and forward allocation
// and later consumed by code generation), and records SessionStats: passes run, passes
// that changed the module, fixed-point iterations, instructions outlined, tensor targets
// found and instructions lowered into pipeline stages. State sits behind RefCells so the
// session can be shared immutably while passes mutate the module.

//! Arena-based pass session management.
//!
//! All scratch objects allocated through the session share the arena
//! lifetime, so analyses can hand out plain slices instead of owned vectors.

use bumpalo::Bump;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::fmt;

use crate::allocation::TensorAllocationMap;

/// Annotations produced by the mid-end for the code generator.
#[derive(Debug, Default, Clone)]
pub struct CompilerAnnotations {
    pub tensor_allocation_map: TensorAllocationMap,
}

/// Pass session shared by every pass of one compilation.
pub struct PassSession<'arena> {
    /// Arena allocator for analysis scratch data.
    arena: &'arena Bump,

    /// Session statistics.
    stats: RefCell<SessionStats>,

    /// Annotations handed to code generation.
    annotations: RefCell<CompilerAnnotations>,
}

impl<'arena> PassSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            annotations: RefCell::new(CompilerAnnotations::default()),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate a slice copy in the arena.
    pub fn alloc_slice<T: Copy>(&self, values: &[T]) -> &'arena [T] {
        self.arena.alloc_slice_copy(values)
    }

    pub fn annotations(&self) -> Ref<'_, CompilerAnnotations> {
        self.annotations.borrow()
    }

    pub fn annotations_mut(&self) -> RefMut<'_, CompilerAnnotations> {
        self.annotations.borrow_mut()
    }

    /// Record that a pass ran and whether it changed the module.
    pub fn record_pass_run(&self, name: &str, changed: bool) {
        let mut stats = self.stats.borrow_mut();
        stats.passes_run += 1;
        *stats.pass_runs.entry(name.to_string()).or_insert(0) += 1;
        if changed {
            stats.passes_changed += 1;
        }
    }

    pub fn record_fixed_point_iteration(&self) {
        self.stats.borrow_mut().fixed_point_iterations += 1;
    }

    pub fn record_outlined(&self, instructions: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.matches_outlined += 1;
        stats.instructions_outlined += instructions;
    }

    pub fn record_target_found(&self) {
        self.stats.borrow_mut().targets_found += 1;
    }

    pub fn record_lowered(&self, instructions: usize) {
        self.stats.borrow_mut().instructions_lowered += instructions;
    }

    /// Get session statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Pass session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of pass invocations.
    pub passes_run: usize,

    /// Invocations that reported a change.
    pub passes_changed: usize,

    /// Invocations per pass name.
    pub pass_runs: BTreeMap<String, usize>,

    /// Iterations spent inside fixed-point wrappers.
    pub fixed_point_iterations: usize,

    /// Matches replaced by a call.
    pub matches_outlined: usize,

    /// Instructions moved into outlined computations.
    pub instructions_outlined: usize,

    /// Tensor targets recorded.
    pub targets_found: usize,

    /// Instructions lowered into pipeline stages.
    pub instructions_lowered: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pass Session Statistics:")?;
        writeln!(f, "  Passes run: {} ({} changed the module)", self.passes_run, self.passes_changed)?;
        writeln!(f, "  Fixed-point iterations: {}", self.fixed_point_iterations)?;
        writeln!(
            f,
            "  Matches outlined: {} ({} instructions)",
            self.matches_outlined, self.instructions_outlined
        )?;
        writeln!(f, "  Tensor targets found: {}", self.targets_found)?;
        writeln!(f, "  Instructions lowered: {}", self.instructions_lowered)?;

        if !self.pass_runs.is_empty() {
            writeln!(f, "  Pass breakdown:")?;
            for (name, count) in &self.pass_runs {
                writeln!(f, "    {}: {}", name, count)?;
            }
        }

        Ok(())
    }
}
