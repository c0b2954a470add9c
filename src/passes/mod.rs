// This module defines the pass infrastructure of the mid-end. A Pass rewrites a Module in
// place and reports whether it changed anything; FixedPoint re-runs a pass until it
// reports no change (bounded by the configured iteration cap), which is the only retry
// mechanism the mid-end has. PassPipeline runs a sequence of passes in order, records
// every run in the session statistics, verifies the module after each pass in debug
// builds, and stops at the first error, logging fatal configuration errors distinctly.
// default_pipeline assembles the standard mid-end from a MidendConfig: fused-op
// outlining to a fixed point, the allocation finder, forward allocation to a fixed point
// and the pipeline fixer. The backend submodule is the hand-off to code generation.

//! Pass trait, fixed-point wrapper and the default pass pipeline.

pub mod backend;

use crate::allocation::{AllocationFinder, ForwardAllocation};
use crate::core::{MidendConfig, PassResult, PassSession};
use crate::ir::Module;
use crate::matcher::FuseOps;
use crate::pipeline::PipelineFixer;

pub use backend::{compile, CodegenBackend};

/// A module transformation.
///
/// `run` returns `Ok(true)` if the module changed, `Ok(false)` if it did not.
pub trait Pass {
    /// Pass name (used for logging and statistics).
    fn name(&self) -> &str;

    fn run(&mut self, module: &mut Module, session: &PassSession<'_>) -> PassResult<bool>;
}

/// Runs the wrapped pass until it stops changing the module.
pub struct FixedPoint<P> {
    inner: P,
    max_iterations: usize,
}

impl<P: Pass> FixedPoint<P> {
    pub fn new(inner: P, max_iterations: usize) -> Self {
        Self {
            inner,
            max_iterations: max_iterations.max(1),
        }
    }
}

impl<P: Pass> Pass for FixedPoint<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn run(&mut self, module: &mut Module, session: &PassSession<'_>) -> PassResult<bool> {
        let mut changed = false;
        for iteration in 0..self.max_iterations {
            session.record_fixed_point_iteration();
            if !self.inner.run(module, session)? {
                log::debug!("{} reached a fixed point after {} iteration(s)", self.inner.name(), iteration + 1);
                return Ok(changed);
            }
            changed = true;
        }
        log::warn!(
            "{} still changing the module after {} iterations, giving up",
            self.inner.name(),
            self.max_iterations
        );
        Ok(changed)
    }
}

/// An ordered list of passes.
#[derive(Default)]
pub struct PassPipeline {
    passes: Vec<Box<dyn Pass>>,
}

impl PassPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pass(&mut self, pass: impl Pass + 'static) -> &mut Self {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn run(&mut self, module: &mut Module, session: &PassSession<'_>) -> PassResult<bool> {
        let mut changed = false;
        for pass in &mut self.passes {
            log::info!("Running pass {}", pass.name());
            let result = match pass.run(module, session) {
                Ok(result) => result,
                Err(e) => {
                    if e.is_fatal() {
                        log::error!("Fatal error in {}: {}", pass.name(), e);
                    } else {
                        log::warn!("{} failed: {}", pass.name(), e);
                    }
                    return Err(e);
                }
            };
            session.record_pass_run(pass.name(), result);
            if cfg!(debug_assertions) {
                module.verify()?;
            }
            changed |= result;
        }
        Ok(changed)
    }
}

/// The standard mid-end pipeline for `config`.
pub fn default_pipeline(config: &MidendConfig) -> PassResult<PassPipeline> {
    let mut pipeline = PassPipeline::new();
    let iterations = config.max_fixed_point_iterations;
    if config.passes.fuse_ops {
        pipeline.add_pass(FixedPoint::new(FuseOps::new(config)?, iterations));
    }
    if config.passes.allocation_finder {
        pipeline.add_pass(AllocationFinder::new());
    }
    if config.passes.forward_allocation {
        pipeline.add_pass(FixedPoint::new(ForwardAllocation::new(), iterations));
    }
    if config.passes.pipeline_fixer {
        pipeline.add_pass(PipelineFixer::new());
    }
    Ok(pipeline)
}
