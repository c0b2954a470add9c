//! Hand-off to code generation.
//!
//! The mid-end does not generate code itself. A [`CodegenBackend`] receives the
//! transformed module together with the [`CompilerAnnotations`] and builds its
//! engine; [`compile`] runs the mid-end pipeline first and translates whatever
//! the engine build reports, including panics, into [`PassError::Backend`].

use std::panic::{self, AssertUnwindSafe};

use crate::core::{CompilerAnnotations, MidendConfig, PassError, PassResult, PassSession};
use crate::ir::Module;

use super::default_pipeline;

/// A code generator consuming the output of the mid-end.
pub trait CodegenBackend {
    /// Compiled artifact.
    type Output;

    /// Backend name, used in logs.
    fn name(&self) -> &str;

    /// Builds the engine for `module`. Failures are reported as plain
    /// messages; panics are caught by [`compile`].
    fn build_engine(&mut self, module: &Module, annotations: &CompilerAnnotations) -> Result<Self::Output, String>;
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs the default pipeline over `module` and hands the result to `backend`.
pub fn compile<B: CodegenBackend>(
    module: &mut Module,
    config: &MidendConfig,
    session: &PassSession<'_>,
    backend: &mut B,
) -> PassResult<B::Output> {
    default_pipeline(config)?.run(module, session)?;

    let annotations = session.annotations().clone();
    log::info!(
        "Handing {} to backend {} ({} allocation entries)",
        module.name(),
        backend.name(),
        annotations.tensor_allocation_map.len()
    );
    let module: &Module = module;
    let result = panic::catch_unwind(AssertUnwindSafe(|| backend.build_engine(module, &annotations)));
    match result {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(message)) => Err(PassError::Backend(message)),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::error!("Backend panicked while building the engine: {}", message);
            Err(PassError::Backend(message))
        }
    }
}
