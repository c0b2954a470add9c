//! Mid-end configuration.
//!
//! Defaults live in code. [`MidendConfig::from_env`] layers `MIDEND_*`
//! environment variables on top; the `midend-opt` binary layers its command
//! line flags on top of that.

use std::str::FromStr;

use super::error::{PassError, PassResult};

/// Which passes the default pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSelection {
    pub fuse_ops: bool,
    pub allocation_finder: bool,
    pub forward_allocation: bool,
    pub pipeline_fixer: bool,
}

impl Default for PassSelection {
    fn default() -> Self {
        Self {
            fuse_ops: true,
            allocation_finder: true,
            forward_allocation: true,
            pipeline_fixer: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidendConfig {
    /// How deep the matcher may look through associative chains; 0 disables.
    pub look_through_max_depth: usize,
    /// Reject matches whose instructions disagree on sharding.
    pub requires_unique_sharding: bool,
    /// Only match inside the entry computation.
    pub root_computation_only: bool,
    /// Upper bound on iterations of any fixed-point wrapper.
    pub max_fixed_point_iterations: usize,
    pub passes: PassSelection,
}

impl Default for MidendConfig {
    fn default() -> Self {
        Self {
            look_through_max_depth: 3,
            requires_unique_sharding: false,
            root_computation_only: false,
            max_fixed_point_iterations: 25,
            passes: PassSelection::default(),
        }
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> PassResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| PassError::InvalidConfig(format!("{}={:?} is not a valid value", key, value)))
}

fn parse_flag(key: &str, value: &str) -> PassResult<bool> {
    match value.trim() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(PassError::InvalidConfig(format!("{}={:?} is not a boolean", key, value))),
    }
}

impl MidendConfig {
    /// Defaults overridden by `MIDEND_*` environment variables.
    pub fn from_env() -> PassResult<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies overrides from `lookup`, keyed by environment variable name.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> PassResult<()> {
        const DEPTH: &str = "MIDEND_LOOK_THROUGH_DEPTH";
        const SHARDING: &str = "MIDEND_UNIQUE_SHARDING";
        const ROOT_ONLY: &str = "MIDEND_ROOT_COMPUTATION_ONLY";
        const MAX_ITERS: &str = "MIDEND_MAX_ITERATIONS";
        const DISABLE: &str = "MIDEND_DISABLE_PASSES";

        if let Some(v) = lookup(DEPTH) {
            self.look_through_max_depth = parse_var(DEPTH, &v)?;
        }
        if let Some(v) = lookup(SHARDING) {
            self.requires_unique_sharding = parse_flag(SHARDING, &v)?;
        }
        if let Some(v) = lookup(ROOT_ONLY) {
            self.root_computation_only = parse_flag(ROOT_ONLY, &v)?;
        }
        if let Some(v) = lookup(MAX_ITERS) {
            self.max_fixed_point_iterations = parse_var(MAX_ITERS, &v)?;
            if self.max_fixed_point_iterations == 0 {
                return Err(PassError::InvalidConfig(format!("{} must be at least 1", MAX_ITERS)));
            }
        }
        if let Some(v) = lookup(DISABLE) {
            for name in v.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                self.disable_pass(name)?;
            }
        }
        Ok(())
    }

    /// Disables a pass by its pipeline name.
    pub fn disable_pass(&mut self, name: &str) -> PassResult<()> {
        match name {
            "fuse-ops" => self.passes.fuse_ops = false,
            "allocation-finder" => self.passes.allocation_finder = false,
            "forward-allocation" => self.passes.forward_allocation = false,
            "pipeline-fixer" => self.passes.pipeline_fixer = false,
            _ => return Err(PassError::InvalidConfig(format!("unknown pass '{}'", name))),
        }
        Ok(())
    }
}
