//! Shared helpers for the integration tests.

#![allow(dead_code)]

use hlo_midend::ir::{InstId, Module};
use hlo_midend::text::parse_module;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Parses a module, panicking with the source on failure.
pub fn parse(text: &str) -> Module {
    init_logging();
    parse_module(text).unwrap_or_else(|e| panic!("Failed to parse module: {e}\n{text}"))
}

/// Live instruction named `name`.
pub fn inst(module: &Module, name: &str) -> InstId {
    module
        .find_instruction(name)
        .unwrap_or_else(|| panic!("no live instruction named %{name}"))
}

/// Helper to check if output contains expected patterns
pub fn check_output_contains(output: &str, patterns: &[&str]) {
    for pattern in patterns {
        assert!(
            output.contains(pattern),
            "Output missing expected pattern: '{pattern}'\nFull output:\n{output}"
        );
    }
}
