// This module hosts the pipeline dataflow legalizer. A pipeline body is partitioned into
// forward stages, optional backward stages paired with them and optional recomputation
// stages. The dataflow analysis tracks which producers reach each instruction and checks
// the locality rule on every stage input; the rewriter splices instructions into stages
// and removes stage parameters and outputs; the fixer pass drives both until every
// instruction of the body lives inside the right stage.

//! Pipeline stage discovery, dataflow analysis, stage rewrites and the fixer.
//!
//! # Key Types
//!
//! - [`PipelineStages`] / [`StageId`] - stage calls of one pipeline body
//! - [`PipelineDataflowAnalysis`] - value sets and the locality rule
//! - [`PipelineFixer`] - the pass that lowers stray instructions into stages

pub mod dataflow;
pub mod fixer;
pub mod rewrite;
pub mod stages;

pub use dataflow::{is_legal_stage_usage, verify_pipeline_after_fixing, PipelineDataflowAnalysis, Value, ValueId};
pub use fixer::PipelineFixer;
pub use rewrite::{
    add_instructions_to_pipeline_stage, duplicate_gte_edges, duplicate_inputs, duplicate_outputs, insert_gte_edges,
    remove_outputs_from_stage, remove_parameters_from_stage, replace_pipeline_stage_with,
    uniquify_pipeline_stage_callsites, unused_outputs, unused_parameters,
};
pub use stages::{get_pipeline_stages, verify_stages_before_fixing, PipelineStages, StageId};
