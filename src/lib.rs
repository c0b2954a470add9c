//! hlo-midend - graph transformations between an HLO-like front end and an
//! accelerator code generator.
//!
//! The mid-end rewrites a [`Module`](ir::Module) in place: it outlines fusible
//! subgraphs into fusion computations, decides which consumer fixes the layout
//! of each unallocated tensor, and legalizes the dataflow of pipelined
//! computations so that every instruction lives inside a stage.
//!
//! # Primary Usage
//!
//! ```ignore
//! use bumpalo::Bump;
//! use hlo_midend::core::{MidendConfig, PassSession};
//! use hlo_midend::passes::default_pipeline;
//! use hlo_midend::text::parse_module;
//!
//! let mut module = parse_module(&text)?;
//! let arena = Bump::new();
//! let session = PassSession::new(&arena);
//! default_pipeline(&MidendConfig::from_env()?)?.run(&mut module, &session)?;
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - graph model and mutation API
//! - [`analysis`] - reachability index and meta graphs
//! - [`matcher`] - pattern matcher and outliner
//! - [`allocation`] - allocation finder and forward allocation
//! - [`pipeline`] - pipeline stage dataflow legalizer and fixer
//! - [`passes`] - pass trait, fixed point and the default pipeline
//! - [`core`] - errors, configuration and the pass session
//! - [`text`] - textual module format

pub mod allocation;
pub mod analysis;
pub mod core;
pub mod ir;
pub mod matcher;
pub mod passes;
pub mod pipeline;
pub mod text;

pub use core::{CompilerAnnotations, MidendConfig, PassError, PassResult, PassSession, SessionStats};
pub use ir::{CompId, InstId, Module};
pub use passes::{default_pipeline, Pass, PassPipeline};
