// This module groups the infrastructure shared by every mid-end pass: the error type and
// result alias, the arena-backed pass session carrying statistics and the compiler
// annotations handed to code generation, and the mid-end configuration with its
// environment overrides.

//! Core mid-end infrastructure.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based scratch allocation using `bumpalo`
//! - Pass statistics
//! - Compiler annotations (tensor allocation map)
//!
//! ## Errors (`error`)
//! - `PassError` / `PassResult`
//!
//! ## Configuration (`config`)
//! - `MidendConfig` defaults and `MIDEND_*` overrides

pub mod config;
pub mod error;
pub mod session;

pub use config::{MidendConfig, PassSelection};
pub use error::{PassError, PassResult};
pub use session::{CompilerAnnotations, PassSession, SessionStats};
