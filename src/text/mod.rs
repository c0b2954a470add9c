// This module hosts the textual form of a Module, used by the midend-opt driver and by the
// tests. Each computation is a brace-delimited list of instruction lines; callees are
// printed before their callers and exactly one computation is marked `entry`. The format
// is a debugging surface for the in-memory graph, not an interchange format.

//! Textual module format.
//!
//! ```text
//! ; comment
//! computation %fused {
//!   %p0 = f32[4] parameter(0)
//!   ROOT %e = f32[4] exponential(%p0)
//! }
//! entry computation %main {
//!   %a = f32[4] parameter(0)
//!   ROOT %c = f32[4] call(%a), to=%fused, kind=fusion:exp
//! }
//! ```
//!
//! Instruction attributes: `index=`, `to=`, `kind=`, `sharding=`,
//! `target="..."`, `attrs={key=value, ...}`, `control-predecessors={%a, ...}`,
//! `metadata="..."` and `backend-config="..."`.

pub mod parser;
pub mod printer;

pub use parser::parse_module;
pub use printer::{print_allocation_map, print_computation, print_instruction, print_module};
