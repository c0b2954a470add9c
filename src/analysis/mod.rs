//! Graph analyses shared by the passes.
//!
//! - [`ReachabilityMap`] - "is B reachable from A" with incremental updates
//! - [`MetaGraph`] - consumer closures, transposes and shortest paths

pub mod meta_graph;
pub mod reachability;

pub use meta_graph::MetaGraph;
pub use reachability::ReachabilityMap;
