// This module hosts the allocation analyses. The tensor allocation map records, for each
// source tensor that has no layout of its own, the consumer whose layout it should adopt.
// The allocation finder seeds it from ops that allocate their own operands; forward
// allocation then propagates layouts from those seeds to further sources, inserting the
// control edges that make the layout producer run before the source is allocated.

//! Tensor allocation map, allocation finder and forward allocation.

pub mod finder;
pub mod forward;
pub mod map;

pub use finder::AllocationFinder;
pub use forward::ForwardAllocation;
pub use map::{ops_with_layout, tuple_leaves, TensorAllocationMap, TensorSource, TensorTarget, TupleLeaf};
