//! Seeds the tensor allocation map with sources consumed by ops that
//! allocate their own operands (convolutions, dots and custom calls listing
//! the operand in `allocating_indices`).
//!
//! From every unallocated parameter or infeed leaf the finder walks forward
//! through reshape and transpose users. The first allocating consumer found
//! breadth first becomes the target; the walked chain is the source path.
//! Those targets are the first layout producers forward allocation works from.

use std::collections::VecDeque;

use super::map::{tuple_leaves, TensorAllocationMap, TensorSource, TensorTarget};
use crate::core::{PassResult, PassSession};
use crate::ir::{CompId, InstId, Module, OpKind};
use crate::passes::Pass;

#[derive(Debug, Default)]
pub struct AllocationFinder;

impl AllocationFinder {
    pub fn new() -> Self {
        Self
    }

    fn allocates_operand(module: &Module, user: InstId, index: usize) -> bool {
        let inst = module.inst(user);
        match inst.kind() {
            OpKind::Convolution | OpKind::Dot => true,
            OpKind::CustomCall => inst.allocating_indices().contains(&(index as i64)),
            _ => false,
        }
    }

    fn find_target(module: &Module, leaf: InstId) -> Option<TensorTarget> {
        // (instruction, path of reshapes/transposes that led to it)
        let mut queue = VecDeque::from([(leaf, Vec::new())]);
        while let Some((current, path)) = queue.pop_front() {
            for &user in module.inst(current).users() {
                let user_inst = module.inst(user);
                for index in user_inst.operand_indices(current) {
                    if Self::allocates_operand(module, user, index) {
                        return Some(TensorTarget {
                            target: user,
                            input_index: index,
                            layout_producer: None,
                            layout_output_index: 0,
                            layout_path: Vec::new(),
                            source_path: path,
                        });
                    }
                }
                if matches!(user_inst.kind(), OpKind::Reshape | OpKind::Transpose) && !path.contains(&user) {
                    let mut next = path.clone();
                    next.push(user);
                    queue.push_back((user, next));
                }
            }
        }
        None
    }

    fn run_on_computation(&self, module: &Module, comp: CompId, map: &mut TensorAllocationMap) -> usize {
        let mut found = 0;
        for id in module.post_order(comp) {
            let inst = module.inst(id);
            if !matches!(inst.kind(), OpKind::Parameter | OpKind::Infeed) {
                continue;
            }
            for leaf in tuple_leaves(module, id) {
                let source = TensorSource::new(id, leaf.flat_index);
                if map.contains_key(&source) {
                    continue;
                }
                if let Some(mut target) = Self::find_target(module, leaf.leaf) {
                    log::debug!(
                        "Allocation target for %{}[{}]: %{} operand {}",
                        inst.name(),
                        leaf.flat_index,
                        module.inst(target.target).name(),
                        target.input_index
                    );
                    let mut source_path = leaf.gte_chain;
                    source_path.append(&mut target.source_path);
                    target.source_path = source_path;
                    map.insert(source, target);
                    found += 1;
                }
            }
        }
        found
    }
}

impl Pass for AllocationFinder {
    fn name(&self) -> &str {
        "allocation-finder"
    }

    fn run(&mut self, module: &mut Module, session: &PassSession<'_>) -> PassResult<bool> {
        let mut annotations = session.annotations_mut();
        let map = &mut annotations.tensor_allocation_map;
        let mut found = 0;
        for comp in module.computation_ids() {
            if module.is_fusion_computation(comp) {
                continue;
            }
            found += self.run_on_computation(module, comp, map);
        }
        log::debug!("allocation-finder recorded {} source(s)", found);
        Ok(found > 0)
    }
}
