// This module implements the reachability index used to validate new ordering edges. For
// one computation it stores, per instruction, a bitset of every instruction that can reach
// it over operand and control edges (the instruction itself included). Building the index
// walks the computation in post order and unions predecessor sets. After an edge is added
// or removed, update_through_instruction recomputes the changed instruction's set from its
// predecessors and pushes the change down its users and control successors with a
// worklist, stopping wherever a recomputed set is unchanged, so only the affected cone is
// touched. Instructions created after the build are indexed lazily by the update.

//! Incremental reachability over operand and control edges.

use hashbrown::HashMap;

use crate::ir::{CompId, InstId, Module};

#[derive(Debug, Clone, Default)]
struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    fn insert(&mut self, bit: usize) {
        let word = bit / 64;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (bit % 64);
    }

    fn contains(&self, bit: usize) -> bool {
        self.words.get(bit / 64).is_some_and(|w| w & (1u64 << (bit % 64)) != 0)
    }

    fn union_with(&mut self, other: &BitSet) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
    }

    fn same_as(&self, other: &BitSet) -> bool {
        let len = self.words.len().max(other.words.len());
        (0..len).all(|i| self.words.get(i).copied().unwrap_or(0) == other.words.get(i).copied().unwrap_or(0))
    }
}

/// Ancestor sets for every instruction of one computation.
#[derive(Debug, Clone)]
pub struct ReachabilityMap {
    comp: CompId,
    index: HashMap<InstId, usize>,
    sets: Vec<BitSet>,
}

impl ReachabilityMap {
    pub fn build(module: &Module, comp: CompId) -> Self {
        let mut map = Self {
            comp,
            index: HashMap::new(),
            sets: Vec::new(),
        };
        for id in module.post_order(comp) {
            let slot = map.slot(id);
            map.sets[slot] = map.compute(module, id);
        }
        map
    }

    fn slot(&mut self, id: InstId) -> usize {
        if let Some(&slot) = self.index.get(&id) {
            return slot;
        }
        let slot = self.sets.len();
        self.index.insert(id, slot);
        self.sets.push(BitSet::default());
        slot
    }

    fn compute(&mut self, module: &Module, id: InstId) -> BitSet {
        let mut set = BitSet::default();
        set.insert(self.slot(id));
        let inst = module.inst(id);
        for &pred in inst.operands().iter().chain(inst.control_predecessors()) {
            if let Some(&p) = self.index.get(&pred) {
                set.union_with(&self.sets[p]);
            }
        }
        set
    }

    /// Whether there is a path from `from` to `to`. Every instruction
    /// reaches itself.
    pub fn is_reachable(&self, from: InstId, to: InstId) -> bool {
        match (self.index.get(&from), self.index.get(&to)) {
            (Some(&f), Some(&t)) => self.sets[t].contains(f),
            _ => false,
        }
    }

    /// Whether either instruction reaches the other.
    pub fn is_connected(&self, a: InstId, b: InstId) -> bool {
        self.is_reachable(a, b) || self.is_reachable(b, a)
    }

    /// Refreshes the index after the incoming edges of `id` changed.
    pub fn update_through_instruction(&mut self, module: &Module, id: InstId) {
        let mut worklist = vec![id];
        let mut first = true;
        while let Some(next) = worklist.pop() {
            if !module.is_live(next) || module.inst(next).parent() != self.comp {
                continue;
            }
            let slot = self.slot(next);
            let set = self.compute(module, next);
            if !first && set.same_as(&self.sets[slot]) {
                continue;
            }
            first = false;
            self.sets[slot] = set;
            let inst = module.inst(next);
            worklist.extend(inst.users().iter().chain(inst.control_successors()).copied());
        }
    }
}
