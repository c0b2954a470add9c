//! Textual module printer. Output parses back with [`parse_module`](super::parse_module).

use std::fmt::Write;

use hashbrown::HashSet;

use crate::allocation::TensorAllocationMap;
use crate::ir::{CompId, InstId, Module, Opcode};

/// Computations ordered so that every callee precedes its callers.
fn computation_order(module: &Module) -> Vec<CompId> {
    fn visit(module: &Module, comp: CompId, seen: &mut HashSet<CompId>, order: &mut Vec<CompId>) {
        if !seen.insert(comp) {
            return;
        }
        for inst in module.post_order(comp) {
            if let Some(callee) = module.inst(inst).called_computation() {
                visit(module, callee, seen, order);
            }
        }
        order.push(comp);
    }

    let mut seen = HashSet::new();
    let mut order = Vec::new();
    for comp in module.computation_ids() {
        visit(module, comp, &mut seen, &mut order);
    }
    order
}

fn names(module: &Module, ids: &[InstId]) -> String {
    ids.iter()
        .map(|&id| format!("%{}", module.inst(id).name()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One instruction line, without indentation.
pub fn print_instruction(module: &Module, id: InstId) -> String {
    let inst = module.inst(id);
    let mut out = String::new();
    if module.is_root(id) {
        out.push_str("ROOT ");
    }
    let _ = write!(out, "%{} = {} {}(", inst.name(), inst.shape(), inst.opcode().name());
    match inst.opcode() {
        Opcode::Parameter(n) => {
            let _ = write!(out, "{})", n);
        }
        Opcode::Constant(literal) => {
            let _ = write!(out, "{})", literal);
        }
        _ => {
            let _ = write!(out, "{})", names(module, inst.operands()));
        }
    }

    match inst.opcode() {
        Opcode::GetTupleElement(index) => {
            let _ = write!(out, ", index={}", index);
        }
        Opcode::Call { computation, kind } => {
            let _ = write!(out, ", to=%{}, kind={}", module.computation(*computation).name(), kind);
        }
        Opcode::CustomCall(cc) => {
            let _ = write!(out, ", target=\"{}\"", cc.target);
            if !cc.attributes.is_empty() {
                let attrs: Vec<String> = cc.attributes.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                let _ = write!(out, ", attrs={{{}}}", attrs.join(", "));
            }
        }
        _ => {}
    }
    if let Some(sharding) = inst.sharding() {
        let _ = write!(out, ", sharding={}", sharding);
    }
    if let Some(metadata) = inst.metadata() {
        let _ = write!(out, ", metadata=\"{}\"", metadata);
    }
    if let Some(config) = inst.backend_config() {
        let _ = write!(out, ", backend-config=\"{}\"", config);
    }
    if !inst.control_predecessors().is_empty() {
        let _ = write!(out, ", control-predecessors={{{}}}", names(module, inst.control_predecessors()));
    }
    out
}

pub fn print_computation(module: &Module, comp: CompId) -> String {
    let mut out = String::new();
    if module.entry() == Some(comp) {
        out.push_str("entry ");
    }
    let _ = writeln!(out, "computation %{} {{", module.computation(comp).name());
    for inst in module.post_order(comp) {
        let _ = writeln!(out, "  {}", print_instruction(module, inst));
    }
    out.push_str("}\n");
    out
}

/// The whole module, callees first.
pub fn print_module(module: &Module) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "module %{}", module.name());
    for comp in computation_order(module) {
        out.push('\n');
        out.push_str(&print_computation(module, comp));
    }
    out
}

/// One line per allocation entry:
/// `%source{index} -> %target operand N[, layout %producer{index}][, layout-path ...][, source-path ...]`.
pub fn print_allocation_map(module: &Module, map: &TensorAllocationMap) -> String {
    let mut out = String::new();
    for (source, target) in map {
        let _ = write!(
            out,
            "%{}{{{}}} -> %{} operand {}",
            module.inst(source.instruction).name(),
            source.output_index,
            module.inst(target.target).name(),
            target.input_index
        );
        if let Some(producer) = target.layout_producer {
            let _ = write!(out, ", layout %{}{{{}}}", module.inst(producer).name(), target.layout_output_index);
        }
        if !target.layout_path.is_empty() {
            let _ = write!(out, ", layout-path [{}]", names(module, &target.layout_path));
        }
        if !target.source_path.is_empty() {
            let _ = write!(out, ", source-path [{}]", names(module, &target.source_path));
        }
        out.push('\n');
    }
    out
}
