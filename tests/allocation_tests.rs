//! Allocation finder and forward allocation integration tests.

mod common;

use bumpalo::Bump;
use common::{check_output_contains, inst, parse};
use hlo_midend::allocation::{AllocationFinder, ForwardAllocation, TensorSource};
use hlo_midend::core::{MidendConfig, PassError, PassSession};
use hlo_midend::ir::Module;
use hlo_midend::passes::{default_pipeline, Pass};
use hlo_midend::text::{print_allocation_map, print_module};

/// Runs the allocation finder and then forward allocation once.
fn allocate(m: &mut Module, session: &PassSession<'_>) -> bool {
    AllocationFinder::new().run(m, session).unwrap();
    ForwardAllocation::new().run(m, session).unwrap()
}

const BATCH_NORM: &str = r#"
entry computation %main {
  %x = f32[1,4,4,2] parameter(0)
  %w = f32[2,2,2,2] parameter(1)
  %p = f32[1,2] parameter(2)
  %off = f32[2] parameter(3)
  %mean = f32[2] parameter(4)
  %var = f32[2] parameter(5)
  %c = f32[1,4,4,2] convolution(%x, %w)
  %r = f32[2] reshape(%p)
  ROOT %bn = f32[1,4,4,2] batch-norm-inference(%c, %r, %off, %mean, %var)
}
"#;

#[test]
fn test_batch_norm_scale_follows_convolution_layout() {
    common::init_logging();
    let mut m = parse(BATCH_NORM);
    let (p, c, r, bn) = (inst(&m, "p"), inst(&m, "c"), inst(&m, "r"), inst(&m, "bn"));
    let (off, mean, var) = (inst(&m, "off"), inst(&m, "mean"), inst(&m, "var"));
    let arena = Bump::new();
    let session = PassSession::new(&arena);
    assert!(allocate(&mut m, &session));
    m.verify().unwrap();

    let annotations = session.annotations();
    let map = &annotations.tensor_allocation_map;
    let target = &map[&TensorSource::new(p, 0)];
    assert_eq!(target.target, bn);
    assert_eq!(target.input_index, 1);
    assert_eq!(target.layout_producer, Some(c));
    assert_eq!(target.layout_output_index, 0);
    assert!(target.layout_path.is_empty());
    assert_eq!(target.source_path, vec![r]);
    assert!(m.inst(p).control_predecessors().contains(&c));

    let offset = &map[&TensorSource::new(off, 0)];
    assert_eq!((offset.target, offset.input_index), (bn, 2));
    assert!(m.inst(off).control_predecessors().contains(&c));

    // Mean and variance are not layout sensitive.
    assert!(!map.contains_key(&TensorSource::new(mean, 0)));
    assert!(!map.contains_key(&TensorSource::new(var, 0)));
    drop(annotations);

    assert!(!ForwardAllocation::new().run(&mut m, &session).unwrap());
}

#[test]
fn test_default_pipeline_prints_allocation_map() {
    common::init_logging();
    let mut m = parse(BATCH_NORM);
    let arena = Bump::new();
    let session = PassSession::new(&arena);
    default_pipeline(&MidendConfig::default())
        .unwrap()
        .run(&mut m, &session)
        .unwrap();

    check_output_contains(
        &print_allocation_map(&m, &session.annotations().tensor_allocation_map),
        &[
            "%x{0} -> %c operand 0",
            "%w{0} -> %c operand 1",
            "%p{0} -> %bn operand 1, layout %c{0}, source-path [%r]",
            "%off{0} -> %bn operand 2, layout %c{0}",
        ],
    );
    check_output_contains(&print_module(&m), &["%p = f32[1,2] parameter(2), control-predecessors={%c}"]);
    assert_eq!(session.stats().targets_found, 2);
}

#[test]
fn test_at_most_one_target_per_source() {
    common::init_logging();
    let mut m = parse(
        r#"
entry computation %main {
  %x = f32[4] parameter(0)
  %w = f32[4] parameter(1)
  %y = f32[4] parameter(2)
  %v = f32[4] parameter(3)
  %p = f32[4] parameter(4)
  %c1 = f32[4] dot(%x, %w)
  %c2 = f32[4] dot(%y, %v)
  %a1 = f32[4] add(%p, %c1)
  %a2 = f32[4] multiply(%p, %c2)
  ROOT %t = (f32[4], f32[4]) tuple(%a1, %a2)
}
"#,
    );
    let (p, c1, a1, a2) = (inst(&m, "p"), inst(&m, "c1"), inst(&m, "a1"), inst(&m, "a2"));
    let arena = Bump::new();
    let session = PassSession::new(&arena);
    assert!(allocate(&mut m, &session));
    m.verify().unwrap();

    let annotations = session.annotations();
    let target = &annotations.tensor_allocation_map[&TensorSource::new(p, 0)];
    assert_eq!(target.target, a1);
    assert_eq!(target.layout_producer, Some(c1));
    // The chosen target is ordered before the competing one.
    assert!(m.inst(a1).control_successors().contains(&a2));
    assert!(m.inst(c1).control_successors().contains(&p));
    assert_eq!(session.stats().targets_found, 1);
}

#[test]
fn test_source_feeding_its_own_layout_producer_is_skipped() {
    common::init_logging();
    let mut m = parse(
        r#"
entry computation %main {
  %w = f32[4] parameter(0)
  %p = f32[4] parameter(1)
  %e = f32[4] exponential(%p)
  %c = f32[4] dot(%e, %w)
  ROOT %a = f32[4] add(%p, %c)
}
"#,
    );
    let (p, c) = (inst(&m, "p"), inst(&m, "c"));
    let arena = Bump::new();
    let session = PassSession::new(&arena);
    assert!(!allocate(&mut m, &session));
    m.verify().unwrap();

    assert!(!session
        .annotations()
        .tensor_allocation_map
        .contains_key(&TensorSource::new(p, 0)));
    assert!(m.inst(c).control_successors().is_empty());
    assert!(m.inst(p).control_predecessors().is_empty());
}

#[test]
fn test_tuple_parameter_leaves_are_separate_sources() {
    common::init_logging();
    let mut m = parse(
        r#"
entry computation %main {
  %x = f32[4] parameter(0)
  %w = f32[4] parameter(1)
  %p = (f32[4], f32[4]) parameter(2)
  %c = f32[4] dot(%x, %w)
  %g = f32[4] get-tuple-element(%p), index=1
  ROOT %a = f32[4] add(%g, %c)
}
"#,
    );
    let (p, g, a, c) = (inst(&m, "p"), inst(&m, "g"), inst(&m, "a"), inst(&m, "c"));
    let arena = Bump::new();
    let session = PassSession::new(&arena);
    assert!(allocate(&mut m, &session));

    let annotations = session.annotations();
    let map = &annotations.tensor_allocation_map;
    let target = &map[&TensorSource::new(p, 1)];
    assert_eq!((target.target, target.input_index), (a, 0));
    assert_eq!(target.layout_producer, Some(c));
    assert_eq!(target.source_path, vec![g]);
    assert!(!map.contains_key(&TensorSource::new(p, 0)));
    assert!(m.inst(g).control_predecessors().contains(&c));
}

const CUSTOM_NORM: &str = r#"
entry computation %main {
  %x = f32[4] parameter(0)
  %w = f32[4] parameter(1)
  %p = f32[4] parameter(2)
  %c = f32[4] dot(%x, %w)
  ROOT %cc = f32[4] custom-call(%p, %c), target="my_norm", attrs={layout_sensitive=true, layout_dependencies={0:1}}
}
"#;

#[test]
fn test_custom_call_layout_dependencies() {
    common::init_logging();
    let mut m = parse(CUSTOM_NORM);
    let (p, c, cc) = (inst(&m, "p"), inst(&m, "c"), inst(&m, "cc"));
    let arena = Bump::new();
    let session = PassSession::new(&arena);
    assert!(allocate(&mut m, &session));

    let annotations = session.annotations();
    let target = &annotations.tensor_allocation_map[&TensorSource::new(p, 0)];
    assert_eq!((target.target, target.input_index), (cc, 0));
    assert_eq!(target.layout_producer, Some(c));
}

#[test]
fn test_missing_layout_dependencies_is_fatal() {
    common::init_logging();
    let mut m = parse(&CUSTOM_NORM.replace(", layout_dependencies={0:1}", ""));
    let arena = Bump::new();
    let session = PassSession::new(&arena);
    let err = default_pipeline(&MidendConfig::default())
        .unwrap()
        .run(&mut m, &session)
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, PassError::MissingLayoutDependencies { .. }));
    assert!(err.to_string().contains("%cc"));

    let stats = session.stats();
    assert!(stats.pass_runs.contains_key("allocation-finder"));
    assert!(!stats.pass_runs.contains_key("forward-allocation"));
    assert!(!stats.pass_runs.contains_key("pipeline-fixer"));
}
