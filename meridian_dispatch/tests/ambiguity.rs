//! Ambiguity detection and resolution.

use std::sync::Arc;

use meridian_dispatch::{DispatchError, Engine, EngineConfig, LookupResult, MethodDefinition, ScriptedBackend, ScriptedBody};
use meridian_types::{FunctionRef, Ty, TypeLattice, Value};

fn setup() -> (Engine, Arc<TypeLattice>, FunctionRef) {
    let lattice = Arc::new(TypeLattice::with_builtins());
    let engine = Engine::with_config(lattice.clone(), Arc::new(ScriptedBackend::new()), EngineConfig::testing())
        .expect("valid config");
    let f = lattice.declare_function("f");
    (engine, lattice, f)
}

fn define(engine: &Engine, f: &FunctionRef, params: [Ty; 2], tag: &str) {
    engine
        .add_method(MethodDefinition::new(f, params, ScriptedBody::returning(Value::str(tag)).into()))
        .expect("add method");
}

fn int() -> Ty {
    Ty::named("Int64")
}

#[test]
fn test_crossed_methods_are_ambiguous_on_their_intersection() {
    let (engine, _, f) = setup();
    define(&engine, &f, [int(), Ty::Any], "left");
    define(&engine, &f, [Ty::Any, int()], "right");
    let fv = Value::Function(f.clone());

    let err = engine.call(&fv, &[Value::Int(1), Value::Int(2)]).unwrap_err();
    match err {
        DispatchError::AmbiguousMethod {
            function,
            arg_types,
            candidates,
            ..
        } => {
            assert_eq!(function, "f");
            assert_eq!(arg_types, vec![int(), int()]);
            assert_eq!(candidates.len(), 2);
            assert!(candidates.contains(&f.signature([int(), Ty::Any])));
            assert!(candidates.contains(&f.signature([Ty::Any, int()])));
        }
        other => panic!("expected ambiguity, got {other}"),
    }

    // Outside the intersection each method applies alone.
    assert_eq!(engine.call(&fv, &[Value::Int(1), Value::str("x")]).unwrap(), Value::str("left"));
    assert_eq!(engine.call(&fv, &[Value::str("x"), Value::Int(1)]).unwrap(), Value::str("right"));
}

#[test]
fn test_lookup_reports_ambiguous_result() {
    let (engine, _, f) = setup();
    define(&engine, &f, [int(), Ty::Any], "left");
    define(&engine, &f, [Ty::Any, int()], "right");
    let world = engine.world();

    let result = engine.lookup_matches(&f.signature([int(), int()]), world, None);
    assert!(matches!(result, LookupResult::Ambiguous { ref matches, .. } if matches.len() == 2));

    // A signature whose calls all avoid the intersection is not ambiguous.
    let result = engine.lookup_matches(&f.signature([int(), Ty::named("String")]), world, None);
    assert!(matches!(result, LookupResult::Matches { ref matches, .. } if matches.len() == 1));
}

#[test]
fn test_tie_breaking_method_resolves_ambiguity() {
    let (engine, _, f) = setup();
    define(&engine, &f, [int(), Ty::Any], "left");
    define(&engine, &f, [Ty::Any, int()], "right");
    let fv = Value::Function(f.clone());
    let ambiguous_world = engine.world();

    define(&engine, &f, [int(), int()], "both");
    assert_eq!(engine.call(&fv, &[Value::Int(1), Value::Int(2)]).unwrap(), Value::str("both"));
    assert!(matches!(
        engine.dispatch(&fv, &[Value::Int(1), Value::Int(2)], ambiguous_world),
        Err(DispatchError::AmbiguousMethod { .. })
    ));
    assert!(engine.specialization_for(&f.signature([int(), int()]), engine.world()).is_some());
    assert!(engine.specialization_for(&f.signature([int(), int()]), ambiguous_world).is_none());
}

#[test]
fn test_more_specific_method_is_never_ambiguous() {
    let (engine, _, f) = setup();
    define(&engine, &f, [Ty::named("Number"), Ty::named("Number")], "numbers");
    define(&engine, &f, [int(), Ty::named("Number")], "int first");
    define(&engine, &f, [int(), int()], "ints");
    let fv = Value::Function(f);

    assert_eq!(engine.call(&fv, &[Value::Int(1), Value::Int(2)]).unwrap(), Value::str("ints"));
    assert_eq!(engine.call(&fv, &[Value::Int(1), Value::Float(2.0)]).unwrap(), Value::str("int first"));
    assert_eq!(engine.call(&fv, &[Value::Float(1.0), Value::Int(2)]).unwrap(), Value::str("numbers"));
}

#[test]
fn test_invoke_of_ambiguous_signature_fails() {
    let (engine, _, f) = setup();
    define(&engine, &f, [int(), Ty::Any], "left");
    define(&engine, &f, [Ty::Any, int()], "right");
    let fv = Value::Function(f);
    let world = engine.world();

    assert!(engine.invoke(&fv, &Ty::tuple([int(), int()]), &[Value::Int(1), Value::Int(2)], world).is_err());
    assert_eq!(
        engine
            .invoke(&fv, &Ty::tuple([int(), Ty::Any]), &[Value::Int(1), Value::Int(2)], world)
            .unwrap(),
        Value::str("left")
    );
}
