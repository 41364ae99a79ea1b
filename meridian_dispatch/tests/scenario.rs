//! End-to-end dispatch scenarios across several worlds.

use std::sync::Arc;

use meridian_dispatch::{
    DispatchError, Engine, EngineConfig, Method, MethodDefinition, ScriptedBackend, ScriptedBody, SignatureTrace, TraceKind,
    WORLD_INFINITY,
};
use meridian_types::{FunctionRef, Ty, TypeLattice, Value};
use pretty_assertions::assert_eq;

fn setup() -> (Engine, Arc<TypeLattice>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let lattice = Arc::new(TypeLattice::with_builtins());
    let engine = Engine::with_config(lattice.clone(), Arc::new(ScriptedBackend::new()), EngineConfig::testing())
        .expect("valid config");
    (engine, lattice)
}

fn define(engine: &Engine, f: &FunctionRef, params: &[&str], result: Value) -> Arc<Method> {
    let params: Vec<Ty> = params
        .iter()
        .map(|p| if *p == "Any" { Ty::Any } else { Ty::named(p) })
        .collect();
    engine
        .add_method(MethodDefinition::new(f, params, ScriptedBody::returning(result).into()))
        .expect("add method")
}

#[test]
fn test_more_general_method_leaves_specific_one_alone() {
    let (engine, lattice) = setup();
    let f = lattice.declare_function("f");
    let fv = Value::Function(f.clone());

    let int_method = define(&engine, &f, &["Int64"], Value::str("int"));
    assert_eq!(engine.call(&fv, &[Value::Int(1)]).unwrap(), Value::str("int"));
    let mi = engine.resolve(&fv, &[Value::Int(1)], engine.world()).unwrap();
    let ci = mi.compiled_at(engine.world()).expect("compiled on first call");

    define(&engine, &f, &["Number"], Value::str("number"));

    let after = engine.resolve(&fv, &[Value::Int(1)], engine.world()).unwrap();
    assert!(Arc::ptr_eq(after.method(), &int_method));
    assert!(Arc::ptr_eq(&after, &mi));
    assert_eq!(ci.max_world(), WORLD_INFINITY);
    assert_eq!(engine.call(&fv, &[Value::Int(1)]).unwrap(), Value::str("int"));
    assert_eq!(engine.call(&fv, &[Value::Float(2.0)]).unwrap(), Value::str("number"));
    assert_eq!(engine.stats().invalidations, 0);
}

#[test]
fn test_results_are_stable_within_a_world() {
    let (engine, lattice) = setup();
    let f = lattice.declare_function("f");
    let fv = Value::Function(f.clone());
    define(&engine, &f, &["Any"], Value::Int(0));
    define(&engine, &f, &["Integer"], Value::Int(1));
    define(&engine, &f, &["String"], Value::Int(2));
    let world = engine.world();

    let args = [Value::Int(5), Value::Bool(true), Value::str("s"), Value::Float(1.5), Value::Nothing];
    let first: Vec<_> = args
        .iter()
        .map(|a| engine.resolve(&fv, std::slice::from_ref(a), world).unwrap())
        .collect();
    for _ in 0..3 {
        for (a, mi) in args.iter().zip(&first) {
            let again = engine.resolve(&fv, std::slice::from_ref(a), world).unwrap();
            assert!(Arc::ptr_eq(mi, &again));
        }
    }
    let results: Vec<Value> = args
        .iter()
        .map(|a| engine.dispatch(&fv, std::slice::from_ref(a), world).unwrap())
        .collect();
    assert_eq!(
        results,
        vec![Value::Int(1), Value::Int(1), Value::Int(2), Value::Int(0), Value::Int(0)]
    );
}

#[test]
fn test_specialization_is_idempotent() {
    let (engine, lattice) = setup();
    let f = lattice.declare_function("f");
    let fv = Value::Function(f.clone());
    define(&engine, &f, &["Int64"], Value::Int(1));
    let world = engine.world();
    let sig = f.signature([Ty::named("Int64")]);

    let a = engine.specialization_for(&sig, world).unwrap();
    let b = engine.specialization_for(&sig, world).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    let c = engine.resolve(&fv, &[Value::Int(9)], world).unwrap();
    assert!(Arc::ptr_eq(&a, &c));
    assert_eq!(a.method().specializations().len(), 1);
}

#[test]
fn test_removed_method_stays_visible_in_old_worlds() {
    let (engine, lattice) = setup();
    let f = lattice.declare_function("f");
    let fv = Value::Function(f.clone());
    define(&engine, &f, &["Number"], Value::str("number"));
    let int_method = define(&engine, &f, &["Int64"], Value::str("int"));
    let before = engine.world();
    assert_eq!(engine.call(&fv, &[Value::Int(1)]).unwrap(), Value::str("int"));

    engine.remove_method(&int_method).unwrap();
    assert_eq!(engine.call(&fv, &[Value::Int(1)]).unwrap(), Value::str("number"));
    assert_eq!(engine.dispatch(&fv, &[Value::Int(1)], before).unwrap(), Value::str("int"));
    assert_eq!(engine.method_validity(&int_method).unwrap().max, before);
    assert!(matches!(
        engine.remove_method(&int_method),
        Err(DispatchError::AlreadyDisabled(_))
    ));
}

#[test]
fn test_missing_method_reports_argument_types() {
    let (engine, lattice) = setup();
    let f = lattice.declare_function("area");
    define(&engine, &f, &["Int64"], Value::Int(1));
    let err = engine
        .call(&Value::Function(f), &[Value::str("square")])
        .unwrap_err();
    match err {
        DispatchError::NoApplicableMethod { function, arg_types, .. } => {
            assert_eq!(function, "area");
            assert_eq!(arg_types, vec![Ty::named("String")]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_new_worlds_can_be_disabled() {
    let (engine, lattice) = setup();
    let f = lattice.declare_function("f");
    let m = define(&engine, &f, &["Any"], Value::Int(1));
    engine.disable_new_worlds();
    let world = engine.world();
    assert!(matches!(
        engine.add_method(MethodDefinition::new(&f, [Ty::named("Int64")], ScriptedBody::returning(Value::Int(2)).into())),
        Err(DispatchError::NewWorldsDisabled)
    ));
    assert!(matches!(engine.remove_method(&m), Err(DispatchError::NewWorldsDisabled)));
    assert_eq!(engine.world(), world);
    assert_eq!(engine.call(&Value::Function(f), &[Value::Int(0)]).unwrap(), Value::Int(1));
}

#[test]
fn test_compile_hint_traces_precompiled_signature() {
    let (engine, lattice) = setup();
    let sink = Arc::new(SignatureTrace::new());
    engine.add_trace_sink(sink.clone());
    let f = lattice.declare_function("f");
    define(&engine, &f, &["Number"], Value::Int(1));

    let sig = f.signature([Ty::named("Float64")]);
    assert!(engine.compile_hint(&sig).unwrap());
    assert_eq!(sink.signatures(TraceKind::Precompiled), vec![sig.clone()]);

    let mi = engine.specialization_for(&sig, engine.world()).unwrap();
    assert!(mi.is_precompiled());
    assert!(!engine.compile_hint(&lattice.declare_function("g").signature([Ty::Any])).unwrap());
}

#[test]
fn test_method_tracer_sees_every_activation() {
    let (engine, lattice) = setup();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let log = seen.clone();
    engine.set_method_tracer(Some(Arc::new(move |m: &Arc<Method>| log.lock().push(m.sig().clone()))));
    let f = lattice.declare_function("f");
    define(&engine, &f, &["Int64"], Value::Int(1));
    define(&engine, &f, &["String"], Value::Int(2));
    assert_eq!(
        *seen.lock(),
        vec![f.signature([Ty::named("Int64")]), f.signature([Ty::named("String")])]
    );
}
