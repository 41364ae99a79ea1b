//! Invalidation of compiled callers when method definitions change.

use std::sync::Arc;

use meridian_dispatch::{
    Engine, EngineConfig, InvalidationRecord, InvalidationTag, Method, MethodDefinition, ScriptedBackend,
    ScriptedBody, WORLD_INFINITY,
};
use meridian_types::{FunctionRef, Ty, TypeLattice, Value};
use pretty_assertions::assert_eq;
use tracing_subscriber::EnvFilter;

struct Fixture {
    engine: Engine,
    lattice: Arc<TypeLattice>,
    backend: Arc<ScriptedBackend>,
}

fn setup() -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let lattice = Arc::new(TypeLattice::with_builtins());
    let backend = Arc::new(ScriptedBackend::new());
    let engine = Engine::with_config(lattice.clone(), backend.clone(), EngineConfig::testing()).expect("valid config");
    Fixture {
        engine,
        lattice,
        backend,
    }
}

fn int() -> Ty {
    Ty::named("Int64")
}

fn add(engine: &Engine, f: &FunctionRef, params: &[Ty], body: ScriptedBody) -> Arc<Method> {
    engine
        .add_method(MethodDefinition::new(f, params.iter().cloned(), body.into()))
        .expect("add method")
}

#[test]
fn test_caller_is_invalidated_when_callee_dispatch_changes() {
    let Fixture { engine, lattice, .. } = setup();
    let f = lattice.declare_function("f");
    let g = lattice.declare_function("g");
    add(&engine, &f, &[Ty::Any], ScriptedBody::returning(Value::Int(0)));
    add(
        &engine,
        &g,
        &[int()],
        ScriptedBody::returning(Value::Int(10)).calls(f.signature([int()])),
    );
    let gv = Value::Function(g.clone());
    engine.call(&gv, &[Value::Int(1)]).unwrap();

    let g_mi = engine.resolve(&gv, &[Value::Int(1)], engine.world()).unwrap();
    let old = g_mi.compiled_at(engine.world()).unwrap();
    assert_eq!(old.max_world(), WORLD_INFINITY);
    let before = engine.world();

    add(&engine, &f, &[int()], ScriptedBody::returning(Value::Int(1)));
    assert_eq!(old.max_world(), before);
    assert!(old.is_valid_at(before));
    assert!(!old.is_valid_at(engine.world()));
    assert!(engine.stats().invalidations >= 1);

    // The next call recompiles from the new world on.
    engine.call(&gv, &[Value::Int(1)]).unwrap();
    let new = g_mi.compiled_at(engine.world()).unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(new.min_world(), engine.world());
    assert_eq!(new.max_world(), WORLD_INFINITY);
}

#[test]
fn test_unrelated_callers_survive() {
    let Fixture { engine, lattice, .. } = setup();
    let f = lattice.declare_function("f");
    let g = lattice.declare_function("g");
    let h = lattice.declare_function("h");
    add(&engine, &f, &[Ty::Any], ScriptedBody::returning(Value::Int(0)));
    add(
        &engine,
        &g,
        &[int()],
        ScriptedBody::returning(Value::Nothing).calls(f.signature([int()])),
    );
    add(
        &engine,
        &h,
        &[Ty::named("String")],
        ScriptedBody::returning(Value::Nothing).calls(f.signature([Ty::named("String")])),
    );
    let gv = Value::Function(g);
    let hv = Value::Function(h);
    engine.call(&gv, &[Value::Int(1)]).unwrap();
    engine.call(&hv, &[Value::str("s")]).unwrap();
    let world = engine.world();
    let h_ci = engine
        .resolve(&hv, &[Value::str("s")], world)
        .unwrap()
        .compiled_at(world)
        .unwrap();
    let g_ci = engine
        .resolve(&gv, &[Value::Int(1)], world)
        .unwrap()
        .compiled_at(world)
        .unwrap();

    add(&engine, &f, &[int()], ScriptedBody::returning(Value::Int(1)));
    assert_eq!(g_ci.max_world(), world);
    assert_eq!(h_ci.max_world(), WORLD_INFINITY);
}

#[test]
fn test_invalidation_log_follows_the_walk() {
    let Fixture { engine, lattice, .. } = setup();
    let f = lattice.declare_function("f");
    let g = lattice.declare_function("g");
    add(&engine, &f, &[Ty::Any], ScriptedBody::returning(Value::Int(0)));
    add(
        &engine,
        &g,
        &[int()],
        ScriptedBody::returning(Value::Nothing).calls(f.signature([int()])),
    );
    let gv = Value::Function(g.clone());
    engine.call(&gv, &[Value::Int(1)]).unwrap();
    engine.invalidation_log().take();

    add(&engine, &f, &[int()], ScriptedBody::returning(Value::Int(1)));
    let log = engine.invalidation_log().take();
    let summary: Vec<(Ty, Option<InvalidationTag>, Option<u32>)> =
        log.iter().map(|r| (r.signature(), r.tag(), r.depth())).collect();
    assert_eq!(
        summary,
        vec![
            (g.signature([int()]), None, Some(1)),
            (f.signature([int()]), Some(InvalidationTag::MethodInsert), None),
            (f.signature([int()]), Some(InvalidationTag::DispatchCache), None),
            (f.signature([int()]), Some(InvalidationTag::MethodInsert), None),
        ]
    );
    assert!(matches!(log[1], InvalidationRecord::Instance { .. }));
    assert!(matches!(log[3], InvalidationRecord::Method { .. }));
}

#[test]
fn test_transitive_callers_are_invalidated_with_depth() {
    let Fixture { engine, lattice, .. } = setup();
    let f = lattice.declare_function("f");
    let g = lattice.declare_function("g");
    let h = lattice.declare_function("h");
    add(&engine, &f, &[Ty::Any], ScriptedBody::returning(Value::Int(0)));
    add(
        &engine,
        &g,
        &[int()],
        ScriptedBody::returning(Value::Int(0)).calls(f.signature([int()])),
    );
    add(
        &engine,
        &h,
        &[int()],
        ScriptedBody::returning(Value::Int(0))
            .calls(g.signature([int()]))
            .infer_callees(),
    );
    let hv = Value::Function(h.clone());
    engine.call(&hv, &[Value::Int(1)]).unwrap();
    let world = engine.world();
    let h_ci = engine
        .resolve(&hv, &[Value::Int(1)], world)
        .unwrap()
        .compiled_at(world)
        .unwrap();
    engine.invalidation_log().take();

    add(&engine, &f, &[int()], ScriptedBody::returning(Value::Int(1)));
    assert_eq!(h_ci.max_world(), world);
    let depths: Vec<(Ty, Option<u32>)> = engine
        .invalidation_log()
        .take()
        .iter()
        .filter(|r| r.depth().is_some())
        .map(|r| (r.signature(), r.depth()))
        .collect();
    assert_eq!(
        depths,
        vec![(g.signature([int()]), Some(1)), (h.signature([int()]), Some(2))]
    );
}

#[test]
fn test_unmatched_call_is_invalidated_when_method_appears() {
    let Fixture { engine, lattice, .. } = setup();
    let f = lattice.declare_function("f");
    let g = lattice.declare_function("g");
    add(
        &engine,
        &g,
        &[int()],
        ScriptedBody::returning(Value::Nothing).calls(f.signature([int()])),
    );
    let gv = Value::Function(g);
    engine.call(&gv, &[Value::Int(1)]).unwrap();
    let world = engine.world();
    let g_ci = engine
        .resolve(&gv, &[Value::Int(1)], world)
        .unwrap()
        .compiled_at(world)
        .unwrap();
    assert_eq!(g_ci.max_world(), WORLD_INFINITY);
    engine.invalidation_log().take();

    add(&engine, &f, &[Ty::named("String")], ScriptedBody::returning(Value::Int(0)));
    assert_eq!(g_ci.max_world(), WORLD_INFINITY, "a method for other types changes nothing");

    add(&engine, &f, &[Ty::named("Number")], ScriptedBody::returning(Value::Int(1)));
    assert_eq!(g_ci.max_world(), world + 1);
    let log = engine.invalidation_log().take();
    assert!(log.iter().any(|r| r.tag() == Some(InvalidationTag::MissingBackedge)));
}

#[test]
fn test_overwrite_replaces_definition_and_invalidates_callers() {
    let Fixture { engine, lattice, .. } = setup();
    let f = lattice.declare_function("f");
    let g = lattice.declare_function("g");
    let first = add(&engine, &f, &[int()], ScriptedBody::returning(Value::Int(1)));
    add(
        &engine,
        &g,
        &[int()],
        ScriptedBody::returning(Value::Nothing).calls(f.signature([int()])),
    );
    let fv = Value::Function(f.clone());
    let gv = Value::Function(g);
    assert_eq!(engine.call(&fv, &[Value::Int(0)]).unwrap(), Value::Int(1));
    engine.call(&gv, &[Value::Int(0)]).unwrap();
    let before = engine.world();
    let g_ci = engine
        .resolve(&gv, &[Value::Int(0)], before)
        .unwrap()
        .compiled_at(before)
        .unwrap();
    engine.invalidation_log().take();

    let second = add(&engine, &f, &[int()], ScriptedBody::returning(Value::Int(2)));
    assert_eq!(engine.call(&fv, &[Value::Int(0)]).unwrap(), Value::Int(2));
    assert_eq!(engine.dispatch(&fv, &[Value::Int(0)], before).unwrap(), Value::Int(1));
    assert_eq!(engine.method_validity(&first).unwrap().max, before);
    assert_eq!(engine.method_validity(&second).unwrap().min, before + 1);
    assert_eq!(g_ci.max_world(), before);
    let log = engine.invalidation_log().take();
    assert!(log.iter().any(|r| r.tag() == Some(InvalidationTag::MethodDisable)));
}

#[test]
fn test_explicit_invalidation_clips_instance_code() {
    let Fixture { engine, lattice, backend } = setup();
    let f = lattice.declare_function("f");
    add(&engine, &f, &[int()], ScriptedBody::returning(Value::Int(1)));
    let fv = Value::Function(f);
    engine.call(&fv, &[Value::Int(0)]).unwrap();
    let world = engine.world();
    let mi = engine.resolve(&fv, &[Value::Int(0)], world).unwrap();
    let ci = mi.compiled_at(world).unwrap();
    let compiled = backend.compilations();

    engine.invalidate(&mi, world - 1);
    assert_eq!(ci.max_world(), world - 1);
    assert!(mi.compiled_at(world).is_none());
    assert_eq!(engine.call(&fv, &[Value::Int(0)]).unwrap(), Value::Int(1));
    assert_eq!(backend.compilations(), compiled + 1);
}
