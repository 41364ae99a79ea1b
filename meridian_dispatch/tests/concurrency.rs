//! Readers dispatching while a writer changes the method table.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use meridian_dispatch::{Engine, EngineConfig, MethodDefinition, ScriptedBackend, ScriptedBody};
use meridian_types::{Ty, TypeLattice, Value};

const READERS: usize = 4;
const EXTRA_TYPES: usize = 24;

fn setup() -> (Engine, Arc<TypeLattice>) {
    let lattice = Arc::new(TypeLattice::with_builtins());
    let config = EngineConfig {
        call_cache_size: 256,
        ..Default::default()
    };
    let engine = Engine::with_config(lattice.clone(), Arc::new(ScriptedBackend::new()), config).expect("valid config");
    (engine, lattice)
}

#[test]
fn test_readers_never_see_a_newer_answer_regress() {
    let (engine, lattice) = setup();
    let f = lattice.declare_function("f");
    let types: Vec<Ty> = (0..EXTRA_TYPES)
        .map(|i| lattice.declare_concrete(&format!("Shape{i}"), None))
        .collect();
    engine
        .add_method(MethodDefinition::new(&f, [Ty::named("Number")], ScriptedBody::returning(Value::Int(1)).into()))
        .unwrap();
    let fv = Value::Function(f.clone());
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        for reader in 0..READERS {
            let engine = &engine;
            let fv = &fv;
            let done = &done;
            s.spawn(move || {
                let callsite = reader as u32 * 0x0101_0101;
                let mut seen_new = false;
                let mut calls = 0u64;
                loop {
                    let finished = done.load(Ordering::Acquire);
                    let world = engine.world();
                    let result = engine.dispatch_at(callsite, fv, &[Value::Int(7)], world).unwrap();
                    match result {
                        Value::Int(1) => assert!(!seen_new, "reader {reader} went back to the old method"),
                        Value::Int(2) => seen_new = true,
                        other => panic!("unexpected result {other:?}"),
                    }
                    let float = engine.dispatch(fv, &[Value::Float(0.5)], world).unwrap();
                    assert_eq!(float, Value::Int(1));
                    calls += 1;
                    if finished && calls >= 100 {
                        break;
                    }
                }
                assert!(seen_new, "reader {reader} never saw the new method");
            });
        }

        s.spawn(|| {
            for (i, ty) in types.iter().enumerate() {
                if i == EXTRA_TYPES / 2 {
                    engine
                        .add_method(MethodDefinition::new(
                            &f,
                            [Ty::named("Int64")],
                            ScriptedBody::returning(Value::Int(2)).into(),
                        ))
                        .unwrap();
                }
                engine
                    .add_method(MethodDefinition::new(
                        &f,
                        [ty.clone()],
                        ScriptedBody::returning(Value::Int(100 + i as i64)).into(),
                    ))
                    .unwrap();
                thread::yield_now();
            }
            done.store(true, Ordering::Release);
        });
    });

    assert_eq!(engine.call(&fv, &[Value::Int(7)]).unwrap(), Value::Int(2));
    assert_eq!(engine.method_count(), EXTRA_TYPES + 2);
}

#[test]
fn test_old_worlds_stay_consistent_under_concurrent_writes() {
    let (engine, lattice) = setup();
    let f = lattice.declare_function("f");
    engine
        .add_method(MethodDefinition::new(&f, [Ty::Any], ScriptedBody::returning(Value::Int(0)).into()))
        .unwrap();
    let pinned = engine.world();
    let fv = Value::Function(f.clone());
    let names = ["Int64", "Float64", "String", "Bool", "Int32"];

    thread::scope(|s| {
        for _ in 0..READERS {
            s.spawn(|| {
                for _ in 0..500 {
                    for arg in [Value::Int(1), Value::Float(1.0), Value::str("s"), Value::Bool(false)] {
                        assert_eq!(engine.dispatch(&fv, &[arg], pinned).unwrap(), Value::Int(0));
                    }
                }
            });
        }
        s.spawn(|| {
            for (i, name) in names.iter().enumerate() {
                engine
                    .add_method(MethodDefinition::new(
                        &f,
                        [Ty::named(name)],
                        ScriptedBody::returning(Value::Int(i as i64 + 1)).into(),
                    ))
                    .unwrap();
            }
        });
    });

    assert_eq!(engine.call(&fv, &[Value::str("s")]).unwrap(), Value::Int(3));
    assert_eq!(engine.dispatch(&fv, &[Value::str("s")], pinned).unwrap(), Value::Int(0));
}

#[test]
fn test_concurrent_first_calls_compile_once() {
    let lattice = Arc::new(TypeLattice::with_builtins());
    let backend = Arc::new(ScriptedBackend::new());
    let engine = Engine::new(lattice.clone(), backend.clone());
    let f = lattice.declare_function("f");
    engine
        .add_method(MethodDefinition::new(&f, [Ty::named("Int64")], ScriptedBody::returning(Value::Int(3)).into()))
        .unwrap();
    let fv = Value::Function(f);

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                assert_eq!(engine.call(&fv, &[Value::Int(1)]).unwrap(), Value::Int(3));
            });
        }
    });
    assert_eq!(backend.compilations(), 1);
}
