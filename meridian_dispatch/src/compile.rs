//! Compilation Pipeline
//!
//! Turns method instances into callable code instances:
//!
//! 1. reuse code already compiled for the world
//! 2. compile a wider compileable instance instead and share its code
//! 3. when compilation is off, use the unspecialized or interpreted entry
//! 4. infer and compile through the backend
//! 5. if inference declined, fall back to the unspecialized instance
//!
//! Failures are returned to the caller and never cached; the next call
//! tries again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use meridian_types::{SparamEnv, Ty, Value};
use tracing::{debug, warn};

use crate::backend::{InferenceContext, InferenceGuard};
use crate::cache::CacheTarget;
use crate::code::{CacheOwner, CodeInstance, CompileClaim, Edge, EntryPoint};
use crate::compilation_sig::{isa_compileable_sig, normalize_to_compilable_sig};
use crate::config::CompileMode;
use crate::engine::Engine;
use crate::error::{CompileError, DispatchResult};
use crate::instance::MethodInstance;
use crate::matching::{LookupResult, MethodMatch};
use crate::method::Method;
use crate::trace::TraceEvent;
use crate::world::{FIRST_WORLD, WORLD_INFINITY, World, WorldRange};

impl Engine {
    // =========================================================================
    // Instances
    // =========================================================================

    /// The catch-all instance of `method`, specialized on its declared
    /// signature. Shared by every fallback entry of the method.
    pub fn get_unspecialized(&self, method: &Arc<Method>) -> Arc<MethodInstance> {
        if let Some(unspec) = method.unspecialized.load_full() {
            return unspec;
        }
        let _guard = method.writelock.lock();
        if let Some(unspec) = method.unspecialized.load_full() {
            return unspec;
        }
        let unspec = Arc::new(MethodInstance::new(
            method.clone(),
            method.sig().clone(),
            SparamEnv::new(),
        ));
        method.unspecialized.store(Some(unspec.clone()));
        unspec
    }

    /// The instance whose code `mi` should share: itself when its signature
    /// is compileable, else the instance of the compileable signature
    /// covering it.
    pub(crate) fn normalize_to_compilable_mi(&self, mi: &Arc<MethodInstance>) -> Arc<MethodInstance> {
        let oracle = &*self.oracle;
        let def = mi.method();
        let max_varargs = self.max_varargs(def);
        if isa_compileable_sig(oracle, mi.spec_types(), mi.sparam_vals(), def, max_varargs.0, max_varargs.1) {
            return mi.clone();
        }
        match normalize_to_compilable_sig(oracle, mi.spec_types(), mi.sparam_vals(), def, max_varargs) {
            Some((tt, env)) if tt != *mi.spec_types() => def.specialization(oracle, &tt, &env),
            _ => mi.clone(),
        }
    }

    /// The instance for a resolved match. Dispatch tuples are also entered
    /// in the dispatch cache when `mt_cache` is set.
    pub(crate) fn method_match_to_mi(
        &self,
        matc: &MethodMatch,
        world: World,
        valid: WorldRange,
        mt_cache: bool,
    ) -> Option<Arc<MethodInstance>> {
        let oracle = &*self.oracle;
        let ti = &matc.spec_types;
        ti.as_tuple()?;
        if mt_cache && oracle.is_dispatch_tuple(ti) {
            let guard = self.cache.writelock.lock();
            return Some(self.cache_method(
                CacheTarget::Global(guard),
                ti,
                &matc.method,
                world,
                valid,
                &matc.sparams,
            ));
        }
        let def = &matc.method;
        let (tt, env) = normalize_to_compilable_sig(oracle, ti, &matc.sparams, def, self.max_varargs(def))?;
        Some(def.specialization(oracle, &tt, &env))
    }

    /// The native code instance of `mi` with exactly this window and result
    /// type, created and published if missing.
    pub(crate) fn get_method_inferred(
        &self,
        mi: &Arc<MethodInstance>,
        rettype: &Ty,
        min_world: World,
        max_world: World,
        edges: &[Edge],
    ) -> Arc<CodeInstance> {
        let existing = mi.code_instances().find(|ci| {
            *ci.owner() == CacheOwner::Native
                && ci.min_world() == min_world
                && ci.max_world() == max_world
                && *ci.rettype() == *rettype
        });
        if let Some(ci) = existing {
            return ci;
        }
        let ci = Arc::new(CodeInstance::new(
            mi.clone(),
            CacheOwner::Native,
            rettype.clone(),
            min_world,
            max_world,
            edges.to_vec(),
        ));
        mi.cache_insert(ci.clone());
        if !edges.is_empty() {
            self.store_backedges(&ci);
        }
        ci
    }

    // =========================================================================
    // Inference
    // =========================================================================

    /// Inferred native code of `mi` valid in `world`, running inference if
    /// there is none.
    ///
    /// `Ok(None)` when inference declined, is already running for `mi` on
    /// this thread, or is nested too deeply.
    pub fn type_infer(&self, mi: &Arc<MethodInstance>, world: World) -> DispatchResult<Option<Arc<CodeInstance>>> {
        let Some(_guard) = InferenceGuard::enter(mi, self.config.max_inference_depth) else {
            return Ok(None);
        };
        if let Some(ci) = self.inferred_at(mi, world) {
            return Ok(Some(ci));
        }
        let head = mi.cache_head();
        let cx = InferenceContext::new(self, world);
        let Some(inferred) = self.backend.infer(&cx, mi, world)? else {
            return Ok(None);
        };
        let (edges, mut valid) = cx.finish();
        if let Some(window) = self.method_validity(mi.method()) {
            valid.narrow(window);
        }
        if !valid.contains(world) {
            return Ok(None);
        }

        // Valid up to the inference world only, until promoted.
        let ci = Arc::new(CodeInstance::new(
            mi.clone(),
            CacheOwner::Native,
            inferred.rettype,
            valid.min,
            world,
            edges,
        ));
        if let Some(value) = inferred.const_result {
            ci.install_entry(EntryPoint::Const(value));
        }
        if !mi.cache_try_insert(head.as_ref(), ci.clone()) {
            if let Some(raced) = self.inferred_at(mi, world) {
                return Ok(Some(raced));
            }
            mi.cache_insert(ci.clone());
        }
        self.store_backedges(&ci);
        if valid.max > world {
            self.promote_to_current(std::slice::from_ref(&ci), world);
        }
        debug!(
            target: "meridian::compile",
            signature = %mi.spec_types(),
            min_world = ci.min_world(),
            max_world = ci.max_world(),
            edges = ci.edges().len(),
            "inferred"
        );
        Ok(Some(ci))
    }

    fn inferred_at(&self, mi: &MethodInstance, world: World) -> Option<Arc<CodeInstance>> {
        mi.code_instances()
            .find(|ci| *ci.owner() == CacheOwner::Native && ci.is_valid_at(world))
    }

    // =========================================================================
    // Compilation
    // =========================================================================

    /// Compiled native code of `mi` valid in `world`.
    pub fn compile_method(&self, mi: &Arc<MethodInstance>, world: World) -> DispatchResult<Arc<CodeInstance>> {
        self.compile_method_internal(mi, world, true)
    }

    fn compile_method_internal(
        &self,
        mi: &Arc<MethodInstance>,
        world: World,
        normalize: bool,
    ) -> DispatchResult<Arc<CodeInstance>> {
        if let Some(ci) = mi.compiled_at(world) {
            return Ok(ci);
        }

        if normalize {
            let mi2 = self.normalize_to_compilable_mi(mi);
            if !Arc::ptr_eq(&mi2, mi) {
                let ci2 = self.compile_method_internal(&mi2, world, false)?;
                let ci = self.get_method_inferred(mi, &ci2.rettype(), ci2.min_world(), ci2.max_world(), &ci2.edges());
                if let Some(entry) = ci2.wait_entry() {
                    ci.install_entry((*entry).clone());
                }
                return Ok(ci);
            }
        }

        let mode = self.config.compile;
        if mode != CompileMode::On {
            if let Some(ci) = self.reuse_unspecialized(mi) {
                return Ok(ci);
            }
            if let Some(invoker) = self.backend.interpret(mi) {
                return Ok(self.install_fallback(mi, EntryPoint::Interpreted(invoker)));
            }
            if mode == CompileMode::Off {
                warn!(
                    target: "meridian::compile",
                    signature = %mi.spec_types(),
                    "no compiled code available and compilation is off"
                );
            }
        }

        let start = Instant::now();
        let recompile = mi.code_instances().any(|ci| ci.is_compiled());

        if let Some(ci) = self.type_infer(mi, world)? {
            if ci.is_compiled() {
                return Ok(ci);
            }
            if ci.claim_compile() == CompileClaim::Claimed {
                match self.backend.compile(&ci) {
                    Ok(invoker) => {
                        ci.finish_compile(Some(EntryPoint::Compiled(invoker)));
                        self.stats.record_compilation();
                        debug!(
                            target: "meridian::compile",
                            signature = %mi.spec_types(),
                            recompile,
                            "compiled"
                        );
                        if *ci.owner() == CacheOwner::Native {
                            self.record_precompile(mi, start.elapsed(), recompile);
                        }
                    }
                    Err(err) => {
                        ci.finish_compile(None);
                        return Err(err.into());
                    }
                }
            }
            return Ok(ci);
        }

        // Inference declined: run the unspecialized code.
        let unspec = self.get_unspecialized(mi.method());
        let ucache = self.get_method_inferred(&unspec, &Ty::Any, FIRST_WORLD, WORLD_INFINITY, &[]);
        if ucache.claim_compile() == CompileClaim::Claimed {
            let entry = match self.backend.interpret(&unspec) {
                Some(invoker) => Ok(EntryPoint::Interpreted(invoker)),
                None => self.backend.compile(&ucache).map(EntryPoint::Compiled),
            };
            match entry {
                Ok(entry) => ucache.finish_compile(Some(entry)),
                Err(err) => {
                    ucache.finish_compile(None);
                    return Err(err.into());
                }
            }
        }
        if Arc::ptr_eq(&unspec, mi) {
            return Ok(ucache);
        }
        match ucache.wait_entry() {
            Some(entry) => Ok(self.install_fallback(mi, (*entry).clone())),
            None => Err(CompileError::MissingCode {
                signature: mi.spec_types().clone(),
            }
            .into()),
        }
    }

    /// Copy the entry of the method's unspecialized code, if it has any.
    fn reuse_unspecialized(&self, mi: &Arc<MethodInstance>) -> Option<Arc<CodeInstance>> {
        let unspec = mi.method().unspecialized.load_full()?;
        let entry = unspec.cache_head()?.entry()?;
        Some(self.install_fallback(mi, (*entry).clone()))
    }

    /// Publish a code instance of `mi` valid in every world that runs
    /// `entry`. Fallback code depends on nothing.
    fn install_fallback(&self, mi: &Arc<MethodInstance>, entry: EntryPoint) -> Arc<CodeInstance> {
        let ci = Arc::new(CodeInstance::new(
            mi.clone(),
            CacheOwner::Native,
            Ty::Any,
            FIRST_WORLD,
            WORLD_INFINITY,
            Vec::new(),
        ));
        ci.install_entry(entry);
        mi.cache_insert(ci.clone());
        ci
    }

    fn record_precompile(&self, mi: &MethodInstance, elapsed: Duration, recompile: bool) {
        if !self.trace.compile_enabled() || !self.oracle.is_dispatch_tuple(mi.spec_types()) {
            return;
        }
        self.trace.emit(&TraceEvent::Precompiled {
            signature: mi.spec_types().clone(),
            elapsed,
            recompile,
        });
    }

    /// Run `mi` on `args` in `world`, compiling it first if needed.
    pub(crate) fn invoke_instance(&self, mi: &Arc<MethodInstance>, args: &[Value], world: World) -> DispatchResult<Value> {
        if let Some(ci) = mi.compiled_at(world) {
            return ci.invoke(args);
        }
        let ci = self.compile_method(mi, world)?;
        ci.invoke(args)
    }

    // =========================================================================
    // Compile-Time Lookups
    // =========================================================================

    /// The single compileable instance covering `sig` in `world`.
    ///
    /// `None` when no method, several methods, or ambiguous methods apply.
    pub fn specialization_for(&self, sig: &Ty, world: World) -> Option<Arc<MethodInstance>> {
        if sig.has_free_typevars() {
            return None;
        }
        match self.lookup_matches(sig, world, Some(1)) {
            LookupResult::Matches { matches, valid } if matches.len() == 1 => {
                self.method_match_to_mi(&matches[0], world, valid, true)
            }
            _ => None,
        }
    }

    /// The instance to precompile for `sig`: the only applicable method,
    /// or the least specific of the methods for which `sig` is compileable.
    fn compile_hint_specialization(&self, sig: &Ty, world: World) -> Option<Arc<MethodInstance>> {
        if sig.has_free_typevars() {
            return None;
        }
        let oracle = &*self.oracle;
        let (mut matches, valid) = match self.lookup_matches(sig, world, None) {
            LookupResult::Matches { matches, valid } | LookupResult::Ambiguous { matches, valid } => (matches, valid),
            _ => return None,
        };
        if matches.len() > 1 {
            matches.retain(|m| {
                let max_varargs = self.max_varargs(&m.method);
                isa_compileable_sig(oracle, sig, &m.sparams, &m.method, max_varargs.0, max_varargs.1)
            });
            // Prefer the general method asked for over more specific ones.
            let mut kept: Vec<MethodMatch> = Vec::new();
            for (i, m1) in matches.iter().enumerate() {
                let excluded = matches[i + 1..]
                    .iter()
                    .rev()
                    .any(|m2| oracle.morespecific(m1.method.sig(), m2.method.sig()));
                if !excluded {
                    kept.push(m1.clone());
                }
                if kept.len() > 1 {
                    break;
                }
            }
            matches = kept;
        }
        if matches.len() != 1 {
            return None;
        }
        self.method_match_to_mi(&matches[0], world, valid, true)
    }

    /// Compile the code for `sig` ahead of its first call.
    ///
    /// Returns false when no single method could be chosen for `sig`.
    pub fn compile_hint(&self, sig: &Ty) -> DispatchResult<bool> {
        let world = self.world();
        let Some(mi) = self.compile_hint_specialization(sig, world) else {
            return Ok(false);
        };
        mi.mark_precompiled();
        let ci = self.compile_method(&mi, world)?;
        ci.set_precompile();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::method::MethodDefinition;
    use crate::scripted::{ScriptedBackend, ScriptedBody};
    use crate::testing::{engine, engine_with};
    use meridian_types::FunctionRef;

    fn int() -> Ty {
        Ty::named("Int64")
    }

    fn add(engine: &Engine, f: &FunctionRef, params: &[Ty], body: ScriptedBody) -> Arc<Method> {
        engine
            .add_method(MethodDefinition::new(f, params.iter().cloned(), body.into()))
            .unwrap()
    }

    #[test]
    fn test_compile_reuses_code() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        add(&engine, &f, &[int()], ScriptedBody::returning(Value::Int(1)));
        let world = engine.world();
        let mi = engine.specialization_for(&f.signature([int()]), world).unwrap();
        let a = engine.compile_method(&mi, world).unwrap();
        let b = engine.compile_method(&mi, world).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.max_world(), WORLD_INFINITY);
        assert_eq!(a.invoke(&[]).unwrap(), Value::Int(1));
        assert_eq!(engine.stats().compilations, 1);
    }

    #[test]
    fn test_compile_failure_is_retried() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        add(&engine, &f, &[int()], ScriptedBody::returning(Value::Int(2)).failing_compiles(1));
        let world = engine.world();
        let mi = engine.specialization_for(&f.signature([int()]), world).unwrap();
        let err = engine.compile_method(&mi, world).unwrap_err();
        assert!(err.to_string().contains("scripted failure"));
        let ci = engine.compile_method(&mi, world).unwrap();
        assert_eq!(ci.invoke(&[]).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_constant_result_skips_codegen() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        add(&engine, &f, &[int()], ScriptedBody::constant(Value::Bool(true)));
        let world = engine.world();
        let mi = engine.specialization_for(&f.signature([int()]), world).unwrap();
        let ci = engine.compile_method(&mi, world).unwrap();
        assert!(matches!(ci.entry().as_deref(), Some(EntryPoint::Const(Value::Bool(true)))));
        assert_eq!(engine.stats().compilations, 0);
    }

    #[test]
    fn test_interpreter_only_never_compiles() {
        let backend = Arc::new(ScriptedBackend::new());
        let (engine, lattice) = engine_with(backend.clone(), EngineConfig::interpreter_only());
        let f = lattice.declare_function("f");
        add(&engine, &f, &[int()], ScriptedBody::returning(Value::Int(3)));
        let world = engine.world();
        let mi = engine.specialization_for(&f.signature([int()]), world).unwrap();
        let ci = engine.compile_method(&mi, world).unwrap();
        assert!(ci.entry().unwrap().is_interpreted());
        assert_eq!(ci.validity(), WorldRange::ALL);
        assert_eq!(backend.inferences(), 0);
        assert_eq!(backend.compilations(), 0);
    }

    #[test]
    fn test_inferred_code_depends_on_callees() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        let g = lattice.declare_function("g");
        add(&engine, &g, &[Ty::named("Number")], ScriptedBody::returning(Value::Int(0)));
        add(
            &engine,
            &f,
            &[int()],
            ScriptedBody::returning(Value::Int(1)).calls(g.signature([int()])),
        );
        let world = engine.world();
        let mi = engine.specialization_for(&f.signature([int()]), world).unwrap();
        let ci = engine.compile_method(&mi, world).unwrap();
        let callee = engine.specialization_for(&g.signature([int()]), world).unwrap();
        assert!(callee.backedges().iter().any(|e| Arc::ptr_eq(&e.caller, &ci)));

        add(&engine, &g, &[int()], ScriptedBody::returning(Value::Int(5)));
        assert_eq!(ci.max_world(), world);
    }

    #[test]
    fn test_specialization_for_rejects_ambiguity() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        add(&engine, &f, &[int(), Ty::Any], ScriptedBody::returning(Value::Nothing));
        add(&engine, &f, &[Ty::Any, int()], ScriptedBody::returning(Value::Nothing));
        let world = engine.world();
        assert!(engine.specialization_for(&f.signature([int(), int()]), world).is_none());
        assert!(engine.specialization_for(&f.signature([int(), Ty::named("String")]), world).is_some());
        assert!(engine.specialization_for(&f.signature([Ty::var("T", Ty::Any), int()]), world).is_none());
    }

    #[test]
    fn test_compile_hint_marks_precompiled() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        add(&engine, &f, &[Ty::named("Number")], ScriptedBody::returning(Value::Int(1)));
        assert!(engine.compile_hint(&f.signature([int()])).unwrap());
        let mi = engine.specialization_for(&f.signature([int()]), engine.world()).unwrap();
        assert!(mi.is_precompiled());
        assert!(mi.compiled_at(engine.world()).unwrap().is_precompile());
        let g = lattice.declare_function("g");
        assert!(!engine.compile_hint(&g.signature([int()])).unwrap());
    }

    #[test]
    fn test_get_unspecialized_is_shared() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        let m = add(&engine, &f, &[Ty::named("Number")], ScriptedBody::returning(Value::Nothing));
        let a = engine.get_unspecialized(&m);
        let b = engine.get_unspecialized(&m);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.spec_types(), m.sig());
    }
}
