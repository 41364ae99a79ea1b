//! The Dispatch Engine
//!
//! [`Engine`] owns every table of one method universe: the world clock, the
//! method definitions, the dispatch caches and the dependency graph. All
//! operations take `&self`; an engine is shared between threads behind an
//! `Arc`.
//!
//! # Calling
//!
//! ```text
//!   dispatch(f, args, world)
//!        │
//!        ▼
//!   call-site cache ──hit──────────────────────┐
//!        │ miss                                │
//!        ▼                                     │
//!   exact-type table / signature cache ──hit───┤
//!        │ miss                                │
//!        ▼                                     ▼
//!   method lookup + cache_method ──────► instance ──► compiled code
//! ```
//!
//! Readers never block on writers. A call reads the world once and treats
//! every entry whose window excludes it as absent.

use std::sync::Arc;

use meridian_types::{Ty, TypeOracle, Value};
use parking_lot::RwLock;
use tracing::debug;

use crate::backend::CompilerBackend;
use crate::cache::MethodCache;
use crate::call_cache::{CallCache, arg_type_tuple, default_callsite, function_name};
use crate::config::{ConfigError, EngineConfig};
use crate::error::{DispatchError, DispatchResult};
use crate::instance::MethodInstance;
use crate::invalidation::InvalidationLog;
use crate::registry::{MethodRegistry, MethodTracer};
use crate::stats::{EngineStats, StatCounters};
use crate::trace::{TraceSink, Tracer};
use crate::world::{World, WorldClock};

/// A generic-function dispatch engine.
pub struct Engine {
    pub(crate) oracle: Arc<dyn TypeOracle>,
    pub(crate) backend: Arc<dyn CompilerBackend>,
    pub(crate) config: EngineConfig,
    pub(crate) clock: WorldClock,
    pub(crate) registry: MethodRegistry,
    pub(crate) cache: MethodCache,
    pub(crate) call_cache: CallCache,
    pub(crate) stats: StatCounters,
    pub(crate) trace: Tracer,
    pub(crate) invalidation_log: InvalidationLog,
    pub(crate) method_tracer: RwLock<Option<MethodTracer>>,
}

impl Engine {
    /// Engine with the default configuration.
    pub fn new(oracle: Arc<dyn TypeOracle>, backend: Arc<dyn CompilerBackend>) -> Self {
        let config = EngineConfig::default();
        Self::build(oracle, backend, config)
    }

    /// Engine with `config`, which is validated first.
    pub fn with_config(
        oracle: Arc<dyn TypeOracle>,
        backend: Arc<dyn CompilerBackend>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(oracle, backend, config))
    }

    fn build(oracle: Arc<dyn TypeOracle>, backend: Arc<dyn CompilerBackend>, config: EngineConfig) -> Self {
        debug!(
            target: "meridian::engine",
            call_cache_size = config.call_cache_size,
            compile = ?config.compile,
            "engine created"
        );
        Self {
            registry: MethodRegistry::new(oracle.clone()),
            cache: MethodCache::new(oracle.clone()),
            call_cache: CallCache::new(config.call_cache_size),
            stats: StatCounters::default(),
            trace: Tracer::new(config.trace_compile, config.trace_dispatch),
            invalidation_log: InvalidationLog::new(config.debug_invalidation),
            method_tracer: RwLock::new(None),
            clock: WorldClock::new(),
            oracle,
            backend,
            config,
        }
    }

    /// The latest published world.
    #[inline]
    pub fn world(&self) -> World {
        self.clock.current()
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn oracle(&self) -> &Arc<dyn TypeOracle> {
        &self.oracle
    }

    /// A snapshot of the dispatch counters.
    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Call `f` on `args` as of `world`.
    pub fn dispatch(&self, f: &Value, args: &[Value], world: World) -> DispatchResult<Value> {
        self.dispatch_at(default_callsite(f, args.len()), f, args, world)
    }

    /// Call `f` on `args` as of the latest world.
    pub fn call(&self, f: &Value, args: &[Value]) -> DispatchResult<Value> {
        self.dispatch(f, args, self.world())
    }

    /// Call `f` on `args` from the call site hashed to `callsite`.
    ///
    /// Distinct hashes per call site keep the call-site cache from
    /// thrashing between the signatures of unrelated calls.
    #[inline]
    pub fn dispatch_at(&self, callsite: u32, f: &Value, args: &[Value], world: World) -> DispatchResult<Value> {
        let mi = self.lookup_generic(callsite, f, args, world)?;
        let full = Self::call_args(f, args);
        self.invoke_instance(&mi, &full, world)
    }

    /// The instance a call of `f` on `args` reaches in `world`, without
    /// running it.
    pub fn resolve(&self, f: &Value, args: &[Value], world: World) -> DispatchResult<Arc<MethodInstance>> {
        self.lookup_generic(default_callsite(f, args.len()), f, args, world)
    }

    /// Call the method of `f` that `signature` selects, rather than the
    /// one the runtime types of `args` select.
    ///
    /// `signature` is the tuple of argument types, without the function.
    /// The arguments must be instances of it.
    pub fn invoke(&self, f: &Value, signature: &Ty, args: &[Value], world: World) -> DispatchResult<Value> {
        let sig = prepend_function(f, signature);
        let tt = arg_type_tuple(f, args);
        let no_method = || DispatchError::NoApplicableMethod {
            function: function_name(f),
            arg_types: args.iter().map(Value::type_of).collect(),
            world,
        };
        if !self.oracle.is_subtype(&tt, &sig) {
            return Err(no_method());
        }
        let (matc, _) = self.invoke_lookup(&sig, world).ok_or_else(no_method)?;
        let mi = self.invoke_cache_lookup(&matc.method, &tt);
        self.record_dispatch(&mi);
        let full = Self::call_args(f, args);
        self.invoke_instance(&mi, &full, world)
    }

    // =========================================================================
    // Tracing
    // =========================================================================

    /// Register a sink for trace events.
    pub fn add_trace_sink(&self, sink: Arc<dyn TraceSink>) {
        self.trace.add_sink(sink);
    }

    /// Unregister every trace sink.
    pub fn clear_trace_sinks(&self) {
        self.trace.clear_sinks();
    }

    /// Enable or disable precompile tracing. Calls nest.
    pub fn trace_compile(&self, enable: bool) {
        self.trace.set_compile(enable);
    }

    /// Enable or disable dispatch tracing. Calls nest.
    pub fn trace_dispatch(&self, enable: bool) {
        self.trace.set_dispatch(enable);
    }

    /// Number of filled call-site cache slots.
    pub fn call_cache_occupancy(&self) -> usize {
        self.call_cache.occupied()
    }

    /// Empty the call-site cache. Entries are refilled on the next calls.
    pub fn flush_call_cache(&self) {
        self.call_cache.clear();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.call_cache.clear();
        for method in self.registry.methods() {
            for mi in method.specializations() {
                mi.teardown();
            }
            if let Some(mi) = method.unspecialized.swap(None) {
                mi.teardown();
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("world", &self.world())
            .field("methods", &self.registry.len())
            .field("cache_entries", &self.cache.index.len())
            .finish_non_exhaustive()
    }
}

/// `(typeof(f), signature...)`.
fn prepend_function(f: &Value, signature: &Ty) -> Ty {
    let head = std::iter::once(f.type_of());
    match signature.as_tuple() {
        Some(tuple) => match tuple.vararg.as_deref() {
            Some(tail) => Ty::vararg_tuple(head.chain(tuple.elems.iter().cloned()), tail.clone()),
            None => Ty::tuple(head.chain(tuple.elems.iter().cloned())),
        },
        None => Ty::tuple(head.chain(std::iter::once(signature.clone()))),
    }
}
