//! World-age generic function dispatch.
//!
//! This crate provides:
//! - A global method table of generic-function definitions, versioned by a
//!   monotonically increasing world counter
//! - Specificity-ordered method lookup with ambiguity detection
//! - Per-signature specialization and code caches with validity windows
//! - A call-site cache and an exact-type table for the dispatch hot path
//! - Backedge tracking and invalidation when definitions change
//! - A [`CompilerBackend`] seam for inference and code generation
//!
//! The type language is supplied by a [`TypeOracle`](meridian_types::TypeOracle)
//! from `meridian_types`.

mod backedges;
pub mod backend;
mod cache;
mod call_cache;
pub mod code;
mod compilation_sig;
mod compile;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod instance;
pub mod invalidation;
pub mod matching;
pub mod method;
pub mod registry;
pub mod scripted;
mod specializations;
mod stats;
pub mod trace;
pub mod world;

// Re-export the engine surface
pub use backend::{CompilerBackend, InferenceContext, InferredCode};
pub use cache::PromoteOutcome;
pub use code::{CacheOwner, CodeInstance, Edge, EntryPoint, Invoker};
pub use config::{CompileMode, ConfigError, EngineConfig};
pub use engine::Engine;
pub use error::{CompileError, DispatchError, DispatchResult};
pub use instance::MethodInstance;
pub use invalidation::{InvalidationLog, InvalidationRecord, InvalidationTag};
pub use matching::{LookupResult, MethodMatch};
pub use method::{Method, MethodBody, MethodDefinition, MethodId};
pub use registry::MethodTracer;
pub use scripted::{ScriptedBackend, ScriptedBody};
pub use stats::EngineStats;
pub use trace::{SignatureTrace, TraceEvent, TraceKind, TraceSink};
pub use world::{FIRST_WORLD, WORLD_INFINITY, World, WorldRange};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use meridian_types::TypeLattice;

    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::scripted::ScriptedBackend;

    /// An engine over the builtin lattice with the testing configuration.
    pub(crate) fn engine() -> (Engine, Arc<TypeLattice>) {
        engine_with(Arc::new(ScriptedBackend::new()), EngineConfig::testing())
    }

    pub(crate) fn engine_with(backend: Arc<ScriptedBackend>, config: EngineConfig) -> (Engine, Arc<TypeLattice>) {
        let lattice = Arc::new(TypeLattice::with_builtins());
        let engine = Engine::with_config(lattice.clone(), backend, config).expect("valid test config");
        (engine, lattice)
    }
}
