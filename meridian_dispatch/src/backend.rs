//! Compiler Backend
//!
//! The engine does not infer or generate code itself. A [`CompilerBackend`]
//! does, and the engine caches what it produces.
//!
//! # Re-entering the Engine
//!
//! Inference sees the calls a body makes. It resolves them through the
//! [`InferenceContext`], which records each resolution as a forward edge
//! of the code being inferred. Those edges become backedges once the code
//! is cached, so the code is invalidated when a resolution changes.
//!
//! # Reentrancy
//!
//! Inference of an instance already being inferred on the same thread is
//! treated as a miss, and nesting is bounded by
//! [`EngineConfig::max_inference_depth`](crate::EngineConfig).

use std::cell::RefCell;
use std::sync::Arc;

use meridian_types::{Ty, Value};
use parking_lot::Mutex;

use crate::code::{CodeInstance, Edge, Invoker};
use crate::engine::Engine;
use crate::error::{CompileError, DispatchResult};
use crate::instance::MethodInstance;
use crate::matching::LookupResult;
use crate::world::{World, WorldRange};

/// Produces code for method instances.
pub trait CompilerBackend: Send + Sync {
    /// Infer `mi` for `world`.
    ///
    /// `Ok(None)` declines; the engine then falls back to the
    /// unspecialized instance of the method.
    fn infer(
        &self,
        cx: &InferenceContext<'_>,
        mi: &Arc<MethodInstance>,
        world: World,
    ) -> Result<Option<InferredCode>, CompileError>;

    /// Produce the entry point of inferred code.
    fn compile(&self, ci: &Arc<CodeInstance>) -> Result<Invoker, CompileError>;

    /// An interpreter entry point for `mi`, used when compilation is
    /// disabled or declined.
    fn interpret(&self, mi: &Arc<MethodInstance>) -> Option<Invoker> {
        let _ = mi;
        None
    }
}

/// The result of inference.
#[derive(Debug, Clone)]
pub struct InferredCode {
    pub rettype: Ty,
    /// Set when every call returns this value; no code needs to be
    /// generated.
    pub const_result: Option<Value>,
}

impl InferredCode {
    pub fn new(rettype: Ty) -> Self {
        Self {
            rettype,
            const_result: None,
        }
    }

    pub fn constant(rettype: Ty, value: Value) -> Self {
        Self {
            rettype,
            const_result: Some(value),
        }
    }
}

// =============================================================================
// Inference Context
// =============================================================================

/// The engine as seen by inference of one instance.
pub struct InferenceContext<'a> {
    engine: &'a Engine,
    world: World,
    edges: Mutex<Vec<Edge>>,
    valid: Mutex<WorldRange>,
}

impl<'a> InferenceContext<'a> {
    pub(crate) fn new(engine: &'a Engine, world: World) -> Self {
        Self {
            engine,
            world,
            edges: Mutex::new(Vec::new()),
            valid: Mutex::new(WorldRange::ALL),
        }
    }

    /// The world being inferred for.
    #[inline]
    pub fn world(&self) -> World {
        self.world
    }

    pub fn engine(&self) -> &'a Engine {
        self.engine
    }

    fn narrow(&self, range: WorldRange) {
        self.valid.lock().narrow(range);
    }

    fn push(&self, edge: Edge) {
        self.edges.lock().push(edge);
    }

    /// Resolve a call with argument types `sig`.
    ///
    /// Returns the instance a call of that type reaches when exactly one
    /// method covers it. Otherwise the result depends on every method the
    /// signature may reach, or on methods that do not exist yet, and the
    /// edges record that.
    pub fn resolve_call(&self, sig: &Ty) -> Option<Arc<MethodInstance>> {
        let engine = self.engine;
        let limit = engine.config.max_unspecialized_conflicts;
        match engine.lookup_matches(sig, self.world, Some(limit)) {
            LookupResult::Matches { matches, valid } if matches.len() == 1 && matches[0].fully_covers() => {
                self.narrow(valid);
                let mi = engine.method_match_to_mi(&matches[0], self.world, valid, true)?;
                self.push(Edge::Instance(mi.clone()));
                Some(mi)
            }
            LookupResult::Matches { matches, valid } | LookupResult::Ambiguous { matches, valid } => {
                self.narrow(valid);
                for matc in &matches {
                    if let Some(mi) = engine.method_match_to_mi(matc, self.world, valid, false) {
                        self.push(Edge::Instance(mi));
                    }
                }
                self.push(Edge::Unresolved(sig.clone()));
                None
            }
            LookupResult::NoMatch { valid } => {
                self.narrow(valid);
                self.push(Edge::Unresolved(sig.clone()));
                None
            }
            LookupResult::TooMany { .. } => {
                self.narrow(WorldRange::at(self.world));
                self.push(Edge::Unresolved(sig.clone()));
                None
            }
        }
    }

    /// Resolve an `invoke` of the method covering `sig`.
    pub fn resolve_invoke(&self, sig: &Ty) -> Option<Arc<MethodInstance>> {
        let (matc, valid) = self.engine.invoke_lookup(sig, self.world)?;
        self.narrow(valid);
        let target = self.engine.invoke_cache_lookup(&matc.method, &matc.spec_types);
        self.push(Edge::Invoke {
            sig: sig.clone(),
            target: target.clone(),
        });
        Some(target)
    }

    /// Infer a callee for its result type, depending on the inferred code
    /// when there is some and on the instance otherwise.
    pub fn infer_callee(&self, mi: &Arc<MethodInstance>) -> DispatchResult<Option<Arc<CodeInstance>>> {
        let ci = self.engine.type_infer(mi, self.world)?;
        match &ci {
            Some(ci) => {
                self.narrow(ci.validity());
                self.push(Edge::Code(ci.clone()));
            }
            None => self.push(Edge::Instance(mi.clone())),
        }
        Ok(ci)
    }

    pub(crate) fn finish(self) -> (Vec<Edge>, WorldRange) {
        (self.edges.into_inner(), self.valid.into_inner())
    }
}

// =============================================================================
// Reentrancy Guard
// =============================================================================

thread_local! {
    static INFERRING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks an instance as being inferred on this thread until dropped.
pub(crate) struct InferenceGuard {
    _private: (),
}

impl InferenceGuard {
    /// `None` when `mi` is already being inferred on this thread or the
    /// nesting limit is reached.
    pub(crate) fn enter(mi: &Arc<MethodInstance>, max_depth: usize) -> Option<Self> {
        let key = Arc::as_ptr(mi) as usize;
        INFERRING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.len() >= max_depth || stack.contains(&key) {
                return None;
            }
            stack.push(key);
            Some(InferenceGuard { _private: () })
        })
    }

    /// Inference nesting on this thread.
    pub(crate) fn depth() -> usize {
        INFERRING.with(|stack| stack.borrow().len())
    }
}

impl Drop for InferenceGuard {
    fn drop(&mut self) {
        INFERRING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
