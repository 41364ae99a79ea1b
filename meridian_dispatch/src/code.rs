//! Code Instances
//!
//! A [`CodeInstance`] is one compiled (or inferred) version of a method
//! instance, valid over a window of worlds.
//!
//! # Lifecycle
//!
//! 1. Created empty with an inverted window while inference runs.
//! 2. Filled with its result type, forward edges and real window, then
//!    published on the instance's chain.
//! 3. Possibly promoted: a window ending at the world it was validated in
//!    is widened to infinity if no new world appeared meanwhile.
//! 4. Possibly invalidated: its window is clipped when a dependency changes.
//!
//! # Entry Points
//!
//! The entry point is installed at most once. While one thread compiles,
//! others that want to call the code wait for it to finish instead of
//! compiling it again.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use arc_swap::{ArcSwap, ArcSwapOption};
use meridian_types::{Ty, Value};

use crate::error::{CompileError, DispatchResult};
use crate::instance::MethodInstance;
use crate::world::{WORLD_INFINITY, World, WorldRange};

/// A callable entry point.
pub type Invoker = Arc<dyn Fn(&[Value]) -> DispatchResult<Value> + Send + Sync>;

/// Who a code instance was produced for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheOwner {
    /// The engine's own native compilation pipeline.
    Native,
    /// An external consumer keeping its own results in the chain.
    External(Arc<str>),
}

/// The entry point of executable code.
#[derive(Clone)]
pub enum EntryPoint {
    /// Specialized compiled code.
    Compiled(Invoker),
    /// Interpreter or unspecialized fallback.
    Interpreted(Invoker),
    /// Inference proved the result constant.
    Const(Value),
}

impl EntryPoint {
    /// Run the code on `args` (the callee followed by the call arguments).
    pub fn call(&self, args: &[Value]) -> DispatchResult<Value> {
        match self {
            EntryPoint::Compiled(f) | EntryPoint::Interpreted(f) => f(args),
            EntryPoint::Const(v) => Ok(v.clone()),
        }
    }

    #[inline]
    pub fn is_interpreted(&self) -> bool {
        matches!(self, EntryPoint::Interpreted(_))
    }
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryPoint::Compiled(_) => f.write_str("Compiled"),
            EntryPoint::Interpreted(_) => f.write_str("Interpreted"),
            EntryPoint::Const(v) => write!(f, "Const({v:?})"),
        }
    }
}

// =============================================================================
// Forward Edges
// =============================================================================

/// A dependency recorded while inferring a code instance.
#[derive(Clone)]
pub enum Edge {
    /// A call that resolved to this instance.
    Instance(Arc<MethodInstance>),
    /// A call whose result was taken from this code instance.
    Code(Arc<CodeInstance>),
    /// An `invoke` of `sig` that resolved to `target`.
    Invoke { sig: Ty, target: Arc<MethodInstance> },
    /// A call signature nothing matched.
    Unresolved(Ty),
}

impl Edge {
    /// True when this edge depends on `mi`, or on `ci` specifically.
    pub(crate) fn depends_on(&self, mi: &Arc<MethodInstance>, ci: &Arc<CodeInstance>) -> bool {
        match self {
            Edge::Instance(target) | Edge::Invoke { target, .. } => Arc::ptr_eq(target, mi),
            Edge::Code(code) => Arc::ptr_eq(code, ci),
            Edge::Unresolved(_) => false,
        }
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Instance(mi) => write!(f, "Instance({})", mi.spec_types()),
            Edge::Code(ci) => write!(f, "Code({})", ci.def().spec_types()),
            Edge::Invoke { sig, target } => write!(f, "Invoke({sig} => {})", target.spec_types()),
            Edge::Unresolved(sig) => write!(f, "Unresolved({sig})"),
        }
    }
}

// =============================================================================
// Code Instances
// =============================================================================

const STATE_EMPTY: u8 = 0;
const STATE_COMPILING: u8 = 1;
const STATE_READY: u8 = 2;

/// Outcome of trying to claim the right to compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompileClaim {
    /// This thread must compile and then call `finish_compile`.
    Claimed,
    /// The entry point is already installed.
    Ready,
}

/// One version of a method instance, valid over a window of worlds.
pub struct CodeInstance {
    def: Arc<MethodInstance>,
    owner: CacheOwner,
    rettype: ArcSwap<Ty>,
    min_world: AtomicU64,
    max_world: AtomicU64,
    edges: ArcSwap<Vec<Edge>>,
    entry: ArcSwapOption<EntryPoint>,
    state: AtomicU8,
    precompile: AtomicBool,
    next: ArcSwapOption<CodeInstance>,
}

impl CodeInstance {
    /// A filled code instance.
    pub(crate) fn new(
        def: Arc<MethodInstance>,
        owner: CacheOwner,
        rettype: Ty,
        min_world: World,
        max_world: World,
        edges: Vec<Edge>,
    ) -> Self {
        Self {
            def,
            owner,
            rettype: ArcSwap::from_pointee(rettype),
            min_world: AtomicU64::new(min_world),
            max_world: AtomicU64::new(max_world),
            edges: ArcSwap::from_pointee(edges),
            entry: ArcSwapOption::empty(),
            state: AtomicU8::new(STATE_EMPTY),
            precompile: AtomicBool::new(false),
            next: ArcSwapOption::empty(),
        }
    }

    /// An unfilled code instance, invalid in every world until filled.
    pub(crate) fn new_uninit(def: Arc<MethodInstance>, owner: CacheOwner, world: World) -> Self {
        Self::new(def, owner, Ty::Any, world, world.saturating_sub(1), Vec::new())
    }

    /// Complete an unfilled instance. The window is stored last so readers
    /// that see it valid also see the result and edges.
    pub(crate) fn fill(&self, rettype: Ty, edges: Vec<Edge>, min_world: World, max_world: World) {
        self.rettype.store(Arc::new(rettype));
        self.edges.store(Arc::new(edges));
        self.min_world.store(min_world, Ordering::Release);
        self.max_world.store(max_world, Ordering::Release);
    }

    #[inline]
    pub fn def(&self) -> &Arc<MethodInstance> {
        &self.def
    }

    #[inline]
    pub fn owner(&self) -> &CacheOwner {
        &self.owner
    }

    /// Inferred result type.
    #[inline]
    pub fn rettype(&self) -> Arc<Ty> {
        self.rettype.load_full()
    }

    #[inline]
    pub fn min_world(&self) -> World {
        self.min_world.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max_world(&self) -> World {
        self.max_world.load(Ordering::Acquire)
    }

    /// Snapshot of the validity window.
    pub fn validity(&self) -> WorldRange {
        WorldRange::new(self.min_world(), self.max_world())
    }

    #[inline]
    pub fn is_valid_at(&self, world: World) -> bool {
        self.min_world() <= world && world <= self.max_world()
    }

    /// Forward edges recorded by inference.
    pub fn edges(&self) -> Arc<Vec<Edge>> {
        self.edges.load_full()
    }

    /// True when this code depends on `mi` or on `ci`.
    pub(crate) fn depends_on(&self, mi: &Arc<MethodInstance>, ci: &Arc<CodeInstance>) -> bool {
        self.edges.load().iter().any(|e| e.depends_on(mi, ci))
    }

    /// Clip an open window to `max_world`. False when already closed.
    pub(crate) fn close_window(&self, max_world: World) -> bool {
        self.max_world
            .compare_exchange(WORLD_INFINITY, max_world, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Widen a window ending exactly at `validated` to infinity.
    pub(crate) fn promote_from(&self, validated: World) -> bool {
        self.max_world
            .compare_exchange(validated, WORLD_INFINITY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // =========================================================================
    // Entry Point
    // =========================================================================

    /// True once an entry point is installed.
    #[inline]
    pub fn is_compiled(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_READY
    }

    /// Installed entry point, without waiting.
    pub fn entry(&self) -> Option<Arc<EntryPoint>> {
        if self.is_compiled() {
            self.entry.load_full()
        } else {
            None
        }
    }

    /// Installed entry point, waiting out a compilation in progress.
    pub fn wait_entry(&self) -> Option<Arc<EntryPoint>> {
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_READY => return self.entry.load_full(),
                STATE_COMPILING => {
                    std::hint::spin_loop();
                    std::thread::yield_now();
                }
                _ => return None,
            }
        }
    }

    /// Claim compilation, or wait for a concurrent one to finish.
    ///
    /// If the concurrent compilation fails the claim is retried, so a
    /// failure is never cached.
    pub(crate) fn claim_compile(&self) -> CompileClaim {
        loop {
            match self.state.compare_exchange(
                STATE_EMPTY,
                STATE_COMPILING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return CompileClaim::Claimed,
                Err(STATE_READY) => return CompileClaim::Ready,
                Err(_) => {
                    std::hint::spin_loop();
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Publish the result of a claimed compilation. `None` releases the
    /// claim without installing anything.
    pub(crate) fn finish_compile(&self, entry: Option<EntryPoint>) {
        match entry {
            Some(entry) => {
                self.entry.store(Some(Arc::new(entry)));
                self.state.store(STATE_READY, Ordering::Release);
            }
            None => self.state.store(STATE_EMPTY, Ordering::Release),
        }
    }

    /// Install `entry` unless some entry point already exists.
    pub(crate) fn install_entry(&self, entry: EntryPoint) {
        if self.claim_compile() == CompileClaim::Claimed {
            self.finish_compile(Some(entry));
        }
    }

    /// Call the installed entry point.
    pub fn invoke(&self, args: &[Value]) -> DispatchResult<Value> {
        match self.wait_entry() {
            Some(entry) => entry.call(args),
            None => Err(CompileError::MissingCode {
                signature: self.def.spec_types().clone(),
            }
            .into()),
        }
    }

    /// True when this was produced by an explicit compile request.
    #[inline]
    pub fn is_precompile(&self) -> bool {
        self.precompile.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_precompile(&self) {
        self.precompile.store(true, Ordering::Release);
    }

    // =========================================================================
    // Chain
    // =========================================================================

    #[inline]
    pub(crate) fn next(&self) -> Option<Arc<CodeInstance>> {
        self.next.load_full()
    }

    #[inline]
    pub(crate) fn set_next(&self, next: Option<Arc<CodeInstance>>) {
        self.next.store(next);
    }

    pub(crate) fn take_next(&self) -> Option<Arc<CodeInstance>> {
        self.next.swap(None)
    }

    pub(crate) fn clear_edges(&self) {
        self.edges.store(Arc::new(Vec::new()));
        self.entry.store(None);
    }
}

impl fmt::Debug for CodeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeInstance")
            .field("spec_types", self.def.spec_types())
            .field("owner", &self.owner)
            .field("validity", &self.validity())
            .field("compiled", &self.is_compiled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{Method, MethodBody, MethodDefinition, MethodId};
    use meridian_types::{SparamEnv, TypeLattice};

    fn instance() -> Arc<MethodInstance> {
        let lattice = Arc::new(TypeLattice::with_builtins());
        let f = lattice.declare_function("f");
        let def = MethodDefinition::new(&f, [Ty::Any], MethodBody::new(()));
        let m = Arc::new(Method::new(MethodId(0), def, lattice.clone(), 8));
        let sig = f.signature([Ty::named("Int64")]);
        m.specialization(&*lattice, &sig, &SparamEnv::new())
    }

    // =========================================================================
    // Window Tests
    // =========================================================================

    #[test]
    fn test_uninit_is_never_valid() {
        let ci = CodeInstance::new_uninit(instance(), CacheOwner::Native, 5);
        assert!(ci.validity().is_empty());
        assert!(!ci.is_valid_at(4) && !ci.is_valid_at(5));
        ci.fill(Ty::named("Int64"), Vec::new(), 5, 5);
        assert!(ci.is_valid_at(5));
        assert_eq!(*ci.rettype(), Ty::named("Int64"));
    }

    #[test]
    fn test_close_and_promote() {
        let ci = CodeInstance::new(instance(), CacheOwner::Native, Ty::Any, 1, 7, Vec::new());
        assert!(!ci.close_window(3));
        assert!(!ci.promote_from(6));
        assert!(ci.promote_from(7));
        assert_eq!(ci.max_world(), WORLD_INFINITY);
        assert!(ci.close_window(9));
        assert_eq!(ci.validity(), WorldRange::new(1, 9));
    }

    // =========================================================================
    // Entry Point Tests
    // =========================================================================

    #[test]
    fn test_failed_compile_is_not_cached() {
        let ci = CodeInstance::new(instance(), CacheOwner::Native, Ty::Any, 1, WORLD_INFINITY, Vec::new());
        assert_eq!(ci.claim_compile(), CompileClaim::Claimed);
        ci.finish_compile(None);
        assert!(ci.entry().is_none());
        assert!(ci.invoke(&[]).is_err());
        assert_eq!(ci.claim_compile(), CompileClaim::Claimed);
        ci.finish_compile(Some(EntryPoint::Const(Value::Int(3))));
        assert_eq!(ci.claim_compile(), CompileClaim::Ready);
        assert_eq!(ci.invoke(&[]).ok(), Some(Value::Int(3)));
    }

    #[test]
    fn test_waiters_see_concurrent_compile() {
        let ci = CodeInstance::new(instance(), CacheOwner::Native, Ty::Any, 1, WORLD_INFINITY, Vec::new());
        assert_eq!(ci.claim_compile(), CompileClaim::Claimed);
        std::thread::scope(|s| {
            let waiter = s.spawn(|| ci.wait_entry().is_some());
            ci.finish_compile(Some(EntryPoint::Const(Value::Nothing)));
            assert!(waiter.join().unwrap());
        });
    }

    #[test]
    fn test_install_entry_keeps_first() {
        let ci = CodeInstance::new(instance(), CacheOwner::Native, Ty::Any, 1, WORLD_INFINITY, Vec::new());
        ci.install_entry(EntryPoint::Const(Value::Int(1)));
        ci.install_entry(EntryPoint::Const(Value::Int(2)));
        assert_eq!(ci.invoke(&[]).ok(), Some(Value::Int(1)));
    }

    // =========================================================================
    // Chain and Backedge Tests
    // =========================================================================

    #[test]
    fn test_chain_is_newest_first() {
        let mi = instance();
        let a = Arc::new(CodeInstance::new(mi.clone(), CacheOwner::Native, Ty::Any, 1, 3, Vec::new()));
        let b = Arc::new(CodeInstance::new(mi.clone(), CacheOwner::Native, Ty::Any, 4, 9, Vec::new()));
        mi.cache_insert(a.clone());
        assert!(!mi.cache_try_insert(None, b.clone()));
        assert!(mi.cache_try_insert(Some(&a), b.clone()));
        let chain: Vec<_> = mi.code_instances().collect();
        assert_eq!(chain.len(), 2);
        assert!(Arc::ptr_eq(&chain[0], &b));
        assert!(mi.compiled_at(5).is_none());
        b.install_entry(EntryPoint::Const(Value::Nothing));
        assert!(mi.compiled_at(5).is_some_and(|ci| Arc::ptr_eq(&ci, &b)));
        mi.teardown();
        assert!(mi.cache_head().is_none());
    }

    #[test]
    fn test_backedges_dedup_and_drain() {
        let callee = instance();
        let caller_mi = instance();
        let caller = Arc::new(CodeInstance::new(
            caller_mi,
            CacheOwner::Native,
            Ty::Any,
            1,
            WORLD_INFINITY,
            vec![Edge::Instance(callee.clone())],
        ));
        callee.push_backedge(None, caller.clone());
        callee.push_backedge(None, caller.clone());
        callee.push_backedge(Some(Ty::Any), caller.clone());
        assert_eq!(callee.backedge_count(), 2);
        let drained = callee.drain_backedges_where(|e| e.invokesig.is_some());
        assert_eq!(drained.len(), 1);
        assert_eq!(callee.backedge_count(), 1);
        let probe = Arc::new(CodeInstance::new(callee.clone(), CacheOwner::Native, Ty::Any, 1, 1, Vec::new()));
        assert!(caller.depends_on(&callee, &probe));
    }
}
