//! Method Instances
//!
//! A [`MethodInstance`] is a method specialized to a signature. It owns:
//!
//! - the chain of [`CodeInstance`]s compiled for it, newest first
//! - the backedges: code that was compiled assuming calls resolve here
//!
//! Both are guarded by the owning method's write lock. Chain readers walk a
//! published snapshot without locking.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use arc_swap::ArcSwapOption;
use meridian_types::{SparamEnv, Ty};
use parking_lot::Mutex;

use crate::code::{CacheOwner, CodeInstance};
use crate::method::{METHOD_SIG_LATEST_ONLY, Method};
use crate::world::World;

const FLAG_DISPATCHED: u8 = 0b01;
const FLAG_PRECOMPILED: u8 = 0b10;

// =============================================================================
// Backedges
// =============================================================================

/// A dependency of compiled code on a method instance.
#[derive(Clone)]
pub struct Backedge {
    /// Signature of the `invoke` call that created the edge, if any.
    pub invokesig: Option<Ty>,
    /// The dependent code.
    pub caller: Arc<CodeInstance>,
}

impl fmt::Debug for Backedge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backedge")
            .field("invokesig", &self.invokesig)
            .field("caller", &self.caller.def().spec_types())
            .finish()
    }
}

// =============================================================================
// Method Instances
// =============================================================================

/// A method specialized to a signature.
pub struct MethodInstance {
    def: Arc<Method>,
    spec_types: Ty,
    sparam_vals: SparamEnv,
    cache: ArcSwapOption<CodeInstance>,
    backedges: Mutex<Vec<Backedge>>,
    flags: AtomicU8,
    dispatch_status: AtomicU8,
    cache_with_orig: AtomicBool,
}

impl MethodInstance {
    pub(crate) fn new(def: Arc<Method>, spec_types: Ty, sparam_vals: SparamEnv) -> Self {
        Self {
            def,
            spec_types,
            sparam_vals,
            cache: ArcSwapOption::empty(),
            backedges: Mutex::new(Vec::new()),
            flags: AtomicU8::new(0),
            dispatch_status: AtomicU8::new(0),
            cache_with_orig: AtomicBool::new(false),
        }
    }

    /// The method this instance specializes.
    #[inline]
    pub fn method(&self) -> &Arc<Method> {
        &self.def
    }

    /// The specialized signature.
    #[inline]
    pub fn spec_types(&self) -> &Ty {
        &self.spec_types
    }

    /// Values of the method's static parameters under this specialization.
    #[inline]
    pub fn sparam_vals(&self) -> &SparamEnv {
        &self.sparam_vals
    }

    // =========================================================================
    // Status
    // =========================================================================

    #[inline]
    pub fn dispatch_status(&self) -> u8 {
        self.dispatch_status.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_dispatch_status(&self, bits: u8) {
        self.dispatch_status.store(bits, Ordering::Release);
    }

    /// True when a subtype call resolves uniquely to this instance.
    #[inline]
    pub fn is_latest_only(&self) -> bool {
        self.dispatch_status() & METHOD_SIG_LATEST_ONLY != 0
    }

    /// True once caching under a widened signature was found unsafe.
    #[inline]
    pub fn cache_with_orig(&self) -> bool {
        self.cache_with_orig.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_cache_with_orig(&self) {
        self.cache_with_orig.store(true, Ordering::Release);
    }

    /// Mark as dispatched; true the first time.
    pub(crate) fn mark_dispatched(&self) -> bool {
        self.flags.fetch_or(FLAG_DISPATCHED, Ordering::AcqRel) & FLAG_DISPATCHED == 0
    }

    /// Mark as compiled ahead of time; true the first time.
    pub(crate) fn mark_precompiled(&self) -> bool {
        self.flags.fetch_or(FLAG_PRECOMPILED, Ordering::AcqRel) & FLAG_PRECOMPILED == 0
    }

    /// True once the instance was compiled ahead of time.
    pub fn is_precompiled(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_PRECOMPILED != 0
    }

    // =========================================================================
    // Code Instance Chain
    // =========================================================================

    /// Newest code instance, if any.
    #[inline]
    pub fn cache_head(&self) -> Option<Arc<CodeInstance>> {
        self.cache.load_full()
    }

    /// Code instances, newest first.
    pub fn code_instances(&self) -> CodeChain {
        CodeChain {
            next: self.cache_head(),
        }
    }

    /// Newest native code instance valid in `world` with an entry point.
    pub fn compiled_at(&self, world: World) -> Option<Arc<CodeInstance>> {
        self.code_instances().find(|ci| {
            *ci.owner() == CacheOwner::Native && ci.is_valid_at(world) && ci.is_compiled()
        })
    }

    /// Prepend `ci` to the chain.
    pub(crate) fn cache_insert(&self, ci: Arc<CodeInstance>) {
        let _guard = self.def.writelock.lock();
        ci.set_next(self.cache.load_full());
        self.cache.store(Some(ci));
    }

    /// Prepend `ci` only if the chain head is still `expected`.
    pub(crate) fn cache_try_insert(
        &self,
        expected: Option<&Arc<CodeInstance>>,
        ci: Arc<CodeInstance>,
    ) -> bool {
        let _guard = self.def.writelock.lock();
        let head = self.cache.load_full();
        let unchanged = match (&head, expected) {
            (Some(h), Some(e)) => Arc::ptr_eq(h, e),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            ci.set_next(head);
            self.cache.store(Some(ci));
        }
        unchanged
    }

    // =========================================================================
    // Backedges
    // =========================================================================

    /// Record that `caller` depends on this instance. Duplicate edges are
    /// dropped.
    pub(crate) fn push_backedge(&self, invokesig: Option<Ty>, caller: Arc<CodeInstance>) {
        let _guard = self.def.writelock.lock();
        let mut edges = self.backedges.lock();
        let duplicate = edges
            .iter()
            .any(|e| Arc::ptr_eq(&e.caller, &caller) && e.invokesig == invokesig);
        if !duplicate {
            edges.push(Backedge { invokesig, caller });
        }
    }

    /// Snapshot of the backedges.
    pub fn backedges(&self) -> Vec<Backedge> {
        self.backedges.lock().clone()
    }

    /// Number of recorded backedges.
    pub fn backedge_count(&self) -> usize {
        self.backedges.lock().len()
    }

    /// Remove and return every backedge. Callers hold the method lock.
    pub(crate) fn take_backedges(&self) -> Vec<Backedge> {
        std::mem::take(&mut *self.backedges.lock())
    }

    /// Remove the backedges for which `remove` holds, returning their callers
    /// in order. Callers hold the method lock.
    pub(crate) fn drain_backedges_where(
        &self,
        mut remove: impl FnMut(&Backedge) -> bool,
    ) -> Vec<Arc<CodeInstance>> {
        let mut edges = self.backedges.lock();
        let mut removed = Vec::new();
        edges.retain(|edge| {
            if remove(edge) {
                removed.push(edge.caller.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Break reference cycles through the chain and backedges.
    pub(crate) fn teardown(&self) {
        let mut head = self.cache.swap(None);
        while let Some(ci) = head {
            ci.clear_edges();
            head = ci.take_next();
        }
        self.backedges.lock().clear();
    }
}

impl fmt::Debug for MethodInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodInstance")
            .field("method", &self.def.id())
            .field("spec_types", &self.spec_types)
            .finish()
    }
}

impl fmt::Display for MethodInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.spec_types)
    }
}

/// Iterator over a code-instance chain.
pub struct CodeChain {
    next: Option<Arc<CodeInstance>>,
}

impl Iterator for CodeChain {
    type Item = Arc<CodeInstance>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = current.next();
        Some(current)
    }
}
