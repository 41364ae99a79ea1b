//! Method Registry
//!
//! Every method definition of every generic function lives in one
//! definitions index, keyed by its signature (slot 0 is the function's own
//! type). Adding a method is split in two steps, as in any versioned table:
//!
//! 1. **Add**: the entry is inserted with an empty validity window, so no
//!    reader can see it yet.
//! 2. **Activate**: under the world lock, the entry is compared against
//!    every method visible in the current world. Interference sets and
//!    dispatch status bits are updated, invalidated code is clipped, and the
//!    window opens at the next world, which is then published.
//!
//! Removing a method clips its window at the current world and invalidates
//! everything that depended on it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use dashmap::DashMap;
use meridian_types::{Ty, TypeName, TypeOracle};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::MAX_CACHE_ENTRY_COUNT;
use crate::engine::Engine;
use crate::error::{DispatchError, DispatchResult};
use crate::index::{IndexEntry, SignatureIndex};
use crate::instance::MethodInstance;
use crate::invalidation::{InvalidationRecord, InvalidationTag, is_replacing, type_intersection2};
use crate::method::{
    METHOD_SIG_LATEST_ONLY, METHOD_SIG_LATEST_WHICH, Method, MethodDefinition, MethodId,
    in_interferences,
};
use crate::world::{WORLD_INFINITY, World, WorldRange};

/// Callback run after every method activation.
pub type MethodTracer = Arc<dyn Fn(&Arc<Method>) + Send + Sync>;

// =============================================================================
// Per-Type-Name Bookkeeping
// =============================================================================

/// Facts about the methods and cache entries filed under one type name.
#[derive(Debug, Default)]
pub(crate) struct TypeNameInfo {
    max_args: AtomicUsize,
    cache_entry_count: AtomicU8,
}

impl TypeNameInfo {
    /// Largest fixed arity of a method whose first slot names this type.
    #[inline]
    pub(crate) fn max_args(&self) -> usize {
        self.max_args.load(Ordering::Relaxed)
    }

    /// Number of cache entries filed under this type, saturating.
    #[inline]
    pub(crate) fn cache_entry_count(&self) -> u8 {
        self.cache_entry_count.load(Ordering::Relaxed)
    }

    /// Count one more cache entry. Callers hold the cache lock.
    pub(crate) fn bump_cache_entry_count(&self) {
        let count = self.cache_entry_count();
        if count < MAX_CACHE_ENTRY_COUNT {
            self.cache_entry_count.store(count + 1, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

struct MethodSlot {
    method: Arc<Method>,
    entry: Arc<IndexEntry<Arc<Method>>>,
}

/// All method definitions of an engine.
pub(crate) struct MethodRegistry {
    pub(crate) defs: SignatureIndex<Arc<Method>>,
    slots: RwLock<Vec<MethodSlot>>,
    typenames: DashMap<TypeName, Arc<TypeNameInfo>>,
}

impl MethodRegistry {
    pub(crate) fn new(oracle: Arc<dyn TypeOracle>) -> Self {
        Self {
            defs: SignatureIndex::new(oracle),
            slots: RwLock::new(Vec::new()),
            typenames: DashMap::new(),
        }
    }

    /// The method with id `id`.
    pub(crate) fn method(&self, id: MethodId) -> Option<Arc<Method>> {
        self.slots.read().get(id.index()).map(|s| s.method.clone())
    }

    /// The definitions entry of `method`, if it belongs to this registry.
    fn entry_of(&self, method: &Arc<Method>) -> Option<Arc<IndexEntry<Arc<Method>>>> {
        let slots = self.slots.read();
        let slot = slots.get(method.id().index())?;
        Arc::ptr_eq(&slot.method, method).then(|| slot.entry.clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Every method ever added, in definition order.
    pub(crate) fn methods(&self) -> Vec<Arc<Method>> {
        self.slots.read().iter().map(|s| s.method.clone()).collect()
    }

    /// Bookkeeping for `name`, created on first use.
    pub(crate) fn typename(&self, name: &TypeName) -> Arc<TypeNameInfo> {
        if let Some(info) = self.typenames.get(name) {
            return info.value().clone();
        }
        self.typenames.entry(name.clone()).or_default().value().clone()
    }

    /// Raise the recorded arity of the type named in the first slot of `sig`.
    fn update_max_args(&self, sig: &Ty) {
        let Some(tuple) = sig.as_tuple() else {
            return;
        };
        let Some(Ty::Named(name)) = tuple.slot(0) else {
            return;
        };
        let info = self.typename(name);
        let na = tuple.len();
        if na > info.max_args() {
            info.max_args.store(na, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// Mutation
// =============================================================================

impl Engine {
    /// Add a method definition and make it visible in a new world.
    ///
    /// Fails with [`DispatchError::NewWorldsDisabled`] once
    /// [`Engine::disable_new_worlds`] has been called.
    pub fn add_method(&self, def: MethodDefinition) -> DispatchResult<Arc<Method>> {
        let mut world_guard = self.clock.lock();
        if !world_guard.allows_new_worlds() {
            return Err(DispatchError::NewWorldsDisabled);
        }
        let (method, entry) = self.method_table_add(def);
        let world = world_guard.current() + 1;
        method.set_primary_world(world);
        self.activate(&method, &entry, world);
        world_guard.publish(world);
        drop(world_guard);

        debug!(target: "meridian::registry", method = %method, world, "method added");
        self.call_method_tracer(&method);
        Ok(method)
    }

    /// Insert `def` with a window no world can see yet.
    fn method_table_add(&self, def: MethodDefinition) -> (Arc<Method>, Arc<IndexEntry<Arc<Method>>>) {
        let _cache = self.cache.writelock.lock();
        let mut slots = self.registry.slots.write();
        let id = MethodId(slots.len() as u32);
        let method = Arc::new(Method::new(
            id,
            def,
            self.oracle.clone(),
            self.config.specialization_inline_threshold,
        ));
        let entry = self.registry.defs.insert(IndexEntry::new(
            method.sig().clone(),
            method.clone(),
            WORLD_INFINITY,
            1,
        ));
        slots.push(MethodSlot {
            method: method.clone(),
            entry: entry.clone(),
        });
        drop(slots);
        self.registry.update_max_args(method.sig());
        (method, entry)
    }

    /// Methods visible in `world` that intersect `method`, plus the method
    /// it replaces if its signature is identical.
    ///
    /// The scan stops early at a method that uniquely answers every call
    /// `method` can match, since nothing behind it can be affected.
    fn get_intersect_matches(&self, method: &Method, world: World) -> (Vec<Arc<Method>>, Option<Arc<Method>>) {
        let oracle = &*self.oracle;
        let sig = method.sig();
        let mut shadowed: Vec<Arc<Method>> = Vec::new();
        let mut replaced: Option<(Arc<Method>, World)> = None;
        self.registry
            .defs
            .visit_intersecting(sig, WorldRange::at(world), |entry, _, _, issubty| {
                let old = entry.payload();
                if issubty && oracle.is_subtype(old.sig(), sig) {
                    let min = entry.window().min();
                    if replaced.as_ref().is_none_or(|(_, newest)| *newest < min) {
                        replaced = Some((old.clone(), min));
                    }
                }
                if issubty && old.is_latest_only() {
                    shadowed.clear();
                    shadowed.push(old.clone());
                    return false;
                }
                shadowed.push(old.clone());
                true
            });
        (shadowed, replaced.map(|(m, _)| m))
    }

    fn method_overwrite(&self, method: &Method, old: &Method) {
        if self.config.warn_overwrite {
            warn!(
                target: "meridian::registry",
                signature = %method.sig(),
                "method definition {} overwritten",
                old
            );
        }
    }

    /// Make `method` visible from `world` on. Callers hold the world lock.
    fn activate(&self, method: &Arc<Method>, entry: &IndexEntry<Arc<Method>>, world: World) {
        let oracle = &*self.oracle;
        let sig = method.sig();
        debug_assert_eq!(entry.window().min(), WORLD_INFINITY);
        entry.window().set_min(world);
        let max_world = world - 1;

        let (shadowed, replaced) = self.get_intersect_matches(method, max_world);
        let mut invalidated = false;
        let mut dispatch_bits = METHOD_SIG_LATEST_WHICH | METHOD_SIG_LATEST_ONLY;
        let mut interferences = (*method.interferences()).clone();
        let mut oldmi: Vec<Arc<MethodInstance>> = Vec::new();
        let mut remaining: &[Arc<Method>] = &shadowed;

        if let Some(old) = &replaced {
            invalidated = true;
            self.method_overwrite(method, old);
            if let Some(old_entry) = self.registry.entry_of(old) {
                old_entry.window().close(max_world);
            }
            self.method_table_invalidate(old, max_world);
            let old_dispatch = old.dispatch_status();
            old.set_dispatch_status(0);
            if old_dispatch & METHOD_SIG_LATEST_ONLY == 0 {
                dispatch_bits &= !METHOD_SIG_LATEST_ONLY;
            }
            interferences.extend_from(&old.interferences());
            old.add_interference(method.id());
            for m2 in &shadowed {
                if in_interferences(old, m2) {
                    m2.add_interference(method.id());
                }
            }
            oldmi.extend(old.specializations());
            remaining = &[];
        } else if !shadowed.is_empty() {
            let morespec: Vec<bool> = shadowed
                .iter()
                .map(|m| oracle.morespecific(m.sig(), sig))
                .collect();
            for (m, &more) in shadowed.iter().zip(&morespec) {
                let ambig = !more && !oracle.morespecific(sig, m.sig());
                let mut m_dispatch = m.dispatch_status();
                if more || ambig {
                    dispatch_bits &= !METHOD_SIG_LATEST_ONLY;
                    interferences.insert(m.id());
                }
                if !more {
                    m_dispatch &= !METHOD_SIG_LATEST_ONLY;
                    m.add_interference(method.id());
                }
                m.set_dispatch_status(m_dispatch);
                if more {
                    continue;
                }
                for mi in m.specializations() {
                    let Some((isect, isect2)) = type_intersection2(oracle, sig, mi.spec_types()) else {
                        continue;
                    };
                    let replaced_dispatch =
                        is_replacing(oracle, ambig, m, &shadowed, &isect, isect2.as_ref(), &morespec);
                    let invalidated_mi = self.invalidate_dispatch_backedges(
                        &mi,
                        sig,
                        m,
                        &shadowed,
                        replaced_dispatch,
                        ambig,
                        max_world,
                        &morespec,
                    );
                    if replaced_dispatch {
                        mi.set_dispatch_status(0);
                        oldmi.push(mi.clone());
                    }
                    if invalidated_mi {
                        self.note_invalidation(|| InvalidationRecord::Instance {
                            instance: mi.clone(),
                            tag: InvalidationTag::MethodInsert,
                        });
                    }
                    invalidated |= invalidated_mi;
                }
            }
        }

        {
            let _cache = self.cache.writelock.lock();
            invalidated |= self.invalidate_typename_backedges(sig, remaining, max_world);
            if !oldmi.is_empty() {
                self.invalidate_mt_cache(sig, &oldmi, max_world);
            }
        }
        if invalidated {
            self.note_invalidation(|| InvalidationRecord::Method {
                method: method.clone(),
                tag: InvalidationTag::MethodInsert,
            });
        }

        entry.window().set_max(WORLD_INFINITY);
        method.set_dispatch_status(dispatch_bits);
        method.set_interferences(interferences);
        debug!(
            target: "meridian::registry",
            signature = %sig,
            world,
            shadowed = shadowed.len(),
            overwrite = replaced.is_some(),
            invalidated,
            "method activated"
        );
    }

    fn call_method_tracer(&self, method: &Arc<Method>) {
        let Some(tracer) = self.method_tracer.read().clone() else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| tracer(method))).is_err() {
            warn!(target: "meridian::registry", method = %method, "method tracer panicked");
        }
    }

    /// Install or clear the callback run after every method activation.
    /// Panics raised by the callback are caught and logged.
    pub fn set_method_tracer(&self, tracer: Option<MethodTracer>) {
        *self.method_tracer.write() = tracer;
    }

    /// Remove `method` from the table as of a new world.
    pub fn remove_method(&self, method: &Arc<Method>) -> DispatchResult<()> {
        let entry = self
            .registry
            .entry_of(method)
            .ok_or_else(|| DispatchError::MethodNotFound(method.to_string()))?;
        let mut world_guard = self.clock.lock();
        if !world_guard.allows_new_worlds() {
            return Err(DispatchError::NewWorldsDisabled);
        }
        if !entry.window().is_open() {
            return Err(DispatchError::AlreadyDisabled(method.to_string()));
        }
        let world = world_guard.current();
        method.set_dispatch_status(0);
        entry.window().set_max(world);
        self.method_table_invalidate(method, world);
        world_guard.publish(world + 1);
        drop(world_guard);
        debug!(target: "meridian::registry", method = %method, last_world = world, "method removed");
        Ok(())
    }

    /// Forbid every further method-table mutation.
    ///
    /// Stored backedges are erased since nothing can invalidate their
    /// callers any more, and new backedges are no longer recorded.
    pub fn disable_new_worlds(&self) {
        self.clock.lock().forbid_new_worlds();
        for method in self.registry.methods() {
            let _guard = method.writelock.lock();
            for mi in method.specializations() {
                mi.take_backedges();
            }
        }
        let _cache = self.cache.writelock.lock();
        self.cache.backedges.lock().clear();
        debug!(target: "meridian::registry", "new worlds disabled");
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The method whose signature is exactly `sig` in `world`.
    pub fn method_lookup_exact(&self, sig: &Ty, world: World) -> Option<Arc<Method>> {
        self.registry
            .defs
            .assoc_by_type(sig, world, false)
            .map(|e| e.payload().clone())
    }

    /// Every method ever added, in definition order, including removed ones.
    pub fn methods(&self) -> Vec<Arc<Method>> {
        self.registry.methods()
    }

    /// Number of methods ever added.
    pub fn method_count(&self) -> usize {
        self.registry.len()
    }

    /// Worlds in which `method` is visible, or `None` if it belongs to
    /// another engine.
    pub fn method_validity(&self, method: &Arc<Method>) -> Option<WorldRange> {
        self.registry.entry_of(method).map(|e| e.window().range())
    }

    /// Largest fixed arity of a method whose first slot names `name`.
    pub fn max_args(&self, name: &TypeName) -> usize {
        self.registry
            .typenames
            .get(name)
            .map_or(0, |info| info.max_args())
    }
}
