//! Method Cache
//!
//! Maps call signatures to the [`MethodInstance`] that handles them.
//!
//! # Entries
//!
//! An entry is filed either under the exact argument tuple in the leaf
//! table, or under a (possibly widened) signature in the signature index.
//! A widened entry carries:
//!
//! - a simple signature that a query must also match, which keeps
//!   `Type{T}` arguments from matching entries built for their kind
//! - guard signatures: more specific methods the widened signature
//!   overlaps; a query matching a guard misses and takes the slow path
//!
//! # Locking
//!
//! Insertions happen under the cache write lock. Lookups never lock. The
//! lock order is world lock, then cache lock, then a method's write lock.

use std::sync::Arc;

use meridian_types::{SparamEnv, Ty, TypeOracle};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use smallvec::SmallVec;
use tracing::debug;

use crate::backedges::TypenameBackedges;
use crate::code::{CodeInstance, Edge};
use crate::engine::Engine;
use crate::index::{IndexEntry, SignatureIndex};
use crate::instance::MethodInstance;
use crate::invalidation::{InvalidationRecord, InvalidationTag};
use crate::matching::MatchOptions;
use crate::method::{METHOD_SIG_LATEST_ONLY, Method};
use crate::world::{WORLD_INFINITY, World, WorldRange};

/// The global dispatch cache.
pub(crate) struct MethodCache {
    pub(crate) index: SignatureIndex<Arc<MethodInstance>>,
    /// Serializes insertions and invalidation of the cache.
    pub(crate) writelock: ReentrantMutex<()>,
    /// Callers depending on signatures that had no method.
    pub(crate) backedges: Mutex<TypenameBackedges>,
}

impl MethodCache {
    pub(crate) fn new(oracle: Arc<dyn TypeOracle>) -> Self {
        Self {
            index: SignatureIndex::new(oracle),
            writelock: ReentrantMutex::new(()),
            backedges: Mutex::new(TypenameBackedges::default()),
        }
    }
}

/// Where [`Engine::cache_method`] files its entry.
pub(crate) enum CacheTarget<'a> {
    /// The global dispatch cache; the guard is the held cache lock, which
    /// is released before the entry is promoted.
    Global(ReentrantMutexGuard<'a, ()>),
    /// The `invoke` cache of one method; callers hold its write lock.
    Invokes(&'a Method),
}

/// Result of an attempt to widen validity to the current world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// The windows were widened.
    Promoted,
    /// Nothing was eligible for promotion.
    Unchanged,
    /// A new world appeared since validation; nothing was changed.
    Stale,
}

/// `Type{T}` elements become their kind and other abstract elements
/// become `Any`. `None` when nothing changes.
fn simple_signature(oracle: &dyn TypeOracle, sig: &Ty) -> Option<Ty> {
    let tuple = sig.as_tuple()?;
    let mut changed = false;
    let elems: Vec<Ty> = tuple
        .elems
        .iter()
        .map(|elt| match elt {
            Ty::TypeOf(inner) => {
                changed = true;
                oracle.kind_of(inner)
            }
            _ if !oracle.is_concrete(elt) => {
                changed = true;
                Ty::Any
            }
            _ => elt.clone(),
        })
        .collect();
    if !changed {
        return None;
    }
    Some(match tuple.vararg.as_deref() {
        Some(tail) => Ty::vararg_tuple(elems, tail.clone()),
        None => Ty::tuple(elems),
    })
}

impl Engine {
    // =========================================================================
    // Insertion
    // =========================================================================

    /// Find or create the instance of `definition` for calls of type `tt`
    /// and file it in `target`.
    ///
    /// The instance may be specialized on a wider compilation signature.
    /// That signature is also used as the cache key when no other method
    /// conflicts with it, or when the conflicts can be fenced off with guard
    /// entries; otherwise the literal `tt` is the key.
    pub(crate) fn cache_method(
        &self,
        target: CacheTarget<'_>,
        tt: &Ty,
        definition: &Arc<Method>,
        world: World,
        range: WorldRange,
        sparams: &SparamEnv,
    ) -> Arc<MethodInstance> {
        let oracle = &*self.oracle;
        let (index, guard) = match target {
            CacheTarget::Global(guard) => (&self.cache.index, Some(guard)),
            CacheTarget::Invokes(method) => (&method.invokes, None),
        };
        let global = guard.is_some();

        if global {
            if let Some(entry) = index.lookup_leaf(tt, world) {
                return entry.payload().clone();
            }
        }
        if let Some(entry) = index.assoc_by_type(tt, world, true) {
            return entry.payload().clone();
        }

        let mut cache_with_orig = true;
        let mut compilationsig = tt.clone();
        if let Some(widened) = self.widened_sig(tt, sparams, definition) {
            let (ti, env) = oracle.intersect_with_env(&widened, definition.sig());
            debug_assert!(!ti.is_bottom());
            if !ti.is_bottom() && env == *sparams {
                cache_with_orig = !oracle.is_subtype(&widened, definition.sig());
                compilationsig = widened;
            }
        }

        let newmeth = definition.specialization(oracle, &compilationsig, sparams);
        if newmeth.cache_with_orig() {
            cache_with_orig = true;
        }

        // Captured before any lookup so a racing world bump is detected.
        let current_world = if global {
            self.clock.current()
        } else {
            WORLD_INFINITY
        };

        let mut valid = range;
        let mut cachett = tt.clone();
        let mut guardsigs: Vec<Ty> = Vec::new();
        if global && !cache_with_orig {
            let limit = self.config.max_unspecialized_conflicts;
            let opts = MatchOptions {
                limit: Some(limit),
                include_ambiguous: true,
                intersections: true,
                cache_result: false,
                want_ambiguity: false,
            };
            let mut range2 = WorldRange::ALL;
            match self.ml_matches(&compilationsig, opts, world, &mut range2) {
                None => cache_with_orig = true,
                Some(set) => {
                    let mut guards = 0usize;
                    for matc in &set.matches {
                        if Arc::ptr_eq(&matc.method, definition) {
                            continue;
                        }
                        // A guard that needs type variables to be told apart
                        // from the widened signature cannot be expressed.
                        if matc.sparams.has_unmatched() || guards > limit {
                            cache_with_orig = true;
                            break;
                        }
                        guards += 1;
                    }
                    if !cache_with_orig && guards > 0 {
                        guardsigs = set
                            .matches
                            .iter()
                            .filter(|m| !Arc::ptr_eq(&m.method, definition))
                            .map(|m| m.spec_types.clone())
                            .collect();
                    }
                }
            }
            if cache_with_orig {
                newmeth.set_cache_with_orig();
            } else {
                valid = range2;
                cachett = compilationsig.clone();
            }
        }

        let unconstrained_max = valid.max == WORLD_INFINITY;
        valid.max = valid.max.min(current_world);

        let simplett = simple_signature(oracle, &cachett);

        if cachett != *tt {
            if let Some(entry) = index.assoc_by_type(&cachett, world, true) {
                if entry.simplesig() == simplett.as_ref() && entry.guardsigs() == guardsigs.as_slice() {
                    return entry.payload().clone();
                }
            }
        }

        debug!(
            target: "meridian::cache",
            signature = %tt,
            cached_as = %cachett,
            widened = cachett != *tt,
            guards = guardsigs.len(),
            "cached method instance"
        );

        let leaf = global && cachett == *tt && guardsigs.is_empty() && !tt.has_free_typevars();
        let no_guards = guardsigs.is_empty();
        let entry = IndexEntry::new(cachett, newmeth.clone(), valid.min, valid.max)
            .with_simplesig(simplett)
            .with_guardsigs(guardsigs);
        let entry = if leaf {
            index.insert_leaf(tt.clone(), entry)
        } else {
            let entry = index.insert(entry);
            if global {
                if let Some(Ty::Named(name)) = tt.slot(0) {
                    self.registry.typename(name).bump_cache_entry_count();
                }
            }
            entry
        };

        if let Some(guard) = guard {
            drop(guard);
            let should_set_dispatch_status = !definition.is_latest_only()
                && !cache_with_orig
                && no_guards
                && valid.min == definition.primary_world()
                && !newmeth.is_latest_only();
            if (should_set_dispatch_status || unconstrained_max) && self.clock.current() == current_world {
                let world_guard = self.clock.lock();
                if world_guard.current() == current_world {
                    if should_set_dispatch_status {
                        newmeth.set_dispatch_status(METHOD_SIG_LATEST_ONLY);
                    }
                    if unconstrained_max {
                        entry.window().set_max(WORLD_INFINITY);
                    }
                }
            }
        }
        newmeth
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Cache entry answering `tt` in `world`, without taking the slow path.
    pub(crate) fn find_cache_entry(&self, tt: &Ty, world: World) -> Option<Arc<IndexEntry<Arc<MethodInstance>>>> {
        if self.oracle.is_dispatch_tuple(tt) {
            if let Some(entry) = self.cache.index.lookup_leaf(tt, world) {
                return Some(entry);
            }
        }
        self.cache.index.assoc_by_type(tt, world, true)
    }

    /// The instance handling calls of type `tt` in `world`, resolving and
    /// caching it on a miss. `None` when no unique method applies.
    pub(crate) fn mt_assoc_by_type(&self, tt: &Ty, world: World) -> Option<Arc<MethodInstance>> {
        if let Some(entry) = self.find_cache_entry(tt, world) {
            return Some(entry.payload().clone());
        }
        self.stats.record_slow_lookup();
        let guard = self.cache.writelock.lock();
        if let Some(entry) = self.find_cache_entry(tt, world) {
            return Some(entry.payload().clone());
        }
        let mut range = WorldRange::ALL;
        let matc = self.gf_invoke_lookup(tt, world, false, &mut range)?;
        Some(self.cache_method(
            CacheTarget::Global(guard),
            tt,
            &matc.method,
            world,
            range,
            &matc.sparams,
        ))
    }

    /// The instance of `method` handling an `invoke` with argument types
    /// `tt`, from the method's own invoke cache.
    pub(crate) fn invoke_cache_lookup(&self, method: &Arc<Method>, tt: &Ty) -> Arc<MethodInstance> {
        if let Some(entry) = method.invokes.assoc_by_type(tt, 1, true) {
            return entry.payload().clone();
        }
        let _guard = method.writelock.lock();
        if let Some(entry) = method.invokes.assoc_by_type(tt, 1, true) {
            return entry.payload().clone();
        }
        let sparams = if method.sig().has_free_typevars() {
            self.oracle.intersect_with_env(tt, method.sig()).1
        } else {
            SparamEnv::new()
        };
        self.cache_method(
            CacheTarget::Invokes(method),
            tt,
            method,
            1,
            WorldRange::ALL,
            &sparams,
        )
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Close the cache entries that resolved to one of `oldmi` but that the
    /// new method `new_sig` may now take over, and empty the leaf table.
    /// Callers hold the cache lock.
    pub(crate) fn invalidate_mt_cache(&self, new_sig: &Ty, oldmi: &[Arc<MethodInstance>], max_world: World) {
        let oracle = &*self.oracle;
        let mut logged: SmallVec<[Arc<MethodInstance>; 4]> = SmallVec::new();
        self.cache.index.for_each(|entry| {
            if !entry.window().is_open() {
                return true;
            }
            let mi = entry.payload();
            if !oldmi.iter().any(|old| Arc::ptr_eq(old, mi)) {
                return true;
            }
            let mut intersects = true;
            if *entry.sig() != *mi.spec_types() {
                // The entry may be narrower than the instance.
                intersects = !oracle.has_empty_intersection(entry.sig(), new_sig);
            }
            if intersects && entry.guardsigs().iter().any(|g| oracle.is_subtype(new_sig, g)) {
                // Already fenced off by a guard.
                intersects = false;
            }
            if intersects {
                self.note_invalidation(|| InvalidationRecord::Instance {
                    instance: mi.clone(),
                    tag: InvalidationTag::DispatchCache,
                });
                logged.push(mi.clone());
                entry.window().close(max_world);
            }
            true
        });
        // Leaf entries are all dropped; only report the ones resolving to `oldmi`.
        self.cache.index.for_each_leaf(|entry| {
            let mi = entry.payload();
            if !entry.window().is_open()
                || !oldmi.iter().any(|old| Arc::ptr_eq(old, mi))
                || logged.iter().any(|seen| Arc::ptr_eq(seen, mi))
            {
                return;
            }
            self.note_invalidation(|| InvalidationRecord::Instance {
                instance: mi.clone(),
                tag: InvalidationTag::DispatchCache,
            });
            logged.push(mi.clone());
        });
        self.cache.index.drop_leaf_table(max_world);
    }

    /// Close every cache entry resolving to `replaced`. Callers hold the
    /// cache lock.
    pub(crate) fn disable_mt_cache(&self, replaced: &Arc<Method>, max_world: World) {
        self.cache.index.for_each(|entry| {
            if Arc::ptr_eq(entry.payload().method(), replaced) {
                entry.window().close(max_world);
            }
            true
        });
        self.cache.index.for_each_leaf(|entry| {
            if Arc::ptr_eq(entry.payload().method(), replaced) {
                entry.window().close(max_world);
            }
        });
    }

    // =========================================================================
    // Backedges
    // =========================================================================

    /// Record that `caller` depends on calls (or an `invoke` of
    /// `invokesig`) resolving to `callee`.
    pub fn add_instance_backedge(&self, callee: &Arc<MethodInstance>, invokesig: Option<&Ty>, caller: &Arc<CodeInstance>) {
        if !self.clock.allows_new_worlds() {
            return;
        }
        let _guard = callee.method().writelock.lock();
        if self.clock.allows_new_worlds() {
            callee.push_backedge(invokesig.cloned(), caller.clone());
        }
    }

    /// Record that `caller` depends on `typ` having no applicable method.
    pub fn add_method_table_backedge(&self, typ: &Ty, caller: &Arc<CodeInstance>) {
        if !self.clock.allows_new_worlds() {
            return;
        }
        let _guard = self.cache.writelock.lock();
        if self.clock.allows_new_worlds() {
            self.cache.backedges.lock().add(&*self.oracle, typ, caller);
        }
    }

    /// Register `caller` as a dependent of every forward edge it records.
    pub(crate) fn store_backedges(&self, caller: &Arc<CodeInstance>) {
        for edge in caller.edges().iter() {
            match edge {
                Edge::Instance(callee) => self.add_instance_backedge(callee, None, caller),
                Edge::Invoke { sig, target } => self.add_instance_backedge(target, Some(sig), caller),
                Edge::Code(callee) => self.add_instance_backedge(callee.def(), None, caller),
                Edge::Unresolved(sig) => self.add_method_table_backedge(sig, caller),
            }
        }
    }

    // =========================================================================
    // Promotion
    // =========================================================================

    /// Widen code instances validated in `validated_world`, and the code
    /// they were built from, to every later world.
    ///
    /// Abandoned if any world was created after `validated_world`.
    pub fn promote_to_current(&self, cis: &[Arc<CodeInstance>], validated_world: World) -> PromoteOutcome {
        if self.clock.current() > validated_world {
            self.stats.record_abandoned_promotion();
            return PromoteOutcome::Stale;
        }
        let world_guard = self.clock.lock();
        if world_guard.current() != validated_world {
            self.stats.record_abandoned_promotion();
            return PromoteOutcome::Stale;
        }
        let mut promoted = false;
        let mut work: Vec<Arc<CodeInstance>> = cis.iter().rev().cloned().collect();
        while let Some(ci) = work.pop() {
            if !ci.promote_from(validated_world) {
                continue;
            }
            promoted = true;
            for edge in ci.edges().iter().rev() {
                if let Edge::Code(dep) = edge {
                    work.push(dep.clone());
                }
            }
        }
        drop(world_guard);
        if promoted {
            self.stats.record_promotion();
            PromoteOutcome::Promoted
        } else {
            PromoteOutcome::Unchanged
        }
    }

    /// Mark `mi` as the unique answer for every call matching it, if its
    /// method is not already and `mi` was valid since the method appeared.
    pub fn promote_instance_to_current(
        &self,
        mi: &Arc<MethodInstance>,
        min_world: World,
        validated_world: World,
    ) -> PromoteOutcome {
        if self.clock.current() > validated_world {
            self.stats.record_abandoned_promotion();
            return PromoteOutcome::Stale;
        }
        let def = mi.method();
        if def.is_latest_only() || min_world != def.primary_world() || mi.is_latest_only() {
            return PromoteOutcome::Unchanged;
        }
        let world_guard = self.clock.lock();
        if world_guard.current() != validated_world {
            self.stats.record_abandoned_promotion();
            return PromoteOutcome::Stale;
        }
        mi.set_dispatch_status(METHOD_SIG_LATEST_ONLY);
        self.stats.record_promotion();
        PromoteOutcome::Promoted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CacheOwner;
    use crate::method::{MethodBody, MethodDefinition};
    use crate::testing::engine;
    use meridian_types::{FunctionRef, TypeLattice};

    fn def(f: &FunctionRef, params: &[&str]) -> MethodDefinition {
        MethodDefinition::new(
            f,
            params.iter().map(|p| match *p {
                "Any" => Ty::Any,
                n => Ty::named(n),
            }),
            MethodBody::new(()),
        )
    }

    fn int() -> Ty {
        Ty::named("Int64")
    }

    fn code_for(mi: &Arc<MethodInstance>, min: World, max: World, edges: Vec<Edge>) -> Arc<CodeInstance> {
        let ci = Arc::new(CodeInstance::new(mi.clone(), CacheOwner::Native, Ty::Any, min, max, edges));
        mi.cache_insert(ci.clone());
        ci
    }

    #[test]
    fn test_simple_signature() {
        let l = TypeLattice::with_builtins();
        let concrete = Ty::tuple([int(), Ty::named("String")]);
        assert_eq!(simple_signature(&l, &concrete), None);
        let mixed = Ty::tuple([int(), Ty::type_of(int()), Ty::named("Number")]);
        assert_eq!(
            simple_signature(&l, &mixed),
            Some(Ty::tuple([int(), Ty::named("DataType"), Ty::Any]))
        );
    }

    // =========================================================================
    // Insertion Tests
    // =========================================================================

    #[test]
    fn test_literal_signature_uses_leaf_table() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        engine.add_method(def(&f, &["Int64"])).unwrap();
        let tt = f.signature([int()]);
        let mi = engine.mt_assoc_by_type(&tt, engine.world()).unwrap();
        assert_eq!(*mi.spec_types(), tt);
        assert_eq!(engine.cache.index.leaf_len(), 1);
        let entry = engine.cache.index.lookup_leaf(&tt, engine.world()).unwrap();
        assert!(entry.window().is_open());
        let again = engine.mt_assoc_by_type(&tt, engine.world()).unwrap();
        assert!(Arc::ptr_eq(&mi, &again));
    }

    #[test]
    fn test_nospecialize_shares_one_instance() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        engine.add_method(def(&f, &["Number"]).nospecialize(1)).unwrap();
        let world = engine.world();
        let a = engine.mt_assoc_by_type(&f.signature([int()]), world).unwrap();
        let b = engine.mt_assoc_by_type(&f.signature([Ty::named("Float64")]), world).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*a.spec_types(), f.signature([Ty::named("Number")]));
        assert_eq!(engine.cache.index.len(), 1);
    }

    #[test]
    fn test_guard_keeps_specific_method_reachable() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        let general = engine.add_method(def(&f, &["Number"]).nospecialize(1)).unwrap();
        let specific = engine.add_method(def(&f, &["Int64"])).unwrap();
        let world = engine.world();

        let float = engine.mt_assoc_by_type(&f.signature([Ty::named("Float64")]), world).unwrap();
        assert!(Arc::ptr_eq(float.method(), &general));
        let entry = engine
            .cache
            .index
            .assoc_by_type(&f.signature([Ty::named("Float64")]), world, true)
            .unwrap();
        assert_eq!(entry.guardsigs(), [f.signature([int()])]);

        let mi = engine.mt_assoc_by_type(&f.signature([int()]), world).unwrap();
        assert!(Arc::ptr_eq(mi.method(), &specific));
    }

    #[test]
    fn test_no_method_is_not_cached() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        engine.add_method(def(&f, &["String"])).unwrap();
        assert!(engine.mt_assoc_by_type(&f.signature([int()]), engine.world()).is_none());
        assert!(engine.cache.index.is_empty() && engine.cache.index.leaf_is_empty());
    }

    // =========================================================================
    // Invalidation Tests
    // =========================================================================

    #[test]
    fn test_new_method_closes_stale_entries() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        let general = engine.add_method(def(&f, &["Number"])).unwrap();
        let tt = f.signature([int()]);
        let before = engine.world();
        let old = engine.mt_assoc_by_type(&tt, before).unwrap();
        assert!(Arc::ptr_eq(old.method(), &general));

        let specific = engine.add_method(def(&f, &["Int64"])).unwrap();
        assert!(engine.cache.index.leaf_is_empty());
        let new = engine.mt_assoc_by_type(&tt, engine.world()).unwrap();
        assert!(Arc::ptr_eq(new.method(), &specific));
        let past = engine.mt_assoc_by_type(&tt, before).unwrap();
        assert!(Arc::ptr_eq(past.method(), &general));
    }

    #[test]
    fn test_dropped_leaf_entry_is_logged_once() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        engine.add_method(def(&f, &["Number"])).unwrap();
        let tt = f.signature([int()]);
        let old = engine.mt_assoc_by_type(&tt, engine.world()).unwrap();
        assert_eq!(engine.cache.index.leaf_len(), 1);
        engine.debug_invalidation_log(true);

        engine.add_method(def(&f, &["Int64"])).unwrap();
        let records: Vec<_> = engine
            .invalidation_log()
            .take()
            .into_iter()
            .filter(|r| r.tag() == Some(InvalidationTag::DispatchCache))
            .collect();
        assert_eq!(records.len(), 1);
        assert!(matches!(&records[0], InvalidationRecord::Instance { instance, .. } if Arc::ptr_eq(instance, &old)));
    }

    #[test]
    fn test_removed_method_entries_close() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        let m = engine.add_method(def(&f, &["Int64"])).unwrap();
        let tt = f.signature([int()]);
        engine.mt_assoc_by_type(&tt, engine.world()).unwrap();
        engine.remove_method(&m).unwrap();
        assert!(engine.mt_assoc_by_type(&tt, engine.world()).is_none());
    }

    // =========================================================================
    // Backedge and Promotion Tests
    // =========================================================================

    #[test]
    fn test_backedges_ignored_after_disable() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        engine.add_method(def(&f, &["Int64"])).unwrap();
        let mi = engine.mt_assoc_by_type(&f.signature([int()]), engine.world()).unwrap();
        let caller = code_for(&mi, 1, WORLD_INFINITY, Vec::new());
        engine.add_instance_backedge(&mi, None, &caller);
        assert_eq!(mi.backedge_count(), 1);
        engine.disable_new_worlds();
        assert_eq!(mi.backedge_count(), 0);
        engine.add_instance_backedge(&mi, None, &caller);
        engine.add_method_table_backedge(&f.signature([Ty::named("String")]), &caller);
        assert_eq!(mi.backedge_count(), 0);
        assert_eq!(engine.cache.backedges.lock().len(), 0);
    }

    #[test]
    fn test_promote_follows_code_edges() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        engine.add_method(def(&f, &["Int64"])).unwrap();
        let world = engine.world();
        let mi = engine.mt_assoc_by_type(&f.signature([int()]), world).unwrap();
        let callee = code_for(&mi, 1, world, Vec::new());
        let caller = code_for(&mi, 1, world, vec![Edge::Code(callee.clone())]);
        assert_eq!(engine.promote_to_current(&[caller.clone()], world), PromoteOutcome::Promoted);
        assert_eq!(caller.max_world(), WORLD_INFINITY);
        assert_eq!(callee.max_world(), WORLD_INFINITY);
        assert_eq!(engine.promote_to_current(&[caller], world), PromoteOutcome::Unchanged);
    }

    #[test]
    fn test_promote_abandoned_after_new_world() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        engine.add_method(def(&f, &["Int64"])).unwrap();
        let world = engine.world();
        let mi = engine.mt_assoc_by_type(&f.signature([int()]), world).unwrap();
        let ci = code_for(&mi, 1, world, Vec::new());
        engine.add_method(def(&f, &["String"])).unwrap();
        assert_eq!(engine.promote_to_current(&[ci.clone()], world), PromoteOutcome::Stale);
        assert_eq!(ci.max_world(), world);
        assert_eq!(engine.stats().abandoned_promotions, 1);
    }

    #[test]
    fn test_promote_instance_requires_primary_world() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        let a = engine.add_method(def(&f, &["Int64", "Any"])).unwrap();
        engine.add_method(def(&f, &["Any", "Int64"])).unwrap();
        assert!(!a.is_latest_only());
        let world = engine.world();
        let mi = a.specialization(&*lattice, &f.signature([int(), Ty::named("String")]), &SparamEnv::new());
        assert_eq!(
            engine.promote_instance_to_current(&mi, a.primary_world() + 1, world),
            PromoteOutcome::Unchanged
        );
        assert_eq!(
            engine.promote_instance_to_current(&mi, a.primary_world(), world),
            PromoteOutcome::Promoted
        );
        assert!(mi.is_latest_only());
    }
}
