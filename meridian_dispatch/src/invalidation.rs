//! Invalidation
//!
//! When the method table changes, compiled code whose assumptions no longer
//! hold has its validity window clipped to the last world in which those
//! assumptions were true. The walk follows backedges from the changed
//! instances to their callers, transitively.
//!
//! # Walk Order
//!
//! The walk is a depth-first preorder over callers. It is driven by an
//! explicit worklist so deep caller chains cannot exhaust the native stack.
//! Backedges are consumed as they are followed, and a code instance whose
//! window is already closed ends its branch, so every instance is visited at
//! most once per event even when the dependency graph has cycles.
//!
//! # Debug Log
//!
//! With the debug log enabled, every step of the walk is recorded in the
//! order it happens, tagged with either its depth or the location that
//! started it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use meridian_types::{Ty, TypeOracle};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::backedges::foreach_top_typename;
use crate::code::CodeInstance;
use crate::engine::Engine;
use crate::error::invariant_violation;
use crate::instance::MethodInstance;
use crate::method::Method;
use crate::trace::TraceEvent;
use crate::world::{WORLD_INFINITY, World};

// =============================================================================
// Records
// =============================================================================

/// Where an invalidation event started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationTag {
    /// A new method took over dispatch for an instance.
    MethodInsert,
    /// A method was removed or overwritten.
    MethodDisable,
    /// A dispatch cache entry was dropped.
    DispatchCache,
    /// A call that previously had no method now has one.
    MissingBackedge,
}

impl InvalidationTag {
    pub fn as_str(self) -> &'static str {
        match self {
            InvalidationTag::MethodInsert => "method_insert",
            InvalidationTag::MethodDisable => "method_disable",
            InvalidationTag::DispatchCache => "dispatch_cache",
            InvalidationTag::MissingBackedge => "missing_backedge",
        }
    }
}

impl fmt::Display for InvalidationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of an invalidation walk.
#[derive(Clone)]
pub enum InvalidationRecord {
    /// Code of `instance` was reached at `depth` (0 for unresolved-call
    /// edges, 1 for direct callers of a changed instance).
    Code {
        instance: Arc<MethodInstance>,
        depth: u32,
    },
    /// The callers of `instance` were invalidated.
    Instance {
        instance: Arc<MethodInstance>,
        tag: InvalidationTag,
    },
    /// An event concerning a whole method.
    Method {
        method: Arc<Method>,
        tag: InvalidationTag,
    },
    /// An unresolved call signature gained a method.
    Signature { signature: Ty, tag: InvalidationTag },
}

impl InvalidationRecord {
    /// The signature this record is about.
    pub fn signature(&self) -> Ty {
        match self {
            InvalidationRecord::Code { instance, .. }
            | InvalidationRecord::Instance { instance, .. } => instance.spec_types().clone(),
            InvalidationRecord::Method { method, .. } => method.sig().clone(),
            InvalidationRecord::Signature { signature, .. } => signature.clone(),
        }
    }

    /// The location tag, if this record carries one.
    pub fn tag(&self) -> Option<InvalidationTag> {
        match self {
            InvalidationRecord::Code { .. } => None,
            InvalidationRecord::Instance { tag, .. }
            | InvalidationRecord::Method { tag, .. }
            | InvalidationRecord::Signature { tag, .. } => Some(*tag),
        }
    }

    /// The depth, for code records.
    pub fn depth(&self) -> Option<u32> {
        match self {
            InvalidationRecord::Code { depth, .. } => Some(*depth),
            _ => None,
        }
    }
}

impl fmt::Debug for InvalidationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationRecord::Code { instance, depth } => {
                write!(f, "Code({}, {depth})", instance.spec_types())
            }
            InvalidationRecord::Instance { instance, tag } => {
                write!(f, "Instance({}, {tag})", instance.spec_types())
            }
            InvalidationRecord::Method { method, tag } => write!(f, "Method({}, {tag})", method.sig()),
            InvalidationRecord::Signature { signature, tag } => write!(f, "Signature({signature}, {tag})"),
        }
    }
}

/// The ordered invalidation debug log.
#[derive(Debug, Default)]
pub struct InvalidationLog {
    enabled: AtomicBool,
    records: Mutex<Vec<InvalidationRecord>>,
}

impl InvalidationLog {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            records: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable or disable recording. Disabling discards what was recorded.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.records.lock().clear();
        }
    }

    pub(crate) fn push(&self, record: InvalidationRecord) {
        self.records.lock().push(record);
    }

    /// Copy of the records so far.
    pub fn records(&self) -> Vec<InvalidationRecord> {
        self.records.lock().clone()
    }

    /// Remove and return the records so far.
    pub fn take(&self) -> Vec<InvalidationRecord> {
        std::mem::take(&mut *self.records.lock())
    }
}

// =============================================================================
// Intersection Helpers
// =============================================================================

/// Intersection of `t1` and `t2`, computed from both sides.
///
/// Intersection is not always symmetric for types with free variables or
/// unions, so when neither side contains the other the reverse intersection
/// is returned as well, unless it is identical. `None` means the types are
/// disjoint.
pub(crate) fn type_intersection2(oracle: &dyn TypeOracle, t1: &Ty, t2: &Ty) -> Option<(Ty, Option<Ty>)> {
    let isect = oracle.intersect(t1, t2);
    if isect.is_bottom() {
        return None;
    }
    if oracle.is_subtype(t1, t2) || t1.has_free_typevars() || t2.has_free_typevars() {
        return Some((isect, None));
    }
    let isect2 = oracle.intersect(t2, t1);
    if isect2.is_bottom() {
        return None;
    }
    if oracle.types_equal(&isect, &isect2) {
        return Some((isect, None));
    }
    Some((isect, Some(isect2)))
}

fn covered_by(oracle: &dyn TypeOracle, isect: &Ty, isect2: Option<&Ty>, sig: &Ty) -> bool {
    oracle.is_subtype(isect, sig) || isect2.is_some_and(|i2| oracle.is_subtype(i2, sig))
}

/// Whether adding `new_sig` takes dispatch over the intersection away from
/// `m`, given the other methods `shadowed` that already matched it.
///
/// `morespec[k]` records whether `shadowed[k]` is more specific than the new
/// signature; `ambig` whether `m` and the new signature are ambiguous.
pub(crate) fn is_replacing(
    oracle: &dyn TypeOracle,
    ambig: bool,
    m: &Method,
    shadowed: &[Arc<Method>],
    isect: &Ty,
    isect2: Option<&Ty>,
    morespec: &[bool],
) -> bool {
    for (m2, &more) in shadowed.iter().zip(morespec) {
        if m2.id() == m.id() || !covered_by(oracle, isect, isect2, m2.sig()) {
            continue;
        }
        if more {
            return false;
        }
        if ambig && !oracle.morespecific(m.sig(), m2.sig()) {
            return false;
        }
    }
    true
}

// =============================================================================
// Invalidation Walk
// =============================================================================

impl Engine {
    /// Record a step of an invalidation walk in the debug log and the trace
    /// sinks. `make` only runs when someone is listening.
    pub(crate) fn note_invalidation(&self, make: impl FnOnce() -> InvalidationRecord) {
        let logging = self.invalidation_log.is_enabled();
        let tracing = self.trace.has_sinks();
        if !logging && !tracing {
            return;
        }
        let record = make();
        if tracing {
            self.trace.emit(&TraceEvent::Invalidated(record.clone()));
        }
        if logging {
            self.invalidation_log.push(record);
        }
    }

    /// Clip `root` and, transitively, every caller depending on it to
    /// `max_world`.
    pub(crate) fn invalidate_code_instance_at(&self, root: &Arc<CodeInstance>, max_world: World, depth: u32) {
        let mut work = vec![(root.clone(), depth)];
        while let Some((ci, depth)) = work.pop() {
            let mi = ci.def().clone();
            self.note_invalidation(|| InvalidationRecord::Code {
                instance: mi.clone(),
                depth,
            });
            let callers = {
                let _guard = mi.method().writelock.lock();
                let current = ci.max_world();
                if current == WORLD_INFINITY {
                    if ci.min_world().saturating_sub(1) > max_world {
                        invariant_violation(
                            "invalidation window precedes code instance",
                            (mi.spec_types(), ci.min_world(), max_world),
                        );
                    }
                    ci.close_window(max_world);
                    self.stats.record_invalidation();
                    trace!(
                        target: "meridian::invalidation",
                        signature = %mi.spec_types(),
                        depth,
                        max_world,
                        "invalidated code instance"
                    );
                    mi.drain_backedges_where(|edge| edge.caller.depends_on(&mi, &ci))
                } else {
                    debug_assert!(current <= max_world, "invalidation would widen a window");
                    Vec::new()
                }
            };
            work.extend(callers.into_iter().rev().map(|caller| (caller, depth + 1)));
        }
    }

    /// Invalidate every caller of `mi` and reset its dispatch status.
    pub(crate) fn invalidate_backedges(&self, mi: &Arc<MethodInstance>, max_world: World, tag: Option<InvalidationTag>) {
        let edges = {
            let _guard = mi.method().writelock.lock();
            mi.take_backedges()
        };
        for edge in edges {
            self.invalidate_code_instance_at(&edge.caller, max_world, 1);
        }
        if let Some(tag) = tag {
            self.note_invalidation(|| InvalidationRecord::Instance {
                instance: mi.clone(),
                tag,
            });
        }
        mi.set_dispatch_status(0);
    }

    /// Invalidate the callers of `mi` whose call now dispatches to the new
    /// method `new_sig`. Returns true if any caller was invalidated.
    ///
    /// Plain call edges follow `replaced_dispatch`. Invoke edges are checked
    /// individually, since an `invoke` of an explicit signature is only
    /// affected when the new method covers that signature.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn invalidate_dispatch_backedges(
        &self,
        mi: &Arc<MethodInstance>,
        new_sig: &Ty,
        m: &Method,
        shadowed: &[Arc<Method>],
        replaced_dispatch: bool,
        ambig: bool,
        max_world: World,
        morespec: &[bool],
    ) -> bool {
        let oracle = &*self.oracle;
        let replaced = {
            let _guard = mi.method().writelock.lock();
            mi.drain_backedges_where(|edge| match &edge.invokesig {
                Some(invokesig) => {
                    let caller_sig = edge.caller.def().method().sig();
                    if oracle.types_equal(invokesig, caller_sig) {
                        false
                    } else {
                        oracle.is_subtype(invokesig, new_sig)
                            && is_replacing(oracle, ambig, m, shadowed, invokesig, None, morespec)
                    }
                }
                None => replaced_dispatch,
            })
        };
        let any = !replaced.is_empty();
        for caller in replaced {
            self.invalidate_code_instance_at(&caller, max_world, 1);
        }
        any
    }

    /// Invalidate everything that depends on `replaced`, which is being
    /// removed from the table, and drop its dispatch cache entries.
    pub(crate) fn method_table_invalidate(&self, replaced: &Arc<Method>, max_world: World) {
        let mut invalidated = false;
        for mi in replaced.specializations() {
            invalidated = true;
            self.invalidate_backedges(&mi, max_world, Some(InvalidationTag::MethodDisable));
        }
        {
            let _cache = self.cache.writelock.lock();
            self.disable_mt_cache(replaced, max_world);
        }
        if invalidated {
            self.note_invalidation(|| InvalidationRecord::Method {
                method: replaced.clone(),
                tag: InvalidationTag::MethodDisable,
            });
        }
        debug!(
            target: "meridian::invalidation",
            method = %replaced,
            max_world,
            "method removed from dispatch"
        );
    }

    /// Invalidate callers that depend on a signature staying unmatched when
    /// the new method `new_sig` now matches part of it. Callers hold the
    /// cache lock. Returns true if any caller was invalidated.
    pub(crate) fn invalidate_typename_backedges(
        &self,
        new_sig: &Ty,
        shadowed: &[Arc<Method>],
        max_world: World,
    ) -> bool {
        let oracle = &*self.oracle;
        let mut names = Vec::new();
        let exact = foreach_top_typename(oracle, new_sig, true, |name, _| names.push(name.clone()));
        if !exact {
            names = self.cache.backedges.lock().keys();
        }
        let mut invalidated = false;
        for name in names {
            let removed = self.cache.backedges.lock().drain_where(&name, |typ| {
                let Some((isect, isect2)) = type_intersection2(oracle, typ, new_sig) else {
                    return false;
                };
                !shadowed.iter().any(|m| {
                    covered_by(oracle, &isect, isect2.as_ref(), m.sig())
                        && !oracle.morespecific(new_sig, m.sig())
                })
            });
            for (typ, caller) in removed {
                self.invalidate_code_instance_at(&caller, max_world, 0);
                invalidated = true;
                self.note_invalidation(|| InvalidationRecord::Signature {
                    signature: typ,
                    tag: InvalidationTag::MissingBackedge,
                });
            }
        }
        invalidated
    }

    // =========================================================================
    // Public Entry Points
    // =========================================================================

    /// Invalidate the code of `mi` and everything that depends on it as of
    /// `max_world`.
    ///
    /// Open code instances of `mi` are clipped to `max_world`, their callers
    /// transitively with them, and the dispatch status of `mi` is reset.
    pub fn invalidate(&self, mi: &Arc<MethodInstance>, max_world: World) {
        for ci in mi.code_instances() {
            if ci.max_world() == WORLD_INFINITY {
                self.invalidate_code_instance_at(&ci, max_world, 1);
            }
        }
        self.invalidate_backedges(mi, max_world, None);
    }

    /// Clip `ci` and every caller depending on it to `max_world`.
    pub fn invalidate_code_instance(&self, ci: &Arc<CodeInstance>, max_world: World) {
        self.invalidate_code_instance_at(ci, max_world, 1);
    }

    /// Turn the invalidation debug log on or off. Turning it off discards
    /// the records collected so far.
    pub fn debug_invalidation_log(&self, enable: bool) {
        self.invalidation_log.set_enabled(enable);
    }

    /// The invalidation debug log.
    pub fn invalidation_log(&self) -> &InvalidationLog {
        &self.invalidation_log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_types::TypeLattice;

    fn sig(params: &[Ty]) -> Ty {
        Ty::tuple(std::iter::once(Ty::named("typeof(f)")).chain(params.iter().cloned()))
    }

    #[test]
    fn test_intersection2_disjoint() {
        let l = TypeLattice::with_builtins();
        let a = sig(&[Ty::named("Int64")]);
        let b = sig(&[Ty::named("String")]);
        assert!(type_intersection2(&l, &a, &b).is_none());
    }

    #[test]
    fn test_intersection2_subtype_is_one_sided() {
        let l = TypeLattice::with_builtins();
        let a = sig(&[Ty::named("Int64")]);
        let b = sig(&[Ty::named("Number")]);
        let (isect, isect2) = type_intersection2(&l, &a, &b).unwrap();
        assert_eq!(isect, a);
        assert!(isect2.is_none());
    }

    #[test]
    fn test_intersection2_symmetric_result_collapses() {
        let l = TypeLattice::with_builtins();
        let a = sig(&[Ty::named("Int64"), Ty::Any]);
        let b = sig(&[Ty::Any, Ty::named("Int64")]);
        let (isect, isect2) = type_intersection2(&l, &a, &b).unwrap();
        assert_eq!(isect, sig(&[Ty::named("Int64"), Ty::named("Int64")]));
        assert!(isect2.is_none());
    }

    #[test]
    fn test_tags_render_snake_case() {
        assert_eq!(InvalidationTag::MethodInsert.to_string(), "method_insert");
        assert_eq!(InvalidationTag::MissingBackedge.as_str(), "missing_backedge");
    }

    #[test]
    fn test_log_disable_discards() {
        let log = InvalidationLog::new(true);
        log.push(InvalidationRecord::Signature {
            signature: Ty::Any,
            tag: InvalidationTag::DispatchCache,
        });
        assert_eq!(log.records().len(), 1);
        log.set_enabled(false);
        assert!(log.records().is_empty());
        assert!(!log.is_enabled());
    }
}
