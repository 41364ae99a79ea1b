//! Call-Site Cache
//!
//! The first level of dispatch: a small table indexed by call-site hash,
//! consulted before any signature lookup.
//!
//! # Probing
//!
//! A call site probes four slots, each derived from a different byte range
//! of its hash so that two sites rarely collide in all of them. A slot
//! answers when its entry's signature matches the runtime types of the
//! arguments exactly and its window contains the world.
//!
//! # Filling
//!
//! Only exact signatures with no simple signature and no guards may be
//! stored, since a slot hit checks nothing else. The slot to overwrite
//! rotates per call site; the rotation counter is deliberately racy.
//!
//! Slots are never cleared: an invalidated entry's window is closed, so it
//! stops answering on its own.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use arc_swap::ArcSwapOption;
use meridian_types::{Ty, Value, builtin};
use rustc_hash::FxHasher;
use smallvec::SmallVec;

use crate::engine::Engine;
use crate::error::{DispatchError, DispatchResult};
use crate::index::IndexEntry;
use crate::instance::MethodInstance;
use crate::matching::LookupResult;
use crate::trace::TraceEvent;
use crate::world::World;

type CacheEntry = Arc<IndexEntry<Arc<MethodInstance>>>;

/// Fixed-size table of recently used exact cache entries.
pub(crate) struct CallCache {
    slots: Box<[ArcSwapOption<IndexEntry<Arc<MethodInstance>>>]>,
    pick_which: Box<[AtomicU8]>,
    mask: u32,
}

impl CallCache {
    /// `size` must be a power of two.
    pub(crate) fn new(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        Self {
            slots: (0..size).map(|_| ArcSwapOption::empty()).collect(),
            pick_which: (0..size).map(|_| AtomicU8::new(0)).collect(),
            mask: (size - 1) as u32,
        }
    }

    #[inline]
    fn indices(&self, callsite: u32) -> [usize; 4] {
        let mask = self.mask;
        [
            (callsite & mask) as usize,
            ((callsite >> 8) & mask) as usize,
            ((callsite >> 16) & mask) as usize,
            ((callsite >> 24 | callsite << 8) & mask) as usize,
        ]
    }

    #[inline]
    fn probe(&self, idx: &[usize; 4], f: &Value, args: &[Value], world: World) -> Option<CacheEntry> {
        for &i in idx {
            let slot = self.slots[i].load();
            if let Some(entry) = slot.as_ref() {
                if entry.window().contains(world) && sig_match_fast(entry.sig(), f, args) {
                    return Some(entry.clone());
                }
            }
        }
        None
    }

    fn insert(&self, idx: &[usize; 4], entry: CacheEntry) {
        let counter = &self.pick_which[idx[0]];
        let which = counter.load(Ordering::Relaxed).wrapping_add(1);
        counter.store(which, Ordering::Relaxed);
        self.slots[idx[(which & 3) as usize]].store(Some(entry));
    }

    /// Number of occupied slots.
    pub(crate) fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.load().is_some()).count()
    }

    /// Empty every slot.
    pub(crate) fn clear(&self) {
        for slot in self.slots.iter() {
            slot.store(None);
        }
    }
}

/// True when `value`'s type is exactly the dispatch leaf `ty`.
#[inline]
fn value_is(value: &Value, ty: &Ty) -> bool {
    match (value, ty) {
        (Value::Nothing, Ty::Named(n)) => n.is(builtin::NOTHING),
        (Value::Bool(_), Ty::Named(n)) => n.is(builtin::BOOL),
        (Value::Int(_), Ty::Named(n)) => n.is(builtin::INT64),
        (Value::Float(_), Ty::Named(n)) => n.is(builtin::FLOAT64),
        (Value::Str(_), Ty::Named(n)) => n.is(builtin::STRING),
        (Value::Function(func), Ty::Named(n)) => func.type_name() == n,
        (Value::Object(obj), Ty::Named(n)) => obj.ty == *n,
        (Value::Type(t), Ty::TypeOf(inner)) => t == &**inner,
        _ => false,
    }
}

#[inline]
fn sig_match_fast(sig: &Ty, f: &Value, args: &[Value]) -> bool {
    let Some(tuple) = sig.as_tuple() else {
        return false;
    };
    tuple.vararg.is_none()
        && tuple.elems.len() == args.len() + 1
        && value_is(f, &tuple.elems[0])
        && args.iter().zip(&tuple.elems[1..]).all(|(a, t)| value_is(a, t))
}

/// The dispatch tuple of a call.
pub(crate) fn arg_type_tuple(f: &Value, args: &[Value]) -> Ty {
    Ty::tuple(std::iter::once(f.type_of()).chain(args.iter().map(Value::type_of)))
}

/// Call-site hash used when the caller does not provide one.
pub(crate) fn default_callsite(f: &Value, nargs: usize) -> u32 {
    let mut hasher = FxHasher::default();
    match f {
        Value::Function(func) => func.type_name().hash(&mut hasher),
        other => other.type_of().hash(&mut hasher),
    }
    nargs.hash(&mut hasher);
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

pub(crate) fn function_name(f: &Value) -> String {
    match f {
        Value::Function(func) => func.name().to_string(),
        other => other.type_of().to_string(),
    }
}

impl Engine {
    /// The instance a call of `f` on `args` reaches in `world`.
    pub(crate) fn lookup_generic(
        &self,
        callsite: u32,
        f: &Value,
        args: &[Value],
        world: World,
    ) -> DispatchResult<Arc<MethodInstance>> {
        let idx = self.call_cache.indices(callsite);
        if let Some(entry) = self.call_cache.probe(&idx, f, args, world) {
            self.stats.record_call_cache_hit();
            return Ok(entry.payload().clone());
        }
        self.stats.record_call_cache_miss();

        let index = &self.cache.index;
        let count = match f.type_of() {
            Ty::Named(name) => self.registry.typename(&name).cache_entry_count(),
            _ => 0,
        };
        let mut tt = None;
        let mut entry = None;
        if !index.leaf_is_empty() && (count == 0 || count >= self.config.leafcache_min_entries) {
            // Hashing the argument types is cheaper than scanning many
            // cache entries.
            let t = arg_type_tuple(f, args);
            entry = index.lookup_leaf(&t, world);
            tt = Some(t);
        }
        if entry.is_none() {
            let t = tt.take().unwrap_or_else(|| arg_type_tuple(f, args));
            entry = index.assoc_by_type(&t, world, true).or_else(|| index.lookup_leaf(&t, world));
            tt = Some(t);
        }

        if let Some(entry) = entry {
            self.stats.record_exact_table_hit();
            if entry.is_leafsig() && entry.simplesig().is_none() && entry.guardsigs().is_empty() {
                self.call_cache.insert(&idx, entry.clone());
            }
            let mi = entry.payload().clone();
            self.record_dispatch(&mi);
            return Ok(mi);
        }

        let tt = tt.unwrap_or_else(|| arg_type_tuple(f, args));
        match self.mt_assoc_by_type(&tt, world) {
            Some(mi) => {
                self.record_dispatch(&mi);
                Ok(mi)
            }
            None => Err(self.method_error(f, &tt, world)),
        }
    }

    /// Report the first slow-path dispatch of `mi` to the trace sinks.
    pub(crate) fn record_dispatch(&self, mi: &MethodInstance) {
        if self.trace.dispatch_enabled() && mi.mark_dispatched() {
            self.trace.emit(&TraceEvent::Dispatched {
                signature: mi.spec_types().clone(),
            });
        }
    }

    /// The error for a call of type `tt` that no unique method covers.
    pub(crate) fn method_error(&self, f: &Value, tt: &Ty, world: World) -> DispatchError {
        let function = function_name(f);
        let arg_types: Vec<Ty> = match tt.as_tuple() {
            Some(tuple) => tuple.elems.iter().skip(1).cloned().collect(),
            None => Vec::new(),
        };
        match self.lookup_matches(tt, world, None) {
            LookupResult::Ambiguous { matches, .. } => DispatchError::AmbiguousMethod {
                function,
                arg_types,
                candidates: matches.iter().map(|m| m.method.sig().clone()).collect(),
                world,
            },
            _ => DispatchError::NoApplicableMethod {
                function,
                arg_types,
                world,
            },
        }
    }

    /// Full argument vector of a call: the callee followed by `args`.
    pub(crate) fn call_args(f: &Value, args: &[Value]) -> SmallVec<[Value; 4]> {
        let mut full = SmallVec::with_capacity(args.len() + 1);
        full.push(f.clone());
        full.extend(args.iter().cloned());
        full
    }
}
