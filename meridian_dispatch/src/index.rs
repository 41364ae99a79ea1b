//! Signature Index
//!
//! An insertion-ordered collection of signature-keyed entries, each with a
//! validity window, used both for method definitions and for the
//! specialization cache.
//!
//! # Layout
//!
//! - Entries whose first slot is a concrete type name live in a per-name
//!   bucket; all other entries live in a general bucket. A query whose
//!   first slot is concrete only consults its own bucket plus the general
//!   one; any other query consults everything.
//! - Buckets are copy-on-write vectors behind [`ArcSwap`], so readers never
//!   lock and never observe a half-inserted entry.
//! - A separate exact-type table (the leaf table) maps fully concrete
//!   argument tuples to short chains of entries, newest first.
//!
//! Every visit preserves global insertion order, which is what makes lookup
//! results deterministic.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use meridian_types::{SparamEnv, Ty, TypeName, TypeOracle};
use smallvec::SmallVec;

use crate::world::{ValidityWindow, World, WorldRange};

// =============================================================================
// Entries
// =============================================================================

/// One signature-keyed entry.
pub struct IndexEntry<T> {
    sig: Ty,
    simplesig: Option<Ty>,
    guardsigs: Vec<Ty>,
    payload: T,
    window: ValidityWindow,
    isleafsig: bool,
    seq: u64,
}

impl<T> IndexEntry<T> {
    /// Entry for `sig` valid over `min..=max`.
    pub fn new(sig: Ty, payload: T, min: World, max: World) -> Self {
        Self {
            sig,
            simplesig: None,
            guardsigs: Vec::new(),
            payload,
            window: ValidityWindow::new(min, max),
            isleafsig: false,
            seq: 0,
        }
    }

    /// Attach a coarse pre-filter signature.
    pub fn with_simplesig(mut self, simplesig: Option<Ty>) -> Self {
        self.simplesig = simplesig;
        self
    }

    /// Attach guard signatures: queries under any of them must not match.
    pub fn with_guardsigs(mut self, guardsigs: Vec<Ty>) -> Self {
        self.guardsigs = guardsigs;
        self
    }

    #[inline]
    pub fn sig(&self) -> &Ty {
        &self.sig
    }

    #[inline]
    pub fn simplesig(&self) -> Option<&Ty> {
        self.simplesig.as_ref()
    }

    #[inline]
    pub fn guardsigs(&self) -> &[Ty] {
        &self.guardsigs
    }

    #[inline]
    pub fn payload(&self) -> &T {
        &self.payload
    }

    #[inline]
    pub fn window(&self) -> &ValidityWindow {
        &self.window
    }

    /// True when the signature is a dispatch tuple, so a call can be
    /// matched against it by comparing argument types one by one.
    #[inline]
    pub fn is_leafsig(&self) -> bool {
        self.isleafsig
    }

    /// Global insertion sequence number.
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl<T> std::fmt::Debug for IndexEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexEntry")
            .field("sig", &self.sig)
            .field("window", &self.window.range())
            .field("seq", &self.seq)
            .finish()
    }
}

type EntryRef<T> = Arc<IndexEntry<T>>;

// =============================================================================
// Buckets
// =============================================================================

struct Bucket<T> {
    entries: ArcSwap<Vec<EntryRef<T>>>,
}

impl<T> Bucket<T> {
    fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
        }
    }

    fn push(&self, entry: EntryRef<T>) {
        self.entries.rcu(|old| {
            let mut next = Vec::with_capacity(old.len() + 1);
            next.extend(old.iter().cloned());
            next.push(entry.clone());
            next
        });
    }

    fn snapshot(&self) -> Arc<Vec<EntryRef<T>>> {
        self.entries.load_full()
    }
}

/// Point-in-time view over one or more buckets.
struct Snapshot<T> {
    lists: SmallVec<[Arc<Vec<EntryRef<T>>>; 2]>,
}

impl<T> Snapshot<T> {
    /// Visit entries in insertion order until `f` returns false.
    fn for_each_ordered(&self, mut f: impl FnMut(&EntryRef<T>) -> bool) -> bool {
        match self.lists.len() {
            0 => true,
            1 => self.lists[0].iter().all(&mut f),
            2 => {
                let (a, b) = (&self.lists[0], &self.lists[1]);
                let (mut i, mut j) = (0, 0);
                while i < a.len() || j < b.len() {
                    let take_a = match (a.get(i), b.get(j)) {
                        (Some(x), Some(y)) => x.seq < y.seq,
                        (Some(_), None) => true,
                        _ => false,
                    };
                    let entry = if take_a {
                        i += 1;
                        &a[i - 1]
                    } else {
                        j += 1;
                        &b[j - 1]
                    };
                    if !f(entry) {
                        return false;
                    }
                }
                true
            }
            _ => {
                let mut all: Vec<&EntryRef<T>> = self.lists.iter().flat_map(|l| l.iter()).collect();
                all.sort_unstable_by_key(|e| e.seq);
                all.into_iter().all(f)
            }
        }
    }
}

// =============================================================================
// Signature Index
// =============================================================================

/// Signature-keyed entries with validity windows.
pub struct SignatureIndex<T> {
    oracle: Arc<dyn TypeOracle>,
    buckets: DashMap<TypeName, Arc<Bucket<T>>>,
    general: Bucket<T>,
    leaf: DashMap<Ty, SmallVec<[EntryRef<T>; 2]>>,
    next_seq: AtomicU64,
    len: AtomicUsize,
}

impl<T> SignatureIndex<T> {
    /// Empty index answering lattice questions through `oracle`.
    pub fn new(oracle: Arc<dyn TypeOracle>) -> Self {
        Self {
            oracle,
            buckets: DashMap::new(),
            general: Bucket::new(),
            leaf: DashMap::new(),
            next_seq: AtomicU64::new(0),
            len: AtomicUsize::new(0),
        }
    }

    /// Number of signature entries, excluding the leaf table.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct tuples in the leaf table.
    pub fn leaf_len(&self) -> usize {
        self.leaf.len()
    }

    /// True when the leaf table holds nothing.
    pub fn leaf_is_empty(&self) -> bool {
        self.leaf.is_empty()
    }

    fn bucket_key(&self, sig: &Ty) -> Option<TypeName> {
        match sig.slot(0) {
            Some(first @ Ty::Named(name)) if self.oracle.is_concrete(first) => Some(name.clone()),
            _ => None,
        }
    }

    fn stamp(&self, mut entry: IndexEntry<T>) -> EntryRef<T> {
        entry.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        entry.isleafsig = self.oracle.is_dispatch_tuple(&entry.sig);
        Arc::new(entry)
    }

    /// Insert a signature entry; it is visible to readers on return.
    pub fn insert(&self, entry: IndexEntry<T>) -> EntryRef<T> {
        let entry = self.stamp(entry);
        match self.bucket_key(&entry.sig) {
            Some(key) => {
                let bucket = self
                    .buckets
                    .entry(key)
                    .or_insert_with(|| Arc::new(Bucket::new()))
                    .value()
                    .clone();
                bucket.push(entry.clone());
            }
            None => self.general.push(entry.clone()),
        }
        self.len.fetch_add(1, Ordering::Relaxed);
        entry
    }

    /// Insert into the leaf table under the exact tuple `tt`.
    pub fn insert_leaf(&self, tt: Ty, entry: IndexEntry<T>) -> EntryRef<T> {
        let entry = self.stamp(entry);
        self.leaf.entry(tt).or_default().insert(0, entry.clone());
        entry
    }

    fn snapshot(&self, query: &Ty) -> Snapshot<T> {
        let mut lists = SmallVec::new();
        match self.bucket_key(query) {
            Some(key) => {
                if let Some(bucket) = self.buckets.get(&key).map(|b| b.value().clone()) {
                    lists.push(bucket.snapshot());
                }
            }
            None => {
                let buckets: Vec<Arc<Bucket<T>>> =
                    self.buckets.iter().map(|b| b.value().clone()).collect();
                lists.extend(buckets.iter().map(|b| b.snapshot()));
            }
        }
        lists.push(self.general.snapshot());
        Snapshot { lists }
    }

    fn snapshot_all(&self) -> Snapshot<T> {
        let buckets: Vec<Arc<Bucket<T>>> = self.buckets.iter().map(|b| b.value().clone()).collect();
        let mut lists: SmallVec<[_; 2]> = buckets.iter().map(|b| b.snapshot()).collect();
        lists.push(self.general.snapshot());
        Snapshot { lists }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Newest leaf-table entry for exactly `tt` that is valid in `world`.
    pub fn lookup_leaf(&self, tt: &Ty, world: World) -> Option<EntryRef<T>> {
        let chain = self.leaf.get(tt)?;
        chain.iter().find(|e| e.window.contains(world)).cloned()
    }

    /// First entry, in insertion order, valid in `world` that covers `query`.
    ///
    /// With `subtype`, an entry covers the query when the query is a subtype
    /// of its signature (and of its simple signature) and of none of its
    /// guards. Without it, the signature must be equal to the query.
    pub fn assoc_by_type(&self, query: &Ty, world: World, subtype: bool) -> Option<EntryRef<T>> {
        let oracle = &*self.oracle;
        let mut found = None;
        self.snapshot(query).for_each_ordered(|e| {
            if !e.window.contains(world) {
                return true;
            }
            let hit = if subtype {
                e.simplesig
                    .as_ref()
                    .is_none_or(|simple| oracle.is_subtype(query, simple))
                    && oracle.is_subtype(query, &e.sig)
                    && !e.guardsigs.iter().any(|g| oracle.is_subtype(query, g))
            } else {
                oracle.types_equal(query, &e.sig)
            };
            if hit {
                found = Some(e.clone());
            }
            !hit
        });
        found
    }

    /// Visit, in insertion order, every entry whose window overlaps `range`
    /// and whose signature intersects `query`.
    ///
    /// The visitor receives the entry, the intersection, the bindings of
    /// the entry's type variables, and whether `query` is a subtype of the
    /// entry's signature. Returns false if the visitor stopped the walk.
    pub fn visit_intersecting(
        &self,
        query: &Ty,
        range: WorldRange,
        mut visit: impl FnMut(&EntryRef<T>, Ty, SparamEnv, bool) -> bool,
    ) -> bool {
        let oracle = &*self.oracle;
        self.snapshot(query).for_each_ordered(|e| {
            if !e.window.range().overlaps(range) {
                return true;
            }
            let (ti, env) = oracle.intersect_with_env(query, &e.sig);
            if ti.is_bottom() {
                return true;
            }
            let issubty = oracle.is_subtype(query, &e.sig);
            visit(e, ti, env, issubty)
        })
    }

    /// Visit every signature entry in insertion order.
    pub fn for_each(&self, f: impl FnMut(&EntryRef<T>) -> bool) -> bool {
        self.snapshot_all().for_each_ordered(f)
    }

    /// Visit every leaf-table entry.
    pub fn for_each_leaf(&self, mut f: impl FnMut(&EntryRef<T>)) {
        for chain in self.leaf.iter() {
            chain.value().iter().for_each(&mut f);
        }
    }

    /// Close every open leaf-table entry at `max_world` and empty the table.
    pub fn drop_leaf_table(&self, max_world: World) {
        self.for_each_leaf(|e| {
            e.window.close(max_world);
        });
        self.leaf.clear();
    }
}
