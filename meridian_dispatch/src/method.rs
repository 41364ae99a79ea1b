//! Methods
//!
//! A [`Method`] is one definition of a generic function: its signature, an
//! opaque body handed to the compile backend, and the bookkeeping that
//! dispatch maintains on its behalf:
//!
//! - `primary_world`: the world in which the definition became visible
//! - `dispatch_status`: the fast-path bits described below
//! - `interferences`: the methods it is ambiguous with or less specific than
//! - its specializations and the exact-signature `invoke` cache
//!
//! # Dispatch Status
//!
//! - [`METHOD_SIG_LATEST_WHICH`]: the method is in the latest world
//! - [`METHOD_SIG_LATEST_ONLY`]: when a call signature is a subtype of this
//!   method's signature, this method is the unique answer, so a full match
//!   scan can stop at it

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use arc_swap::{ArcSwap, ArcSwapOption};
use meridian_types::{FunctionRef, SparamEnv, Ty, TypeOracle};
use parking_lot::ReentrantMutex;
use smallvec::SmallVec;

use crate::index::SignatureIndex;
use crate::instance::MethodInstance;
use crate::specializations::SpecializationTable;
use crate::world::{WORLD_INFINITY, World};

/// The method is in the latest world.
pub const METHOD_SIG_LATEST_WHICH: u8 = 0b01;
/// A subtype call signature resolves uniquely to this method.
pub const METHOD_SIG_LATEST_ONLY: u8 = 0b10;

// =============================================================================
// Identity
// =============================================================================

/// Dense identifier of a method within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub(crate) u32);

impl MethodId {
    /// Raw index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A sorted set of method ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdSet {
    ids: SmallVec<[MethodId; 4]>,
}

impl IdSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn contains(&self, id: MethodId) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    /// Insert `id`; returns false if it was already present.
    pub fn insert(&mut self, id: MethodId) -> bool {
        match self.ids.binary_search(&id) {
            Ok(_) => false,
            Err(pos) => {
                self.ids.insert(pos, id);
                true
            }
        }
    }

    /// Insert every id of `other`.
    pub fn extend_from(&mut self, other: &IdSet) {
        for &id in &other.ids {
            self.insert(id);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = MethodId> + '_ {
        self.ids.iter().copied()
    }
}

// =============================================================================
// Bodies and Definitions
// =============================================================================

/// Opaque method body, interpreted only by the compile backend.
#[derive(Clone)]
pub struct MethodBody(Arc<dyn Any + Send + Sync>);

impl MethodBody {
    pub fn new<B: Any + Send + Sync>(body: B) -> Self {
        Self(Arc::new(body))
    }

    /// Borrow the body as `B`, if that is what it holds.
    pub fn downcast_ref<B: Any>(&self) -> Option<&B> {
        self.0.downcast_ref::<B>()
    }
}

impl fmt::Debug for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MethodBody(..)")
    }
}

/// Everything needed to add a method to the table.
#[derive(Debug, Clone)]
pub struct MethodDefinition {
    pub(crate) name: Arc<str>,
    pub(crate) sig: Ty,
    pub(crate) body: MethodBody,
    pub(crate) nospecialize: u64,
    pub(crate) called: u8,
    pub(crate) max_varargs: Option<usize>,
}

impl MethodDefinition {
    /// Method of `function` taking `params`.
    pub fn new(function: &FunctionRef, params: impl IntoIterator<Item = Ty>, body: MethodBody) -> Self {
        Self::with_signature(function.name(), function.signature(params), body)
    }

    /// Method of `function` taking `params` followed by any number of `tail`.
    pub fn vararg(
        function: &FunctionRef,
        params: impl IntoIterator<Item = Ty>,
        tail: Ty,
        body: MethodBody,
    ) -> Self {
        Self::with_signature(function.name(), function.vararg_signature(params, tail), body)
    }

    /// Method with an explicit signature tuple (slot 0 is the callee type).
    pub fn with_signature(name: &str, sig: Ty, body: MethodBody) -> Self {
        Self {
            name: Arc::from(name),
            sig,
            body,
            nospecialize: 0,
            called: 0,
            max_varargs: None,
        }
    }

    /// Never specialize on argument `arg` (1-based, slot 0 is the callee).
    pub fn nospecialize(mut self, arg: usize) -> Self {
        if (1..=64).contains(&arg) {
            self.nospecialize |= 1 << (arg - 1);
        }
        self
    }

    /// Argument `arg` (1-based) is called by the body, so function values
    /// passed there keep their own type in compilation signatures. Only the
    /// first eight arguments are tracked.
    pub fn called(mut self, arg: usize) -> Self {
        if (1..=8).contains(&arg) {
            self.called |= 1 << (arg - 1);
        }
        self
    }

    /// Unroll at most `n` vararg arguments into compilation signatures.
    pub fn max_varargs(mut self, n: usize) -> Self {
        self.max_varargs = Some(n);
        self
    }

    #[inline]
    pub fn signature(&self) -> &Ty {
        &self.sig
    }
}

// =============================================================================
// Methods
// =============================================================================

/// One definition of a generic function.
pub struct Method {
    id: MethodId,
    name: Arc<str>,
    sig: Ty,
    nargs: usize,
    is_vararg: bool,
    body: MethodBody,
    nospecialize: u64,
    called: u8,
    max_varargs: Option<usize>,
    primary_world: AtomicU64,
    dispatch_status: AtomicU8,
    interferences: ArcSwap<IdSet>,
    pub(crate) specializations: SpecializationTable,
    pub(crate) unspecialized: ArcSwapOption<MethodInstance>,
    pub(crate) invokes: SignatureIndex<Arc<MethodInstance>>,
    /// Guards specializations, code-instance chains, backedges and the
    /// invoke cache of this method.
    pub(crate) writelock: ReentrantMutex<()>,
}

impl Method {
    pub(crate) fn new(
        id: MethodId,
        def: MethodDefinition,
        oracle: Arc<dyn TypeOracle>,
        inline_threshold: usize,
    ) -> Self {
        let (nargs, is_vararg) = match def.sig.as_tuple() {
            Some(t) => (t.len() + usize::from(t.is_vararg()), t.is_vararg()),
            None => (0, false),
        };
        Self {
            id,
            name: def.name,
            sig: def.sig,
            nargs,
            is_vararg,
            body: def.body,
            nospecialize: def.nospecialize,
            called: def.called,
            max_varargs: def.max_varargs,
            primary_world: AtomicU64::new(WORLD_INFINITY),
            dispatch_status: AtomicU8::new(0),
            interferences: ArcSwap::from_pointee(IdSet::new()),
            specializations: SpecializationTable::new(inline_threshold),
            unspecialized: ArcSwapOption::empty(),
            invokes: SignatureIndex::new(oracle),
            writelock: ReentrantMutex::new(()),
        }
    }

    #[inline]
    pub fn id(&self) -> MethodId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared signature, including the callee type in slot 0.
    #[inline]
    pub fn sig(&self) -> &Ty {
        &self.sig
    }

    /// Number of signature slots, counting the vararg tail as one.
    #[inline]
    pub fn nargs(&self) -> usize {
        self.nargs
    }

    #[inline]
    pub fn is_vararg(&self) -> bool {
        self.is_vararg
    }

    #[inline]
    pub fn body(&self) -> &MethodBody {
        &self.body
    }

    /// True when argument `arg` (1-based) is marked no-specialize.
    #[inline]
    pub fn is_nospecialize(&self, arg: usize) -> bool {
        (1..=64).contains(&arg) && self.nospecialize & (1 << (arg - 1)) != 0
    }

    /// True when argument `arg` (1-based) is called by the body.
    #[inline]
    pub fn is_called(&self, arg: usize) -> bool {
        (1..=8).contains(&arg) && self.called & (1 << (arg - 1)) != 0
    }

    /// Explicit vararg unroll limit, if declared.
    #[inline]
    pub fn declared_max_varargs(&self) -> Option<usize> {
        self.max_varargs
    }

    /// World in which this method became visible; infinity before activation.
    #[inline]
    pub fn primary_world(&self) -> World {
        self.primary_world.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_primary_world(&self, world: World) {
        self.primary_world.store(world, Ordering::Release);
    }

    #[inline]
    pub fn dispatch_status(&self) -> u8 {
        self.dispatch_status.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_dispatch_status(&self, bits: u8) {
        self.dispatch_status.store(bits, Ordering::Release);
    }

    /// True when a subtype call signature resolves uniquely to this method.
    #[inline]
    pub fn is_latest_only(&self) -> bool {
        self.dispatch_status() & METHOD_SIG_LATEST_ONLY != 0
    }

    /// Snapshot of the interference set.
    #[inline]
    pub fn interferences(&self) -> Arc<IdSet> {
        self.interferences.load_full()
    }

    pub(crate) fn set_interferences(&self, set: IdSet) {
        self.interferences.store(Arc::new(set));
    }

    /// Add `id` to the interference set. Callers hold the world lock.
    pub(crate) fn add_interference(&self, id: MethodId) {
        let mut set = (*self.interferences.load_full()).clone();
        if set.insert(id) {
            self.interferences.store(Arc::new(set));
        }
    }

    /// Every specialization created so far, in creation order.
    pub fn specializations(&self) -> Vec<Arc<MethodInstance>> {
        self.specializations.all()
    }

    /// Specialization for exactly `spec_types`, if one exists.
    pub fn lookup_specialization(
        &self,
        oracle: &dyn TypeOracle,
        spec_types: &Ty,
    ) -> Option<Arc<MethodInstance>> {
        self.specializations.get(oracle, spec_types)
    }

    /// Specialization for `spec_types`, created on first request.
    pub(crate) fn specialization(
        self: &Arc<Self>,
        oracle: &dyn TypeOracle,
        spec_types: &Ty,
        sparams: &SparamEnv,
    ) -> Arc<MethodInstance> {
        self.specializations.get_or_insert_with(&self.writelock, oracle, spec_types, || {
            Arc::new(MethodInstance::new(self.clone(), spec_types.clone(), sparams.clone()))
        })
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("id", &self.id)
            .field("sig", &self.sig)
            .field("primary_world", &self.primary_world())
            .finish()
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.sig)
    }
}

/// True when `member` is in the interference set of `of`.
#[inline]
pub(crate) fn in_interferences(member: &Method, of: &Method) -> bool {
    of.interferences.load().contains(member.id)
}
