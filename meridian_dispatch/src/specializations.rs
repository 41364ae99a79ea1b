//! Per-method specialization store.
//!
//! Maps specialized signatures to their unique [`MethodInstance`]. Reads
//! are lock-free against a published snapshot; creation re-checks under
//! the owning method's lock so each signature gets exactly one instance.
//! Small tables are scanned linearly; past the inline threshold a hashed
//! index over closed signatures is built alongside the list.

use std::sync::Arc;

use arc_swap::ArcSwap;
use meridian_types::{Ty, TypeOracle};
use parking_lot::ReentrantMutex;
use rustc_hash::FxHashMap;

use crate::instance::MethodInstance;

#[derive(Default)]
struct SpecState {
    instances: Vec<Arc<MethodInstance>>,
    keyset: Option<FxHashMap<Ty, usize>>,
}

impl SpecState {
    fn find(&self, oracle: &dyn TypeOracle, sig: &Ty) -> Option<&Arc<MethodInstance>> {
        if !sig.has_free_typevars() {
            if let Some(&idx) = self.keyset.as_ref().and_then(|keys| keys.get(sig)) {
                return self.instances.get(idx);
            }
        }
        self.instances
            .iter()
            .find(|mi| oracle.types_equal(mi.spec_types(), sig))
    }
}

/// Unique specializations of one method.
pub struct SpecializationTable {
    state: ArcSwap<SpecState>,
    inline_threshold: usize,
}

impl SpecializationTable {
    pub fn new(inline_threshold: usize) -> Self {
        Self {
            state: ArcSwap::from_pointee(SpecState::default()),
            inline_threshold,
        }
    }

    /// Existing specialization for `sig`.
    pub fn get(&self, oracle: &dyn TypeOracle, sig: &Ty) -> Option<Arc<MethodInstance>> {
        self.state.load().find(oracle, sig).cloned()
    }

    /// Existing specialization for `sig`, or the one built by `make`.
    pub fn get_or_insert_with(
        &self,
        lock: &ReentrantMutex<()>,
        oracle: &dyn TypeOracle,
        sig: &Ty,
        make: impl FnOnce() -> Arc<MethodInstance>,
    ) -> Arc<MethodInstance> {
        if let Some(mi) = self.get(oracle, sig) {
            return mi;
        }
        let _guard = lock.lock();
        let current = self.state.load_full();
        if let Some(mi) = current.find(oracle, sig) {
            return mi.clone();
        }
        let mi = make();
        let mut instances = Vec::with_capacity(current.instances.len() + 1);
        instances.extend(current.instances.iter().cloned());
        instances.push(mi.clone());
        let keyset = if instances.len() > self.inline_threshold {
            Some(
                instances
                    .iter()
                    .enumerate()
                    .filter(|(_, mi)| !mi.spec_types().has_free_typevars())
                    .map(|(i, mi)| (mi.spec_types().clone(), i))
                    .collect(),
            )
        } else {
            None
        };
        self.state.store(Arc::new(SpecState { instances, keyset }));
        mi
    }

    /// All specializations in creation order.
    pub fn all(&self) -> Vec<Arc<MethodInstance>> {
        self.state.load().instances.clone()
    }

    pub fn len(&self) -> usize {
        self.state.load().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detach every specialization.
    pub(crate) fn take_all(&self) -> Vec<Arc<MethodInstance>> {
        let old = self.state.swap(Arc::new(SpecState::default()));
        old.instances.clone()
    }
}
