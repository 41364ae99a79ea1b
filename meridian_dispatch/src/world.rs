//! World Clock
//!
//! A world is a snapshot of the method table. Every successful mutation of
//! the table creates the next world; lookups name the world they observe.
//!
//! # Protocol
//!
//! Mutators take the world lock, compute `current + 1`, mutate shared
//! structures with that world in mind, and only then publish it with a
//! release store. Readers load the counter with acquire ordering and never
//! block.
//!
//! Validity windows are closed ranges `[min, max]` of worlds. A `max` of
//! [`WORLD_INFINITY`] means the object is valid in every future world until
//! something clips it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

/// A world number.
pub type World = u64;

/// The open upper bound of a validity window.
pub const WORLD_INFINITY: World = u64::MAX;

/// The first world of a fresh engine.
pub const FIRST_WORLD: World = 1;

// =============================================================================
// World Ranges
// =============================================================================

/// A closed range of worlds over which a lookup result holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldRange {
    /// First world in the range.
    pub min: World,
    /// Last world in the range.
    pub max: World,
}

impl WorldRange {
    /// Every world.
    pub const ALL: Self = Self {
        min: FIRST_WORLD,
        max: WORLD_INFINITY,
    };

    /// A range from `min` to `max` inclusive.
    #[inline]
    pub const fn new(min: World, max: World) -> Self {
        Self { min, max }
    }

    /// The single world `world`.
    #[inline]
    pub const fn at(world: World) -> Self {
        Self {
            min: world,
            max: world,
        }
    }

    /// True when `world` lies inside the range.
    #[inline]
    pub fn contains(&self, world: World) -> bool {
        self.min <= world && world <= self.max
    }

    /// True when the two ranges share at least one world.
    #[inline]
    pub fn overlaps(&self, other: WorldRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }

    /// True when the range contains no world.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    /// Shrink to the intersection with `other`.
    #[inline]
    pub fn narrow(&mut self, other: WorldRange) {
        self.min = self.min.max(other.min);
        self.max = self.max.min(other.max);
    }
}

// =============================================================================
// Validity Windows
// =============================================================================

/// Atomically updated validity window of a shared object.
///
/// `max` only ever shrinks once the object is published, except for the
/// promotion of a window whose `max` equals the current world back to
/// [`WORLD_INFINITY`], which is performed under the world lock.
#[derive(Debug)]
pub struct ValidityWindow {
    min: AtomicU64,
    max: AtomicU64,
}

impl ValidityWindow {
    /// Window covering `min..=max`.
    pub fn new(min: World, max: World) -> Self {
        Self {
            min: AtomicU64::new(min),
            max: AtomicU64::new(max),
        }
    }

    #[inline]
    pub fn min(&self) -> World {
        self.min.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max(&self) -> World {
        self.max.load(Ordering::Acquire)
    }

    /// Snapshot of the window.
    #[inline]
    pub fn range(&self) -> WorldRange {
        WorldRange::new(self.min(), self.max())
    }

    /// True when `world` lies inside the window.
    #[inline]
    pub fn contains(&self, world: World) -> bool {
        self.min() <= world && world <= self.max()
    }

    /// True when the window is still open-ended.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.max() == WORLD_INFINITY
    }

    #[inline]
    pub(crate) fn set_min(&self, world: World) {
        self.min.store(world, Ordering::Release);
    }

    #[inline]
    pub(crate) fn set_max(&self, world: World) {
        self.max.store(world, Ordering::Release);
    }

    /// Clip an open window to `world`. Returns false if it was already closed.
    #[inline]
    pub(crate) fn close(&self, world: World) -> bool {
        self.max
            .compare_exchange(WORLD_INFINITY, world, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// =============================================================================
// World Clock
// =============================================================================

/// The global world counter and the lock serializing its advancement.
#[derive(Debug)]
pub struct WorldClock {
    counter: AtomicU64,
    lock: Mutex<()>,
    allow_new_worlds: AtomicBool,
}

impl Default for WorldClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldClock {
    /// Clock starting at [`FIRST_WORLD`].
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(FIRST_WORLD),
            lock: Mutex::new(()),
            allow_new_worlds: AtomicBool::new(true),
        }
    }

    /// The latest published world.
    #[inline]
    pub fn current(&self) -> World {
        self.counter.load(Ordering::Acquire)
    }

    /// Whether mutations that create worlds are still permitted.
    #[inline]
    pub fn allows_new_worlds(&self) -> bool {
        self.allow_new_worlds.load(Ordering::Acquire)
    }

    /// Take the world lock.
    pub fn lock(&self) -> WorldGuard<'_> {
        WorldGuard {
            clock: self,
            _guard: self.lock.lock(),
        }
    }
}

/// Exclusive right to advance the world counter.
pub struct WorldGuard<'a> {
    clock: &'a WorldClock,
    _guard: MutexGuard<'a, ()>,
}

impl WorldGuard<'_> {
    /// The current world; stable while the guard is held.
    #[inline]
    pub fn current(&self) -> World {
        self.clock.counter.load(Ordering::Relaxed)
    }

    /// Publish `world`, which must be the successor of the current world.
    pub fn publish(&mut self, world: World) {
        debug_assert_eq!(world, self.current() + 1, "worlds advance by one");
        self.clock.counter.store(world, Ordering::Release);
    }

    /// Forbid all further world creation.
    pub(crate) fn forbid_new_worlds(&mut self) {
        self.clock.allow_new_worlds.store(false, Ordering::Release);
    }

    #[inline]
    pub fn allows_new_worlds(&self) -> bool {
        self.clock.allows_new_worlds()
    }
}
