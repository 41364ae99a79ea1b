//! Match Resolution
//!
//! Finds every method applicable to a signature in a given world and puts
//! them in dispatch order.
//!
//! # Pipeline
//!
//! 1. **Fast paths**: a dispatch tuple is looked up in the exact-type table
//!    and then in the signature cache; a hit is the unique answer.
//! 2. **Scan**: the definitions index is walked in insertion order. A
//!    method that uniquely answers every subtype query ends the walk.
//! 3. **Minmax**: among fully covering matches, one that is more specific
//!    than all the others collapses the result when nothing partial is
//!    ambiguous with it.
//! 4. **Sort**: otherwise the matches are ordered by an iterative Tarjan
//!    walk over the interference graph. A strongly connected component is
//!    an ambiguity group and is emitted together.
//!
//! The world range reported alongside a result is the largest range over
//! which the whole result set is stable.

use std::fmt;
use std::sync::Arc;

use meridian_types::{SparamEnv, Ty, TypeOracle};

use crate::cache::CacheTarget;
use crate::engine::Engine;
use crate::method::{Method, MethodId, in_interferences};
use crate::world::{World, WorldRange};

// =============================================================================
// Matches
// =============================================================================

/// How a match relates to the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Coverage {
    /// The query only intersects the method signature.
    NotFullyCovers,
    /// The query is a subtype of the method signature.
    FullyCovers,
    /// Partial match dominated by the minmax match; dropped unless it is
    /// part of an ambiguity.
    Sentinel,
}

/// One applicable method.
#[derive(Clone)]
pub struct MethodMatch {
    /// Intersection of the query with the method signature.
    pub spec_types: Ty,
    /// Bindings of the method's static parameters.
    pub sparams: SparamEnv,
    pub method: Arc<Method>,
    pub(crate) coverage: Coverage,
}

impl MethodMatch {
    pub(crate) fn new(spec_types: Ty, sparams: SparamEnv, method: Arc<Method>, coverage: Coverage) -> Self {
        Self {
            spec_types,
            sparams,
            method,
            coverage,
        }
    }

    /// True when every call of the query signature is covered by the method.
    #[inline]
    pub fn fully_covers(&self) -> bool {
        self.coverage == Coverage::FullyCovers
    }
}

impl fmt::Debug for MethodMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodMatch")
            .field("method", &self.method.sig())
            .field("spec_types", &self.spec_types)
            .field("fully_covers", &self.fully_covers())
            .finish()
    }
}

/// Result of [`Engine::lookup_matches`].
#[derive(Debug, Clone)]
pub enum LookupResult {
    /// Applicable methods, most specific first.
    Matches {
        matches: Vec<MethodMatch>,
        valid: WorldRange,
    },
    /// Applicable methods that could not be totally ordered.
    Ambiguous {
        matches: Vec<MethodMatch>,
        valid: WorldRange,
    },
    /// More methods apply than the requested limit.
    TooMany { limit: usize },
    /// Nothing applies.
    NoMatch { valid: WorldRange },
}

impl LookupResult {
    /// The matches, if the lookup produced any.
    pub fn matches(&self) -> &[MethodMatch] {
        match self {
            LookupResult::Matches { matches, .. } | LookupResult::Ambiguous { matches, .. } => matches,
            _ => &[],
        }
    }

    #[inline]
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, LookupResult::Ambiguous { .. })
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Knobs of one resolver run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MatchOptions {
    /// Most results tolerated; more makes the lookup fail.
    pub limit: Option<usize>,
    /// Keep matches that are only ambiguous with a covering match.
    pub include_ambiguous: bool,
    /// Report partial intersections, not just covering methods.
    pub intersections: bool,
    /// Cache a unique dispatch-tuple answer in the method cache.
    pub cache_result: bool,
    /// Compute the ambiguity flag exactly.
    pub want_ambiguity: bool,
}

/// Output of a resolver run.
pub(crate) struct MatchSet {
    pub matches: Vec<MethodMatch>,
    pub ambiguous: bool,
}

impl Engine {
    /// Every method applicable to `ty` in `world`, in dispatch order.
    ///
    /// `range` is narrowed to the worlds over which the answer holds.
    /// Returns `None` when `world` is in the future, or when the limit was
    /// exceeded.
    pub(crate) fn ml_matches(
        &self,
        ty: &Ty,
        opts: MatchOptions,
        world: World,
        range: &mut WorldRange,
    ) -> Option<MatchSet> {
        if world > self.clock.current() {
            return None;
        }
        let oracle = &*self.oracle;
        let is_dispatch_tuple = oracle.is_dispatch_tuple(ty);

        if is_dispatch_tuple {
            if let Some(found) = self.match_from_cache(ty, world, range) {
                return Some(MatchSet {
                    matches: vec![found],
                    ambiguous: false,
                });
            }
        }

        // Full scan of the definitions.
        let mut valid = *range;
        let mut limit = opts.limit;
        let mut matches: Vec<MethodMatch> = Vec::new();
        let mut exhausted = false;
        let completed = self
            .registry
            .defs
            .visit_intersecting(ty, WorldRange::ALL, |entry, ti, env, issubty| {
                if !opts.intersections && !issubty {
                    return true;
                }
                let window = entry.window().range();
                if world < window.min {
                    valid.max = valid.max.min(window.min - 1);
                    return true;
                }
                if world > window.max {
                    valid.min = valid.min.max(window.max.saturating_add(1));
                    return true;
                }
                valid.max = valid.max.min(window.max);
                let method = entry.payload();
                let only = method.is_latest_only();
                if only {
                    if let Some(lim) = limit.as_mut() {
                        if *lim == 0 {
                            matches.clear();
                            exhausted = true;
                            return false;
                        }
                        *lim -= 1;
                    }
                }
                let coverage = if issubty {
                    Coverage::FullyCovers
                } else {
                    Coverage::NotFullyCovers
                };
                let found = MethodMatch::new(ti, env, method.clone(), coverage);
                if issubty && only {
                    matches.clear();
                    matches.push(found);
                    return false;
                }
                matches.push(found);
                true
            });
        *range = valid;
        if !completed && exhausted {
            return None;
        }

        let mut has_ambiguity = false;
        let mut minmax: Option<MethodMatch> = None;
        let mut any_subtypes = false;
        if matches.len() > 1 {
            let len = matches.len();
            for i in 0..len {
                if matches[i].coverage != Coverage::FullyCovers {
                    continue;
                }
                any_subtypes = true;
                let m = &matches[i].method;
                let dominates = (0..len).all(|j| {
                    j == i
                        || matches[j].coverage != Coverage::FullyCovers
                        || self.method_morespecific_via_interferences(m, &matches[j].method)
                });
                if dominates {
                    minmax = Some(matches[i].clone());
                    break;
                }
            }

            let mut all_subtypes = any_subtypes;
            if any_subtypes {
                let minmax_method = minmax.as_ref().map(|mm| mm.method.clone());
                for matc in matches.iter_mut() {
                    if matc.coverage == Coverage::FullyCovers {
                        continue;
                    }
                    if let Some(mm) = &minmax_method {
                        if self.method_morespecific_via_interferences(mm, &matc.method) {
                            matc.coverage = Coverage::Sentinel;
                            continue;
                        }
                        if in_interferences(mm, &matc.method) {
                            has_ambiguity = true;
                        }
                    }
                    all_subtypes = false;
                }
            }

            if all_subtypes {
                match &minmax {
                    None if !opts.include_ambiguous => matches.clear(),
                    None if opts.limit == Some(1) => return None,
                    None => {}
                    Some(mm) => matches = vec![mm.clone()],
                }
            }
            if minmax.is_some() && opts.limit == Some(0) {
                return None;
            }
        }

        if matches.len() > 1 {
            let found_minmax = if has_ambiguity {
                1
            } else if minmax.is_some() {
                2
            } else if any_subtypes && !opts.include_ambiguous {
                1
            } else {
                0
            };
            let sort_limit = match (opts.limit, &minmax) {
                (Some(lim), Some(_)) => Some(lim.saturating_sub(1)),
                (lim, _) => lim,
            };
            let mut sorter = MatchSorter {
                oracle,
                engine: self,
                matches: &matches,
                visited: vec![0; matches.len()],
                stack: Vec::new(),
                result: Vec::new(),
                recursion_stack: Vec::new(),
                limit: sort_limit,
                include_ambiguous: opts.include_ambiguous,
                has_ambiguity: !opts.want_ambiguity,
                found_minmax,
            };
            for i in 0..matches.len() {
                if matches[i].coverage != Coverage::NotFullyCovers && sorter.found_minmax != 0 {
                    continue;
                }
                sorter.sort(i)?;
                debug_assert!(sorter.stack.is_empty());
            }
            has_ambiguity = sorter.has_ambiguity;
            let order = sorter.result;
            let mut sorted: Vec<MethodMatch> = order
                .into_iter()
                .map(|i| {
                    let mut matc = matches[i].clone();
                    if matc.coverage == Coverage::Sentinel {
                        matc.coverage = Coverage::NotFullyCovers;
                    }
                    matc
                })
                .collect();
            if let Some(mm) = minmax {
                sorted.push(mm);
            }
            matches = sorted;
        }

        for matc in &matches {
            range.min = range.min.max(matc.method.primary_world());
        }

        if opts.cache_result && is_dispatch_tuple && matches.len() == 1 && !has_ambiguity {
            let matc = &matches[0];
            let guard = self.cache.writelock.lock();
            self.cache_method(
                CacheTarget::Global(guard),
                ty,
                &matc.method,
                world,
                *range,
                &matc.sparams,
            );
        }

        if opts.limit.is_some_and(|lim| matches.len() > lim) {
            return None;
        }
        Some(MatchSet {
            matches,
            ambiguous: has_ambiguity,
        })
    }

    /// Answer a dispatch tuple from the method cache: the exact-type table
    /// first, then the signature cache when the entry's window is known to
    /// be exact.
    fn match_from_cache(&self, ty: &Ty, world: World, range: &mut WorldRange) -> Option<MethodMatch> {
        let oracle = &*self.oracle;
        if let Some(entry) = self.cache.index.lookup_leaf(ty, world) {
            let mi = entry.payload();
            let method = mi.method();
            let (ti, env) = if !method.sig().has_free_typevars() {
                (ty.clone(), SparamEnv::new())
            } else if oracle.types_equal(ty, mi.spec_types()) {
                (mi.spec_types().clone(), mi.sparam_vals().clone())
            } else {
                oracle.intersect_with_env(ty, method.sig())
            };
            range.narrow(entry.window().range());
            return Some(MethodMatch::new(ti, env, method.clone(), Coverage::FullyCovers));
        }

        let entry = self.cache.index.assoc_by_type(ty, world, true)?;
        let mi = entry.payload();
        let method = mi.method();
        let window = entry.window().range();
        if window.min != method.primary_world() {
            return None;
        }
        let (ti, env) = if !method.sig().has_free_typevars() {
            (ty.clone(), SparamEnv::new())
        } else {
            oracle.intersect_with_env(ty, method.sig())
        };
        range.narrow(window);
        Some(MethodMatch::new(ti, env, method.clone(), Coverage::FullyCovers))
    }

    /// Whether `target` is known more specific than `start` by following
    /// interference edges towards more specific methods.
    pub(crate) fn method_morespecific_via_interferences(&self, target: &Method, start: &Method) -> bool {
        if target.id() == start.id() {
            return false;
        }
        let mut seen = Vec::new();
        self.morespecific_via_interferences_from(target, start, &mut seen)
    }

    fn morespecific_via_interferences_from(&self, target: &Method, start: &Method, seen: &mut Vec<MethodId>) -> bool {
        if in_interferences(start, target) {
            return false;
        }
        if in_interferences(target, start) {
            return true;
        }
        if seen.contains(&start.id()) {
            return false;
        }
        seen.push(start.id());
        for id in start.interferences().iter() {
            let Some(next) = self.registry.method(id) else {
                continue;
            };
            // Only follow edges towards more specific methods.
            if in_interferences(start, &next) {
                continue;
            }
            if self.morespecific_via_interferences_from(target, &next, seen) {
                return true;
            }
        }
        false
    }

    // =========================================================================
    // Public Lookups
    // =========================================================================

    /// Methods applicable to `sig` in `world`, most specific first.
    ///
    /// Methods that could not be ordered against each other are returned
    /// together as [`LookupResult::Ambiguous`]. With a `limit`, a larger
    /// result is reported as [`LookupResult::TooMany`].
    pub fn lookup_matches(&self, sig: &Ty, world: World, limit: Option<usize>) -> LookupResult {
        let mut valid = WorldRange::ALL;
        if trivially_empty(sig) {
            return LookupResult::NoMatch { valid };
        }
        let opts = MatchOptions {
            limit,
            include_ambiguous: true,
            intersections: true,
            cache_result: true,
            want_ambiguity: true,
        };
        match self.ml_matches(sig, opts, world, &mut valid) {
            None => match limit {
                Some(limit) if world <= self.clock.current() => LookupResult::TooMany { limit },
                _ => LookupResult::NoMatch {
                    valid: WorldRange::at(world),
                },
            },
            Some(set) if set.matches.is_empty() => LookupResult::NoMatch { valid },
            Some(set) if set.ambiguous => LookupResult::Ambiguous {
                matches: set.matches,
                valid,
            },
            Some(set) => LookupResult::Matches {
                matches: set.matches,
                valid,
            },
        }
    }

    /// The single most specific method covering `sig` in `world`, with the
    /// worlds over which that answer holds.
    ///
    /// `sig` may be abstract; this is the lookup behind `invoke`.
    pub fn invoke_lookup(&self, sig: &Ty, world: World) -> Option<(MethodMatch, WorldRange)> {
        let mut valid = WorldRange::ALL;
        let matc = self.gf_invoke_lookup(sig, world, true, &mut valid)?;
        Some((matc, valid))
    }

    pub(crate) fn gf_invoke_lookup(
        &self,
        sig: &Ty,
        world: World,
        cache_result: bool,
        range: &mut WorldRange,
    ) -> Option<MethodMatch> {
        if trivially_empty(sig) {
            return None;
        }
        let opts = MatchOptions {
            limit: Some(1),
            include_ambiguous: false,
            intersections: false,
            cache_result,
            want_ambiguity: false,
        };
        let mut set = self.ml_matches(sig, opts, world, range)?;
        if set.matches.len() != 1 {
            return None;
        }
        set.matches.pop()
    }
}

/// Signatures no method can match: non-tuples, the empty tuple, and
/// tuples whose callee slot is empty.
fn trivially_empty(sig: &Ty) -> bool {
    match sig.as_tuple() {
        Some(tuple) => tuple.slot(0).is_none_or(Ty::is_bottom),
        None => true,
    }
}

// =============================================================================
// Ambiguity Sort
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortState {
    Visiting,
    ProcessingInterferences,
    CheckCovers,
    FinalizeScc,
}

struct Frame {
    idx: usize,
    depth: usize,
    cycle: usize,
    interferences: Vec<MethodId>,
    next_interference: usize,
    state: SortState,
}

impl Frame {
    fn new(idx: usize) -> Self {
        Self {
            idx,
            depth: 0,
            cycle: 0,
            interferences: Vec::new(),
            next_interference: 0,
            state: SortState::Visiting,
        }
    }
}

enum Step {
    Continue,
    Descend(usize),
    /// `None` when the limit was exceeded, otherwise 0 once the vertex is
    /// emitted or the depth its cycle resolves at.
    Return(Option<usize>),
}

/// Iterative Tarjan SCC walk over the interference graph of a match set.
///
/// `visited[i]` is 0 before `i` is reached, `1 + depth` while it is on the
/// stack, and 1 once it is emitted or dropped.
struct MatchSorter<'a> {
    oracle: &'a dyn TypeOracle,
    engine: &'a Engine,
    matches: &'a [MethodMatch],
    visited: Vec<usize>,
    stack: Vec<usize>,
    result: Vec<usize>,
    recursion_stack: Vec<MethodId>,
    limit: Option<usize>,
    include_ambiguous: bool,
    has_ambiguity: bool,
    /// 0: no covering match handled yet; 1: the first covering group is
    /// being handled; 2: covering matches are to be dropped.
    found_minmax: u8,
}

impl MatchSorter<'_> {
    fn position(&self, id: MethodId) -> Option<usize> {
        self.matches.iter().position(|m| m.method.id() == id)
    }

    /// Emit `idx` and everything it depends on. `None` when the result
    /// would exceed the limit.
    fn sort(&mut self, idx: usize) -> Option<usize> {
        let mut frames = vec![Frame::new(idx)];
        loop {
            let step = match frames.last_mut() {
                Some(frame) => self.step(frame),
                None => return Some(0),
            };
            match step {
                Step::Continue => {}
                Step::Descend(child) => frames.push(Frame::new(child)),
                Step::Return(result) => {
                    frames.pop();
                    let Some(parent) = frames.last_mut() else {
                        return result;
                    };
                    let cycle = result?;
                    if cycle != 0 && cycle < parent.cycle {
                        parent.cycle = cycle;
                    }
                }
            }
        }
    }

    fn step(&mut self, frame: &mut Frame) -> Step {
        match frame.state {
            SortState::Visiting => {
                let cycle = self.visited[frame.idx];
                if cycle != 0 {
                    return Step::Return(Some(cycle - 1));
                }
                self.stack.push(frame.idx);
                frame.depth = self.stack.len();
                frame.cycle = frame.depth;
                self.visited[frame.idx] = 1 + frame.depth;
                frame.interferences = self.matches[frame.idx].method.interferences().iter().collect();
                frame.state = SortState::ProcessingInterferences;
                Step::Continue
            }
            SortState::ProcessingInterferences => {
                let m = &self.matches[frame.idx].method;
                while frame.next_interference < frame.interferences.len() {
                    let id = frame.interferences[frame.next_interference];
                    frame.next_interference += 1;
                    let Some(child) = self.position(id) else {
                        continue;
                    };
                    if child == frame.idx {
                        continue;
                    }
                    let child_cycle = self.visited[child];
                    if child_cycle == 1 {
                        continue;
                    }
                    if child_cycle != 0 && child_cycle - 1 >= frame.cycle {
                        continue;
                    }
                    if in_interferences(m, &self.matches[child].method) {
                        continue;
                    }
                    // The child is more specific, so it is emitted first.
                    if child_cycle != 0 {
                        let depth = child_cycle - 1;
                        if depth != 0 && depth < frame.cycle {
                            frame.cycle = depth;
                        }
                    } else {
                        return Step::Descend(child);
                    }
                }
                frame.state = SortState::CheckCovers;
                Step::Continue
            }
            SortState::CheckCovers => {
                let matc = &self.matches[frame.idx];
                let subt = matc.coverage != Coverage::NotFullyCovers;
                if subt && self.found_minmax != 0 {
                    if self.found_minmax == 2 {
                        self.visited[frame.idx] = 1;
                    }
                } else if self.check_interferences_covers(&matc.method, &matc.spec_types) {
                    self.visited[frame.idx] = 1;
                } else if self.check_fully_ambiguous(&matc.method, &matc.spec_types) {
                    self.visited[frame.idx] = 1;
                }

                if self.visited[frame.idx] == 1 && self.stack.len() == frame.depth {
                    self.stack.pop();
                    return Step::Return(Some(0));
                }
                if frame.cycle != frame.depth {
                    return Step::Return(Some(frame.cycle));
                }
                frame.state = SortState::FinalizeScc;
                Step::Continue
            }
            SortState::FinalizeScc => {
                let group = frame.depth - 1..self.stack.len();
                if frame.depth != self.stack.len() {
                    let live = self.stack[group.clone()]
                        .iter()
                        .filter(|&&i| self.visited[i] != 1)
                        .count();
                    if live > 1 {
                        self.has_ambiguity = true;
                    }
                }
                for pos in group {
                    let child = self.stack[pos];
                    let subt = self.matches[child].coverage != Coverage::NotFullyCovers;
                    if subt && self.found_minmax != 0 {
                        self.visited[child] = 1;
                    }
                    if self.visited[child] == 1 {
                        continue;
                    }
                    self.visited[child] = 1;
                    if self.limit.is_some_and(|lim| self.result.len() >= lim) {
                        return Step::Return(None);
                    }
                    self.result.push(child);
                }
                while self.stack.len() >= frame.depth {
                    let Some(child) = self.stack.pop() else {
                        break;
                    };
                    // Covering matches after the first minmax group are redundant.
                    if self.matches[child].coverage == Coverage::FullyCovers && self.found_minmax == 1 {
                        self.found_minmax = 2;
                    }
                }
                Step::Return(Some(0))
            }
        }
    }

    /// Whether a more specific match already emitted covers `ti`.
    fn check_interferences_covers(&mut self, m: &Method, ti: &Ty) -> bool {
        self.recursion_stack.clear();
        self.interferences_cover(m, ti)
    }

    fn interferences_cover(&mut self, m: &Method, ti: &Ty) -> bool {
        if self.recursion_stack.contains(&m.id()) {
            return false;
        }
        self.recursion_stack.push(m.id());
        for id in m.interferences().iter() {
            let Some(idx) = self.position(id) else {
                continue;
            };
            let m2 = self.matches[idx].method.clone();
            if in_interferences(m, &m2) {
                continue;
            }
            // Still on the stack: the ambiguity check handles it.
            if self.visited[idx] != 1 {
                continue;
            }
            if self.oracle.is_subtype(ti, m2.sig()) {
                return true;
            }
            if self.interferences_cover(&m2, ti) {
                return true;
            }
        }
        false
    }

    /// Whether `ti` is covered by a match that `m` is ambiguous with.
    fn check_fully_ambiguous(&mut self, m: &Method, ti: &Ty) -> bool {
        for id in m.interferences().iter() {
            let Some(idx) = self.position(id) else {
                continue;
            };
            let m2 = &self.matches[idx].method;
            if !in_interferences(m, m2) {
                continue;
            }
            self.has_ambiguity = true;
            if !self.include_ambiguous && self.oracle.is_subtype(ti, m2.sig()) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{MethodBody, MethodDefinition};
    use crate::testing::engine;
    use meridian_types::FunctionRef;

    fn def(f: &FunctionRef, params: &[Ty]) -> MethodDefinition {
        MethodDefinition::new(f, params.iter().cloned(), MethodBody::new(()))
    }

    fn int() -> Ty {
        Ty::named("Int64")
    }

    fn sigs(result: &LookupResult) -> Vec<Ty> {
        result.matches().iter().map(|m| m.method.sig().clone()).collect()
    }

    // =========================================================================
    // Ordering Tests
    // =========================================================================

    #[test]
    fn test_single_covering_method() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        let m = engine.add_method(def(&f, &[Ty::named("Number")])).unwrap();
        let result = engine.lookup_matches(&f.signature([int()]), engine.world(), None);
        assert!(matches!(result, LookupResult::Matches { .. }));
        assert_eq!(sigs(&result), [m.sig().clone()]);
        assert!(result.matches()[0].fully_covers());
    }

    #[test]
    fn test_partial_match_precedes_covering_minmax() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        engine.add_method(def(&f, &[Ty::Any])).unwrap();
        let number = engine.add_method(def(&f, &[Ty::named("Number")])).unwrap();
        let int_m = engine.add_method(def(&f, &[int()])).unwrap();
        // `Any` is shadowed by the more specific covering `Number`.
        let result = engine.lookup_matches(&f.signature([Ty::named("Real")]), engine.world(), None);
        assert!(!result.is_ambiguous());
        assert_eq!(sigs(&result), [int_m.sig().clone(), number.sig().clone()]);
        assert!(!result.matches()[0].fully_covers());
        assert!(result.matches()[1].fully_covers());
    }

    #[test]
    fn test_ambiguous_pair_reported_together() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        engine.add_method(def(&f, &[int(), Ty::Any])).unwrap();
        engine.add_method(def(&f, &[Ty::Any, int()])).unwrap();
        let result = engine.lookup_matches(&f.signature([int(), int()]), engine.world(), None);
        assert!(result.is_ambiguous());
        assert_eq!(result.matches().len(), 2);
    }

    #[test]
    fn test_ambiguity_resolved_by_tiebreaker() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        engine.add_method(def(&f, &[int(), Ty::Any])).unwrap();
        engine.add_method(def(&f, &[Ty::Any, int()])).unwrap();
        let tie = engine.add_method(def(&f, &[int(), int()])).unwrap();
        let result = engine.lookup_matches(&f.signature([int(), int()]), engine.world(), None);
        assert!(!result.is_ambiguous());
        assert_eq!(sigs(&result), [tie.sig().clone()]);
    }

    // =========================================================================
    // Limit and World Tests
    // =========================================================================

    #[test]
    fn test_limit_exceeded() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        engine.add_method(def(&f, &[int()])).unwrap();
        engine.add_method(def(&f, &[Ty::named("String")])).unwrap();
        let result = engine.lookup_matches(&f.signature([Ty::Any]), engine.world(), Some(1));
        assert!(matches!(result, LookupResult::TooMany { limit: 1 }));
        let result = engine.lookup_matches(&f.signature([Ty::Any]), engine.world(), Some(2));
        assert_eq!(result.matches().len(), 2);
    }

    #[test]
    fn test_valid_range_reflects_later_definitions() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        let number = engine.add_method(def(&f, &[Ty::named("Number")])).unwrap();
        let before = engine.world();
        let int_m = engine.add_method(def(&f, &[int()])).unwrap();
        let result = engine.lookup_matches(&f.signature([int()]), before, None);
        let LookupResult::Matches { matches, valid } = result else {
            panic!("expected matches");
        };
        assert!(Arc::ptr_eq(&matches[0].method, &number));
        assert_eq!(valid, WorldRange::new(number.primary_world(), int_m.primary_world() - 1));
    }

    #[test]
    fn test_future_world_is_not_enumerable() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        engine.add_method(def(&f, &[int()])).unwrap();
        let result = engine.lookup_matches(&f.signature([int()]), engine.world() + 5, None);
        assert!(matches!(result, LookupResult::NoMatch { .. }));
    }

    // =========================================================================
    // Invoke Lookup Tests
    // =========================================================================

    #[test]
    fn test_invoke_lookup_abstract_signature() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        let number = engine.add_method(def(&f, &[Ty::named("Number")])).unwrap();
        engine.add_method(def(&f, &[int()])).unwrap();
        let (matc, valid) = engine
            .invoke_lookup(&f.signature([Ty::named("Number")]), engine.world())
            .unwrap();
        assert!(Arc::ptr_eq(&matc.method, &number));
        assert!(valid.contains(engine.world()));
    }

    #[test]
    fn test_invoke_lookup_rejects_ambiguity() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        engine.add_method(def(&f, &[int(), Ty::Any])).unwrap();
        engine.add_method(def(&f, &[Ty::Any, int()])).unwrap();
        assert!(engine.invoke_lookup(&f.signature([int(), int()]), engine.world()).is_none());
    }

    #[test]
    fn test_morespecific_via_interferences_is_transitive() {
        let (engine, lattice) = engine();
        let f = lattice.declare_function("f");
        let any = engine.add_method(def(&f, &[Ty::Any])).unwrap();
        let real = engine.add_method(def(&f, &[Ty::named("Real")])).unwrap();
        let int_m = engine.add_method(def(&f, &[int()])).unwrap();
        assert!(engine.method_morespecific_via_interferences(&int_m, &real));
        assert!(engine.method_morespecific_via_interferences(&int_m, &any));
        assert!(!engine.method_morespecific_via_interferences(&any, &int_m));
        assert!(!engine.method_morespecific_via_interferences(&int_m, &int_m));
    }
}
