//! Reference Type Lattice
//!
//! A [`TypeOracle`] over a nominal single-inheritance hierarchy extended
//! with tuples, unions, singleton types of types, and bounded type
//! variables.
//!
//! # Rules
//!
//! - Named types are subtypes of their declared ancestors. Names that were
//!   never declared behave as concrete leaves directly under `Any`.
//! - Tuples are covariant; a vararg tail matches any number of trailing
//!   elements.
//! - `Type{T}` is invariant in `T` and a subtype of the kind of `T`.
//! - A variable that occurs more than once in covariant position, and never
//!   invariantly, is diagonal: it only matches dispatch leaves, so
//!   `Tuple{T, T}` accepts `(Int64, Int64)` but not `(Int64, Bool)`.
//! - Specificity is subtyping first, then elementwise over tuples: a tuple
//!   is more specific when every slot is equal or more specific and at
//!   least one slot is strictly so.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::env::SparamEnv;
use crate::oracle::TypeOracle;
use crate::ty::{TupleTy, Ty, TypeName, TypeVar, builtin};
use crate::value::FunctionRef;

// =============================================================================
// Declarations
// =============================================================================

#[derive(Debug, Clone)]
struct TypeDecl {
    supertype: Option<TypeName>,
    is_abstract: bool,
}

/// Nominal hierarchy plus the structural rules above.
#[derive(Debug, Default)]
pub struct TypeLattice {
    decls: RwLock<FxHashMap<TypeName, TypeDecl>>,
}

impl TypeLattice {
    /// Lattice with only the core builtins (`Function`, `Type` and the kinds).
    pub fn new() -> Self {
        let lattice = Self::default();
        lattice.declare_abstract(builtin::FUNCTION, None);
        lattice.declare_abstract(builtin::TYPE, None);
        lattice.declare_concrete(builtin::DATATYPE, Some(builtin::TYPE));
        lattice.declare_concrete(builtin::UNION, Some(builtin::TYPE));
        lattice
    }

    /// Lattice with the core builtins plus the numeric and string towers.
    pub fn with_builtins() -> Self {
        use builtin::*;
        let lattice = Self::new();
        lattice.declare_abstract(NUMBER, None);
        lattice.declare_abstract(REAL, Some(NUMBER));
        lattice.declare_abstract(INTEGER, Some(REAL));
        lattice.declare_abstract(SIGNED, Some(INTEGER));
        lattice.declare_concrete(INT64, Some(SIGNED));
        lattice.declare_concrete(INT32, Some(SIGNED));
        lattice.declare_concrete(BOOL, Some(INTEGER));
        lattice.declare_abstract(ABSTRACT_FLOAT, Some(REAL));
        lattice.declare_concrete(FLOAT64, Some(ABSTRACT_FLOAT));
        lattice.declare_abstract(ABSTRACT_STRING, None);
        lattice.declare_concrete(STRING, Some(ABSTRACT_STRING));
        lattice.declare_concrete(NOTHING, None);
        lattice
    }

    /// Declare an abstract nominal type.
    pub fn declare_abstract(&self, name: &str, supertype: Option<&str>) -> Ty {
        self.declare(name, supertype, true)
    }

    /// Declare a concrete nominal type.
    pub fn declare_concrete(&self, name: &str, supertype: Option<&str>) -> Ty {
        self.declare(name, supertype, false)
    }

    /// Declare the singleton type of a new generic function.
    pub fn declare_function(&self, name: &str) -> FunctionRef {
        let type_name = format!("typeof({name})");
        self.declare(&type_name, Some(builtin::FUNCTION), false);
        FunctionRef::new(name, TypeName::new(type_name))
    }

    /// Existing declarations are kept; an unknown supertype is declared
    /// abstract under `Any` first.
    fn declare(&self, name: &str, supertype: Option<&str>, is_abstract: bool) -> Ty {
        let type_name = TypeName::new(name);
        let mut decls = self.decls.write();
        let supertype = supertype.map(TypeName::new);
        if let Some(sup) = &supertype {
            decls.entry(sup.clone()).or_insert(TypeDecl {
                supertype: None,
                is_abstract: true,
            });
        }
        decls.entry(type_name.clone()).or_insert(TypeDecl {
            supertype,
            is_abstract,
        });
        Ty::Named(type_name)
    }

    fn named_subtype(&self, a: &TypeName, b: &TypeName) -> bool {
        if a == b {
            return true;
        }
        let decls = self.decls.read();
        let mut current = decls.get(a).and_then(|d| d.supertype.clone());
        while let Some(name) = current {
            if &name == b {
                return true;
            }
            current = decls.get(&name).and_then(|d| d.supertype.clone());
        }
        false
    }

    fn kind_name(&self, t: &Ty) -> TypeName {
        match self.kind_of(t) {
            Ty::Named(name) => name,
            _ => TypeName::new(builtin::DATATYPE),
        }
    }

    fn eq_plain(&self, a: &Ty, b: &Ty) -> bool {
        a == b || (self.is_subtype(a, b) && self.is_subtype(b, a))
    }
}

// =============================================================================
// Variable Bindings
// =============================================================================

/// Bindings for the variables of the right-hand type during one query.
#[derive(Clone, Default)]
struct Bindings {
    vars: SmallVec<[(Arc<str>, Ty); 4]>,
    diagonal: SmallVec<[Arc<str>; 2]>,
}

impl Bindings {
    fn for_rhs(b: &Ty) -> Self {
        let mut counts: SmallVec<[(Arc<str>, u32, u32); 4]> = SmallVec::new();
        count_occurrences(b, false, &mut counts);
        Self {
            vars: SmallVec::new(),
            diagonal: counts
                .into_iter()
                .filter(|(_, covariant, invariant)| *covariant >= 2 && *invariant == 0)
                .map(|(name, _, _)| name)
                .collect(),
        }
    }

    fn get(&self, name: &str) -> Option<&Ty> {
        self.vars.iter().find(|(n, _)| &**n == name).map(|(_, t)| t)
    }

    fn bind(&mut self, name: &Arc<str>, ty: Ty) {
        match self.vars.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = ty,
            None => self.vars.push((name.clone(), ty)),
        }
    }

    fn is_diagonal(&self, name: &str) -> bool {
        self.diagonal.iter().any(|n| &**n == name)
    }
}

fn count_occurrences(t: &Ty, invariant: bool, counts: &mut SmallVec<[(Arc<str>, u32, u32); 4]>) {
    match t {
        Ty::Any | Ty::Bottom | Ty::Named(_) => {}
        Ty::Var(var) => {
            let idx = match counts.iter().position(|(n, _, _)| *n == var.name) {
                Some(idx) => idx,
                None => {
                    counts.push((var.name.clone(), 0, 0));
                    counts.len() - 1
                }
            };
            if invariant {
                counts[idx].2 += 1;
            } else {
                counts[idx].1 += 1;
            }
        }
        Ty::TypeOf(inner) => count_occurrences(inner, true, counts),
        Ty::Union(members) => members
            .iter()
            .for_each(|m| count_occurrences(m, invariant, counts)),
        Ty::Tuple(tuple) => {
            for elem in &tuple.elems {
                count_occurrences(elem, invariant, counts);
            }
            if let Some(tail) = &tuple.vararg {
                count_occurrences(tail, invariant, counts);
            }
        }
    }
}

/// A variable narrowed by an intersection but not pinned to a leaf.
fn narrowed_marker<'a>(bound: &'a Ty, name: &str) -> Option<&'a TypeVar> {
    match bound {
        Ty::Var(var) if &*var.name == name => Some(var),
        _ => None,
    }
}

// =============================================================================
// Subtyping
// =============================================================================

impl TypeLattice {
    fn sub(&self, a: &Ty, b: &Ty, env: &mut Bindings) -> bool {
        match (a, b) {
            (Ty::Bottom, _) => true,
            (_, Ty::Any) => true,
            (_, Ty::Var(var)) => self.sub_var(a, var, env),
            (Ty::Union(members), _) => members.iter().all(|m| self.sub(m, b, env)),
            (Ty::Var(var), _) => self.sub(&var.ub, b, env),
            (_, Ty::Union(members)) => members.iter().any(|m| {
                let mut trial = env.clone();
                let ok = self.sub(a, m, &mut trial);
                if ok {
                    *env = trial;
                }
                ok
            }),
            (Ty::Any, _) => false,
            (Ty::Named(x), Ty::Named(y)) => self.named_subtype(x, y),
            (Ty::TypeOf(x), Ty::TypeOf(y)) => self.param_match(x, y, env),
            (Ty::TypeOf(x), Ty::Named(y)) => self.named_subtype(&self.kind_name(x), y),
            (Ty::Tuple(x), Ty::Tuple(y)) => self.sub_tuple(x, y, env),
            _ => false,
        }
    }

    fn sub_var(&self, a: &Ty, var: &TypeVar, env: &mut Bindings) -> bool {
        if let Some(bound) = env.get(&var.name).cloned() {
            if let Some(marker) = narrowed_marker(&bound, &var.name) {
                let ub = (*marker.ub).clone();
                return self.sub_unbound(a, var, &ub, env);
            }
            return if env.is_diagonal(&var.name) {
                self.eq_plain(a, &bound)
            } else {
                self.is_subtype(a, &bound)
            };
        }
        self.sub_unbound(a, var, &var.ub, env)
    }

    fn sub_unbound(&self, a: &Ty, var: &TypeVar, ub: &Ty, env: &mut Bindings) -> bool {
        if !self.sub(a, ub, env) {
            return false;
        }
        if env.is_diagonal(&var.name)
            && !(a.is_bottom() || matches!(a, Ty::Var(_)) || self.is_dispatch_leaf(a))
        {
            return false;
        }
        env.bind(&var.name, a.clone());
        true
    }

    /// Invariant match of the parameter of `Type{_}`.
    fn param_match(&self, x: &Ty, y: &Ty, env: &mut Bindings) -> bool {
        let Ty::Var(var) = y else {
            return self.eq_plain(x, y);
        };
        match env.get(&var.name).cloned() {
            Some(bound) => match narrowed_marker(&bound, &var.name) {
                Some(marker) => {
                    let ok = self.is_subtype(x, &marker.ub);
                    if ok {
                        env.bind(&var.name, x.clone());
                    }
                    ok
                }
                None => self.eq_plain(x, &bound),
            },
            None => {
                let ok = self.is_subtype(x, &var.ub);
                if ok {
                    env.bind(&var.name, x.clone());
                }
                ok
            }
        }
    }

    fn sub_tuple(&self, x: &TupleTy, y: &TupleTy, env: &mut Bindings) -> bool {
        let (nx, ny) = (x.len(), y.len());
        match (&x.vararg, &y.vararg) {
            (None, None) => nx == ny && x.elems.iter().zip(&y.elems).all(|(a, b)| self.sub(a, b, env)),
            (None, Some(_)) => {
                nx >= ny
                    && x.elems.iter().enumerate().all(|(i, a)| match y.slot(i) {
                        Some(b) => self.sub(a, b, env),
                        None => false,
                    })
            }
            (Some(_), None) => false,
            (Some(xt), Some(yt)) => {
                nx >= ny
                    && x.elems.iter().enumerate().all(|(i, a)| match y.slot(i) {
                        Some(b) => self.sub(a, b, env),
                        None => false,
                    })
                    && self.sub(xt, yt, env)
            }
        }
    }
}

// =============================================================================
// Intersection
// =============================================================================

impl TypeLattice {
    fn meet(&self, a: &Ty, b: &Ty, env: &mut Bindings) -> Ty {
        match (a, b) {
            (Ty::Bottom, _) | (_, Ty::Bottom) => Ty::Bottom,
            (_, Ty::Var(var)) => self.meet_var(a, var, env),
            (Ty::Any, _) => b.clone(),
            (_, Ty::Any) => a.clone(),
            (Ty::Var(var), _) => self.meet(&var.ub, b, env),
            (Ty::Union(members), _) => self.meet_union(members, b, env, true),
            (_, Ty::Union(members)) => self.meet_union(members, a, env, false),
            (Ty::Named(x), Ty::Named(y)) => {
                if self.named_subtype(x, y) {
                    a.clone()
                } else if self.named_subtype(y, x) {
                    b.clone()
                } else {
                    Ty::Bottom
                }
            }
            (Ty::TypeOf(x), Ty::TypeOf(y)) => {
                if self.param_match(x, y, env) {
                    a.clone()
                } else {
                    Ty::Bottom
                }
            }
            (Ty::TypeOf(x), Ty::Named(y)) => {
                if self.named_subtype(&self.kind_name(x), y) {
                    a.clone()
                } else {
                    Ty::Bottom
                }
            }
            (Ty::Named(x), Ty::TypeOf(y)) => {
                if self.named_subtype(&self.kind_name(y), x) {
                    b.clone()
                } else {
                    Ty::Bottom
                }
            }
            (Ty::Tuple(x), Ty::Tuple(y)) => self.meet_tuple(x, y, env),
            _ => Ty::Bottom,
        }
    }

    fn meet_union(&self, members: &[Ty], other: &Ty, env: &mut Bindings, members_left: bool) -> Ty {
        let mut out = Vec::with_capacity(members.len());
        let mut chosen: Option<Bindings> = None;
        for member in members {
            let mut trial = env.clone();
            let t = if members_left {
                self.meet(member, other, &mut trial)
            } else {
                self.meet(other, member, &mut trial)
            };
            if !t.is_bottom() {
                if chosen.is_none() {
                    chosen = Some(trial);
                }
                out.push(t);
            }
        }
        if let Some(bindings) = chosen {
            *env = bindings;
        }
        Ty::union(out)
    }

    fn meet_var(&self, a: &Ty, var: &TypeVar, env: &mut Bindings) -> Ty {
        let ub = match env.get(&var.name).cloned() {
            Some(bound) => match narrowed_marker(&bound, &var.name) {
                Some(marker) => (*marker.ub).clone(),
                None => {
                    let m = self.meet(a, &bound, &mut Bindings::default());
                    if !m.is_bottom() {
                        env.bind(&var.name, m.clone());
                    }
                    return m;
                }
            },
            None => (*var.ub).clone(),
        };
        let m = self.meet(a, &ub, env);
        if m.is_bottom() {
            return Ty::Bottom;
        }
        if env.is_diagonal(&var.name) && !(self.is_dispatch_leaf(&m) || matches!(m, Ty::Var(_))) {
            let narrowed = Ty::Var(TypeVar {
                name: var.name.clone(),
                ub: Box::new(m),
            });
            env.bind(&var.name, narrowed.clone());
            return narrowed;
        }
        env.bind(&var.name, m.clone());
        m
    }

    fn meet_tuple(&self, x: &TupleTy, y: &TupleTy, env: &mut Bindings) -> Ty {
        let (nx, ny) = (x.len(), y.len());
        let len = match (&x.vararg, &y.vararg) {
            (None, None) if nx != ny => return Ty::Bottom,
            (None, None) => nx,
            (None, Some(_)) if nx < ny => return Ty::Bottom,
            (None, Some(_)) => nx,
            (Some(_), None) if ny < nx => return Ty::Bottom,
            (Some(_), None) => ny,
            (Some(_), Some(_)) => nx.max(ny),
        };
        let mut elems = Vec::with_capacity(len);
        for i in 0..len {
            let (Some(a), Some(b)) = (x.slot(i), y.slot(i)) else {
                return Ty::Bottom;
            };
            let m = self.meet(a, b, env);
            if m.is_bottom() {
                return Ty::Bottom;
            }
            elems.push(m);
        }
        match (&x.vararg, &y.vararg) {
            (Some(xt), Some(yt)) => {
                let tail = self.meet(xt, yt, env);
                Ty::vararg_tuple(elems, tail)
            }
            _ => Ty::tuple(elems),
        }
    }
}

// =============================================================================
// Specificity
// =============================================================================

impl TypeLattice {
    fn tuple_morespecific(&self, x: &TupleTy, y: &TupleTy) -> bool {
        let len = x.len().max(y.len());
        let mut strictly = false;
        for i in 0..len {
            let (Some(a), Some(b)) = (x.slot(i), y.slot(i)) else {
                return false;
            };
            if self.types_equal(a, b) {
                continue;
            }
            if !self.morespecific(a, b) {
                return false;
            }
            strictly = true;
        }
        match (&x.vararg, &y.vararg) {
            (Some(_), None) => false,
            (Some(xt), Some(yt)) => {
                if self.types_equal(xt, yt) {
                    strictly
                } else {
                    self.morespecific(xt, yt)
                }
            }
            (None, Some(_)) => true,
            (None, None) => strictly,
        }
    }
}

// =============================================================================
// Oracle
// =============================================================================

impl TypeOracle for TypeLattice {
    fn is_subtype(&self, a: &Ty, b: &Ty) -> bool {
        if a == b {
            return true;
        }
        let mut env = Bindings::for_rhs(b);
        self.sub(a, b, &mut env)
    }

    fn intersect_with_env(&self, a: &Ty, b: &Ty) -> (Ty, SparamEnv) {
        let mut env = Bindings::for_rhs(b);
        let t = self.meet(a, b, &mut env);
        if t.is_bottom() {
            return (Ty::Bottom, SparamEnv::new());
        }
        let mut sparams = SparamEnv::new();
        for var in b.typevars() {
            let value = env
                .get(&var.name)
                .cloned()
                .unwrap_or_else(|| Ty::Var(var.clone()));
            sparams.bind(var.name.clone(), value);
        }
        (t, sparams)
    }

    fn morespecific(&self, a: &Ty, b: &Ty) -> bool {
        let ab = self.is_subtype(a, b);
        let ba = self.is_subtype(b, a);
        if ab && !ba {
            return true;
        }
        if ba {
            return false;
        }
        match (a, b) {
            (Ty::Tuple(x), Ty::Tuple(y)) => self.tuple_morespecific(x, y),
            (Ty::Var(var), _) => self.morespecific(&var.ub, b),
            _ => false,
        }
    }

    fn is_concrete(&self, t: &Ty) -> bool {
        match t {
            Ty::Named(name) => self
                .decls
                .read()
                .get(name)
                .is_none_or(|decl| !decl.is_abstract),
            Ty::Tuple(tuple) => {
                tuple.vararg.is_none() && tuple.elems.iter().all(|e| self.is_concrete(e))
            }
            _ => false,
        }
    }

    fn supertype(&self, name: &TypeName) -> Option<TypeName> {
        self.decls.read().get(name).and_then(|d| d.supertype.clone())
    }
}
