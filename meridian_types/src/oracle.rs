//! Type Oracle
//!
//! The dispatch engine never inspects types beyond their structure; every
//! lattice question goes through this trait. The engine relies on the
//! oracle being a pure function of its inputs for the lifetime of the
//! engine: answers must not change while methods are being looked up.

use crate::env::SparamEnv;
use crate::ty::{Ty, TypeName, builtin};

/// Subtyping, intersection, and specificity queries over [`Ty`].
pub trait TypeOracle: Send + Sync {
    /// `a <: b`.
    fn is_subtype(&self, a: &Ty, b: &Ty) -> bool;

    /// Intersection of `a` and `b`, with the bindings of `b`'s type
    /// variables. Unbound variables map to themselves. Returns `Bottom`
    /// and an empty environment when the types are disjoint.
    fn intersect_with_env(&self, a: &Ty, b: &Ty) -> (Ty, SparamEnv);

    /// Whether `a` is strictly more specific than `b`.
    fn morespecific(&self, a: &Ty, b: &Ty) -> bool;

    /// Whether `t` is a concrete (instantiable, leaf) type.
    fn is_concrete(&self, t: &Ty) -> bool;

    /// Declared supertype of a nominal type; `None` means `Any`.
    fn supertype(&self, name: &TypeName) -> Option<TypeName>;

    /// Intersection of `a` and `b`.
    fn intersect(&self, a: &Ty, b: &Ty) -> Ty {
        self.intersect_with_env(a, b).0
    }

    /// True when `t` mentions a type variable.
    fn has_free_typevars(&self, t: &Ty) -> bool {
        t.has_free_typevars()
    }

    /// Mutual subtyping.
    fn types_equal(&self, a: &Ty, b: &Ty) -> bool {
        a == b || (self.is_subtype(a, b) && self.is_subtype(b, a))
    }

    /// True when no value inhabits both types.
    fn has_empty_intersection(&self, a: &Ty, b: &Ty) -> bool {
        self.intersect(a, b).is_bottom()
    }

    /// True for an element type that pins down one dispatch target: a
    /// concrete type or the singleton type of a closed type.
    fn is_dispatch_leaf(&self, t: &Ty) -> bool {
        match t {
            Ty::TypeOf(inner) => !inner.has_free_typevars(),
            _ => self.is_concrete(t),
        }
    }

    /// True for a fixed-length tuple of dispatch leaves, the shape of the
    /// argument tuple of an actual call.
    fn is_dispatch_tuple(&self, t: &Ty) -> bool {
        match t {
            Ty::Tuple(tuple) => {
                tuple.vararg.is_none() && tuple.elems.iter().all(|e| self.is_dispatch_leaf(e))
            }
            _ => false,
        }
    }

    /// Kind of the type value `t` (the type of `t` itself).
    fn kind_of(&self, t: &Ty) -> Ty {
        match t {
            Ty::Union(_) => Ty::named(builtin::UNION),
            _ => Ty::named(builtin::DATATYPE),
        }
    }

    /// True when `t` is a kind.
    fn is_kind(&self, t: &Ty) -> bool {
        matches!(t, Ty::Named(n) if n.is(builtin::DATATYPE) || n.is(builtin::UNION))
    }
}
