//! Signature Types
//!
//! The structural type language used by method signatures, cache keys, and
//! call-site argument tuples:
//!
//! - `Any` and `Bottom` (the empty union) bound the lattice
//! - `Named` types form a nominal single-inheritance tree
//! - `Tuple` types carry an optional unbounded vararg tail
//! - `TypeOf(T)` is the singleton type of the type value `T`
//! - `Var` is a type variable with an upper bound
//!
//! Unions are normalized on construction so structural equality is a
//! reasonable first approximation of type equality.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

// =============================================================================
// Builtin Names
// =============================================================================

/// Names of the builtin nominal types known to every lattice.
pub mod builtin {
    /// Supertype of every generic function's singleton type.
    pub const FUNCTION: &str = "Function";
    /// Abstract supertype of every type-of-a-type.
    pub const TYPE: &str = "Type";
    /// Kind of nominal and tuple types.
    pub const DATATYPE: &str = "DataType";
    /// Kind of union types.
    pub const UNION: &str = "Union";
    pub const NUMBER: &str = "Number";
    pub const REAL: &str = "Real";
    pub const INTEGER: &str = "Integer";
    pub const SIGNED: &str = "Signed";
    pub const INT64: &str = "Int64";
    pub const INT32: &str = "Int32";
    pub const BOOL: &str = "Bool";
    pub const ABSTRACT_FLOAT: &str = "AbstractFloat";
    pub const FLOAT64: &str = "Float64";
    pub const ABSTRACT_STRING: &str = "AbstractString";
    pub const STRING: &str = "String";
    pub const NOTHING: &str = "Nothing";
}

// =============================================================================
// Type Names
// =============================================================================

/// Interned-by-value name of a nominal type.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeName(Arc<str>);

impl TypeName {
    /// Create a type name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The `Function` type name.
    pub fn function() -> Self {
        Self::new(builtin::FUNCTION)
    }

    /// The `Type` type name.
    pub fn type_type() -> Self {
        Self::new(builtin::TYPE)
    }

    /// Name as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether this is the given builtin name.
    #[inline]
    pub fn is(&self, name: &str) -> bool {
        &*self.0 == name
    }
}

impl fmt::Debug for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Type Variables
// =============================================================================

/// A type variable with an upper bound.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeVar {
    /// Variable name, unique within one signature.
    pub name: Arc<str>,
    /// Upper bound (`Any` when unconstrained).
    pub ub: Box<Ty>,
}

impl fmt::Debug for TypeVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if matches!(*self.ub, Ty::Any) {
            f.write_str(&self.name)
        } else {
            write!(f, "{}<:{}", self.name, self.ub)
        }
    }
}

// =============================================================================
// Tuple Types
// =============================================================================

/// A tuple type with fixed elements and an optional unbounded tail.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TupleTy {
    /// Fixed leading element types.
    pub elems: Vec<Ty>,
    /// Element type of the `Vararg` tail, if any.
    pub vararg: Option<Box<Ty>>,
}

impl TupleTy {
    /// Number of fixed elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    /// True when there are no fixed elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// True when the tuple has a vararg tail.
    #[inline]
    pub fn is_vararg(&self) -> bool {
        self.vararg.is_some()
    }

    /// Type of slot `i`, reading into the vararg tail past the fixed elements.
    pub fn slot(&self, i: usize) -> Option<&Ty> {
        self.elems
            .get(i)
            .or_else(|| self.vararg.as_deref())
    }
}

// =============================================================================
// Types
// =============================================================================

/// A signature type.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Ty {
    /// Top of the lattice.
    Any,
    /// The empty type, `Union{}`.
    Bottom,
    /// Nominal type.
    Named(TypeName),
    /// Normalized union of at least two members.
    Union(Vec<Ty>),
    /// Tuple type.
    Tuple(TupleTy),
    /// Singleton type of a type value, `Type{T}`.
    TypeOf(Box<Ty>),
    /// Type variable.
    Var(TypeVar),
}

impl Ty {
    /// Nominal type by name.
    pub fn named(name: impl AsRef<str>) -> Self {
        Ty::Named(TypeName::new(name))
    }

    /// Fixed-length tuple type.
    pub fn tuple(elems: impl IntoIterator<Item = Ty>) -> Self {
        Ty::Tuple(TupleTy {
            elems: elems.into_iter().collect(),
            vararg: None,
        })
    }

    /// Tuple type with a vararg tail. A `Bottom` tail collapses to a fixed tuple.
    pub fn vararg_tuple(elems: impl IntoIterator<Item = Ty>, tail: Ty) -> Self {
        let vararg = if tail.is_bottom() {
            None
        } else {
            Some(Box::new(tail))
        };
        Ty::Tuple(TupleTy {
            elems: elems.into_iter().collect(),
            vararg,
        })
    }

    /// `Type{T}`.
    pub fn type_of(ty: Ty) -> Self {
        Ty::TypeOf(Box::new(ty))
    }

    /// Type variable `name <: ub`.
    pub fn var(name: impl AsRef<str>, ub: Ty) -> Self {
        Ty::Var(TypeVar {
            name: Arc::from(name.as_ref()),
            ub: Box::new(ub),
        })
    }

    /// Normalized union: nested unions are flattened, `Bottom` members are
    /// dropped, `Any` absorbs everything, and members are sorted and deduped.
    pub fn union(members: impl IntoIterator<Item = Ty>) -> Self {
        let mut flat: Vec<Ty> = Vec::new();
        for member in members {
            match member {
                Ty::Bottom => {}
                Ty::Any => return Ty::Any,
                Ty::Union(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        flat.sort();
        flat.dedup();
        match flat.len() {
            0 => Ty::Bottom,
            1 => flat.pop().unwrap_or(Ty::Bottom),
            _ => Ty::Union(flat),
        }
    }

    /// True for `Union{}`.
    #[inline]
    pub fn is_bottom(&self) -> bool {
        matches!(self, Ty::Bottom)
    }

    /// True for `Any`.
    #[inline]
    pub fn is_any(&self) -> bool {
        matches!(self, Ty::Any)
    }

    /// Nominal name, if this is a named type.
    #[inline]
    pub fn as_named(&self) -> Option<&TypeName> {
        match self {
            Ty::Named(name) => Some(name),
            _ => None,
        }
    }

    /// Tuple view, if this is a tuple type.
    #[inline]
    pub fn as_tuple(&self) -> Option<&TupleTy> {
        match self {
            Ty::Tuple(tuple) => Some(tuple),
            _ => None,
        }
    }

    /// Type of tuple slot `i` (see [`TupleTy::slot`]).
    pub fn slot(&self, i: usize) -> Option<&Ty> {
        self.as_tuple().and_then(|t| t.slot(i))
    }

    /// True when any type variable occurs in this type.
    pub fn has_free_typevars(&self) -> bool {
        match self {
            Ty::Any | Ty::Bottom | Ty::Named(_) => false,
            Ty::Var(_) => true,
            Ty::Union(members) => members.iter().any(Ty::has_free_typevars),
            Ty::TypeOf(inner) => inner.has_free_typevars(),
            Ty::Tuple(tuple) => {
                tuple.elems.iter().any(Ty::has_free_typevars)
                    || tuple.vararg.as_deref().is_some_and(Ty::has_free_typevars)
            }
        }
    }

    /// Type variables in first-occurrence order, each listed once.
    pub fn typevars(&self) -> SmallVec<[TypeVar; 2]> {
        let mut out = SmallVec::new();
        self.collect_typevars(&mut out);
        out
    }

    fn collect_typevars(&self, out: &mut SmallVec<[TypeVar; 2]>) {
        match self {
            Ty::Any | Ty::Bottom | Ty::Named(_) => {}
            Ty::Var(var) => {
                if !out.iter().any(|v| v.name == var.name) {
                    out.push(var.clone());
                }
                var.ub.collect_typevars(out);
            }
            Ty::Union(members) => members.iter().for_each(|m| m.collect_typevars(out)),
            Ty::TypeOf(inner) => inner.collect_typevars(out),
            Ty::Tuple(tuple) => {
                tuple.elems.iter().for_each(|e| e.collect_typevars(out));
                if let Some(tail) = &tuple.vararg {
                    tail.collect_typevars(out);
                }
            }
        }
    }

    /// Replace every variable bound in `env` with its binding.
    pub fn substitute(&self, env: &crate::env::SparamEnv) -> Ty {
        match self {
            Ty::Any | Ty::Bottom | Ty::Named(_) => self.clone(),
            Ty::Var(var) => match env.get(&var.name) {
                Some(bound) => bound.clone(),
                None => self.clone(),
            },
            Ty::Union(members) => Ty::union(members.iter().map(|m| m.substitute(env))),
            Ty::TypeOf(inner) => Ty::type_of(inner.substitute(env)),
            Ty::Tuple(tuple) => {
                let elems = tuple.elems.iter().map(|e| e.substitute(env));
                match &tuple.vararg {
                    Some(tail) => Ty::vararg_tuple(elems, tail.substitute(env)),
                    None => Ty::tuple(elems),
                }
            }
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Any => f.write_str("Any"),
            Ty::Bottom => f.write_str("Union{}"),
            Ty::Named(name) => write!(f, "{name}"),
            Ty::Var(var) => write!(f, "{var:?}"),
            Ty::TypeOf(inner) => write!(f, "Type{{{inner}}}"),
            Ty::Union(members) => {
                f.write_str("Union{")?;
                write_list(f, members.iter())?;
                f.write_str("}")
            }
            Ty::Tuple(tuple) => {
                f.write_str("Tuple{")?;
                write_list(f, tuple.elems.iter())?;
                if let Some(tail) = &tuple.vararg {
                    if !tuple.elems.is_empty() {
                        f.write_str(", ")?;
                    }
                    write!(f, "Vararg{{{tail}}}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl fmt::Debug for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn write_list<'a>(f: &mut fmt::Formatter<'_>, items: impl Iterator<Item = &'a Ty>) -> fmt::Result {
    for (i, item) in items.enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}
