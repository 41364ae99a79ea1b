//! Runtime values.
//!
//! Values carry just enough structure for dispatch: every value reports its
//! type, and generic functions are values whose type is their own
//! singleton type.

use std::fmt;
use std::sync::Arc;

use crate::ty::{Ty, TypeName, builtin};

/// Handle to a generic function.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FunctionRef {
    name: Arc<str>,
    ty: TypeName,
}

impl FunctionRef {
    /// Function handle with the given singleton type name.
    pub fn new(name: impl AsRef<str>, ty: TypeName) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            ty,
        }
    }

    /// Function name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the singleton type.
    #[inline]
    pub fn type_name(&self) -> &TypeName {
        &self.ty
    }

    /// The singleton type, which occupies slot 0 of every signature.
    pub fn ty(&self) -> Ty {
        Ty::Named(self.ty.clone())
    }

    /// Signature tuple for this function with fixed parameters.
    pub fn signature(&self, params: impl IntoIterator<Item = Ty>) -> Ty {
        Ty::tuple(std::iter::once(self.ty()).chain(params))
    }

    /// Signature tuple for this function with a vararg tail.
    pub fn vararg_signature(&self, params: impl IntoIterator<Item = Ty>, tail: Ty) -> Ty {
        Ty::vararg_tuple(std::iter::once(self.ty()).chain(params), tail)
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Instance of a user-declared nominal type.
#[derive(Clone, Debug, PartialEq)]
pub struct Object {
    /// Concrete type of the object.
    pub ty: TypeName,
    /// Field values.
    pub fields: Arc<[Value]>,
}

/// A runtime value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nothing,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    /// A type used as a value; dispatches as `Type{T}`.
    Type(Ty),
    Function(FunctionRef),
    Object(Object),
}

impl Value {
    /// String value.
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    /// Instance of `ty` with no fields.
    pub fn object(ty: impl AsRef<str>) -> Self {
        Value::Object(Object {
            ty: TypeName::new(ty),
            fields: Arc::from(Vec::new()),
        })
    }

    /// The dispatch type of this value.
    pub fn type_of(&self) -> Ty {
        match self {
            Value::Nothing => Ty::named(builtin::NOTHING),
            Value::Bool(_) => Ty::named(builtin::BOOL),
            Value::Int(_) => Ty::named(builtin::INT64),
            Value::Float(_) => Ty::named(builtin::FLOAT64),
            Value::Str(_) => Ty::named(builtin::STRING),
            Value::Type(t) => Ty::type_of(t.clone()),
            Value::Function(f) => f.ty(),
            Value::Object(obj) => Ty::Named(obj.ty.clone()),
        }
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<FunctionRef> for Value {
    fn from(f: FunctionRef) -> Self {
        Value::Function(f)
    }
}
