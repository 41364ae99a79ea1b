//! Static parameter environments.
//!
//! An environment maps the type variables of a method signature to the
//! types they were bound to by an intersection. Bindings keep the order in
//! which the variables first occur in the signature, so two environments
//! computed against the same signature compare equal exactly when their
//! bindings agree.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::ty::Ty;

/// Ordered type-variable bindings.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct SparamEnv {
    bindings: SmallVec<[(Arc<str>, Ty); 2]>,
}

impl SparamEnv {
    /// Empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binding for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&Ty> {
        self.bindings
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|(_, ty)| ty)
    }

    /// Bind `name`, replacing any existing binding in place.
    pub fn bind(&mut self, name: impl Into<Arc<str>>, ty: Ty) {
        let name = name.into();
        match self.bindings.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = ty,
            None => self.bindings.push((name, ty)),
        }
    }

    /// Number of bindings.
    #[inline]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Bindings in signature order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Ty)> {
        self.bindings.iter().map(|(n, t)| (&**n, t))
    }

    /// Bound values in signature order.
    pub fn values(&self) -> impl Iterator<Item = &Ty> {
        self.bindings.iter().map(|(_, t)| t)
    }

    /// True when some variable was left unbound by the intersection.
    pub fn has_unmatched(&self) -> bool {
        self.values().any(|t| matches!(t, Ty::Var(_)))
    }
}

impl std::fmt::Debug for SparamEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_replaces_in_place() {
        let mut env = SparamEnv::new();
        env.bind("T", Ty::Any);
        env.bind("S", Ty::named("Int64"));
        env.bind("T", Ty::named("String"));
        let names: Vec<_> = env.iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, ["T", "S"]);
        assert_eq!(env.get("T"), Some(&Ty::named("String")));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_unmatched() {
        let mut env = SparamEnv::new();
        env.bind("T", Ty::named("Int64"));
        assert!(!env.has_unmatched());
        env.bind("S", Ty::var("S", Ty::Any));
        assert!(env.has_unmatched());
    }
}
