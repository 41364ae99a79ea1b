//! Type-name backedges.
//!
//! When inference finds no method for a call signature it still depends on
//! that signature staying unmatched. Such dependencies are filed under the
//! "top" type name of the signature's first slot: the ancestor just below
//! `Function` or `Any`. A new method only has to inspect the lists of the
//! type names its own first slot can reach.

use std::sync::Arc;

use meridian_types::{Ty, TypeName, TypeOracle};
use rustc_hash::FxHashMap;

use crate::code::CodeInstance;

const EXACTLY_ANY: u8 = 1 << 0;
const HAVE_TYPE: u8 = 1 << 1;
const EXACTLY_TYPE: u8 = 1 << 2;
const HAVE_FUNCTION: u8 = 1 << 3;
const EXACTLY_FUNCTION: u8 = 1 << 4;

/// Visit the top type names that the first slot of `argtypes` can reach.
///
/// `f` receives each name and whether it was named explicitly. With
/// `all_subtypes`, the walk also reports the catch-all keys (`Function`,
/// `Type`, `Any`); it returns false when the first slot is so general that
/// every key must be considered instead.
pub(crate) fn foreach_top_typename(
    oracle: &dyn TypeOracle,
    argtypes: &Ty,
    all_subtypes: bool,
    mut f: impl FnMut(&TypeName, bool),
) -> bool {
    let mut facts = 0u8;
    walk(oracle, argtypes, Slot::Tuple, &mut facts, &mut f);
    if !all_subtypes {
        return true;
    }
    if facts & (EXACTLY_ANY | EXACTLY_TYPE | EXACTLY_FUNCTION) != 0 {
        return false;
    }
    if facts & HAVE_FUNCTION != 0 {
        f(&TypeName::function(), false);
    }
    if facts & HAVE_TYPE != 0 {
        f(&TypeName::type_type(), false);
    }
    f(&TypeName::new("Any"), false);
    true
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Looking at the whole signature tuple.
    Tuple,
    /// Looking at the first slot.
    First,
    /// Looking at the parameter of a `Type{_}` in the first slot.
    TypeParam,
}

fn walk(
    oracle: &dyn TypeOracle,
    ty: &Ty,
    slot: Slot,
    facts: &mut u8,
    f: &mut impl FnMut(&TypeName, bool),
) {
    match ty {
        Ty::Var(var) => walk(oracle, &var.ub, slot, facts, f),
        Ty::Union(members) => members.iter().for_each(|m| walk(oracle, m, slot, facts, f)),
        Ty::Tuple(tuple) if slot == Slot::Tuple => {
            if let Some(first) = tuple.slot(0) {
                walk(oracle, first, Slot::First, facts, f);
            }
        }
        Ty::Any if slot != Slot::Tuple => {
            *facts |= if slot == Slot::TypeParam {
                EXACTLY_TYPE
            } else {
                EXACTLY_ANY
            };
        }
        Ty::TypeOf(inner) if slot != Slot::Tuple => {
            *facts |= HAVE_TYPE;
            walk(oracle, inner, Slot::TypeParam, facts, f);
        }
        Ty::Named(name) if slot != Slot::Tuple => {
            if name.is(meridian_types::builtin::FUNCTION) {
                *facts |= if slot == Slot::TypeParam {
                    EXACTLY_TYPE
                } else {
                    HAVE_FUNCTION | EXACTLY_FUNCTION
                };
                return;
            }
            let mut top = name.clone();
            while let Some(sup) = oracle.supertype(&top) {
                if sup.is(meridian_types::builtin::FUNCTION) {
                    *facts |= HAVE_FUNCTION;
                    break;
                }
                top = sup;
            }
            f(&top, true);
        }
        _ => {}
    }
}

/// Dependencies on call signatures that had no matching method.
#[derive(Default)]
pub(crate) struct TypenameBackedges {
    table: FxHashMap<TypeName, Vec<(Ty, Arc<CodeInstance>)>>,
}

impl TypenameBackedges {
    /// Record that `caller` depends on `typ` staying unmatched.
    pub(crate) fn add(&mut self, oracle: &dyn TypeOracle, typ: &Ty, caller: &Arc<CodeInstance>) {
        let table = &mut self.table;
        foreach_top_typename(oracle, typ, false, |name, explicit| {
            if !explicit {
                return;
            }
            let edges = table.entry(name.clone()).or_default();
            let duplicate = edges
                .iter()
                .any(|(t, c)| Arc::ptr_eq(c, caller) && oracle.types_equal(t, typ));
            if !duplicate {
                edges.push((typ.clone(), caller.clone()));
            }
        });
    }

    /// Remove the entries under `name` for which `missing` holds, returning
    /// them in order.
    pub(crate) fn drain_where(
        &mut self,
        name: &TypeName,
        mut missing: impl FnMut(&Ty) -> bool,
    ) -> Vec<(Ty, Arc<CodeInstance>)> {
        let Some(edges) = self.table.get_mut(name) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        edges.retain(|(typ, caller)| {
            if missing(typ) {
                removed.push((typ.clone(), caller.clone()));
                false
            } else {
                true
            }
        });
        if edges.is_empty() {
            self.table.remove(name);
        }
        removed
    }

    /// Every key currently holding edges.
    pub(crate) fn keys(&self) -> Vec<TypeName> {
        let mut keys: Vec<_> = self.table.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub(crate) fn len(&self) -> usize {
        self.table.values().map(Vec::len).sum()
    }

    pub(crate) fn clear(&mut self) {
        self.table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_types::TypeLattice;

    fn collect(oracle: &dyn TypeOracle, t: &Ty, all: bool) -> (bool, Vec<(String, bool)>) {
        let mut out = Vec::new();
        let ok = foreach_top_typename(oracle, t, all, |n, explicit| out.push((n.to_string(), explicit)));
        (ok, out)
    }

    #[test]
    fn test_function_slot_reports_its_own_type() {
        let l = TypeLattice::with_builtins();
        let f = l.declare_function("f");
        let (ok, names) = collect(&l, &f.signature([Ty::Any]), true);
        assert!(ok);
        assert_eq!(
            names,
            [
                ("typeof(f)".to_string(), true),
                ("Function".to_string(), false),
                ("Any".to_string(), false)
            ]
        );
    }

    #[test]
    fn test_walks_to_top_ancestor() {
        let l = TypeLattice::with_builtins();
        let (_, names) = collect(&l, &Ty::tuple([Ty::named("Int64")]), false);
        assert_eq!(names, [("Number".to_string(), true)]);
    }

    #[test]
    fn test_general_first_slot_needs_full_scan() {
        let l = TypeLattice::with_builtins();
        assert!(!collect(&l, &Ty::tuple([Ty::Any]), true).0);
        assert!(!collect(&l, &Ty::tuple([Ty::named("Function")]), true).0);
        assert!(!collect(&l, &Ty::tuple([Ty::type_of(Ty::var("T", Ty::Any))]), true).0);
    }

    #[test]
    fn test_type_slot_reports_type_key() {
        let l = TypeLattice::with_builtins();
        let (ok, names) = collect(&l, &Ty::tuple([Ty::type_of(Ty::named("Int64"))]), true);
        assert!(ok);
        assert!(names.contains(&("Number".to_string(), true)));
        assert!(names.contains(&("Type".to_string(), false)));
    }
}
