//! Compilation Signatures
//!
//! The signature an instance is compiled and cached under may be wider than
//! the call that produced it, so one instance serves many call types:
//!
//! - arguments marked no-specialize take their declared type
//! - `Type{T}` arguments in general slots collapse to `Type`, and nested
//!   `Type{Type{...}}` collapses to what was actually declared
//! - type values in kind slots take the kind (`DataType`)
//! - function values passed to an argument the body never calls collapse
//!   to `Function`
//! - vararg tails are unrolled only up to a per-method limit
//!
//! A widened signature is always a supertype of the call signature it was
//! derived from.

use meridian_types::{SparamEnv, Ty, TypeOracle, builtin};

use crate::engine::Engine;
use crate::method::Method;

fn type_type() -> Ty {
    Ty::named(builtin::TYPE)
}

fn function_type() -> Ty {
    Ty::named(builtin::FUNCTION)
}

/// `Any` or `Type`: slots too general to specialize on every type value.
fn very_general_type(oracle: &dyn TypeOracle, t: &Ty) -> bool {
    t.is_any() || oracle.types_equal(t, &type_type())
}

/// `Union{Function, Type}`.
fn is_callable_union(t: &Ty) -> bool {
    match t {
        Ty::Union(members) => {
            members.len() == 2
                && members.contains(&function_type())
                && members.contains(&type_type())
        }
        _ => false,
    }
}

/// `Type{Type{...}}`.
fn is_nested_type_type(t: &Ty) -> bool {
    matches!(t, Ty::TypeOf(inner) if matches!(**inner, Ty::TypeOf(_)))
}

/// Parameters of a tuple type, the vararg tail (if any) last.
fn tuple_params(tt: &Ty) -> Option<(Vec<Ty>, bool)> {
    let tuple = tt.as_tuple()?;
    let params = tuple
        .elems
        .iter()
        .cloned()
        .chain(tuple.vararg.as_deref().cloned())
        .collect();
    Some((params, tuple.is_vararg()))
}

fn rebuild(mut params: Vec<Ty>, vararg: bool) -> Ty {
    match params.pop() {
        Some(tail) if vararg => Ty::vararg_tuple(params, tail),
        Some(last) => {
            params.push(last);
            Ty::tuple(params)
        }
        None => Ty::tuple(params),
    }
}

/// The declared vararg element type with the static parameters filled in.
fn inst_vararg_in_env(decl: &Ty, sparams: &SparamEnv) -> Ty {
    match decl.as_tuple().and_then(|t| t.vararg.as_deref()) {
        Some(tail) if !sparams.is_empty() && tail.has_free_typevars() => tail.substitute(sparams),
        Some(tail) => tail.clone(),
        None => Ty::Bottom,
    }
}

fn set(newparams: &mut Option<Vec<Ty>>, params: &[Ty], i: usize, t: Ty) {
    newparams.get_or_insert_with(|| params.to_vec())[i] = t;
}

// =============================================================================
// Widening
// =============================================================================

/// The compilation signature for calling `def` with `tt`, or `None` when
/// `tt` is already the signature to use (or cannot be made into one).
pub(crate) fn compilation_sig(
    oracle: &dyn TypeOracle,
    tt: &Ty,
    sparams: &SparamEnv,
    def: &Method,
    max_varargs: usize,
) -> Option<Ty> {
    let (params, tt_vararg) = tuple_params(tt)?;
    let decl = def.sig();
    let decl_tuple = decl.as_tuple()?;
    let nargs = def.nargs();
    let nspec = max_varargs + nargs;
    let np = params.len();

    if def.is_vararg() {
        // Too few parameters to know how far to unroll.
        if np < nspec && tt_vararg {
            return None;
        }
    } else if tt_vararg || np != nargs {
        return None;
    }

    let type_type = type_type();
    let function_type = function_type();
    let mut newparams: Option<Vec<Ty>> = None;

    for i in 0..np {
        let mut elt = params[i].clone();
        let decl_i = decl_tuple.slot(i)?;
        let type_i = decl_i;
        let i_arg = i.min(nargs.saturating_sub(1));

        if oracle.is_kind(type_i) {
            elt = type_i.clone();
            set(&mut newparams, &params, i, elt.clone());
        } else if let Ty::TypeOf(p) = &elt {
            // Matched against the kind, not against `Type{_}`.
            let kind = oracle.kind_of(p);
            if oracle.is_subtype(&kind, type_i) && !oracle.is_subtype(&type_type, type_i) {
                set(&mut newparams, &params, i, kind.clone());
                elt = kind;
            }
        } else if oracle.is_kind(&elt)
            && !(oracle.is_subtype(&elt, type_i) && !oracle.is_subtype(&type_type, type_i))
        {
            set(&mut newparams, &params, i, type_type.clone());
            elt = type_type.clone();
        }

        // Kind slots are checked by guard entries instead.
        if oracle.is_kind(&elt) {
            continue;
        }

        if i_arg > 0
            && def.is_nospecialize(i_arg)
            && !decl_i.has_free_typevars()
            && !oracle.is_kind(decl_i)
        {
            if *decl_i != elt {
                set(&mut newparams, &params, i, decl_i.clone());
            }
            continue;
        }

        if oracle.types_equal(&elt, &type_type) {
            // Already as wide as it gets.
        } else if matches!(elt, Ty::Union(_) | Ty::Var(_)) && oracle.is_subtype(&elt, &type_type) {
            set(&mut newparams, &params, i, type_type.clone());
        } else if let Ty::TypeOf(p) = &elt {
            let called = i_arg > 0 && def.is_called(i_arg);
            if !decl_i.has_free_typevars() && very_general_type(oracle, type_i) {
                if !called {
                    set(&mut newparams, &params, i, type_type.clone());
                }
            } else if matches!(**p, Ty::TypeOf(_))
                && (is_nested_type_type(p) || !decl_i.has_free_typevars())
            {
                if i < nargs || !def.is_vararg() {
                    let di = oracle.intersect(type_i, &type_type);
                    debug_assert!(!di.is_bottom());
                    let widened = if oracle.is_kind(&di) { type_type.clone() } else { di };
                    set(&mut newparams, &params, i, widened);
                } else {
                    set(&mut newparams, &params, i, type_type.clone());
                }
            }
        }

        let notcalled_func = i_arg > 0
            && i_arg <= 8
            && !def.is_called(i_arg)
            && !decl_i.has_free_typevars()
            && oracle.is_subtype(&elt, &function_type);
        if notcalled_func && (type_i.is_any() || *type_i == function_type || is_callable_union(type_i)) {
            set(&mut newparams, &params, i, function_type.clone());
        }
    }

    if np >= nspec && def.is_vararg() {
        let current = newparams.unwrap_or(params);
        let mut type_i = if max_varargs > 0 && nspec >= 2 {
            current[nspec - 2].clone()
        } else {
            Ty::Bottom
        };
        let all_are_subtypes = current[nspec - 1..]
            .iter()
            .all(|p| oracle.is_subtype(p, &type_i));
        let tail = if all_are_subtypes {
            if is_nested_type_type(&type_i) {
                type_i = type_type;
            }
            type_i
        } else {
            inst_vararg_in_env(decl, sparams)
        };
        return Some(Ty::vararg_tuple(current[..nspec - 1].iter().cloned(), tail));
    }

    newparams.map(|params| rebuild(params, tt_vararg))
}

/// Whether `ty` could have been produced by [`compilation_sig`] for some
/// concrete call of `def`.
pub(crate) fn isa_compileable_sig(
    oracle: &dyn TypeOracle,
    ty: &Ty,
    sparams: &SparamEnv,
    def: &Method,
    max_varargs: usize,
    may_increase: bool,
) -> bool {
    if ty.has_free_typevars() {
        return false;
    }
    let Some((params, vararg)) = tuple_params(ty) else {
        return false;
    };
    let decl = def.sig();
    let Some(decl_tuple) = decl.as_tuple() else {
        return false;
    };
    let nargs = def.nargs();
    let np = params.len();
    if np == 0 {
        return nargs == 0;
    }

    if def.is_vararg() {
        let nspec_min = nargs + max_varargs;
        // New methods may still raise the heuristic limit.
        let nspec_max = if may_increase { usize::MAX } else { nspec_min };
        if vararg {
            if np < nspec_min || np > nspec_max {
                return false;
            }
        } else if np + 1 < nargs || np >= nspec_max {
            return false;
        }
    } else if np != nargs || vararg {
        return false;
    }

    let type_type = type_type();
    let function_type = function_type();
    for (i, param) in params.iter().enumerate() {
        let elt = param;
        let i_arg = i.min(nargs - 1);

        if vararg && i == np - 1 {
            let tail = inst_vararg_in_env(decl, sparams);
            if tail.has_free_typevars() {
                return false;
            }
            if *elt == tail {
                continue;
            }
            if is_nested_type_type(elt) {
                return false;
            }
        }

        let Some(decl_i) = decl_tuple.slot(i) else {
            return false;
        };
        let type_i = decl_i;

        if i_arg > 0
            && def.is_nospecialize(i_arg)
            && !decl_i.has_free_typevars()
            && !oracle.is_kind(decl_i)
        {
            if elt == decl_i {
                continue;
            }
            return false;
        }

        if oracle.is_kind(elt) {
            if oracle.is_subtype(elt, type_i) && !oracle.is_subtype(&type_type, type_i) {
                continue;
            }
            return false;
        } else if oracle.is_kind(type_i) {
            return false;
        }

        let is_type_type = matches!(elt, Ty::TypeOf(_)) || oracle.types_equal(elt, &type_type);
        if is_type_type {
            let called = (i_arg > 0 && def.is_called(i_arg)) || decl_i.has_free_typevars();
            if oracle.types_equal(elt, &type_type) {
                if !called && very_general_type(oracle, type_i) {
                    continue;
                }
                if i >= nargs && def.is_vararg() {
                    continue;
                }
                return false;
            }
            if !called && very_general_type(oracle, type_i) {
                return false;
            }
            let Ty::TypeOf(p) = elt else {
                return false;
            };
            let kind = oracle.kind_of(p);
            if oracle.is_subtype(&kind, type_i) && !oracle.is_subtype(&type_type, type_i) {
                return false;
            }
            if matches!(**p, Ty::TypeOf(_)) && (is_nested_type_type(p) || !decl_i.has_free_typevars()) {
                if i < nargs || !def.is_vararg() {
                    let di = oracle.intersect(type_i, &type_type);
                    if oracle.is_kind(&di) || !oracle.types_equal(&di, elt) {
                        return false;
                    }
                    continue;
                }
                return false;
            }
            continue;
        }

        let notcalled_func = i_arg > 0
            && i_arg <= 8
            && !def.is_called(i_arg)
            && !decl_i.has_free_typevars()
            && oracle.is_subtype(elt, &function_type);
        if notcalled_func && (type_i.is_any() || *type_i == function_type || is_callable_union(type_i)) {
            if *elt == function_type {
                continue;
            }
            return false;
        }

        if !oracle.is_concrete(elt) {
            return false;
        }
    }
    true
}

/// The compileable signature covering `ti`, with its static parameters,
/// or `None` when no compileable signature exists.
pub(crate) fn normalize_to_compilable_sig(
    oracle: &dyn TypeOracle,
    ti: &Ty,
    env: &SparamEnv,
    def: &Method,
    max_varargs: (usize, bool),
) -> Option<(Ty, SparamEnv)> {
    let is_dispatch = oracle.is_dispatch_tuple(ti);
    let (tt, env) = match compilation_sig(oracle, ti, env, def, max_varargs.0) {
        Some(tt) if !is_dispatch => {
            let (_, env) = oracle.intersect_with_env(&tt, def.sig());
            (tt, env)
        }
        Some(tt) => (tt, env.clone()),
        None => (ti.clone(), env.clone()),
    };
    if is_dispatch || isa_compileable_sig(oracle, &tt, &env, def, max_varargs.0, max_varargs.1) {
        Some((tt, env))
    } else {
        None
    }
}

impl Engine {
    /// How many vararg arguments of `def` compilation signatures unroll,
    /// and whether that number came from a heuristic that can still grow
    /// as methods are added.
    pub(crate) fn max_varargs(&self, def: &Method) -> (usize, bool) {
        if let Some(n) = def.declared_max_varargs() {
            return (n, false);
        }
        if let Some(n) = self.config.default_max_varargs {
            return (n, false);
        }
        match def.sig().slot(0) {
            Some(Ty::Named(name)) => {
                let max_args = self.max_args(name) + 2;
                (max_args.saturating_sub(def.nargs()), true)
            }
            _ => (1, false),
        }
    }

    /// [`compilation_sig`] with this engine's vararg limit for `def`.
    pub(crate) fn widened_sig(&self, tt: &Ty, sparams: &SparamEnv, def: &Method) -> Option<Ty> {
        let oracle = &*self.oracle;
        let widened = compilation_sig(oracle, tt, sparams, def, self.max_varargs(def).0)?;
        debug_assert!(
            !oracle.is_subtype(tt, def.sig()) || oracle.is_subtype(tt, &widened),
            "compilation signature {widened} does not cover {tt}"
        );
        Some(widened)
    }
}
