//! A scripted compiler backend.
//!
//! [`ScriptedBackend`] runs method bodies given as closures. A body declares
//! the calls it makes so inference can resolve them and record edges, which
//! makes it a complete backend for hosts that embed the engine without a
//! compiler, and for tests.
//!
//! ```ignore
//! let body = ScriptedBody::new(|_| Ok(Value::Int(1)))
//!     .calls(g.signature([Ty::named("Int64")]))
//!     .rettype(Ty::named("Int64"));
//! engine.add_method(MethodDefinition::new(&f, [Ty::Any], body.into()))?;
//! ```
//!
//! Methods whose body is not a [`ScriptedBody`] return `nothing`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use meridian_types::{Ty, Value, builtin};

use crate::backend::{CompilerBackend, InferenceContext, InferredCode};
use crate::code::{CodeInstance, Invoker};
use crate::error::{CompileError, DispatchResult};
use crate::instance::MethodInstance;
use crate::method::MethodBody;
use crate::world::World;

/// A method body for [`ScriptedBackend`].
#[derive(Clone)]
pub struct ScriptedBody {
    run: Invoker,
    calls: Vec<Ty>,
    invokes: Vec<Ty>,
    rettype: Ty,
    constant: Option<Value>,
    infer_callees: bool,
    compile_failures: Arc<AtomicU32>,
}

impl ScriptedBody {
    pub fn new(run: impl Fn(&[Value]) -> DispatchResult<Value> + Send + Sync + 'static) -> Self {
        Self {
            run: Arc::new(run),
            calls: Vec::new(),
            invokes: Vec::new(),
            rettype: Ty::Any,
            constant: None,
            infer_callees: false,
            compile_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// A body returning `value`.
    pub fn returning(value: Value) -> Self {
        let result = value.clone();
        Self::new(move |_| Ok(result.clone())).rettype(value.type_of())
    }

    /// A body that inference proves constant: it is never compiled.
    pub fn constant(value: Value) -> Self {
        let mut body = Self::returning(value.clone());
        body.constant = Some(value);
        body
    }

    /// Declare a call with argument types `sig`.
    pub fn calls(mut self, sig: Ty) -> Self {
        self.calls.push(sig);
        self
    }

    /// Declare an `invoke` of the method covering `sig`.
    pub fn invokes(mut self, sig: Ty) -> Self {
        self.invokes.push(sig);
        self
    }

    pub fn rettype(mut self, rettype: Ty) -> Self {
        self.rettype = rettype;
        self
    }

    /// Also infer resolved callees, so the result depends on their code.
    pub fn infer_callees(mut self) -> Self {
        self.infer_callees = true;
        self
    }

    /// Make the next `n` compilations of this body fail.
    pub fn failing_compiles(self, n: u32) -> Self {
        self.compile_failures.store(n, Ordering::Relaxed);
        self
    }
}

impl fmt::Debug for ScriptedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedBody")
            .field("calls", &self.calls)
            .field("invokes", &self.invokes)
            .field("rettype", &self.rettype)
            .finish_non_exhaustive()
    }
}

impl From<ScriptedBody> for MethodBody {
    fn from(body: ScriptedBody) -> Self {
        MethodBody::new(body)
    }
}

/// A backend running [`ScriptedBody`] closures.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    inferences: AtomicU64,
    compilations: AtomicU64,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `infer` calls so far.
    pub fn inferences(&self) -> u64 {
        self.inferences.load(Ordering::Relaxed)
    }

    /// Number of successful `compile` calls so far.
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }

    fn body(mi: &MethodInstance) -> Option<&ScriptedBody> {
        mi.method().body().downcast_ref::<ScriptedBody>()
    }
}

fn return_nothing() -> Invoker {
    Arc::new(|_| Ok(Value::Nothing))
}

impl CompilerBackend for ScriptedBackend {
    fn infer(
        &self,
        cx: &InferenceContext<'_>,
        mi: &Arc<MethodInstance>,
        _world: World,
    ) -> Result<Option<InferredCode>, CompileError> {
        self.inferences.fetch_add(1, Ordering::Relaxed);
        let Some(body) = Self::body(mi) else {
            return Ok(Some(InferredCode::new(Ty::named(builtin::NOTHING))));
        };
        for sig in &body.calls {
            let Some(callee) = cx.resolve_call(sig) else {
                continue;
            };
            if body.infer_callees {
                cx.infer_callee(&callee).map_err(|e| CompileError::InferenceFailed {
                    signature: mi.spec_types().clone(),
                    reason: e.to_string(),
                })?;
            }
        }
        for sig in &body.invokes {
            if cx.resolve_invoke(sig).is_none() {
                return Err(CompileError::InferenceFailed {
                    signature: mi.spec_types().clone(),
                    reason: format!("no unique method to invoke for {sig}"),
                });
            }
        }
        Ok(Some(match &body.constant {
            Some(value) => InferredCode::constant(body.rettype.clone(), value.clone()),
            None => InferredCode::new(body.rettype.clone()),
        }))
    }

    fn compile(&self, ci: &Arc<CodeInstance>) -> Result<Invoker, CompileError> {
        let Some(body) = Self::body(ci.def()) else {
            self.compilations.fetch_add(1, Ordering::Relaxed);
            return Ok(return_nothing());
        };
        let failing = body
            .compile_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CompileError::CodegenFailed {
                signature: ci.def().spec_types().clone(),
                reason: "scripted failure".to_string(),
            });
        }
        self.compilations.fetch_add(1, Ordering::Relaxed);
        Ok(body.run.clone())
    }

    fn interpret(&self, mi: &Arc<MethodInstance>) -> Option<Invoker> {
        Some(match Self::body(mi) {
            Some(body) => body.run.clone(),
            None => return_nothing(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returning_body_runs() {
        let body = ScriptedBody::returning(Value::Int(7));
        assert_eq!(body.rettype, Ty::named("Int64"));
        assert_eq!((body.run)(&[]).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_failing_compiles_count_down() {
        let body = ScriptedBody::returning(Value::Nothing).failing_compiles(2);
        let take = || {
            body.compile_failures
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok()
        };
        assert!(take());
        assert!(take());
        assert!(!take());
    }
}
