//! Dispatch and compilation errors.

use std::fmt;

use meridian_types::Ty;
use thiserror::Error;

use crate::world::World;

/// Errors surfaced by dispatch and method-table mutation.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// No method covers the argument types.
    #[error("no method matching {function}{} in world {world}", fmt_args(.arg_types))]
    NoApplicableMethod {
        function: String,
        arg_types: Vec<Ty>,
        world: World,
    },

    /// Several methods cover the argument types and none is most specific.
    #[error(
        "{function}{} is ambiguous in world {world}; candidates: {}",
        fmt_args(.arg_types),
        fmt_candidates(.candidates)
    )]
    AmbiguousMethod {
        function: String,
        arg_types: Vec<Ty>,
        candidates: Vec<Ty>,
        world: World,
    },

    /// A lookup matched more methods than its limit.
    #[error("more than {limit} methods match")]
    TooManyCandidates { limit: usize },

    /// Inference or code generation failed.
    #[error(transparent)]
    Compilation(#[from] CompileError),

    /// The engine no longer accepts method-table mutation.
    #[error("method table mutation after new worlds were disabled")]
    NewWorldsDisabled,

    /// The method does not belong to this engine.
    #[error("method {0} is not registered with this engine")]
    MethodNotFound(String),

    /// The method was already removed from the table.
    #[error("method {0} is already disabled")]
    AlreadyDisabled(String),

    /// A compiled body raised an error of its own.
    #[error("{0}")]
    Runtime(String),
}

/// Errors raised by the inference and compile backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// Inference could not produce a result.
    #[error("inference failed for {signature}: {reason}")]
    InferenceFailed { signature: Ty, reason: String },

    /// Code generation failed.
    #[error("code generation failed for {signature}: {reason}")]
    CodegenFailed { signature: Ty, reason: String },

    /// Neither compiled nor interpretable code exists.
    #[error("no executable code for {signature}")]
    MissingCode { signature: Ty },
}

/// Result alias for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

fn fmt_args(args: &[Ty]) -> String {
    let mut out = String::from("(");
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str("::");
        out.push_str(&arg.to_string());
    }
    out.push(')');
    out
}

fn fmt_candidates(candidates: &[Ty]) -> String {
    candidates
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Report a broken internal invariant and abort the operation.
///
/// Logs the diagnostic state before panicking so the failure is visible
/// even when the panic is caught further up.
#[cold]
#[track_caller]
pub(crate) fn invariant_violation(what: &str, state: impl fmt::Debug) -> ! {
    tracing::error!(target: "meridian::invariant", state = ?state, "{what}");
    panic!("dispatch invariant violated: {what}: {state:?}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_method_message() {
        let err = DispatchError::NoApplicableMethod {
            function: "f".into(),
            arg_types: vec![Ty::named("String")],
            world: 3,
        };
        assert_eq!(err.to_string(), "no method matching f(::String) in world 3");
    }

    #[test]
    fn test_ambiguity_message_lists_candidates() {
        let err = DispatchError::AmbiguousMethod {
            function: "g".into(),
            arg_types: vec![Ty::named("Int64"), Ty::named("Int64")],
            candidates: vec![Ty::tuple([Ty::named("Int64"), Ty::Any])],
            world: 1,
        };
        let msg = err.to_string();
        assert!(msg.starts_with("g(::Int64, ::Int64) is ambiguous"));
        assert!(msg.contains("Tuple{Int64, Any}"));
    }

    #[test]
    fn test_compile_error_converts() {
        let err: DispatchError = CompileError::MissingCode {
            signature: Ty::Any,
        }
        .into();
        assert!(matches!(err, DispatchError::Compilation(_)));
    }

    #[test]
    #[should_panic(expected = "dispatch invariant violated")]
    fn test_invariant_violation_panics() {
        invariant_violation("window inverted", (5u64, 3u64));
    }
}
