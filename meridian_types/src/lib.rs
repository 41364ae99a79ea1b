//! Meridian Types
//!
//! The type language shared by the Meridian dispatch engine and its hosts:
//!
//! - [`Ty`]: structural signature types
//! - [`TypeOracle`]: the subtyping, intersection and specificity interface
//!   the engine consumes
//! - [`TypeLattice`]: a reference oracle over a nominal hierarchy
//! - [`Value`]: runtime values and their dispatch types

pub mod env;
pub mod lattice;
pub mod oracle;
pub mod ty;
pub mod value;

pub use env::SparamEnv;
pub use lattice::TypeLattice;
pub use oracle::TypeOracle;
pub use ty::{TupleTy, Ty, TypeName, TypeVar, builtin};
pub use value::{FunctionRef, Object, Value};
