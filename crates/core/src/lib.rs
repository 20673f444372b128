//! Scriptbox domain crate.
//!
//! Holds everything that does not touch the database or HTTP: the shared
//! [`value::Value`] model, script and execution record types, and the
//! sandboxed execution engine under [`scripting`].

pub mod error;
pub mod script_types;
pub mod scripting;
pub mod types;
pub mod value;
