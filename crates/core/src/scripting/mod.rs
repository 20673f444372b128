//! Sandboxed script execution.
//!
//! Leaves first: [`convert`] and [`sanitize`] are pure helpers, [`library`]
//! installs the host-provided globals, [`guard`] wraps the builtins the
//! statement hook cannot interrupt, [`sandbox`] runs one call in a fresh
//! interpreter, and [`dispatcher`] runs sandbox calls on a bounded worker
//! pool under a wall-clock deadline. [`store`] defines the collaborator
//! traits the orchestrator consumes, with in-memory implementations in
//! [`memory`].

pub mod config;
pub mod convert;
pub mod dispatcher;
pub mod guard;
pub mod library;
pub mod memory;
pub mod sandbox;
pub mod sanitize;
pub mod status;
pub mod store;
