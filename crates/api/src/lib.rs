//! Scriptbox API server library.
//!
//! Exposes config, state, error handling, the execution orchestrator and the
//! route tree so integration tests and the binary entrypoint can share them.

pub mod config;
pub mod error;
pub mod handlers;
pub mod response;
pub mod routes;
pub mod scripting;
pub mod state;
