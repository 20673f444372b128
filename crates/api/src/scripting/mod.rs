//! Script orchestration service.
//!
//! The [`orchestrator::ScriptOrchestrator`] ties the core dispatcher to the
//! script registry and execution history, providing the single entry point
//! for running scripts one at a time or as a triggered batch.

pub mod orchestrator;
