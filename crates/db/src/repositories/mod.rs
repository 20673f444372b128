//! Query functions, one zero-sized repo struct per table.

pub mod script_execution_repo;
pub mod script_repo;

pub use script_execution_repo::ScriptExecutionRepo;
pub use script_repo::ScriptRepo;
