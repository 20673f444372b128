//! Row structs for the `scripts` and `script_executions` tables and their
//! conversions into domain types.

pub mod script;
