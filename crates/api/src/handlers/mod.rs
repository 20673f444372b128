pub mod scripts;
pub mod triggers;
