/// Shared building blocks for the filesystem readers
pub mod types;

pub use types::*;
