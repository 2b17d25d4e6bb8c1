//! CLI command implementations.

pub mod align;
pub mod layout;
pub mod simulate;
