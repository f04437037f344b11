// src/config/mod.rs

pub mod loader;
pub mod model;

pub use loader::{build_exclude_set, load_or_default};
pub use model::ConfigFile;
