// src/config/mod.rs

//! Task-file loading and validation for dagbox.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a task file from disk (`loader.rs`).
//! - Validate it into a settings block plus a task graph (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, parse_str};
pub use model::{ConfigSection, RawTaskFile, RunSettings, TaskConfig, TaskFile};
