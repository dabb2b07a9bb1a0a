// src/config/mod.rs

//! Configuration: TOML model, validation, loading and a file-backed
//! definition source.

pub mod loader;
pub mod model;
pub mod source;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, load_from_str};
pub use model::{
    ConfigFile, ConfigSection, DagConfig, DagTaskConfig, RawConfigFile, ScheduleConfig,
    TaskConfig,
};
pub use source::FileDefinitions;
pub use validate::validate_id;
