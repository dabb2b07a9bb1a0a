// src/config/source.rs

use std::path::PathBuf;

use crate::config::loader::load_and_validate;
use crate::definitions::{DefinitionSource, Definitions};
use crate::errors::Result;

/// Definitions re-read from a TOML file on every poll cycle.
///
/// Edits to tasks, DAGs and schedules are picked up without restarting the
/// worker. Runs already created keep the DAG snapshot they were created with.
#[derive(Debug, Clone)]
pub struct FileDefinitions {
    path: PathBuf,
}

impl FileDefinitions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl DefinitionSource for FileDefinitions {
    fn load(&self) -> Result<Definitions> {
        let cfg = load_and_validate(&self.path)?;
        Ok(cfg.definitions())
    }
}
