// src/config/validate.rs

use std::sync::LazyLock;

use regex::Regex;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::dag::DagGraph;
use crate::errors::{FlockError, Result};

/// Identifiers become path segments in the coordination namespace.
static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("valid id regex"));

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::FlockError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_global_config(cfg)?;
    validate_ids(cfg)?;
    validate_dag_nodes(cfg)?;
    validate_dags(cfg)?;
    validate_schedules(cfg)?;
    Ok(())
}

/// Check that `id` can be used as a namespace path segment.
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if ID_PATTERN.is_match(id) {
        Ok(())
    } else {
        Err(FlockError::ConfigError(format!(
            "{kind} id '{id}' is invalid (allowed: letters, digits, '_', '.', '-'; must start with a letter or digit)"
        )))
    }
}

fn validate_global_config(cfg: &RawConfigFile) -> Result<()> {
    let c = &cfg.config;

    if c.poll_interval_ms == 0 {
        return Err(FlockError::ConfigError(
            "[config].poll_interval_ms must be >= 1 (got 0)".to_string(),
        ));
    }
    if c.dispatch_pool_size == 0 {
        return Err(FlockError::ConfigError(
            "[config].dispatch_pool_size must be >= 1 (got 0)".to_string(),
        ));
    }
    if c.max_concurrent_runs == 0 {
        return Err(FlockError::ConfigError(
            "[config].max_concurrent_runs must be >= 1 (got 0)".to_string(),
        ));
    }
    if c.retry_attempts == 0 {
        return Err(FlockError::ConfigError(
            "[config].retry_attempts must be >= 1 (got 0)".to_string(),
        ));
    }
    if !c.namespace.starts_with('/') || c.namespace.contains("//") {
        return Err(FlockError::ConfigError(format!(
            "[config].namespace must be an absolute path (got '{}')",
            c.namespace
        )));
    }

    Ok(())
}

fn validate_ids(cfg: &RawConfigFile) -> Result<()> {
    for id in cfg.task.keys() {
        validate_id("task", id)?;
    }
    for id in cfg.dag.keys() {
        validate_id("dag", id)?;
    }
    for id in cfg.schedule.keys() {
        validate_id("schedule", id)?;
    }
    Ok(())
}

fn validate_dag_nodes(cfg: &RawConfigFile) -> Result<()> {
    for (dag_id, dag) in cfg.dag.iter() {
        if dag.task.is_empty() {
            return Err(FlockError::ConfigError(format!(
                "dag '{dag_id}' must contain at least one [dag.{dag_id}.task.<name>] section"
            )));
        }

        for (name, node) in dag.task.iter() {
            if !cfg.task.contains_key(name) {
                return Err(FlockError::ConfigError(format!(
                    "dag '{dag_id}' references unknown task '{name}'"
                )));
            }
            for dep in node.after.iter() {
                if dep == name {
                    return Err(FlockError::ConfigError(format!(
                        "task '{name}' in dag '{dag_id}' cannot depend on itself in `after`"
                    )));
                }
                if !dag.task.contains_key(dep) {
                    return Err(FlockError::ConfigError(format!(
                        "task '{name}' in dag '{dag_id}' has unknown dependency '{dep}' in `after`"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_dags(cfg: &RawConfigFile) -> Result<()> {
    let definitions = ConfigFile::new_unchecked(cfg.clone()).definitions();
    for dag in definitions.dags.values() {
        DagGraph::from_definition(dag)?;
    }
    Ok(())
}

fn validate_schedules(cfg: &RawConfigFile) -> Result<()> {
    for (id, schedule) in cfg.schedule.iter() {
        if !cfg.dag.contains_key(&schedule.dag) {
            return Err(FlockError::ConfigError(format!(
                "schedule '{id}' references unknown dag '{}'",
                schedule.dag
            )));
        }
    }
    Ok(())
}
