use std::error::Error;
use std::io::Write;
use std::time::Duration;

use flockdag::config::{load_and_validate, load_from_str, validate_id, ConfigFile, FileDefinitions};
use flockdag::definitions::DefinitionSource;
use flockdag::engine::SchedulerOptions;
use flockdag::errors::FlockError;
use flockdag::types::{DagId, ScheduleId, TaskId};
use flockdag_test_utils::builders::{ConfigFileBuilder, TaskConfigBuilder};
use flockdag_test_utils::init_tracing;
use tempfile::NamedTempFile;

type TestResult = Result<(), Box<dyn Error>>;

const FULL_CONFIG: &str = r#"
[config]
poll_interval_ms = 250
dispatch_pool_size = 4
max_task_attempts = 5

[task.compile]
cmd = "make"

[task.test]
cmd = "make test"
payload = { suite = "unit" }

[task.package]

[dag.build.task.compile]

[dag.build.task.test]
after = ["compile"]

[dag.build.task.package]
after = ["compile", "test"]

[schedule.nightly]
dag = "build"
repeat = 2
interval_ms = 60000

[schedule.forever]
dag = "build"
repeat = 0
"#;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

fn config_error(raw: &str) -> String {
    let raw = load_from_str(raw).expect("valid TOML");
    match ConfigFile::try_from(raw) {
        Err(FlockError::ConfigError(msg)) => msg,
        other => panic!("expected a config error, got {other:?}"),
    }
}

#[test]
fn full_config_loads_with_definitions() -> TestResult {
    init_tracing();

    let file = write_config(FULL_CONFIG);
    let cfg = load_and_validate(file.path())?;

    assert_eq!(cfg.config.poll_interval_ms, 250);
    assert_eq!(cfg.config.dispatch_pool_size, 4);
    assert_eq!(cfg.config.max_task_attempts, 5);
    // Defaults for what is not set.
    assert_eq!(cfg.config.max_concurrent_runs, 10);
    assert_eq!(cfg.config.lock_timeout_ms, 1000);
    assert_eq!(cfg.config.namespace, "/flockdag");

    let defs = cfg.definitions();
    assert_eq!(defs.tasks.len(), 3);
    assert_eq!(defs.tasks[&TaskId::new("compile")].cmd.as_deref(), Some("make"));
    assert_eq!(defs.tasks[&TaskId::new("test")].payload["suite"], "unit");
    assert_eq!(defs.tasks[&TaskId::new("package")].cmd, None);

    let dag = &defs.dags[&DagId::new("build")];
    assert_eq!(dag.tasks.len(), 3);
    assert_eq!(dag.tasks[&TaskId::new("package")].len(), 2);

    let nightly = &defs.schedules[&ScheduleId::new("nightly")];
    assert_eq!(nightly.dag, DagId::new("build"));
    assert_eq!(nightly.repetition.count, Some(2));
    assert_eq!(nightly.repetition.interval, Duration::from_secs(60));

    let forever = &defs.schedules[&ScheduleId::new("forever")];
    assert_eq!(forever.repetition.count, None);

    let options = SchedulerOptions::from(&cfg.config);
    assert_eq!(options.poll_interval, Duration::from_millis(250));
    assert_eq!(options.dispatch_pool_size, 4);
    Ok(())
}

#[test]
fn empty_config_is_valid() -> TestResult {
    let cfg = ConfigFile::try_from(load_from_str("")?)?;
    assert!(cfg.definitions().schedules.is_empty());
    assert_eq!(cfg.config.poll_interval_ms, 1000);
    Ok(())
}

#[test]
fn file_definitions_pick_up_edits() -> TestResult {
    let file = write_config(FULL_CONFIG);
    let source = FileDefinitions::new(file.path());
    assert_eq!(source.load()?.schedules.len(), 2);

    std::fs::write(
        file.path(),
        "[task.a]\n[dag.d.task.a]\n[schedule.s]\ndag = \"d\"\n",
    )?;
    let defs = source.load()?;
    assert_eq!(defs.schedules.len(), 1);
    assert!(defs.schedules.contains_key(&ScheduleId::new("s")));
    Ok(())
}

#[test]
fn missing_file_is_an_io_error() {
    let err = load_and_validate("/definitely/not/here/Flockdag.toml").unwrap_err();
    assert!(matches!(err, FlockError::IoError(_)), "{err:?}");
}

#[test]
fn malformed_toml_is_rejected() {
    let err = load_from_str("[task.a\ncmd = ").unwrap_err();
    assert!(matches!(err, FlockError::TomlError(_)), "{err:?}");
}

#[test]
fn schedule_without_dag_field_is_rejected() {
    let err = load_from_str("[schedule.s]\nrepeat = 2\n").unwrap_err();
    assert!(matches!(err, FlockError::TomlError(_)), "{err:?}");
}

#[test]
fn zero_tunables_are_rejected() {
    for key in ["poll_interval_ms", "dispatch_pool_size", "max_concurrent_runs", "retry_attempts"] {
        let msg = config_error(&format!("[config]\n{key} = 0\n"));
        assert!(msg.contains(key), "{msg}");
    }
}

#[test]
fn zero_max_task_attempts_is_allowed() -> TestResult {
    let cfg = ConfigFile::try_from(load_from_str("[config]\nmax_task_attempts = 0\n")?)?;
    assert_eq!(SchedulerOptions::from(&cfg.config).max_task_attempts, 0);
    Ok(())
}

#[test]
fn relative_namespace_is_rejected() {
    let msg = config_error("[config]\nnamespace = \"flockdag\"\n");
    assert!(msg.contains("namespace"), "{msg}");
}

#[test]
fn invalid_identifiers_are_rejected() {
    assert!(validate_id("task", "build-1.x_y").is_ok());
    for bad in ["", "-lead", "has space", "a/b", "ümlaut"] {
        assert!(validate_id("task", bad).is_err(), "{bad:?} should be invalid");
    }

    let msg = config_error("[task.\"a/b\"]\n");
    assert!(msg.contains("a/b"), "{msg}");
}

#[test]
fn dag_referencing_unknown_task_is_rejected() {
    let err = ConfigFileBuilder::new()
        .with_task("a", TaskConfigBuilder::noop().build())
        .with_dag_task("d", "a", &[])
        .with_dag_task("d", "ghost", &["a"])
        .try_build()
        .unwrap_err();
    match err {
        FlockError::ConfigError(msg) => assert!(msg.contains("unknown task 'ghost'"), "{msg}"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn unknown_and_self_dependencies_are_rejected() {
    let err = ConfigFileBuilder::new()
        .with_task("a", TaskConfigBuilder::noop().build())
        .with_task("b", TaskConfigBuilder::noop().build())
        .with_dag_task("d", "a", &[])
        .with_dag_task("d", "b", &["c"])
        .try_build()
        .unwrap_err();
    assert!(matches!(&err, FlockError::ConfigError(msg) if msg.contains("unknown dependency 'c'")), "{err:?}");

    let err = ConfigFileBuilder::new()
        .with_task("a", TaskConfigBuilder::noop().build())
        .with_dag_task("d", "a", &["a"])
        .try_build()
        .unwrap_err();
    assert!(matches!(&err, FlockError::ConfigError(msg) if msg.contains("cannot depend on itself")), "{err:?}");
}

#[test]
fn dependency_outside_the_dag_is_rejected() {
    // `b` is a configured task but not a node of `d`.
    let err = ConfigFileBuilder::new()
        .with_task("a", TaskConfigBuilder::noop().build())
        .with_task("b", TaskConfigBuilder::noop().build())
        .with_dag_task("d", "a", &["b"])
        .try_build()
        .unwrap_err();
    assert!(matches!(err, FlockError::ConfigError(_)), "{err:?}");
}

#[test]
fn cycles_are_rejected() {
    let err = ConfigFileBuilder::new()
        .with_task("a", TaskConfigBuilder::noop().build())
        .with_task("b", TaskConfigBuilder::noop().build())
        .with_task("c", TaskConfigBuilder::noop().build())
        .with_dag_task("d", "a", &["c"])
        .with_dag_task("d", "b", &["a"])
        .with_dag_task("d", "c", &["b"])
        .try_build()
        .unwrap_err();
    assert!(matches!(err, FlockError::DagCycle(_)), "{err:?}");
}

#[test]
fn empty_dag_is_rejected() {
    let msg = config_error("[dag.d]\n");
    assert!(msg.contains("'d'"), "{msg}");
}

#[test]
fn schedule_of_unknown_dag_is_rejected() {
    let err = ConfigFileBuilder::new()
        .with_task("a", TaskConfigBuilder::noop().build())
        .with_dag_task("d", "a", &[])
        .with_schedule("s", "missing", 1, 0)
        .try_build()
        .unwrap_err();
    assert!(matches!(&err, FlockError::ConfigError(msg) if msg.contains("unknown dag 'missing'")), "{err:?}");
}
