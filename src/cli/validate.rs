use anyhow::Result;
use std::path::Path;

use crate::cli::config::Config;
use crate::engine::scheduler::StageSchedule;
use crate::engine::Workload;
use crate::scenario::workloads;
use crate::utils::format_duration;

pub const DEFAULT_WORKLOAD: &str = "auth";

/// Resolve the workload (CLI name, then the config's `workload`, then the
/// default) and overlay the config file on it.
pub fn load_workload(name: Option<&str>, config_path: Option<&Path>) -> Result<(Workload, Config)> {
    let config = match config_path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let name = name
        .or(config.workload.as_deref())
        .unwrap_or(DEFAULT_WORKLOAD);
    let mut workload = workloads::by_name(name)?;
    config.apply(&mut workload)?;
    Ok((workload, config))
}

/// Validate a workload and its config without touching the target.
pub fn run_validate(name: Option<&str>, config_path: Option<&Path>) -> Result<()> {
    let (workload, config) = match load_workload(name, config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            println!("  ✗ Validation failed: {:#}", e);
            return Err(e);
        }
    };
    println!("Validating workload '{}'...", workload.name);

    if let Err(e) = workload.validate() {
        println!("  ✗ Workload invalid: {}", e);
        return Err(e.into());
    }
    let schedule = StageSchedule::new(workload.stages.clone(), workload.start_target)?;
    println!("  ✓ Workload valid");
    println!("    stages: {} stage(s)", schedule.stages().len());
    println!("    duration: {}", format_duration(schedule.total_duration()));
    println!("    max virtual users: {}", schedule.max_target());
    println!(
        "    branches: {:?}",
        workload
            .scenario
            .branches
            .iter()
            .map(|b| format!("{} ({})", b.name, b.probability))
            .collect::<Vec<_>>()
    );
    let mut metrics: Vec<_> = workload.thresholds.keys().collect();
    metrics.sort();
    println!("    thresholds: {:?}", metrics);

    match config.run_options(None) {
        Ok(options) => println!("    base url: {}", options.base_url),
        Err(e) => {
            println!("  ✗ Run options invalid: {}", e);
            return Err(e.into());
        }
    }
    if let Some(path) = config_path {
        println!("  ✓ Config file valid: {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_validate_builtin_workload() {
        assert!(run_validate(Some("spike"), None).is_ok());
    }

    #[test]
    fn test_validate_unknown_workload() {
        let err = run_validate(Some("stress"), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnknownWorkload(_))
        ));
    }

    #[test]
    fn test_workload_name_from_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("soak.yaml");
        fs::write(&path, "workload: soak\nstart_workers: 5\n").unwrap();

        let (workload, _) = load_workload(None, Some(&path)).unwrap();
        assert_eq!(workload.name, "soak");
        assert_eq!(workload.start_target, 5);

        // The CLI name wins over the file
        let (workload, _) = load_workload(Some("spike"), Some(&path)).unwrap();
        assert_eq!(workload.name, "spike");
    }

    #[test]
    fn test_validate_with_valid_yaml_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            r#"
stages:
  - duration: "10s"
    target: 5
criteria:
  http_req_duration:
    - "p(95)<300"
"#,
        )
        .unwrap();
        assert!(run_validate(None, Some(&path)).is_ok());
    }

    #[test]
    fn test_validate_with_invalid_threshold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "criteria:\n  http_req_duration:\n    - \"rate<0.1\"\n").unwrap();

        let err = run_validate(Some("soak"), Some(&path)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::IncompatibleAggregation { .. })
        ));
    }

    #[test]
    fn test_validate_with_unparseable_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(run_validate(None, Some(&path)).is_err());
    }
}
