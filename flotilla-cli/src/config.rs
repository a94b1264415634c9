//! CLI configuration loading.
//!
//! Resolution order: explicit `--config` path, then `$FLOTILLA_HOME/config.toml`,
//! then `~/.flotilla/config.toml`. A missing file means defaults; a present
//! but invalid file is an error.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flotilla_core::OrchestratorConfig;

pub fn flotilla_home() -> PathBuf {
    if let Ok(home) = std::env::var("FLOTILLA_HOME") {
        return PathBuf::from(home);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".flotilla")
}

pub fn default_config_path() -> PathBuf {
    flotilla_home().join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    flotilla_home().join("state")
}

pub fn load_config(explicit: Option<&Path>) -> Result<OrchestratorConfig> {
    let path = explicit.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        if explicit.is_some() {
            anyhow::bail!("config file not found: {}", path.display());
        }
        return Ok(OrchestratorConfig::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    OrchestratorConfig::from_toml_str(&raw)
        .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))
}

/// Write a commented default config, refusing to clobber an existing one.
pub fn write_default_config(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}

const DEFAULT_CONFIG_TOML: &str = r#"# Flotilla orchestrator configuration.

# minimal | standard | high | maximum
resilience_level = "standard"

# performance | balanced | efficiency
energy_mode = "performance"

cycle_interval_seconds = 30
heartbeat_timeout_seconds = 90
cancel_ack_timeout_seconds = 120
progress_stall_timeout_seconds = 1800

# Deadline slack (hours) above which efficiency mode may defer a job.
defer_slack_hours = 4.0

match_acceptance_threshold = 0.5

# Per-tier failure budgets before a job is marked failed.
[error_threshold_per_tier]
premium = 5
standard = 3
basic = 2

# Checkpoint interval overrides in minutes, keyed by resilience level.
[checkpoint_interval_overrides]
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_parses() {
        let config = OrchestratorConfig::from_toml_str(DEFAULT_CONFIG_TOML).unwrap();
        assert_eq!(config, {
            let mut expected = OrchestratorConfig::default();
            expected.error_threshold_per_tier.insert(flotilla_core::SlaTier::Premium, 5);
            expected.error_threshold_per_tier.insert(flotilla_core::SlaTier::Standard, 3);
            expected.error_threshold_per_tier.insert(flotilla_core::SlaTier::Basic, 2);
            expected
        });
    }

    #[test]
    fn explicit_missing_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("config.toml"))).is_err());
    }

    #[test]
    fn config_init_refuses_to_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write_default_config(&path).unwrap();
        assert!(write_default_config(&path).is_err());
    }
}
