//! Orchestrator configuration.
//!
//! TOML with strict keys: anything unrecognized is an error, so a typoed
//! option fails loudly instead of silently running with defaults.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::checkpoint::ResilienceLevel;
use crate::energy::EnergyMode;
use crate::tenant::SlaTier;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OrchestratorConfig {
    pub resilience_level: ResilienceLevel,
    pub energy_mode: EnergyMode,
    pub cycle_interval_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
    /// How long a running job's stop directive may wait for an ack before
    /// the cancel is forced and the node flagged for review.
    pub cancel_ack_timeout_seconds: u64,
    pub progress_stall_timeout_seconds: u64,
    /// Deadline slack, in hours, above which the efficiency mode may defer
    /// a non-critical job.
    pub defer_slack_hours: f64,
    pub match_acceptance_threshold: f64,
    /// Per-tier overrides of how many failures a job survives.
    pub error_threshold_per_tier: BTreeMap<SlaTier, u32>,
    /// Per-level overrides of the checkpoint interval, in minutes.
    pub checkpoint_interval_overrides: BTreeMap<ResilienceLevel, i64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            resilience_level: ResilienceLevel::Standard,
            energy_mode: EnergyMode::Performance,
            cycle_interval_seconds: 30,
            heartbeat_timeout_seconds: 90,
            cancel_ack_timeout_seconds: 120,
            progress_stall_timeout_seconds: 1800,
            defer_slack_hours: 4.0,
            match_acceptance_threshold: 0.5,
            error_threshold_per_tier: BTreeMap::new(),
            checkpoint_interval_overrides: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, String> {
        let config: Self = toml::from_str(s).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.cycle_interval_seconds == 0 {
            return Err("cycle_interval_seconds must be positive".to_string());
        }
        if self.heartbeat_timeout_seconds == 0 {
            return Err("heartbeat_timeout_seconds must be positive".to_string());
        }
        if self.cancel_ack_timeout_seconds == 0 {
            return Err("cancel_ack_timeout_seconds must be positive".to_string());
        }
        if self.defer_slack_hours < 0.0 {
            return Err("defer_slack_hours must be non-negative".to_string());
        }
        for (level, minutes) in &self.checkpoint_interval_overrides {
            if *minutes <= 0 {
                return Err(format!(
                    "checkpoint_interval_overrides[{level:?}] must be positive, got {minutes}"
                ));
            }
        }
        Ok(())
    }

    /// Error threshold for a tier: explicit override or the tier default.
    pub fn error_threshold(&self, tier: SlaTier) -> u32 {
        self.error_threshold_per_tier
            .get(&tier)
            .copied()
            .unwrap_or_else(|| tier.default_error_threshold())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        OrchestratorConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_recognized_options() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            resilience_level = "high"
            energy_mode = "efficiency"
            cycle_interval_seconds = 15
            heartbeat_timeout_seconds = 45

            [error_threshold_per_tier]
            premium = 7
            basic = 1

            [checkpoint_interval_overrides]
            high = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.resilience_level, ResilienceLevel::High);
        assert_eq!(config.energy_mode, EnergyMode::Efficiency);
        assert_eq!(config.cycle_interval_seconds, 15);
        assert_eq!(config.error_threshold(SlaTier::Premium), 7);
        assert_eq!(config.error_threshold(SlaTier::Basic), 1);
        // Unset tier falls back to the tier default.
        assert_eq!(config.error_threshold(SlaTier::Standard), 3);
        assert_eq!(config.checkpoint_interval_overrides[&ResilienceLevel::High], 20);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = OrchestratorConfig::from_toml_str("cycle_interval_secondz = 10").unwrap_err();
        assert!(err.contains("cycle_interval_secondz") || err.contains("unknown"));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert!(OrchestratorConfig::from_toml_str("cycle_interval_seconds = 0").is_err());
    }
}
