//! Tenant model: an owner of jobs with SLA shares in the fleet.

use serde::{Deserialize, Serialize};

/// Service tier attached to a tenant's SLA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlaTier {
    Premium,
    Standard,
    Basic,
}

impl SlaTier {
    /// How many recoverable failures a job of this tier gets before it is
    /// marked failed for good. Overridable via config.
    pub fn default_error_threshold(self) -> u32 {
        match self {
            SlaTier::Premium => 5,
            SlaTier::Standard => 3,
            SlaTier::Basic => 2,
        }
    }
}

/// A tenant of the fleet.
///
/// `guaranteed_share` is the floor of fleet capacity reserved for the tenant
/// when it has demand; `max_share` caps its usage including borrowed capacity.
/// Shares are percentages of online capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub tier: SlaTier,
    pub guaranteed_share: f64,
    pub max_share: f64,
}

impl Tenant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tier: SlaTier::Standard,
            guaranteed_share: 0.0,
            max_share: 100.0,
        }
    }

    pub fn with_tier(mut self, tier: SlaTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_shares(mut self, guaranteed: f64, max: f64) -> Self {
        self.guaranteed_share = guaranteed;
        self.max_share = max;
        self
    }

    /// Minimal invariants checked at registry ingress.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("tenant id must be non-empty".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("tenant name must be non-empty".to_string());
        }
        if !(0.0..=100.0).contains(&self.guaranteed_share) {
            return Err(format!(
                "guaranteed_share must be within 0..=100, got {}",
                self.guaranteed_share
            ));
        }
        if !(self.guaranteed_share..=100.0).contains(&self.max_share) {
            return Err(format!(
                "max_share must be within guaranteed_share..=100, got {}",
                self.max_share
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_are_valid() {
        let t = Tenant::new("acme", "Acme Robotics");
        t.validate().unwrap();
        assert_eq!(t.tier, SlaTier::Standard);
        assert_eq!(t.max_share, 100.0);
    }

    #[test]
    fn rejects_max_share_below_guarantee() {
        let t = Tenant::new("acme", "Acme Robotics").with_shares(60.0, 40.0);
        assert!(t.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_shares() {
        assert!(Tenant::new("a", "A").with_shares(-1.0, 50.0).validate().is_err());
        assert!(Tenant::new("a", "A").with_shares(0.0, 101.0).validate().is_err());
    }

    #[test]
    fn tier_json_uses_lowercase() {
        let t = Tenant::new("acme", "Acme").with_tier(SlaTier::Premium);
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"tier\":\"premium\""));
        let back: Tenant = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn tier_error_thresholds_are_ordered() {
        assert!(SlaTier::Premium.default_error_threshold() > SlaTier::Standard.default_error_threshold());
        assert!(SlaTier::Standard.default_error_threshold() > SlaTier::Basic.default_error_threshold());
    }
}
