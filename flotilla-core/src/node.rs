//! Worker node model: capability vector, status, and per-workload history.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::job::Requirements;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Maintenance,
    Error,
}

/// Workload classes a node can be specialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Specialization {
    Render,
    Sim,
    Ml,
    Batch,
    Interactive,
}

/// Hardware capability vector advertised by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Capabilities {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub gpu_count: u32,
    pub gpu_model: Option<String>,
    pub storage_gb: u32,
    #[serde(default)]
    pub specializations: BTreeSet<Specialization>,
}

impl Capabilities {
    /// Hard requirement gate: every requested numeric dimension must be met.
    /// Specializations are an affinity, not a hard requirement (scored
    /// separately by the matcher).
    pub fn satisfies(&self, req: &Requirements) -> bool {
        self.cpu_cores >= req.cpu_cores
            && self.memory_gb >= req.memory_gb
            && self.gpu_count >= req.gpu_count
            && self.storage_gb >= req.storage_gb
    }

    /// Normalized headroom above the requested vector, averaged over the
    /// dimensions actually requested. Each dimension contributes at most 1.0
    /// so one oversized axis cannot dominate the score.
    pub fn surplus(&self, req: &Requirements) -> f64 {
        let mut total = 0.0;
        let mut dims = 0u32;
        for (have, need) in [
            (self.cpu_cores, req.cpu_cores),
            (self.memory_gb, req.memory_gb),
            (self.gpu_count, req.gpu_count),
            (self.storage_gb, req.storage_gb),
        ] {
            if need == 0 {
                continue;
            }
            dims += 1;
            let ratio = (have.saturating_sub(need)) as f64 / need as f64;
            total += ratio.min(1.0);
        }
        if dims == 0 { 0.0 } else { total / dims as f64 }
    }
}

/// Exponential-moving-average run statistics for one workload kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfStats {
    pub avg_duration_hours: f64,
    pub success_rate: f64,
    pub sample_count: u32,
}

impl PerfStats {
    const ALPHA: f64 = 0.3;

    pub fn first(duration_hours: f64, success: bool) -> Self {
        Self {
            avg_duration_hours: duration_hours,
            success_rate: if success { 1.0 } else { 0.0 },
            sample_count: 1,
        }
    }

    pub fn update(&mut self, duration_hours: f64, success: bool) {
        self.avg_duration_hours =
            Self::ALPHA * duration_hours + (1.0 - Self::ALPHA) * self.avg_duration_hours;
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate = Self::ALPHA * outcome + (1.0 - Self::ALPHA) * self.success_rate;
        self.sample_count = self.sample_count.saturating_add(1);
    }
}

/// A worker machine in the fleet. Holds at most one running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub status: NodeStatus,
    pub capabilities: Capabilities,
    /// Estimated draw at full load, used by the energy optimizer.
    pub power_draw_watts: f64,
    pub current_job_id: Option<String>,
    pub last_error: Option<String>,
    /// EMA run statistics keyed by job kind.
    #[serde(default)]
    pub perf_history: BTreeMap<String, PerfStats>,
}

impl Node {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: NodeStatus::Online,
            capabilities: Capabilities::default(),
            power_draw_watts: 400.0,
            current_job_id: None,
            last_error: None,
            perf_history: BTreeMap::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_power_draw(mut self, watts: f64) -> Self {
        self.power_draw_watts = watts;
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    /// Online and not running anything.
    pub fn is_available(&self) -> bool {
        self.status == NodeStatus::Online && self.current_job_id.is_none()
    }

    pub fn record_run(&mut self, kind: &str, duration_hours: f64, success: bool) {
        self.perf_history
            .entry(kind.to_string())
            .and_modify(|s| s.update(duration_hours, success))
            .or_insert_with(|| PerfStats::first(duration_hours, success));
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("node id must be non-empty".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("node name must be non-empty".to_string());
        }
        if self.power_draw_watts < 0.0 {
            return Err(format!(
                "power_draw_watts must be non-negative, got {}",
                self.power_draw_watts
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(cpu: u32, mem: u32, gpu: u32) -> Capabilities {
        Capabilities {
            cpu_cores: cpu,
            memory_gb: mem,
            gpu_count: gpu,
            gpu_model: None,
            storage_gb: 100,
            specializations: BTreeSet::new(),
        }
    }

    #[test]
    fn satisfies_checks_every_requested_dimension() {
        let c = caps(16, 64, 2);
        let mut req = Requirements::default();
        req.cpu_cores = 8;
        req.memory_gb = 64;
        assert!(c.satisfies(&req));

        req.gpu_count = 4;
        assert!(!c.satisfies(&req));
    }

    #[test]
    fn surplus_averages_requested_dimensions_only() {
        let c = caps(16, 32, 0);
        let mut req = Requirements::default();
        req.cpu_cores = 8; // surplus ratio 1.0 (capped)
        req.memory_gb = 32; // surplus ratio 0.0
        let s = c.surplus(&req);
        assert!((s - 0.5).abs() < 1e-9);
    }

    #[test]
    fn surplus_with_no_requested_dimensions_is_zero() {
        assert_eq!(caps(16, 32, 2).surplus(&Requirements::default()), 0.0);
    }

    #[test]
    fn perf_stats_ema_moves_toward_new_samples() {
        let mut s = PerfStats::first(10.0, true);
        s.update(2.0, true);
        assert!(s.avg_duration_hours < 10.0 && s.avg_duration_hours > 2.0);
        assert_eq!(s.sample_count, 2);

        s.update(2.0, false);
        assert!(s.success_rate < 1.0);
    }

    #[test]
    fn availability_requires_online_and_idle() {
        let mut n = Node::new("n1", "rack1-01");
        assert!(n.is_available());
        n.current_job_id = Some("j1".to_string());
        assert!(!n.is_available());
        n.current_job_id = None;
        n.status = NodeStatus::Maintenance;
        assert!(!n.is_available());
    }

    #[test]
    fn node_json_roundtrip_is_stable() {
        let n = Node::new("n1", "rack1-01").with_capabilities(caps(8, 32, 1));
        let json = serde_json::to_string(&n).unwrap();
        assert!(json.contains("\"status\":\"online\""));
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back, n);
    }
}
