//! Fleet-wide performance accounting.
//!
//! Utilization and optimization figures are smoothed 9:1 so a single odd
//! cycle does not swing the reported numbers.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FleetMetrics {
    pub total_jobs_completed: u64,
    pub jobs_completed_on_time: u64,
    pub total_jobs_failed: u64,
    pub average_utilization_percentage: f64,
    pub average_node_idle_percentage: f64,
    pub optimization_improvement_percentage: f64,
    turnaround_hours_total: f64,
    turnaround_samples: u64,
}

impl FleetMetrics {
    pub fn record_completion(&mut self, on_time: bool, turnaround_hours: f64) {
        self.total_jobs_completed += 1;
        if on_time {
            self.jobs_completed_on_time += 1;
        }
        self.turnaround_hours_total += turnaround_hours.max(0.0);
        self.turnaround_samples += 1;
    }

    pub fn record_failure(&mut self) {
        self.total_jobs_failed += 1;
    }

    pub fn record_cycle(&mut self, utilization_pct: f64, energy_savings_pct: f64) {
        self.average_utilization_percentage =
            (self.average_utilization_percentage * 9.0 + utilization_pct) / 10.0;
        self.average_node_idle_percentage = 100.0 - self.average_utilization_percentage;
        self.optimization_improvement_percentage =
            (self.optimization_improvement_percentage * 9.0 + energy_savings_pct) / 10.0;
    }

    pub fn on_time_rate(&self) -> Option<f64> {
        if self.total_jobs_completed == 0 {
            return None;
        }
        Some(self.jobs_completed_on_time as f64 / self.total_jobs_completed as f64)
    }

    pub fn average_turnaround_hours(&self) -> Option<f64> {
        if self.turnaround_samples == 0 {
            return None;
        }
        Some(self.turnaround_hours_total / self.turnaround_samples as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_tracking() {
        let mut m = FleetMetrics::default();
        m.record_completion(true, 2.0);
        m.record_completion(false, 4.0);
        assert_eq!(m.total_jobs_completed, 2);
        assert_eq!(m.jobs_completed_on_time, 1);
        assert_eq!(m.on_time_rate(), Some(0.5));
        assert_eq!(m.average_turnaround_hours(), Some(3.0));
    }

    #[test]
    fn cycle_smoothing_converges_slowly() {
        let mut m = FleetMetrics::default();
        m.record_cycle(100.0, 0.0);
        assert!((m.average_utilization_percentage - 10.0).abs() < 1e-9);
        assert!((m.average_node_idle_percentage - 90.0).abs() < 1e-9);

        for _ in 0..50 {
            m.record_cycle(100.0, 20.0);
        }
        assert!(m.average_utilization_percentage > 95.0);
        assert!(m.optimization_improvement_percentage > 15.0);
    }

    #[test]
    fn rates_are_none_without_samples() {
        let m = FleetMetrics::default();
        assert_eq!(m.on_time_rate(), None);
        assert_eq!(m.average_turnaround_hours(), None);
    }
}
