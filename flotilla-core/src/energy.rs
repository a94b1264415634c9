//! Energy optimizer: mode-driven reroute and deferral.
//!
//! `performance` leaves the plan alone. `balanced` biases matching toward
//! low-power nodes (via the matcher's power weight) and reroutes an
//! assignment when a strictly lower-power adequate node is still idle.
//! `efficiency` additionally drops non-critical assignments with enough
//! deadline slack out of the cycle entirely; those jobs go back to the queue
//! and get picked up off-peak.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobPriority};
use crate::node::Node;
use crate::scheduler::Assignment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnergyMode {
    #[default]
    Performance,
    Balanced,
    Efficiency,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnergyOutcome {
    pub kept: Vec<Assignment>,
    /// Assignments dropped from the cycle; the jobs return to the queue.
    pub deferred: Vec<Assignment>,
    /// (job_id, original node, substituted node).
    pub rerouted: Vec<(String, String, String)>,
}

#[derive(Debug, Clone)]
pub struct EnergyOptimizer {
    mode: EnergyMode,
    /// Minimum deadline slack, in hours, before a job may be deferred.
    defer_slack_hours: f64,
    /// Matcher power weight applied in energy-aware modes.
    power_weight: f64,
}

impl Default for EnergyOptimizer {
    fn default() -> Self {
        Self { mode: EnergyMode::Performance, defer_slack_hours: 4.0, power_weight: 1.0 }
    }
}

impl EnergyOptimizer {
    pub fn new(mode: EnergyMode, defer_slack_hours: f64) -> Self {
        Self { mode, defer_slack_hours, ..Self::default() }
    }

    pub fn mode(&self) -> EnergyMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: EnergyMode) {
        self.mode = mode;
    }

    /// Power weight the matcher should score with under the current mode.
    pub fn match_power_weight(&self) -> f64 {
        match self.mode {
            EnergyMode::Performance => 0.0,
            EnergyMode::Balanced | EnergyMode::Efficiency => self.power_weight,
        }
    }

    /// Post-process the cycle's assignments. `spare` is the set of nodes left
    /// idle after matching; substitutions may consume them.
    pub fn optimize(
        &self,
        assignments: Vec<Assignment>,
        jobs: &BTreeMap<String, Job>,
        nodes: &BTreeMap<String, Node>,
        spare: &[&Node],
        now: DateTime<Utc>,
    ) -> EnergyOutcome {
        if self.mode == EnergyMode::Performance {
            return EnergyOutcome { kept: assignments, deferred: Vec::new(), rerouted: Vec::new() };
        }

        let mut kept = Vec::new();
        let mut deferred = Vec::new();
        let mut rerouted = Vec::new();
        let mut spare: Vec<&Node> = {
            let mut s = spare.to_vec();
            s.sort_by(|a, b| a.id.cmp(&b.id));
            s
        };

        for mut assignment in assignments {
            let Some(job) = jobs.get(&assignment.job_id) else {
                kept.push(assignment);
                continue;
            };

            if self.mode == EnergyMode::Efficiency && self.should_defer(job, now) {
                deferred.push(assignment);
                continue;
            }

            // Reroute to the cheapest adequate spare node when it beats the
            // chosen one. Lowest power first; spare is sorted by id so the
            // strict < keeps the lowest id on ties.
            let current_power =
                nodes.get(&assignment.node_id).map(|n| n.power_draw_watts).unwrap_or(f64::MAX);
            let mut candidate: Option<(usize, f64)> = None;
            for (idx, n) in spare.iter().enumerate() {
                if !n.capabilities.satisfies(&job.requirements) {
                    continue;
                }
                if candidate.map(|(_, w)| n.power_draw_watts < w).unwrap_or(true) {
                    candidate = Some((idx, n.power_draw_watts));
                }
            }
            if let Some((idx, watts)) = candidate {
                if watts < current_power {
                    let replacement = spare.remove(idx);
                    rerouted.push((
                        assignment.job_id.clone(),
                        assignment.node_id.clone(),
                        replacement.id.clone(),
                    ));
                    assignment.node_id = replacement.id.clone();
                }
            }
            kept.push(assignment);
        }

        EnergyOutcome { kept, deferred, rerouted }
    }

    fn should_defer(&self, job: &Job, now: DateTime<Utc>) -> bool {
        job.priority != JobPriority::Critical && job.slack_hours(now) >= self.defer_slack_hours
    }

    /// Estimated fleet-wide energy saving, as a percentage, of running each
    /// runnable job on the lowest-power adequate node instead of the average
    /// online node.
    pub fn estimate_savings(&self, jobs: &[&Job], nodes: &[&Node]) -> f64 {
        if jobs.is_empty() || nodes.is_empty() {
            return 0.0;
        }
        let avg_power: f64 =
            nodes.iter().map(|n| n.power_draw_watts).sum::<f64>() / nodes.len() as f64;
        if avg_power <= 0.0 {
            return 0.0;
        }

        let mut baseline = 0.0;
        let mut optimized = 0.0;
        for job in jobs {
            let hours = job.remaining_hours().max(0.0);
            let best = nodes
                .iter()
                .filter(|n| n.capabilities.satisfies(&job.requirements))
                .map(|n| n.power_draw_watts)
                .fold(f64::MAX, f64::min);
            if best == f64::MAX {
                continue;
            }
            baseline += hours * avg_power;
            optimized += hours * best;
        }
        if baseline <= 0.0 {
            return 0.0;
        }
        ((baseline - optimized) / baseline * 100.0).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Capabilities;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn job(id: &str, priority: JobPriority, deadline_hours: i64, duration_hours: f64) -> Job {
        Job::new(id, "acme", id, t0() + chrono::Duration::hours(deadline_hours), t0())
            .with_priority(priority)
            .with_duration_hours(duration_hours)
    }

    fn node(id: &str, watts: f64) -> Node {
        Node::new(id, id)
            .with_capabilities(Capabilities { cpu_cores: 16, memory_gb: 64, ..Default::default() })
            .with_power_draw(watts)
    }

    fn maps(jobs: Vec<Job>, nodes: Vec<Node>) -> (BTreeMap<String, Job>, BTreeMap<String, Node>) {
        (
            jobs.into_iter().map(|j| (j.id.clone(), j)).collect(),
            nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
        )
    }

    fn assignment(job: &str, node: &str) -> Assignment {
        Assignment {
            job_id: job.to_string(),
            tenant_id: "acme".to_string(),
            node_id: node.to_string(),
        }
    }

    #[test]
    fn performance_mode_is_a_no_op() {
        let opt = EnergyOptimizer::default();
        let (jobs, nodes) = maps(
            vec![job("j1", JobPriority::Low, 100, 1.0)],
            vec![node("n1", 900.0), node("n2", 100.0)],
        );
        let spare: Vec<&Node> = vec![&nodes["n2"]];
        let out = opt.optimize(vec![assignment("j1", "n1")], &jobs, &nodes, &spare, t0());
        assert_eq!(out.kept.len(), 1);
        assert_eq!(out.kept[0].node_id, "n1");
        assert!(out.deferred.is_empty() && out.rerouted.is_empty());
        assert_eq!(opt.match_power_weight(), 0.0);
    }

    #[test]
    fn efficiency_defers_slack_rich_low_priority_jobs() {
        let opt = EnergyOptimizer::new(EnergyMode::Efficiency, 4.0);
        let (jobs, nodes) = maps(
            vec![
                job("j-slack", JobPriority::Low, 8, 1.0),
                job("j-tight", JobPriority::Low, 2, 1.0),
                job("j-crit", JobPriority::Critical, 100, 1.0),
            ],
            vec![node("n1", 400.0), node("n2", 400.0), node("n3", 400.0)],
        );
        let out = opt.optimize(
            vec![
                assignment("j-slack", "n1"),
                assignment("j-tight", "n2"),
                assignment("j-crit", "n3"),
            ],
            &jobs,
            &nodes,
            &[],
            t0(),
        );
        let deferred: Vec<_> = out.deferred.iter().map(|a| a.job_id.as_str()).collect();
        assert_eq!(deferred, vec!["j-slack"]);
        assert_eq!(out.kept.len(), 2);
    }

    #[test]
    fn balanced_reroutes_to_cheaper_spare_node() {
        let opt = EnergyOptimizer::new(EnergyMode::Balanced, 4.0);
        let (jobs, nodes) = maps(
            vec![job("j1", JobPriority::Low, 2, 1.0)],
            vec![node("n-hot", 900.0), node("n-cool", 150.0)],
        );
        let spare: Vec<&Node> = vec![&nodes["n-cool"]];
        let out = opt.optimize(vec![assignment("j1", "n-hot")], &jobs, &nodes, &spare, t0());
        assert_eq!(out.kept[0].node_id, "n-cool");
        assert_eq!(out.rerouted.len(), 1);
        assert!(opt.match_power_weight() > 0.0);
    }

    #[test]
    fn reroute_skips_inadequate_spares() {
        let opt = EnergyOptimizer::new(EnergyMode::Balanced, 4.0);
        let mut weak = node("n-weak", 50.0);
        weak.capabilities.cpu_cores = 1;
        let mut j = job("j1", JobPriority::Low, 2, 1.0);
        j.requirements.cpu_cores = 8;
        let (jobs, nodes) = maps(vec![j], vec![node("n-hot", 900.0), weak]);
        let spare: Vec<&Node> = vec![&nodes["n-weak"]];
        let out = opt.optimize(vec![assignment("j1", "n-hot")], &jobs, &nodes, &spare, t0());
        assert_eq!(out.kept[0].node_id, "n-hot");
        assert!(out.rerouted.is_empty());
    }

    #[test]
    fn savings_reflect_power_spread() {
        let opt = EnergyOptimizer::new(EnergyMode::Efficiency, 4.0);
        let j = job("j1", JobPriority::Medium, 10, 2.0);
        let n1 = node("n1", 800.0);
        let n2 = node("n2", 200.0);
        let savings = opt.estimate_savings(&[&j], &[&n1, &n2]);
        // avg 500W vs best 200W: 60% saving.
        assert!((savings - 60.0).abs() < 1e-9);

        assert_eq!(opt.estimate_savings(&[], &[&n1]), 0.0);
    }
}
