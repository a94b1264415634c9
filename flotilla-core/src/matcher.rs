//! Specialization matcher: scores (job, node) fit.
//!
//! Hard requirements gate; everything else is a weighted sum of capability
//! surplus, specialization affinity, historical fit for the job's kind, a
//! wear penalty that spreads load across equally good nodes, and an optional
//! power penalty the energy optimizer dials in.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::job::{Job, Requirements};
use crate::node::Node;

/// Reference draw used to normalize the power penalty into roughly [0, 1].
const POWER_NORM_WATTS: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchWeights {
    pub capability: f64,
    pub specialization: f64,
    pub history: f64,
    pub wear: f64,
    /// Zero outside energy-aware modes.
    pub power: f64,
    /// Matches scoring below this are rejected.
    pub acceptance_threshold: f64,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            capability: 1.0,
            specialization: 2.0,
            history: 1.0,
            wear: 0.5,
            power: 0.0,
            acceptance_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpecializationMatcher {
    weights: MatchWeights,
    /// Assignments per node, decayed each cycle. Process-local.
    wear: HashMap<String, u32>,
}

impl Default for SpecializationMatcher {
    fn default() -> Self {
        Self::new(MatchWeights::default())
    }
}

impl SpecializationMatcher {
    pub fn new(weights: MatchWeights) -> Self {
        Self { weights, wear: HashMap::new() }
    }

    pub fn set_power_weight(&mut self, w_power: f64) {
        self.weights.power = w_power;
    }

    pub fn weights(&self) -> MatchWeights {
        self.weights
    }

    /// Score a node against an explicit requirement profile. Returns `None`
    /// when hard requirements are unmet.
    pub fn score_requirements(
        &self,
        requirements: &Requirements,
        kind: Option<&str>,
        node: &Node,
    ) -> Option<f64> {
        if !node.capabilities.satisfies(requirements) {
            return None;
        }

        let capability = node.capabilities.surplus(requirements);
        let specialization = specialization_match(requirements, node);
        let history = kind
            .and_then(|k| node.perf_history.get(k))
            .map(|stats| stats.success_rate)
            .unwrap_or(0.5);
        let wear = self.recent_usage(&node.id);
        let power = node.power_draw_watts / POWER_NORM_WATTS;

        Some(
            self.weights.capability * capability
                + self.weights.specialization * specialization
                + self.weights.history * history
                - self.weights.wear * wear
                - self.weights.power * power,
        )
    }

    pub fn score(&self, job: &Job, node: &Node) -> Option<f64> {
        self.score_requirements(&job.requirements, Some(&job.kind), node)
    }

    /// Pick the best acceptable node. Deterministic: score descending, then
    /// node id ascending.
    pub fn match_job_to_node(&self, job: &Job, candidates: &[&Node]) -> Option<String> {
        let mut best: Option<(f64, &str)> = None;
        for node in candidates {
            let Some(score) = self.score(job, node) else { continue };
            if score < self.weights.acceptance_threshold {
                continue;
            }
            best = match best {
                None => Some((score, node.id.as_str())),
                Some((bs, bid)) => {
                    if score > bs || (score == bs && node.id.as_str() < bid) {
                        Some((score, node.id.as_str()))
                    } else {
                        Some((bs, bid))
                    }
                }
            };
        }
        best.map(|(_, id)| id.to_string())
    }

    /// Normalized recent assignment pressure for a node, in [0, 1].
    pub fn recent_usage(&self, node_id: &str) -> f64 {
        let count = self.wear.get(node_id).copied().unwrap_or(0);
        (count.min(10) as f64) / 10.0
    }

    /// Called when an assignment commits.
    pub fn note_assignment(&mut self, node_id: &str) {
        *self.wear.entry(node_id.to_string()).or_insert(0) += 1;
    }

    /// Halve all wear counters; called once per cycle so pressure fades.
    pub fn decay_wear(&mut self) {
        self.wear.retain(|_, count| {
            *count /= 2;
            *count > 0
        });
    }
}

/// Affinity between a requirement profile and a node's specializations:
/// 1.0 when the node covers everything asked for, 0.5 when nothing was asked
/// or coverage is partial, 0.0 when the node covers none of it.
fn specialization_match(requirements: &Requirements, node: &Node) -> f64 {
    if requirements.specializations.is_empty() {
        return 0.5;
    }
    let covered = requirements
        .specializations
        .iter()
        .filter(|s| node.capabilities.specializations.contains(s))
        .count();
    if covered == requirements.specializations.len() {
        1.0
    } else if covered > 0 {
        0.5
    } else {
        0.0
    }
}

/// Outcome of one finished run, folded into the node's per-kind EMA.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunMetrics {
    pub duration_hours: f64,
    pub success: bool,
}

pub fn update_performance_history(node: &mut Node, kind: &str, metrics: RunMetrics) {
    node.record_run(kind, metrics.duration_hours, metrics.success);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Capabilities, Specialization};
    use chrono::{TimeZone, Utc};

    fn job_requiring(cpu: u32, gpu: u32) -> Job {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut req = Requirements::default();
        req.cpu_cores = cpu;
        req.gpu_count = gpu;
        Job::new("j1", "acme", "j1", t0 + chrono::Duration::hours(4), t0)
            .with_kind("render")
            .with_requirements(req)
    }

    fn node_with(id: &str, cpu: u32, gpu: u32, specs: &[Specialization]) -> Node {
        Node::new(id, id).with_capabilities(Capabilities {
            cpu_cores: cpu,
            memory_gb: 64,
            gpu_count: gpu,
            gpu_model: None,
            storage_gb: 500,
            specializations: specs.iter().copied().collect(),
        })
    }

    #[test]
    fn hard_requirements_gate() {
        let matcher = SpecializationMatcher::default();
        let job = job_requiring(16, 2);
        let small = node_with("n1", 8, 2, &[]);
        assert!(matcher.score(&job, &small).is_none());
        assert_eq!(matcher.match_job_to_node(&job, &[&small]), None);
    }

    #[test]
    fn specialized_node_wins() {
        let matcher = SpecializationMatcher::default();
        let mut job = job_requiring(8, 1);
        job.requirements = job.requirements.clone().with_specialization(Specialization::Render);

        let generalist = node_with("a-generalist", 8, 1, &[]);
        let specialist = node_with("z-specialist", 8, 1, &[Specialization::Render]);
        let picked = matcher.match_job_to_node(&job, &[&generalist, &specialist]);
        assert_eq!(picked.as_deref(), Some("z-specialist"));
    }

    #[test]
    fn wear_spreads_load_between_equal_nodes() {
        let mut matcher = SpecializationMatcher::default();
        let job = job_requiring(8, 0);
        let n1 = node_with("n1", 8, 0, &[]);
        let n2 = node_with("n2", 8, 0, &[]);

        // Equal nodes: id breaks the tie.
        assert_eq!(matcher.match_job_to_node(&job, &[&n1, &n2]).as_deref(), Some("n1"));

        // After n1 takes a few assignments, n2 scores higher.
        for _ in 0..3 {
            matcher.note_assignment("n1");
        }
        assert_eq!(matcher.match_job_to_node(&job, &[&n1, &n2]).as_deref(), Some("n2"));

        // Decay brings n1 back into rotation eventually.
        matcher.decay_wear();
        matcher.decay_wear();
        assert_eq!(matcher.match_job_to_node(&job, &[&n1, &n2]).as_deref(), Some("n1"));
    }

    #[test]
    fn history_prefers_proven_nodes() {
        let matcher = SpecializationMatcher::default();
        let job = job_requiring(8, 0);
        let mut proven = node_with("n-proven", 8, 0, &[]);
        let mut flaky = node_with("a-flaky", 8, 0, &[]);
        for _ in 0..5 {
            update_performance_history(
                &mut proven,
                "render",
                RunMetrics { duration_hours: 1.0, success: true },
            );
            update_performance_history(
                &mut flaky,
                "render",
                RunMetrics { duration_hours: 1.0, success: false },
            );
        }
        let picked = matcher.match_job_to_node(&job, &[&flaky, &proven]);
        assert_eq!(picked.as_deref(), Some("n-proven"));
    }

    #[test]
    fn power_weight_penalizes_hungry_nodes() {
        let mut matcher = SpecializationMatcher::default();
        let job = job_requiring(8, 0);
        let hungry = node_with("a-hungry", 8, 0, &[]).with_power_draw(900.0);
        let frugal = node_with("z-frugal", 8, 0, &[]).with_power_draw(200.0);

        // Without a power weight the id tie-break picks the hungry node.
        assert_eq!(matcher.match_job_to_node(&job, &[&hungry, &frugal]).as_deref(), Some("a-hungry"));

        matcher.set_power_weight(1.0);
        assert_eq!(matcher.match_job_to_node(&job, &[&hungry, &frugal]).as_deref(), Some("z-frugal"));
    }

    #[test]
    fn acceptance_threshold_rejects_marginal_fits() {
        let mut weights = MatchWeights::default();
        weights.acceptance_threshold = 10.0;
        let matcher = SpecializationMatcher::new(weights);
        let job = job_requiring(8, 0);
        let node = node_with("n1", 8, 0, &[]);
        assert_eq!(matcher.match_job_to_node(&job, &[&node]), None);
    }
}
