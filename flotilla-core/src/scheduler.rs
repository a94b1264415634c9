//! Scheduler loop: assembles one cycle's plan from a snapshot.
//!
//! Planning is pure: the same snapshot and matcher state always produce the
//! same plan, and nothing is mutated here. The orchestrator commits the plan
//! through the registry afterwards, so external readers only ever see
//! pre-cycle or post-cycle state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::energy::EnergyOptimizer;
use crate::job::{Job, JobStatus, Requirements};
use crate::matcher::SpecializationMatcher;
use crate::node::Node;
use crate::partition::{self, Allocation};
use crate::priority;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub job_id: String,
    pub tenant_id: String,
    pub node_id: String,
}

/// Everything `run_cycle` decided, ready to commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CyclePlan {
    pub assignments: Vec<Assignment>,
    /// Jobs dropped from the cycle by energy policy; they return to queued.
    pub deferred: Vec<Assignment>,
    /// (job_id, original node, substituted node) swaps by the optimizer.
    pub rerouted: Vec<(String, String, String)>,
    /// Eligible pending jobs that enter the queue this cycle (scheduled or
    /// not).
    pub promoted_to_queued: Vec<String>,
    pub allocations: BTreeMap<String, Allocation>,
    pub under_capacity: bool,
    pub report: CycleReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CycleReport {
    pub jobs_considered: usize,
    pub jobs_scheduled: usize,
    pub jobs_deferred: usize,
    pub jobs_rerouted: usize,
    pub under_capacity: bool,
    /// Percentage of online nodes busy once the plan commits.
    pub utilization_percentage: f64,
    pub estimated_energy_savings_percentage: f64,
    /// Running jobs predicted to miss their deadline at the current rate.
    pub stragglers: Vec<String>,
    pub allocated_shares: BTreeMap<String, f64>,
}

/// Assemble the plan for one scheduling cycle.
pub fn plan_cycle(
    snapshot: &crate::registry::Snapshot,
    matcher: &SpecializationMatcher,
    energy: &EnergyOptimizer,
    now: DateTime<Utc>,
) -> CyclePlan {
    // Runnable jobs with satisfied dependencies, in effective priority order.
    let eligible: Vec<&Job> = snapshot
        .jobs
        .values()
        .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Queued))
        .filter(|j| snapshot.dependencies_met(j))
        .collect();
    let ranked = priority::rank_jobs(&eligible, now);
    let order: BTreeMap<&str, usize> =
        ranked.iter().enumerate().map(|(i, r)| (r.job_id.as_str(), i)).collect();

    // Demand and aggregate requirement profile per tenant.
    let mut demand: BTreeMap<String, usize> = BTreeMap::new();
    let mut profiles: BTreeMap<String, Requirements> = BTreeMap::new();
    for job in &eligible {
        *demand.entry(job.tenant_id.clone()).or_insert(0) += 1;
        let profile = profiles.entry(job.tenant_id.clone()).or_default();
        merge_requirements(profile, &job.requirements);
    }

    let online_count = snapshot.online_nodes().count();
    let idle: Vec<&Node> = snapshot.idle_online_nodes().collect();
    let tenants: Vec<&crate::tenant::Tenant> = snapshot.tenants.values().collect();

    let outcome =
        partition::allocate(&tenants, online_count, &idle, &demand, &profiles, matcher);

    // Match jobs to their tenant's pool, tenants in id order, jobs in
    // effective priority order.
    let mut assignments: Vec<Assignment> = Vec::new();
    for (tenant_id, allocation) in &outcome.allocations {
        let mut pool: Vec<&Node> = allocation
            .nodes
            .iter()
            .filter_map(|id| snapshot.nodes.get(id))
            .filter(|n| n.is_available())
            .collect();
        if pool.is_empty() {
            continue;
        }

        let mut tenant_jobs: Vec<&Job> =
            eligible.iter().copied().filter(|j| &j.tenant_id == tenant_id).collect();
        tenant_jobs.sort_by_key(|j| order.get(j.id.as_str()).copied().unwrap_or(usize::MAX));

        for job in tenant_jobs {
            if pool.is_empty() {
                break;
            }
            let Some(node_id) = matcher.match_job_to_node(job, &pool) else { continue };
            pool.retain(|n| n.id != node_id);
            assignments.push(Assignment {
                job_id: job.id.clone(),
                tenant_id: tenant_id.clone(),
                node_id,
            });
        }
    }

    // Energy pass over the tentative assignments.
    let assigned_nodes: Vec<&str> = assignments.iter().map(|a| a.node_id.as_str()).collect();
    let spare: Vec<&Node> =
        idle.iter().copied().filter(|n| !assigned_nodes.contains(&n.id.as_str())).collect();
    let energy_outcome =
        energy.optimize(assignments, &snapshot.jobs, &snapshot.nodes, &spare, now);

    // Pending jobs that were eligible this cycle move to queued even when
    // they did not land on a node.
    let promoted_to_queued: Vec<String> = eligible
        .iter()
        .filter(|j| j.status == JobStatus::Pending)
        .map(|j| j.id.clone())
        .collect();

    let running_now = snapshot
        .jobs
        .values()
        .filter(|j| j.status == JobStatus::Running)
        .count();
    let utilization = if online_count > 0 {
        (running_now + energy_outcome.kept.len()) as f64 / online_count as f64 * 100.0
    } else {
        0.0
    };

    let runnable: Vec<&Job> = snapshot
        .jobs
        .values()
        .filter(|j| !j.status.is_terminal())
        .collect();
    let online: Vec<&Node> = snapshot.online_nodes().collect();
    let savings = energy.estimate_savings(&runnable, &online);

    let stragglers: Vec<String> = snapshot
        .jobs
        .values()
        .filter(|j| j.status == JobStatus::Running && j.slack_hours(now) < 0.0)
        .map(|j| j.id.clone())
        .collect();

    let report = CycleReport {
        jobs_considered: eligible.len(),
        jobs_scheduled: energy_outcome.kept.len(),
        jobs_deferred: energy_outcome.deferred.len(),
        jobs_rerouted: energy_outcome.rerouted.len(),
        under_capacity: outcome.under_capacity,
        utilization_percentage: utilization,
        estimated_energy_savings_percentage: savings,
        stragglers,
        allocated_shares: outcome
            .allocations
            .iter()
            .map(|(id, a)| (id.clone(), a.allocated_share))
            .collect(),
    };

    CyclePlan {
        assignments: energy_outcome.kept,
        deferred: energy_outcome.deferred,
        rerouted: energy_outcome.rerouted,
        promoted_to_queued,
        allocations: outcome.allocations,
        under_capacity: outcome.under_capacity,
        report,
    }
}

/// Element-wise max plus specialization union: the profile a tenant's node
/// picks are scored against.
fn merge_requirements(profile: &mut Requirements, req: &Requirements) {
    profile.cpu_cores = profile.cpu_cores.max(req.cpu_cores);
    profile.memory_gb = profile.memory_gb.max(req.memory_gb);
    profile.gpu_count = profile.gpu_count.max(req.gpu_count);
    profile.storage_gb = profile.storage_gb.max(req.storage_gb);
    for spec in &req.specializations {
        profile.specializations.insert(*spec);
    }
}
