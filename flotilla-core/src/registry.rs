//! Registry: the single authoritative mutable store for tenants, nodes, and
//! jobs.
//!
//! Every other component works on read-only snapshots and applies changes
//! back through this API. Mutations either leave the registry satisfying the
//! fleet invariants or fail without touching state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Job, JobPriority, JobStatus};
use crate::node::{Node, NodeStatus};
use crate::tenant::Tenant;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("duplicate {entity} id {id}")]
    DuplicateId { entity: &'static str, id: String },

    #[error("illegal transition for job {job_id}: {from:?} -> {to:?}")]
    IllegalTransition { job_id: String, from: JobStatus, to: JobStatus },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// Read-only view of the registry taken at a point in time. Cloned data, so
/// readers never observe a half-applied cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tenants: BTreeMap<String, Tenant>,
    pub nodes: BTreeMap<String, Node>,
    pub jobs: BTreeMap<String, Job>,
}

impl Snapshot {
    /// Jobs whose dependencies are all completed.
    pub fn dependencies_met(&self, job: &Job) -> bool {
        job.dependencies.iter().all(|dep| {
            self.jobs
                .get(dep)
                .map(|d| d.status == JobStatus::Completed)
                .unwrap_or(false)
        })
    }

    pub fn online_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.status == NodeStatus::Online)
    }

    pub fn idle_online_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.is_available())
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    tenants: BTreeMap<String, Tenant>,
    nodes: BTreeMap<String, Node>,
    jobs: BTreeMap<String, Job>,

    // Reverse indexes, maintained on every mutation.
    node_to_job: BTreeMap<String, String>,
    tenant_jobs: BTreeMap<String, Vec<String>>,
    dependents: BTreeMap<String, Vec<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from persisted entities. Indexes are derived, not
    /// trusted from storage.
    pub fn from_entities(
        tenants: Vec<Tenant>,
        nodes: Vec<Node>,
        jobs: Vec<Job>,
    ) -> Result<Self, RegistryError> {
        let mut reg = Self::new();
        for t in tenants {
            reg.add_tenant(t)?;
        }
        for n in nodes {
            reg.insert_node_unchecked(n)?;
        }
        for j in jobs {
            reg.insert_job_unchecked(j)?;
        }
        reg.check_invariants()?;
        Ok(reg)
    }

    // ---- tenants ----

    pub fn add_tenant(&mut self, tenant: Tenant) -> Result<(), RegistryError> {
        tenant.validate().map_err(RegistryError::InvariantViolation)?;
        if self.tenants.contains_key(&tenant.id) {
            return Err(RegistryError::DuplicateId { entity: "tenant", id: tenant.id });
        }
        let committed: f64 = self.tenants.values().map(|t| t.guaranteed_share).sum();
        if committed + tenant.guaranteed_share > 100.0 {
            return Err(RegistryError::InvariantViolation(format!(
                "guaranteed shares would sum to {:.1} (> 100)",
                committed + tenant.guaranteed_share
            )));
        }
        self.tenant_jobs.entry(tenant.id.clone()).or_default();
        self.tenants.insert(tenant.id.clone(), tenant);
        Ok(())
    }

    pub fn update_tenant(&mut self, tenant: Tenant) -> Result<(), RegistryError> {
        tenant.validate().map_err(RegistryError::InvariantViolation)?;
        if !self.tenants.contains_key(&tenant.id) {
            return Err(RegistryError::NotFound { entity: "tenant", id: tenant.id });
        }
        let committed: f64 = self
            .tenants
            .values()
            .filter(|t| t.id != tenant.id)
            .map(|t| t.guaranteed_share)
            .sum();
        if committed + tenant.guaranteed_share > 100.0 {
            return Err(RegistryError::InvariantViolation(format!(
                "guaranteed shares would sum to {:.1} (> 100)",
                committed + tenant.guaranteed_share
            )));
        }
        self.tenants.insert(tenant.id.clone(), tenant);
        Ok(())
    }

    pub fn tenant(&self, id: &str) -> Result<&Tenant, RegistryError> {
        self.tenants
            .get(id)
            .ok_or_else(|| RegistryError::NotFound { entity: "tenant", id: id.to_string() })
    }

    // ---- nodes ----

    pub fn add_node(&mut self, node: Node) -> Result<(), RegistryError> {
        node.validate().map_err(RegistryError::InvariantViolation)?;
        if node.current_job_id.is_some() {
            return Err(RegistryError::InvariantViolation(
                "a new node cannot carry a current job".to_string(),
            ));
        }
        if self.nodes.contains_key(&node.id) {
            return Err(RegistryError::DuplicateId { entity: "node", id: node.id });
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    fn insert_node_unchecked(&mut self, node: Node) -> Result<(), RegistryError> {
        node.validate().map_err(RegistryError::InvariantViolation)?;
        if self.nodes.contains_key(&node.id) {
            return Err(RegistryError::DuplicateId { entity: "node", id: node.id });
        }
        if let Some(job_id) = &node.current_job_id {
            self.node_to_job.insert(node.id.clone(), job_id.clone());
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn node(&self, id: &str) -> Result<&Node, RegistryError> {
        self.nodes
            .get(id)
            .ok_or_else(|| RegistryError::NotFound { entity: "node", id: id.to_string() })
    }

    /// Update a node's status. Does not touch job state: when a status change
    /// interrupts a running job, the caller requeues the job through
    /// `apply_transition`, which clears the link.
    pub fn set_node_status(
        &mut self,
        id: &str,
        status: NodeStatus,
        error: Option<String>,
    ) -> Result<NodeStatus, RegistryError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound { entity: "node", id: id.to_string() })?;
        let old = node.status;
        node.status = status;
        if error.is_some() {
            node.last_error = error;
        }
        Ok(old)
    }

    pub fn update_node_capabilities(
        &mut self,
        id: &str,
        capabilities: crate::node::Capabilities,
    ) -> Result<(), RegistryError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound { entity: "node", id: id.to_string() })?;
        node.capabilities = capabilities;
        Ok(())
    }

    pub fn record_node_run(
        &mut self,
        id: &str,
        kind: &str,
        duration_hours: f64,
        success: bool,
    ) -> Result<(), RegistryError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound { entity: "node", id: id.to_string() })?;
        node.record_run(kind, duration_hours, success);
        Ok(())
    }

    /// Job currently attached to a node, if any.
    pub fn job_on_node(&self, node_id: &str) -> Option<&str> {
        self.node_to_job.get(node_id).map(|s| s.as_str())
    }

    // ---- jobs ----

    pub fn add_job(&mut self, job: Job) -> Result<(), RegistryError> {
        job.validate().map_err(RegistryError::InvariantViolation)?;
        if self.jobs.contains_key(&job.id) {
            return Err(RegistryError::DuplicateId { entity: "job", id: job.id });
        }
        if !self.tenants.contains_key(&job.tenant_id) {
            return Err(RegistryError::NotFound { entity: "tenant", id: job.tenant_id.clone() });
        }
        if job.status != JobStatus::Pending {
            return Err(RegistryError::InvariantViolation(format!(
                "job {} must be submitted as pending, got {:?}",
                job.id, job.status
            )));
        }
        for dep in &job.dependencies {
            if !self.jobs.contains_key(dep) {
                return Err(RegistryError::NotFound { entity: "job", id: dep.clone() });
            }
        }
        if let Some(cycle) = self.find_dependency_cycle(&job) {
            return Err(RegistryError::InvariantViolation(format!(
                "dependency cycle: {}",
                cycle.join(" -> ")
            )));
        }

        for dep in &job.dependencies {
            self.dependents.entry(dep.clone()).or_default().push(job.id.clone());
        }
        self.tenant_jobs.entry(job.tenant_id.clone()).or_default().push(job.id.clone());
        self.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    fn insert_job_unchecked(&mut self, job: Job) -> Result<(), RegistryError> {
        job.validate().map_err(RegistryError::InvariantViolation)?;
        if self.jobs.contains_key(&job.id) {
            return Err(RegistryError::DuplicateId { entity: "job", id: job.id });
        }
        for dep in &job.dependencies {
            self.dependents.entry(dep.clone()).or_default().push(job.id.clone());
        }
        self.tenant_jobs.entry(job.tenant_id.clone()).or_default().push(job.id.clone());
        if let Some(node_id) = &job.assigned_node_id {
            if job.status == JobStatus::Running {
                self.node_to_job.insert(node_id.clone(), job.id.clone());
            }
        }
        self.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    /// Walk the dependency edges of `candidate` looking for a path back to
    /// itself. Returns the cycle path when one exists.
    fn find_dependency_cycle(&self, candidate: &Job) -> Option<Vec<String>> {
        let mut stack: Vec<(String, Vec<String>)> = candidate
            .dependencies
            .iter()
            .map(|d| (d.clone(), vec![candidate.id.clone(), d.clone()]))
            .collect();
        let mut seen: BTreeSet<String> = BTreeSet::new();

        while let Some((current, path)) = stack.pop() {
            if current == candidate.id {
                return Some(path);
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(job) = self.jobs.get(&current) {
                for dep in &job.dependencies {
                    let mut next = path.clone();
                    next.push(dep.clone());
                    stack.push((dep.clone(), next));
                }
            }
        }
        None
    }

    pub fn job(&self, id: &str) -> Result<&Job, RegistryError> {
        self.jobs
            .get(id)
            .ok_or_else(|| RegistryError::NotFound { entity: "job", id: id.to_string() })
    }

    pub fn jobs_for_tenant(&self, tenant_id: &str) -> &[String] {
        self.tenant_jobs.get(tenant_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn dependents_of(&self, job_id: &str) -> &[String] {
        self.dependents.get(job_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn set_job_priority(&mut self, id: &str, priority: JobPriority) -> Result<JobPriority, RegistryError> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound { entity: "job", id: id.to_string() })?;
        if job.status.is_terminal() {
            return Err(RegistryError::InvariantViolation(format!(
                "cannot change priority of terminal job {id}"
            )));
        }
        let old = job.priority;
        job.priority = priority;
        Ok(old)
    }

    /// Clamped progress update. Completion is a transition, not a progress
    /// side effect; the caller decides when 100% means done.
    pub fn set_job_progress(&mut self, id: &str, progress: f64) -> Result<f64, RegistryError> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound { entity: "job", id: id.to_string() })?;
        let old = job.progress;
        job.progress = progress.clamp(0.0, 100.0);
        Ok(old)
    }

    pub fn increment_error_count(&mut self, id: &str) -> Result<u32, RegistryError> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound { entity: "job", id: id.to_string() })?;
        job.error_count += 1;
        Ok(job.error_count)
    }

    pub fn set_job_requirements(
        &mut self,
        id: &str,
        requirements: crate::job::Requirements,
    ) -> Result<(), RegistryError> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound { entity: "job", id: id.to_string() })?;
        job.requirements = requirements;
        Ok(())
    }

    pub fn set_restore_checkpoint(
        &mut self,
        id: &str,
        checkpoint_id: Option<String>,
        progress: Option<f64>,
    ) -> Result<(), RegistryError> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound { entity: "job", id: id.to_string() })?;
        job.restore_checkpoint_id = checkpoint_id;
        if let Some(p) = progress {
            job.progress = p.clamp(0.0, 100.0);
        }
        Ok(())
    }

    pub fn set_last_checkpoint_time(
        &mut self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound { entity: "job", id: id.to_string() })?;
        job.last_checkpoint_time = Some(at);
        Ok(())
    }

    // ---- transitions ----

    fn transition_is_legal(from: JobStatus, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (from, to),
            (Pending, Queued)
                | (Pending, Running)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Queued)
                | (Running, Cancelled)
        )
    }

    /// Apply a job status transition.
    ///
    /// `to = Running` requires `node_id` and enforces: node online and idle,
    /// all dependencies completed. Leaving `Running` detaches the node on
    /// both sides so the one-job-per-node invariant holds at every return.
    pub fn apply_transition(
        &mut self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
        node_id: Option<&str>,
    ) -> Result<(), RegistryError> {
        let current = self.job(job_id)?.status;
        if current != from {
            return Err(RegistryError::IllegalTransition { job_id: job_id.to_string(), from, to });
        }
        if !Self::transition_is_legal(from, to) {
            return Err(RegistryError::IllegalTransition { job_id: job_id.to_string(), from, to });
        }

        if to == JobStatus::Running {
            let node_id = node_id.ok_or_else(|| {
                RegistryError::InvariantViolation(format!(
                    "job {job_id} cannot run without a target node"
                ))
            })?;
            let node = self.node(node_id)?;
            if !node.is_available() {
                return Err(RegistryError::InvariantViolation(format!(
                    "node {node_id} is not available for job {job_id}"
                )));
            }
            let job = &self.jobs[job_id];
            for dep in &job.dependencies {
                let dep_status = self.job(dep)?.status;
                if dep_status != JobStatus::Completed {
                    return Err(RegistryError::InvariantViolation(format!(
                        "job {job_id} depends on {dep} which is {dep_status:?}"
                    )));
                }
            }

            let node_id = node_id.to_string();
            self.node_to_job.insert(node_id.clone(), job_id.to_string());
            self.nodes.get_mut(&node_id).expect("node checked above").current_job_id =
                Some(job_id.to_string());
            let job = self.jobs.get_mut(job_id).expect("job checked above");
            job.status = to;
            job.assigned_node_id = Some(node_id);
            return Ok(());
        }

        // Detach from the node when leaving Running.
        if from == JobStatus::Running {
            let assigned = self.jobs[job_id].assigned_node_id.clone();
            if let Some(node_id) = assigned {
                if let Some(node) = self.nodes.get_mut(&node_id) {
                    if node.current_job_id.as_deref() == Some(job_id) {
                        node.current_job_id = None;
                    }
                }
                self.node_to_job.remove(&node_id);
            }
        }

        let job = self.jobs.get_mut(job_id).expect("job checked above");
        job.status = to;
        if from == JobStatus::Running {
            job.assigned_node_id = None;
        }
        if to == JobStatus::Completed {
            job.progress = 100.0;
        }
        Ok(())
    }

    // ---- snapshots & invariants ----

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tenants: self.tenants.clone(),
            nodes: self.nodes.clone(),
            jobs: self.jobs.clone(),
        }
    }

    pub fn tenants(&self) -> impl Iterator<Item = &Tenant> {
        self.tenants.values()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// Full consistency audit. Cheap enough to run in tests and after bulk
    /// loads; the per-mutation checks keep it true in steady state.
    pub fn check_invariants(&self) -> Result<(), RegistryError> {
        let committed: f64 = self.tenants.values().map(|t| t.guaranteed_share).sum();
        if committed > 100.0 + 1e-9 {
            return Err(RegistryError::InvariantViolation(format!(
                "guaranteed shares sum to {committed:.1}"
            )));
        }

        for node in self.nodes.values() {
            match &node.current_job_id {
                Some(job_id) => {
                    let job = self.jobs.get(job_id).ok_or_else(|| {
                        RegistryError::InvariantViolation(format!(
                            "node {} references missing job {job_id}",
                            node.id
                        ))
                    })?;
                    if job.status != JobStatus::Running
                        || job.assigned_node_id.as_deref() != Some(node.id.as_str())
                    {
                        return Err(RegistryError::InvariantViolation(format!(
                            "node {} and job {job_id} disagree on assignment",
                            node.id
                        )));
                    }
                }
                None => {}
            }
        }

        for job in self.jobs.values() {
            if job.status == JobStatus::Running {
                let node_id = job.assigned_node_id.as_deref().ok_or_else(|| {
                    RegistryError::InvariantViolation(format!(
                        "running job {} has no assigned node",
                        job.id
                    ))
                })?;
                let node = self.nodes.get(node_id).ok_or_else(|| {
                    RegistryError::InvariantViolation(format!(
                        "running job {} references missing node {node_id}",
                        job.id
                    ))
                })?;
                if node.current_job_id.as_deref() != Some(job.id.as_str()) {
                    return Err(RegistryError::InvariantViolation(format!(
                        "job {} and node {node_id} disagree on assignment",
                        job.id
                    )));
                }
            }
        }
        Ok(())
    }
}
