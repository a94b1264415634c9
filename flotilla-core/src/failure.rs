//! Failure detection and recovery planning.
//!
//! Detection feeds on agent telemetry: heartbeat silence becomes
//! `node_offline`, progress stalls become `timeout`, explicit failure
//! reports are classified from their reason. Each failure walks
//! detected -> classified -> plan_created -> executing -> (resolved |
//! escalated); the chosen action comes from a fixed strategy table, with
//! checkpoint-based actions carrying the latest durable snapshot handle.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::job::JobStatus;
use crate::node::NodeStatus;
use crate::registry::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NodeOffline,
    JobCrash,
    StageFailed,
    Timeout,
    MemoryExhaustion,
    Deadlock,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub id: String,
    pub kind: FailureKind,
    pub severity: FailureSeverity,
    pub detected_at: DateTime<Utc>,
    pub node_id: Option<String>,
    pub job_id: Option<String>,
    pub description: String,
    pub resolved: bool,
    /// Recovery plan id once resolution lands.
    pub resolution_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Restart,
    RestoreCheckpoint,
    Migrate,
    PartialRestart,
    Reconfigure,
    Skip,
    Abort,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    Created,
    Executing,
    Resolved,
    Escalated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub id: String,
    pub failure_id: String,
    pub action: RecoveryAction,
    pub target_checkpoint_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub state: PlanState,
}

/// Default action per failure kind.
pub fn default_action(kind: FailureKind) -> RecoveryAction {
    match kind {
        FailureKind::NodeOffline => RecoveryAction::Migrate,
        FailureKind::JobCrash => RecoveryAction::RestoreCheckpoint,
        FailureKind::StageFailed => RecoveryAction::PartialRestart,
        FailureKind::MemoryExhaustion => RecoveryAction::Reconfigure,
        FailureKind::Deadlock => RecoveryAction::Restart,
        FailureKind::Timeout => RecoveryAction::RestoreCheckpoint,
        FailureKind::Unknown => RecoveryAction::Manual,
    }
}

pub fn severity_for(kind: FailureKind) -> FailureSeverity {
    match kind {
        FailureKind::NodeOffline => FailureSeverity::High,
        FailureKind::JobCrash => FailureSeverity::Medium,
        FailureKind::StageFailed => FailureSeverity::Medium,
        FailureKind::Timeout => FailureSeverity::Low,
        FailureKind::MemoryExhaustion => FailureSeverity::High,
        FailureKind::Deadlock => FailureSeverity::High,
        FailureKind::Unknown => FailureSeverity::Critical,
    }
}

/// Map a free-form agent failure reason onto a kind.
pub fn classify_reason(reason: &str) -> FailureKind {
    let reason = reason.to_lowercase();
    if reason.contains("oom") || reason.contains("memory") {
        FailureKind::MemoryExhaustion
    } else if reason.contains("deadlock") {
        FailureKind::Deadlock
    } else if reason.contains("timeout") || reason.contains("stall") {
        FailureKind::Timeout
    } else if reason.contains("stage") {
        FailureKind::StageFailed
    } else if reason.contains("crash") || reason.contains("signal") || reason.contains("exit") {
        FailureKind::JobCrash
    } else {
        FailureKind::Unknown
    }
}

/// Sliding-window resilience accounting (MTTR, failure rate).
#[derive(Debug, Default, Clone)]
struct ResilienceStats {
    resolutions: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    failures: Vec<DateTime<Utc>>,
}

impl ResilienceStats {
    const WINDOW_HOURS: i64 = 24;

    fn record_failure(&mut self, at: DateTime<Utc>) {
        self.failures.push(at);
        self.trim(at);
    }

    fn record_resolution(&mut self, detected: DateTime<Utc>, resolved: DateTime<Utc>) {
        self.resolutions.push((detected, resolved));
    }

    fn trim(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(Self::WINDOW_HOURS);
        self.failures.retain(|t| *t >= cutoff);
    }

    fn mttr_seconds(&self) -> Option<f64> {
        if self.resolutions.is_empty() {
            return None;
        }
        let total: i64 =
            self.resolutions.iter().map(|(d, r)| (*r - *d).num_seconds()).sum();
        Some(total as f64 / self.resolutions.len() as f64)
    }

    fn failure_rate_per_hour(&self) -> f64 {
        self.failures.len() as f64 / Self::WINDOW_HOURS as f64
    }
}

#[derive(Debug)]
pub struct FailureManager {
    heartbeat_timeout: Duration,
    progress_stall_timeout: Duration,
    last_heartbeat: BTreeMap<String, DateTime<Utc>>,
    last_progress: BTreeMap<String, (f64, DateTime<Utc>)>,
    /// Jobs that have reported at least one completed stage; stage-level
    /// restart only makes sense for them.
    staged_jobs: BTreeSet<String>,
    events: Vec<FailureEvent>,
    plans: Vec<RecoveryPlan>,
    next_event: u64,
    next_plan: u64,
    stats: ResilienceStats,
}

impl FailureManager {
    pub fn new(heartbeat_timeout: Duration, progress_stall_timeout: Duration) -> Self {
        Self {
            heartbeat_timeout,
            progress_stall_timeout,
            last_heartbeat: BTreeMap::new(),
            last_progress: BTreeMap::new(),
            staged_jobs: BTreeSet::new(),
            events: Vec::new(),
            plans: Vec::new(),
            next_event: 1,
            next_plan: 1,
            stats: ResilienceStats::default(),
        }
    }

    // ---- telemetry bookkeeping ----

    pub fn observe_heartbeat(&mut self, node_id: &str, at: DateTime<Utc>) {
        self.last_heartbeat.insert(node_id.to_string(), at);
    }

    pub fn observe_progress(&mut self, job_id: &str, pct: f64, at: DateTime<Utc>) {
        self.last_progress.insert(job_id.to_string(), (pct, at));
    }

    pub fn observe_stage(&mut self, job_id: &str) {
        self.staged_jobs.insert(job_id.to_string());
    }

    pub fn forget_job(&mut self, job_id: &str) {
        self.last_progress.remove(job_id);
        self.staged_jobs.remove(job_id);
    }

    pub fn job_has_stages(&self, job_id: &str) -> bool {
        self.staged_jobs.contains(job_id)
    }

    // ---- detection ----

    /// Scan the snapshot for silent nodes and stalled jobs. Only nodes that
    /// have heartbeated at least once can go silent; running jobs stall when
    /// neither progress nor launch happened within the stall window.
    pub fn detect(&mut self, snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<FailureEvent> {
        let mut found = Vec::new();

        for node in snapshot.nodes.values() {
            if node.status != NodeStatus::Online {
                continue;
            }
            let Some(last) = self.last_heartbeat.get(&node.id).copied() else { continue };
            if now - last > self.heartbeat_timeout {
                // One event per silence: drop the ledger entry so the node
                // is only reported again after it heartbeats anew.
                self.last_heartbeat.remove(&node.id);
                found.push(self.record(
                    FailureKind::NodeOffline,
                    Some(node.id.clone()),
                    node.current_job_id.clone(),
                    format!("node {} missed heartbeats for {}s", node.id, (now - last).num_seconds()),
                    now,
                ));
            }
        }

        for job in snapshot.jobs.values() {
            if job.status != JobStatus::Running {
                continue;
            }
            let Some(last) = self.last_progress.get(&job.id).map(|(_, last)| *last) else { continue };
            if now - last > self.progress_stall_timeout {
                self.last_progress.remove(&job.id);
                found.push(self.record(
                    FailureKind::Timeout,
                    job.assigned_node_id.clone(),
                    Some(job.id.clone()),
                    format!("job {} stalled for {}s", job.id, (now - last).num_seconds()),
                    now,
                ));
            }
        }

        found
    }

    /// Record an explicitly reported failure (agent `Failed` event, capture
    /// timeout, operator report).
    pub fn report(
        &mut self,
        kind: FailureKind,
        node_id: Option<String>,
        job_id: Option<String>,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> FailureEvent {
        self.record(kind, node_id, job_id, description.into(), now)
    }

    fn record(
        &mut self,
        kind: FailureKind,
        node_id: Option<String>,
        job_id: Option<String>,
        description: String,
        now: DateTime<Utc>,
    ) -> FailureEvent {
        let event = FailureEvent {
            id: format!("fail-{:06}", self.next_event),
            kind,
            severity: severity_for(kind),
            detected_at: now,
            node_id,
            job_id,
            description,
            resolved: false,
            resolution_ref: None,
        };
        self.next_event += 1;
        self.stats.record_failure(now);
        tracing::warn!(
            target: "flotilla::failure",
            id = %event.id,
            kind = ?event.kind,
            node = ?event.node_id,
            job = ?event.job_id,
            "failure detected"
        );
        self.events.push(event.clone());
        event
    }

    // ---- planning & execution ----

    /// Build the recovery plan for a failure. Checkpoint-based actions take
    /// the latest durable checkpoint; `partial_restart` degrades to
    /// `restart` for jobs that never reported stages; checkpoint actions
    /// degrade to `restart` when no checkpoint exists.
    pub fn create_plan(
        &mut self,
        failure: &FailureEvent,
        latest_checkpoint: Option<&Checkpoint>,
        now: DateTime<Utc>,
    ) -> RecoveryPlan {
        let mut action = default_action(failure.kind);

        if action == RecoveryAction::PartialRestart {
            let staged = failure
                .job_id
                .as_deref()
                .map(|id| self.job_has_stages(id))
                .unwrap_or(false);
            if !staged {
                action = RecoveryAction::Restart;
            }
        }
        if action == RecoveryAction::RestoreCheckpoint && latest_checkpoint.is_none() {
            action = RecoveryAction::Restart;
        }

        let target_checkpoint_id = match action {
            RecoveryAction::RestoreCheckpoint | RecoveryAction::PartialRestart => {
                latest_checkpoint.map(|c| c.id.clone())
            }
            _ => None,
        };

        let plan = RecoveryPlan {
            id: format!("plan-{:06}", self.next_plan),
            failure_id: failure.id.clone(),
            action,
            target_checkpoint_id,
            created_at: now,
            completed_at: None,
            success: None,
            state: PlanState::Created,
        };
        self.next_plan += 1;
        self.plans.push(plan.clone());
        plan
    }

    pub fn begin_execution(&mut self, plan_id: &str) {
        if let Some(plan) = self.plans.iter_mut().find(|p| p.id == plan_id) {
            plan.state = PlanState::Executing;
        }
    }

    /// Close out a plan. Success marks the failure resolved and feeds MTTR.
    pub fn complete_plan(&mut self, plan_id: &str, success: bool, now: DateTime<Utc>) {
        let Some(plan) = self.plans.iter_mut().find(|p| p.id == plan_id) else { return };
        plan.completed_at = Some(now);
        plan.success = Some(success);
        plan.state = if success { PlanState::Resolved } else { PlanState::Escalated };
        let failure_id = plan.failure_id.clone();
        let plan_id = plan.id.clone();

        if let Some(event) = self.events.iter_mut().find(|e| e.id == failure_id) {
            if success {
                event.resolved = true;
                event.resolution_ref = Some(plan_id);
                self.stats.record_resolution(event.detected_at, now);
            }
        }
    }

    /// Escalate without resolution (manual action, execution timeout).
    pub fn escalate(&mut self, plan_id: &str, now: DateTime<Utc>) {
        if let Some(plan) = self.plans.iter_mut().find(|p| p.id == plan_id) {
            plan.completed_at = Some(now);
            plan.success = Some(false);
            plan.state = PlanState::Escalated;
        }
    }

    // ---- views ----

    pub fn events(&self) -> &[FailureEvent] {
        &self.events
    }

    pub fn plans(&self) -> &[RecoveryPlan] {
        &self.plans
    }

    pub fn latest_plan_for_job(&self, job_id: &str) -> Option<&RecoveryPlan> {
        let failure_ids: Vec<&str> = self
            .events
            .iter()
            .filter(|e| e.job_id.as_deref() == Some(job_id))
            .map(|e| e.id.as_str())
            .collect();
        self.plans.iter().rev().find(|p| failure_ids.contains(&p.failure_id.as_str()))
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &FailureEvent> {
        self.events.iter().filter(|e| !e.resolved)
    }

    /// Failures that have no recovery plan yet, oldest first. Cloned so the
    /// caller can plan and execute while holding `&mut self`.
    pub fn unplanned(&self) -> Vec<FailureEvent> {
        self.events
            .iter()
            .filter(|e| !e.resolved)
            .filter(|e| !self.plans.iter().any(|p| p.failure_id == e.id))
            .cloned()
            .collect()
    }

    pub fn mean_time_to_recovery_seconds(&self) -> Option<f64> {
        self.stats.mttr_seconds()
    }

    pub fn failure_rate_per_hour(&self) -> f64 {
        self.stats.failure_rate_per_hour()
    }
}
