//! Orchestrator: the facade tying every component together.
//!
//! One `Orchestrator` is constructed at startup with its dependencies passed
//! in explicitly; there are no globals. External adapters (CLI, telemetry
//! feed) call the operations here; everything routes through the registry,
//! and every externally visible decision lands in the audit log.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;

use crate::agent::{AgentEvent, NodeAgent, NoopAgent, StartContext};
use crate::audit::{kinds, AuditEvent, AuditRecorder, AuditSink};
use crate::checkpoint::{CheckpointCoordinator, CheckpointKind, ResilienceLevel};
use crate::config::OrchestratorConfig;
use crate::energy::{EnergyMode, EnergyOptimizer};
use crate::error::OrchestratorError;
use crate::failure::{FailureEvent, FailureKind, FailureManager, RecoveryAction, RecoveryPlan};
use crate::job::{Job, JobPriority, JobStatus};
use crate::matcher::{MatchWeights, SpecializationMatcher};
use crate::metrics::FleetMetrics;
use crate::node::{Node, NodeStatus};
use crate::partition::Allocation;
use crate::registry::{Registry, Snapshot};
use crate::scheduler::{self, CycleReport};
use crate::tenant::Tenant;

const ACTOR_OPERATOR: &str = "operator";
const ACTOR_SCHEDULER: &str = "scheduler";
const ACTOR_FAILURES: &str = "failures";
const ACTOR_CHECKPOINTS: &str = "checkpoints";
const ACTOR_AGENT: &str = "agent";

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Registry,
    matcher: SpecializationMatcher,
    energy: EnergyOptimizer,
    checkpoints: CheckpointCoordinator,
    failures: FailureManager,
    audit: AuditRecorder,
    metrics: FleetMetrics,
    agent: Box<dyn NodeAgent>,
    /// Running jobs with a stop directive out, and when the ack is due.
    pending_cancels: BTreeMap<String, DateTime<Utc>>,
    /// Audit seq of each failure's detection event, for causal links.
    failure_seqs: BTreeMap<String, u64>,
    last_allocations: BTreeMap<String, Allocation>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_parts(config, Registry::new(), AuditRecorder::new(), Box::new(NoopAgent))
    }

    pub fn with_agent(config: OrchestratorConfig, agent: Box<dyn NodeAgent>) -> Self {
        Self::with_parts(config, Registry::new(), AuditRecorder::new(), agent)
    }

    pub fn with_sink(config: OrchestratorConfig, sink: Box<dyn AuditSink>) -> Self {
        Self::with_parts(config, Registry::new(), AuditRecorder::with_sink(sink), Box::new(NoopAgent))
    }

    /// Assemble from reloaded state (restarts). Indexes and component state
    /// are rebuilt; in-flight recovery plans do not survive a restart.
    pub fn with_parts(
        config: OrchestratorConfig,
        registry: Registry,
        audit: AuditRecorder,
        agent: Box<dyn NodeAgent>,
    ) -> Self {
        let mut weights = MatchWeights::default();
        weights.acceptance_threshold = config.match_acceptance_threshold;

        let energy = EnergyOptimizer::new(config.energy_mode, config.defer_slack_hours);
        let checkpoints = CheckpointCoordinator::new(
            config.resilience_level,
            config.checkpoint_interval_overrides.clone(),
        );
        let failures = FailureManager::new(
            Duration::seconds(config.heartbeat_timeout_seconds as i64),
            Duration::seconds(config.progress_stall_timeout_seconds as i64),
        );

        Self {
            config,
            registry,
            matcher: SpecializationMatcher::new(weights),
            energy,
            checkpoints,
            failures,
            audit,
            metrics: FleetMetrics::default(),
            agent,
            pending_cancels: BTreeMap::new(),
            failure_seqs: BTreeMap::new(),
            last_allocations: BTreeMap::new(),
        }
    }

    // ---- registration & submission ----

    pub fn add_tenant(&mut self, tenant: Tenant, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        // Bad input from an adapter is a validation error; the registry's
        // own checks guard invariants.
        tenant.validate().map_err(OrchestratorError::Validation)?;
        let payload = json!({
            "name": tenant.name,
            "tier": tenant.tier,
            "guaranteed_share": tenant.guaranteed_share,
            "max_share": tenant.max_share,
        });
        let subject = format!("tenant:{}", tenant.id);
        self.registry.add_tenant(tenant)?;
        self.audit.record(now, kinds::TENANT_ADDED, ACTOR_OPERATOR, vec![subject], payload, vec![]);
        Ok(())
    }

    pub fn add_node(&mut self, node: Node, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        node.validate().map_err(OrchestratorError::Validation)?;
        let payload = json!({
            "name": node.name,
            "capabilities": node.capabilities,
            "power_draw_watts": node.power_draw_watts,
        });
        let subject = format!("node:{}", node.id);
        self.registry.add_node(node)?;
        self.audit.record(now, kinds::NODE_ADDED, ACTOR_OPERATOR, vec![subject], payload, vec![]);
        Ok(())
    }

    pub fn submit_job(&mut self, job: Job, now: DateTime<Utc>) -> Result<String, OrchestratorError> {
        job.validate().map_err(OrchestratorError::Validation)?;
        let id = job.id.clone();
        let payload = json!({
            "tenant_id": job.tenant_id,
            "name": job.name,
            "kind": job.kind,
            "priority": job.priority,
            "deadline": job.deadline,
            "dependencies": job.dependencies,
        });
        let subject = format!("job:{id}");
        self.registry.add_job(job)?;
        tracing::info!(target: "flotilla", job = %id, "job submitted");
        self.audit.record(now, kinds::JOB_SUBMITTED, ACTOR_OPERATOR, vec![subject], payload, vec![]);
        Ok(id)
    }

    // ---- operator commands ----

    pub fn set_job_priority(
        &mut self,
        job_id: &str,
        priority: JobPriority,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        // No preemption: a running job keeps its node; the new priority
        // matters only if it returns to the queue.
        let old = self.registry.set_job_priority(job_id, priority)?;
        self.audit.record(
            now,
            kinds::JOB_PRIORITY_CHANGED,
            ACTOR_OPERATOR,
            vec![format!("job:{job_id}")],
            json!({"old": old, "new": priority}),
            vec![],
        );
        Ok(())
    }

    pub fn set_energy_mode(&mut self, mode: EnergyMode, now: DateTime<Utc>) {
        self.energy.set_mode(mode);
        self.audit.record(
            now,
            "energy_mode_changed",
            ACTOR_OPERATOR,
            vec![],
            json!({"mode": mode}),
            vec![],
        );
    }

    pub fn set_resilience_level(&mut self, level: ResilienceLevel, now: DateTime<Utc>) {
        self.checkpoints.set_level(level);
        self.audit.record(
            now,
            "resilience_level_changed",
            ACTOR_OPERATOR,
            vec![],
            json!({"level": level}),
            vec![],
        );
    }

    /// Cancellation is cooperative: a pending or queued job cancels
    /// immediately; a running job gets a stop directive and a forced cancel
    /// only if the ack never arrives.
    pub fn cancel_job(&mut self, job_id: &str, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        let status = self.registry.job(job_id)?.status;
        match status {
            JobStatus::Pending | JobStatus::Queued => {
                self.registry.apply_transition(job_id, status, JobStatus::Cancelled, None)?;
                self.finish_cancel(job_id, now, "immediate");
                Ok(())
            }
            JobStatus::Running => {
                if let Err(err) = self.agent.stop(job_id) {
                    tracing::warn!(target: "flotilla", job = %job_id, error = %err, "stop directive failed");
                }
                self.pending_cancels.insert(
                    job_id.to_string(),
                    now + Duration::seconds(self.config.cancel_ack_timeout_seconds as i64),
                );
                self.audit.record(
                    now,
                    "job_cancel_requested",
                    ACTOR_OPERATOR,
                    vec![format!("job:{job_id}")],
                    json!({"ack_timeout_seconds": self.config.cancel_ack_timeout_seconds}),
                    vec![],
                );
                Ok(())
            }
            terminal => Err(OrchestratorError::Invariant(format!(
                "job {job_id} is already {terminal:?}"
            ))),
        }
    }

    fn finish_cancel(&mut self, job_id: &str, now: DateTime<Utc>, how: &str) {
        self.pending_cancels.remove(job_id);
        self.failures.forget_job(job_id);
        self.checkpoints.forget_job(job_id);
        self.audit.record(
            now,
            kinds::JOB_CANCELLED,
            ACTOR_OPERATOR,
            vec![format!("job:{job_id}")],
            json!({"how": how}),
            vec![],
        );
    }

    /// Operator-driven node status change. Interrupts a running job, which
    /// goes back to the queue with its error count bumped.
    pub fn report_node_status(
        &mut self,
        node_id: &str,
        status: NodeStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let interrupted = self.registry.job_on_node(node_id).map(|s| s.to_string());
        let old = self.registry.set_node_status(node_id, status, error.clone())?;
        let seq = self.audit.record(
            now,
            kinds::NODE_STATUS_CHANGED,
            ACTOR_OPERATOR,
            vec![format!("node:{node_id}")],
            json!({"old": old, "new": status, "error": error}),
            vec![],
        );

        if old == NodeStatus::Online && status != NodeStatus::Online {
            if let Some(job_id) = interrupted {
                self.requeue_or_fail(&job_id, now, vec![seq])?;
            }
        }
        Ok(())
    }

    // ---- telemetry ingestion ----

    pub fn ingest(&mut self, event: AgentEvent) -> Result<(), OrchestratorError> {
        event.validate().map_err(OrchestratorError::Validation)?;
        match event {
            AgentEvent::Heartbeat { node_id, status, capabilities, at } => {
                self.failures.observe_heartbeat(&node_id, at);
                if let Some(caps) = capabilities {
                    self.registry.update_node_capabilities(&node_id, caps)?;
                }
                let current = self.registry.node(&node_id)?.status;
                if current != status {
                    self.report_node_status(&node_id, status, None, at)?;
                }
                Ok(())
            }
            AgentEvent::Progress { job_id, pct, at } => self.update_job_progress(&job_id, pct, at),
            AgentEvent::StageCompleted { job_id, stage, at } => {
                self.failures.observe_stage(&job_id);
                // A finished stage is a natural snapshot point.
                self.checkpoints.schedule_checkpoint(&job_id, at);
                self.audit.record(
                    at,
                    "stage_completed",
                    ACTOR_AGENT,
                    vec![format!("job:{job_id}")],
                    json!({"stage": stage}),
                    vec![],
                );
                self.audit.record(
                    at,
                    kinds::CHECKPOINT_SCHEDULED,
                    ACTOR_CHECKPOINTS,
                    vec![format!("job:{job_id}")],
                    json!({"reason": "stage_complete"}),
                    vec![],
                );
                Ok(())
            }
            AgentEvent::Failed { node_id, job_id, reason, at } => {
                let kind = crate::failure::classify_reason(&reason);
                let event = self.failures.report(kind, node_id, job_id, reason, at);
                self.audit_failure(&event, at);
                Ok(())
            }
            AgentEvent::CheckpointCaptured { job_id, size_bytes, storage_handle, at } => {
                self.checkpoint_captured(&job_id, size_bytes, &storage_handle, at)
            }
            AgentEvent::Stopped { job_id, at } => {
                if self.pending_cancels.contains_key(&job_id) {
                    let status = self.registry.job(&job_id)?.status;
                    if status == JobStatus::Running {
                        self.registry.apply_transition(
                            &job_id,
                            JobStatus::Running,
                            JobStatus::Cancelled,
                            None,
                        )?;
                    }
                    self.finish_cancel(&job_id, at, "acknowledged");
                }
                Ok(())
            }
        }
    }

    pub fn update_job_progress(
        &mut self,
        job_id: &str,
        pct: f64,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        self.failures.observe_progress(job_id, pct, now);
        let old = self.registry.set_job_progress(job_id, pct)?;
        let new = self.registry.job(job_id)?.progress;

        // Audit decade crossings only, or the log drowns in progress spam.
        if (new / 10.0) as u32 > (old / 10.0) as u32 {
            self.audit.record(
                now,
                kinds::JOB_PROGRESS,
                ACTOR_AGENT,
                vec![format!("job:{job_id}")],
                json!({"progress": new}),
                vec![],
            );
        }

        if new >= 100.0 && self.registry.job(job_id)?.status == JobStatus::Running {
            self.complete_job(job_id, now)?;
        }
        Ok(())
    }

    pub fn complete_job(&mut self, job_id: &str, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        let job = self.registry.job(job_id)?.clone();
        let node_id = job.assigned_node_id.clone();
        self.registry.apply_transition(job_id, JobStatus::Running, JobStatus::Completed, None)?;

        if let Some(node_id) = &node_id {
            // Fold the run into the node's per-kind history.
            self.registry.record_node_run(
                node_id,
                &job.kind,
                job.estimated_duration_hours,
                true,
            )?;
        }

        let on_time = job.deadline >= now;
        let turnaround_hours = (now - job.submission_time).num_seconds() as f64 / 3600.0;
        self.metrics.record_completion(on_time, turnaround_hours);
        self.pending_cancels.remove(job_id);
        self.failures.forget_job(job_id);
        self.checkpoints.forget_job(job_id);

        tracing::info!(target: "flotilla", job = %job_id, on_time, "job completed");
        self.audit.record(
            now,
            kinds::JOB_COMPLETED,
            ACTOR_AGENT,
            vec![format!("job:{job_id}")],
            json!({"on_time": on_time, "turnaround_hours": turnaround_hours, "node": node_id}),
            vec![],
        );
        Ok(())
    }

    fn checkpoint_captured(
        &mut self,
        job_id: &str,
        size_bytes: u64,
        storage_handle: &str,
        at: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let progress = self.registry.job(job_id)?.progress;
        let checkpoint = self
            .checkpoints
            .complete_capture(job_id, at, CheckpointKind::Periodic, size_bytes, storage_handle, progress)
            .map_err(OrchestratorError::Invariant)?;
        self.registry.set_last_checkpoint_time(job_id, at)?;
        self.audit.record(
            at,
            kinds::CHECKPOINT_CREATED,
            ACTOR_CHECKPOINTS,
            vec![format!("job:{job_id}"), format!("checkpoint:{}", checkpoint.id)],
            json!({
                "kind": checkpoint.kind,
                "size_bytes": size_bytes,
                "storage_handle": storage_handle,
                "progress": progress,
            }),
            vec![],
        );
        Ok(())
    }

    // ---- the cycle ----

    pub fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport, OrchestratorError> {
        self.expire_pending_cancels(now)?;
        self.expire_capture_directives(now);

        // Detection before planning, so fresh failures free their nodes and
        // requeue their jobs inside this same cycle.
        let detected = self.failures.detect(&self.registry.snapshot(), now);
        for event in &detected {
            self.audit_failure(event, now);
        }
        self.process_failures(now)?;

        // Plan on a consistent snapshot, then commit.
        let snapshot = self.registry.snapshot();
        self.matcher.set_power_weight(self.energy.match_power_weight());
        let plan = scheduler::plan_cycle(&snapshot, &self.matcher, &self.energy, now);

        let alloc_seq = self.audit.record(
            now,
            kinds::ALLOCATION_COMPUTED,
            ACTOR_SCHEDULER,
            plan.allocations.keys().map(|t| format!("tenant:{t}")).collect(),
            json!({
                "shares": plan.report.allocated_shares,
                "borrow": plan
                    .allocations
                    .values()
                    .filter(|a| !a.borrowed_from.is_empty())
                    .map(|a| (a.tenant_id.clone(), a.borrowed_from.clone()))
                    .collect::<BTreeMap<_, _>>(),
            }),
            vec![],
        );
        if plan.under_capacity {
            self.audit.record(
                now,
                kinds::UNDER_CAPACITY,
                ACTOR_SCHEDULER,
                vec![],
                json!({"idle": snapshot.idle_online_nodes().count()}),
                vec![alloc_seq],
            );
            tracing::warn!(target: "flotilla", "guarantees exceed idle capacity this cycle");
        }

        for job_id in &plan.promoted_to_queued {
            self.registry.apply_transition(job_id, JobStatus::Pending, JobStatus::Queued, None)?;
        }

        for assignment in &plan.assignments {
            let job = self.registry.job(&assignment.job_id)?.clone();

            // Restore context for recovered jobs.
            let restore_handle = job
                .restore_checkpoint_id
                .as_deref()
                .and_then(|id| self.checkpoints.find(id))
                .map(|c| c.storage_handle.clone());
            if let Some(handle) = &restore_handle {
                if let Err(err) = self.agent.restore_from(&assignment.job_id, handle) {
                    tracing::warn!(target: "flotilla", job = %assignment.job_id, error = %err, "restore directive failed");
                }
            }

            let ctx = StartContext {
                node_id: assignment.node_id.clone(),
                restore_from: restore_handle,
            };
            if let Err(err) = self.agent.start(&job, &ctx) {
                // Leave the job queued; the next cycle retries elsewhere.
                tracing::warn!(target: "flotilla", job = %assignment.job_id, node = %assignment.node_id, error = %err, "start directive failed");
                continue;
            }

            self.registry.apply_transition(
                &assignment.job_id,
                JobStatus::Queued,
                JobStatus::Running,
                Some(&assignment.node_id),
            )?;
            self.registry.set_restore_checkpoint(&assignment.job_id, None, None)?;
            self.matcher.note_assignment(&assignment.node_id);
            self.audit.record(
                now,
                kinds::JOB_SCHEDULED,
                ACTOR_SCHEDULER,
                vec![format!("job:{}", assignment.job_id), format!("node:{}", assignment.node_id)],
                json!({"tenant": assignment.tenant_id, "restored": job.restore_checkpoint_id}),
                vec![alloc_seq],
            );
        }

        for assignment in &plan.deferred {
            self.audit.record(
                now,
                kinds::DEFERRED_ENERGY,
                ACTOR_SCHEDULER,
                vec![format!("job:{}", assignment.job_id)],
                json!({"mode": self.energy.mode(), "node_released": assignment.node_id}),
                vec![alloc_seq],
            );
        }

        self.drive_checkpoints(now)?;

        self.metrics.record_cycle(
            plan.report.utilization_percentage,
            plan.report.estimated_energy_savings_percentage,
        );
        self.audit.record(
            now,
            kinds::CYCLE_COMPLETED,
            ACTOR_SCHEDULER,
            vec![],
            serde_json::to_value(&plan.report).unwrap_or_default(),
            vec![alloc_seq],
        );
        self.matcher.decay_wear();
        self.last_allocations = plan.allocations;

        Ok(plan.report)
    }

    fn expire_pending_cancels(&mut self, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        let expired: Vec<String> = self
            .pending_cancels
            .iter()
            .filter(|(_, due)| now >= **due)
            .map(|(id, _)| id.clone())
            .collect();
        for job_id in expired {
            let job = self.registry.job(&job_id)?.clone();
            if job.status != JobStatus::Running {
                // The job reached a terminal state on its own while the stop
                // directive was pending; nothing left to force.
                self.pending_cancels.remove(&job_id);
                continue;
            }
            let node_id = job.assigned_node_id.clone();
            self.registry.apply_transition(&job_id, JobStatus::Running, JobStatus::Cancelled, None)?;
            if let Some(node_id) = node_id {
                // The agent never confirmed the stop: flag the node for
                // operator review.
                self.registry.set_node_status(
                    &node_id,
                    NodeStatus::Error,
                    Some(format!("no stop ack for job {job_id}")),
                )?;
            }
            self.finish_cancel(&job_id, now, "forced");
        }
        Ok(())
    }

    fn expire_capture_directives(&mut self, now: DateTime<Utc>) {
        for job_id in self.checkpoints.expired_captures(now) {
            // The failure is on the directive, not the job: the job keeps
            // running and the capture is retried next interval.
            let event = self.failures.report(
                FailureKind::StageFailed,
                None,
                None,
                format!("checkpoint capture for {job_id} timed out"),
                now,
            );
            self.audit_failure(&event, now);
            let retry_at = now + self.checkpoints.interval();
            self.checkpoints.schedule_checkpoint(&job_id, retry_at);
        }
    }

    fn audit_failure(&mut self, event: &FailureEvent, now: DateTime<Utc>) {
        let mut subjects = Vec::new();
        if let Some(node) = &event.node_id {
            subjects.push(format!("node:{node}"));
        }
        if let Some(job) = &event.job_id {
            subjects.push(format!("job:{job}"));
        }
        let seq = self.audit.record(
            now,
            kinds::FAILURE_DETECTED,
            ACTOR_FAILURES,
            subjects,
            json!({
                "failure_id": event.id,
                "kind": event.kind,
                "severity": event.severity,
                "description": event.description,
            }),
            vec![],
        );
        self.failure_seqs.insert(event.id.clone(), seq);
    }

    /// Create and execute a recovery plan for every failure that has none.
    fn process_failures(&mut self, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        for event in self.failures.unplanned() {
            let checkpoint =
                event.job_id.as_deref().and_then(|id| self.checkpoints.latest_durable(id)).cloned();
            let plan = self.failures.create_plan(&event, checkpoint.as_ref(), now);
            let cause = self.failure_seqs.get(&event.id).copied();
            let plan_seq = self.audit.record(
                now,
                kinds::RECOVERY_PLAN_CREATED,
                ACTOR_FAILURES,
                event.job_id.iter().map(|j| format!("job:{j}")).collect(),
                json!({
                    "plan_id": plan.id,
                    "failure_id": event.id,
                    "action": plan.action,
                    "target_checkpoint": plan.target_checkpoint_id,
                }),
                cause.into_iter().collect(),
            );
            self.execute_plan(&event, &plan, now, plan_seq)?;
        }
        Ok(())
    }

    fn execute_plan(
        &mut self,
        event: &FailureEvent,
        plan: &RecoveryPlan,
        now: DateTime<Utc>,
        plan_seq: u64,
    ) -> Result<(), OrchestratorError> {
        self.failures.begin_execution(&plan.id);

        if plan.action == RecoveryAction::Manual {
            self.failures.escalate(&plan.id, now);
            self.audit.record(
                now,
                kinds::RECOVERY_ESCALATED,
                ACTOR_FAILURES,
                event.job_id.iter().map(|j| format!("job:{j}")).collect(),
                json!({"plan_id": plan.id, "reason": "manual action required"}),
                vec![plan_seq],
            );
            return Ok(());
        }

        // Node side effects first: a silent node goes offline so the
        // scheduler stops considering it.
        if event.kind == FailureKind::NodeOffline {
            if let Some(node_id) = &event.node_id {
                self.registry.set_node_status(
                    node_id,
                    NodeStatus::Offline,
                    Some("heartbeat timeout".to_string()),
                )?;
            }
        }

        // Job side effects by action. A job that is already terminal, or
        // that the registry has never heard of, gets none.
        let job_status = event
            .job_id
            .as_deref()
            .and_then(|id| self.registry.job(id).ok())
            .map(|j| j.status);
        if let (Some(job_id), Some(status)) = (event.job_id.clone(), job_status) {
            if status.is_terminal() {
                self.failures.complete_plan(&plan.id, false, now);
                return Ok(());
            }
            match plan.action {
                RecoveryAction::Restart => {
                    self.registry.set_restore_checkpoint(&job_id, None, Some(0.0))?;
                }
                RecoveryAction::RestoreCheckpoint | RecoveryAction::PartialRestart => {
                    if let Some(target) = &plan.target_checkpoint_id {
                        let progress = self.checkpoints.find(target).map(|c| c.progress);
                        self.registry.set_restore_checkpoint(
                            &job_id,
                            Some(target.clone()),
                            progress,
                        )?;
                    }
                }
                RecoveryAction::Reconfigure => {
                    // Raise the memory ask so the re-match lands on a larger
                    // node.
                    let mut req = self.registry.job(&job_id)?.requirements.clone();
                    req.memory_gb = (req.memory_gb * 2).max(16);
                    self.registry.set_job_requirements(&job_id, req)?;
                }
                RecoveryAction::Migrate | RecoveryAction::Skip => {}
                RecoveryAction::Abort => {
                    if status == JobStatus::Running {
                        self.registry.apply_transition(&job_id, status, JobStatus::Failed, None)?;
                        self.metrics.record_failure();
                    }
                }
                RecoveryAction::Manual => unreachable!("handled above"),
            }

            // Every non-abort action sends the job back through the queue.
            if plan.action != RecoveryAction::Abort {
                self.requeue_or_fail(&job_id, now, vec![plan_seq])?;
            }
        }

        self.failures.complete_plan(&plan.id, true, now);
        self.audit.record(
            now,
            kinds::RECOVERY_COMPLETED,
            ACTOR_FAILURES,
            event.job_id.iter().map(|j| format!("job:{j}")).collect(),
            json!({"plan_id": plan.id, "action": plan.action}),
            vec![plan_seq],
        );
        Ok(())
    }

    /// Requeue an interrupted running job, or fail it outright once its
    /// error budget for the tenant tier is spent.
    fn requeue_or_fail(
        &mut self,
        job_id: &str,
        now: DateTime<Utc>,
        causes: Vec<u64>,
    ) -> Result<(), OrchestratorError> {
        let job = self.registry.job(job_id)?.clone();
        if job.status != JobStatus::Running {
            return Ok(());
        }

        let errors = self.registry.increment_error_count(job_id)?;
        let tier = self.registry.tenant(&job.tenant_id)?.tier;
        let threshold = self.config.error_threshold(tier);

        if errors > threshold {
            self.registry.apply_transition(job_id, JobStatus::Running, JobStatus::Failed, None)?;
            self.metrics.record_failure();
            tracing::warn!(target: "flotilla", job = %job_id, errors, threshold, "error budget spent, job failed");
            self.audit.record(
                now,
                "job_failed",
                ACTOR_FAILURES,
                vec![format!("job:{job_id}")],
                json!({"error_count": errors, "threshold": threshold}),
                causes,
            );
        } else {
            self.registry.apply_transition(job_id, JobStatus::Running, JobStatus::Queued, None)?;
            self.audit.record(
                now,
                kinds::JOB_INTERRUPTED,
                ACTOR_FAILURES,
                vec![format!("job:{job_id}")],
                json!({"error_count": errors}),
                causes,
            );
        }
        Ok(())
    }

    /// Schedule due snapshots for running jobs and push capture directives.
    fn drive_checkpoints(&mut self, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        let jobs = self.registry.snapshot().jobs;
        for job in jobs.values() {
            if job.status != JobStatus::Running {
                continue;
            }
            if self.checkpoints.should_checkpoint(job, now, false) {
                self.checkpoints.schedule_checkpoint(&job.id, now);
                self.audit.record(
                    now,
                    kinds::CHECKPOINT_SCHEDULED,
                    ACTOR_CHECKPOINTS,
                    vec![format!("job:{}", job.id)],
                    json!({"reason": "interval"}),
                    vec![],
                );
            }
        }
        self.checkpoints.process_due(now, &jobs, self.agent.as_mut());
        Ok(())
    }

    // ---- views ----

    pub fn snapshot(&self) -> Snapshot {
        self.registry.snapshot()
    }

    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }

    pub fn audit_events(&self) -> &[AuditEvent] {
        self.audit.events()
    }

    pub fn metrics(&self) -> &FleetMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn energy_mode(&self) -> EnergyMode {
        self.energy.mode()
    }

    pub fn last_allocations(&self) -> &BTreeMap<String, Allocation> {
        &self.last_allocations
    }

    pub fn checkpoints_for(&self, job_id: &str) -> &[crate::checkpoint::Checkpoint] {
        self.checkpoints.checkpoints_for(job_id)
    }

    /// Retained checkpoint metadata across all jobs, for persistence.
    pub fn checkpoint_inventory(&self) -> Vec<crate::checkpoint::Checkpoint> {
        self.checkpoints.all().cloned().collect()
    }

    /// Reload persisted checkpoint metadata after a restart.
    pub fn restore_checkpoints(&mut self, checkpoints: Vec<crate::checkpoint::Checkpoint>) {
        self.checkpoints.restore(checkpoints);
    }

    pub fn job_status(&self, job_id: &str, now: DateTime<Utc>) -> Result<JobStatusView, OrchestratorError> {
        let job = self.registry.job(job_id)?.clone();
        let time_until_deadline_hours = (job.deadline - now).num_seconds() as f64 / 3600.0;
        let estimated_completion = now
            + Duration::seconds((job.remaining_hours().max(0.0) * 3600.0) as i64);
        let assigned_node = job.assigned_node_id.clone();
        let latest_recovery = self.failures.latest_plan_for_job(job_id).cloned();
        Ok(JobStatusView {
            id: job.id.clone(),
            tenant_id: job.tenant_id.clone(),
            name: job.name.clone(),
            status: job.status,
            priority: job.priority,
            progress: job.progress,
            deadline: job.deadline,
            time_until_deadline_hours,
            estimated_completion,
            will_meet_deadline: estimated_completion <= job.deadline,
            assigned_node,
            error_count: job.error_count,
            submission_time: job.submission_time,
            last_checkpoint_time: job.last_checkpoint_time,
            restore_checkpoint_id: job.restore_checkpoint_id,
            latest_recovery,
        })
    }

    pub fn fleet_status(&self) -> FleetStatusView {
        let snapshot = self.registry.snapshot();
        let mut jobs_by_status: BTreeMap<String, usize> = BTreeMap::new();
        for job in snapshot.jobs.values() {
            let key = serde_json::to_value(job.status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("{:?}", job.status));
            *jobs_by_status.entry(key).or_insert(0) += 1;
        }
        FleetStatusView {
            tenants: snapshot.tenants.len(),
            nodes_total: snapshot.nodes.len(),
            nodes_online: snapshot.online_nodes().count(),
            jobs_by_status,
            energy_mode: self.energy.mode(),
            resilience_level: self.checkpoints.level(),
            metrics: self.metrics.clone(),
            unresolved_failures: self.failures.unresolved().count(),
            mean_time_to_recovery_seconds: self.failures.mean_time_to_recovery_seconds(),
            failure_rate_per_hour: self.failures.failure_rate_per_hour(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub progress: f64,
    pub deadline: DateTime<Utc>,
    pub time_until_deadline_hours: f64,
    pub estimated_completion: DateTime<Utc>,
    pub will_meet_deadline: bool,
    pub assigned_node: Option<String>,
    pub error_count: u32,
    pub submission_time: DateTime<Utc>,
    pub last_checkpoint_time: Option<DateTime<Utc>>,
    pub restore_checkpoint_id: Option<String>,
    pub latest_recovery: Option<RecoveryPlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetStatusView {
    pub tenants: usize,
    pub nodes_total: usize,
    pub nodes_online: usize,
    pub jobs_by_status: BTreeMap<String, usize>,
    pub energy_mode: EnergyMode,
    pub resilience_level: ResilienceLevel,
    pub metrics: FleetMetrics,
    pub unresolved_failures: usize,
    pub mean_time_to_recovery_seconds: Option<f64>,
    pub failure_rate_per_hour: f64,
}
