//! End-to-end scheduling scenarios driven through the orchestrator facade.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use flotilla_core::agent::{NodeAgent, StartContext};
use flotilla_core::audit::{kinds, AuditFilter};
use flotilla_core::{
    AgentEvent, Capabilities, EnergyMode, Job, JobPriority, JobStatus, Node, NodeStatus,
    Orchestrator, OrchestratorConfig, RecoveryAction, Tenant,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

fn caps() -> Capabilities {
    Capabilities { cpu_cores: 16, memory_gb: 64, gpu_count: 1, storage_gb: 500, ..Default::default() }
}

fn add_fleet(orc: &mut Orchestrator, tenants: &[(&str, f64, f64)], nodes: usize) {
    for (id, guaranteed, max) in tenants {
        orc.add_tenant(Tenant::new(*id, *id).with_shares(*guaranteed, *max), t0()).unwrap();
    }
    for i in 0..nodes {
        let node = Node::new(format!("n{i:02}"), format!("rack1-{i:02}")).with_capabilities(caps());
        orc.add_node(node, t0()).unwrap();
    }
}

fn submit(orc: &mut Orchestrator, id: &str, tenant: &str, deadline_hours: i64) {
    let job = Job::new(id, tenant, id, t0() + Duration::hours(deadline_hours), t0())
        .with_duration_hours(1.0);
    orc.submit_job(job, t0()).unwrap();
}

/// Agent double that records every directive it receives.
#[derive(Clone, Default)]
struct RecordingAgent {
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingAgent {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl NodeAgent for RecordingAgent {
    fn start(&mut self, job: &Job, ctx: &StartContext) -> Result<(), String> {
        self.calls.lock().unwrap().push(format!(
            "start {} on {}{}",
            job.id,
            ctx.node_id,
            ctx.restore_from.as_deref().map(|h| format!(" from {h}")).unwrap_or_default()
        ));
        Ok(())
    }

    fn stop(&mut self, job_id: &str) -> Result<(), String> {
        self.calls.lock().unwrap().push(format!("stop {job_id}"));
        Ok(())
    }

    fn checkpoint(&mut self, job_id: &str) -> Result<(), String> {
        self.calls.lock().unwrap().push(format!("checkpoint {job_id}"));
        Ok(())
    }

    fn restore_from(&mut self, job_id: &str, storage_handle: &str) -> Result<(), String> {
        self.calls.lock().unwrap().push(format!("restore {job_id} from {storage_handle}"));
        Ok(())
    }
}

#[test]
fn two_tenants_with_equal_guarantees_borrow_idle_capacity() {
    let mut orc = Orchestrator::new(OrchestratorConfig::default());
    add_fleet(&mut orc, &[("a", 50.0, 100.0), ("b", 50.0, 100.0)], 10);
    for i in 0..8 {
        submit(&mut orc, &format!("a{i}"), "a", 8);
    }
    for i in 0..2 {
        submit(&mut orc, &format!("b{i}"), "b", 8);
    }

    let report = orc.run_cycle(t0()).unwrap();
    assert_eq!(report.jobs_scheduled, 10);
    assert_eq!(report.utilization_percentage, 100.0);

    let allocations = orc.last_allocations();
    assert_eq!(allocations["a"].nodes.len(), 8);
    assert_eq!(allocations["b"].nodes.len(), 2);
    assert_eq!(allocations["a"].borrowed_from["b"], 3.0);
    assert_eq!(allocations["b"].lent_to["a"], 3.0);

    // At most one running job per node, and every running job's node agrees.
    let snap = orc.snapshot();
    let mut seen_nodes = BTreeSet::new();
    for job in snap.jobs.values() {
        assert_eq!(job.status, JobStatus::Running);
        let node_id = job.assigned_node_id.as_deref().unwrap();
        assert!(seen_nodes.insert(node_id.to_string()), "node {node_id} double-booked");
        assert_eq!(snap.nodes[node_id].current_job_id.as_deref(), Some(job.id.as_str()));
    }
}

#[test]
fn looming_deadline_beats_a_relaxed_critical_job() {
    let mut orc = Orchestrator::new(OrchestratorConfig::default());
    add_fleet(&mut orc, &[("a", 100.0, 100.0)], 1);

    // 10 minutes of work with 5 minutes of slack, versus a critical job
    // with two hours to spare.
    let j1 = Job::new("j1", "a", "urgent-low", t0() + Duration::minutes(5), t0())
        .with_priority(JobPriority::Low)
        .with_duration_hours(10.0 / 60.0);
    let j2 = Job::new("j2", "a", "relaxed-critical", t0() + Duration::hours(2), t0())
        .with_priority(JobPriority::Critical)
        .with_duration_hours(0.5);
    orc.submit_job(j1, t0()).unwrap();
    orc.submit_job(j2, t0()).unwrap();

    orc.run_cycle(t0()).unwrap();
    let snap = orc.snapshot();
    assert_eq!(snap.jobs["j1"].status, JobStatus::Running);
    assert_eq!(snap.jobs["j2"].status, JobStatus::Queued);
}

#[test]
fn silent_node_fails_over_to_another_node() {
    let mut orc = Orchestrator::new(OrchestratorConfig::default());
    add_fleet(&mut orc, &[("a", 100.0, 100.0)], 2);
    submit(&mut orc, "j3", "a", 8);

    orc.run_cycle(t0()).unwrap();
    let first_node = orc.snapshot().jobs["j3"].assigned_node_id.clone().unwrap();
    orc.ingest(AgentEvent::Heartbeat {
        node_id: first_node.clone(),
        status: NodeStatus::Online,
        capabilities: None,
        at: t0(),
    })
    .unwrap();

    // Heartbeats stop; the default timeout is 90s.
    let later = t0() + Duration::seconds(180);
    orc.run_cycle(later).unwrap();

    let snap = orc.snapshot();
    assert_eq!(snap.nodes[&first_node].status, NodeStatus::Offline);
    assert_eq!(snap.jobs["j3"].status, JobStatus::Running);
    assert_eq!(snap.jobs["j3"].error_count, 1);
    let second_node = snap.jobs["j3"].assigned_node_id.clone().unwrap();
    assert_ne!(second_node, first_node);

    let offline_events: Vec<_> =
        orc.audit().query(AuditFilter::kind(kinds::FAILURE_DETECTED)).collect();
    assert_eq!(offline_events.len(), 1);
    assert!(offline_events[0].payload["kind"] == "node_offline");
}

#[test]
fn crash_restores_from_the_latest_durable_checkpoint() {
    let agent = RecordingAgent::default();
    let mut orc =
        Orchestrator::with_agent(OrchestratorConfig::default(), Box::new(agent.clone()));
    add_fleet(&mut orc, &[("a", 100.0, 100.0)], 1);
    submit(&mut orc, "j4", "a", 12);
    orc.run_cycle(t0()).unwrap();

    // Progress to 50%, capture a checkpoint there, then crash at 60%.
    orc.ingest(AgentEvent::Progress { job_id: "j4".into(), pct: 50.0, at: t0() + Duration::minutes(30) })
        .unwrap();
    orc.ingest(AgentEvent::CheckpointCaptured {
        job_id: "j4".into(),
        size_bytes: 4096,
        storage_handle: "store://ckpt/j4/1".into(),
        at: t0() + Duration::minutes(31),
    })
    .unwrap();
    orc.ingest(AgentEvent::Progress { job_id: "j4".into(), pct: 60.0, at: t0() + Duration::minutes(45) })
        .unwrap();
    orc.ingest(AgentEvent::Failed {
        node_id: None,
        job_id: Some("j4".into()),
        reason: "renderer crashed with signal 11".into(),
        at: t0() + Duration::minutes(50),
    })
    .unwrap();

    orc.run_cycle(t0() + Duration::minutes(51)).unwrap();

    let snap = orc.snapshot();
    assert_eq!(snap.jobs["j4"].status, JobStatus::Running);
    // Resumed progress starts where the checkpoint left off.
    assert_eq!(snap.jobs["j4"].progress, 50.0);

    let view = orc.job_status("j4", t0() + Duration::minutes(52)).unwrap();
    let plan = view.latest_recovery.unwrap();
    assert_eq!(plan.action, RecoveryAction::RestoreCheckpoint);
    assert!(plan.target_checkpoint_id.is_some());

    let calls = agent.calls();
    assert!(
        calls.iter().any(|c| c.starts_with("restore j4 from store://ckpt/j4/1")),
        "no restore directive in {calls:?}"
    );
}

#[test]
fn efficiency_mode_defers_then_performance_mode_runs() {
    let mut config = OrchestratorConfig::default();
    config.energy_mode = EnergyMode::Efficiency;
    let mut orc = Orchestrator::new(config);
    add_fleet(&mut orc, &[("a", 100.0, 100.0)], 1);

    // Low priority with six hours of slack: deferred under efficiency.
    let j5 = Job::new("j5", "a", "overnight", t0() + Duration::hours(7), t0())
        .with_priority(JobPriority::Low)
        .with_duration_hours(1.0);
    orc.submit_job(j5, t0()).unwrap();

    let report = orc.run_cycle(t0()).unwrap();
    assert_eq!(report.jobs_scheduled, 0);
    assert_eq!(report.jobs_deferred, 1);
    assert_eq!(orc.snapshot().jobs["j5"].status, JobStatus::Queued);
    assert_eq!(orc.audit().query(AuditFilter::kind(kinds::DEFERRED_ENERGY)).count(), 1);

    orc.set_energy_mode(EnergyMode::Performance, t0() + Duration::minutes(1));
    orc.run_cycle(t0() + Duration::minutes(2)).unwrap();
    assert_eq!(orc.snapshot().jobs["j5"].status, JobStatus::Running);
}

#[test]
fn dependent_job_waits_for_completion() {
    let mut orc = Orchestrator::new(OrchestratorConfig::default());
    add_fleet(&mut orc, &[("a", 100.0, 100.0)], 2);
    submit(&mut orc, "j5", "a", 8);
    let j6 = Job::new("j6", "a", "composite", t0() + Duration::hours(8), t0())
        .with_priority(JobPriority::Critical)
        .with_dependencies(vec!["j5".to_string()]);
    orc.submit_job(j6, t0()).unwrap();

    orc.run_cycle(t0()).unwrap();
    let snap = orc.snapshot();
    assert_eq!(snap.jobs["j5"].status, JobStatus::Running);
    // Top priority, but gated on its dependency.
    assert_eq!(snap.jobs["j6"].status, JobStatus::Pending);

    orc.update_job_progress("j5", 100.0, t0() + Duration::hours(1)).unwrap();
    orc.run_cycle(t0() + Duration::hours(1)).unwrap();
    assert_eq!(orc.snapshot().jobs["j6"].status, JobStatus::Running);
}

#[test]
fn audit_log_is_monotonic_and_causally_linked() {
    let mut orc = Orchestrator::new(OrchestratorConfig::default());
    add_fleet(&mut orc, &[("a", 100.0, 100.0)], 2);
    submit(&mut orc, "j1", "a", 8);
    orc.run_cycle(t0()).unwrap();
    orc.update_job_progress("j1", 100.0, t0() + Duration::minutes(30)).unwrap();
    orc.run_cycle(t0() + Duration::minutes(31)).unwrap();

    let events = orc.audit_events();
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));

    // job_scheduled points back at the allocation that granted the node.
    let scheduled = events.iter().find(|e| e.kind == kinds::JOB_SCHEDULED).unwrap();
    let cause = scheduled.causes[0];
    let alloc = events.iter().find(|e| e.seq == cause).unwrap();
    assert_eq!(alloc.kind, kinds::ALLOCATION_COMPUTED);
}

#[test]
fn repeated_cycles_without_input_are_stable() {
    let mut orc = Orchestrator::new(OrchestratorConfig::default());
    add_fleet(&mut orc, &[("a", 60.0, 100.0), ("b", 40.0, 100.0)], 5);
    for i in 0..3 {
        submit(&mut orc, &format!("a{i}"), "a", 8);
    }
    submit(&mut orc, "b0", "b", 8);

    orc.run_cycle(t0()).unwrap();
    let after_first = orc.snapshot();

    for i in 1..4 {
        let report = orc.run_cycle(t0() + Duration::seconds(30 * i)).unwrap();
        assert_eq!(report.jobs_scheduled, 0);
    }
    assert_eq!(orc.snapshot().jobs, after_first.jobs);
}
