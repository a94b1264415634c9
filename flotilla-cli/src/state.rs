//! Orchestrator state persistence between CLI invocations.
//!
//! Entities and the audit log go through the file store under the data
//! directory; runtime knobs flipped at the CLI (energy mode, resilience
//! level) live in a small sidecar file so they survive restarts too.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use flotilla_core::audit::NoopSink;
use flotilla_core::registry::Registry;
use flotilla_core::{
    AuditRecorder, EnergyMode, Orchestrator, OrchestratorConfig, ResilienceLevel,
};
use flotilla_store::{persist, with_retry, FileStore};
use serde::{Deserialize, Serialize};

const RUNTIME_FILE: &str = "runtime.json";
const IO_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RuntimeState {
    energy_mode: Option<EnergyMode>,
    resilience_level: Option<ResilienceLevel>,
}

pub fn load(data_dir: &Path, config: OrchestratorConfig) -> Result<Orchestrator> {
    let store = FileStore::open(data_dir)
        .with_context(|| format!("opening state dir {}", data_dir.display()))?;

    let tenants = persist::load_tenants(&store)?;
    let nodes = persist::load_nodes(&store)?;
    let jobs = persist::load_jobs(&store)?;
    let registry = Registry::from_entities(tenants, nodes, jobs)
        .map_err(|e| anyhow::anyhow!("persisted state is inconsistent: {e}"))?;

    let audit_events = persist::load_audit(&store)?;
    let audit = AuditRecorder::resume_from(audit_events, Box::new(NoopSink));

    let mut orchestrator = Orchestrator::with_parts(
        config,
        registry,
        audit,
        Box::new(flotilla_core::NoopAgent),
    );
    orchestrator.restore_checkpoints(persist::load_checkpoints(&store)?);

    let runtime = read_runtime(data_dir)?;
    let now = Utc::now();
    if let Some(mode) = runtime.energy_mode {
        orchestrator.set_energy_mode(mode, now);
    }
    if let Some(level) = runtime.resilience_level {
        orchestrator.set_resilience_level(level, now);
    }
    Ok(orchestrator)
}

pub fn save(data_dir: &Path, orchestrator: &Orchestrator) -> Result<()> {
    let mut store = FileStore::open(data_dir)?;
    let snapshot = orchestrator.snapshot();
    with_retry(IO_ATTEMPTS, || persist::save_snapshot(&mut store, &snapshot))
        .context("saving entities")?;
    with_retry(IO_ATTEMPTS, || persist::append_audit(&mut store, orchestrator.audit_events()))
        .context("saving audit log")?;
    let checkpoints = orchestrator.checkpoint_inventory();
    with_retry(IO_ATTEMPTS, || persist::save_checkpoints(&mut store, &checkpoints))
        .context("saving checkpoint metadata")?;

    let runtime = RuntimeState {
        energy_mode: Some(orchestrator.energy_mode()),
        resilience_level: Some(orchestrator.fleet_status().resilience_level),
    };
    let raw = serde_json::to_vec_pretty(&runtime)?;
    std::fs::write(data_dir.join(RUNTIME_FILE), raw)?;
    Ok(())
}

fn read_runtime(data_dir: &Path) -> Result<RuntimeState> {
    let path = data_dir.join(RUNTIME_FILE);
    if !path.exists() {
        return Ok(RuntimeState::default());
    }
    let raw = std::fs::read(&path)?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
}
