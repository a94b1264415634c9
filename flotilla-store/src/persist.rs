//! Serialize orchestrator state through a `Store`.
//!
//! Entities are saved one record per id in their namespace; audit events use
//! zero-padded sequence keys so the append-only log lists in order.

use flotilla_core::audit::AuditEvent;
use flotilla_core::registry::Snapshot;
use flotilla_core::{Checkpoint, Job, Node, Tenant};

use crate::{namespace, Store, StoreError};

fn corrupt(namespace: &str, id: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        namespace: namespace.to_string(),
        id: id.to_string(),
        reason: err.to_string(),
    }
}

/// Write every entity in the snapshot. Records for deleted entities are not
/// cleaned up here; the registry never deletes, so ids only accumulate.
pub fn save_snapshot(store: &mut dyn Store, snapshot: &Snapshot) -> Result<(), StoreError> {
    for (id, tenant) in &snapshot.tenants {
        let bytes = serde_json::to_vec(tenant).map_err(|e| corrupt(namespace::TENANTS, id, e))?;
        store.put(namespace::TENANTS, id, &bytes)?;
    }
    for (id, node) in &snapshot.nodes {
        let bytes = serde_json::to_vec(node).map_err(|e| corrupt(namespace::NODES, id, e))?;
        store.put(namespace::NODES, id, &bytes)?;
    }
    for (id, job) in &snapshot.jobs {
        let bytes = serde_json::to_vec(job).map_err(|e| corrupt(namespace::JOBS, id, e))?;
        store.put(namespace::JOBS, id, &bytes)?;
    }
    Ok(())
}

pub fn load_tenants(store: &dyn Store) -> Result<Vec<Tenant>, StoreError> {
    load_all(store, namespace::TENANTS)
}

pub fn load_nodes(store: &dyn Store) -> Result<Vec<Node>, StoreError> {
    load_all(store, namespace::NODES)
}

pub fn load_jobs(store: &dyn Store) -> Result<Vec<Job>, StoreError> {
    load_all(store, namespace::JOBS)
}

fn load_all<T: serde::de::DeserializeOwned>(
    store: &dyn Store,
    ns: &str,
) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    for id in store.list(ns)? {
        let bytes = store.get(ns, &id)?;
        out.push(serde_json::from_slice(&bytes).map_err(|e| corrupt(ns, &id, e))?);
    }
    Ok(out)
}

pub fn save_checkpoints(
    store: &mut dyn Store,
    checkpoints: &[Checkpoint],
) -> Result<(), StoreError> {
    for checkpoint in checkpoints {
        let bytes = serde_json::to_vec(checkpoint)
            .map_err(|e| corrupt(namespace::CHECKPOINTS, &checkpoint.id, e))?;
        store.put(namespace::CHECKPOINTS, &checkpoint.id, &bytes)?;
    }
    Ok(())
}

pub fn load_checkpoints(store: &dyn Store) -> Result<Vec<Checkpoint>, StoreError> {
    load_all(store, namespace::CHECKPOINTS)
}

/// Append audit events newer than what the store already holds.
pub fn append_audit(store: &mut dyn Store, events: &[AuditEvent]) -> Result<(), StoreError> {
    let existing = store.list(namespace::AUDIT)?;
    let last_seq: u64 = existing
        .last()
        .and_then(|id| id.parse().ok())
        .unwrap_or(0);
    for event in events.iter().filter(|e| e.seq > last_seq) {
        let key = audit_key(event.seq);
        let bytes =
            serde_json::to_vec(event).map_err(|e| corrupt(namespace::AUDIT, &key, e))?;
        store.put(namespace::AUDIT, &key, &bytes)?;
    }
    Ok(())
}

pub fn load_audit(store: &dyn Store) -> Result<Vec<AuditEvent>, StoreError> {
    load_all(store, namespace::AUDIT)
}

pub fn audit_key(seq: u64) -> String {
    format!("{seq:020}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use chrono::TimeZone;
    use flotilla_core::registry::Registry;

    fn t0() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn snapshot_round_trips_through_a_store() {
        let mut reg = Registry::new();
        reg.add_tenant(Tenant::new("acme", "Acme").with_shares(40.0, 80.0)).unwrap();
        reg.add_node(Node::new("n1", "rack1-01")).unwrap();
        reg.add_job(Job::new("j1", "acme", "teapot", t0() + chrono::Duration::hours(4), t0()))
            .unwrap();
        let snapshot = reg.snapshot();

        let mut store = MemoryStore::new();
        save_snapshot(&mut store, &snapshot).unwrap();

        let rebuilt = Registry::from_entities(
            load_tenants(&store).unwrap(),
            load_nodes(&store).unwrap(),
            load_jobs(&store).unwrap(),
        )
        .unwrap();
        assert_eq!(rebuilt.snapshot(), snapshot);
    }

    #[test]
    fn checkpoints_round_trip() {
        let mut store = MemoryStore::new();
        let ckpt = Checkpoint {
            id: "ckpt-000007".to_string(),
            job_id: "j1".to_string(),
            created_at: t0(),
            kind: flotilla_core::CheckpointKind::Periodic,
            size_bytes: 2048,
            storage_handle: "store://ckpt/j1/7".to_string(),
            durable: true,
            progress: 40.0,
        };
        save_checkpoints(&mut store, &[ckpt.clone()]).unwrap();
        assert_eq!(load_checkpoints(&store).unwrap(), vec![ckpt]);
    }

    #[test]
    fn audit_appends_only_new_events() {
        let mut store = MemoryStore::new();
        let mut recorder = flotilla_core::AuditRecorder::new();
        recorder.record(t0(), "job_submitted", "test", vec![], serde_json::json!({}), vec![]);
        recorder.record(t0(), "job_scheduled", "test", vec![], serde_json::json!({}), vec![]);

        append_audit(&mut store, recorder.events()).unwrap();
        assert_eq!(store.list(namespace::AUDIT).unwrap().len(), 2);

        // Appending the same log again writes nothing new.
        append_audit(&mut store, recorder.events()).unwrap();
        assert_eq!(store.list(namespace::AUDIT).unwrap().len(), 2);

        recorder.record(t0(), "job_completed", "test", vec![], serde_json::json!({}), vec![]);
        append_audit(&mut store, recorder.events()).unwrap();
        let keys = store.list(namespace::AUDIT).unwrap();
        assert_eq!(keys.len(), 3);
        // Keys sort chronologically.
        assert!(keys.windows(2).all(|w| w[0] < w[1]));

        let events = load_audit(&store).unwrap();
        assert_eq!(events.last().unwrap().kind, "job_completed");
    }
}
