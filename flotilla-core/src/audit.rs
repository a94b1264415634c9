//! Append-only audit recorder with causal links.
//!
//! Every externally visible decision produces an event with a globally
//! monotonic sequence number. Sinks observe events through an explicit
//! observer trait; the default sink does nothing, so recording never blocks
//! the scheduling path beyond the sink's own append.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known event kinds. The recorder accepts any string so adapters can
/// extend the vocabulary without touching the core.
pub mod kinds {
    pub const TENANT_ADDED: &str = "tenant_added";
    pub const NODE_ADDED: &str = "node_added";
    pub const NODE_STATUS_CHANGED: &str = "node_status_changed";
    pub const JOB_SUBMITTED: &str = "job_submitted";
    pub const JOB_SCHEDULED: &str = "job_scheduled";
    pub const JOB_COMPLETED: &str = "job_completed";
    pub const JOB_CANCELLED: &str = "job_cancelled";
    pub const JOB_INTERRUPTED: &str = "job_interrupted";
    pub const JOB_PROGRESS: &str = "job_progress";
    pub const JOB_PRIORITY_CHANGED: &str = "job_priority_changed";
    pub const ALLOCATION_COMPUTED: &str = "allocation_computed";
    pub const UNDER_CAPACITY: &str = "under_capacity";
    pub const DEFERRED_ENERGY: &str = "deferred_energy";
    pub const FAILURE_DETECTED: &str = "failure_detected";
    pub const RECOVERY_PLAN_CREATED: &str = "recovery_plan_created";
    pub const RECOVERY_COMPLETED: &str = "recovery_completed";
    pub const RECOVERY_ESCALATED: &str = "recovery_escalated";
    pub const CHECKPOINT_SCHEDULED: &str = "checkpoint_scheduled";
    pub const CHECKPOINT_CREATED: &str = "checkpoint_created";
    pub const CYCLE_COMPLETED: &str = "cycle_completed";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub actor: String,
    pub subject_refs: Vec<String>,
    pub payload: serde_json::Value,
    /// Sequence numbers of the events that caused this one.
    #[serde(default)]
    pub causes: Vec<u64>,
}

/// Observer interface for audit emission. Implementations must not panic;
/// a slow sink slows recording by exactly its append latency and nothing else.
pub trait AuditSink: Send {
    fn append(&mut self, event: &AuditEvent);
}

/// Default sink: drop everything.
pub struct NoopSink;

impl AuditSink for NoopSink {
    fn append(&mut self, _event: &AuditEvent) {}
}

/// Mirrors events onto the `tracing` subscriber at info level.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn append(&mut self, event: &AuditEvent) {
        tracing::info!(
            target: "flotilla::audit",
            seq = event.seq,
            kind = %event.kind,
            actor = %event.actor,
            subjects = ?event.subject_refs,
            "audit"
        );
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub kind: Option<String>,
    pub subject: Option<String>,
    pub since_seq: Option<u64>,
}

impl AuditFilter {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self { kind: Some(kind.into()), ..Self::default() }
    }

    pub fn subject(subject: impl Into<String>) -> Self {
        Self { subject: Some(subject.into()), ..Self::default() }
    }

    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(kind) = &self.kind {
            if &event.kind != kind {
                return false;
            }
        }
        if let Some(subject) = &self.subject {
            if !event.subject_refs.iter().any(|s| s == subject) {
                return false;
            }
        }
        if let Some(since) = self.since_seq {
            if event.seq <= since {
                return false;
            }
        }
        true
    }
}

/// Append-only recorder. Owns the in-memory log and assigns sequence numbers.
pub struct AuditRecorder {
    events: Vec<AuditEvent>,
    next_seq: u64,
    sink: Box<dyn AuditSink>,
}

impl Default for AuditRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditRecorder {
    pub fn new() -> Self {
        Self { events: Vec::new(), next_seq: 1, sink: Box::new(NoopSink) }
    }

    pub fn with_sink(sink: Box<dyn AuditSink>) -> Self {
        Self { events: Vec::new(), next_seq: 1, sink }
    }

    /// Resume sequence numbering after reloading persisted events.
    pub fn resume_from(events: Vec<AuditEvent>, sink: Box<dyn AuditSink>) -> Self {
        let next_seq = events.last().map(|e| e.seq + 1).unwrap_or(1);
        Self { events, next_seq, sink }
    }

    pub fn record(
        &mut self,
        ts: DateTime<Utc>,
        kind: &str,
        actor: &str,
        subject_refs: Vec<String>,
        payload: serde_json::Value,
        causes: Vec<u64>,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let event = AuditEvent {
            seq,
            ts,
            kind: kind.to_string(),
            actor: actor.to_string(),
            subject_refs,
            payload,
            causes,
        };
        self.sink.append(&event);
        self.events.push(event);
        seq
    }

    /// Lazy finite query over the in-memory log.
    pub fn query<'a>(&'a self, filter: AuditFilter) -> impl Iterator<Item = &'a AuditEvent> + 'a {
        self.events.iter().filter(move |e| filter.matches(e))
    }

    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }
}
