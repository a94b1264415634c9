//! Node agent contracts: the commands the core issues to node-side agents
//! and the events it receives back.
//!
//! Agents are out-of-process and out of scope; the core only sees this
//! trait and the inbound event stream (parsed by `flotilla-telemetry`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Job;
use crate::node::{Capabilities, NodeStatus};

/// Context handed to an agent when a job launches.
#[derive(Debug, Clone, PartialEq)]
pub struct StartContext {
    pub node_id: String,
    /// Storage handle of the checkpoint to resume from, when recovering.
    pub restore_from: Option<String>,
}

/// Command surface toward a node-side agent. Implementations talk to real
/// workers; `NoopAgent` accepts everything and is the default for tests and
/// dry runs.
pub trait NodeAgent: Send {
    fn start(&mut self, job: &Job, ctx: &StartContext) -> Result<(), String>;
    fn stop(&mut self, job_id: &str) -> Result<(), String>;
    fn checkpoint(&mut self, job_id: &str) -> Result<(), String>;
    fn restore_from(&mut self, job_id: &str, storage_handle: &str) -> Result<(), String>;
}

pub struct NoopAgent;

impl NodeAgent for NoopAgent {
    fn start(&mut self, _job: &Job, _ctx: &StartContext) -> Result<(), String> {
        Ok(())
    }

    fn stop(&mut self, _job_id: &str) -> Result<(), String> {
        Ok(())
    }

    fn checkpoint(&mut self, _job_id: &str) -> Result<(), String> {
        Ok(())
    }

    fn restore_from(&mut self, _job_id: &str, _storage_handle: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Inbound telemetry from node agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Heartbeat {
        node_id: String,
        status: NodeStatus,
        /// Present when the node re-advertises hardware (e.g. after a
        /// maintenance window).
        #[serde(default)]
        capabilities: Option<Capabilities>,
        at: DateTime<Utc>,
    },
    Progress {
        job_id: String,
        pct: f64,
        at: DateTime<Utc>,
    },
    StageCompleted {
        job_id: String,
        stage: String,
        at: DateTime<Utc>,
    },
    Failed {
        #[serde(default)]
        node_id: Option<String>,
        #[serde(default)]
        job_id: Option<String>,
        reason: String,
        at: DateTime<Utc>,
    },
    /// Acknowledgement that a checkpoint capture finished and is durable.
    CheckpointCaptured {
        job_id: String,
        size_bytes: u64,
        storage_handle: String,
        at: DateTime<Utc>,
    },
    /// Acknowledgement that a stop directive took effect.
    Stopped {
        job_id: String,
        at: DateTime<Utc>,
    },
}

impl AgentEvent {
    /// Minimal invariants for safe downstream processing.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            AgentEvent::Heartbeat { node_id, .. } => {
                if node_id.trim().is_empty() {
                    return Err("heartbeat node_id must be non-empty".to_string());
                }
            }
            AgentEvent::Progress { job_id, pct, .. } => {
                if job_id.trim().is_empty() {
                    return Err("progress job_id must be non-empty".to_string());
                }
                if !(0.0..=100.0).contains(pct) {
                    return Err(format!("progress pct must be within 0..=100, got {pct}"));
                }
            }
            AgentEvent::StageCompleted { job_id, stage, .. } => {
                if job_id.trim().is_empty() || stage.trim().is_empty() {
                    return Err("stage completion needs job_id and stage".to_string());
                }
            }
            AgentEvent::Failed { node_id, job_id, reason, .. } => {
                if node_id.is_none() && job_id.is_none() {
                    return Err("failure event needs a node_id or a job_id".to_string());
                }
                if reason.trim().is_empty() {
                    return Err("failure reason must be non-empty".to_string());
                }
            }
            AgentEvent::CheckpointCaptured { job_id, storage_handle, .. } => {
                if job_id.trim().is_empty() || storage_handle.trim().is_empty() {
                    return Err("checkpoint ack needs job_id and storage_handle".to_string());
                }
            }
            AgentEvent::Stopped { job_id, .. } => {
                if job_id.trim().is_empty() {
                    return Err("stop ack job_id must be non-empty".to_string());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn event_json_uses_snake_case_tags() {
        let ev = AgentEvent::StageCompleted {
            job_id: "j1".to_string(),
            stage: "geometry".to_string(),
            at: ts(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"event\":\"stage_completed\""));
        let back: AgentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn progress_out_of_range_fails_validation() {
        let ev = AgentEvent::Progress { job_id: "j1".to_string(), pct: 140.0, at: ts() };
        assert!(ev.validate().is_err());
    }

    #[test]
    fn failure_needs_a_subject() {
        let ev = AgentEvent::Failed { node_id: None, job_id: None, reason: "oom".to_string(), at: ts() };
        assert!(ev.validate().is_err());

        let ev = AgentEvent::Failed {
            node_id: None,
            job_id: Some("j1".to_string()),
            reason: "oom".to_string(),
            at: ts(),
        };
        ev.validate().unwrap();
    }
}
