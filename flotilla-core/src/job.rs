//! Job model: the unit of schedulable work.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::Specialization;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl JobPriority {
    /// Rank used by the priority engine; higher schedules first.
    pub fn class_rank(self) -> u8 {
        match self {
            JobPriority::Critical => 4,
            JobPriority::High => 3,
            JobPriority::Medium => 2,
            JobPriority::Low => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed)
    }
}

/// Subset of the capability vector a job asks for. Zero means "don't care".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Requirements {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub gpu_count: u32,
    pub storage_gb: u32,
    #[serde(default)]
    pub specializations: BTreeSet<Specialization>,
}

impl Requirements {
    pub fn with_specialization(mut self, spec: Specialization) -> Self {
        self.specializations.insert(spec);
        self
    }
}

/// A unit of work submitted by a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    /// Free-form workload class ("render", "sim", ...). Keys the per-node
    /// performance history.
    pub kind: String,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub deadline: DateTime<Utc>,
    pub estimated_duration_hours: f64,
    /// 0..=100.
    pub progress: f64,
    pub requirements: Requirements,
    /// Jobs that must be completed before this one may run.
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub supports_progressive_output: bool,
    pub assigned_node_id: Option<String>,
    pub error_count: u32,
    pub submission_time: DateTime<Utc>,
    pub last_checkpoint_time: Option<DateTime<Utc>>,
    /// Checkpoint the next launch should resume from, set by recovery.
    pub restore_checkpoint_id: Option<String>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        deadline: DateTime<Utc>,
        submission_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            kind: "batch".to_string(),
            priority: JobPriority::Medium,
            status: JobStatus::Pending,
            deadline,
            estimated_duration_hours: 1.0,
            progress: 0.0,
            requirements: Requirements::default(),
            dependencies: Vec::new(),
            supports_progressive_output: false,
            assigned_node_id: None,
            error_count: 0,
            submission_time,
            last_checkpoint_time: None,
            restore_checkpoint_id: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_duration_hours(mut self, hours: f64) -> Self {
        self.estimated_duration_hours = hours;
        self
    }

    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_progressive_output(mut self) -> Self {
        self.supports_progressive_output = true;
        self
    }

    /// Hours of estimated work left given current progress.
    pub fn remaining_hours(&self) -> f64 {
        self.estimated_duration_hours * (1.0 - self.progress / 100.0)
    }

    /// Slack between finishing now at the estimated rate and the deadline.
    /// Negative when the job is predicted to miss it.
    pub fn slack_hours(&self, now: DateTime<Utc>) -> f64 {
        let until_deadline = (self.deadline - now).num_seconds() as f64 / 3600.0;
        until_deadline - self.remaining_hours()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("job id must be non-empty".to_string());
        }
        if self.tenant_id.trim().is_empty() {
            return Err("job tenant_id must be non-empty".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("job name must be non-empty".to_string());
        }
        if self.kind.trim().is_empty() {
            return Err("job kind must be non-empty".to_string());
        }
        if self.estimated_duration_hours <= 0.0 {
            return Err(format!(
                "estimated_duration_hours must be positive, got {}",
                self.estimated_duration_hours
            ));
        }
        if !(0.0..=100.0).contains(&self.progress) {
            return Err(format!("progress must be within 0..=100, got {}", self.progress));
        }
        if self.dependencies.iter().any(|d| d == &self.id) {
            return Err("job cannot depend on itself".to_string());
        }
        Ok(())
    }
}
