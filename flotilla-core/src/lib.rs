//! flotilla-core: multi-tenant workload orchestration for a shared compute
//! fleet.
//!
//! One authoritative registry, a deadline-driven priority engine, SLA-aware
//! capacity partitioning with borrow/lend accounting, specialization-scored
//! matching, energy-aware substitution, progressive checkpointing, failure
//! recovery, and an append-only audit trail. The scheduling loop is
//! single-writer: plans are computed on immutable snapshots and committed
//! through the registry.

pub mod agent;
pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod energy;
pub mod error;
pub mod failure;
pub mod job;
pub mod matcher;
pub mod metrics;
pub mod node;
pub mod orchestrator;
pub mod partition;
pub mod priority;
pub mod registry;
pub mod scheduler;
pub mod tenant;
pub mod time;

pub use agent::{AgentEvent, NodeAgent, NoopAgent, StartContext};
pub use audit::{AuditEvent, AuditFilter, AuditRecorder, AuditSink, NoopSink, TracingSink};
pub use checkpoint::{Checkpoint, CheckpointCoordinator, CheckpointKind, ResilienceLevel};
pub use config::OrchestratorConfig;
pub use energy::{EnergyMode, EnergyOptimizer, EnergyOutcome};
pub use error::{CommandResult, ErrorKind, OrchestratorError};
pub use failure::{
    FailureEvent,
    FailureKind,
    FailureManager,
    FailureSeverity,
    PlanState,
    RecoveryAction,
    RecoveryPlan,
};
pub use job::{Job, JobPriority, JobStatus, Requirements};
pub use matcher::{MatchWeights, RunMetrics, SpecializationMatcher};
pub use metrics::FleetMetrics;
pub use node::{Capabilities, Node, NodeStatus, PerfStats, Specialization};
pub use orchestrator::{FleetStatusView, JobStatusView, Orchestrator};
pub use partition::{Allocation, PartitionOutcome};
pub use priority::{EffectivePriority, RankedJob};
pub use registry::{Registry, RegistryError, Snapshot};
pub use scheduler::{Assignment, CyclePlan, CycleReport};
pub use tenant::{SlaTier, Tenant};
pub use time::parse_deadline;
