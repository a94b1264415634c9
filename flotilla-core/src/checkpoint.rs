//! Checkpoint coordinator: progressive snapshots for long jobs.
//!
//! Cadence comes from the resilience level (with per-level config
//! overrides). Due captures sit in a min-heap keyed by due time; captures
//! for the same job are strictly serialized, and an older checkpoint is only
//! pruned once a newer one is durable.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::NodeAgent;
use crate::job::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResilienceLevel {
    Minimal,
    #[default]
    Standard,
    High,
    Maximum,
}

impl ResilienceLevel {
    pub fn interval_minutes(self) -> i64 {
        match self {
            ResilienceLevel::Minimal => 120,
            ResilienceLevel::Standard => 60,
            ResilienceLevel::High => 30,
            ResilienceLevel::Maximum => 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Periodic,
    StageComplete,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub kind: CheckpointKind,
    pub size_bytes: u64,
    pub storage_handle: String,
    pub durable: bool,
    /// Progress the job had when this snapshot was taken.
    pub progress: f64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct DueEntry {
    due: DateTime<Utc>,
    job_id: String,
}

impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest due time pops
        // first, job id as tie-break.
        other.due.cmp(&self.due).then_with(|| other.job_id.cmp(&self.job_id))
    }
}

#[derive(Debug)]
pub struct CheckpointCoordinator {
    level: ResilienceLevel,
    overrides: BTreeMap<ResilienceLevel, i64>,
    queue: BinaryHeap<DueEntry>,
    /// Jobs with an outstanding capture directive and when it was issued.
    in_flight: BTreeMap<String, DateTime<Utc>>,
    history: BTreeMap<String, Vec<Checkpoint>>,
    next_id: u64,
    capture_timeout: Duration,
}

impl CheckpointCoordinator {
    pub fn new(level: ResilienceLevel, overrides: BTreeMap<ResilienceLevel, i64>) -> Self {
        Self {
            level,
            overrides,
            queue: BinaryHeap::new(),
            in_flight: BTreeMap::new(),
            history: BTreeMap::new(),
            next_id: 1,
            capture_timeout: Duration::minutes(10),
        }
    }

    pub fn level(&self) -> ResilienceLevel {
        self.level
    }

    pub fn set_level(&mut self, level: ResilienceLevel) {
        self.level = level;
    }

    pub fn interval(&self) -> Duration {
        let minutes =
            self.overrides.get(&self.level).copied().unwrap_or(self.level.interval_minutes());
        Duration::minutes(minutes)
    }

    /// Whether `job` is due for a snapshot: interval elapsed since the last
    /// one (or since submission), a stage just finished, or the job emits
    /// progressive output under maximum resilience.
    pub fn should_checkpoint(&self, job: &Job, now: DateTime<Utc>, stage_completed: bool) -> bool {
        if stage_completed {
            return true;
        }
        let anchor = job.last_checkpoint_time.unwrap_or(job.submission_time);
        if now - anchor >= self.interval() {
            return true;
        }
        self.level == ResilienceLevel::Maximum && job.supports_progressive_output
    }

    pub fn schedule_checkpoint(&mut self, job_id: &str, at: DateTime<Utc>) {
        self.queue.push(DueEntry { due: at, job_id: job_id.to_string() });
    }

    pub fn scheduled_count(&self) -> usize {
        self.queue.len()
    }

    /// Pop every due entry and issue capture directives. A job with a
    /// capture already in flight is skipped and re-queued one interval out,
    /// keeping directives per job strictly serialized.
    pub fn process_due(
        &mut self,
        now: DateTime<Utc>,
        jobs: &BTreeMap<String, Job>,
        agent: &mut dyn NodeAgent,
    ) -> Vec<String> {
        let mut issued = Vec::new();
        while let Some(entry) = self.queue.peek() {
            if entry.due > now {
                break;
            }
            let entry = self.queue.pop().expect("peeked entry");

            // The job may have finished or been cancelled since scheduling.
            let Some(job) = jobs.get(&entry.job_id) else { continue };
            if job.status.is_terminal() {
                continue;
            }
            if self.in_flight.contains_key(&entry.job_id) {
                let next = now + self.interval();
                self.schedule_checkpoint(&entry.job_id, next);
                continue;
            }
            if agent.checkpoint(&entry.job_id).is_ok() {
                self.in_flight.insert(entry.job_id.clone(), now);
                issued.push(entry.job_id);
            }
        }
        issued
    }

    /// A capture directive was acknowledged durable by the node agent.
    /// Records the checkpoint, prunes history, and returns it.
    ///
    /// Created-at must move forward per job; a stale acknowledgement is
    /// rejected so checkpoint history stays monotonic.
    pub fn complete_capture(
        &mut self,
        job_id: &str,
        created_at: DateTime<Utc>,
        kind: CheckpointKind,
        size_bytes: u64,
        storage_handle: &str,
        progress: f64,
    ) -> Result<Checkpoint, String> {
        let history = self.history.entry(job_id.to_string()).or_default();
        if let Some(last) = history.last() {
            if created_at <= last.created_at {
                return Err(format!(
                    "checkpoint for {job_id} at {created_at} is not newer than {}",
                    last.created_at
                ));
            }
        }

        let checkpoint = Checkpoint {
            id: format!("ckpt-{:06}", self.next_id),
            job_id: job_id.to_string(),
            created_at,
            kind,
            size_bytes,
            storage_handle: storage_handle.to_string(),
            durable: true,
            progress,
        };
        self.next_id += 1;
        self.in_flight.remove(job_id);
        history.push(checkpoint.clone());

        // Retain the newest durable checkpoint plus the one before it.
        let durable_ids: Vec<String> = history
            .iter()
            .filter(|c| c.durable)
            .rev()
            .take(2)
            .map(|c| c.id.clone())
            .collect();
        history.retain(|c| !c.durable || durable_ids.contains(&c.id));

        Ok(checkpoint)
    }

    /// Directives outstanding longer than the capture timeout. Callers turn
    /// these into stage failures on the directive, not on the job.
    pub fn expired_captures(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = self.capture_timeout;
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, issued)| now - **issued > timeout)
            .map(|(job_id, _)| job_id.clone())
            .collect();
        for job_id in &expired {
            self.in_flight.remove(job_id);
        }
        expired
    }

    pub fn latest_durable(&self, job_id: &str) -> Option<&Checkpoint> {
        self.history.get(job_id)?.iter().rev().find(|c| c.durable)
    }

    pub fn checkpoints_for(&self, job_id: &str) -> &[Checkpoint] {
        self.history.get(job_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn find(&self, checkpoint_id: &str) -> Option<&Checkpoint> {
        self.history.values().flatten().find(|c| c.id == checkpoint_id)
    }

    /// Drop history for a finished job, keeping nothing.
    pub fn forget_job(&mut self, job_id: &str) {
        self.history.remove(job_id);
        self.in_flight.remove(job_id);
    }

    /// Every retained checkpoint, for persistence.
    pub fn all(&self) -> impl Iterator<Item = &Checkpoint> {
        self.history.values().flatten()
    }

    /// Reload persisted checkpoint metadata (restart path). Id numbering
    /// continues past the highest restored id.
    pub fn restore(&mut self, checkpoints: Vec<Checkpoint>) {
        for checkpoint in checkpoints {
            if let Some(n) = checkpoint
                .id
                .strip_prefix("ckpt-")
                .and_then(|s| s.parse::<u64>().ok())
            {
                self.next_id = self.next_id.max(n + 1);
            }
            self.history.entry(checkpoint.job_id.clone()).or_default().push(checkpoint);
        }
        for history in self.history.values_mut() {
            history.sort_by_key(|c| c.created_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NoopAgent;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn job(id: &str) -> Job {
        Job::new(id, "acme", id, t0() + Duration::hours(24), t0()).with_duration_hours(12.0)
    }

    fn jobs(ids: &[&str]) -> BTreeMap<String, Job> {
        ids.iter().map(|id| (id.to_string(), job(id))).collect()
    }

    fn coordinator(level: ResilienceLevel) -> CheckpointCoordinator {
        CheckpointCoordinator::new(level, BTreeMap::new())
    }

    #[test]
    fn interval_table_matches_levels() {
        assert_eq!(ResilienceLevel::Minimal.interval_minutes(), 120);
        assert_eq!(ResilienceLevel::Standard.interval_minutes(), 60);
        assert_eq!(ResilienceLevel::High.interval_minutes(), 30);
        assert_eq!(ResilienceLevel::Maximum.interval_minutes(), 15);
    }

    #[test]
    fn overrides_replace_the_default_interval() {
        let mut overrides = BTreeMap::new();
        overrides.insert(ResilienceLevel::Standard, 20);
        let c = CheckpointCoordinator::new(ResilienceLevel::Standard, overrides);
        assert_eq!(c.interval(), Duration::minutes(20));
    }

    #[test]
    fn should_checkpoint_on_interval_or_stage() {
        let c = coordinator(ResilienceLevel::Standard);
        let mut j = job("j1");

        // Fresh job, nothing elapsed.
        assert!(!c.should_checkpoint(&j, t0() + Duration::minutes(10), false));
        // Interval elapsed since submission.
        assert!(c.should_checkpoint(&j, t0() + Duration::minutes(61), false));
        // Stage completion always wins.
        assert!(c.should_checkpoint(&j, t0() + Duration::minutes(1), true));

        j.last_checkpoint_time = Some(t0() + Duration::minutes(50));
        assert!(!c.should_checkpoint(&j, t0() + Duration::minutes(61), false));
    }

    #[test]
    fn maximum_level_checkpoints_progressive_jobs_eagerly() {
        let c = coordinator(ResilienceLevel::Maximum);
        let j = job("j1").with_progressive_output();
        assert!(c.should_checkpoint(&j, t0() + Duration::minutes(1), false));
    }

    #[test]
    fn process_due_pops_in_due_order_and_serializes_per_job() {
        let mut c = coordinator(ResilienceLevel::Standard);
        let mut agent = NoopAgent;
        let jobs = jobs(&["j1", "j2"]);

        c.schedule_checkpoint("j2", t0() + Duration::minutes(5));
        c.schedule_checkpoint("j1", t0() + Duration::minutes(1));
        c.schedule_checkpoint("j1", t0() + Duration::minutes(3));

        let issued = c.process_due(t0() + Duration::minutes(10), &jobs, &mut agent);
        // j1 first (due earlier); its second due entry is skipped because a
        // capture is already in flight.
        assert_eq!(issued, vec!["j1".to_string(), "j2".to_string()]);
        // The skipped entry was pushed out one interval.
        assert_eq!(c.scheduled_count(), 1);
    }

    #[test]
    fn complete_capture_prunes_to_last_two_durable() {
        let mut c = coordinator(ResilienceLevel::Standard);
        for i in 1..=4 {
            c.complete_capture(
                "j1",
                t0() + Duration::minutes(i * 10),
                CheckpointKind::Periodic,
                1024,
                &format!("store://ckpt/{i}"),
                (i * 20) as f64,
            )
            .unwrap();
        }
        let kept = c.checkpoints_for("j1");
        assert_eq!(kept.len(), 2);
        assert!(kept[0].created_at < kept[1].created_at);
        assert_eq!(c.latest_durable("j1").unwrap().progress, 80.0);
    }

    #[test]
    fn capture_timestamps_must_be_monotonic() {
        let mut c = coordinator(ResilienceLevel::Standard);
        c.complete_capture("j1", t0(), CheckpointKind::Periodic, 10, "s://1", 10.0).unwrap();
        let err =
            c.complete_capture("j1", t0(), CheckpointKind::Periodic, 10, "s://2", 20.0);
        assert!(err.is_err());
    }

    #[test]
    fn expired_captures_surface_once() {
        let mut c = coordinator(ResilienceLevel::Standard);
        let mut agent = NoopAgent;
        let jobs = jobs(&["j1"]);
        c.schedule_checkpoint("j1", t0());
        c.process_due(t0(), &jobs, &mut agent);

        assert!(c.expired_captures(t0() + Duration::minutes(5)).is_empty());
        let expired = c.expired_captures(t0() + Duration::minutes(11));
        assert_eq!(expired, vec!["j1".to_string()]);
        // Cleared after reporting.
        assert!(c.expired_captures(t0() + Duration::minutes(12)).is_empty());
    }

    #[test]
    fn terminal_jobs_are_skipped() {
        let mut c = coordinator(ResilienceLevel::Standard);
        let mut agent = NoopAgent;
        let mut map = jobs(&["j1"]);
        map.get_mut("j1").unwrap().status = crate::job::JobStatus::Completed;
        c.schedule_checkpoint("j1", t0());
        let issued = c.process_due(t0() + Duration::minutes(1), &map, &mut agent);
        assert!(issued.is_empty());
    }
}
