//! Priority engine: deadline-driven effective priority.
//!
//! Effective priority is a `(class_rank, urgency)` tuple. Urgency is the
//! ratio of estimated work to the time left before the deadline; once it
//! reaches 1 the job can no longer make its deadline unless it runs now, so
//! it is promoted to the top class. Overdue jobs get infinite urgency.
//! The ordering is total and deterministic: ties break by earlier submission
//! time, then lexicographic job id.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::job::Job;

const EPSILON_HOURS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectivePriority {
    pub class_rank: u8,
    pub urgency: f64,
}

impl EffectivePriority {
    pub fn compute(job: &Job, now: DateTime<Utc>) -> Self {
        let slack_hours = (job.deadline - now).num_seconds() as f64 / 3600.0;
        if slack_hours <= 0.0 {
            return Self { class_rank: 4, urgency: f64::INFINITY };
        }
        let urgency =
            (job.estimated_duration_hours / slack_hours.max(EPSILON_HOURS)).max(0.0);
        let class_rank =
            if urgency >= 1.0 { 4 } else { job.priority.class_rank() };
        Self { class_rank, urgency }
    }

    fn cmp_desc(&self, other: &Self) -> Ordering {
        other
            .class_rank
            .cmp(&self.class_rank)
            .then_with(|| other.urgency.partial_cmp(&self.urgency).unwrap_or(Ordering::Equal))
    }
}

/// One ranked entry; the ordering key is carried so callers can report it.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedJob {
    pub job_id: String,
    pub priority: EffectivePriority,
}

/// Produce the scheduling order for a set of jobs. Pure: the only output is
/// the returned ordering.
pub fn rank_jobs(jobs: &[&Job], now: DateTime<Utc>) -> Vec<RankedJob> {
    let mut ranked: Vec<(&Job, EffectivePriority)> =
        jobs.iter().map(|j| (*j, EffectivePriority::compute(j, now))).collect();

    ranked.sort_by(|(a, pa), (b, pb)| {
        pa.cmp_desc(pb)
            .then_with(|| a.submission_time.cmp(&b.submission_time))
            .then_with(|| a.id.cmp(&b.id))
    });

    ranked
        .into_iter()
        .map(|(job, priority)| RankedJob { job_id: job.id.clone(), priority })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobPriority;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn job(id: &str, priority: JobPriority, deadline_in: Duration, duration_hours: f64) -> Job {
        Job::new(id, "acme", id, t0() + deadline_in, t0())
            .with_priority(priority)
            .with_duration_hours(duration_hours)
    }

    #[test]
    fn class_rank_dominates_urgency() {
        let critical = job("crit", JobPriority::Critical, Duration::hours(100), 1.0);
        let low = job("low", JobPriority::Low, Duration::hours(2), 1.9);
        let order = rank_jobs(&[&low, &critical], t0());
        assert_eq!(order[0].job_id, "crit");
    }

    #[test]
    fn deadline_pressure_overrides_class() {
        // 10 minutes of work, 5 minutes of slack: cannot make the deadline
        // unless it runs now, so the low job is promoted past the critical
        // one that has two hours to spare.
        let j1 = job("j1", JobPriority::Low, Duration::minutes(5), 10.0 / 60.0);
        let j2 = job("j2", JobPriority::Critical, Duration::hours(2), 0.5);
        let order = rank_jobs(&[&j2, &j1], t0());
        assert_eq!(order[0].job_id, "j1");
        assert_eq!(order[0].priority.class_rank, 4);

        // Past the deadline the promotion holds with infinite urgency.
        let order = rank_jobs(&[&j2, &j1], t0() + Duration::minutes(6));
        assert_eq!(order[0].job_id, "j1");
        assert!(order[0].priority.urgency.is_infinite());
    }

    #[test]
    fn urgency_orders_within_a_class() {
        let relaxed = job("relaxed", JobPriority::Medium, Duration::hours(10), 1.0);
        let tight = job("tight", JobPriority::Medium, Duration::hours(2), 1.0);
        let order = rank_jobs(&[&relaxed, &tight], t0());
        assert_eq!(order[0].job_id, "tight");
    }

    #[test]
    fn ties_break_by_submission_then_id() {
        let mut a = job("b-later-id", JobPriority::Medium, Duration::hours(4), 1.0);
        let mut b = job("a-early-id", JobPriority::Medium, Duration::hours(4), 1.0);
        a.submission_time = t0() - Duration::minutes(10);
        b.submission_time = t0();
        let order = rank_jobs(&[&b, &a], t0());
        assert_eq!(order[0].job_id, "b-later-id");

        b.submission_time = a.submission_time;
        let order = rank_jobs(&[&b, &a], t0());
        assert_eq!(order[0].job_id, "a-early-id");
    }

    #[test]
    fn ordering_is_stable_across_input_permutations() {
        let j1 = job("j1", JobPriority::High, Duration::hours(3), 2.0);
        let j2 = job("j2", JobPriority::Medium, Duration::hours(1), 0.5);
        let j3 = job("j3", JobPriority::High, Duration::hours(1), 2.0);

        let a: Vec<_> = rank_jobs(&[&j1, &j2, &j3], t0()).into_iter().map(|r| r.job_id).collect();
        let b: Vec<_> = rank_jobs(&[&j3, &j1, &j2], t0()).into_iter().map(|r| r.job_id).collect();
        assert_eq!(a, b);
    }
}
