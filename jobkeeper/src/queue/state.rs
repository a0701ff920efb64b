use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashSet},
};

use chrono::{DateTime, Utc};

use crate::job::{Job, JobError, JobId};

use super::stats::QueueStats;

/// Dispatch order: highest priority first, then earliest `scheduled_for`.
fn dispatch_order(a: &Job, b: &Job) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.scheduled_for.cmp(&b.scheduled_for))
}

/// The in-memory queue. Jobs are kept in dispatch order at all times.
#[derive(Debug, Default)]
pub(super) struct QueueState {
    jobs: Vec<Job>,
    in_flight: HashSet<JobId>,
    completed_total: u64,
    failed_total: u64,
}

impl QueueState {
    /// Inserts after any job with the same ordering key, so equal jobs keep submission order.
    pub(super) fn insert(&mut self, job: Job) {
        let index = self
            .jobs
            .partition_point(|existing| dispatch_order(existing, &job) != Ordering::Greater);
        self.jobs.insert(index, job);
    }

    pub(super) fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub(super) fn contains(&self, id: JobId) -> bool {
        self.get(id).is_some()
    }

    fn remove(&mut self, id: JobId) -> Option<Job> {
        let index = self.jobs.iter().position(|job| job.id == id)?;
        Some(self.jobs.remove(index))
    }

    pub(super) fn is_in_flight(&self, id: JobId) -> bool {
        self.in_flight.contains(&id)
    }

    /// Selects up to the free capacity of ready jobs, in dispatch order, and marks them as in
    /// flight. The returned jobs have their attempt counted.
    pub(super) fn select_ready(&mut self, now: DateTime<Utc>, max_concurrent: usize) -> Vec<Job> {
        let capacity = max_concurrent.saturating_sub(self.in_flight.len());
        let mut selected = Vec::new();
        for job in self.jobs.iter_mut() {
            if selected.len() >= capacity {
                break;
            }
            if job.is_ready(now) && !self.in_flight.contains(&job.id) {
                job.mark_processing(now);
                self.in_flight.insert(job.id);
                selected.push(job.clone());
            }
        }
        selected
    }

    /// Removes the jobs that are not in flight but have no attempts left, counting them as
    /// failed.
    pub(super) fn take_exhausted(&mut self) -> Vec<Job> {
        let (exhausted, remaining) = std::mem::take(&mut self.jobs)
            .into_iter()
            .partition(|job| job.is_exhausted() && !self.in_flight.contains(&job.id));
        self.jobs = remaining;
        let exhausted: Vec<Job> = exhausted;
        self.failed_total += exhausted.len() as u64;
        exhausted
    }

    pub(super) fn finish(&mut self, id: JobId) {
        self.in_flight.remove(&id);
    }

    pub(super) fn complete(&mut self, id: JobId) -> Option<Job> {
        let job = self.remove(id)?;
        self.completed_total += 1;
        Some(job)
    }

    pub(super) fn fail(&mut self, id: JobId) -> Option<Job> {
        let job = self.remove(id)?;
        self.failed_total += 1;
        Some(job)
    }

    /// Records the failed attempt and moves the job to its new position.
    pub(super) fn reschedule(
        &mut self,
        id: JobId,
        scheduled_for: DateTime<Utc>,
        error: JobError,
    ) -> Option<Job> {
        let mut job = self.remove(id)?;
        job.failed_at = Some(error.recorded_at);
        job.last_error = Some(error);
        job.scheduled_for = scheduled_for;
        self.insert(job.clone());
        Some(job)
    }

    pub(super) fn stats(&self, now: DateTime<Utc>) -> QueueStats {
        let mut jobs_by_kind = BTreeMap::new();
        let mut jobs_by_priority = BTreeMap::new();
        let mut ready_jobs = 0;
        let mut failed_jobs = 0;
        let mut scheduled_jobs = 0;
        for job in &self.jobs {
            *jobs_by_kind.entry(job.kind()).or_insert(0) += 1;
            *jobs_by_priority.entry(job.priority).or_insert(0) += 1;
            let in_flight = self.in_flight.contains(&job.id);
            if job.scheduled_for > now {
                scheduled_jobs += 1;
            }
            if !in_flight && job.is_ready(now) {
                ready_jobs += 1;
            }
            if !in_flight && job.is_exhausted() {
                failed_jobs += 1;
            }
        }
        QueueStats {
            total_jobs: self.jobs.len(),
            ready_jobs,
            processing_jobs: self.in_flight.len(),
            failed_jobs,
            scheduled_jobs,
            jobs_by_kind,
            jobs_by_priority,
            completed_total: self.completed_total,
            failed_total: self.failed_total,
            persistence: Default::default(),
        }
    }
}
