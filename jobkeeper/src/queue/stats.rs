use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    job::{JobKind, Priority},
    store::PersistenceStatus,
};

/// A point in time view of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs held by the queue, including those in flight.
    pub total_jobs: usize,
    /// Jobs that would be dispatched now given enough capacity.
    pub ready_jobs: usize,
    pub processing_jobs: usize,
    /// Jobs with no attempts left that have not been swept yet.
    pub failed_jobs: usize,
    /// Jobs scheduled in the future, including those waiting for a retry.
    pub scheduled_jobs: usize,
    pub jobs_by_kind: BTreeMap<JobKind, usize>,
    pub jobs_by_priority: BTreeMap<Priority, usize>,
    /// Jobs completed since the queue was created.
    pub completed_total: u64,
    /// Jobs discarded since the queue was created.
    pub failed_total: u64,
    pub persistence: PersistenceStatus,
}
