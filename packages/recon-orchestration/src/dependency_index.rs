//! Per-reconstruction chain tails for job dependency resolution
//!
//! Every reconstruction's jobs form an implicit chain: each new job depends on
//! whatever job was last enqueued for the same id. Rather than scanning the
//! queue and the workers for a matching id, the index keeps the chain tail:
//! - `ReconstructionId → ChainTail`: O(1) "what is in flight for this id"
//! - Present entry = some job is queued or running; absent = idle
//! - Shard-locked updates with DashMap, so read-tail-then-append is atomic

use crate::job::{JobHandle, StepKind};
use crate::reconstruction::ReconstructionId;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

/// Last enqueued, not yet terminal job of one reconstruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTail {
    pub job_id: Uuid,
    pub step: StepKind,
    pub enqueued_at: DateTime<Utc>,
}

pub struct DependencyIndex {
    tails: DashMap<ReconstructionId, ChainTail>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self {
            tails: DashMap::new(),
        }
    }

    /// The job a new step for `id` must wait on, if any
    pub fn find_active_job(&self, id: &ReconstructionId) -> Option<JobHandle> {
        self.tails.get(id).map(|tail| JobHandle {
            job_id: tail.job_id,
            reconstruction_id: id.clone(),
            step: tail.step,
        })
    }

    /// Append a job to the chain of `id`.
    ///
    /// `enqueue` receives the current tail and returns the handle of the job
    /// it created, which becomes the new tail. The entry stays locked for the
    /// whole call, so concurrent appends for one id are serialized and each
    /// sees its predecessor. When `enqueue` fails the chain is left as it was.
    pub fn chain<F, E>(&self, id: &ReconstructionId, enqueue: F) -> Result<JobHandle, E>
    where
        F: FnOnce(Option<Uuid>) -> Result<JobHandle, E>,
    {
        match self.tails.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                let handle = enqueue(Some(slot.get().job_id))?;
                slot.insert(Self::tail_for(&handle));
                Ok(handle)
            }
            Entry::Vacant(slot) => {
                let handle = enqueue(None)?;
                slot.insert(Self::tail_for(&handle));
                Ok(handle)
            }
        }
    }

    /// Forget `job_id` as the tail of `id`, unless a later job replaced it
    pub fn release(&self, id: &ReconstructionId, job_id: Uuid) -> bool {
        self.tails
            .remove_if(id, |_, tail| tail.job_id == job_id)
            .is_some()
    }

    /// Number of reconstructions with work in flight
    pub fn len(&self) -> usize {
        self.tails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tails.is_empty()
    }

    fn tail_for(handle: &JobHandle) -> ChainTail {
        ChainTail {
            job_id: handle.job_id,
            step: handle.step,
            enqueued_at: Utc::now(),
        }
    }
}

impl Default for DependencyIndex {
    fn default() -> Self {
        Self::new()
    }
}
