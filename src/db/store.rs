use async_trait::async_trait;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus, JobSummary, ItemUpdate, NewWorkItem, WorkItem};

/// Number of failed items returned with a job summary.
pub const RECENT_FAILURES: i64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid job transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Persistence for jobs and their work items. The single source of truth
/// for resumability.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(
        &self,
        items: &[NewWorkItem],
        batch_size: i32,
        is_repair: bool,
    ) -> Result<Job, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError>;

    /// Job with its pending count and most recent failures.
    async fn get_job_status(&self, job_id: Uuid) -> Result<JobSummary, StoreError>;

    async fn get_pending_items(&self, job_id: Uuid) -> Result<Vec<WorkItem>, StoreError>;

    /// Apply terminal outcomes. Items that are no longer pending are left
    /// untouched; job counts are recomputed from the item rows. Returns the
    /// number of items that changed.
    async fn batch_update_items(&self, job_id: Uuid, updates: &[ItemUpdate]) -> Result<u64, StoreError>;

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<Job, StoreError>;

    /// Most recent jobs first.
    async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>, StoreError>;

    /// Oldest job still waiting to be picked up.
    async fn next_runnable_job(&self) -> Result<Option<Job>, StoreError>;

    async fn delete_job(&self, job_id: Uuid) -> Result<(), StoreError>;
}

/// Reject a status change the job state machine does not allow.
pub fn check_transition(from: JobStatus, to: JobStatus) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition { from, to })
    }
}
