use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::{check_transition, JobStore, StoreError, RECENT_FAILURES};
use crate::models::job::{
    ItemStatus, ItemUpdate, Job, JobStatus, JobSummary, NewWorkItem, WorkItem,
};

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    items: HashMap<Uuid, Vec<WorkItem>>,
    next_item_id: i64,
}

/// In-process job store for tests and dry runs.
#[derive(Default)]
pub struct MemoryJobStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// All items of a job, in creation order.
    pub async fn items(&self, job_id: Uuid) -> Vec<WorkItem> {
        self.tables
            .lock()
            .await
            .items
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }
}

fn recount(job: &mut Job, items: &[WorkItem]) {
    let count = |status: ItemStatus| items.iter().filter(|i| i.status == status).count() as i64;
    job.total_items = items.len() as i64;
    job.succeeded_items = count(ItemStatus::Successful);
    job.failed_items = count(ItemStatus::Failed);
    job.skipped_items = count(ItemStatus::Skipped);
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(
        &self,
        items: &[NewWorkItem],
        batch_size: i32,
        is_repair: bool,
    ) -> Result<Job, StoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;

        let job_id = Uuid::new_v4();
        let mut rows = Vec::with_capacity(items.len());
        for item in items {
            tables.next_item_id += 1;
            rows.push(WorkItem {
                id: tables.next_item_id,
                job_id,
                customer_id: item.customer_id.clone(),
                group_id: item.group_id.clone(),
                campaign_id: item.campaign_id.clone(),
                campaign_name: item.campaign_name.clone(),
                variant_name: item.variant_name.clone(),
                status: ItemStatus::Pending,
                result_resource: None,
                error: None,
                processed_at: None,
            });
        }

        let mut job = Job {
            id: job_id,
            status: JobStatus::Pending,
            batch_size,
            is_repair,
            total_items: 0,
            succeeded_items: 0,
            failed_items: 0,
            skipped_items: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        };
        recount(&mut job, &rows);

        tables.jobs.insert(job_id, job.clone());
        tables.items.insert(job_id, rows);
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        tables
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::NotFound(job_id))
    }

    async fn get_job_status(&self, job_id: Uuid) -> Result<JobSummary, StoreError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let job = tables
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::NotFound(job_id))?;

        let mut failures: Vec<WorkItem> = tables
            .items
            .get(&job_id)
            .map(|items| {
                items
                    .iter()
                    .filter(|i| i.status == ItemStatus::Failed)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        failures.sort_by(|a, b| b.processed_at.cmp(&a.processed_at).then(b.id.cmp(&a.id)));
        failures.truncate(RECENT_FAILURES as usize);

        Ok(JobSummary {
            pending_items: job.pending_items(),
            job,
            recent_failures: failures,
        })
    }

    async fn get_pending_items(&self, job_id: Uuid) -> Result<Vec<WorkItem>, StoreError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        if !tables.jobs.contains_key(&job_id) {
            return Err(StoreError::NotFound(job_id));
        }
        Ok(tables
            .items
            .get(&job_id)
            .map(|items| {
                items
                    .iter()
                    .filter(|i| i.status == ItemStatus::Pending)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn batch_update_items(&self, job_id: Uuid, updates: &[ItemUpdate]) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut guard = self.tables.lock().await;
        let tables = &mut *guard;
        let job = tables.jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        let items = tables.items.entry(job_id).or_default();

        let now = Utc::now();
        let by_id: HashMap<i64, &ItemUpdate> = updates
            .iter()
            .filter(|u| u.status.is_terminal())
            .map(|u| (u.item_id, u))
            .collect();

        let mut changed = 0;
        for item in items.iter_mut() {
            if item.status != ItemStatus::Pending {
                continue;
            }
            if let Some(update) = by_id.get(&item.id) {
                item.status = update.status;
                item.result_resource = update.result_resource.clone();
                item.error = update.error.clone();
                item.processed_at = Some(now);
                changed += 1;
            }
        }

        recount(job, items);
        Ok(changed)
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<Job, StoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let job = tables.jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        check_transition(job.status, status)?;

        let now = Utc::now();
        match status {
            JobStatus::Running => job.started_at = Some(now),
            JobStatus::Completed | JobStatus::Failed => job.completed_at = Some(now),
            _ => {}
        }
        if status == JobStatus::Running {
            job.error_message = None;
        }
        if let Some(message) = error_message {
            job.error_message = Some(message.to_string());
        }
        job.status = status;
        Ok(job.clone())
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let mut jobs: Vec<Job> = tables.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn next_runnable_job(&self) -> Result<Option<Job>, StoreError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by_key(|j| j.created_at)
            .cloned())
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        tables.jobs.remove(&job_id).ok_or(StoreError::NotFound(job_id))?;
        tables.items.remove(&job_id);
        Ok(())
    }
}
