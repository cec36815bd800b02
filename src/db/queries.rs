use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::store::{check_transition, JobStore, StoreError, RECENT_FAILURES};
use crate::models::job::{ItemUpdate, Job, JobStatus, JobSummary, NewWorkItem, WorkItem};

const JOB_COLUMNS: &str = "id, status, batch_size, is_repair, total_items, succeeded_items, \
     failed_items, skipped_items, created_at, started_at, completed_at, error_message";

const ITEM_COLUMNS: &str = "id, job_id, customer_id, group_id, campaign_id, campaign_name, \
     variant_name, status, result_resource, error, processed_at";

/// Postgres-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Job {
        id: row.try_get("id")?,
        status: status
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("job status '{status}'")))?,
        batch_size: row.try_get("batch_size")?,
        is_repair: row.try_get("is_repair")?,
        total_items: row.try_get("total_items")?,
        succeeded_items: row.try_get("succeeded_items")?,
        failed_items: row.try_get("failed_items")?,
        skipped_items: row.try_get("skipped_items")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error_message: row.try_get("error_message")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<WorkItem, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(WorkItem {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        customer_id: row.try_get("customer_id")?,
        group_id: row.try_get("group_id")?,
        campaign_id: row.try_get("campaign_id")?,
        campaign_name: row.try_get("campaign_name")?,
        variant_name: row.try_get("variant_name")?,
        status: status
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("item status '{status}'")))?,
        result_resource: row.try_get("result_resource")?,
        error: row.try_get("error")?,
        processed_at: row.try_get("processed_at")?,
    })
}

/// Recompute the job's counters from its item rows.
async fn recount(tx: &mut Transaction<'_, Postgres>, job_id: Uuid) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE jobs SET
            total_items = c.total,
            succeeded_items = c.succeeded,
            failed_items = c.failed,
            skipped_items = c.skipped
        FROM (
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'successful') AS succeeded,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'skipped') AS skipped
            FROM work_items
            WHERE job_id = $1
        ) AS c
        WHERE jobs.id = $1
        "#,
    )
    .bind(job_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(
        &self,
        items: &[NewWorkItem],
        batch_size: i32,
        is_repair: bool,
    ) -> Result<Job, StoreError> {
        let job_id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO jobs (id, status, batch_size, is_repair) VALUES ($1, 'pending', $2, $3)")
            .bind(job_id)
            .bind(batch_size)
            .bind(is_repair)
            .execute(&mut *tx)
            .await?;

        // Insert in slices to stay well under the bind parameter limit.
        for chunk in items.chunks(5000) {
            let customers: Vec<&str> = chunk.iter().map(|i| i.customer_id.as_str()).collect();
            let groups: Vec<&str> = chunk.iter().map(|i| i.group_id.as_str()).collect();
            let campaign_ids: Vec<Option<&str>> = chunk.iter().map(|i| i.campaign_id.as_deref()).collect();
            let campaign_names: Vec<Option<&str>> =
                chunk.iter().map(|i| i.campaign_name.as_deref()).collect();
            let variants: Vec<&str> = chunk.iter().map(|i| i.variant_name.as_str()).collect();

            sqlx::query(
                r#"
                INSERT INTO work_items (job_id, customer_id, group_id, campaign_id, campaign_name, variant_name)
                SELECT $1, * FROM UNNEST($2::text[], $3::text[], $4::text[], $5::text[], $6::text[])
                "#,
            )
            .bind(job_id)
            .bind(&customers)
            .bind(&groups)
            .bind(&campaign_ids)
            .bind(&campaign_names)
            .bind(&variants)
            .execute(&mut *tx)
            .await?;
        }

        recount(&mut tx, job_id).await?;
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        job_from_row(&row)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(job_id))?;
        job_from_row(&row)
    }

    async fn get_job_status(&self, job_id: Uuid) -> Result<JobSummary, StoreError> {
        let job = self.get_job(job_id).await?;
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM work_items \
             WHERE job_id = $1 AND status = 'failed' \
             ORDER BY processed_at DESC NULLS LAST, id DESC LIMIT $2"
        ))
        .bind(job_id)
        .bind(RECENT_FAILURES)
        .fetch_all(&self.pool)
        .await?;

        Ok(JobSummary {
            pending_items: job.pending_items(),
            job,
            recent_failures: rows.iter().map(item_from_row).collect::<Result<_, _>>()?,
        })
    }

    async fn get_pending_items(&self, job_id: Uuid) -> Result<Vec<WorkItem>, StoreError> {
        // distinguishes "no such job" from "nothing left"
        self.get_job(job_id).await?;
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM work_items WHERE job_id = $1 AND status = 'pending' ORDER BY id"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn batch_update_items(&self, job_id: Uuid, updates: &[ItemUpdate]) -> Result<u64, StoreError> {
        let terminal: Vec<&ItemUpdate> = updates.iter().filter(|u| u.status.is_terminal()).collect();
        let ids: Vec<i64> = terminal.iter().map(|u| u.item_id).collect();
        let statuses: Vec<&str> = terminal.iter().map(|u| u.status.as_ref()).collect();
        let resources: Vec<Option<&str>> = terminal.iter().map(|u| u.result_resource.as_deref()).collect();
        let errors: Vec<Option<&str>> = terminal.iter().map(|u| u.error.as_deref()).collect();

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE work_items AS w SET
                status = u.status,
                result_resource = u.result_resource,
                error = u.error,
                processed_at = NOW()
            FROM UNNEST($2::bigint[], $3::text[], $4::text[], $5::text[])
                AS u(id, status, result_resource, error)
            WHERE w.id = u.id AND w.job_id = $1 AND w.status = 'pending'
            "#,
        )
        .bind(job_id)
        .bind(&ids)
        .bind(&statuses)
        .bind(&resources)
        .bind(&errors)
        .execute(&mut *tx)
        .await?;

        recount(&mut tx, job_id).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current: String = sqlx::query("SELECT status FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(job_id))?
            .try_get("status")?;
        let current: JobStatus = current
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("job status '{current}'")))?;
        check_transition(current, status)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = $1,
                started_at = CASE WHEN $1 = 'running' THEN NOW() ELSE started_at END,
                completed_at = CASE WHEN $1 IN ('completed', 'failed') THEN NOW() ELSE completed_at END,
                error_message = CASE
                    WHEN $2::text IS NOT NULL THEN $2
                    WHEN $1 = 'running' THEN NULL
                    ELSE error_message
                END
            WHERE id = $3
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(status.as_ref())
        .bind(error_message)
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        job_from_row(&row)
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn next_runnable_job(&self) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'pending' ORDER BY created_at LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job_id));
        }
        Ok(())
    }
}
