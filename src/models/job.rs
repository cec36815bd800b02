use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Lifecycle status of a bulk job.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Failed,
    Completed,
}

impl JobStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// pending → running → {completed, failed, paused}; paused → running;
    /// failed → running. A job never moves to the status it already has, so
    /// a second runner cannot attach to a running job.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Failed, Running)
                // a paused job that never got picked up again can still be abandoned
                | (Paused, Failed)
                | (Pending, Paused)
                | (Pending, Failed)
        )
    }

    /// Statuses a job can be resumed from. Dry runs never record status,
    /// so their jobs stay pending and remain resumable.
    pub fn is_resumable(self, dry_run: bool) -> bool {
        match self {
            JobStatus::Paused | JobStatus::Failed => true,
            JobStatus::Pending => dry_run,
            JobStatus::Running | JobStatus::Completed => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed)
    }
}

/// Status of a single work item. Transitions are monotonic: pending → terminal.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Successful,
    Failed,
    Skipped,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ItemStatus::Pending)
    }
}

/// A pausable, resumable unit of bulk work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub batch_size: i32,
    pub is_repair: bool,
    pub total_items: i64,
    pub succeeded_items: i64,
    pub failed_items: i64,
    pub skipped_items: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn pending_items(&self) -> i64 {
        self.total_items - self.succeeded_items - self.failed_items - self.skipped_items
    }
}

/// One (customer, group, variant) unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    pub id: i64,
    pub job_id: Uuid,
    pub customer_id: String,
    pub group_id: String,
    pub campaign_id: Option<String>,
    pub campaign_name: Option<String>,
    pub variant_name: String,
    pub status: ItemStatus,
    pub result_resource: Option<String>,
    pub error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Input row for job creation.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct NewWorkItem {
    #[garde(length(min = 1, max = 50), custom(numeric_id))]
    pub customer_id: String,

    #[garde(length(min = 1, max = 50), custom(numeric_id))]
    pub group_id: String,

    #[garde(skip)]
    pub campaign_id: Option<String>,

    #[garde(skip)]
    pub campaign_name: Option<String>,

    #[garde(length(min = 1, max = 100))]
    pub variant_name: String,
}

pub(crate) fn numeric_id(value: &str, _ctx: &()) -> garde::Result {
    if value.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(garde::Error::new("must be a numeric identifier"))
    }
}

/// Terminal outcome recorded against one work item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemUpdate {
    pub item_id: i64,
    pub status: ItemStatus,
    pub result_resource: Option<String>,
    pub error: Option<String>,
}

impl ItemUpdate {
    pub fn successful(item_id: i64, resource: impl Into<String>) -> Self {
        Self {
            item_id,
            status: ItemStatus::Successful,
            result_resource: Some(resource.into()),
            error: None,
        }
    }

    pub fn failed(item_id: i64, error: impl Into<String>) -> Self {
        Self {
            item_id,
            status: ItemStatus::Failed,
            result_resource: None,
            error: Some(error.into()),
        }
    }

    pub fn skipped(item_id: i64, reason: SkipReason) -> Self {
        Self {
            item_id,
            status: ItemStatus::Skipped,
            result_resource: None,
            error: Some(reason.to_string()),
        }
    }
}

/// Precondition-not-met causes. Skipped items always carry one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SkipReason {
    #[strum(to_string = "already processed (group carries done label)")]
    AlreadyDone,
    #[strum(to_string = "no baseline ad to clone from")]
    NoBaselineAd,
}

/// Job plus per-status counts and the most recent failures, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job: Job,
    pub pending_items: i64,
    pub recent_failures: Vec<WorkItem>,
}

/// Body of a job submission.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateJobRequest {
    #[garde(length(min = 1, max = 500_000), dive)]
    pub items: Vec<NewWorkItem>,

    /// Items handed to the pipeline per slice
    #[garde(range(min = 1, max = 10_000))]
    #[serde(default = "default_batch_size")]
    pub batch_size: i32,

    /// Start processing in the background right away instead of waiting
    /// for a worker to pick the job up
    #[garde(skip)]
    #[serde(default)]
    pub start: bool,
}

fn default_batch_size() -> i32 {
    100
}
