//! Resumable job execution: customers fan out under a concurrency bound,
//! each running prefetch → plan → evict → create → label sequentially.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::db::store::{JobStore, StoreError};
use crate::models::job::{ItemStatus, ItemUpdate, Job, JobStatus, WorkItem};
use crate::models::remote::{group_resource, AdStatus, MutateOperation, RemoteAd};
use crate::models::variant::{VariantCatalog, VariantDefinition};
use crate::services::ads_api::ApiError;
use crate::services::batcher::MutationBatcher;
use crate::services::labels::{ensure_labels, LabelReconciler};
use crate::services::planner::{self, CreatePlan, GroupDecision, EVICTION_IMPOSSIBLE};
use crate::services::prefetch::PrefetchCache;

/// Item error when the prefetch could not read the item's group.
pub const GROUP_UNREADABLE: &str = "group state could not be read; rerun the item";

/// Failure of one customer's pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Ads platform error: {0}")]
    Api(#[from] ApiError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}

/// Failure that aborts the whole job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ItemCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ItemCounts {
    pub fn record(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Successful => self.succeeded += 1,
            ItemStatus::Failed => self.failed += 1,
            ItemStatus::Skipped => self.skipped += 1,
            ItemStatus::Pending => {}
        }
    }

    pub fn merge(&mut self, other: ItemCounts) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomerReport {
    pub customer_id: String,
    pub counts: ItemCounts,
    /// Set when the pipeline aborted; its unprocessed items were failed.
    pub error: Option<String>,
    /// Stopped early because the job was paused.
    pub stopped: bool,
}

impl CustomerReport {
    fn new(customer_id: &str) -> Self {
        Self {
            customer_id: customer_id.to_string(),
            counts: ItemCounts::default(),
            error: None,
            stopped: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub counts: ItemCounts,
    pub customers: Vec<CustomerReport>,
    pub dry_run: bool,
}

/// Buffers item outcomes and writes them to the store in batches.
pub struct StatusBuffer {
    job_id: Uuid,
    threshold: usize,
    write: bool,
    pending: Vec<ItemUpdate>,
    flushes: usize,
}

impl StatusBuffer {
    /// `write = false` discards updates instead of persisting them (dry runs).
    pub fn new(job_id: Uuid, threshold: usize, write: bool) -> Self {
        Self {
            job_id,
            threshold: threshold.max(1),
            write,
            pending: Vec::new(),
            flushes: 0,
        }
    }

    pub async fn push(&mut self, store: &dyn JobStore, update: ItemUpdate) -> Result<(), StoreError> {
        metrics::counter!("work_items_total", "status" => update.status.to_string()).increment(1);
        self.pending.push(update);
        if self.pending.len() >= self.threshold {
            self.flush(store).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self, store: &dyn JobStore) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let updates = std::mem::take(&mut self.pending);
        if self.write {
            let changed = store.batch_update_items(self.job_id, &updates).await?;
            tracing::debug!(job_id = %self.job_id, updates = updates.len(), changed, "Flushed item statuses");
        }
        self.flushes += 1;
        Ok(())
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

/// Group items by customer, preserving every item exactly once and the
/// original order within a customer.
pub fn partition_by_customer(items: Vec<WorkItem>) -> BTreeMap<String, Vec<WorkItem>> {
    let mut partitions: BTreeMap<String, Vec<WorkItem>> = BTreeMap::new();
    for item in items {
        partitions.entry(item.customer_id.clone()).or_default().push(item);
    }
    partitions
}

/// Split items into rounds so that a group appears at most once per round.
fn waves(items: Vec<WorkItem>) -> Vec<Vec<WorkItem>> {
    let mut rounds: Vec<Vec<WorkItem>> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for item in items {
        let round = seen.entry(item.group_id.clone()).or_insert(0);
        if rounds.len() <= *round {
            rounds.push(Vec::new());
        }
        rounds[*round].push(item);
        *round += 1;
    }
    rounds
}

/// Pause check shared by every customer of one run.
#[derive(Clone)]
struct StopSignal {
    job_id: Uuid,
    flag: Arc<AtomicBool>,
    store: Arc<dyn JobStore>,
}

impl StopSignal {
    /// Local flag first; the store catches pauses issued by other processes.
    async fn is_set(&self) -> Result<bool, StoreError> {
        if self.flag.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let paused = self.store.get_job(self.job_id).await?.status == JobStatus::Paused;
        if paused {
            self.flag.store(true, Ordering::SeqCst);
        }
        Ok(paused)
    }
}

struct PlannedCreate<'a> {
    item: &'a WorkItem,
    variant: &'a VariantDefinition,
    group: String,
    plan: CreatePlan,
}

#[derive(Clone)]
pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    batcher: Arc<MutationBatcher>,
    catalog: Arc<VariantCatalog>,
    settings: Arc<EngineSettings>,
    pause_flags: Arc<Mutex<HashMap<Uuid, Arc<AtomicBool>>>>,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        batcher: Arc<MutationBatcher>,
        catalog: Arc<VariantCatalog>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            batcher,
            catalog,
            settings: Arc::new(settings),
            pause_flags: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn batcher(&self) -> &Arc<MutationBatcher> {
        &self.batcher
    }

    pub fn catalog(&self) -> &Arc<VariantCatalog> {
        &self.catalog
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn pause_flag(&self, job_id: Uuid) -> Arc<AtomicBool> {
        let mut flags = match self.pause_flags.lock() {
            Ok(flags) => flags,
            Err(poisoned) => poisoned.into_inner(),
        };
        flags.entry(job_id).or_default().clone()
    }

    fn release_flag(&self, job_id: Uuid) {
        if let Ok(mut flags) = self.pause_flags.lock() {
            flags.remove(&job_id);
        }
    }

    /// Mark a job paused. A run in this process stops before its next slice
    /// of items; runs elsewhere notice through the store.
    pub async fn pause_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        let job = self.store.update_job_status(job_id, JobStatus::Paused, None).await?;
        if let Ok(flags) = self.pause_flags.lock() {
            if let Some(flag) = flags.get(&job_id) {
                flag.store(true, Ordering::SeqCst);
            }
        }
        tracing::info!(job_id = %job_id, "Job paused");
        Ok(job)
    }

    /// Move a paused or failed job back to running and process what is left.
    pub async fn resume_job(&self, job_id: Uuid) -> Result<ProcessReport, JobError> {
        let job = self.store.get_job(job_id).await?;
        if !job.status.is_resumable(self.settings.dry_run) {
            return Err(StoreError::InvalidTransition {
                from: job.status,
                to: JobStatus::Running,
            }
            .into());
        }
        if !self.settings.dry_run {
            self.store.update_job_status(job_id, JobStatus::Running, None).await?;
        }
        tracing::info!(job_id = %job_id, "Job resumed");
        self.process_job(job_id).await
    }

    /// The single resumable entry point: process every pending item of a job.
    pub async fn process_job(&self, job_id: Uuid) -> Result<ProcessReport, JobError> {
        let dry_run = self.settings.dry_run;
        let job = self.store.get_job(job_id).await?;
        if job.status == JobStatus::Completed {
            tracing::info!(job_id = %job_id, "Job already completed, nothing to do");
            return Ok(ProcessReport {
                job_id,
                status: JobStatus::Completed,
                counts: ItemCounts::default(),
                customers: Vec::new(),
                dry_run,
            });
        }

        let items = self.store.get_pending_items(job_id).await?;
        tracing::info!(
            job_id = %job_id,
            pending = items.len(),
            is_repair = job.is_repair,
            dry_run,
            "Processing job"
        );
        if !dry_run && job.status != JobStatus::Running {
            self.store.update_job_status(job_id, JobStatus::Running, None).await?;
        }

        let flag = self.pause_flag(job_id);
        flag.store(false, Ordering::SeqCst);
        let stop = StopSignal {
            job_id,
            flag: flag.clone(),
            store: self.store.clone(),
        };

        let result = self.run_customers(&job, items, stop).await;
        self.release_flag(job_id);

        let customers = match result {
            Ok(customers) => customers,
            Err(err) => {
                tracing::error!(job_id = %job_id, error = %err, "Job aborted");
                if !dry_run {
                    if let Err(mark_err) = self
                        .store
                        .update_job_status(job_id, JobStatus::Failed, Some(&err.to_string()))
                        .await
                    {
                        tracing::error!(job_id = %job_id, error = %mark_err, "Failed to record job failure");
                    }
                }
                return Err(err);
            }
        };

        let mut counts = ItemCounts::default();
        for customer in &customers {
            counts.merge(customer.counts);
        }

        let paused = flag.load(Ordering::SeqCst) || customers.iter().any(|c| c.stopped);
        let status = if paused {
            JobStatus::Paused
        } else {
            if !dry_run {
                self.store.update_job_status(job_id, JobStatus::Completed, None).await?;
            }
            JobStatus::Completed
        };

        tracing::info!(
            job_id = %job_id,
            status = %status,
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            customers = customers.len(),
            "Job run finished"
        );

        Ok(ProcessReport {
            job_id,
            status,
            counts,
            customers,
            dry_run,
        })
    }

    async fn run_customers(
        &self,
        job: &Job,
        items: Vec<WorkItem>,
        stop: StopSignal,
    ) -> Result<Vec<CustomerReport>, JobError> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_customers.max(1)));
        let mut tasks = JoinSet::new();
        let mut task_customers = HashMap::new();

        for (customer_id, customer_items) in partition_by_customer(items) {
            let this = self.clone();
            let job = job.clone();
            let stop = stop.clone();
            let semaphore = semaphore.clone();
            let task_customer = customer_id.clone();

            let handle = tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                this.run_customer(&job, &customer_id, customer_items, &stop).await
            });
            task_customers.insert(handle.id(), task_customer);
        }

        let mut reports = Vec::new();
        let mut job_error: Option<JobError> = None;

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Ok(report))) => reports.push(report),
                Ok((_, Err(err))) => {
                    if job_error.is_none() {
                        tasks.abort_all();
                        job_error = Some(err.into());
                    }
                }
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    let customer_id = task_customers.get(&err.id()).cloned().unwrap_or_default();
                    tracing::error!(job_id = %job.id, customer_id = %customer_id, error = %err, "Customer task panicked");
                    let mut report = CustomerReport::new(&customer_id);
                    report.error = Some(format!("customer task panicked: {err}"));
                    reports.push(report);
                }
            }
        }

        match job_error {
            Some(err) => Err(err),
            None => {
                reports.sort_by(|a, b| a.customer_id.cmp(&b.customer_id));
                Ok(reports)
            }
        }
    }

    /// One customer's pipeline. Platform failures stay inside the customer;
    /// only store failures escape.
    async fn run_customer(
        &self,
        job: &Job,
        customer_id: &str,
        items: Vec<WorkItem>,
        stop: &StopSignal,
    ) -> Result<CustomerReport, StoreError> {
        let started = Instant::now();
        let mut report = CustomerReport::new(customer_id);
        let mut buffer = StatusBuffer::new(job.id, self.settings.status_flush_threshold, !self.settings.dry_run);
        let item_ids: Vec<i64> = items.iter().map(|i| i.id).collect();
        let mut recorded: HashSet<i64> = HashSet::new();

        let outcome = self
            .customer_pipeline(job, customer_id, items, stop, &mut buffer, &mut report, &mut recorded)
            .await;

        match outcome {
            Ok(()) => {}
            Err(PipelineError::Store(err)) => return Err(err),
            Err(PipelineError::Api(err)) => {
                tracing::error!(job_id = %job.id, customer_id, error = %err, "Customer pipeline failed");
                let message = format!("customer pipeline failed: {err}");
                for id in item_ids.into_iter().filter(|id| !recorded.contains(id)) {
                    report.counts.record(ItemStatus::Failed);
                    buffer.push(self.store.as_ref(), ItemUpdate::failed(id, message.clone())).await?;
                }
                report.error = Some(err.to_string());
            }
        }

        buffer.flush(self.store.as_ref()).await?;
        metrics::histogram!("customer_pipeline_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(
            job_id = %job.id,
            customer_id,
            succeeded = report.counts.succeeded,
            failed = report.counts.failed,
            skipped = report.counts.skipped,
            stopped = report.stopped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Customer finished"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn customer_pipeline(
        &self,
        job: &Job,
        customer_id: &str,
        items: Vec<WorkItem>,
        stop: &StopSignal,
        buffer: &mut StatusBuffer,
        report: &mut CustomerReport,
        recorded: &mut HashSet<i64>,
    ) -> Result<(), PipelineError> {
        if stop.is_set().await? {
            report.stopped = true;
            return Ok(());
        }

        let groups: Vec<String> = items
            .iter()
            .map(|i| group_resource(customer_id, &i.group_id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut cache =
            PrefetchCache::load(&self.batcher, customer_id, &groups, self.settings.query_chunk_size).await?;

        let label_names: Vec<String> = items
            .iter()
            .filter_map(|i| self.catalog.get(&i.variant_name))
            .flat_map(|v| [v.marker_label.clone(), v.done_label.clone()])
            .collect();
        ensure_labels(&self.batcher, customer_id, &mut cache.labels, &label_names).await?;

        let slice_size = usize::try_from(job.batch_size).unwrap_or(1).max(1);
        for wave in waves(items) {
            for slice in wave.chunks(slice_size) {
                if stop.is_set().await? {
                    report.stopped = true;
                    return Ok(());
                }
                let updates = self.process_slice(job, customer_id, slice, &mut cache).await?;
                for update in updates {
                    report.counts.record(update.status);
                    recorded.insert(update.item_id);
                    buffer.push(self.store.as_ref(), update).await?;
                }
            }
        }
        Ok(())
    }

    /// Plan and execute one slice of items whose groups are all distinct.
    async fn process_slice(
        &self,
        job: &Job,
        customer_id: &str,
        slice: &[WorkItem],
        cache: &mut PrefetchCache,
    ) -> Result<Vec<ItemUpdate>, ApiError> {
        let mut updates = Vec::with_capacity(slice.len());
        let mut creates: Vec<PlannedCreate<'_>> = Vec::new();
        let mut existing: Vec<(&WorkItem, &VariantDefinition, String, String)> = Vec::new();

        for item in slice {
            let Some(variant) = self.catalog.get(&item.variant_name) else {
                updates.push(ItemUpdate::failed(item.id, format!("unknown variant '{}'", item.variant_name)));
                continue;
            };
            let group = group_resource(customer_id, &item.group_id);
            if !cache.is_readable(&group) {
                updates.push(ItemUpdate::failed(item.id, GROUP_UNREADABLE));
                continue;
            }
            match planner::decide(cache.group(&group), variant, &self.catalog, job.is_repair, self.settings.slot_cap) {
                GroupDecision::Skip(reason) => updates.push(ItemUpdate::skipped(item.id, reason)),
                GroupDecision::EvictionImpossible => {
                    tracing::warn!(customer_id, group = %group, variant = %variant.name, "No evictable ad in full group");
                    updates.push(ItemUpdate::failed(item.id, EVICTION_IMPOSSIBLE));
                }
                GroupDecision::AlreadyPresent { ad_resource } => {
                    existing.push((item, variant, group, ad_resource))
                }
                GroupDecision::Create(plan) => creates.push(PlannedCreate {
                    item,
                    variant,
                    group,
                    plan,
                }),
            }
        }

        let reconciler_labels = cache.labels.clone();
        let reconciler = LabelReconciler::new(&self.batcher, customer_id, &reconciler_labels);

        // Removals are awaited before any create for the same groups.
        let evicting: Vec<usize> = (0..creates.len())
            .filter(|&i| creates[i].plan.eviction.is_some())
            .collect();
        let removals: Vec<MutateOperation> = evicting
            .iter()
            .filter_map(|&i| creates[i].plan.eviction.as_ref())
            .map(|e| MutateOperation::RemoveAd {
                ad_resource: e.ad_resource.clone(),
            })
            .collect();
        let removal_results = self.batcher.execute(customer_id, &removals).await?.results;

        let mut blocked: HashSet<usize> = HashSet::new();
        let mut stale_labels: Vec<(String, String)> = Vec::new();
        for (&index, result) in evicting.iter().zip(removal_results) {
            let planned = &creates[index];
            let Some(eviction) = planned.plan.eviction.as_ref() else {
                continue;
            };
            match result {
                Ok(_) => {
                    let group = cache.group_mut(&planned.group);
                    group.live_ads.retain(|ad| ad.resource != eviction.ad_resource);
                    if let Some(label) = &eviction.stale_done_label {
                        group.labels.remove(label);
                        stale_labels.push((planned.group.clone(), label.clone()));
                    }
                }
                Err(error) => {
                    blocked.insert(index);
                    updates.push(ItemUpdate::failed(
                        planned.item.id,
                        format!("eviction of {} failed: {error}", eviction.ad_resource),
                    ));
                }
            }
        }
        for ((group, label), result) in stale_labels.iter().zip(reconciler.remove_group_labels(&stale_labels).await?) {
            if let Err(error) = result {
                tracing::warn!(customer_id, group = %group, label = %label, %error, "Failed to remove stale done label");
            }
        }

        let to_create: Vec<usize> = (0..creates.len()).filter(|i| !blocked.contains(i)).collect();
        let create_ops: Vec<MutateOperation> = to_create
            .iter()
            .map(|&i| MutateOperation::CreateAd {
                group_resource: creates[i].group.clone(),
                status: AdStatus::Paused,
                content: creates[i].plan.content.clone(),
            })
            .collect();
        let create_results = self.batcher.execute(customer_id, &create_ops).await?.results;

        // A created ad takes a slot whether or not its marker sticks.
        let mut created: Vec<(usize, String)> = Vec::new();
        for (&index, result) in to_create.iter().zip(create_results) {
            match result {
                Ok(resource) => {
                    let planned = &creates[index];
                    cache.group_mut(&planned.group).live_ads.push(RemoteAd {
                        resource: resource.clone(),
                        group_resource: planned.group.clone(),
                        status: AdStatus::Paused,
                        content: planned.plan.content.clone(),
                        labels: BTreeSet::new(),
                    });
                    created.push((index, resource));
                }
                Err(error) => updates.push(ItemUpdate::failed(
                    creates[index].item.id,
                    format!("ad creation failed: {error}"),
                )),
            }
        }

        let marker_pairs: Vec<(String, String)> = created
            .iter()
            .map(|(index, resource)| (resource.clone(), creates[*index].variant.marker_label.clone()))
            .collect();
        let marker_results = reconciler.attach_markers(&marker_pairs).await?;

        let mut done_targets: Vec<(&WorkItem, String, String, String)> = Vec::new();
        for ((index, resource), result) in created.iter().zip(marker_results) {
            let planned = &creates[*index];
            match result {
                Ok(_) => {
                    if let Some(ad) = cache
                        .group_mut(&planned.group)
                        .live_ads
                        .iter_mut()
                        .find(|ad| &ad.resource == resource)
                    {
                        ad.labels.insert(planned.variant.marker_label.clone());
                    }
                    done_targets.push((
                        planned.item,
                        planned.group.clone(),
                        planned.variant.done_label.clone(),
                        resource.clone(),
                    ));
                }
                Err(error) => updates.push(ItemUpdate::failed(
                    planned.item.id,
                    format!("ad {resource} created but marker label failed: {error}"),
                )),
            }
        }

        let created_count = done_targets.len();
        for (item, variant, group, ad_resource) in existing {
            done_targets.push((item, group, variant.done_label.clone(), ad_resource));
        }

        let done_pairs: Vec<(String, String)> = done_targets
            .iter()
            .map(|(_, group, label, _)| (group.clone(), label.clone()))
            .collect();
        let done_results = reconciler.attach_group_labels(&done_pairs).await?;

        for (position, ((item, group, label, ad_resource), result)) in
            done_targets.into_iter().zip(done_results).enumerate()
        {
            match result {
                Ok(_) => {
                    cache.group_mut(&group).labels.insert(label);
                    updates.push(ItemUpdate::successful(item.id, ad_resource));
                }
                // the marker ad exists, so a rerun only needs to attach the label
                Err(error) if position < created_count => {
                    tracing::warn!(customer_id, group = %group, label = %label, %error, "Failed to attach done label");
                    updates.push(ItemUpdate::successful(item.id, ad_resource));
                }
                Err(error) => updates.push(ItemUpdate::failed(
                    item.id,
                    format!("done label {label} failed: {error}"),
                )),
            }
        }

        Ok(updates)
    }
}
