//! Chunked, rate-limited execution of mutate operations.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::models::remote::{MutateOperation, OperationResult, SearchQuery, SearchRow};
use crate::services::ads_api::{AdsPlatform, ApiError, ErrorKind};
use crate::services::rate_limiter::{AdaptiveRateLimiter, Sleeper};
use crate::services::retry::{call_with_retry, RetryPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct BatcherSettings {
    /// Largest batch submitted in one call.
    pub chunk_size: usize,
    /// Smallest batch a too-large request is split down to.
    pub floor_size: usize,
    pub partial_failure: bool,
    /// Plan only: operations are answered locally and nothing is sent.
    pub dry_run: bool,
}

impl Default for BatcherSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            floor_size: 10,
            partial_failure: true,
            dry_run: false,
        }
    }
}

/// Per-operation results of one `execute` call, in submission order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub results: Vec<OperationResult>,
    pub batches: usize,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

/// The single gateway to the remote platform: reads go through the retry
/// policy, writes additionally through chunking and the shared rate limiter.
pub struct MutationBatcher {
    platform: Arc<dyn AdsPlatform>,
    limiter: Arc<AdaptiveRateLimiter>,
    sleeper: Arc<dyn Sleeper>,
    retry: RetryPolicy,
    settings: BatcherSettings,
}

impl MutationBatcher {
    pub fn new(
        platform: Arc<dyn AdsPlatform>,
        limiter: Arc<AdaptiveRateLimiter>,
        sleeper: Arc<dyn Sleeper>,
        retry: RetryPolicy,
        settings: BatcherSettings,
    ) -> Self {
        Self {
            platform,
            limiter,
            sleeper,
            retry,
            settings,
        }
    }

    pub fn limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }

    pub async fn search(
        &self,
        customer_id: &str,
        query: &SearchQuery,
    ) -> Result<Vec<SearchRow>, ApiError> {
        let platform = &self.platform;
        call_with_retry(query.kind(), &self.retry, self.sleeper.as_ref(), move || {
            platform.search(customer_id, query)
        })
        .await
    }

    /// Submit `operations` and return one result per operation, in order.
    ///
    /// Only a fatal error is returned as `Err`; every other failure is
    /// recorded against the operations of the affected batch.
    pub async fn execute(
        &self,
        customer_id: &str,
        operations: &[MutateOperation],
    ) -> Result<BatchOutcome, ApiError> {
        let mut outcome = BatchOutcome {
            results: Vec::with_capacity(operations.len()),
            batches: 0,
        };
        if operations.is_empty() {
            return Ok(outcome);
        }

        if self.settings.dry_run {
            outcome.results = operations
                .iter()
                .enumerate()
                .map(|(i, op)| Ok(format!("dry_run/{}/{}", op.kind(), i)))
                .collect();
            return Ok(outcome);
        }

        let chunk_size = self.settings.chunk_size.max(1);
        let mut queue: VecDeque<&[MutateOperation]> = operations.chunks(chunk_size).collect();

        while let Some(batch) = queue.pop_front() {
            if outcome.batches > 0 {
                self.sleeper.sleep(self.limiter.current_delay()).await;
            }
            outcome.batches += 1;

            match self.submit(customer_id, batch).await {
                Ok(results) => {
                    let failed = results.iter().filter(|r| r.is_err()).count();
                    if failed == results.len() {
                        self.limiter.on_error();
                        metrics::counter!("mutation_batches_total", "outcome" => "failed").increment(1);
                    } else {
                        self.limiter.on_success();
                        let label = if failed == 0 { "ok" } else { "partial" };
                        metrics::counter!("mutation_batches_total", "outcome" => label).increment(1);
                    }
                    tracing::debug!(
                        customer_id,
                        batch = outcome.batches,
                        size = batch.len(),
                        failed,
                        "Mutate batch finished"
                    );
                    record_operations(&results);
                    outcome.results.extend(results);
                }
                Err(err) if err.kind == ErrorKind::RequestTooLarge && batch.len() > self.settings.floor_size => {
                    let (head, tail) = batch.split_at(batch.len() / 2);
                    tracing::warn!(
                        customer_id,
                        size = batch.len(),
                        halves = ?(head.len(), tail.len()),
                        "Batch too large, splitting"
                    );
                    queue.push_front(tail);
                    queue.push_front(head);
                }
                Err(err) if err.kind == ErrorKind::Fatal => {
                    metrics::counter!("mutation_batches_total", "outcome" => "fatal").increment(1);
                    return Err(err);
                }
                Err(err) => {
                    self.limiter.on_error();
                    metrics::counter!("mutation_batches_total", "outcome" => "failed").increment(1);
                    tracing::warn!(customer_id, size = batch.len(), error = %err, "Mutate batch failed");
                    let results: Vec<OperationResult> =
                        batch.iter().map(|_| Err(err.message.clone())).collect();
                    record_operations(&results);
                    outcome.results.extend(results);
                }
            }
        }

        tracing::info!(
            customer_id,
            operations = operations.len(),
            batches = outcome.batches,
            succeeded = outcome.succeeded(),
            failed = outcome.failed(),
            "Mutations executed"
        );
        Ok(outcome)
    }

    async fn submit(
        &self,
        customer_id: &str,
        batch: &[MutateOperation],
    ) -> Result<Vec<OperationResult>, ApiError> {
        let platform = &self.platform;
        let partial = self.settings.partial_failure;
        let response = call_with_retry("mutate", &self.retry, self.sleeper.as_ref(), move || {
            platform.mutate(customer_id, batch, partial)
        })
        .await?;

        let mut results = response.results;
        results.truncate(batch.len());
        while results.len() < batch.len() {
            results.push(Err("no result returned for operation".to_string()));
        }
        Ok(results)
    }
}

fn record_operations(results: &[OperationResult]) {
    let failed = results.iter().filter(|r| r.is_err()).count() as u64;
    let succeeded = results.len() as u64 - failed;
    metrics::counter!("mutation_operations_total", "outcome" => "succeeded").increment(succeeded);
    metrics::counter!("mutation_operations_total", "outcome" => "failed").increment(failed);
}
