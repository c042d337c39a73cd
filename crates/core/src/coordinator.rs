//! Read-modify-write retry loop over the tracked file store.

use crate::config::{BulkConfig, RetryConfig};
use crate::error::LifecycleError;
use crate::resolver::ConcurrencyResolver;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use storage::models::TrackedFile;
use storage::{LogStore, StoreError, TrackedFileStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct BulkUpdateError {
    pub file_hash: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkUpdateResult {
    pub successful_updates: usize,
    pub failed_updates: usize,
    pub errors: Vec<BulkUpdateError>,
    /// Set when the token fired before every hash was visited.
    pub cancelled: bool,
}

pub struct TransactionalUpdateCoordinator {
    files: Arc<dyn TrackedFileStore>,
    resolver: ConcurrencyResolver,
    retry: RetryConfig,
    bulk: BulkConfig,
}

impl TransactionalUpdateCoordinator {
    pub fn new(files: Arc<dyn TrackedFileStore>, logs: Arc<dyn LogStore>) -> Self {
        Self {
            files,
            resolver: ConcurrencyResolver::new(logs),
            retry: RetryConfig::default(),
            bulk: BulkConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_bulk(mut self, bulk: BulkConfig) -> Self {
        self.bulk = bulk;
        self
    }

    pub fn files(&self) -> &Arc<dyn TrackedFileStore> {
        &self.files
    }

    /// Loads the row, applies `mutate` to a private copy, merges it with the
    /// latest persisted row and commits with an optimistic version check.
    ///
    /// An error returned by `mutate` aborts the update unchanged. Version
    /// conflicts and resolver failures are retried with linear backoff.
    pub async fn update_with_retry<F>(
        &self,
        hash: &str,
        mut mutate: F,
        label: &str,
    ) -> Result<TrackedFile, LifecycleError>
    where
        F: FnMut(&mut TrackedFile) -> Result<(), LifecycleError> + Send,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let current = self.load(hash).await?;
            let mut working = current.clone();
            mutate(&mut working)?;

            let latest = self.load(hash).await?;
            let merged = match self.resolver.resolve(&latest, &working).await {
                Ok(merged) => merged,
                Err(e) => {
                    warn!(file_hash = %hash, label, attempt, error = %e, "resolve failed");
                    last_error = e.to_string();
                    self.backoff(attempt, max_attempts).await;
                    continue;
                }
            };

            match self.files.update(&merged, latest.version).await {
                Ok(committed) => {
                    debug!(
                        file_hash = %hash,
                        label,
                        attempt,
                        version = committed.version,
                        status = %committed.status,
                        "update committed"
                    );
                    return Ok(committed);
                }
                Err(e) if e.is_conflict() || e.is_busy() => {
                    warn!(file_hash = %hash, label, attempt, error = %e, "update conflicted, retrying");
                    last_error = e.to_string();
                    self.backoff(attempt, max_attempts).await;
                }
                Err(StoreError::NotFound(h)) => return Err(LifecycleError::NotFound(h)),
                Err(e) => return Err(e.into()),
            }
        }

        error!(file_hash = %hash, label, attempts = max_attempts, %last_error, "update retries exhausted");
        Err(LifecycleError::RetriesExhausted {
            hash: hash.to_string(),
            label: label.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }

    /// Applies `mutate` to each hash in fixed-size batches. One file failing
    /// never aborts the run; cancellation is honoured between files and
    /// leaves already committed updates in place.
    pub async fn bulk_update<F>(
        &self,
        hashes: &[String],
        mutate: F,
        label: &str,
        cancel: &CancellationToken,
    ) -> BulkUpdateResult
    where
        F: Fn(&mut TrackedFile) -> Result<(), LifecycleError> + Send + Sync,
    {
        let batch_size = self.bulk.batch_size.max(1);
        let batch_delay = Duration::from_millis(self.bulk.batch_delay_ms);
        let mut result = BulkUpdateResult::default();
        let batch_count = hashes.len().div_ceil(batch_size);

        'batches: for (index, batch) in hashes.chunks(batch_size).enumerate() {
            for hash in batch {
                if cancel.is_cancelled() {
                    result.cancelled = true;
                    break 'batches;
                }
                match self.update_with_retry(hash, |f| mutate(f), label).await {
                    Ok(_) => result.successful_updates += 1,
                    Err(e) => {
                        debug!(file_hash = %hash, label, error = %e, "bulk item failed");
                        result.failed_updates += 1;
                        result.errors.push(BulkUpdateError {
                            file_hash: hash.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
            if index + 1 < batch_count && !batch_delay.is_zero() {
                tokio::time::sleep(batch_delay).await;
            }
        }

        info!(
            label,
            total = hashes.len(),
            successful = result.successful_updates,
            failed = result.failed_updates,
            cancelled = result.cancelled,
            "bulk update finished"
        );
        result
    }

    async fn load(&self, hash: &str) -> Result<TrackedFile, LifecycleError> {
        self.files
            .get_by_hash(hash)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(hash.to_string()))
    }

    async fn backoff(&self, attempt: u32, max_attempts: u32) {
        if attempt < max_attempts {
            tokio::time::sleep(self.retry.backoff(attempt)).await;
        }
    }
}
