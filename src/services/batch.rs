//! Chunked batch driver for hash computation.
//!
//! Splits the URL list into sequential chunks to bound peak concurrency and
//! memory, runs items within a chunk in parallel on the worker pool, and
//! reports monotonically increasing progress that reaches the total exactly
//! once even when individual items fail.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;

use crate::cache::{CacheStats, CacheStatus, HashCache};
use crate::core::phash::{HashQuality, PerceptualHash};
use crate::services::worker::HashComputeWorkerPool;

const DEFAULT_BATCH_SIZE: usize = 20;

/// Fired once per completed item, cache hits included. `url` names the item
/// that just finished, which is not necessarily the `processed`-th input:
/// cache hits complete before any computation starts.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub processed: usize,
    pub total: usize,
    pub url: String,
}

pub type ProgressFn = dyn Fn(BatchProgress) + Send + Sync;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch size must be greater than zero")]
    InvalidBatchSize,

    #[error("batch processing cancelled")]
    Cancelled,
}

#[derive(Clone)]
pub struct BatchHashOptions {
    pub use_cache: bool,
    pub batch_size: usize,
    pub quality: HashQuality,
    pub on_progress: Option<Arc<ProgressFn>>,
}

impl Default for BatchHashOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            batch_size: DEFAULT_BATCH_SIZE,
            quality: HashQuality::default(),
            on_progress: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchHashResult {
    pub url: String,
    pub hash: Option<PerceptualHash>,
    pub cached: bool,
    pub error: Option<String>,
}

pub struct BatchHashService {
    cache: Arc<HashCache>,
    pool: Arc<HashComputeWorkerPool>,
    cancelled: Arc<AtomicBool>,
}

impl BatchHashService {
    pub fn new(cache: Arc<HashCache>, pool: Arc<HashComputeWorkerPool>) -> Self {
        Self {
            cache,
            pool,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Token checked at chunk boundaries; in-flight items within a chunk
    /// run to completion.
    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Compute hashes for `urls`. Results come back in input order; per-URL
    /// failures set the `error` field and never abort the batch. Successful
    /// results are written back to the hash cache before returning.
    pub async fn calculate_batch_hashes(
        &self,
        urls: &[String],
        options: &BatchHashOptions,
    ) -> Result<Vec<BatchHashResult>, BatchError> {
        if options.batch_size == 0 {
            return Err(BatchError::InvalidBatchSize);
        }
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(BatchError::Cancelled);
        }

        let total = urls.len();
        let report = |processed: usize, url: &str| {
            if let Some(cb) = &options.on_progress {
                cb(BatchProgress {
                    processed,
                    total,
                    url: url.to_string(),
                });
            }
        };

        let mut results: Vec<BatchHashResult> = urls
            .iter()
            .map(|url| BatchHashResult {
                url: url.clone(),
                hash: None,
                cached: false,
                error: None,
            })
            .collect();

        // Cache fast path: no worker dispatch for fresh entries.
        let mut processed = 0usize;
        let mut pending: Vec<(usize, String)> = Vec::new();
        for (idx, url) in urls.iter().enumerate() {
            if options.use_cache {
                if let Some(hash) = self.cache.get(url, options.quality) {
                    results[idx].hash = Some(hash);
                    results[idx].cached = true;
                    processed += 1;
                    report(processed, url);
                    continue;
                }
            }
            pending.push((idx, url.clone()));
        }

        log::debug!(
            "batch of {} urls: {} cached, {} to compute",
            total,
            processed,
            pending.len()
        );

        for chunk in pending.chunks(options.batch_size) {
            if self.cancelled.load(Ordering::Relaxed) {
                return Err(BatchError::Cancelled);
            }

            let futures = chunk.iter().map(|(idx, url)| {
                let pool = Arc::clone(&self.pool);
                let quality = options.quality;
                async move { (*idx, pool.compute_hash(url, quality).await) }
            });

            for (idx, outcome) in join_all(futures).await {
                match outcome {
                    Ok(hash) => {
                        self.cache.put(&results[idx].url, options.quality, &hash);
                        results[idx].hash = Some(hash);
                    }
                    Err(e) => {
                        log::warn!("hash computation failed: {}", e);
                        results[idx].error = Some(e.to_string());
                    }
                }
                processed += 1;
                report(processed, &results[idx].url);
            }
        }

        Ok(results)
    }

    pub fn check_cache_status(&self, urls: &[String], quality: HashQuality) -> CacheStatus {
        self.cache.check_status(urls, quality)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
