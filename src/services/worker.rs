//! Bounded worker pool for hash computation.
//!
//! Tasks flow in over an mpsc queue and results flow back over per-task
//! oneshot channels; workers share nothing else. Fetching is async with a
//! per-item timeout, decoding and hashing run on the blocking thread pool.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell};

use crate::cache::HashCache;
use crate::core::phash::{self, HashQuality, PerceptualHash};
use crate::services::fetch::ImageFetcher;

/// Hard cap on worker count to avoid oversubscription on constrained
/// devices.
const MAX_WORKERS: usize = 8;

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum HashError {
    #[error("fetch failed for {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("fetch timed out for {url}")]
    Timeout { url: String },

    #[error("decode failed for {url}: {message}")]
    Decode { url: String, message: String },

    #[error("worker pool unavailable")]
    PoolUnavailable,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub fetch_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().min(MAX_WORKERS),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

struct HashTask {
    url: String,
    quality: HashQuality,
    reply: oneshot::Sender<Result<PerceptualHash, HashError>>,
}

pub struct HashComputeWorkerPool {
    config: PoolConfig,
    cache: Arc<HashCache>,
    fetcher: Arc<dyn ImageFetcher>,
    queue: OnceCell<mpsc::Sender<HashTask>>,
}

impl HashComputeWorkerPool {
    pub fn new(cache: Arc<HashCache>, fetcher: Arc<dyn ImageFetcher>, config: PoolConfig) -> Self {
        Self {
            config,
            cache,
            fetcher,
            queue: OnceCell::new(),
        }
    }

    /// Spin up the workers. Idempotent: a second call is a no-op.
    pub async fn initialize(&self) {
        self.sender().await;
    }

    async fn sender(&self) -> &mpsc::Sender<HashTask> {
        self.queue
            .get_or_init(|| async {
                let workers = self.config.workers.max(1);
                let (tx, rx) = mpsc::channel::<HashTask>(workers * 2);
                let rx = Arc::new(Mutex::new(rx));
                for _ in 0..workers {
                    let rx = Arc::clone(&rx);
                    let cache = Arc::clone(&self.cache);
                    let fetcher = Arc::clone(&self.fetcher);
                    let timeout = self.config.fetch_timeout;
                    tokio::spawn(worker_loop(rx, cache, fetcher, timeout));
                }
                log::info!("started {} hash workers", workers);
                tx
            })
            .await
    }

    /// Fetch (or load from the image cache tier), decode and hash one URL.
    /// Every failure mode is a per-URL error; nothing panics past the
    /// worker.
    pub async fn compute_hash(
        &self,
        url: &str,
        quality: HashQuality,
    ) -> Result<PerceptualHash, HashError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let task = HashTask {
            url: url.to_string(),
            quality,
            reply: reply_tx,
        };
        self.sender()
            .await
            .send(task)
            .await
            .map_err(|_| HashError::PoolUnavailable)?;
        reply_rx.await.map_err(|_| HashError::PoolUnavailable)?
    }
}

async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<HashTask>>>,
    cache: Arc<HashCache>,
    fetcher: Arc<dyn ImageFetcher>,
    fetch_timeout: Duration,
) {
    loop {
        let task = { rx.lock().await.recv().await };
        let Some(task) = task else {
            break;
        };
        let result = process_task(&task, &cache, &fetcher, fetch_timeout).await;
        // Caller may have given up; dropping the result is fine.
        let _ = task.reply.send(result);
    }
}

async fn process_task(
    task: &HashTask,
    cache: &HashCache,
    fetcher: &Arc<dyn ImageFetcher>,
    fetch_timeout: Duration,
) -> Result<PerceptualHash, HashError> {
    let url = &task.url;

    let bytes = match cache.get_image(url) {
        Some(bytes) => bytes,
        None => {
            let fetched = tokio::time::timeout(fetch_timeout, fetcher.fetch(url))
                .await
                .map_err(|_| HashError::Timeout { url: url.clone() })?
                .map_err(|e| HashError::Fetch {
                    url: url.clone(),
                    message: e.to_string(),
                })?;
            cache.put_image(url, &fetched);
            fetched
        }
    };

    let quality = task.quality;
    let url_for_err = url.clone();
    tokio::task::spawn_blocking(move || {
        phash::compute_hash(&bytes, quality).map_err(|e| HashError::Decode {
            url: url_for_err,
            message: e.to_string(),
        })
    })
    .await
    .map_err(|_| HashError::PoolUnavailable)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fetch::FetchError;
    use crate::services::testutil::{test_png, StubFetcher};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn pool_with(
        dir: &TempDir,
        images: HashMap<String, Vec<u8>>,
    ) -> (HashComputeWorkerPool, Arc<StubFetcher>) {
        let cache = Arc::new(HashCache::open(dir.path().join("cache")).unwrap());
        let fetcher = Arc::new(StubFetcher::new(images));
        let pool = HashComputeWorkerPool::new(
            cache,
            Arc::clone(&fetcher) as Arc<dyn ImageFetcher>,
            PoolConfig::default(),
        );
        (pool, fetcher)
    }

    #[tokio::test]
    async fn computes_hash_for_fetched_image() {
        let dir = TempDir::new().unwrap();
        let mut images = HashMap::new();
        images.insert("u1".to_string(), test_png(3));
        let (pool, _) = pool_with(&dir, images);

        let hash = pool.compute_hash("u1", HashQuality::Low).await.unwrap();
        assert_eq!(hash.bit_len(), 64);
    }

    #[tokio::test]
    async fn second_compute_uses_image_cache_tier() {
        let dir = TempDir::new().unwrap();
        let mut images = HashMap::new();
        images.insert("u1".to_string(), test_png(3));
        let (pool, fetcher) = pool_with(&dir, images);

        let h1 = pool.compute_hash("u1", HashQuality::Low).await.unwrap();
        let h2 = pool.compute_hash("u1", HashQuality::Low).await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_failure_is_a_tagged_error() {
        let dir = TempDir::new().unwrap();
        let (pool, _) = pool_with(&dir, HashMap::new());

        let err = pool
            .compute_hash("missing", HashQuality::Low)
            .await
            .unwrap_err();
        assert!(matches!(err, HashError::Fetch { ref url, .. } if url == "missing"));
    }

    #[tokio::test]
    async fn undecodable_bytes_are_a_decode_error() {
        let dir = TempDir::new().unwrap();
        let mut images = HashMap::new();
        images.insert("bad".to_string(), b"not an image".to_vec());
        let (pool, _) = pool_with(&dir, images);

        let err = pool.compute_hash("bad", HashQuality::Low).await.unwrap_err();
        assert!(matches!(err, HashError::Decode { ref url, .. } if url == "bad"));
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut images = HashMap::new();
        images.insert("u1".to_string(), test_png(3));
        let (pool, _) = pool_with(&dir, images);

        pool.initialize().await;
        pool.initialize().await;
        assert!(pool.compute_hash("u1", HashQuality::Low).await.is_ok());
    }

    #[tokio::test]
    async fn stuck_fetch_times_out_per_item() {
        struct HangingFetcher;

        #[async_trait]
        impl ImageFetcher for HangingFetcher {
            async fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
                std::future::pending().await
            }
        }

        let dir = TempDir::new().unwrap();
        let cache = Arc::new(HashCache::open(dir.path().join("cache")).unwrap());
        let pool = HashComputeWorkerPool::new(
            cache,
            Arc::new(HangingFetcher),
            PoolConfig {
                workers: 2,
                fetch_timeout: Duration::from_millis(50),
            },
        );

        let err = pool
            .compute_hash("stuck", HashQuality::Low)
            .await
            .unwrap_err();
        assert!(matches!(err, HashError::Timeout { ref url } if url == "stuck"));
    }
}
