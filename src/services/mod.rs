pub mod batch;
pub mod detector;
pub mod fetch;
pub mod worker;

pub use batch::{BatchHashOptions, BatchHashResult, BatchHashService, BatchProgress};
pub use detector::{DetectionOptions, DetectionProgress, DuplicateDetectionService};
pub use fetch::{FetchError, HttpFetcher, ImageFetcher};
pub use worker::{HashComputeWorkerPool, HashError, PoolConfig};
