//! Near-duplicate detection core for large emoji/sticker collections.
//!
//! Given thousands of images referenced by URL, this crate identifies
//! clusters of visually near-identical images (re-uploads, resizes,
//! re-encodes) without an O(n^2) pixel comparison: perceptual hashes are
//! computed by a bounded worker pool backed by a persistent two-tier cache,
//! then clustered with hash bucketing and Union-Find. The caller can delete
//! the duplicates or reference-merge them onto a canonical item.

pub mod cache;
pub mod core;
pub mod model;
pub mod services;

pub use cache::{CacheError, CacheStats, CacheStatus, HashCache};
pub use crate::core::cluster::{find_duplicate_clusters, UnionFind};
pub use crate::core::phash::{compute_hash, HashQuality, PerceptualHash, PhashError};
pub use model::{DuplicateItem, Emoji, EmojiGroup, FAVORITES_GROUP_ID};
pub use services::batch::{
    BatchError, BatchHashOptions, BatchHashResult, BatchHashService, BatchProgress,
};
pub use services::detector::{
    attach_hashes, DetectionError, DetectionOptions, DetectionProgress, DuplicateDetectionService,
};
pub use services::fetch::{FetchError, HttpFetcher, ImageFetcher};
pub use services::worker::{HashComputeWorkerPool, HashError, PoolConfig};
