//! Cross-group duplicate detection orchestration.
//!
//! The only component aware of emoji groups: it walks the groups, skips
//! non-candidates, drives the batch hash service for un-hashed emojis, feeds
//! the resulting hashes into the clusterer and maps clusters back to domain
//! items with group provenance.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::cache::{CacheStats, HashCache};
use crate::core::cluster::find_duplicate_clusters;
use crate::core::phash::{HashQuality, PerceptualHash};
use crate::model::{DuplicateItem, EmojiGroup};
use crate::services::batch::{BatchError, BatchHashOptions, BatchHashService, BatchProgress};
use crate::services::fetch::ImageFetcher;
use crate::services::worker::{HashComputeWorkerPool, PoolConfig};

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("similarity threshold must be at least one bit")]
    InvalidThreshold,

    #[error("no groups to scan")]
    NoGroups,

    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// Domain-shaped progress record: overall counts plus which group and emoji
/// is currently being hashed, so a UI can show "item 7/40 in group X,
/// 120/900 overall".
#[derive(Debug, Clone, Serialize)]
pub struct DetectionProgress {
    pub total: usize,
    pub processed: usize,
    pub group: String,
    pub emoji_name: String,
    pub group_total: usize,
    pub group_processed: usize,
}

pub type DetectionProgressFn = dyn Fn(DetectionProgress) + Send + Sync;

#[derive(Clone)]
pub struct DetectionOptions {
    /// Max Hamming distance, in bits, for two hashes to count as the same
    /// image. Inclusive.
    pub similarity_threshold: u32,
    pub quality: HashQuality,
    pub on_progress: Option<Arc<DetectionProgressFn>>,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            similarity_threshold: 10,
            quality: HashQuality::default(),
            on_progress: None,
        }
    }
}

struct ProgressMeta {
    group: String,
    emoji_name: String,
    group_total: usize,
    group_processed: usize,
}

pub struct DuplicateDetectionService {
    cache: Arc<HashCache>,
    batch: BatchHashService,
}

impl DuplicateDetectionService {
    pub fn new(cache: Arc<HashCache>, fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self::with_pool_config(cache, fetcher, PoolConfig::default())
    }

    pub fn with_pool_config(
        cache: Arc<HashCache>,
        fetcher: Arc<dyn ImageFetcher>,
        config: PoolConfig,
    ) -> Self {
        let pool = Arc::new(HashComputeWorkerPool::new(
            Arc::clone(&cache),
            fetcher,
            config,
        ));
        let batch = BatchHashService::new(Arc::clone(&cache), pool);
        Self { cache, batch }
    }

    /// Token for cancelling an in-flight scan at the next chunk boundary.
    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.batch.cancellation_token()
    }

    /// Scan all candidate groups and return clusters of visually
    /// near-identical emojis, each cluster ordered with its canonical item
    /// first. Emojis whose images fail to fetch or decode are skipped for
    /// this run; only configuration errors reject the call.
    pub async fn find_duplicates_across_groups(
        &self,
        groups: &[EmojiGroup],
        options: &DetectionOptions,
    ) -> Result<Vec<Vec<DuplicateItem>>, DetectionError> {
        if options.similarity_threshold == 0 {
            return Err(DetectionError::InvalidThreshold);
        }
        if groups.is_empty() {
            return Err(DetectionError::NoGroups);
        }

        // Non-candidate groups are excluded up front so cache-status and
        // progress reflect only real work.
        let mut items: Vec<DuplicateItem> = Vec::new();
        let mut hashes: Vec<Option<PerceptualHash>> = Vec::new();
        let mut to_hash: Vec<String> = Vec::new();
        let mut url_indices: HashMap<String, Vec<usize>> = HashMap::new();
        let mut progress_meta: HashMap<String, ProgressMeta> = HashMap::new();

        for group in groups {
            if !group.is_detection_candidate() {
                continue;
            }
            let group_total = group.emojis.len();
            for (pos, emoji) in group.emojis.iter().enumerate() {
                let idx = items.len();
                items.push(DuplicateItem {
                    emoji_id: emoji.id.clone(),
                    emoji_name: emoji.name.clone(),
                    url: emoji.url.clone(),
                    group_id: group.id.clone(),
                    group_name: group.name.clone(),
                });
                hashes.push(emoji.perceptual_hash.clone());
                if emoji.perceptual_hash.is_none() && !emoji.url.is_empty() {
                    if !url_indices.contains_key(&emoji.url) {
                        to_hash.push(emoji.url.clone());
                        progress_meta.insert(
                            emoji.url.clone(),
                            ProgressMeta {
                                group: group.name.clone(),
                                emoji_name: emoji.name.clone(),
                                group_total,
                                group_processed: pos + 1,
                            },
                        );
                    }
                    url_indices.entry(emoji.url.clone()).or_default().push(idx);
                }
            }
        }

        let total = items.len();
        log::info!("processing {} emojis for duplicate detection", total);

        if !to_hash.is_empty() {
            let status = self.batch.check_cache_status(&to_hash, options.quality);
            log::info!(
                "cache status: {}/{} images cached, {}/{} hashes cached",
                status.cached_images,
                status.total,
                status.cached_hashes,
                status.total
            );

            let batch_options = BatchHashOptions {
                quality: options.quality,
                on_progress: options.on_progress.as_ref().map(|cb| {
                    let cb = Arc::clone(cb);
                    let meta = std::mem::take(&mut progress_meta);
                    Arc::new(move |p: BatchProgress| {
                        // Cache hits complete out of input order, so the
                        // completed URL, not the counter, names the item.
                        if let Some(m) = meta.get(&p.url) {
                            cb(DetectionProgress {
                                total,
                                processed: p.processed,
                                group: m.group.clone(),
                                emoji_name: m.emoji_name.clone(),
                                group_total: m.group_total,
                                group_processed: m.group_processed,
                            });
                        }
                    }) as Arc<crate::services::batch::ProgressFn>
                }),
                ..Default::default()
            };

            let results = self
                .batch
                .calculate_batch_hashes(&to_hash, &batch_options)
                .await?;

            let mut failed = 0usize;
            for result in &results {
                match &result.hash {
                    Some(hash) => {
                        if let Some(indices) = url_indices.get(&result.url) {
                            for &idx in indices {
                                hashes[idx] = Some(hash.clone());
                            }
                        }
                    }
                    None => failed += 1,
                }
            }
            if failed > 0 {
                log::warn!("{} images failed to hash and were skipped this run", failed);
            }
        }

        // Hash-bearing items only; the clusterer never sees the rest.
        let mut cluster_input: Vec<PerceptualHash> = Vec::new();
        let mut input_to_item: Vec<usize> = Vec::new();
        for (idx, hash) in hashes.iter().enumerate() {
            if let Some(hash) = hash {
                cluster_input.push(hash.clone());
                input_to_item.push(idx);
            }
        }

        let clusters = find_duplicate_clusters(&cluster_input, options.similarity_threshold);
        let result: Vec<Vec<DuplicateItem>> = clusters
            .into_iter()
            .map(|cluster| {
                cluster
                    .into_iter()
                    .map(|ci| items[input_to_item[ci]].clone())
                    .collect()
            })
            .collect();

        log::info!("found {} duplicate groups", result.len());
        Ok(result)
    }

    /// Keep the first (canonical) item of each cluster; delete every other
    /// member from its owning group or convert it into a reference pointing
    /// at the canonical item. Returns the number of non-canonical items
    /// processed.
    pub fn remove_duplicates_across_groups(
        &self,
        groups: &mut Vec<EmojiGroup>,
        clusters: &[Vec<DuplicateItem>],
        create_references: bool,
    ) -> usize {
        let mut removed = 0usize;

        for cluster in clusters {
            if cluster.len() < 2 {
                continue;
            }
            let canonical = &cluster[0];
            for duplicate in &cluster[1..] {
                let Some(group) = groups.iter_mut().find(|g| g.id == duplicate.group_id) else {
                    continue;
                };
                let Some(pos) = group
                    .emojis
                    .iter()
                    .position(|e| e.id == duplicate.emoji_id)
                else {
                    continue;
                };

                if create_references {
                    let emoji = &mut group.emojis[pos];
                    emoji.reference_id = Some(canonical.emoji_id.clone());
                    emoji.url = canonical.url.clone();
                } else {
                    group.emojis.remove(pos);
                }
                removed += 1;
            }
        }

        removed
    }

    /// Strip attached hashes so the next scan recomputes everything.
    pub fn clear_all_hashes(&self, groups: &mut [EmojiGroup]) {
        for group in groups {
            for emoji in &mut group.emojis {
                emoji.perceptual_hash = None;
            }
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_hash_cache(&self) {
        self.cache.clear();
    }
}

/// Attach freshly computed hashes back onto the domain model so later scans
/// skip them.
pub fn attach_hashes(groups: &mut [EmojiGroup], results: &[crate::services::batch::BatchHashResult]) {
    let by_url: HashMap<&str, &PerceptualHash> = results
        .iter()
        .filter_map(|r| r.hash.as_ref().map(|h| (r.url.as_str(), h)))
        .collect();
    for group in groups {
        for emoji in &mut group.emojis {
            if emoji.perceptual_hash.is_none() {
                if let Some(&hash) = by_url.get(emoji.url.as_str()) {
                    emoji.perceptual_hash = Some(hash.clone());
                }
            }
        }
    }
}
