//! Persistent two-tier cache for perceptual hashes and fetched image bytes.
//!
//! Backed by two sled trees: one mapping URL digests to serialized
//! [`HashCacheEntry`] values, one holding raw image bytes. Cache failures are
//! logged and reported as misses; duplicate detection never depends on the
//! cache being available.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::phash::{HashQuality, PerceptualHash};

/// Entries older than this are treated as misses and evicted on read.
const MAX_ENTRY_AGE_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("cache entry serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashCacheEntry {
    pub key: String,
    pub hash: PerceptualHash,
    pub computed_at: i64,
    pub image_cached: bool,
}

/// Pre-flight report of how much of a batch is already cached, used to
/// estimate network/CPU cost before starting work.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStatus {
    pub total: usize,
    pub cached_images: usize,
    pub cached_hashes: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

pub struct HashCache {
    db: sled::Db,
    hashes: sled::Tree,
    images: sled::Tree,
    hits: AtomicU64,
    misses: AtomicU64,
    max_entry_age_secs: i64,
}

impl HashCache {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        Self::open_with_max_age(path, MAX_ENTRY_AGE_SECS)
    }

    pub fn open_with_max_age<P: AsRef<Path>>(
        path: P,
        max_entry_age_secs: i64,
    ) -> Result<Self, CacheError> {
        let db = sled::open(path)?;
        let hashes = db.open_tree("hashes")?;
        let images = db.open_tree("images")?;
        Ok(Self {
            db,
            hashes,
            images,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            max_entry_age_secs,
        })
    }

    fn cache_key(url: &str) -> String {
        format!("{:x}", Sha256::digest(url.as_bytes()))
    }

    /// Hash entries are keyed by URL and sample-grid size, so a cache warmed
    /// at one quality never answers a request at another. Entries computed at
    /// different qualities coexist.
    fn hash_key(url: &str, quality: HashQuality) -> String {
        let grid = quality.grid_size();
        format!("{:x}", Sha256::digest(format!("{}:{}", grid, url).as_bytes()))
    }

    /// Look up a hash previously computed at `quality`. Stale and corrupt
    /// entries are evicted and count as misses; storage failures are logged,
    /// never propagated.
    pub fn get(&self, url: &str, quality: HashQuality) -> Option<PerceptualHash> {
        match self.try_get(url, quality) {
            Ok(Some(hash)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(hash)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                log::warn!("hash cache read failed for {}: {}", url, e);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn try_get(
        &self,
        url: &str,
        quality: HashQuality,
    ) -> Result<Option<PerceptualHash>, CacheError> {
        let key = Self::hash_key(url, quality);
        let Some(raw) = self.hashes.get(&key)? else {
            return Ok(None);
        };
        let entry: HashCacheEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("evicting corrupt cache entry for {}: {}", url, e);
                self.hashes.remove(&key)?;
                return Ok(None);
            }
        };
        if Utc::now().timestamp() - entry.computed_at >= self.max_entry_age_secs {
            self.hashes.remove(&key)?;
            return Ok(None);
        }
        Ok(Some(entry.hash))
    }

    /// Unconditional upsert. A re-computation always overwrites the prior
    /// entry at the same quality.
    pub fn put(&self, url: &str, quality: HashQuality, hash: &PerceptualHash) {
        if let Err(e) = self.try_put(url, quality, hash) {
            log::warn!("hash cache write failed for {}: {}", url, e);
        }
    }

    fn try_put(
        &self,
        url: &str,
        quality: HashQuality,
        hash: &PerceptualHash,
    ) -> Result<(), CacheError> {
        let entry = HashCacheEntry {
            key: url.to_string(),
            hash: hash.clone(),
            computed_at: Utc::now().timestamp(),
            image_cached: self.images.contains_key(Self::cache_key(url))?,
        };
        self.hashes
            .insert(Self::hash_key(url, quality), serde_json::to_vec(&entry)?)?;
        Ok(())
    }

    pub fn get_image(&self, url: &str) -> Option<Vec<u8>> {
        match self.images.get(Self::cache_key(url)) {
            Ok(bytes) => bytes.map(|b| b.to_vec()),
            Err(e) => {
                log::warn!("image cache read failed for {}: {}", url, e);
                None
            }
        }
    }

    pub fn put_image(&self, url: &str, bytes: &[u8]) {
        if let Err(e) = self.images.insert(Self::cache_key(url), bytes) {
            log::warn!("image cache write failed for {}: {}", url, e);
        }
    }

    /// Report which of `urls` already have cached images and hashes at
    /// `quality` without fetching anything. Does not touch the hit/miss
    /// counters.
    pub fn check_status(&self, urls: &[String], quality: HashQuality) -> CacheStatus {
        let mut cached_images = 0;
        let mut cached_hashes = 0;
        for url in urls {
            if self
                .images
                .contains_key(Self::cache_key(url))
                .unwrap_or(false)
            {
                cached_images += 1;
            }
            if self
                .hashes
                .contains_key(Self::hash_key(url, quality))
                .unwrap_or(false)
            {
                cached_hashes += 1;
            }
        }
        CacheStatus {
            total: urls.len(),
            cached_images,
            cached_hashes,
        }
    }

    /// Drop both tiers. Concurrent readers see old-or-absent values, never
    /// torn entries.
    pub fn clear(&self) {
        if let Err(e) = self.hashes.clear() {
            log::warn!("failed to clear hash cache tier: {}", e);
        }
        if let Err(e) = self.images.clear() {
            log::warn!("failed to clear image cache tier: {}", e);
        }
    }

    /// Flush dirty buffers to disk.
    pub fn flush(&self) {
        if let Err(e) = self.db.flush() {
            log::warn!("cache flush failed: {}", e);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.hashes.len(),
        }
    }

    /// Seed a raw value at a URL's hash slot, bypassing serialization.
    #[cfg(test)]
    pub(crate) fn inject_raw_hash_entry(&self, url: &str, quality: HashQuality, raw: &[u8]) {
        self.hashes
            .insert(Self::hash_key(url, quality), raw)
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_cache(dir: &TempDir) -> HashCache {
        HashCache::open(dir.path().join("cache")).unwrap()
    }

    fn sample_hash() -> PerceptualHash {
        PerceptualHash::from_bytes(vec![0xab; 8])
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);

        assert!(cache
            .get("https://example.com/a.png", HashQuality::Low)
            .is_none());
        cache.put("https://example.com/a.png", HashQuality::Low, &sample_hash());
        assert_eq!(
            cache.get("https://example.com/a.png", HashQuality::Low),
            Some(sample_hash())
        );
    }

    #[test]
    fn put_overwrites_unconditionally() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);

        cache.put("u", HashQuality::Low, &sample_hash());
        let newer = PerceptualHash::from_bytes(vec![0x11; 8]);
        cache.put("u", HashQuality::Low, &newer);
        assert_eq!(cache.get("u", HashQuality::Low), Some(newer));
    }

    #[test]
    fn qualities_never_share_entries() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);

        cache.put("u", HashQuality::Low, &sample_hash());
        assert!(cache.get("u", HashQuality::High).is_none());

        let high = PerceptualHash::from_bytes(vec![0x5c; 128]);
        cache.put("u", HashQuality::High, &high);
        assert_eq!(cache.get("u", HashQuality::Low), Some(sample_hash()));
        assert_eq!(cache.get("u", HashQuality::High), Some(high));
    }

    #[test]
    fn stale_entries_are_evicted_on_read() {
        let dir = TempDir::new().unwrap();
        let cache = HashCache::open_with_max_age(dir.path().join("cache"), 0).unwrap();

        cache.put("u", HashQuality::Low, &sample_hash());
        assert!(cache.get("u", HashQuality::Low).is_none());
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn image_tier_round_trips() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);

        assert!(cache.get_image("u").is_none());
        cache.put_image("u", b"png bytes");
        assert_eq!(cache.get_image("u"), Some(b"png bytes".to_vec()));
    }

    #[test]
    fn check_status_counts_both_tiers() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);

        cache.put("a", HashQuality::Low, &sample_hash());
        cache.put_image("b", b"bytes");
        cache.put("c", HashQuality::Low, &sample_hash());
        cache.put_image("c", b"bytes");

        let urls: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let status = cache.check_status(&urls, HashQuality::Low);
        assert_eq!(status.total, 4);
        assert_eq!(status.cached_images, 2);
        assert_eq!(status.cached_hashes, 2);

        // A hash cached at Low is not a cached hash for a High scan
        assert_eq!(cache.check_status(&urls, HashQuality::High).cached_hashes, 0);
    }

    #[test]
    fn clear_drops_both_tiers() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);

        cache.put("a", HashQuality::Low, &sample_hash());
        cache.put_image("a", b"bytes");
        cache.clear();

        assert!(cache.get("a", HashQuality::Low).is_none());
        assert!(cache.get_image("a").is_none());
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);

        cache.get("missing", HashQuality::Low);
        cache.put("a", HashQuality::Low, &sample_hash());
        cache.get("a", HashQuality::Low);
        cache.get("a", HashQuality::Low);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn corrupt_entry_is_a_miss_not_a_crash() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);

        // Write garbage directly at the key's slot
        cache.inject_raw_hash_entry("u", HashQuality::Low, b"not json");
        assert!(cache.get("u", HashQuality::Low).is_none());
    }
}
