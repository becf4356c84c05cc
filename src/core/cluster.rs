//! Hash-bucketed duplicate clustering.
//!
//! Items are grouped into buckets keyed by the high byte of their hash, so
//! pairwise Hamming comparison only runs within a bucket and across bucket
//! pairs whose signatures are themselves within the threshold. The signature
//! distance is a lower bound on the full distance, so the pruning can skip
//! work but never a true duplicate pair. Worst case (every hash in a single
//! bucket) degrades to O(n^2) comparisons.

use std::collections::HashMap;

use crate::core::phash::PerceptualHash;

/// Disjoint-set over item indices with union by rank and path compression.
/// Lives only for the duration of one clustering call.
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            // Path halving
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }
}

/// Partition `hashes` into clusters of indices whose pairwise Hamming
/// distance is transitively within `threshold` (inclusive).
///
/// Singletons are not reported; every returned cluster has at least two
/// members. Cluster order and member order follow first-seen input order,
/// so output is deterministic for a given input order and threshold.
pub fn find_duplicate_clusters(
    hashes: &[PerceptualHash],
    threshold: u32,
) -> Vec<Vec<usize>> {
    if hashes.len() < 2 {
        return Vec::new();
    }

    // Bucket by (hash length, high byte). Hashes of different lengths are
    // never comparable, so length is part of the key.
    let mut buckets: HashMap<(usize, u8), Vec<usize>> = HashMap::new();
    for (idx, hash) in hashes.iter().enumerate() {
        let bytes = hash.as_bytes();
        let signature = bytes.first().copied().unwrap_or(0);
        buckets.entry((bytes.len(), signature)).or_default().push(idx);
    }

    let mut keys: Vec<(usize, u8)> = buckets.keys().copied().collect();
    keys.sort_unstable();

    let mut uf = UnionFind::new(hashes.len());

    for (pos, &key) in keys.iter().enumerate() {
        let members = &buckets[&key];

        // All pairs within the bucket
        for i in 0..members.len() {
            for j in (i + 1)..members.len() {
                if hashes[members[i]].dist(&hashes[members[j]]) <= threshold {
                    uf.union(members[i], members[j]);
                }
            }
        }

        // Cross-bucket pairs: the signature distance lower-bounds the full
        // distance, so bucket pairs further apart than the threshold cannot
        // contain a duplicate pair.
        for &other_key in &keys[pos + 1..] {
            if key.0 != other_key.0 {
                continue;
            }
            if (key.1 ^ other_key.1).count_ones() > threshold {
                continue;
            }
            let others = &buckets[&other_key];
            for &i in members {
                for &j in others {
                    if hashes[i].dist(&hashes[j]) <= threshold {
                        uf.union(i, j);
                    }
                }
            }
        }
    }

    // Extract clusters in first-seen order of their roots.
    let mut cluster_of_root: HashMap<usize, usize> = HashMap::new();
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for idx in 0..hashes.len() {
        let root = uf.find(idx);
        let slot = *cluster_of_root.entry(root).or_insert_with(|| {
            clusters.push(Vec::new());
            clusters.len() - 1
        });
        clusters[slot].push(idx);
    }
    clusters.retain(|c| c.len() >= 2);
    clusters
}
