pub mod cluster;
pub mod phash;

pub use cluster::{find_duplicate_clusters, UnionFind};
pub use phash::{compute_hash, hash_image, HashQuality, PerceptualHash, PhashError};
