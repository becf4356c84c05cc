use serde::{Deserialize, Serialize};

use crate::core::phash::PerceptualHash;

/// Synthetic aggregation group that mirrors emojis from other groups.
/// Never a candidate for duplicate detection.
pub const FAVORITES_GROUP_ID: &str = "favorites";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Emoji {
    pub id: String,
    pub name: String,
    pub url: String,
    /// Hash attached by a prior scan; emojis carrying one are not re-hashed.
    pub perceptual_hash: Option<PerceptualHash>,
    /// Set when this emoji was reference-merged onto a canonical one.
    pub reference_id: Option<String>,
}

impl Emoji {
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            perceptual_hash: None,
            reference_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmojiGroup {
    pub id: String,
    pub name: String,
    pub emojis: Vec<Emoji>,
}

impl EmojiGroup {
    pub fn new(id: impl Into<String>, name: impl Into<String>, emojis: Vec<Emoji>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            emojis,
        }
    }

    pub fn is_detection_candidate(&self) -> bool {
        self.id != FAVORITES_GROUP_ID
    }
}

/// One member of a duplicate cluster, enriched with group provenance.
/// The first item of a cluster is the canonical one to keep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateItem {
    pub emoji_id: String,
    pub emoji_name: String,
    pub url: String,
    pub group_id: String,
    pub group_name: String,
}
