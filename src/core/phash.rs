use image_hasher::{HashAlg, HasherConfig};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PhashError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("invalid hex hash: {0}")]
    InvalidHex(String),
}

/// Sample-grid resolution for hash computation. Higher quality produces
/// longer hashes that discriminate finer detail at higher compute cost.
///
/// The default is `Low` (8x8, 64 bits) so the default clustering threshold
/// of 10 bits keeps its documented meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HashQuality {
    #[default]
    Low,
    Medium,
    High,
}

impl HashQuality {
    pub fn grid_size(self) -> u32 {
        match self {
            HashQuality::Low => 8,
            HashQuality::Medium => 16,
            HashQuality::High => 32,
        }
    }
}

/// Fixed-length visual fingerprint of an image. Visually similar images
/// produce hashes with small Hamming distance; distinct images differ in
/// roughly half their bits.
///
/// Serialized as a hex string both in the cache and in JSON payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PerceptualHash {
    bits: Vec<u8>,
}

impl PerceptualHash {
    pub fn from_bytes(bits: Vec<u8>) -> Self {
        Self { bits }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn bit_len(&self) -> usize {
        self.bits.len() * 8
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(self.bits.len() * 2);
        for byte in &self.bits {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    pub fn from_hex(hex: &str) -> Result<Self, PhashError> {
        if hex.is_empty() || hex.len() % 2 != 0 {
            return Err(PhashError::InvalidHex(hex.to_string()));
        }
        let mut bits = Vec::with_capacity(hex.len() / 2);
        for chunk in hex.as_bytes().chunks(2) {
            let pair = std::str::from_utf8(chunk)
                .map_err(|_| PhashError::InvalidHex(hex.to_string()))?;
            let byte = u8::from_str_radix(pair, 16)
                .map_err(|_| PhashError::InvalidHex(hex.to_string()))?;
            bits.push(byte);
        }
        Ok(Self { bits })
    }

    /// Bit-wise Hamming distance. Hashes of different lengths are never
    /// comparable and return `u32::MAX` rather than panicking.
    pub fn dist(&self, other: &PerceptualHash) -> u32 {
        if self.bits.len() != other.bits.len() {
            return u32::MAX;
        }
        self.bits
            .iter()
            .zip(&other.bits)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

impl Serialize for PerceptualHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PerceptualHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        PerceptualHash::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// Decode raw image bytes and compute a gradient perceptual hash.
///
/// The gradient (dHash) scheme compares adjacent luminance samples on a
/// downscaled grid, which is robust against recompression and resizing
/// while distinct images diverge in roughly half their bits.
pub fn compute_hash(bytes: &[u8], quality: HashQuality) -> Result<PerceptualHash, PhashError> {
    let img = image::load_from_memory(bytes)?;
    Ok(hash_image(&img, quality))
}

pub fn hash_image(img: &image::DynamicImage, quality: HashQuality) -> PerceptualHash {
    let size = quality.grid_size();
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Gradient)
        .hash_size(size, size)
        .to_hasher();
    PerceptualHash::from_bytes(hasher.hash_image(img).as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageBuffer, Luma};
    use std::io::Cursor;

    fn horizontal_ramp(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(ImageBuffer::from_fn(w, h, |x, _| {
            Luma([(x * 255 / w) as u8])
        }))
    }

    fn vertical_ramp(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(ImageBuffer::from_fn(w, h, |_, y| {
            Luma([(y * 255 / h) as u8])
        }))
    }

    fn png_bytes(img: &DynamicImage) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn identical_bytes_produce_identical_hash() {
        let bytes = png_bytes(&horizontal_ramp(64, 64));
        let h1 = compute_hash(&bytes, HashQuality::Low).unwrap();
        let h2 = compute_hash(&bytes, HashQuality::Low).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.dist(&h2), 0);
        assert_eq!(h1.bit_len(), 64);
    }

    #[test]
    fn resized_image_stays_within_threshold() {
        let original = horizontal_ramp(64, 64);
        let resized = original.resize_exact(32, 32, image::imageops::FilterType::Triangle);
        let h1 = hash_image(&original, HashQuality::Low);
        let h2 = hash_image(&resized, HashQuality::Low);
        assert!(h1.dist(&h2) <= 10, "distance {} too large", h1.dist(&h2));
    }

    #[test]
    fn distinct_images_diverge() {
        let h1 = hash_image(&horizontal_ramp(64, 64), HashQuality::Low);
        let h2 = hash_image(&vertical_ramp(64, 64), HashQuality::Low);
        assert!(h1.dist(&h2) > 10, "distance {} too small", h1.dist(&h2));
    }

    #[test]
    fn garbage_bytes_are_a_decode_error() {
        let err = compute_hash(b"definitely not an image", HashQuality::Low);
        assert!(matches!(err, Err(PhashError::Decode(_))));
    }

    #[test]
    fn hex_round_trip() {
        let hash = PerceptualHash::from_bytes(vec![0x00, 0xff, 0x3c, 0xa5]);
        let hex = hash.to_hex();
        assert_eq!(hex, "00ff3ca5");
        assert_eq!(PerceptualHash::from_hex(&hex).unwrap(), hash);
    }

    #[test]
    fn invalid_hex_is_rejected() {
        assert!(PerceptualHash::from_hex("").is_err());
        assert!(PerceptualHash::from_hex("abc").is_err());
        assert!(PerceptualHash::from_hex("zz").is_err());
    }

    #[test]
    fn mismatched_lengths_never_compare() {
        let a = PerceptualHash::from_bytes(vec![0; 8]);
        let b = PerceptualHash::from_bytes(vec![0; 32]);
        assert_eq!(a.dist(&b), u32::MAX);
    }

    #[test]
    fn serde_round_trips_as_hex_string() {
        let hash = PerceptualHash::from_bytes(vec![0xde, 0xad, 0xbe, 0xef]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, "\"deadbeef\"");
        let back: PerceptualHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn quality_levels_change_hash_length() {
        let img = horizontal_ramp(64, 64);
        assert_eq!(hash_image(&img, HashQuality::Low).bit_len(), 64);
        assert_eq!(hash_image(&img, HashQuality::Medium).bit_len(), 256);
        assert_eq!(hash_image(&img, HashQuality::High).bit_len(), 1024);
    }
}
