use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Handle to one gallery image. `id` is stable across runs; `path` is
/// whatever the enumerator can resolve to readable bytes right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionQuality {
    pub score: u8,
    pub is_generic: bool,
}

/// Enumerates gallery images and tracks which have already been captioned.
pub trait GalleryStore: Send + Sync {
    fn has_full_access(&self) -> bool;
    fn detect_unprocessed_images(
        &self,
        exclude: &HashSet<String>,
        limit: usize,
    ) -> anyhow::Result<Vec<ImageRef>>;
    fn add_processed_image_id(&self, id: &str) -> anyhow::Result<()>;
    fn processed_image_ids(&self) -> anyhow::Result<HashSet<String>>;
    fn clear_processed_image_ids(&self) -> anyhow::Result<()>;
}

/// Creates new gallery assets from finished files.
pub trait GalleryWriter: Send + Sync {
    fn create_asset(&self, local_path: &Path) -> anyhow::Result<String>;
    fn add_asset_to_album(&self, asset_id: &str, album_id: &str) -> anyhow::Result<()>;
}

/// Reads whatever caption an image already carries in its metadata.
pub trait MetadataReader: Send + Sync {
    fn read_image_metadata(&self, path: &Path) -> anyhow::Result<Option<ImageMetadata>>;
}

/// Prefixes that mark a caption as boilerplate rather than descriptive.
pub const GENERIC_CAPTION_PREFIXES: &[&str] = &[
    "image of",
    "an image of",
    "photo of",
    "a photo of",
    "picture of",
    "a picture of",
    "screenshot of",
];

/// Concrete nouns and verbs a genuinely descriptive caption tends to use.
/// Deliberately small; one hit is enough for the scoring bonus.
pub const DESCRIPTIVE_VOCABULARY: &[&str] = &[
    "standing", "sitting", "holding", "wearing", "walking", "smiling", "playing", "looking",
    "person", "people", "group", "dog", "cat", "tree", "building", "table", "chair", "window",
    "street", "room", "water", "sky", "mountain", "beach", "grass", "food", "car", "sign",
    "light", "flower",
];

pub fn caption_word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

pub fn is_generic_caption(text: &str) -> bool {
    let normalized = text.trim().to_ascii_lowercase();
    GENERIC_CAPTION_PREFIXES
        .iter()
        .any(|prefix| normalized.starts_with(prefix))
}

fn has_descriptive_term(text: &str) -> bool {
    text.to_ascii_lowercase()
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .any(|word| DESCRIPTIVE_VOCABULARY.contains(&word))
}

/// Fixed 0..=100 heuristic shared by the resolution engine (confidence of a
/// fresh caption) and the scheduler (quality of an existing one), so skip
/// decisions and write decisions agree on what "good enough" means.
pub fn score_caption_text(text: &str) -> u8 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0;
    }
    let words = caption_word_count(trimmed);
    let mut score: u32 = 20;
    if words >= 3 {
        score += 20;
    }
    if words >= 5 {
        score += 15;
    }
    if words >= 10 {
        score += 15;
    }
    if has_descriptive_term(trimmed) {
        score += 15;
    }
    if !is_generic_caption(trimmed) {
        score += 15;
    }
    score.min(100) as u8
}

pub fn evaluate_caption_quality(text: &str) -> CaptionQuality {
    CaptionQuality {
        score: score_caption_text(text),
        is_generic: is_generic_caption(text),
    }
}
