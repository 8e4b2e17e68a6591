use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Outcome of one embedding call. The `wrote_*` flags record which
/// metadata standard was actually written, since that choice is
/// format-dependent (EXIF for JPEG, XMP for PNG).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    pub success: bool,
    pub asset_id: Option<String>,
    pub error: Option<String>,
    pub wrote_exif: bool,
    pub wrote_xmp: bool,
}

impl WriteResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EmbedOptions {
    /// When set, the untouched original is copied here before any write.
    pub backup_dir: Option<PathBuf>,
    /// When set, newly created assets are linked into this album.
    pub album_id: Option<String>,
}

/// One entry of a batch embedding request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedItem {
    pub source: PathBuf,
    pub caption: String,
    pub asset_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::WriteResult;

    #[test]
    fn failure_carries_error_and_no_flags() {
        let result = WriteResult::failure("Caption must not be empty");
        assert!(!result.success);
        assert!(!result.wrote_exif);
        assert!(!result.wrote_xmp);
        assert_eq!(result.asset_id, None);
        assert_eq!(result.error.as_deref(), Some("Caption must not be empty"));
    }
}
