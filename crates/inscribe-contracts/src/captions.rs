use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity of the backend a caption is attributed to.
///
/// Note that attribution is a product-level concept, not a transport-level
/// one: when the on-device path silently escalates to a cloud backend, the
/// result still reports `OnDevice` so the host never surfaces backend
/// switching to the end user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptionProviderKind {
    #[serde(rename = "on-device")]
    OnDevice,
    OpenAi,
    Gemini,
}

impl CaptionProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptionProviderKind::OnDevice => "on-device",
            CaptionProviderKind::OpenAi => "openai",
            CaptionProviderKind::Gemini => "gemini",
        }
    }

    pub fn is_cloud(&self) -> bool {
        !matches!(self, CaptionProviderKind::OnDevice)
    }
}

impl fmt::Display for CaptionProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptionProviderKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "on-device" | "ondevice" | "local" => Ok(CaptionProviderKind::OnDevice),
            "openai" => Ok(CaptionProviderKind::OpenAi),
            "gemini" => Ok(CaptionProviderKind::Gemini),
            other => Err(format!("unknown caption provider '{other}'")),
        }
    }
}

/// Outcome of one caption resolution attempt. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionResult {
    pub caption: String,
    /// Heuristic quality estimate in 0..=100, not a calibrated probability.
    pub confidence: u8,
    pub provider: CaptionProviderKind,
    pub is_from_fallback: bool,
    pub processing_time_ms: u64,
    pub error: Option<String>,
}

impl CaptionResult {
    pub fn failure(provider: CaptionProviderKind, error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            caption: String::new(),
            confidence: 0,
            provider,
            is_from_fallback: false,
            processing_time_ms: elapsed_ms,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.caption.trim().is_empty()
    }
}

/// Resolution engine configuration. Each resolution works from a cloned
/// snapshot, so mid-flight updates never affect an attempt in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub preferred_provider: CaptionProviderKind,
    pub enable_fallback: bool,
    pub max_retries: u32,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            preferred_provider: CaptionProviderKind::OnDevice,
            enable_fallback: true,
            max_retries: 1,
            openai_api_key: None,
            gemini_api_key: None,
        }
    }
}

impl ProviderConfig {
    /// Default config with API keys pulled from `OPENAI_API_KEY` and
    /// `GEMINI_API_KEY` when set and non-empty.
    pub fn from_env() -> Self {
        Self {
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            gemini_api_key: non_empty_env("GEMINI_API_KEY"),
            ..Self::default()
        }
    }

    pub fn has_cloud_key(&self, kind: CaptionProviderKind) -> bool {
        match kind {
            CaptionProviderKind::OpenAi => self.openai_api_key.is_some(),
            CaptionProviderKind::Gemini => self.gemini_api_key.is_some(),
            CaptionProviderKind::OnDevice => false,
        }
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Raw answer from the on-device inference backend.
///
/// `signal_breakdown` carries auxiliary model signals keyed by name; the
/// resolution engine reads `scene` ("indoor"/"outdoor"), `ocr_text` and
/// `objects` for detailed-mode augmentation and ignores the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnDeviceInference {
    pub success: bool,
    /// Model-reported score in 0.0..=1.0.
    pub confidence_score: f64,
    pub caption_text: String,
    #[serde(default)]
    pub signal_breakdown: Map<String, Value>,
}

pub trait OnDeviceBackend: Send + Sync {
    fn infer(&self, image_path: &Path) -> anyhow::Result<OnDeviceInference>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CaptionProviderKind, CaptionResult, ProviderConfig};

    #[test]
    fn provider_kind_round_trips_through_serde() -> anyhow::Result<()> {
        let encoded = serde_json::to_value(CaptionProviderKind::OnDevice)?;
        assert_eq!(encoded, json!("on-device"));
        let decoded: CaptionProviderKind = serde_json::from_value(json!("gemini"))?;
        assert_eq!(decoded, CaptionProviderKind::Gemini);
        Ok(())
    }

    #[test]
    fn provider_kind_parses_aliases() {
        assert_eq!(
            "ondevice".parse::<CaptionProviderKind>(),
            Ok(CaptionProviderKind::OnDevice)
        );
        assert_eq!(
            " OpenAI ".parse::<CaptionProviderKind>(),
            Ok(CaptionProviderKind::OpenAi)
        );
        assert!("clip".parse::<CaptionProviderKind>().is_err());
    }

    #[test]
    fn default_config_prefers_on_device_with_fallback() {
        let config = ProviderConfig::default();
        assert_eq!(config.preferred_provider, CaptionProviderKind::OnDevice);
        assert!(config.enable_fallback);
        assert!(!config.has_cloud_key(CaptionProviderKind::OpenAi));
        assert!(!config.has_cloud_key(CaptionProviderKind::Gemini));
    }

    #[test]
    fn failure_result_has_zero_confidence_and_empty_caption() {
        let result = CaptionResult::failure(CaptionProviderKind::OpenAi, "no key", 12);
        assert_eq!(result.confidence, 0);
        assert!(!result.is_success());
        assert_eq!(result.error.as_deref(), Some("no key"));
        assert_eq!(result.processing_time_ms, 12);
    }
}
