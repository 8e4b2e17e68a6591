use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use inscribe_contracts::captions::{
    CaptionProviderKind, CaptionResult, OnDeviceBackend, OnDeviceInference, ProviderConfig,
};
use inscribe_contracts::constraints::{
    BatteryStatus, ConstraintSnapshot, NetworkKind, NetworkStatus, PlatformMonitor,
};
use inscribe_contracts::events::{payload_of, EventWriter};
use inscribe_contracts::gallery::{
    caption_word_count, evaluate_caption_quality, score_caption_text, GalleryStore, ImageRef,
    MetadataReader,
};
use inscribe_contracts::state::{
    KvStore, PersistedState, RunOutcome, RunResult, SchedulerConfig, SchedulerConfigPatch,
    SchedulerState,
};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};

pub mod embed;

pub use embed::EmbedEngine;

/// On-device answers matching this sentinel are treated as no answer.
const UNCLEAR_CONTENT_SENTINEL: &str = "unclear content";
/// On-device captions shorter than this are considered minimal.
const MINIMAL_CAPTION_LEN: usize = 12;
/// Constraints are re-evaluated after every this many images.
const CONSTRAINT_RECHECK_INTERVAL: usize = 3;
/// Upper bound when counting pending images.
const PENDING_SCAN_LIMIT: usize = 10_000;

const BRIEF_CAPTION_TOKENS: u64 = 150;
const DETAILED_CAPTION_TOKENS: u64 = 300;

#[derive(Debug, Clone)]
pub struct CaptionRequest {
    pub image_path: PathBuf,
    pub detailed: bool,
    pub max_tokens: u64,
}

pub trait CaptionProvider: Send + Sync {
    fn kind(&self) -> CaptionProviderKind;
    fn caption(&self, request: &CaptionRequest, config: &ProviderConfig) -> Result<String>;
}

pub struct OpenAiVisionProvider {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl OpenAiVisionProvider {
    pub fn new() -> Self {
        Self {
            api_base: api_base_from_env("OPENAI_API_BASE", "https://api.openai.com/v1"),
            model: non_empty_env("OPENAI_VISION_MODEL")
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            http: HttpClient::new(),
        }
    }
}

impl Default for OpenAiVisionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptionProvider for OpenAiVisionProvider {
    fn kind(&self) -> CaptionProviderKind {
        CaptionProviderKind::OpenAi
    }

    fn caption(&self, request: &CaptionRequest, config: &ProviderConfig) -> Result<String> {
        let Some(api_key) = config
            .openai_api_key
            .clone()
            .or_else(|| non_empty_env("OPENAI_API_KEY"))
        else {
            bail!("OpenAI API key not configured");
        };
        let (mime, data) = encode_image_base64(&request.image_path)?;
        let endpoint = format!("{}/chat/completions", self.api_base);
        let payload = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": caption_prompt(request.detailed)},
                    {"type": "image_url", "image_url": {"url": format!("data:{mime};base64,{data}")}},
                ],
            }],
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        let parsed = response_json_or_error("OpenAI", response)?;
        let text = parsed
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if text.is_empty() {
            bail!("OpenAI returned an empty caption");
        }
        Ok(text.to_string())
    }
}

pub struct GeminiVisionProvider {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl GeminiVisionProvider {
    pub fn new() -> Self {
        Self {
            api_base: api_base_from_env(
                "GEMINI_API_BASE",
                "https://generativelanguage.googleapis.com/v1beta",
            ),
            model: non_empty_env("GEMINI_VISION_MODEL")
                .unwrap_or_else(|| "gemini-2.0-flash".to_string()),
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    /// Auth is a `key` query parameter, unlike the bearer header OpenAI
    /// uses. Only transport-level send failures are retried here; HTTP
    /// error responses go straight to the fallback chain.
    fn post_with_transport_retries(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
        max_retries: u32,
    ) -> Result<HttpResponse> {
        for attempt in 0..=max_retries {
            let response = self
                .http
                .post(endpoint)
                .query(&[("key", api_key)])
                .json(payload)
                .send();
            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let retryable = raw.is_timeout() || raw.is_connect();
                    let err = anyhow::Error::new(raw)
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !retryable || attempt >= max_retries {
                        return Err(err);
                    }
                    thread::sleep(Duration::from_millis(250 * (attempt as u64 + 1)));
                }
            }
        }
        unreachable!("Gemini transport retry loop always returns")
    }
}

impl Default for GeminiVisionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptionProvider for GeminiVisionProvider {
    fn kind(&self) -> CaptionProviderKind {
        CaptionProviderKind::Gemini
    }

    fn caption(&self, request: &CaptionRequest, config: &ProviderConfig) -> Result<String> {
        let Some(api_key) = config
            .gemini_api_key
            .clone()
            .or_else(|| non_empty_env("GEMINI_API_KEY"))
        else {
            bail!("Gemini API key not configured");
        };
        let (mime, data) = encode_image_base64(&request.image_path)?;
        let endpoint = self.endpoint_for_model();
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {"text": caption_prompt(request.detailed)},
                    {"inline_data": {"mime_type": mime, "data": data}},
                ],
            }],
            "generationConfig": {"maxOutputTokens": request.max_tokens},
        });
        let response =
            self.post_with_transport_retries(&endpoint, &api_key, &payload, config.max_retries)?;
        let parsed = response_json_or_error("Gemini", response)?;
        let text = parsed
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<Vec<&str>>()
                    .join(" ")
            })
            .unwrap_or_default();
        let text = text.trim();
        if text.is_empty() {
            bail!("Gemini returned an empty caption");
        }
        Ok(text.to_string())
    }
}

/// Resolves captions across the on-device backend and the configured cloud
/// providers. `generate_caption` never fails outright: every provider error
/// degrades into a returned `CaptionResult` carrying the error string.
pub struct CaptionEngine {
    config: Mutex<ProviderConfig>,
    backend: Arc<dyn OnDeviceBackend>,
    cloud_providers: Vec<Box<dyn CaptionProvider>>,
}

impl CaptionEngine {
    pub fn new(config: ProviderConfig, backend: Arc<dyn OnDeviceBackend>) -> Self {
        Self::with_cloud_providers(
            config,
            backend,
            vec![
                Box::new(OpenAiVisionProvider::new()),
                Box::new(GeminiVisionProvider::new()),
            ],
        )
    }

    /// Construction seam for injecting provider doubles.
    pub fn with_cloud_providers(
        config: ProviderConfig,
        backend: Arc<dyn OnDeviceBackend>,
        cloud_providers: Vec<Box<dyn CaptionProvider>>,
    ) -> Self {
        Self {
            config: Mutex::new(config),
            backend,
            cloud_providers,
        }
    }

    pub fn config(&self) -> ProviderConfig {
        lock_or_recover(&self.config).clone()
    }

    pub fn set_config(&self, config: ProviderConfig) {
        *lock_or_recover(&self.config) = config;
    }

    fn cloud_provider(&self, kind: CaptionProviderKind) -> Option<&dyn CaptionProvider> {
        self.cloud_providers
            .iter()
            .find(|provider| provider.kind() == kind)
            .map(|provider| provider.as_ref())
    }

    pub fn generate_caption(&self, image_path: &Path, detailed: bool) -> CaptionResult {
        let started = Instant::now();
        let config = self.config();
        let request = CaptionRequest {
            image_path: image_path.to_path_buf(),
            detailed,
            max_tokens: if detailed {
                DETAILED_CAPTION_TOKENS
            } else {
                BRIEF_CAPTION_TOKENS
            },
        };

        let mut last_error: Option<String> = None;
        for (idx, kind) in provider_order(&config).into_iter().enumerate() {
            let attempt = match kind {
                CaptionProviderKind::OnDevice => self.resolve_on_device(&request, &config),
                cloud => self.resolve_cloud(cloud, &request, &config, idx > 0),
            };
            match attempt {
                Ok(mut result) => {
                    result.processing_time_ms = started.elapsed().as_millis() as u64;
                    return result;
                }
                Err(err) => last_error = Some(error_chain_text(&err, 400)),
            }
        }

        CaptionResult::failure(
            config.preferred_provider,
            last_error.unwrap_or_else(|| "no caption providers configured".to_string()),
            started.elapsed().as_millis() as u64,
        )
    }

    fn resolve_cloud(
        &self,
        kind: CaptionProviderKind,
        request: &CaptionRequest,
        config: &ProviderConfig,
        is_from_fallback: bool,
    ) -> Result<CaptionResult> {
        let provider = self
            .cloud_provider(kind)
            .with_context(|| format!("no provider registered for {kind}"))?;
        let text = provider.caption(request, config)?;
        let text = text.trim().to_string();
        Ok(CaptionResult {
            confidence: score_caption_text(&text),
            caption: text,
            provider: kind,
            is_from_fallback,
            processing_time_ms: 0,
            error: None,
        })
    }

    /// The on-device path either accepts the backend's answer or silently
    /// escalates to the cloud while still reporting `on-device` as the
    /// provider. A weak local answer is returned over no answer when both
    /// cloud attempts fail; only a backend-level failure propagates into
    /// the top-level fallback chain.
    fn resolve_on_device(
        &self,
        request: &CaptionRequest,
        config: &ProviderConfig,
    ) -> Result<CaptionResult> {
        let inference = self
            .backend
            .infer(&request.image_path)
            .context("on-device inference failed")?;
        if !inference.success {
            bail!("on-device backend reported failure");
        }

        let text = inference.caption_text.trim().to_string();
        if on_device_acceptable(&text, inference.confidence_score) {
            let caption = if request.detailed {
                augment_detailed(&text, &inference)
            } else {
                text
            };
            return Ok(CaptionResult {
                confidence: score_caption_text(&caption),
                caption,
                provider: CaptionProviderKind::OnDevice,
                is_from_fallback: false,
                processing_time_ms: 0,
                error: None,
            });
        }

        for kind in [CaptionProviderKind::OpenAi, CaptionProviderKind::Gemini] {
            if !config.has_cloud_key(kind) {
                continue;
            }
            let Some(provider) = self.cloud_provider(kind) else {
                continue;
            };
            if let Ok(cloud_text) = provider.caption(request, config) {
                let cloud_text = cloud_text.trim().to_string();
                if !cloud_text.is_empty() {
                    return Ok(CaptionResult {
                        confidence: score_caption_text(&cloud_text),
                        caption: cloud_text,
                        provider: CaptionProviderKind::OnDevice,
                        is_from_fallback: false,
                        processing_time_ms: 0,
                        error: None,
                    });
                }
            }
        }

        Ok(CaptionResult {
            confidence: score_caption_text(&text),
            caption: text,
            provider: CaptionProviderKind::OnDevice,
            is_from_fallback: false,
            processing_time_ms: 0,
            error: None,
        })
    }
}

/// Top-level fallback order. A cloud preference never includes the
/// on-device backend: cloud users expect cloud-quality results, and a
/// silent downgrade to the local model would break that expectation.
fn provider_order(config: &ProviderConfig) -> Vec<CaptionProviderKind> {
    let mut order = vec![config.preferred_provider];
    match config.preferred_provider {
        CaptionProviderKind::OnDevice => {
            for kind in [CaptionProviderKind::OpenAi, CaptionProviderKind::Gemini] {
                if config.has_cloud_key(kind) {
                    order.push(kind);
                }
            }
        }
        CaptionProviderKind::OpenAi => {
            if config.has_cloud_key(CaptionProviderKind::Gemini) {
                order.push(CaptionProviderKind::Gemini);
            }
        }
        CaptionProviderKind::Gemini => {
            if config.has_cloud_key(CaptionProviderKind::OpenAi) {
                order.push(CaptionProviderKind::OpenAi);
            }
        }
    }
    if !config.enable_fallback {
        order.truncate(1);
    }
    order
}

fn is_minimal_caption(text: &str) -> bool {
    text.is_empty()
        || text.len() < MINIMAL_CAPTION_LEN
        || text.eq_ignore_ascii_case(UNCLEAR_CONTENT_SENTINEL)
}

/// Short answers need a higher model score to be taken at face value.
fn on_device_acceptable(text: &str, confidence_score: f64) -> bool {
    if is_minimal_caption(text) {
        return false;
    }
    let floor = if caption_word_count(text) < 5 { 0.3 } else { 0.2 };
    confidence_score >= floor
}

/// Detailed-mode augmentation is string assembly over the backend's signal
/// breakdown, never a second model call.
fn augment_detailed(caption: &str, inference: &OnDeviceInference) -> String {
    let mut out = caption.trim().trim_end_matches('.').to_string();
    let caption_lower = out.to_ascii_lowercase();
    match inference
        .signal_breakdown
        .get("scene")
        .and_then(Value::as_str)
    {
        Some("indoor") => out.push_str(", in an indoor setting"),
        Some("outdoor") => out.push_str(", in an outdoor setting"),
        _ => {}
    }
    if let Some(ocr) = inference
        .signal_breakdown
        .get("ocr_text")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        out.push_str(&format!(", with visible text \"{ocr}\""));
    }
    let secondary: Vec<&str> = inference
        .signal_breakdown
        .get("objects")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .filter(|name| !caption_lower.contains(&name.to_ascii_lowercase()))
                .take(3)
                .collect()
        })
        .unwrap_or_default();
    if !secondary.is_empty() {
        out.push_str(&format!(", featuring {}", secondary.join(", ")));
    }
    out
}

fn caption_prompt(detailed: bool) -> &'static str {
    if detailed {
        "Describe this photo in two or three sentences for a visually impaired user. \
         Mention the setting, any visible text, and notable objects."
    } else {
        "Describe this photo in one concise sentence for a visually impaired user."
    }
}

/// Explicit wiring for the scheduler's external collaborators.
pub struct SchedulerContext {
    pub gallery: Arc<dyn GalleryStore>,
    pub reader: Arc<dyn MetadataReader>,
    pub monitor: Arc<dyn PlatformMonitor>,
    pub store: KvStore,
    pub events: EventWriter,
}

enum Disposition {
    Skipped,
    Processed,
    Failed(String),
}

/// Recurring, resumable background captioning job. At most one run is in
/// flight per scheduler; a second `run_captioning_pipeline` call while one
/// is running is rejected synchronously with no queuing.
pub struct CaptionScheduler {
    gallery: Arc<dyn GalleryStore>,
    reader: Arc<dyn MetadataReader>,
    monitor: Arc<dyn PlatformMonitor>,
    engine: CaptionEngine,
    embedder: EmbedEngine,
    store: KvStore,
    events: EventWriter,
    config: Mutex<SchedulerConfig>,
    state: Mutex<SchedulerState>,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CaptionScheduler {
    pub fn new(
        context: SchedulerContext,
        engine: CaptionEngine,
        embedder: EmbedEngine,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            gallery: context.gallery,
            reader: context.reader,
            monitor: context.monitor,
            engine,
            embedder,
            store: context.store,
            events: context.events,
            config: Mutex::new(config),
            state: Mutex::new(SchedulerState::default()),
            running: AtomicBool::new(false),
        }
    }

    /// Reloads the persisted run statistics and refreshes the pending
    /// count. Call once at process start.
    pub fn initialize(&self) -> Result<()> {
        let persisted = PersistedState::load(&self.store);
        {
            let mut state = lock_or_recover(&self.state);
            state.last_run_time = persisted.last_run_time;
            state.processed_total = persisted.processed_total;
        }
        self.pending_count()?;
        Ok(())
    }

    pub fn config(&self) -> SchedulerConfig {
        lock_or_recover(&self.config).clone()
    }

    pub fn update_config(&self, patch: &SchedulerConfigPatch) {
        lock_or_recover(&self.config).apply(patch);
    }

    pub fn state(&self) -> SchedulerState {
        lock_or_recover(&self.state).clone()
    }

    pub fn caption_engine(&self) -> &CaptionEngine {
        &self.engine
    }

    /// Evaluates battery and network gates in order, failing fast on the
    /// first violation. A collaborator query failure counts as "ok":
    /// absence of data never blocks a run.
    pub fn check_constraints(&self) -> ConstraintSnapshot {
        let config = self.config();
        let battery = self.monitor.battery().unwrap_or(BatteryStatus {
            level_percent: None,
            is_charging: None,
        });
        let network = self.monitor.network().unwrap_or(NetworkStatus {
            is_connected: true,
            kind: None,
        });
        let snapshot = ConstraintSnapshot::allowed(battery, network);

        if let Some(level) = battery.level_percent {
            if level < config.low_battery_threshold {
                return snapshot.block(true, format!("Battery too low ({level}%)"));
            }
        }
        if config.require_charging && battery.is_charging == Some(false) {
            return snapshot.block(true, "Battery not charging");
        }
        if !network.is_connected {
            return snapshot.block(false, "No network connection");
        }
        if config.wifi_only {
            if let Some(kind) = network.kind {
                if kind != NetworkKind::Wifi {
                    return snapshot.block(false, "WiFi required");
                }
            }
        }
        snapshot
    }

    pub fn pending_count(&self) -> Result<u64> {
        let exclude = self.gallery.processed_image_ids()?;
        let pending = self
            .gallery
            .detect_unprocessed_images(&exclude, PENDING_SCAN_LIMIT)?
            .len() as u64;
        lock_or_recover(&self.state).pending_count = pending;
        Ok(pending)
    }

    pub fn clear_processed_history(&self) -> Result<()> {
        self.gallery.clear_processed_image_ids()?;
        self.pending_count()?;
        Ok(())
    }

    pub fn trigger_immediate_run(&self) -> RunResult {
        self.run_captioning_pipeline()
    }

    pub fn run_captioning_pipeline(&self) -> RunResult {
        if self.running.swap(true, Ordering::SeqCst) {
            // Rejected synchronously, zero side effects.
            let mut result = RunResult::empty(RunOutcome::Failed);
            result.error_count = 1;
            result.errors.push("Pipeline already running".to_string());
            return result;
        }
        let _guard = RunningGuard(&self.running);

        let run_id = uuid::Uuid::new_v4().to_string();
        lock_or_recover(&self.state).is_running = true;
        let result = self.run_pipeline_inner(&run_id);
        self.finish_run(&run_id, &result);
        result
    }

    fn run_pipeline_inner(&self, run_id: &str) -> RunResult {
        let config = self.config();
        if !config.enabled {
            return self.skipped_result(run_id, "Automatic captioning disabled");
        }

        let _ = self.events.emit(
            "run_started",
            payload_of(json!({
                "run_id": run_id,
                "max_images": config.max_images_per_run,
            })),
        );

        let snapshot = self.check_constraints();
        if !snapshot.can_run {
            let reason = snapshot
                .reason
                .unwrap_or_else(|| "Constraints not met".to_string());
            return self.skipped_result(run_id, &reason);
        }

        if !self.gallery.has_full_access() {
            return self.failed_result(run_id, "Photo library access denied");
        }

        let exclude = match self.gallery.processed_image_ids() {
            Ok(ids) => ids,
            Err(err) => return self.failed_result(run_id, &error_chain_text(&err, 400)),
        };
        let images = match self
            .gallery
            .detect_unprocessed_images(&exclude, config.max_images_per_run)
        {
            Ok(images) => images,
            Err(err) => return self.failed_result(run_id, &error_chain_text(&err, 400)),
        };

        let mut processed_count = 0u64;
        let mut skipped_count = 0u64;
        let mut error_count = 0u64;
        let mut errors = Vec::new();
        let mut aborted = false;

        for (idx, image) in images.iter().enumerate() {
            if idx > 0 && idx % CONSTRAINT_RECHECK_INTERVAL == 0 {
                let recheck = self.check_constraints();
                if !recheck.can_run {
                    let _ = self.events.emit(
                        "constraints_degraded",
                        payload_of(json!({
                            "run_id": run_id,
                            "reason": recheck.reason,
                            "remaining": images.len() - idx,
                        })),
                    );
                    aborted = true;
                    break;
                }
            }

            match self.handle_image(run_id, image, &config) {
                Disposition::Skipped => skipped_count += 1,
                Disposition::Processed => processed_count += 1,
                Disposition::Failed(err) => {
                    let _ = self.events.emit(
                        "image_failed",
                        payload_of(json!({
                            "run_id": run_id,
                            "image_id": image.id,
                            "error": err,
                        })),
                    );
                    error_count += 1;
                    errors.push(format!("{}: {err}", image.id));
                }
            }

            if idx + 1 < images.len() && config.delay_between_images_ms > 0 {
                thread::sleep(Duration::from_millis(config.delay_between_images_ms));
            }
        }

        let outcome = if aborted {
            RunOutcome::Partial
        } else if error_count == 0 {
            RunOutcome::Success
        } else if processed_count == 0 && skipped_count == 0 {
            RunOutcome::Failed
        } else {
            RunOutcome::Partial
        };
        RunResult {
            success: outcome == RunOutcome::Success,
            outcome,
            processed_count,
            skipped_count,
            error_count,
            errors,
        }
    }

    fn handle_image(
        &self,
        run_id: &str,
        image: &ImageRef,
        config: &SchedulerConfig,
    ) -> Disposition {
        // A read failure means "no usable metadata", not a fatal error.
        let existing = self
            .reader
            .read_image_metadata(&image.path)
            .ok()
            .flatten()
            .and_then(|meta| meta.description);
        if let Some(description) = existing {
            let quality = evaluate_caption_quality(&description);
            if quality.score >= config.quality_floor && !quality.is_generic {
                if let Err(err) = self.gallery.add_processed_image_id(&image.id) {
                    return Disposition::Failed(error_chain_text(&err, 400));
                }
                let _ = self.events.emit(
                    "image_skipped",
                    payload_of(json!({
                        "run_id": run_id,
                        "image_id": image.id,
                        "existing_score": quality.score,
                    })),
                );
                return Disposition::Skipped;
            }
        }

        let resolved = self
            .engine
            .generate_caption(&image.path, config.detailed_captions);
        let _ = self.events.emit(
            "caption_resolved",
            payload_of(json!({
                "run_id": run_id,
                "image_id": image.id,
                "provider": resolved.provider.as_str(),
                "confidence": resolved.confidence,
                "is_from_fallback": resolved.is_from_fallback,
                "processing_time_ms": resolved.processing_time_ms,
            })),
        );
        if let Some(err) = resolved.error {
            return Disposition::Failed(err);
        }
        if resolved.confidence < config.write_confidence_floor {
            return Disposition::Failed(format!(
                "caption confidence {} below write floor {}",
                resolved.confidence, config.write_confidence_floor
            ));
        }

        let write = self
            .embedder
            .embed_caption(&image.path, &resolved.caption, Some(&image.id));
        if !write.success {
            return Disposition::Failed(
                write
                    .error
                    .unwrap_or_else(|| "metadata embedding failed".to_string()),
            );
        }
        if let Err(err) = self.gallery.add_processed_image_id(&image.id) {
            return Disposition::Failed(error_chain_text(&err, 400));
        }
        let _ = self.events.emit(
            "caption_embedded",
            payload_of(json!({
                "run_id": run_id,
                "image_id": image.id,
                "asset_id": write.asset_id,
                "wrote_exif": write.wrote_exif,
                "wrote_xmp": write.wrote_xmp,
            })),
        );
        Disposition::Processed
    }

    fn skipped_result(&self, run_id: &str, reason: &str) -> RunResult {
        let _ = self.events.emit(
            "run_skipped",
            payload_of(json!({"run_id": run_id, "reason": reason})),
        );
        let mut result = RunResult::empty(RunOutcome::Skipped);
        result.errors.push(reason.to_string());
        result
    }

    fn failed_result(&self, run_id: &str, reason: &str) -> RunResult {
        let mut result = RunResult::empty(RunOutcome::Failed);
        result.error_count = 1;
        result.errors.push(reason.to_string());
        let _ = self.events.emit(
            "run_failed",
            payload_of(json!({"run_id": run_id, "reason": reason})),
        );
        result
    }

    /// Runs on every exit path: records the run in scheduler state,
    /// persists the durable subset, and clears the running flag.
    fn finish_run(&self, run_id: &str, result: &RunResult) {
        let persisted = {
            let mut state = lock_or_recover(&self.state);
            state.is_running = false;
            state.last_run_time = Some(Utc::now());
            state.last_run_result = Some(result.outcome);
            state.processed_total += result.processed_count;
            state.last_error = result.errors.last().cloned();
            PersistedState {
                last_run_time: state.last_run_time,
                processed_total: state.processed_total,
            }
        };
        if let Err(err) = persisted.store(&self.store) {
            let _ = self.events.emit(
                "state_persist_failed",
                payload_of(json!({
                    "run_id": run_id,
                    "error": error_chain_text(&err, 400),
                })),
            );
        }
        let _ = self.pending_count();
        let _ = self.events.emit(
            "run_finished",
            payload_of(json!({
                "run_id": run_id,
                "outcome": result.outcome,
                "processed": result.processed_count,
                "skipped": result.skipped_count,
                "errors": result.error_count,
            })),
        );
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn api_base_from_env(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn image_mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}

fn encode_image_base64(path: &Path) -> Result<(&'static str, String)> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read image {}", path.display()))?;
    Ok((image_mime_for_path(path), BASE64.encode(bytes)))
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}
