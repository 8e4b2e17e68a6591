use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Storage key for the scheduler's durable blob.
pub const STORAGE_KEY: &str = "scheduler.state.v1";

/// File-backed string key-value store, one JSON object per file.
///
/// `get` re-reads the file so a fresh value written by another store
/// instance is visible; `set` merges into whatever is on disk so two
/// instances sharing a path do not clobber each other's keys.
#[derive(Debug, Clone)]
pub struct KvStore {
    path: PathBuf,
}

impl KvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<String> {
        read_json_object(&self.path)?
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        on_disk.insert(key.to_string(), Value::String(value.to_string()));
        write_json_object(&self.path, &on_disk)
    }

    pub fn remove(&self, key: &str) -> anyhow::Result<()> {
        let Some(mut on_disk) = read_json_object(&self.path) else {
            return Ok(());
        };
        if on_disk.remove(key).is_some() {
            write_json_object(&self.path, &on_disk)?;
        }
        Ok(())
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Partial,
    Skipped,
    Failed,
}

/// Scheduler lifecycle snapshot. Mutated only by the scheduler's run
/// routine; `is_running` doubles as the mutual-exclusion flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub is_running: bool,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_run_result: Option<RunOutcome>,
    pub processed_total: u64,
    pub pending_count: u64,
    pub last_error: Option<String>,
}

/// Aggregate of one pipeline run. Produced fresh per run and never
/// persisted in full.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub success: bool,
    pub outcome: RunOutcome,
    pub processed_count: u64,
    pub skipped_count: u64,
    pub error_count: u64,
    pub errors: Vec<String>,
}

impl RunResult {
    pub fn empty(outcome: RunOutcome) -> Self {
        Self {
            success: matches!(outcome, RunOutcome::Success),
            outcome,
            processed_count: 0,
            skipped_count: 0,
            error_count: 0,
            errors: Vec::new(),
        }
    }
}

/// Scheduler tuning knobs. Hosts update these through
/// [`SchedulerConfigPatch`] so unset fields keep their current values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub max_images_per_run: usize,
    /// Runs are blocked below this battery percentage.
    pub low_battery_threshold: u8,
    pub require_charging: bool,
    pub wifi_only: bool,
    /// Throttling pause between images, not a correctness requirement.
    pub delay_between_images_ms: u64,
    /// Existing captions scoring at or above this are left alone.
    pub quality_floor: u8,
    /// Fresh captions below this confidence are not embedded.
    pub write_confidence_floor: u8,
    pub detailed_captions: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_images_per_run: 10,
            low_battery_threshold: 20,
            require_charging: false,
            wifi_only: false,
            delay_between_images_ms: 500,
            quality_floor: 50,
            write_confidence_floor: 30,
            detailed_captions: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfigPatch {
    pub enabled: Option<bool>,
    pub max_images_per_run: Option<usize>,
    pub low_battery_threshold: Option<u8>,
    pub require_charging: Option<bool>,
    pub wifi_only: Option<bool>,
    pub delay_between_images_ms: Option<u64>,
    pub quality_floor: Option<u8>,
    pub write_confidence_floor: Option<u8>,
    pub detailed_captions: Option<bool>,
}

impl SchedulerConfig {
    pub fn apply(&mut self, patch: &SchedulerConfigPatch) {
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(limit) = patch.max_images_per_run {
            self.max_images_per_run = limit;
        }
        if let Some(threshold) = patch.low_battery_threshold {
            self.low_battery_threshold = threshold;
        }
        if let Some(require_charging) = patch.require_charging {
            self.require_charging = require_charging;
        }
        if let Some(wifi_only) = patch.wifi_only {
            self.wifi_only = wifi_only;
        }
        if let Some(delay) = patch.delay_between_images_ms {
            self.delay_between_images_ms = delay;
        }
        if let Some(floor) = patch.quality_floor {
            self.quality_floor = floor;
        }
        if let Some(floor) = patch.write_confidence_floor {
            self.write_confidence_floor = floor;
        }
        if let Some(detailed) = patch.detailed_captions {
            self.detailed_captions = detailed;
        }
    }
}

/// The only durable scheduler artifact: a JSON blob under [`STORAGE_KEY`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub last_run_time: Option<DateTime<Utc>>,
    pub processed_total: u64,
}

impl PersistedState {
    pub fn load(store: &KvStore) -> Self {
        store
            .get(STORAGE_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn store(&self, store: &KvStore) -> anyhow::Result<()> {
        store.set(STORAGE_KEY, &serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{KvStore, PersistedState, RunOutcome, STORAGE_KEY};

    #[test]
    fn kv_store_round_trips_values() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = KvStore::new(temp.path().join("state.json"));
        assert_eq!(store.get("missing"), None);
        store.set("key", "value")?;
        assert_eq!(store.get("key").as_deref(), Some("value"));
        Ok(())
    }

    #[test]
    fn kv_store_merges_with_concurrent_writer() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("state.json");
        let store_a = KvStore::new(&path);
        let store_b = KvStore::new(&path);

        store_a.set("a", "1")?;
        store_b.set("b", "2")?;
        store_a.set("c", "3")?;

        let reloaded = KvStore::new(path);
        assert_eq!(reloaded.get("a").as_deref(), Some("1"));
        assert_eq!(reloaded.get("b").as_deref(), Some("2"));
        assert_eq!(reloaded.get("c").as_deref(), Some("3"));
        Ok(())
    }

    #[test]
    fn kv_store_get_sees_writes_from_other_instances() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("state.json");
        let store_a = KvStore::new(&path);
        let store_b = KvStore::new(&path);

        store_a.set("key", "1")?;
        assert_eq!(store_b.get("key").as_deref(), Some("1"));
        store_b.set("key", "2")?;
        assert_eq!(store_a.get("key").as_deref(), Some("2"));
        Ok(())
    }

    #[test]
    fn kv_store_remove_is_a_noop_for_missing_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = KvStore::new(temp.path().join("state.json"));
        store.remove("ghost")?;
        store.set("key", "value")?;
        store.remove("key")?;
        assert_eq!(store.get("key"), None);
        Ok(())
    }

    #[test]
    fn persisted_state_defaults_when_blob_missing_or_corrupt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = KvStore::new(temp.path().join("state.json"));
        assert_eq!(PersistedState::load(&store), PersistedState::default());

        store.set(STORAGE_KEY, "not json at all")?;
        assert_eq!(PersistedState::load(&store), PersistedState::default());
        Ok(())
    }

    #[test]
    fn persisted_state_round_trips() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = KvStore::new(temp.path().join("state.json"));
        let state = PersistedState {
            last_run_time: Some(Utc::now()),
            processed_total: 42,
        };
        state.store(&store)?;
        assert_eq!(PersistedState::load(&store), state);
        Ok(())
    }

    #[test]
    fn run_outcome_serializes_lowercase() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&RunOutcome::Partial)?, "\"partial\"");
        Ok(())
    }

    #[test]
    fn config_patch_only_touches_set_fields() {
        let mut config = super::SchedulerConfig::default();
        config.apply(&super::SchedulerConfigPatch {
            max_images_per_run: Some(3),
            wifi_only: Some(true),
            ..Default::default()
        });
        assert_eq!(config.max_images_per_run, 3);
        assert!(config.wifi_only);
        assert_eq!(config.low_battery_threshold, 20);
        assert_eq!(config.delay_between_images_ms, 500);
    }
}
