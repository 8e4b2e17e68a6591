use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::SecondsFormat;
use clap::{Parser, Subcommand};
use inscribe_contracts::captions::{
    CaptionProviderKind, OnDeviceBackend, OnDeviceInference, ProviderConfig,
};
use inscribe_contracts::constraints::{BatteryStatus, NetworkKind, NetworkStatus, StaticMonitor};
use inscribe_contracts::embed::EmbedOptions;
use inscribe_contracts::events::EventWriter;
use inscribe_contracts::gallery::{GalleryStore, GalleryWriter, ImageMetadata, ImageRef, MetadataReader};
use inscribe_contracts::state::{KvStore, PersistedState, RunOutcome, SchedulerConfigPatch};
use inscribe_engine::embed::{create_xmp_sidecar, read_embedded_description};
use inscribe_engine::{CaptionEngine, CaptionScheduler, EmbedEngine, SchedulerContext};
use serde_json::json;
use sha2::{Digest, Sha256};

#[derive(Debug, Parser)]
#[command(name = "inscribe", version, about = "Accessibility caption pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the captioning pipeline over a directory of images.
    Run(RunArgs),
    /// Embed one caption into one image's metadata.
    Embed(EmbedArgs),
    /// Print the caption already embedded in an image, if any.
    Read(ReadArgs),
    /// Print persisted scheduler state.
    Status(StatusArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// Directory of source images.
    #[arg(long)]
    gallery: PathBuf,
    /// Output directory for captioned assets, state and events.
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value = "on-device")]
    provider: String,
    #[arg(long, default_value_t = 10)]
    max_images: usize,
    #[arg(long)]
    detailed: bool,
    /// Simulated battery level for constraint checks.
    #[arg(long)]
    battery: Option<u8>,
    /// Report the battery as charging.
    #[arg(long)]
    charging: bool,
    /// Simulated network kind (wifi, cellular, ethernet, other).
    #[arg(long)]
    network: Option<String>,
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
    /// Forget which images were already captioned before running.
    #[arg(long)]
    reset_history: bool,
}

#[derive(Debug, Parser)]
struct EmbedArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    caption: String,
    /// Output directory for the captioned asset.
    #[arg(long)]
    out: PathBuf,
    /// Directory to copy the untouched original into first.
    #[arg(long)]
    backup: Option<PathBuf>,
    /// Also write an XMP sidecar next to the source image.
    #[arg(long)]
    sidecar: bool,
}

#[derive(Debug, Parser)]
struct ReadArgs {
    #[arg(long)]
    image: PathBuf,
}

#[derive(Debug, Parser)]
struct StatusArgs {
    /// Output directory a previous `run` wrote state into.
    #[arg(long)]
    out: PathBuf,
    /// When given, pending images in this directory are counted too.
    #[arg(long)]
    gallery: Option<PathBuf>,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
const PROCESSED_KEY: &str = "gallery.processed.v1";

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("inscribe error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_pipeline(args),
        Command::Embed(args) => run_embed(args),
        Command::Read(args) => run_read(args),
        Command::Status(args) => run_status(args),
    }
}

fn run_pipeline(args: RunArgs) -> Result<i32> {
    let preferred =
        CaptionProviderKind::from_str(&args.provider).map_err(|err| anyhow::anyhow!(err))?;
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;

    let store = KvStore::new(args.out.join("state.json"));
    let gallery = Arc::new(DirectoryGallery {
        root: args.gallery.clone(),
        store: store.clone(),
    });
    let writer = Arc::new(FsGalleryWriter {
        dir: args.out.clone(),
    });

    let mut provider_config = ProviderConfig::from_env();
    provider_config.preferred_provider = preferred;
    let engine = CaptionEngine::new(provider_config, Arc::new(DryrunBackend));
    let embedder = EmbedEngine::new(writer, EmbedOptions::default());

    let network_kind = args
        .network
        .as_deref()
        .map(parse_network_kind)
        .transpose()?;
    let monitor = StaticMonitor {
        battery: BatteryStatus {
            level_percent: args.battery,
            is_charging: args.charging.then_some(true),
        },
        network: NetworkStatus {
            is_connected: true,
            kind: network_kind,
        },
    };
    let scheduler = CaptionScheduler::new(
        SchedulerContext {
            gallery,
            reader: Arc::new(EmbeddedMetadataReader),
            monitor: Arc::new(monitor),
            store,
            events: EventWriter::new(args.out.join("events.jsonl"), "cli"),
        },
        engine,
        embedder,
        Default::default(),
    );
    scheduler.update_config(&SchedulerConfigPatch {
        max_images_per_run: Some(args.max_images),
        delay_between_images_ms: Some(args.delay_ms),
        detailed_captions: Some(args.detailed),
        ..Default::default()
    });
    scheduler.initialize()?;
    if args.reset_history {
        scheduler.clear_processed_history()?;
    }

    let result = scheduler.run_captioning_pipeline();
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(i32::from(result.outcome == RunOutcome::Failed))
}

fn run_embed(args: EmbedArgs) -> Result<i32> {
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let writer = Arc::new(FsGalleryWriter {
        dir: args.out.clone(),
    });
    let engine = EmbedEngine::new(
        writer,
        EmbedOptions {
            backup_dir: args.backup.clone(),
            album_id: None,
        },
    );
    let result = engine.embed_caption(&args.image, &args.caption, None);
    if args.sidecar && result.success {
        let sidecar = create_xmp_sidecar(&args.image, &args.caption)?;
        println!("sidecar written to {}", sidecar.display());
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(i32::from(!result.success))
}

fn run_read(args: ReadArgs) -> Result<i32> {
    let bytes = fs::read(&args.image)
        .with_context(|| format!("failed to read {}", args.image.display()))?;
    match read_embedded_description(&bytes) {
        Some(description) => {
            println!("{description}");
            Ok(0)
        }
        None => {
            eprintln!("no embedded description found");
            Ok(1)
        }
    }
}

fn run_status(args: StatusArgs) -> Result<i32> {
    let store = KvStore::new(args.out.join("state.json"));
    let persisted = PersistedState::load(&store);
    let pending = match &args.gallery {
        Some(root) => {
            let gallery = DirectoryGallery {
                root: root.clone(),
                store: store.clone(),
            };
            let exclude = gallery.processed_image_ids()?;
            Some(gallery.detect_unprocessed_images(&exclude, usize::MAX)?.len())
        }
        None => None,
    };
    let status = json!({
        "last_run_time": persisted
            .last_run_time
            .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
        "processed_total": persisted.processed_total,
        "pending_count": pending,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(0)
}

/// Plain-directory gallery. Image ids are file names; the processed set
/// is persisted in the run's state file so repeat runs resume where the
/// previous one stopped.
struct DirectoryGallery {
    root: PathBuf,
    store: KvStore,
}

impl DirectoryGallery {
    fn load_processed(&self) -> HashSet<String> {
        self.store
            .get(PROCESSED_KEY)
            .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
            .unwrap_or_default()
            .into_iter()
            .collect()
    }

    fn save_processed(&self, ids: &HashSet<String>) -> Result<()> {
        let mut sorted: Vec<&String> = ids.iter().collect();
        sorted.sort();
        self.store.set(PROCESSED_KEY, &serde_json::to_string(&sorted)?)
    }
}

impl GalleryStore for DirectoryGallery {
    fn has_full_access(&self) -> bool {
        self.root.is_dir()
    }

    fn detect_unprocessed_images(
        &self,
        exclude: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<ImageRef>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed to list {}", self.root.display()))?;
        let mut images = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || !has_image_extension(&path) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|value| value.to_str()) else {
                continue;
            };
            if exclude.contains(name) {
                continue;
            }
            let modified = entry.metadata().and_then(|meta| meta.modified()).ok();
            images.push((modified, ImageRef {
                id: name.to_string(),
                path,
            }));
        }
        // Newest first, matching how galleries surface recent photos.
        images.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(images
            .into_iter()
            .map(|(_, image)| image)
            .take(limit)
            .collect())
    }

    fn add_processed_image_id(&self, id: &str) -> Result<()> {
        let mut ids = self.load_processed();
        ids.insert(id.to_string());
        self.save_processed(&ids)
    }

    fn processed_image_ids(&self) -> Result<HashSet<String>> {
        Ok(self.load_processed())
    }

    fn clear_processed_image_ids(&self) -> Result<()> {
        self.store.remove(PROCESSED_KEY)
    }
}

fn parse_network_kind(raw: &str) -> Result<NetworkKind> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "wifi" => Ok(NetworkKind::Wifi),
        "cellular" => Ok(NetworkKind::Cellular),
        "ethernet" => Ok(NetworkKind::Ethernet),
        "other" => Ok(NetworkKind::Other),
        other => bail!("unknown network kind '{other}'"),
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .map(|value| IMAGE_EXTENSIONS.contains(&value.as_str()))
        .unwrap_or(false)
}

/// Writes finished assets into a flat output directory. Asset ids are
/// content-addressed so re-embedding identical bytes is idempotent.
struct FsGalleryWriter {
    dir: PathBuf,
}

impl GalleryWriter for FsGalleryWriter {
    fn create_asset(&self, local_path: &Path) -> Result<String> {
        let bytes = fs::read(local_path)
            .with_context(|| format!("failed to read {}", local_path.display()))?;
        let digest = Sha256::digest(&bytes);
        let asset_id = hex::encode(&digest[..6]);
        let name = local_path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("asset");
        let dest = self.dir.join(format!("{asset_id}-{name}"));
        fs::write(&dest, bytes)
            .with_context(|| format!("failed to write {}", dest.display()))?;
        Ok(asset_id)
    }

    fn add_asset_to_album(&self, asset_id: &str, album_id: &str) -> Result<()> {
        use std::io::Write as _;
        let path = self.dir.join("albums.tsv");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{album_id}\t{asset_id}")?;
        Ok(())
    }
}

/// Surfaces whatever caption the image bytes already carry.
struct EmbeddedMetadataReader;

impl MetadataReader for EmbeddedMetadataReader {
    fn read_image_metadata(&self, path: &Path) -> Result<Option<ImageMetadata>> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Some(ImageMetadata {
            description: read_embedded_description(&bytes),
        }))
    }
}

const DRYRUN_SUBJECTS: &[&str] = &[
    "a person", "a dog", "a group of people", "a cat", "a child", "a cyclist",
];
const DRYRUN_ACTIVITIES: &[&str] = &[
    "standing", "sitting", "walking", "playing", "smiling", "looking around",
];
const DRYRUN_PLACES: &[&str] = &[
    "near a window", "on a street", "by the water", "in a room", "under a tree", "on the grass",
];

/// Deterministic offline stand-in for a real vision model: the caption is
/// derived from a digest of the image bytes, so the same image always gets
/// the same answer and tests need no network.
struct DryrunBackend;

impl OnDeviceBackend for DryrunBackend {
    fn infer(&self, image_path: &Path) -> Result<OnDeviceInference> {
        let bytes = fs::read(image_path)
            .with_context(|| format!("failed to read {}", image_path.display()))?;
        if bytes.is_empty() {
            bail!("image file is empty");
        }
        let digest = Sha256::digest(&bytes);
        let subject = DRYRUN_SUBJECTS[digest[0] as usize % DRYRUN_SUBJECTS.len()];
        let activity = DRYRUN_ACTIVITIES[digest[1] as usize % DRYRUN_ACTIVITIES.len()];
        let place = DRYRUN_PLACES[digest[2] as usize % DRYRUN_PLACES.len()];
        let scene = if digest[3] % 2 == 0 { "indoor" } else { "outdoor" };
        let mut signal_breakdown = serde_json::Map::new();
        signal_breakdown.insert("scene".to_string(), json!(scene));
        signal_breakdown.insert("digest".to_string(), json!(hex::encode(&digest[..6])));
        Ok(OnDeviceInference {
            success: true,
            confidence_score: 0.5 + f64::from(digest[4]) / 512.0,
            caption_text: format!("{subject} {activity} {place}"),
            signal_breakdown,
        })
    }
}
