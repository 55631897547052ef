use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use image::ImageFormat;
use log::{info, warn};
use serde::Serialize;
use serde_json::Value;

use mapanno::annotation::{AnnotationPage, ImageRecord, Motivation};
use mapanno::config::ConfigFile;
use mapanno::detect::dedup::{deduplicate_record, ScalePreference};
use mapanno::detect::external::{ExternalConfig, ExternalDetector};
use mapanno::detect::pipeline::{Pipeline, PipelineConfig};
use mapanno::georef::{self, GeorefEntry, ManifestRef, ALLMAPS_ANNOTATIONS_URL};
use mapanno::htr;
use mapanno::manifest::{set_target_source, Manifest};
use mapanno::snippets;

/// Tiled segmentation and annotation maintenance for digitised maps
#[derive(Parser)]
#[command(name = "mapanno", version)]
struct Cli {
    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log per-tile detail
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Segment images with an external detector, writing raw and deduplicated annotations.
    Segment(SegmentArgs),
    /// Re-run deduplication over raw output files.
    Dedup {
        /// Raw output files (`<image>.json`)
        #[arg(required = true)]
        records: Vec<PathBuf>,

        #[command(flatten)]
        tuning: Tuning,

        /// Pretty-print JSON output
        #[arg(long)]
        pretty: bool,
    },
    /// Point annotation pages at the canvases named by a IIIF manifest.
    PatchCanvas {
        /// IIIF manifest whose canvases carry `Filename` metadata
        manifest: PathBuf,
        /// Folder with one `<filename>.json` annotation page per canvas
        pages: PathBuf,
    },
    /// Cut upright line snippets out of images for handwritten text recognition.
    Snippets {
        /// Input images; each needs `<pages>/<image>.json`
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Folder with one text-spotting annotation page per image
        #[arg(long)]
        pages: PathBuf,
        /// Output folder; each image gets `<out>/<image>/` with PNGs and `lines.txt`
        #[arg(short, long)]
        out: PathBuf,
        /// Directory the recogniser sees the snippets in, written into `lines.txt`
        #[arg(long)]
        lines_prefix: Option<String>,
    },
    /// Attach HTR transcriptions to text-spotting annotation pages.
    Htr {
        /// Folder with one `<image>/results.tsv` per image
        snippets: PathBuf,
        /// Folder with one `<image>.json` annotation page per image
        pages: PathBuf,
    },
    /// Fetch georeferencing annotations from Allmaps and re-point them at canvases.
    Georef {
        /// JSON list of `{identifier, iiif_info_url, canvas_id}` entries
        entries: PathBuf,
        /// IIIF manifest the canvases belong to
        #[arg(long)]
        manifest: PathBuf,
        /// Base URL the pages are published under
        #[arg(long)]
        prefix: String,
        /// Output folder; pages go to `<out>/georeferencing/`
        #[arg(short, long)]
        out: PathBuf,
        /// Annotation service queried with `?url=<iiif_info_url>`
        #[arg(long, default_value = ALLMAPS_ANNOTATIONS_URL)]
        service: String,
    },
}

#[derive(clap::Args)]
struct SegmentArgs {
    /// Input image files (PNG or JPEG)
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Output folder; each image gets `<out>/<image>/`
    #[arg(short, long)]
    out: PathBuf,

    /// Detector program; receives the tile PNG path as its last argument
    #[arg(long)]
    detector: PathBuf,

    /// Extra argument passed to the detector before the tile path (repeatable)
    #[arg(long = "detector-arg", allow_hyphen_values = true)]
    detector_args: Vec<String>,

    /// Model weights the detector loads; must exist
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Generator id credited in annotations
    #[arg(long, default_value = "sam2")]
    name: String,

    /// Per-tile detector timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Prefix joined with the image file stem to form the canvas id
    #[arg(long, default_value = "canvas:")]
    canvas_prefix: String,

    #[arg(long, value_enum)]
    motivation: Option<MotivationArg>,

    /// Tile window size in pixels
    #[arg(long)]
    window_size: Option<u32>,

    /// Tile step in pixels
    #[arg(long)]
    step_size: Option<u32>,

    /// Shrink factor between scale levels
    #[arg(long)]
    resize_factor: Option<u32>,

    /// Drop detections within this many pixels of a tile edge
    #[arg(long)]
    border: Option<u32>,

    /// Minimum detection area in tile pixels
    #[arg(long)]
    min_area: Option<f64>,

    /// Maximum detection area as a fraction of the tile
    #[arg(long)]
    max_area_fraction: Option<f64>,

    #[arg(long)]
    min_confidence: Option<f32>,

    #[arg(long)]
    min_stability: Option<f32>,

    #[command(flatten)]
    tuning: Tuning,

    /// Pretty-print JSON output
    #[arg(long)]
    pretty: bool,
}

/// Settings shared by `segment` and `dedup`.
#[derive(clap::Args)]
struct Tuning {
    /// TOML file with pipeline settings; flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// IoU above which two detections are duplicates
    #[arg(long)]
    overlap_threshold: Option<f64>,

    /// Which scale wins an overlapping pair
    #[arg(long, value_enum)]
    prefer: Option<PreferArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum PreferArg {
    Coarser,
    Finer,
}

#[derive(Clone, Copy, ValueEnum)]
enum MotivationArg {
    Segmenting,
    Textspotting,
}

impl Tuning {
    fn load(&self) -> Result<ConfigFile> {
        let mut file = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config: {}", path.display()))?;
                ConfigFile::from_toml_str(&text)
                    .with_context(|| format!("invalid config: {}", path.display()))?
            }
            None => ConfigFile::default(),
        };
        if let Some(v) = self.overlap_threshold {
            file.overlap_threshold = v;
        }
        if let Some(v) = self.prefer {
            file.prefer = match v {
                PreferArg::Coarser => ScalePreference::Coarser,
                PreferArg::Finer => ScalePreference::Finer,
            };
        }
        Ok(file)
    }
}

impl SegmentArgs {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut file = self.tuning.load()?;
        if let Some(v) = self.window_size {
            file.window_size = v;
        }
        if let Some(v) = self.step_size {
            file.step_size = v;
        }
        if let Some(v) = self.resize_factor {
            file.resize_factor = v;
        }
        if let Some(v) = self.border {
            file.border_threshold = v;
        }
        if let Some(v) = self.min_area {
            file.min_area = v;
        }
        if let Some(v) = self.max_area_fraction {
            file.max_area_fraction = v;
        }
        if let Some(v) = self.min_confidence {
            file.min_confidence = v;
        }
        if let Some(v) = self.min_stability {
            file.min_stability = v;
        }
        if let Some(v) = self.motivation {
            file.motivation = match v {
                MotivationArg::Segmenting => Motivation::Segmenting,
                MotivationArg::Textspotting => Motivation::Textspotting,
            };
        }
        Ok(file.into_pipeline_config()?)
    }

    fn canvas_id(&self, stem: &str) -> String {
        format!("{}{stem}", self.canvas_prefix)
    }

    fn external_config(&self) -> ExternalConfig {
        ExternalConfig {
            args: self.detector_args.clone(),
            weights: self.weights.clone(),
            timeout: self.timeout.map(Duration::from_secs),
            ..ExternalConfig::new(&self.name, &self.detector)
        }
    }
}

#[derive(Serialize)]
struct ImageSummary {
    image: String,
    width: u32,
    height: u32,
    tiles: usize,
    failed_tiles: usize,
    detections: usize,
    duplicates: usize,
    output: PathBuf,
}

fn init_logger(cli: &Cli) {
    let level = if cli.quiet {
        "warn"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T, pretty: bool) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let json = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn file_stem(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .with_context(|| format!("no usable file name: {}", path.display()))
}

/// Directory names are scan names and may contain dots.
fn dir_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .with_context(|| format!("no usable directory name: {}", path.display()))
}

fn segment(args: &SegmentArgs, quiet: bool) -> Result<()> {
    let config = args.pipeline_config()?;
    let detector = ExternalDetector::new(args.external_config())?;
    let pipeline = Pipeline::new(config, detector)?;

    for path in &args.images {
        let image = image::open(path)
            .with_context(|| format!("failed to open image: {}", path.display()))?
            .into_rgb8();
        let stem = file_stem(path)?;
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(stem.as_str())
            .to_string();
        let canvas_id = args.canvas_id(&stem);

        info!("segmenting {} ({}x{})", path.display(), image.width(), image.height());
        let out = pipeline
            .run(&image, &file_name, &canvas_id)
            .with_context(|| format!("detector failed on {}", path.display()))?;

        let dir = args.out.join(&stem);
        write_json(&dir.join(format!("{stem}.json")), &out.record, args.pretty)?;
        let filtered = dir.join("filtered_annotations.json");
        write_json(&filtered, &out.annotations, args.pretty)?;

        if !quiet {
            let summary = ImageSummary {
                image: file_name,
                width: image.width(),
                height: image.height(),
                tiles: out.stats.tiles,
                failed_tiles: out.stats.failed_tiles,
                detections: out.stats.kept,
                duplicates: out.stats.duplicates,
                output: filtered,
            };
            println!("{}", serde_json::to_string(&summary)?);
        }
    }
    Ok(())
}

fn dedup(records: &[PathBuf], tuning: &Tuning, pretty: bool) -> Result<()> {
    let params = tuning.load()?.into_pipeline_config()?.dedup;
    for path in records {
        let record: ImageRecord = read_json(path)?;
        let result = deduplicate_record(&record, &params);
        if result.malformed > 0 {
            warn!(
                "{}: {} annotations with unreadable selectors left out",
                path.display(),
                result.malformed
            );
        }
        let out = path.with_file_name("filtered_annotations.json");
        write_json(&out, &result.kept, pretty)?;
        info!(
            "{}: kept {}, removed {} duplicates",
            record.image,
            result.kept.len(),
            result.removed
        );
    }
    Ok(())
}

fn patch_canvas(manifest: &Path, pages: &Path) -> Result<()> {
    if !pages.is_dir() {
        bail!("annotation page folder not found: {}", pages.display());
    }
    let text = fs::read_to_string(manifest)
        .with_context(|| format!("manifest file not found: {}", manifest.display()))?;
    let manifest = Manifest::from_json_str(&text).context("invalid manifest")?;

    for canvas in &manifest.items {
        let name = canvas.filename()?;
        let page_path = pages.join(format!("{name}.json"));
        let mut page: Value = read_json(&page_path)?;
        let n = set_target_source(&mut page, &Value::String(canvas.id.clone()))
            .with_context(|| format!("cannot patch {}", page_path.display()))?;
        info!("{name}: {n} annotations now target {}", canvas.id);
        write_json(&page_path, &page, true)?;
    }
    Ok(())
}

fn cut_snippets(
    images: &[PathBuf],
    pages: &Path,
    out: &Path,
    lines_prefix: Option<&str>,
) -> Result<()> {
    for path in images {
        let stem = file_stem(path)?;
        let page_path = pages.join(format!("{stem}.json"));
        if !page_path.is_file() {
            warn!("{}: no annotation page at {}", path.display(), page_path.display());
            continue;
        }
        let page: AnnotationPage = read_json(&page_path)?;
        let image = image::open(path)
            .with_context(|| format!("failed to open image: {}", path.display()))?
            .into_rgb8();

        let run = snippets::extract_snippets(&image, &page);
        let dir = out.join(&stem);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let mut lines = Vec::with_capacity(run.snippets.len());
        for snippet in &run.snippets {
            if snippet.id.contains(|c: char| c == '/' || c == '\\') {
                warn!("{stem}: annotation id {} is not a file name, skipped", snippet.id);
                continue;
            }
            let file = format!("{}.png", snippet.id);
            let snippet_path = dir.join(&file);
            snippet
                .image
                .save_with_format(&snippet_path, ImageFormat::Png)
                .with_context(|| format!("failed to write {}", snippet_path.display()))?;
            lines.push(match lines_prefix {
                Some(prefix) => format!("{prefix}{file}"),
                None => snippet_path.display().to_string(),
            });
        }
        let list = dir.join("lines.txt");
        fs::write(&list, lines.join("\n"))
            .with_context(|| format!("failed to write {}", list.display()))?;
        info!(
            "{stem}: {} snippets, {} too small, {} unreadable selectors",
            lines.len(),
            run.too_small,
            run.malformed
        );
    }
    Ok(())
}

fn attach_htr(snippets: &Path, pages: &Path) -> Result<()> {
    let generator = htr::loghi_generator();
    let entries = fs::read_dir(snippets)
        .with_context(|| format!("failed to list {}", snippets.display()))?;
    for entry in entries {
        let dir = entry?.path();
        if !dir.is_dir() {
            continue;
        }
        let image_name = dir_name(&dir)?;
        let page_path = pages.join(format!("{image_name}.json"));
        let mut page: AnnotationPage = read_json(&page_path)?;

        let tsv_path = dir.join("results.tsv");
        let tsv = fs::read_to_string(&tsv_path)
            .with_context(|| format!("failed to read {}", tsv_path.display()))?;
        let results = htr::parse_results(&tsv)
            .with_context(|| format!("invalid HTR results: {}", tsv_path.display()))?;

        let merge = htr::attach_transcriptions(&mut page, &results, &generator);
        info!(
            "{image_name}: {} transcribed, {} without text dropped",
            merge.transcribed, merge.dropped
        );
        write_json(&page_path, &page, true)?;
    }
    Ok(())
}

struct GeorefTarget<'a> {
    manifest: &'a ManifestRef,
    prefix: &'a str,
}

/// Fetch the page for one entry and re-point it at the entry's canvas.
fn fetch_georef(
    client: &reqwest::blocking::Client,
    service: &str,
    entry: &GeorefEntry,
    target: &GeorefTarget,
) -> Result<Value> {
    let response = client
        .get(service)
        .query(&[("url", entry.iiif_info_url.as_str())])
        .send()?
        .error_for_status()?;
    let page = serde_json::from_str(&response.text()?)?;
    Ok(georef::retarget_page(page, entry, target.manifest, target.prefix)?)
}

fn georeference(
    client: &reqwest::blocking::Client,
    service: &str,
    entries: &Path,
    manifest: &Path,
    prefix: &str,
    out: &Path,
) -> Result<()> {
    let entries: Vec<GeorefEntry> = read_json(entries)?;
    let text = fs::read_to_string(manifest)
        .with_context(|| format!("manifest file not found: {}", manifest.display()))?;
    let manifest = Manifest::from_json_str(&text).context("invalid manifest")?;
    let manifest = ManifestRef {
        id: manifest.id,
        label: manifest.label,
    };

    let target = GeorefTarget {
        manifest: &manifest,
        prefix,
    };
    for entry in &entries {
        let page = match fetch_georef(client, service, entry, &target) {
            Ok(page) => page,
            Err(e) => {
                warn!("{}: no georeferencing fetched: {e:#}", entry.identifier);
                continue;
            }
        };
        let path = out
            .join("georeferencing")
            .join(format!("{}.json", entry.identifier));
        write_json(&path, &page, true)?;
        info!("{}: wrote {}", entry.identifier, path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli);

    match &cli.command {
        Command::Segment(args) => segment(args, cli.quiet),
        Command::Dedup {
            records,
            tuning,
            pretty,
        } => dedup(records, tuning, *pretty),
        Command::PatchCanvas { manifest, pages } => patch_canvas(manifest, pages),
        Command::Snippets {
            images,
            pages,
            out,
            lines_prefix,
        } => cut_snippets(images, pages, out, lines_prefix.as_deref()),
        Command::Htr { snippets, pages } => attach_htr(snippets, pages),
        Command::Georef {
            entries,
            manifest,
            prefix,
            out,
            service,
        } => georeference(
            &reqwest::blocking::Client::new(),
            service,
            entries,
            manifest,
            prefix,
            out,
        ),
    }
}
