//! CLI entry point for hlsforge
//!
//! Parses command line arguments, loads configuration and drives the
//! pipeline. Reports are printed to stdout as JSON; logs go to stderr.

use clap::{Parser, Subcommand};
use hlsforge::catalog::{import_orphans, Catalog, JsonCatalog, Visibility};
use hlsforge::publish::AssetPaths;
use hlsforge::{
    run_startup_checks, CatalogScanner, Config, ConcurrencyPlan, IngestRequest, IngestService,
    RenditionPlanner, SegmentPolicy, SystemRunner, ThumbnailGenerator,
};
use serde_json::json;
use std::collections::HashSet;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// hlsforge - HLS ingestion and adaptive-bitrate transcoding
#[derive(Parser, Debug)]
#[command(name = "hlsforge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file; defaults plus environment when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run preflight checks and print the concurrency plan
    Check,

    /// Transcode and publish one or more uploads
    Transcode {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Comma-separated rendition labels, e.g. 360p,720p
        #[arg(long, value_delimiter = ',')]
        qualities: Vec<String>,

        /// Register published assets in this JSON catalog
        #[arg(long)]
        catalog: Option<PathBuf>,

        #[arg(long)]
        title: Option<String>,

        #[arg(long, default_value = "admin")]
        owner: String,

        #[arg(long, default_value = "private")]
        visibility: Visibility,
    },

    /// List published assets unknown to the catalog
    Scan {
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// Register importable orphans as private assets
    Import {
        #[arg(long)]
        catalog: PathBuf,

        #[arg(long, default_value = "admin")]
        owner: String,
    },

    /// Rebuild the thumbnail of a published asset
    Thumbnail { id: String },

    /// Print the paths of a published asset
    Locate { id: String },

    /// Show the rendition ladder planned for a source
    Plan {
        #[arg(long)]
        height: u32,

        /// Source video bitrate in bits per second
        #[arg(long)]
        bitrate: Option<u64>,
    },
}

type CliResult = Result<ExitCode, Box<dyn Error>>;

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn Error>> {
    let cfg = match path {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    cfg.validate()?;
    Ok(cfg)
}

fn segment_policy(cfg: &Config) -> SegmentPolicy {
    SegmentPolicy::new(cfg.hls.segment_duration_secs, cfg.hls.duration_tolerance_secs)
}

fn print_json(value: &impl serde::Serialize) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn known_ids(catalog: Option<&JsonCatalog>) -> Result<HashSet<String>, Box<dyn Error>> {
    Ok(match catalog {
        Some(catalog) => catalog.known_ids()?,
        None => HashSet::new(),
    })
}

fn check(cfg: &Config) -> CliResult {
    let report = run_startup_checks(cfg, &SystemRunner)?;
    let plan = ConcurrencyPlan::derive(cfg);
    print_json(&json!({ "startup": report, "concurrency": plan }))?;
    Ok(ExitCode::SUCCESS)
}

async fn transcode(
    cfg: &Config,
    inputs: Vec<PathBuf>,
    qualities: Vec<String>,
    catalog: Option<PathBuf>,
    title: Option<String>,
    owner: String,
    visibility: Visibility,
) -> CliResult {
    let mut service = IngestService::new(cfg, Arc::new(SystemRunner))?;
    if let Some(path) = catalog {
        service = service.with_catalog(Arc::new(JsonCatalog::open(path)?));
    }
    info!(
        pool = service.orchestrator().concurrency_plan().encode_pool_size,
        threads = service.orchestrator().concurrency_plan().threads_per_encode,
        "ingest service ready"
    );

    let requests = inputs
        .iter()
        .map(|input| IngestRequest {
            source: input.clone(),
            qualities: qualities.clone(),
            title: title.clone(),
            owner: owner.clone(),
            visibility,
        })
        .collect();
    let outcomes = service.ingest_all(requests).await;

    let mut failed = false;
    let mut results = Vec::with_capacity(outcomes.len());
    for (input, outcome) in inputs.iter().zip(outcomes) {
        match outcome {
            Ok(asset) => results.push(json!({ "source": input, "asset": asset })),
            Err(e) => {
                failed = true;
                error!(source = %input.display(), error = %e, "upload failed");
                results.push(json!({ "source": input, "error": e.to_string() }));
            }
        }
    }
    print_json(&results)?;
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn scan(cfg: &Config, catalog: Option<PathBuf>) -> CliResult {
    let catalog = catalog.map(JsonCatalog::open).transpose()?;
    let known = known_ids(catalog.as_ref())?;
    let scanner = CatalogScanner::new(&cfg.storage.output_root, segment_policy(cfg));
    let orphans: Vec<_> = scanner.scan(&known).collect();
    print_json(&orphans)?;
    Ok(ExitCode::SUCCESS)
}

fn import(cfg: &Config, catalog: PathBuf, owner: &str) -> CliResult {
    let catalog = JsonCatalog::open(catalog)?;
    let known = catalog.known_ids()?;
    let scanner = CatalogScanner::new(&cfg.storage.output_root, segment_policy(cfg));
    let orphans: Vec<_> = scanner.scan(&known).collect();
    let report = import_orphans(orphans, &catalog, owner)?;
    print_json(&report)?;
    Ok(ExitCode::SUCCESS)
}

fn thumbnail(cfg: &Config, id: &str) -> CliResult {
    let Some(paths) = AssetPaths::locate(&cfg.storage.output_root, id) else {
        eprintln!("No published asset with id '{}'", id);
        return Ok(ExitCode::FAILURE);
    };
    let generator = ThumbnailGenerator::from_config(Arc::new(SystemRunner), cfg);
    let path = generator.regenerate(&paths.dir, &segment_policy(cfg))?;
    print_json(&json!({ "id": id, "thumbnail": path }))?;
    Ok(ExitCode::SUCCESS)
}

fn locate(cfg: &Config, id: &str) -> CliResult {
    match AssetPaths::locate(&cfg.storage.output_root, id) {
        Some(paths) => {
            print_json(&paths)?;
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("No published asset with id '{}'", id);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn plan(cfg: &Config, height: u32, bitrate: Option<u64>) -> CliResult {
    let planner = RenditionPlanner::new(cfg.ladder.clone());
    print_json(&planner.plan(height, bitrate))?;
    Ok(ExitCode::SUCCESS)
}

async fn run(cli: Cli) -> CliResult {
    let cfg = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Check => check(&cfg),
        Command::Transcode {
            inputs,
            qualities,
            catalog,
            title,
            owner,
            visibility,
        } => transcode(&cfg, inputs, qualities, catalog, title, owner, visibility).await,
        Command::Scan { catalog } => scan(&cfg, catalog),
        Command::Import { catalog, owner } => import(&cfg, catalog, &owner),
        Command::Thumbnail { id } => thumbnail(&cfg, &id),
        Command::Locate { id } => locate(&cfg, &id),
        Command::Plan { height, bitrate } => plan(&cfg, height, bitrate),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
