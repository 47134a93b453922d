use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facematch::{
    config, FaceMatcher, FolderId, LocalDirSource, MatchOutcome, PhotoSource, ScanOutcome,
};
use log::{info, warn};
use serde_json::json;

#[derive(Parser)]
#[command(name = "facematch")]
#[command(version, about = "Find the event photos a person appears in from one selfie")]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add the faces of every photo in a directory to the index
    Index {
        /// Root of the photo tree
        dir: PathBuf,
        /// Sub-folder of the root to index, relative path
        #[arg(short, long)]
        folder: Option<String>,
    },
    /// Match a selfie against the index
    Match {
        selfie: PathBuf,
    },
    /// Match a selfie against one event folder without the index
    Scan {
        selfie: PathBuf,
        /// Event category, e.g. "Casamento"
        #[arg(short, long)]
        event: String,
        /// Album suffix, e.g. "02-2025"
        #[arg(short, long)]
        month_year: String,
        /// Root of the photo tree
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
    },
    /// List the event categories, or the albums of one category
    Albums {
        /// Category to list, e.g. "Casamento"; top level when omitted
        category: Option<String>,
        /// Root of the photo tree
        #[arg(short, long, default_value = ".")]
        root: PathBuf,
    },
    /// Open config file in editor
    Config,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Index { dir, folder } => index(&open_matcher(config_path)?, &dir, folder),
        Commands::Match { selfie } => match_selfie(&open_matcher(config_path)?, &selfie),
        Commands::Scan {
            selfie,
            event,
            month_year,
            root,
        } => scan(&open_matcher(config_path)?, &root, &event, &month_year, &selfie),
        Commands::Albums { category, root } => albums(&root, category.as_deref()),
        Commands::Config => open_config(config_path),
    }
}

fn open_matcher(config_path: Option<&Path>) -> Result<FaceMatcher> {
    let cfg = config::load_config(config_path)?;
    FaceMatcher::from_config(&cfg).context("Failed to initialize face matcher")
}

fn load_selfie(path: &Path) -> Result<image::DynamicImage> {
    image::open(path).with_context(|| format!("Failed to read selfie {}", path.display()))
}

fn index(matcher: &FaceMatcher, dir: &Path, folder: Option<String>) -> Result<()> {
    let source = LocalDirSource::new(dir);
    let folder = folder.map(FolderId).unwrap_or_else(|| source.root_folder());
    info!("Indexing {:?} under {}", folder.0, dir.display());

    let report = matcher.index_folder(&source, &folder)?;
    if let Some(reason) = &report.unavailable {
        anyhow::bail!("Folder unavailable: {}", reason);
    }
    for (id, reason) in &report.failed {
        warn!("Skipped {}: {}", id, reason);
    }
    info!(
        "✓ {} new image(s), {} face(s); {} already indexed, {} without a face",
        report.indexed_images, report.indexed_faces, report.already_indexed, report.without_face
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn match_selfie(matcher: &FaceMatcher, path: &Path) -> Result<()> {
    let selfie = load_selfie(path)?;
    let matches = match matcher.match_selfie(&selfie)? {
        MatchOutcome::NoFace(reason) => {
            warn!("No match possible: {}", reason);
            println!("{}", json!({ "matches": [], "reason": reason.to_string() }));
            return Ok(());
        }
        MatchOutcome::Matches(matches) => matches,
    };
    info!("Found {} matching image(s)", matches.len());
    println!("{}", serde_json::to_string_pretty(&json!({ "matches": matches }))?);
    Ok(())
}

fn scan(matcher: &FaceMatcher, root: &Path, event: &str, month_year: &str, path: &Path) -> Result<()> {
    let selfie = load_selfie(path)?;
    let source = LocalDirSource::new(root);
    let outcome = matcher.scan_event(&source, &source.root_folder(), event, month_year, &selfie);

    let output = match outcome {
        ScanOutcome::Matches(matches) => {
            info!("Found {} matching photo(s)", matches.len());
            json!({ "success": true, "matches": matches })
        }
        ScanOutcome::NoFace(reason) => json!({ "success": false, "error": reason.to_string() }),
        ScanOutcome::CategoryNotFound(name) => {
            json!({ "success": false, "error": format!("category {:?} not found", name) })
        }
        ScanOutcome::FolderNotFound(name) => {
            json!({ "success": false, "error": format!("folder {:?} not found", name) })
        }
        ScanOutcome::NoImages(name) => {
            json!({ "success": false, "error": format!("no images in {:?}", name) })
        }
        ScanOutcome::SourceUnavailable(reason) => {
            json!({ "success": false, "error": format!("photo source unavailable: {}", reason) })
        }
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn albums(root: &Path, category: Option<&str>) -> Result<()> {
    let source = LocalDirSource::new(root);
    let parent = match category {
        None => source.root_folder(),
        Some(name) => match source.resolve_folder(name, &source.root_folder())? {
            Some(id) => id,
            None => anyhow::bail!("Category {:?} not found under {}", name, root.display()),
        },
    };
    let folders = source.list_folders(&parent).context("Failed to list albums")?;
    info!("Found {} album(s)", folders.len());
    println!("{}", serde_json::to_string_pretty(&json!({ "albums": folders }))?);
    Ok(())
}

fn open_config(path: Option<&Path>) -> Result<()> {
    let config_path = path.unwrap_or(&config::CONFIG_PATH);
    if !config_path.exists() {
        config::save_config(&config::Config::default(), Some(config_path))
            .context("Failed to write default config")?;
    }
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
