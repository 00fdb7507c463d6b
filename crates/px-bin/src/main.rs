//! Pixelseek entrypoint: run one find from the command line.
//!
//! Loads the optional `pixelseek.toml` settings, builds a needle target from
//! a data file (honoring its `.match` sidecar) or from an explicit match
//! file, runs it against a haystack image, and prints the matches. With
//! `--calibrate` the match configuration is tuned on the pair first and the
//! improved configuration written back beside the needle.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use core_calib::Calibrator;
use core_find::finder::Finder;
use core_find::{finder_for_backend, matchfile, MatchSettings, Target};
use core_resolve::FileResolver;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "pixelseek", version, about = "Find a visual target in an image")]
struct Args {
    /// Needle: an image, text value, pattern, or steps file.
    pub needle: String,
    /// Haystack image to search within.
    pub haystack: PathBuf,
    /// Explicit match file overriding the needle's own settings.
    #[arg(long = "match")]
    pub match_file: Option<PathBuf>,
    /// Required similarity override in [0, 1].
    #[arg(long)]
    pub similarity: Option<f64>,
    /// Configuration file path (overrides discovery of `pixelseek.toml`).
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
    /// Directory to register for target resolution (repeatable).
    #[arg(long = "path")]
    pub paths: Vec<PathBuf>,
    /// Dump image-log artifacts into this directory.
    #[arg(long = "log-dir")]
    pub log_dir: Option<PathBuf>,
    /// Calibrate the configuration on this pair before matching and write
    /// the result back beside the needle.
    #[arg(long)]
    pub calibrate: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn build_finder(args: &Args, needle: &Target) -> Result<Box<dyn Finder>> {
    if let Some(match_file) = &args.match_file {
        return Ok(matchfile::from_file(match_file)?);
    }
    if let MatchSettings::Own(own) = &needle.settings {
        debug!(target: "pixelseek", backend = own.backend_name(), "using the needle's own settings");
        return Ok(own.duplicate());
    }
    let backend = core_config::with(|s| s.find_backend.clone());
    Ok(finder_for_backend(&backend)?)
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    core_config::set(core_config::load_from(args.config.clone()));
    if let Some(log_dir) = &args.log_dir {
        let dest = log_dir.to_string_lossy().into_owned();
        core_config::update(|s| {
            s.image_logging_destination = dest;
            s.image_logging_level = core_config::log_level::DEBUG;
        });
    }

    let resolver = FileResolver::new();
    for path in &args.paths {
        resolver.add_path(path.clone());
    }
    if let Some(parent) = args.haystack.parent() {
        resolver.add_path(parent);
    }

    let needle = Target::from_data_file(&args.needle)
        .with_context(|| format!("loading needle {}", args.needle))?;
    let haystack = Target::image_from_file(&args.haystack.to_string_lossy())
        .with_context(|| format!("loading haystack {}", args.haystack.display()))?;

    let mut finder = build_finder(&args, &needle)?;
    if let Some(similarity) = args.similarity {
        if !(0.0..=1.0).contains(&similarity) {
            bail!("--similarity must lie in [0, 1]");
        }
        finder
            .config_mut()
            .set_value("find", "similarity", core_param::ParamValue::Float(similarity));
    }

    if args.calibrate {
        let calibrator = Calibrator::new(needle.clone(), haystack.clone());
        let attained = calibrator.calibrate(finder.as_mut(), 3);
        info!(target: "pixelseek", attained, "calibration finished");
        let match_path = PathBuf::from(&args.needle).with_extension("match");
        matchfile::to_file(finder.config(), &match_path)?;
        info!(target: "pixelseek", path = %match_path.display(), "updated match file written");
    }

    let matches = finder.find(&needle, &haystack)?;
    if matches.is_empty() {
        info!(target: "pixelseek", "no acceptable match");
        std::process::exit(1);
    }
    for (index, m) in matches.iter().enumerate() {
        let (cx, cy) = m.target();
        println!(
            "{index}: {}x{}+{}+{} similarity={:.4} click=({cx}, {cy})",
            m.width, m.height, m.x, m.y, m.similarity
        );
    }
    Ok(())
}
