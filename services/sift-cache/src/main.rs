//! SIFT workspace cache maintenance tool.
//!
//! Inspects and maintains an on-disk cache store, builds pyramid levels for
//! flat binary sources and exports colorized tiles as PNG.

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use commands::{ExportArgs, SourceArgs};
use config::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "sift-cache")]
#[command(about = "Inspect and maintain the SIFT workspace cache")]
struct Args {
    /// Engine configuration file (YAML)
    #[arg(short, long, env = "SIFT_CONFIG")]
    config: Option<PathBuf>,

    /// Cache root, overriding the configuration file
    #[arg(long, env = "SIFT_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show store usage
    Stats {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,

        /// List every entry
        #[arg(long)]
        entries: bool,
    },

    /// Evict least recently used entries down to a size
    Evict {
        /// Target size in MiB (default: the configured quota)
        #[arg(long)]
        target_mb: Option<u64>,
    },

    /// Discard the index and rebuild it from the entry files
    RebuildIndex,

    /// Build a pyramid level for a source
    Build {
        #[command(flatten)]
        source: SourceOpts,

        /// Level to build (default: the coarsest useful level)
        #[arg(short, long)]
        level: Option<u32>,
    },

    /// Colorize one tile of a level and write it as PNG
    ExportTile {
        #[command(flatten)]
        source: SourceOpts,

        #[arg(short, long, default_value = "0")]
        level: u32,

        /// Tile row
        #[arg(long)]
        row: u32,

        /// Tile column
        #[arg(long)]
        col: u32,

        #[arg(long, default_value = "viridis")]
        colormap: String,

        /// Value mapped to the bottom of the colormap (default: data minimum)
        #[arg(long)]
        vmin: Option<f32>,

        /// Value mapped to the top of the colormap (default: data maximum)
        #[arg(long)]
        vmax: Option<f32>,

        /// Output PNG path
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct SourceOpts {
    /// Source raster path
    source: PathBuf,

    /// Reader format tag (default: chosen by file extension)
    #[arg(long)]
    format: Option<String>,

    /// Band index
    #[arg(long)]
    band: Option<u32>,
}

impl From<SourceOpts> for SourceArgs {
    fn from(opts: SourceOpts) -> Self {
        SourceArgs {
            path: opts.source,
            format: opts.format,
            band: opts.band,
        }
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // Logs go to stderr; command output owns stdout.
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(&args.log_level, args.log_format);

    let mut config = EngineConfig::load(args.config.as_deref())?;
    if let Some(root) = args.cache_dir {
        config.cache.root = root;
    }
    config.validate()?;
    info!(
        root = %config.cache.root.display(),
        quota_mb = config.cache.quota_mb(),
        "Loaded configuration"
    );

    match args.command {
        Command::Stats { json, entries } => commands::stats(&config, json, entries),
        Command::Evict { target_mb } => commands::evict(&config, target_mb),
        Command::RebuildIndex => commands::rebuild_index(&config),
        Command::Build { source, level } => {
            commands::build(&config, &source.into(), level).await
        }
        Command::ExportTile {
            source,
            level,
            row,
            col,
            colormap,
            vmin,
            vmax,
            output,
        } => {
            let export = ExportArgs {
                level,
                row,
                col,
                colormap,
                vmin,
                vmax,
                output,
            };
            commands::export_tile(&config, &source.into(), &export).await
        }
    }
}
