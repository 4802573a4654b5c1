use clap::{Parser, Subcommand};
use optipix::cache::OptimizationCache;
use optipix::compress::CompressionChain;
use optipix::config::{self, CONFIG_FILENAME, OptimizerConfig};
use optipix::imaging::RustBackend;
use optipix::output;
use optipix::transcode::{self, BuildRequest, TranscodeOptions};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Flags shared by commands that read the input tree.
#[derive(clap::Args, Clone)]
struct SourceArgs {
    /// Source image directory
    #[arg(long, default_value = "public/assets")]
    input: PathBuf,

    /// Config file (default: <input>/optipix.toml, optional)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(clap::Args, Clone)]
struct BuildArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Output directory for artifacts, manifest and cache
    #[arg(long, default_value = "public/optimized")]
    output: PathBuf,

    /// Skip the external compression stage
    #[arg(long)]
    no_tinypng: bool,

    /// Skip resizing: produce only the desktop viewport at native size
    #[arg(long)]
    no_sizes: bool,

    /// Do not produce WebP artifacts
    #[arg(long)]
    no_webp: bool,

    /// Quality for placements that do not set one (1-100)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=100))]
    quality: Option<u32>,

    /// Delete the optimization cache before running
    #[arg(long)]
    clear_cache: bool,

    /// Re-optimize every image, ignoring the cache and existing artifacts
    #[arg(long)]
    force: bool,
}

#[derive(Parser)]
#[command(name = "optipix")]
#[command(version)]
#[command(about = "Build-time image optimization for responsive web delivery")]
#[command(long_about = "\
Build-time image optimization for responsive web delivery

Every source image under the input directory is resized for each placement it
is assigned to (hero, gallery thumbnail, ...) and encoded in that placement's
preferred formats. The results are recorded in image-manifest.json, which the
delivery layer reads at runtime to pick a format, quality and placeholder for
each client.

Output layout:

  public/optimized/
  ├── image-manifest.json            # source → placement → viewport → artifacts
  ├── .optimization-cache.json       # content hashes of processed sources
  └── hero/
      ├── hero-hero-main-mobile.avif
      ├── hero-hero-main-mobile.webp
      ├── hero-hero-main-mobile.jpg
      └── ...

Unchanged sources are skipped on the next run. Set TINYPNG_API_KEY to enable
external compression.

Run 'optipix gen-config' to print a documented optipix.toml.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Optimize every source image into placement artifacts
    Build(BuildArgs),
    /// Validate the placement registry and show source assignments
    Check(SourceArgs),
    /// Print a stock optipix.toml with all options documented
    GenConfig,
    /// Show the cache state of the last build
    Stats {
        /// Output directory of the build
        #[arg(long, default_value = "public/optimized")]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Build(args) => {
            let mut config = load_source_config(&args.source)?;
            if let Some(quality) = args.quality {
                config.build.quality = quality;
            }
            let registry = config.registry()?;
            init_thread_pool(&config.processing);
            let chain = CompressionChain::from_config(&config.compression, !args.no_tinypng);

            println!(
                "==> Optimizing {} → {}",
                args.source.input.display(),
                args.output.display()
            );
            let (tx, rx) = std::sync::mpsc::channel();
            let printer = std::thread::spawn(move || {
                for event in rx {
                    for line in output::format_process_event(&event) {
                        println!("{}", line);
                    }
                }
            });
            let result = transcode::build(
                &RustBackend::new(),
                &BuildRequest {
                    input: &args.source.input,
                    output: &args.output,
                    registry: &registry,
                    chain: &chain,
                    options: TranscodeOptions {
                        force: args.force,
                        resize: !args.no_sizes,
                        webp: !args.no_webp,
                    },
                    clear_cache: args.clear_cache,
                },
                Some(tx),
            );
            if printer.join().is_err() {
                tracing::warn!("progress printer panicked");
            }
            let report = result?;
            println!();
            output::print_summary(&report);
        }
        Command::Check(args) => {
            let config = load_source_config(&args)?;
            let registry = config.registry()?;
            println!("==> Checking {}", args.input.display());
            let scan = transcode::scan_sources(&args.input, None)?;
            output::print_check_output(&registry, &scan.sources);
            if scan.errors > 0 {
                println!("==> {} unreadable entries skipped", scan.errors);
            }
            println!("==> Registry is valid");
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
        Command::Stats { output: dir } => {
            output::print_stats_output(&OptimizationCache::load(&dir));
        }
    }

    Ok(())
}

/// Config from `--config`, else `<input>/optipix.toml`, else stock defaults.
fn load_source_config(args: &SourceArgs) -> Result<OptimizerConfig, config::ConfigError> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| args.input.join(CONFIG_FILENAME));
    if args.config.is_some() && !path.exists() {
        return Err(config::ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("config file not found: {}", path.display()),
        )));
    }
    config::load_config(&path)
}

/// Initialize the rayon thread pool based on processing config.
///
/// Caps at the number of available CPU cores: the config can lower it, never raise it.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_threads(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}
