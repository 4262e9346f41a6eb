use clap::{Parser, Subcommand};
use first_packet::catalog::{AssetCatalog, AssetScanner, ScanOptions};
use first_packet::config::{self, OptimizerConfig};
use first_packet::orchestrator::Orchestrator;
use first_packet::{critical, report};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "first-packet")]
#[command(about = "Fit a page's critical resources into the first 14KB")]
#[command(long_about = "\
Fit a page's critical resources into the first 14KB

Browsers receive about 14KB before the first round trip completes. first-packet
scans a static asset tree, extracts the CSS each page needs above the fold,
bundles assets so the critical bundles fit that budget after compression, and
rewrites page templates to inline critical CSS and defer everything else.

Layout:

  static/                 # Assets: css, js, images, fonts
  templates/              # Pages (.html, .htm) to optimize
  first-packet.toml       # Optional config (see 'first-packet gen-config')

Output:

  dist/bundles/           # Bundles, precompressed siblings, bundles.json
  dist/templates/         # Optimized pages
  dist/reports/           # build-report.txt, build-results.json, build-report.html

Critical assets are matched by [assets] critical_patterns; earlier patterns
rank higher and are the last to be demoted when the budget is tight.")]
#[command(version)]
struct Cli {
    /// Config file
    #[arg(long, default_value = config::CONFIG_FILENAME, global = true)]
    config: PathBuf,

    /// Static asset root (overrides [paths] static_dir)
    #[arg(long, global = true)]
    static_dir: Option<PathBuf>,

    /// Templates root (overrides [paths] templates_dir)
    #[arg(long, global = true)]
    templates_dir: Option<PathBuf>,

    /// Output directory (overrides [paths] output_dir)
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Flags shared by the commands that run the pipeline.
#[derive(clap::Args, Clone)]
struct BuildArgs {
    /// Disable the build cache: recompute every artifact
    #[arg(long)]
    no_cache: bool,

    /// Run every stage one at a time, even parallelizable ones
    #[arg(long)]
    sequential: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline once (or keep watching if [build] watch_mode is set)
    Build(BuildArgs),
    /// Scan the static root and list what was found
    Scan,
    /// Print the critical CSS of one stylesheet for one page
    Extract {
        /// Stylesheet to extract from
        css: PathBuf,
        /// Page whose above-the-fold markup selects the rules
        html: PathBuf,
        /// Budget in bytes (defaults to [budget] critical_bytes)
        #[arg(long)]
        budget: Option<usize>,
    },
    /// Build, then rebuild whenever static assets or templates change
    Watch(BuildArgs),
    /// Print a stock first-packet.toml with all options documented
    GenConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match &cli.command {
        Command::Build(args) => {
            let config = load_config(&cli, Some(args))?;
            init_thread_pool(&config.processing);
            let watch = config.build.watch_mode;
            let orchestrator = Orchestrator::new(config);
            let cancel = cancel_on_ctrl_c();
            if watch {
                run_watch(&orchestrator, &cancel).await;
                return Ok(());
            }
            match orchestrator.build_optimized(&cancel).await {
                Ok(results) => report::print_build_summary(&results),
                Err(err) => {
                    report::print_build_report(err.results());
                    return Err(err.into());
                }
            }
        }
        Command::Scan => {
            let config = load_config(&cli, None)?;
            init_thread_pool(&config.processing);
            let catalog = AssetCatalog::new(ScanOptions::from_config(&config.assets));
            println!("==> Scanning {}", config.paths.static_dir.display());
            let summary = catalog.scan(&config.paths.static_dir)?;
            report::print_scan_output(&summary, &catalog.assets());
        }
        Command::Extract { css, html, budget } => {
            let config = load_config(&cli, None)?;
            let budget = budget.unwrap_or(config.budget.critical_bytes);
            let full_css = std::fs::read_to_string(css)?;
            let page = std::fs::read_to_string(html)?;
            let extracted = critical::extract_critical(&full_css, &page, budget);
            println!("{}", extracted.css);
            for line in report::format_extract_output(&extracted, budget) {
                eprintln!("{}", line);
            }
        }
        Command::Watch(args) => {
            let config = load_config(&cli, Some(args))?;
            init_thread_pool(&config.processing);
            let orchestrator = Orchestrator::new(config);
            run_watch(&orchestrator, &cancel_on_ctrl_c()).await;
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

/// Load the config file (stock defaults when absent), then apply CLI overrides.
fn load_config(
    cli: &Cli,
    args: Option<&BuildArgs>,
) -> Result<OptimizerConfig, config::ConfigError> {
    let mut config = config::load_config(&cli.config)?;
    if let Some(dir) = &cli.static_dir {
        config.paths.static_dir = dir.clone();
    }
    if let Some(dir) = &cli.templates_dir {
        config.paths.templates_dir = dir.clone();
    }
    if let Some(dir) = &cli.output {
        config.paths.output_dir = dir.clone();
    }
    if let Some(args) = args {
        if args.no_cache {
            config.build.enable_build_cache = false;
        }
        if args.sequential {
            config.build.parallel_stages = false;
        }
    }
    Ok(config)
}

async fn run_watch(orchestrator: &Orchestrator, cancel: &CancellationToken) {
    let sweeper = orchestrator.spawn_cache_sweeper(cancel.clone());
    orchestrator.watch(cancel).await;
    if let Some(handle) = sweeper {
        handle.await.ok();
    }
    if let Some(summary) = orchestrator.build_summary() {
        println!("{summary}");
    }
}

/// A token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupt received, cancelling");
            token.cancel();
        }
    });
    cancel
}

/// Initialize the rayon thread pool based on processing config.
///
/// Capped at the number of available cores.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_threads(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}

