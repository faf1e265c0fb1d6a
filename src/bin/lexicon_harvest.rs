use std::io::IsTerminal;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use lexicon_harvest::app::{
    HarvestOptions, HarvestSummary, Harvester, LogProgress, ProgressSinkKind, inspect_dataset,
};
use lexicon_harvest::config::{ConfigLoader, ResolvedConfig};
use lexicon_harvest::domain::ListingKey;
use lexicon_harvest::error::HarvestError;
use lexicon_harvest::fetcher::AssetHttpClient;
use lexicon_harvest::listing::ListingHttpClient;
use lexicon_harvest::output::{JsonOutput, OutputMode};
use lexicon_harvest::tui::Tui;

#[derive(Parser)]
#[command(name = "lexicon-harvest")]
#[command(about = "Crawl the lexicon catalog, cache its animations and keep the CSV dataset current")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// JSON config file (defaults to ./lexicon-harvest.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Crawl the catalog, download missing assets and persist the dataset")]
    Run(RunArgs),
    #[command(about = "Crawl the catalog and persist it without downloading assets")]
    List(RunArgs),
    #[command(about = "Show statistics for a persisted dataset")]
    Show(ShowArgs),
}

#[derive(Args, Clone, Default)]
struct RunArgs {
    #[arg(long)]
    dataset: Option<Utf8PathBuf>,

    #[arg(long)]
    asset_dir: Option<Utf8PathBuf>,

    /// Worker threads for downloads; 0 starts one per record
    #[arg(long)]
    workers: Option<usize>,

    /// Listing keys to crawl, e.g. "abc"
    #[arg(long)]
    keys: Option<String>,
}

#[derive(Args)]
struct ShowArgs {
    dataset: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::ConfigInvalid(_)
        | HarvestError::DatasetNotFound(_) => 2,
        HarvestError::Setup(_) | HarvestError::Persist(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive || !std::io::stdout().is_terminal() {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run_harvest(
            apply_overrides(config, args)?,
            HarvestOptions { skip_assets: false },
            ProgressSinkKind::Harvest,
            output_mode,
        ),
        Commands::List(args) => run_harvest(
            apply_overrides(config, args)?,
            HarvestOptions { skip_assets: true },
            ProgressSinkKind::List,
            output_mode,
        ),
        Commands::Show(args) => {
            let path = args.dataset.unwrap_or(config.dataset);
            let stats = inspect_dataset(&path)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_stats(&stats).into_diagnostic(),
                OutputMode::Interactive => {
                    println!("{}", stats.dataset);
                    println!("  records:       {}", stats.records);
                    println!("  with asset:    {}", stats.with_asset);
                    println!("  without asset: {}", stats.without_asset);
                    Ok(())
                }
            }
        }
    }
}

fn apply_overrides(mut config: ResolvedConfig, args: RunArgs) -> Result<ResolvedConfig, HarvestError> {
    if let Some(dataset) = args.dataset {
        config.dataset = dataset;
    }
    if let Some(asset_dir) = args.asset_dir {
        config.asset_dir = asset_dir;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(keys) = args.keys {
        let keys = ListingKey::space(&keys);
        if keys.is_empty() {
            return Err(HarvestError::ConfigInvalid("key space is empty".to_string()));
        }
        config.keys = keys;
    }
    Ok(config)
}

fn run_harvest(
    config: ResolvedConfig,
    options: HarvestOptions,
    kind: ProgressSinkKind,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let listing = ListingHttpClient::new(config.endpoints.listing_url.clone(), config.timeout)?;
    let assets = AssetHttpClient::new(&config.endpoints, config.timeout)?;
    let harvester = Harvester::new(config, listing, assets);

    match output_mode {
        OutputMode::NonInteractive => {
            let summary = harvester.run(options, &LogProgress)?;
            JsonOutput::print_harvest(&summary).into_diagnostic()
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new(kind);
            let summary = tui.run(move |sink| harvester.run(options, sink))?;
            print_summary(&summary);
            Ok(())
        }
    }
}

fn print_summary(summary: &HarvestSummary) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}lexicon-harvest summary{reset}");
    println!(
        "{green}Records: {} ({} with asset) -> {}{reset}",
        summary.records, summary.with_asset, summary.dataset
    );
    println!(
        "{green}Downloaded: {}   Cached: {}   Retried: {}{reset}",
        summary.downloaded, summary.cached, summary.retried
    );
    if !summary.keys_failed.is_empty() {
        println!(
            "{yellow}Listing keys skipped: {}{reset}",
            summary.keys_failed.join(", ")
        );
    }
    if !summary.failed.is_empty() {
        println!("{red}Assets not resolved: {}{reset}", summary.failed.len());
        for failure in summary.failed.iter().take(20) {
            println!("{red}  {}: {}{reset}", failure.id, failure.error);
        }
        if summary.failed.len() > 20 {
            println!("{red}  ... and {} more{reset}", summary.failed.len() - 20);
        }
    }
    println!("{cyan}Elapsed: {:.1}s{reset}", summary.elapsed_ms as f64 / 1000.0);
}
