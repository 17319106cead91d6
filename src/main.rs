mod capture;
mod cli;
mod config;
mod report;
mod resolve;
mod types;
mod validate;
mod violation;

use anyhow::{Context, bail};
use clap::Parser;
use cli::{Cli, Commands, ConfigArgs, InitArgs, ReportArgs, ScanArgs, ValidateArgs};
use config::{Config, ResolveConfig};
use report::render;
use resolve::LocationResolver;
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use violation::Collector;

const EXIT_FAILURE: i32 = 1;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Init(args) => run_init(&args),
        Commands::Scan(args) => run_scan(args).await,
        Commands::Report(args) => run_report(args).await,
        Commands::Validate(args) => run_validate(args).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(EXIT_FAILURE);
    }
}

fn run_init(args: &InitArgs) -> anyhow::Result<()> {
    if Path::new(&args.config).exists() && !args.r#override {
        bail!("{} already exists, pass --override to replace it", args.config);
    }
    let content = Config::default().to_toml()?;
    std::fs::write(&args.config, content)
        .with_context(|| format!("Failed to write {}", args.config))?;
    info!("Created {}", args.config);
    Ok(())
}

fn load_config(args: &ConfigArgs) -> anyhow::Result<Config> {
    let mut config = Config::load_with_overrides(&args.config, &args.config_overrides)
        .context("Failed to load config")?;
    if let Some(root) = &args.project_root {
        config.resolve.project_root = root.into();
    }
    Ok(config)
}

fn resolver(config: &ResolveConfig) -> LocationResolver {
    LocationResolver::new(&config.project_root)
        .static_dir(config.static_dir.clone())
        .static_prefix(config.static_prefix.clone())
}

/// Replay saved raw reports into a fresh collector
fn replay(path: &str, config: &Config) -> anyhow::Result<Collector> {
    let payloads = capture::journal::load_reports(path)?;
    let mut collector = Collector::with_exclusions(&config.capture.exclude_sources);
    for payload in &payloads {
        collector.ingest(payload);
    }
    info!(
        "Replayed {} payloads into {} distinct locations",
        payloads.len(),
        collector.len()
    );
    Ok(collector)
}

fn check_output(output: Option<&str>) -> anyhow::Result<()> {
    match output {
        Some(path) if !path.ends_with(".md") && !path.ends_with(".json") => {
            bail!("Output file must end with .md or .json")
        }
        _ => Ok(()),
    }
}

async fn run_scan(args: ScanArgs) -> anyhow::Result<()> {
    // Reject a bad output path before the operator spends time browsing
    check_output(args.output.as_deref())?;

    let mut config = load_config(&args.config)?;
    if let Some(upstream) = args.upstream {
        config.capture.upstream = upstream;
    }
    if let Some(listen) = args.listen {
        config.capture.listen = listen;
    }
    if args.timeout_secs.is_some() {
        config.capture.timeout_secs = args.timeout_secs;
    }

    let collector = capture::run_scan(&config.capture, args.save_reports.as_deref()).await;
    let (records, lines) = report::resolve_and_render(&collector, &resolver(&config.resolve)).await;
    report::emit(&lines, &records, args.output.as_deref())
}

async fn run_report(args: ReportArgs) -> anyhow::Result<()> {
    check_output(args.output.as_deref())?;
    let config = load_config(&args.config)?;
    let collector = replay(&args.reports, &config)?;
    let (records, lines) = report::resolve_and_render(&collector, &resolver(&config.resolve)).await;
    report::emit(&lines, &records, args.output.as_deref())
}

async fn run_validate(args: ValidateArgs) -> anyhow::Result<()> {
    check_output(args.output.as_deref())?;
    let config = load_config(&args.config)?;
    let analyzer_output = std::fs::read(&args.analyzer_output)
        .with_context(|| format!("Failed to read analyzer output {}", args.analyzer_output))?;
    let collector = replay(&args.reports, &config)?;
    let records = report::resolve_all(collector.records(), &resolver(&config.resolve)).await;

    let code = args
        .diagnostic_code
        .as_deref()
        .unwrap_or(&config.validate.diagnostic_code);
    let missed = validate::find_missed(&analyzer_output, &records, code);
    let lines = render::format_missed(&missed);
    report::emit(&lines, &missed, args.output.as_deref())
}
