use clap::{Parser, Subcommand};

// Display order for log level option (placed at end of help text)
const LOG_LEVEL_DISPLAY_ORDER: usize = 100;

/// CLI arguments
#[derive(Parser)]
#[command(
    name = "ttscan",
    version,
    about = "Find Trusted Types violations in a running web app",
    long_about = None
)]
pub struct Cli {
    /// Log level (see https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html)
    /// [env: TTSCAN_LOG=] [default: info]
    #[arg(
        long,
        env = "TTSCAN_LOG",
        default_value = "info",
        global = true,
        hide_default_value = true,
        hide_env = true,
        display_order = LOG_LEVEL_DISPLAY_ORDER,
        verbatim_doc_comment
    )]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a default ttscan.toml config file
    Init(InitArgs),
    /// Proxy the app, capture violation reports, then report them against source
    Scan(ScanArgs),
    /// Resolve and report previously saved raw reports
    Report(ReportArgs),
    /// List captured violations the static analyzer did not flag
    Validate(ValidateArgs),
}

/// Arguments for the init command
#[derive(Parser)]
pub struct InitArgs {
    /// Path to config file
    #[arg(long, default_value = "ttscan.toml")]
    pub config: String,

    /// Override existing config file
    #[arg(long)]
    pub r#override: bool,
}

/// Options shared by every command that loads the config
#[derive(clap::Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Path to config file (initialize with `ttscan init`, defaults apply if missing)
    #[arg(long, default_value = "ttscan.toml")]
    pub config: String,

    /// Override config values using dot notation (e.g. capture.timeout_secs=30)
    #[arg(long = "config-override")]
    pub config_overrides: Vec<String>,

    /// Project root holding the served build and its source maps
    #[arg(long)]
    pub project_root: Option<String>,
}

/// Arguments for the scan command
#[derive(Parser, Debug)]
pub struct ScanArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Application under test (e.g. http://127.0.0.1:8080)
    #[arg(long)]
    pub upstream: Option<String>,

    /// Address for the capture proxy (e.g. 127.0.0.1:8787)
    #[arg(long)]
    pub listen: Option<String>,

    /// End the scan after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Save raw report payloads (JSON lines) for `report` or `validate`
    #[arg(long)]
    pub save_reports: Option<String>,

    /// Output file path (.md or .json)
    #[arg(long)]
    pub output: Option<String>,
}

/// Arguments for the report command
#[derive(Parser, Debug)]
pub struct ReportArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Raw report file saved by `scan --save-reports`
    #[arg(long)]
    pub reports: String,

    /// Output file path (.md or .json)
    #[arg(long)]
    pub output: Option<String>,
}

/// Arguments for the validate command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Raw report file saved by `scan --save-reports`
    #[arg(long)]
    pub reports: String,

    /// Static analyzer output to compare against
    #[arg(long)]
    pub analyzer_output: String,

    /// Diagnostic code of relevant analyzer lines [default: TS21228]
    #[arg(long)]
    pub diagnostic_code: Option<String>,

    /// Output file path (.md or .json)
    #[arg(long)]
    pub output: Option<String>,
}
