use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::pipeline::reporter::OutputFormat;

#[derive(Parser, Debug)]
#[command(
    name = "osprey",
    version,
    about = "Finding lifecycle & WAF threat-response engine"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file path (TOML). Default: config/osprey.toml
    #[arg(long)]
    pub config: Option<String>,

    /// Sqlite database path
    #[arg(long, default_value = "data/osprey.db")]
    pub db_path: PathBuf,

    /// Increase verbosity (info, debug, trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log file path
    #[arg(long, default_value = "data/osprey.log")]
    pub log_file: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Reconcile one scan's findings against the stored set
    Reconcile {
        /// Scan results file (JSON array of scan findings)
        #[arg(long)]
        scan: PathBuf,
        /// Organization scope
        #[arg(long)]
        org: String,
        /// Account scope
        #[arg(long)]
        account: String,
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormatArg>,
        /// Output path (file or directory)
        #[arg(long, default_value = "out")]
        output: PathBuf,
        /// Classify only; do not persist mutations
        #[arg(long)]
        dry_run: bool,
    },
    /// Analyze a batch of WAF log records
    Analyze {
        /// WAF log file, one JSON record per line
        #[arg(long)]
        log: PathBuf,
        /// Webhook URL for immediate alerts (overrides config)
        #[arg(long)]
        webhook_url: Option<String>,
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormatArg>,
        /// Output path (file or directory)
        #[arg(long, default_value = "out")]
        output: PathBuf,
    },
    /// Expire stale IP blocks
    Sweep,
    /// Summarize stored findings and active blocks
    Report {
        /// Organization scope
        #[arg(long)]
        org: String,
        /// Account scope
        #[arg(long)]
        account: String,
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormatArg>,
        /// Output path (file or directory)
        #[arg(long, default_value = "out")]
        output: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Debug)]
pub enum OutputFormatArg {
    Json,
    Jsonl,
    Markdown,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(value: OutputFormatArg) -> Self {
        match value {
            OutputFormatArg::Json => OutputFormat::Json,
            OutputFormatArg::Jsonl => OutputFormat::Jsonl,
            OutputFormatArg::Markdown => OutputFormat::Markdown,
        }
    }
}
