use clap::{ArgAction, Args, Parser, Subcommand};
use nacwatch_core::health::MAX_WINDOW_HOURS;
use nacwatch_core::model::MAX_KEEP_DAYS;
use nacwatch_core::ErrorCategory;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "nacwatch",
    author,
    version,
    about = "Scheduled NAC endpoint reporting with sealed configuration",
    long_about = None
)]
struct Cli {
    /// Configuration directory (defaults to $NACWATCH_HOME, then the platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Key file used to seal and open configuration
    #[arg(long, global = true)]
    key_file: Option<PathBuf>,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate one report, record it, notify, and prune
    RunOnce(RunOnceArgs),
    /// Summarize recent run health
    Health {
        #[arg(
            long,
            value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_WINDOW_HOURS))
        )]
        hours: Option<u32>,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply the retention policy now
    Cleanup {
        #[arg(
            long,
            value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_KEEP_DAYS))
        )]
        reports_days: Option<u32>,
        #[arg(
            long,
            value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_KEEP_DAYS))
        )]
        history_days: Option<u32>,
    },
    /// Seal configuration files (defaults to every plaintext document)
    EncryptConfig {
        files: Vec<PathBuf>,
        /// Overwrite and remove the plaintext after sealing
        #[arg(long)]
        delete_plaintext: bool,
    },
    /// Open sealed configuration files
    DecryptConfig {
        files: Vec<PathBuf>,
        /// Output path; only valid with a single file
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Edit a sealed document in $EDITOR and re-seal it
    EditConfig { file: PathBuf },
    /// Create a new random key file
    CreateKey { path: Option<PathBuf> },
    /// Write sample configuration documents
    Init,
    /// Verify the notification channel and send a test message
    TestNotify,
    /// Print cron entries for the configured schedule
    ScheduleHint,
    /// Show recent runs
    History {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunOnceArgs {
    #[arg(long)]
    pub api_token: Option<String>,
    #[arg(long)]
    pub org_id: Option<String>,
    #[arg(long)]
    pub base_url: Option<String>,
    #[arg(long)]
    pub reports_dir: Option<PathBuf>,
    #[arg(long)]
    pub database: Option<PathBuf>,
    #[arg(long)]
    pub lookback_days: Option<u32>,
    #[arg(long)]
    pub site: Option<String>,
    #[arg(long)]
    pub connection_type: Option<String>,
    /// Output formats, comma separated or repeated
    #[arg(long = "format")]
    pub formats: Vec<String>,
    #[arg(long)]
    pub theme: Option<String>,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn category_of(err: &anyhow::Error) -> ErrorCategory {
    err.chain()
        .find_map(|e| e.downcast_ref::<nacwatch_core::Error>())
        .map(|e| e.category())
        .unwrap_or(ErrorCategory::Other)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match commands::dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let category = category_of(&err);
            error!(category = %category, "{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(category.exit_code())
        }
    }
}
