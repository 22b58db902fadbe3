use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use reqwest::Url;

use ta_task_core::{Analyst, MAX_RESEARCH_DEPTH};

use crate::constants::{DEFAULT_BIND, DEFAULT_HISTORY_LIMIT};

fn parse_analyst(input: &str) -> Result<Analyst, String> {
    input.parse::<Analyst>().map_err(|e| e.to_string())
}

fn default_analysis_date() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

#[derive(Debug, Clone, Parser)]
#[command(name = "ta-runner", version, about = "Background stock-analysis task runner")]
pub struct Cli {
    /// Directory holding task state (defaults to `$XDG_STATE_HOME/ta-runner`).
    #[arg(long, env = "TA_STATE_DIR", global = true)]
    pub state_dir: Option<PathBuf>,

    /// Base URL of the analysis engine.
    #[arg(long, env = "TA_ENGINE_URL", global = true)]
    pub engine_url: Option<Url>,

    /// Prune finished tasks older than this many hours (0 keeps everything).
    #[arg(long, env = "TA_RETENTION_HOURS", global = true)]
    pub retention_hours: Option<u64>,

    /// Maximum number of analyses running at once (0 means unlimited).
    #[arg(long, env = "TA_MAX_RUNNING", global = true)]
    pub max_running: Option<usize>,

    /// Log at debug level (overridden by `TA_LOG`).
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Start an analysis and watch it until it finishes.
    Run(RunArgs),
    /// Reattach to the last analysis (or the given one) and show its state.
    Status(StatusArgs),
    /// List recent analyses, newest first.
    History(HistoryArgs),
    /// Serve the polling HTTP API.
    Serve(ServeArgs),
    /// Show the settings file, or save new defaults into it.
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Stock symbol, e.g. `AAPL` or `000001`.
    pub symbol: String,

    /// Analysis date (`YYYY-MM-DD`, defaults to today).
    #[arg(long, default_value_t = default_analysis_date())]
    pub date: String,

    /// Comma-separated analysts: market, social, news, fundamentals.
    #[arg(
        short,
        long,
        value_delimiter = ',',
        default_values_t = [Analyst::Market, Analyst::Fundamentals],
        value_parser = parse_analyst
    )]
    pub analysts: Vec<Analyst>,

    /// Research depth.
    #[arg(
        short,
        long,
        default_value_t = 3,
        value_parser = clap::value_parser!(u8).range(1..=i64::from(MAX_RESEARCH_DEPTH))
    )]
    pub depth: u8,

    /// LLM provider (defaults to the settings file).
    #[arg(long)]
    pub provider: Option<String>,

    /// Model used for deep reasoning.
    #[arg(long)]
    pub deep_model: Option<String>,

    /// Model used for quick reasoning.
    #[arg(long)]
    pub quick_model: Option<String>,

    #[arg(long, env = "TA_NO_TUI", default_value_t = false)]
    pub no_tui: bool,
}

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
    /// Task to look up instead of the saved session.
    pub task_id: Option<String>,

    /// Also print the engine's raw output retained with the task.
    #[arg(long, default_value_t = false)]
    pub raw: bool,
}

#[derive(Debug, Clone, Args)]
pub struct HistoryArgs {
    #[arg(short = 'n', long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    pub limit: usize,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    #[arg(long, env = "TA_BIND", default_value = DEFAULT_BIND)]
    pub bind: SocketAddr,
}

/// New defaults for the settings file. The global `--engine-url`,
/// `--retention-hours` and `--max-running` are saved as well when given.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    #[arg(long)]
    pub provider: Option<String>,

    #[arg(long)]
    pub deep_model: Option<String>,

    #[arg(long)]
    pub quick_model: Option<String>,
}
