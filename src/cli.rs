use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the JSON config file.
    #[arg(long, global = true, default_value = "config/config.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scrape new posts from the configured group.
    Run(RunArgs),
    /// Print ledger and storage totals as JSON.
    Stats,
    /// Print one day's saved posts as JSON lines.
    Load(LoadArgs),
    /// Prune ledger entries and sessions older than the retention window.
    Cleanup(CleanupArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Run without a visible browser window (overrides `scraper.headless`).
    #[arg(long)]
    pub headless: bool,

    /// Stop after this many new posts (overrides `scraper.max_posts_per_run`).
    #[arg(long)]
    pub max_posts: Option<usize>,
}

#[derive(Debug, Args)]
pub struct LoadArgs {
    /// Shard date (`YYYY-MM-DD`).
    #[arg(long)]
    pub date: String,
}

#[derive(Debug, Args)]
pub struct CleanupArgs {
    /// Keep entries processed within this many days.
    #[arg(long, default_value_t = 30)]
    pub keep_days: u32,
}
