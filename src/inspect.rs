use std::io::Write as _;

use anyhow::Context as _;
use chrono::NaiveDate;
use serde::Serialize;

use crate::cli::{CleanupArgs, LoadArgs};
use crate::config::Settings;
use crate::ledger::{CleanupSummary, Ledger, LedgerStats};
use crate::storage::{Storage, StorageStats};

#[derive(Debug, Serialize)]
pub struct Stats {
    pub ledger: LedgerStats,
    pub storage: StorageStats,
}

pub fn stats(settings: &Settings) -> anyhow::Result<Stats> {
    let ledger = Ledger::open(settings.state_file()?).context("open ledger")?;
    let storage = Storage::new(settings.data_dir()?).context("open storage")?;
    Ok(Stats {
        ledger: ledger.get_stats(),
        storage: storage.get_stats().context("read storage stats")?,
    })
}

pub fn print_stats(settings: &Settings) -> anyhow::Result<()> {
    let stats = stats(settings)?;
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &stats).context("write stats")?;
    stdout.write_all(b"\n").context("write stats")?;
    Ok(())
}

pub fn load(settings: &Settings, args: LoadArgs) -> anyhow::Result<()> {
    let date = NaiveDate::parse_from_str(args.date.trim(), "%Y-%m-%d")
        .with_context(|| format!("parse --date (want YYYY-MM-DD): {}", args.date))?;
    let storage = Storage::new(settings.data_dir()?).context("open storage")?;
    let records = storage.load(date)?;
    tracing::info!(%date, count = records.len(), "loaded shard");

    let mut stdout = std::io::stdout().lock();
    for record in &records {
        serde_json::to_writer(&mut stdout, record).context("write record")?;
        stdout.write_all(b"\n").context("write record")?;
    }
    Ok(())
}

pub fn cleanup(settings: &Settings, args: CleanupArgs) -> anyhow::Result<CleanupSummary> {
    let mut ledger = Ledger::open(settings.state_file()?).context("open ledger")?;
    let summary = ledger
        .cleanup_old_data(chrono::Duration::days(i64::from(args.keep_days)))
        .context("clean ledger")?;

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &summary).context("write cleanup summary")?;
    stdout.write_all(b"\n").context("write cleanup summary")?;
    Ok(summary)
}
