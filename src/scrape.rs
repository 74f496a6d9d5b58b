use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cli::RunArgs;
use crate::config::Settings;
use crate::driver::PageDriver;
use crate::extract::{Extraction, Extractor, ExtractorProfile};
use crate::formats::SessionStatus;
use crate::html_driver::{AuthProbe, HtmlDriverOptions, HtmlPageDriver};
use crate::ledger::Ledger;
use crate::storage::{SaveOutcome, Storage};

/// Consecutive scrolls without new content before the source counts as exhausted.
pub const MAX_IDLE_SCROLLS: u32 = 3;

#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub target_url: String,
    pub max_posts: usize,
    pub block_selector: String,
    pub page_settle: Duration,
    pub max_idle_scrolls: u32,
    /// Where page snapshots go when the auth check runs.
    pub debug_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    TargetReached,
    SourceExhausted,
    Cancelled,
    AuthRequired,
    Failed { error: String },
}

impl RunOutcome {
    fn status(&self) -> SessionStatus {
        match self {
            Self::TargetReached | Self::SourceExhausted => SessionStatus::Completed,
            Self::Cancelled => SessionStatus::Interrupted,
            Self::AuthRequired | Self::Failed { .. } => SessionStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub outcome: RunOutcome,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rejected: usize,
}

#[derive(Debug, Default)]
struct Tally {
    processed: usize,
    skipped: usize,
    failed: usize,
    rejected: usize,
}

enum BlockOutcome {
    Saved,
    Skipped,
    SaveFailed,
    Rejected,
    Faulted,
}

enum Stop {
    TargetReached,
    SourceExhausted,
    Cancelled,
    AuthRequired,
}

/// One acquisition run over an already-constructed driver.
///
/// Returns an error only when the session could not be opened or its
/// terminal status could not be written. Once it is open, every path ends in
/// exactly one terminal status on the ledger, a `close()` on the driver and a
/// summary log line; the report says which.
pub fn run_session<D: PageDriver>(
    driver: &mut D,
    extractor: &Extractor,
    ledger: &mut Ledger,
    storage: &Storage,
    options: &LoopOptions,
    cancel: &CancellationToken,
) -> anyhow::Result<RunReport> {
    let session_id = ledger.start_session().context("start session")?;
    tracing::info!(
        session_id = %session_id,
        target = %options.target_url,
        max_posts = options.max_posts,
        "acquisition started"
    );

    let mut tally = Tally::default();
    let outcome = match drive(
        driver,
        extractor,
        ledger,
        storage,
        options,
        cancel,
        &session_id,
        &mut tally,
    ) {
        Ok(Stop::TargetReached) => RunOutcome::TargetReached,
        Ok(Stop::SourceExhausted) => RunOutcome::SourceExhausted,
        Ok(Stop::Cancelled) => RunOutcome::Cancelled,
        Ok(Stop::AuthRequired) => RunOutcome::AuthRequired,
        Err(err) => {
            tracing::error!(session_id = %session_id, err = %format!("{err:#}"), "run failed");
            RunOutcome::Failed {
                error: format!("{err:#}"),
            }
        }
    };

    if let Err(err) = driver.close() {
        tracing::warn!(?err, "driver close failed");
    }

    let report = RunReport {
        status: outcome.status(),
        session_id,
        outcome,
        processed: tally.processed,
        skipped: tally.skipped,
        failed: tally.failed,
        rejected: tally.rejected,
    };
    let closed = ledger
        .end_session(&report.session_id, report.status)
        .with_context(|| format!("close session {}", report.session_id));

    log_summary(&report, ledger, storage);
    closed?;
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn drive<D: PageDriver>(
    driver: &mut D,
    extractor: &Extractor,
    ledger: &mut Ledger,
    storage: &Storage,
    options: &LoopOptions,
    cancel: &CancellationToken,
    session_id: &str,
    tally: &mut Tally,
) -> anyhow::Result<Stop> {
    driver
        .navigate(&options.target_url)
        .with_context(|| format!("navigate to {}", options.target_url))?;

    snapshot(driver, options, &format!("before_login_{session_id}.html"));
    if !driver.is_authenticated().context("check login state")? {
        snapshot(driver, options, &format!("login_failed_{session_id}.html"));
        tracing::error!("not logged in; refresh the saved session cookies and retry");
        return Ok(Stop::AuthRequired);
    }

    // Blocks with a final outcome this run; save failures and faults stay
    // eligible for the next snapshot.
    let mut settled: HashSet<D::Handle> = HashSet::new();
    let mut idle_scrolls = 0_u32;

    loop {
        let blocks = driver
            .query_all(&options.block_selector)
            .context("snapshot post blocks")?;
        let fresh = blocks.iter().filter(|b| !settled.contains(*b)).count();
        tracing::info!(visible = blocks.len(), fresh, "scanning posts");

        for block in blocks {
            if cancel.is_cancelled() {
                return Ok(Stop::Cancelled);
            }
            if tally.processed >= options.max_posts {
                break;
            }
            if settled.contains(&block) {
                continue;
            }

            match process_block(driver, extractor, ledger, storage, session_id, &block)? {
                BlockOutcome::Saved => {
                    tally.processed += 1;
                    settled.insert(block);
                    tracing::info!(
                        processed = tally.processed,
                        max_posts = options.max_posts,
                        "progress"
                    );
                }
                BlockOutcome::Skipped => {
                    tally.skipped += 1;
                    settled.insert(block);
                }
                BlockOutcome::Rejected => {
                    tally.rejected += 1;
                    settled.insert(block);
                }
                BlockOutcome::SaveFailed => tally.failed += 1,
                BlockOutcome::Faulted => {}
            }
        }

        if tally.processed >= options.max_posts {
            tracing::info!(processed = tally.processed, "target reached");
            return Ok(Stop::TargetReached);
        }
        if cancel.is_cancelled() {
            return Ok(Stop::Cancelled);
        }

        let grew = driver.scroll_to_bottom().context("scroll for more posts")?;
        if cancel.is_cancelled() {
            return Ok(Stop::Cancelled);
        }
        if grew {
            idle_scrolls = 0;
        } else {
            idle_scrolls += 1;
            tracing::warn!(
                idle_scrolls,
                max = options.max_idle_scrolls,
                "no new content after scroll"
            );
            if idle_scrolls >= options.max_idle_scrolls {
                tracing::info!("no more content; stopping");
                return Ok(Stop::SourceExhausted);
            }
        }

        if pause(cancel, options.page_settle) {
            return Ok(Stop::Cancelled);
        }
    }
}

fn process_block<D: PageDriver>(
    driver: &mut D,
    extractor: &Extractor,
    ledger: &mut Ledger,
    storage: &Storage,
    session_id: &str,
    block: &D::Handle,
) -> anyhow::Result<BlockOutcome> {
    let extracted = match extractor.extract(driver, block) {
        Extraction::Accepted(extracted) => extracted,
        Extraction::Rejected(reason) => {
            tracing::debug!(?block, %reason, "block rejected");
            return Ok(if reason.is_fault() {
                BlockOutcome::Faulted
            } else {
                BlockOutcome::Rejected
            });
        }
    };

    let record = &extracted.record;
    if extracted.is_low_confidence() {
        tracing::warn!(
            post_id = record.id(),
            source = ?extracted.text_source,
            "text taken from the whole block; may include page chrome"
        );
    }

    if ledger.is_processed(record.id()) {
        tracing::debug!(post_id = record.id(), "already processed; skipping");
        ledger
            .mark_skipped(session_id)
            .context("record skipped post")?;
        return Ok(BlockOutcome::Skipped);
    }

    match storage.save(record) {
        SaveOutcome::Saved(saved) => {
            ledger
                .mark_processed(record.id(), session_id)
                .with_context(|| format!("record processed post {}", record.id()))?;
            tracing::debug!(
                post_id = record.id(),
                record_id = %saved.record_id,
                id_source = ?extracted.id_source,
                "post saved"
            );
            Ok(BlockOutcome::Saved)
        }
        SaveOutcome::Failed { error } => {
            tracing::error!(post_id = record.id(), %error, "save failed");
            ledger
                .mark_failed(session_id)
                .context("record failed post")?;
            Ok(BlockOutcome::SaveFailed)
        }
    }
}

fn snapshot<D: PageDriver>(driver: &D, options: &LoopOptions, name: &str) {
    let Some(dir) = options.debug_dir.as_deref() else {
        return;
    };
    if let Err(err) = driver.screenshot(&dir.join(name)) {
        tracing::warn!(?err, "page snapshot failed");
    }
}

/// Sleeps up to `duration`; returns true if cancelled first.
fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}

fn log_summary(report: &RunReport, ledger: &Ledger, storage: &Storage) {
    tracing::info!(
        session_id = %report.session_id,
        status = %report.status,
        outcome = ?report.outcome,
        processed = report.processed,
        skipped = report.skipped,
        failed = report.failed,
        rejected = report.rejected,
        "session finished"
    );

    let ledger_stats = ledger.get_stats();
    tracing::info!(
        total_all_time = ledger_stats.total_all_time,
        total_sessions = ledger_stats.total_sessions,
        "ledger totals"
    );
    match storage.get_stats() {
        Ok(stats) => tracing::info!(
            total_files = stats.total_files,
            total_posts = stats.total_posts,
            data_dir = %storage.data_dir().display(),
            "storage totals"
        ),
        Err(err) => tracing::warn!(?err, "could not read storage stats"),
    }
}

/// Everything a run needs, resolved from settings up front so config errors
/// surface before a session is opened.
#[derive(Debug, Clone)]
struct RunPlan {
    loop_options: LoopOptions,
    driver_options: HtmlDriverOptions,
    profile: ExtractorProfile,
    state_file: PathBuf,
    data_dir: PathBuf,
}

impl RunPlan {
    fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let target_url = settings.group_url()?;
        let target = Url::parse(&target_url).context("parse facebook.group_url")?;
        let cookie_header = crate::cookies::load_cookie_header(&settings.cookies_path()?, &target)
            .context("load session cookies")?;

        let mut driver_options = HtmlDriverOptions {
            cookie_header,
            timeout: settings.navigation_timeout()?,
            next_page_selector: settings.next_page_selector()?,
            scroll_delay: settings.scroll_delay()?,
            auth: AuthProbe {
                required: settings.auth_required()?,
                ..AuthProbe::default()
            },
            ..HtmlDriverOptions::default()
        };
        if let Some(user_agent) = settings.user_agent()? {
            driver_options.user_agent = user_agent;
        }

        let mut base_url = target.clone();
        base_url.set_path("/");
        base_url.set_query(None);
        base_url.set_fragment(None);
        let profile = ExtractorProfile {
            base_url,
            expand_settle: settings.expand_settle()?,
            ..ExtractorProfile::default()
        };

        Ok(Self {
            loop_options: LoopOptions {
                target_url,
                max_posts: settings.max_posts()?,
                block_selector: settings.post_selector()?,
                page_settle: settings.page_settle()?,
                max_idle_scrolls: MAX_IDLE_SCROLLS,
                debug_dir: Some(settings.log_dir()?),
            },
            driver_options,
            profile,
            state_file: settings.state_file()?,
            data_dir: settings.data_dir()?,
        })
    }
}

/// `run` subcommand: one session against the configured group, stopped early
/// by Ctrl-C or SIGTERM after the current post.
pub async fn run(mut settings: Settings, args: RunArgs) -> anyhow::Result<RunReport> {
    if args.headless {
        settings.set_override("scraper.headless", serde_json::Value::Bool(true));
    }
    if let Some(max_posts) = args.max_posts {
        settings.set_override("scraper.max_posts_per_run", serde_json::Value::from(max_posts));
    }

    let plan = RunPlan::from_settings(&settings).context("resolve run settings")?;
    tracing::info!(
        config = %settings.path().display(),
        headless = settings.headless()?,
        data_dir = %plan.data_dir.display(),
        state_file = %plan.state_file.display(),
        "starting run"
    );

    let cancel = CancellationToken::new();
    let listener = tokio::spawn(cancel_on_interrupt(cancel.clone()));

    let blocking_cancel = cancel.clone();
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<RunReport> {
        let mut ledger = Ledger::open(&plan.state_file).context("open ledger")?;
        let storage = Storage::new(&plan.data_dir).context("open storage")?;
        let extractor = Extractor::new(plan.profile);
        let mut driver = HtmlPageDriver::new(plan.driver_options).context("start page driver")?;
        run_session(
            &mut driver,
            &extractor,
            &mut ledger,
            &storage,
            &plan.loop_options,
            &blocking_cancel,
        )
    })
    .await
    .context("join scrape worker")?;

    listener.abort();
    result
}

async fn cancel_on_interrupt(cancel: CancellationToken) {
    tokio::select! {
        () = wait_for_interrupt() => {
            tracing::warn!("interrupt received; stopping after the current post");
            cancel.cancel();
        }
        () = cancel.cancelled() => {}
    }
}

#[cfg(unix)]
async fn wait_for_interrupt() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(?err, "cannot listen for SIGTERM; Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt() {
    let _ = tokio::signal::ctrl_c().await;
}
