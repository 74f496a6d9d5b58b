mod common;

use chrono::Local;
use postharvest::formats::SessionStatus;
use postharvest::ledger::Ledger;
use postharvest::scrape::{RunOutcome, run_session};
use postharvest::storage::Storage;
use tokio_util::sync::CancellationToken;

use common::{ScriptedDriver, body, extractor, loop_options};

struct Workspace {
    _temp: tempfile::TempDir,
    ledger: Ledger,
    storage: Storage,
    debug_dir: std::path::PathBuf,
}

fn workspace() -> anyhow::Result<Workspace> {
    let temp = tempfile::TempDir::new()?;
    let ledger = Ledger::open(temp.path().join("state").join("scraper_state.json"))?;
    let storage = Storage::new(temp.path().join("data"))?;
    let debug_dir = temp.path().join("logs");
    Ok(Workspace {
        _temp: temp,
        ledger,
        storage,
        debug_dir,
    })
}

#[test]
fn stops_at_target_with_replies_and_duplicates_filtered() -> anyhow::Result<()> {
    let mut ws = workspace()?;
    let earlier = ws.ledger.start_session()?;
    ws.ledger.mark_processed("2002", &earlier)?;
    ws.ledger.end_session(&earlier, SessionStatus::Completed)?;

    let mut driver = ScriptedDriver::new();
    let p1 = driver.post("1001", &body(1));
    let reply = driver.reply("1001", &body(99));
    let p2 = driver.post("1002", &body(2));
    let duplicate = driver.post("2002", &body(3));
    let p3 = driver.post("1003", &body(4));
    let mut driver = driver
        .initially(vec![p1, reply, p2])
        .then_scroll(vec![duplicate, p3])
        .then_scroll(vec![]);

    let report = run_session(
        &mut driver,
        &extractor(),
        &mut ws.ledger,
        &ws.storage,
        &loop_options(3, None),
        &CancellationToken::new(),
    )?;

    assert_eq!(report.outcome, RunOutcome::TargetReached);
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.processed, 3);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(driver.scrolls, 1);
    assert!(driver.closed);

    let saved = ws.storage.load(Local::now().date_naive())?;
    let sequences: Vec<u64> = saved.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    let ids: Vec<&str> = saved.iter().map(|r| r.post_id.as_str()).collect();
    assert_eq!(ids, vec!["1001", "1002", "1003"]);
    assert_eq!(
        saved[0].url.as_deref(),
        Some("https://www.facebook.com/groups/1/posts/1001/")
    );

    let session = ws
        .ledger
        .get_session(&report.session_id)
        .ok_or_else(|| anyhow::anyhow!("session missing"))?;
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.end_time.is_some());
    assert_eq!(session.total_processed, 3);
    assert_eq!(session.total_skipped, 1);
    for id in ["1001", "1002", "1003", "2002"] {
        assert!(ws.ledger.is_processed(id), "{id} should be processed");
    }
    Ok(())
}

#[test]
fn exhausted_source_completes_after_three_idle_scrolls() -> anyhow::Result<()> {
    let mut ws = workspace()?;
    let mut driver = ScriptedDriver::new();
    let p1 = driver.post("1001", &body(1));
    let p2 = driver.post("1002", &body(2));
    let mut driver = driver.initially(vec![p1]).then_scroll(vec![p2]);

    let report = run_session(
        &mut driver,
        &extractor(),
        &mut ws.ledger,
        &ws.storage,
        &loop_options(10, None),
        &CancellationToken::new(),
    )?;

    assert_eq!(report.outcome, RunOutcome::SourceExhausted);
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.processed, 2);
    // Re-seen blocks from earlier snapshots are not counted again.
    assert_eq!(report.skipped, 0);
    assert_eq!(driver.scrolls, 4);
    Ok(())
}

#[test]
fn empty_source_terminates_with_nothing_processed() -> anyhow::Result<()> {
    let mut ws = workspace()?;
    let mut driver = ScriptedDriver::new();

    let report = run_session(
        &mut driver,
        &extractor(),
        &mut ws.ledger,
        &ws.storage,
        &loop_options(3, None),
        &CancellationToken::new(),
    )?;

    assert_eq!(report.outcome, RunOutcome::SourceExhausted);
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.processed, 0);
    assert_eq!(driver.scrolls, 3);
    assert_eq!(ws.storage.get_stats()?.total_posts, 0);
    Ok(())
}

#[test]
fn second_run_skips_everything_already_saved() -> anyhow::Result<()> {
    let mut ws = workspace()?;
    let script = || {
        let mut driver = ScriptedDriver::new();
        let p1 = driver.post("1001", &body(1));
        let p2 = driver.post("1002", &body(2));
        driver.initially(vec![p1, p2])
    };

    let first = run_session(
        &mut script(),
        &extractor(),
        &mut ws.ledger,
        &ws.storage,
        &loop_options(10, None),
        &CancellationToken::new(),
    )?;
    assert_eq!(first.processed, 2);

    let mut ledger = Ledger::open(ws.ledger.path())?;
    let second = run_session(
        &mut script(),
        &extractor(),
        &mut ledger,
        &ws.storage,
        &loop_options(10, None),
        &CancellationToken::new(),
    )?;
    assert_eq!(second.processed, 0);
    assert_eq!(second.skipped, 2);
    assert_ne!(first.session_id, second.session_id);
    assert_eq!(ws.storage.load(Local::now().date_naive())?.len(), 2);
    assert_eq!(ledger.get_stats().total_all_time, 2);
    Ok(())
}

#[test]
fn cancellation_before_first_block_interrupts() -> anyhow::Result<()> {
    let mut ws = workspace()?;
    let mut driver = ScriptedDriver::new();
    let p1 = driver.post("1001", &body(1));
    let mut driver = driver.initially(vec![p1]);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = run_session(
        &mut driver,
        &extractor(),
        &mut ws.ledger,
        &ws.storage,
        &loop_options(10, None),
        &cancel,
    )?;

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.status, SessionStatus::Interrupted);
    assert_eq!(report.processed, 0);
    assert!(driver.closed);
    assert!(!ws.ledger.is_processed("1001"));
    Ok(())
}

#[test]
fn cancellation_during_pagination_keeps_saved_work() -> anyhow::Result<()> {
    let mut ws = workspace()?;
    let mut driver = ScriptedDriver::new();
    let p1 = driver.post("1001", &body(1));
    let p2 = driver.post("1002", &body(2));
    let p3 = driver.post("1003", &body(3));
    let mut driver = driver.initially(vec![p1, p2]).then_scroll(vec![p3]);
    let cancel = CancellationToken::new();
    driver.cancel_on_scroll = Some(cancel.clone());

    let report = run_session(
        &mut driver,
        &extractor(),
        &mut ws.ledger,
        &ws.storage,
        &loop_options(10, None),
        &cancel,
    )?;

    assert_eq!(report.status, SessionStatus::Interrupted);
    assert_eq!(report.processed, 2);
    assert_eq!(driver.scrolls, 1);
    assert!(ws.ledger.is_processed("1002"));
    assert!(!ws.ledger.is_processed("1003"));
    let session = ws
        .ledger
        .get_session(&report.session_id)
        .ok_or_else(|| anyhow::anyhow!("session missing"))?;
    assert_eq!(session.status, SessionStatus::Interrupted);
    Ok(())
}

#[test]
fn unauthenticated_run_fails_with_snapshots() -> anyhow::Result<()> {
    let mut ws = workspace()?;
    let mut driver = ScriptedDriver::new();
    let p1 = driver.post("1001", &body(1));
    let mut driver = driver.initially(vec![p1]);
    driver.authenticated = false;

    let report = run_session(
        &mut driver,
        &extractor(),
        &mut ws.ledger,
        &ws.storage,
        &loop_options(10, Some(ws.debug_dir.clone())),
        &CancellationToken::new(),
    )?;

    assert_eq!(report.outcome, RunOutcome::AuthRequired);
    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(report.processed, 0);
    assert!(driver.closed);
    let before = ws
        .debug_dir
        .join(format!("before_login_{}.html", report.session_id));
    let failed = ws
        .debug_dir
        .join(format!("login_failed_{}.html", report.session_id));
    assert!(before.exists());
    assert!(failed.exists());
    Ok(())
}

#[test]
fn navigation_fault_fails_the_session_and_closes_the_driver() -> anyhow::Result<()> {
    let mut ws = workspace()?;
    let mut driver = ScriptedDriver::new();
    driver.fail_navigation = true;

    let report = run_session(
        &mut driver,
        &extractor(),
        &mut ws.ledger,
        &ws.storage,
        &loop_options(10, None),
        &CancellationToken::new(),
    )?;

    assert_eq!(report.status, SessionStatus::Failed);
    match &report.outcome {
        RunOutcome::Failed { error } => {
            assert!(error.contains("navigate to https://www.facebook.com/groups/1"));
            assert!(error.contains("timed out"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(driver.navigations, vec!["https://www.facebook.com/groups/1"]);
    assert!(driver.closed);

    let reopened = Ledger::open(ws.ledger.path())?;
    let session = reopened
        .get_session(&report.session_id)
        .ok_or_else(|| anyhow::anyhow!("session missing"))?;
    assert_eq!(session.status, SessionStatus::Failed);
    Ok(())
}

#[test]
fn save_failures_are_counted_and_never_marked_processed() -> anyhow::Result<()> {
    let mut ws = workspace()?;
    let data_dir = ws.storage.data_dir().to_path_buf();
    std::fs::remove_dir_all(&data_dir)?;
    std::fs::write(&data_dir, b"not a directory")?;

    let mut driver = ScriptedDriver::new();
    let p1 = driver.post("1001", &body(1));
    let mut driver = driver.initially(vec![p1]);

    let report = run_session(
        &mut driver,
        &extractor(),
        &mut ws.ledger,
        &ws.storage,
        &loop_options(10, None),
        &CancellationToken::new(),
    )?;

    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.processed, 0);
    // Retried on every snapshot: the first one plus one per idle scroll
    // before the last.
    assert_eq!(report.failed, 3);
    assert!(!ws.ledger.is_processed("1001"));
    let session = ws
        .ledger
        .get_session(&report.session_id)
        .ok_or_else(|| anyhow::anyhow!("session missing"))?;
    assert_eq!(session.total_failed, 3);
    Ok(())
}

#[test]
fn unwritable_ledger_mid_run_still_closes_the_session_as_failed() -> anyhow::Result<()> {
    let mut ws = workspace()?;
    let state_dir = ws
        .ledger
        .path()
        .parent()
        .ok_or_else(|| anyhow::anyhow!("ledger path has no parent"))?
        .to_path_buf();

    let mut driver = ScriptedDriver::new();
    let p1 = driver.post("1001", &body(1));
    let p2 = driver.post("1002", &body(2));
    let mut driver = driver.initially(vec![p1]).then_scroll(vec![p2]);
    driver.clobber_on_scroll = Some(state_dir);

    let err = run_session(
        &mut driver,
        &extractor(),
        &mut ws.ledger,
        &ws.storage,
        &loop_options(10, None),
        &CancellationToken::new(),
    )
    .expect_err("ending the session cannot be persisted");
    assert!(format!("{err:#}").contains("persist end of session"));
    assert!(driver.closed);

    let session = ws
        .ledger
        .document()
        .sessions
        .last()
        .ok_or_else(|| anyhow::anyhow!("session missing"))?;
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session.end_time.is_some());
    assert_eq!(session.total_processed, 2);
    Ok(())
}
