use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::Local;
use serde::Serialize;

use crate::formats::{LedgerDocument, LedgerEntry, Session, SessionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total_all_time: u64,
    pub total_sessions: usize,
    pub latest_session: Option<Session>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CleanupSummary {
    pub entries_removed: usize,
    pub sessions_removed: usize,
}

#[derive(Debug, Clone, Copy)]
enum Counter {
    Processed,
    Failed,
    Skipped,
}

/// Durable dedup set and session log backed by a single JSON document.
///
/// Every mutating call rewrites the whole document, so the file on disk is
/// consistent after any single call returns. One process owns a ledger file
/// for the duration of a run.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    document: LedgerDocument,
    processed_ids: HashSet<String>,
}

impl Ledger {
    /// Loads the ledger at `path`, or starts an empty one if the file does not
    /// exist yet. A malformed document is an error, never a silent reset.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let document = read_document(&path)
            .with_context(|| format!("load ledger: {}", path.display()))?
            .unwrap_or_else(LedgerDocument::empty);
        let processed_ids = index_processed_ids(&document);

        tracing::debug!(
            path = %path.display(),
            sessions = document.sessions.len(),
            processed = processed_ids.len(),
            "ledger loaded"
        );

        Ok(Self {
            path,
            document,
            processed_ids,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &LedgerDocument {
        &self.document
    }

    pub fn start_session(&mut self) -> anyhow::Result<String> {
        let now = Local::now();
        let session_id = self.unique_session_id(now.format("%Y%m%d_%H%M%S").to_string());

        self.document.sessions.push(Session {
            session_id: session_id.clone(),
            start_time: now,
            end_time: None,
            status: SessionStatus::Running,
            total_processed: 0,
            total_failed: 0,
            total_skipped: 0,
        });
        self.persist().context("persist new session")?;

        tracing::info!(session_id = %session_id, "session started");
        Ok(session_id)
    }

    pub fn end_session(&mut self, session_id: &str, status: SessionStatus) -> anyhow::Result<()> {
        if !status.is_terminal() {
            anyhow::bail!("cannot close session {session_id} with status {status}");
        }

        let session = self.session_mut(session_id)?;
        if session.status.is_terminal() {
            anyhow::bail!(
                "session already closed: {session_id} ({})",
                session.status
            );
        }
        session.status = status;
        session.end_time = Some(Local::now());

        self.persist()
            .with_context(|| format!("persist end of session {session_id}"))?;
        tracing::info!(session_id, %status, "session closed");
        Ok(())
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.processed_ids.contains(id)
    }

    /// Records `id` as processed by `session_id`. Returns `false` (and changes
    /// nothing) when the id was already recorded.
    pub fn mark_processed(&mut self, id: &str, session_id: &str) -> anyhow::Result<bool> {
        if self.is_processed(id) {
            return Ok(false);
        }

        self.bump(session_id, Counter::Processed)?;
        self.document.processed_post_ids.push(LedgerEntry {
            id: id.to_owned(),
            processed_at: Local::now(),
            session_id: session_id.to_owned(),
        });
        self.processed_ids.insert(id.to_owned());
        self.document.metadata.total_all_time += 1;

        self.persist()
            .with_context(|| format!("persist processed id {id}"))?;
        Ok(true)
    }

    pub fn mark_failed(&mut self, session_id: &str) -> anyhow::Result<()> {
        self.bump(session_id, Counter::Failed)?;
        self.persist().context("persist failed counter")
    }

    pub fn mark_skipped(&mut self, session_id: &str) -> anyhow::Result<()> {
        self.bump(session_id, Counter::Skipped)?;
        self.persist().context("persist skipped counter")
    }

    pub fn get_session(&self, session_id: &str) -> Option<&Session> {
        self.document
            .sessions
            .iter()
            .find(|session| session.session_id == session_id)
    }

    pub fn get_stats(&self) -> LedgerStats {
        LedgerStats {
            total_all_time: self.document.metadata.total_all_time,
            total_sessions: self.document.sessions.len(),
            latest_session: self.document.sessions.last().cloned(),
        }
    }

    /// Drops ledger entries and sessions older than `keep`, then rebuilds the
    /// in-memory id set. Pruned ids become eligible for processing again.
    pub fn cleanup_old_data(&mut self, keep: chrono::Duration) -> anyhow::Result<CleanupSummary> {
        let cutoff = Local::now() - keep;

        let entries_before = self.document.processed_post_ids.len();
        self.document
            .processed_post_ids
            .retain(|entry| entry.processed_at >= cutoff);
        let sessions_before = self.document.sessions.len();
        self.document
            .sessions
            .retain(|session| session.start_time >= cutoff);

        self.processed_ids = index_processed_ids(&self.document);

        let summary = CleanupSummary {
            entries_removed: entries_before - self.document.processed_post_ids.len(),
            sessions_removed: sessions_before - self.document.sessions.len(),
        };
        self.persist().context("persist cleaned ledger")?;

        tracing::info!(
            %cutoff,
            entries_removed = summary.entries_removed,
            sessions_removed = summary.sessions_removed,
            "ledger cleaned"
        );
        Ok(summary)
    }

    fn unique_session_id(&self, base: String) -> String {
        let mut candidate = base.clone();
        let mut suffix = 2_u32;
        while self.get_session(&candidate).is_some() {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        candidate
    }

    fn session_mut(&mut self, session_id: &str) -> anyhow::Result<&mut Session> {
        self.document
            .sessions
            .iter_mut()
            .find(|session| session.session_id == session_id)
            .ok_or_else(|| anyhow::anyhow!("unknown session: {session_id}"))
    }

    fn bump(&mut self, session_id: &str, counter: Counter) -> anyhow::Result<()> {
        let session = self.session_mut(session_id)?;
        let slot = match counter {
            Counter::Processed => &mut session.total_processed,
            Counter::Failed => &mut session.total_failed,
            Counter::Skipped => &mut session.total_skipped,
        };
        *slot += 1;
        Ok(())
    }

    fn persist(&mut self) -> anyhow::Result<()> {
        self.document.metadata.last_updated = Local::now();
        write_json_atomic(&self.path, &self.document)
    }
}

fn index_processed_ids(document: &LedgerDocument) -> HashSet<String> {
    document
        .processed_post_ids
        .iter()
        .map(|entry| entry.id.clone())
        .collect()
}

fn read_document(path: &Path) -> anyhow::Result<Option<LedgerDocument>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let document = serde_json::from_slice(&bytes).context("parse ledger json")?;
    Ok(Some(document))
}

fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    {
        let mut tmp = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .with_context(|| format!("create tmp: {}", tmp_path.display()))?;
        tmp.write_all(&data)
            .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
        tmp.sync_all()
            .with_context(|| format!("sync tmp: {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
