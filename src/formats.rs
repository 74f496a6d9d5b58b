use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// One accepted top-level post.
///
/// `id` and `text` are private so a record with either one empty cannot be
/// built outside [`Record::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    id: String,
    text: String,
    pub url: Option<String>,
    pub author: Option<String>,
    pub timestamp: Option<String>,
    pub extracted_at: String,
}

impl Record {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> anyhow::Result<Self> {
        let id = id.into();
        let text = text.into();
        if id.trim().is_empty() {
            anyhow::bail!("record id must not be empty");
        }
        if text.trim().is_empty() {
            anyhow::bail!("record text must not be empty (id={id})");
        }

        Ok(Self {
            id,
            text,
            url: None,
            author: None,
            timestamp: None,
            extracted_at: Local::now().to_rfc3339(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = url;
        self
    }

    #[must_use]
    pub fn with_author(mut self, author: Option<String>) -> Self {
        self.author = author;
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: Option<String>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// One line of a date shard (`<date>_raw_posts.jsonl`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub record_id: String,
    pub sequence: u64,
    pub post_id: String,
    pub text: String,
    pub url: Option<String>,
    pub author: Option<String>,
    pub timestamp: Option<String>,
    pub extracted_at: String,
    pub saved_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    pub status: SessionStatus,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub processed_at: DateTime<Local>,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMetadata {
    pub created_at: DateTime<Local>,
    pub last_updated: DateTime<Local>,
    pub total_all_time: u64,
}

/// The whole persisted ledger; rewritten in full on every mutation.
///
/// Timestamps must be RFC 3339 with a UTC offset; a document holding naive
/// local times fails to load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDocument {
    pub version: String,
    pub sessions: Vec<Session>,
    pub processed_post_ids: Vec<LedgerEntry>,
    pub metadata: LedgerMetadata,
}

impl LedgerDocument {
    pub const VERSION: &'static str = "1.0";

    pub fn empty() -> Self {
        let now = Local::now();
        Self {
            version: Self::VERSION.to_owned(),
            sessions: Vec::new(),
            processed_post_ids: Vec::new(),
            metadata: LedgerMetadata {
                created_at: now,
                last_updated: now,
                total_all_time: 0,
            },
        }
    }
}
