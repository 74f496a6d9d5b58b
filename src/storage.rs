use std::fs::{self, File, OpenOptions};
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{Local, NaiveDate};
use fs4::fs_std::FileExt;
use serde::Serialize;

use crate::formats::{Record, StoredRecord};

pub const SHARD_SUFFIX: &str = "_raw_posts.jsonl";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedRecord {
    pub filepath: PathBuf,
    pub record_id: String,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(SavedRecord),
    Failed { error: String },
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardInfo {
    pub filename: String,
    pub date: String,
    pub count: usize,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StorageStats {
    pub total_files: usize,
    pub total_posts: usize,
    pub files: Vec<ShardInfo>,
}

/// Date-partitioned append-only JSONL store.
///
/// Sequence numbers are assigned under an exclusive advisory lock on the
/// shard, so several processes may append to the same date concurrently.
#[derive(Debug, Clone)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    pub fn new(data_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("create data dir: {}", data_dir.display()))?;
        tracing::debug!(data_dir = %data_dir.display(), "storage ready");
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn shard_path(&self, date: NaiveDate) -> PathBuf {
        self.data_dir.join(format!("{date}{SHARD_SUFFIX}"))
    }

    /// Appends `record` to today's shard.
    pub fn save(&self, record: &Record) -> SaveOutcome {
        self.save_on(Local::now().date_naive(), record)
    }

    pub fn save_on(&self, date: NaiveDate, record: &Record) -> SaveOutcome {
        match self.append_locked(date, record) {
            Ok(saved) => {
                tracing::debug!(
                    record_id = %saved.record_id,
                    post_id = record.id(),
                    "record saved"
                );
                SaveOutcome::Saved(saved)
            }
            Err(err) => {
                tracing::error!(post_id = record.id(), ?err, "save record failed");
                SaveOutcome::Failed {
                    error: format!("{err:#}"),
                }
            }
        }
    }

    fn append_locked(&self, date: NaiveDate, record: &Record) -> anyhow::Result<SavedRecord> {
        let path = self.shard_path(date);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open shard: {}", path.display()))?;

        FileExt::lock_exclusive(&file)
            .with_context(|| format!("lock shard: {}", path.display()))?;
        let appended = append_under_lock(&mut file, date, record);
        let unlocked = FileExt::unlock(&file);

        let (record_id, sequence) =
            appended.with_context(|| format!("append to shard: {}", path.display()))?;
        unlocked.with_context(|| format!("unlock shard: {}", path.display()))?;

        Ok(SavedRecord {
            filepath: path,
            record_id,
            sequence,
        })
    }

    pub fn get_stats(&self) -> anyhow::Result<StorageStats> {
        let mut shards = Vec::new();
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StorageStats::default());
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("read data dir: {}", self.data_dir.display())
                });
            }
        };
        for entry in entries {
            let path = entry?.path();
            let Some(filename) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some(date) = filename.strip_suffix(SHARD_SUFFIX) else {
                continue;
            };
            shards.push((filename.to_owned(), date.to_owned(), path.clone()));
        }
        shards.sort();

        let mut stats = StorageStats::default();
        for (filename, date, path) in shards {
            let bytes =
                fs::read(&path).with_context(|| format!("read shard: {}", path.display()))?;
            let count = count_non_empty_lines(&bytes);
            stats.total_posts += count;
            stats.files.push(ShardInfo {
                filename,
                date,
                count,
                size: bytes.len() as u64,
            });
        }
        stats.total_files = stats.files.len();

        Ok(stats)
    }

    /// Reads every record of the shard for `date`. Lines that do not parse
    /// (a torn tail after a crash) are skipped with a warning.
    pub fn load(&self, date: NaiveDate) -> anyhow::Result<Vec<StoredRecord>> {
        let path = self.shard_path(date);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no shard for date");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read shard: {}", path.display()));
            }
        };

        let mut records = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(path = %path.display(), line = idx + 1, %err, "skip malformed shard line");
                }
            }
        }

        tracing::debug!(%date, count = records.len(), "shard loaded");
        Ok(records)
    }
}

fn append_under_lock(
    file: &mut File,
    date: NaiveDate,
    record: &Record,
) -> anyhow::Result<(String, u64)> {
    file.seek(SeekFrom::Start(0)).context("seek shard start")?;
    let mut existing = Vec::new();
    file.read_to_end(&mut existing).context("read shard")?;

    let sequence = count_non_empty_lines(&existing) as u64 + 1;
    let record_id = format!("{date}-{sequence:03}");
    let stored = StoredRecord {
        record_id: record_id.clone(),
        sequence,
        post_id: record.id().to_owned(),
        text: record.text().to_owned(),
        url: record.url.clone(),
        author: record.author.clone(),
        timestamp: record.timestamp.clone(),
        extracted_at: record.extracted_at.clone(),
        saved_at: Local::now().to_rfc3339(),
    };

    let mut line = Vec::new();
    // A torn line from an earlier crash keeps its own line so the new entry
    // stays parseable.
    if !existing.is_empty() && !existing.ends_with(b"\n") {
        line.push(b'\n');
    }
    serde_json::to_writer(&mut line, &stored).context("serialize stored record")?;
    line.push(b'\n');

    file.write_all(&line).context("write stored record")?;
    file.sync_data().context("sync shard")?;

    Ok((record_id, sequence))
}

fn count_non_empty_lines(bytes: &[u8]) -> usize {
    bytes
        .split(|byte| *byte == b'\n')
        .filter(|line| !line.trim_ascii().is_empty())
        .count()
}
