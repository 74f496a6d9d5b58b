use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde_json::Value;

const REQUIRED_KEYS: &[&str] = &[
    "facebook.group_url",
    "scraper.max_posts_per_run",
    "paths.data_dir",
];

/// Where environment overrides come from.
#[derive(Debug, Clone, Default)]
pub enum EnvSource {
    #[default]
    Process,
    Fixed(HashMap<String, String>),
}

impl EnvSource {
    fn lookup(&self, key: &str) -> Option<String> {
        match self {
            Self::Process => std::env::var(key).ok(),
            Self::Fixed(vars) => vars.get(key).cloned(),
        }
    }
}

/// JSON settings document with dotted-path lookup.
///
/// Resolution order for a key: explicit overrides (CLI flags), then the
/// environment (`scraper.max_posts_per_run` reads `SCRAPER_MAX_POSTS_PER_RUN`),
/// then the file.
#[derive(Debug, Clone)]
pub struct Settings {
    path: PathBuf,
    data: Value,
    env: EnvSource,
    overrides: HashMap<String, Value>,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let example = path
                    .parent()
                    .unwrap_or_else(|| Path::new("."))
                    .join("config.example.json");
                anyhow::bail!(
                    "config file not found: {}\ncopy {} to it and fill in your settings",
                    path.display(),
                    example.display()
                );
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read config: {}", path.display()));
            }
        };
        let data: Value = serde_json::from_str(&raw)
            .with_context(|| format!("parse config json: {}", path.display()))?;

        Self::from_value(path, data, EnvSource::Process)
    }

    pub fn from_value(path: impl Into<PathBuf>, data: Value, env: EnvSource) -> anyhow::Result<Self> {
        if !data.is_object() {
            anyhow::bail!("config root must be a JSON object");
        }
        let settings = Self {
            path: path.into(),
            data,
            env,
            overrides: HashMap::new(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn validate(&self) -> anyhow::Result<()> {
        let missing = REQUIRED_KEYS
            .iter()
            .filter(|key| self.get(key).is_none_or(|value| value.is_null()))
            .map(|key| format!("  - {key}"))
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            anyhow::bail!(
                "config {} is missing required keys:\n{}",
                self.path.display(),
                missing.join("\n")
            );
        }
        Ok(())
    }

    /// Value at `key_path` (e.g. `facebook.group_url`), after overrides.
    ///
    /// Environment values are parsed as JSON when they parse, so `999` is a
    /// number and `false` a bool; anything else stays a string.
    pub fn get(&self, key_path: &str) -> Option<Value> {
        if let Some(value) = self.overrides.get(key_path) {
            return Some(value.clone());
        }

        let env_key = key_path.replace('.', "_").to_uppercase();
        if let Some(raw) = self.env.lookup(&env_key) {
            return Some(serde_json::from_str(&raw).unwrap_or(Value::String(raw)));
        }

        key_path
            .split('.')
            .try_fold(&self.data, |value, key| value.get(key))
            .cloned()
    }

    pub fn set_override(&mut self, key_path: impl Into<String>, value: Value) {
        self.overrides.insert(key_path.into(), value);
    }

    fn string(&self, key: &str) -> anyhow::Result<Option<String>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => anyhow::bail!("config {key}: expected a string, got {other}"),
        }
    }

    fn string_or(&self, key: &str, default: &str) -> anyhow::Result<String> {
        Ok(self.string(key)?.unwrap_or_else(|| default.to_owned()))
    }

    fn u64_or(&self, key: &str, default: u64) -> anyhow::Result<u64> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| anyhow::anyhow!("config {key}: expected a non-negative integer, got {n}")),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .with_context(|| format!("config {key}: expected a non-negative integer, got {s:?}")),
            Some(other) => anyhow::bail!("config {key}: expected a non-negative integer, got {other}"),
        }
    }

    fn bool_or(&self, key: &str, default: bool) -> anyhow::Result<bool> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(b),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                _ => anyhow::bail!("config {key}: expected a boolean, got {s:?}"),
            },
            Some(other) => anyhow::bail!("config {key}: expected a boolean, got {other}"),
        }
    }

    pub fn group_url(&self) -> anyhow::Result<String> {
        self.string("facebook.group_url")?
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("config facebook.group_url is empty"))
    }

    pub fn cookies_path(&self) -> anyhow::Result<PathBuf> {
        Ok(self.string_or("facebook.cookies_path", "config/auth.json")?.into())
    }

    pub fn user_agent(&self) -> anyhow::Result<Option<String>> {
        self.string("facebook.user_agent")
    }

    pub fn auth_required(&self) -> anyhow::Result<bool> {
        self.bool_or("facebook.auth_required", true)
    }

    pub fn max_posts(&self) -> anyhow::Result<usize> {
        let max = self.u64_or("scraper.max_posts_per_run", 500)?;
        usize::try_from(max).context("config scraper.max_posts_per_run is too large")
    }

    /// Random pause range after each scroll, in seconds.
    pub fn scroll_delay(&self) -> anyhow::Result<(Duration, Duration)> {
        let Some(value) = self.get("scraper.scroll_delay") else {
            return Ok((Duration::from_millis(1500), Duration::from_millis(3000)));
        };
        let bounds = value
            .as_array()
            .filter(|items| items.len() == 2)
            .and_then(|items| Some((items[0].as_f64()?, items[1].as_f64()?)))
            .ok_or_else(|| {
                anyhow::anyhow!("config scraper.scroll_delay: expected [min, max] seconds, got {value}")
            })?;
        let (min, max) = bounds;
        if !(min >= 0.0 && max >= min && max.is_finite()) {
            anyhow::bail!("config scraper.scroll_delay: need 0 <= min <= max, got [{min}, {max}]");
        }
        Ok((Duration::from_secs_f64(min), Duration::from_secs_f64(max)))
    }

    pub fn headless(&self) -> anyhow::Result<bool> {
        self.bool_or("scraper.headless", false)
    }

    pub fn post_selector(&self) -> anyhow::Result<String> {
        self.string_or("scraper.post_selector", r#"[role="article"]"#)
    }

    pub fn next_page_selector(&self) -> anyhow::Result<String> {
        self.string_or("scraper.next_page_selector", r#"a[rel="next"]"#)
    }

    pub fn navigation_timeout(&self) -> anyhow::Result<Duration> {
        Ok(Duration::from_secs(
            self.u64_or("scraper.navigation_timeout_secs", 90)?,
        ))
    }

    pub fn page_settle(&self) -> anyhow::Result<Duration> {
        Ok(Duration::from_millis(self.u64_or("scraper.page_settle_ms", 2000)?))
    }

    pub fn expand_settle(&self) -> anyhow::Result<Duration> {
        Ok(Duration::from_millis(self.u64_or("scraper.expand_settle_ms", 500)?))
    }

    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        self.string("paths.data_dir")?
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("config paths.data_dir is missing"))
    }

    pub fn state_file(&self) -> anyhow::Result<PathBuf> {
        Ok(self
            .string_or("paths.state_file", "state/scraper_state.json")?
            .into())
    }

    pub fn log_dir(&self) -> anyhow::Result<PathBuf> {
        Ok(self.string_or("paths.log_dir", "logs/")?.into())
    }

    pub fn log_level(&self) -> anyhow::Result<String> {
        Ok(self
            .string_or("monitoring.log_level", "info")?
            .to_ascii_lowercase())
    }
}
