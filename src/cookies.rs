use std::path::Path;

use anyhow::Context as _;
use serde::Deserialize;
use url::Url;

/// Browser storage state as saved by a manual login (`{"cookies": [...]}`).
#[derive(Debug, Deserialize)]
struct StorageState {
    #[serde(default)]
    cookies: Vec<StoredCookie>,
}

#[derive(Debug, Deserialize)]
struct StoredCookie {
    name: String,
    value: String,
    #[serde(default)]
    domain: String,
}

impl StoredCookie {
    fn applies_to(&self, host: &str) -> bool {
        let domain = self.domain.trim().trim_start_matches('.').to_ascii_lowercase();
        domain.is_empty() || host == domain || host.ends_with(&format!(".{domain}"))
    }
}

/// Builds a `Cookie` header for `target` from a saved storage state.
///
/// A missing file is not an error; the run continues without cookies and the
/// auth check decides whether that is good enough.
pub fn load_cookie_header(path: &Path, target: &Url) -> anyhow::Result<Option<String>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "cookie file not found; continuing without cookies");
            return Ok(None);
        }
        Err(err) => {
            return Err(err).with_context(|| format!("read cookie file: {}", path.display()));
        }
    };
    let state: StorageState = serde_json::from_str(&raw)
        .with_context(|| format!("parse cookie file: {}", path.display()))?;

    let Some(host) = target.host_str().map(str::to_ascii_lowercase) else {
        return Ok(None);
    };
    let pairs = state
        .cookies
        .iter()
        .filter(|cookie| !cookie.name.is_empty() && cookie.applies_to(&host))
        .map(|cookie| format!("{}={}", cookie.name, cookie.value))
        .collect::<Vec<_>>();

    tracing::info!(
        path = %path.display(),
        loaded = pairs.len(),
        total = state.cookies.len(),
        "loaded session cookies"
    );
    if pairs.is_empty() {
        return Ok(None);
    }
    Ok(Some(pairs.join("; ")))
}
