use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Local};
use regex::Regex;
use sha2::{Digest as _, Sha256};
use url::Url;

use crate::driver::ElementSource;
use crate::formats::Record;

/// Text shorter than this (in characters) is never a post.
pub const MIN_TEXT_CHARS: usize = 5;
const MESSAGE_MIN_CHARS: usize = 10;
const LOOSE_MIN_CHARS: usize = 30;
const HASH_SAMPLE_CHARS: usize = 500;

static PERMALINK_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(?:posts|permalink)/(\d+)").expect("permalink id regex must compile")
});
static LONG_DIGITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{10,}").expect("digit run regex must compile"));

/// Selectors and markers describing one site's post markup.
#[derive(Debug, Clone)]
pub struct ExtractorProfile {
    pub base_url: Url,
    pub permalink_selectors: Vec<String>,
    pub reply_query_keys: Vec<String>,
    pub see_more_texts: Vec<String>,
    pub button_selectors: Vec<String>,
    pub fallback_button_selector: String,
    pub message_selectors: Vec<String>,
    pub loose_text_selector: String,
    pub id_query_keys: Vec<String>,
    pub id_attributes: Vec<String>,
    pub time_selector: String,
    pub author_selector: String,
    pub expand_settle: Duration,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_owned()).collect()
}

impl Default for ExtractorProfile {
    fn default() -> Self {
        Self {
            base_url: Url::parse("https://www.facebook.com/").expect("static base url must parse"),
            permalink_selectors: owned(&[
                r#"a[href*="/posts/"]"#,
                r#"a[href*="/permalink/"]"#,
                r#"a[href*="story_fbid"]"#,
            ]),
            reply_query_keys: owned(&["comment_id", "reply_comment_id"]),
            see_more_texts: owned(&[
                "See more",
                "See More",
                "查看更多",
                "顯示更多",
                "显示更多",
                "Xem thêm",
                "もっと見る",
            ]),
            button_selectors: owned(&[r#"div[role="button"]"#, r#"span[role="button"]"#]),
            fallback_button_selector: r#"[role="button"]"#.to_owned(),
            message_selectors: owned(&[
                r#"div[data-ad-comet-preview="message"]"#,
                r#"div[data-ad-preview="message"]"#,
                r#"[data-ad-rendering-role="story_message"]"#,
            ]),
            loose_text_selector: r#"div[dir="auto"]"#.to_owned(),
            id_query_keys: owned(&["story_fbid", "fbid"]),
            id_attributes: owned(&["data-ft", "data-testid", "id"]),
            time_selector: "abbr, time".to_owned(),
            author_selector: r#"a[role="link"]"#.to_owned(),
            expand_settle: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextSource {
    /// One of the dedicated message containers.
    Message,
    /// A generic auto-direction text container.
    Loose,
    /// Everything in the block, chrome included.
    WholeBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    Low,
}

impl TextSource {
    pub fn confidence(self) -> Confidence {
        match self {
            Self::Message | Self::Loose => Confidence::High,
            Self::WholeBlock => Confidence::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    PermalinkPath,
    QueryParam,
    Attribute,
    ContentHash,
}

/// An accepted record plus how its fields were found.
#[derive(Debug, Clone)]
pub struct Extracted {
    pub record: Record,
    pub text_source: TextSource,
    pub id_source: IdSource,
}

impl Extracted {
    pub fn is_low_confidence(&self) -> bool {
        self.text_source.confidence() == Confidence::Low
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Reply { href: String },
    TooShort { chars: usize },
    Fault(String),
}

impl Rejection {
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reply { href } => write!(f, "reply link {href}"),
            Self::TooShort { chars } => write!(f, "text too short ({chars} chars)"),
            Self::Fault(message) => write!(f, "driver fault: {message}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Extraction {
    Accepted(Extracted),
    Rejected(Rejection),
}

#[derive(Debug, Clone, Default)]
pub struct Extractor {
    profile: ExtractorProfile,
}

impl Extractor {
    pub fn new(profile: ExtractorProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &ExtractorProfile {
        &self.profile
    }

    /// Turns one content block into a record, or says why it is not one.
    ///
    /// Driver faults are contained to the block: they come back as
    /// [`Rejection::Fault`] instead of an error.
    pub fn extract<S: ElementSource>(&self, source: &mut S, block: &S::Handle) -> Extraction {
        match self.try_extract(source, block) {
            Ok(extraction) => extraction,
            Err(err) => {
                tracing::warn!(?block, err = %format!("{err:#}"), "extraction fault");
                Extraction::Rejected(Rejection::Fault(format!("{err:#}")))
            }
        }
    }

    fn try_extract<S: ElementSource>(
        &self,
        source: &mut S,
        block: &S::Handle,
    ) -> anyhow::Result<Extraction> {
        let permalink = self.find_permalink(source, block).context("find permalink")?;
        if let Some(href) = permalink.as_deref().filter(|href| self.is_reply_href(href)) {
            return Ok(Extraction::Rejected(Rejection::Reply {
                href: href.to_owned(),
            }));
        }

        self.expand(source, block);

        let (text, text_source) = self.find_text(source, block).context("read text")?;
        let chars = text.chars().count();
        if chars < MIN_TEXT_CHARS {
            return Ok(Extraction::Rejected(Rejection::TooShort { chars }));
        }

        let permalink_url = permalink.as_deref().and_then(|href| self.resolve(href));
        let (id, id_source) = self.resolve_id(source, block, permalink_url.as_ref(), &text);
        let url = permalink_url.map(|mut url| {
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        });

        let timestamp = self.find_timestamp(source, block).unwrap_or_else(|err| {
            tracing::debug!(?block, ?err, "timestamp unreadable");
            None
        });
        let author = self.find_author(source, block).unwrap_or_else(|err| {
            tracing::debug!(?block, ?err, "author unreadable");
            None
        });

        let record = Record::new(id, text)?
            .with_url(url)
            .with_author(author)
            .with_timestamp(timestamp);
        Ok(Extraction::Accepted(Extracted {
            record,
            text_source,
            id_source,
        }))
    }

    fn find_permalink<S: ElementSource>(
        &self,
        source: &S,
        block: &S::Handle,
    ) -> anyhow::Result<Option<String>> {
        for selector in &self.profile.permalink_selectors {
            let Some(link) = source.query_one(block, selector)? else {
                continue;
            };
            if let Some(href) = source.attribute(&link, "href")? {
                let href = href.trim();
                if !href.is_empty() {
                    return Ok(Some(href.to_owned()));
                }
            }
        }
        Ok(None)
    }

    fn resolve(&self, href: &str) -> Option<Url> {
        let url = self.profile.base_url.join(href).ok()?;
        matches!(url.scheme(), "http" | "https").then_some(url)
    }

    /// Checked on the href as found, before any normalization.
    fn is_reply_href(&self, href: &str) -> bool {
        let query = match href.split_once('?') {
            Some((_, rest)) => rest.split('#').next().unwrap_or_default(),
            None => return false,
        };
        if query.starts_with("comment") {
            return true;
        }
        url::form_urlencoded::parse(query.as_bytes())
            .any(|(key, _)| self.profile.reply_query_keys.iter().any(|k| *k == key))
    }

    fn expand<S: ElementSource>(&self, source: &mut S, block: &S::Handle) {
        let button = match self.find_see_more(source, block) {
            Ok(Some(button)) => button,
            Ok(None) => return,
            Err(err) => {
                tracing::debug!(?err, "see-more lookup failed");
                return;
            }
        };
        match source.click(&button) {
            Ok(()) => {
                tracing::debug!(?button, "expanded truncated post");
                if !self.profile.expand_settle.is_zero() {
                    std::thread::sleep(self.profile.expand_settle);
                }
            }
            Err(err) => tracing::debug!(?err, "see-more click failed"),
        }
    }

    fn find_see_more<S: ElementSource>(
        &self,
        source: &S,
        block: &S::Handle,
    ) -> anyhow::Result<Option<S::Handle>> {
        let passes = self
            .profile
            .button_selectors
            .iter()
            .chain(std::iter::once(&self.profile.fallback_button_selector));
        for selector in passes {
            for button in source.query_within(block, selector)? {
                let text = match source.text(&button) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::debug!(?button, ?err, "button text unreadable");
                        continue;
                    }
                };
                let is_see_more = self
                    .profile
                    .see_more_texts
                    .iter()
                    .any(|marker| text.contains(marker.as_str()));
                if !is_see_more {
                    continue;
                }
                match source.is_visible(&button) {
                    Ok(true) => return Ok(Some(button)),
                    Ok(false) => {}
                    Err(err) => tracing::debug!(?button, ?err, "button visibility unknown"),
                }
            }
        }
        Ok(None)
    }

    fn find_text<S: ElementSource>(
        &self,
        source: &S,
        block: &S::Handle,
    ) -> anyhow::Result<(String, TextSource)> {
        for selector in &self.profile.message_selectors {
            if let Some(node) = source.query_one(block, selector)? {
                let text = source.text(&node)?;
                let text = text.trim();
                if text.chars().count() > MESSAGE_MIN_CHARS {
                    return Ok((text.to_owned(), TextSource::Message));
                }
            }
        }

        for node in source.query_within(block, &self.profile.loose_text_selector)? {
            let text = source.text(&node)?;
            let text = text.trim();
            if text.chars().count() > LOOSE_MIN_CHARS {
                return Ok((text.to_owned(), TextSource::Loose));
            }
        }

        let text = source.text(block)?;
        Ok((text.trim().to_owned(), TextSource::WholeBlock))
    }

    /// Permalink path, then id query params, then long digit runs in block
    /// attributes, then a content hash. Never fails.
    fn resolve_id<S: ElementSource>(
        &self,
        source: &S,
        block: &S::Handle,
        permalink: Option<&Url>,
        text: &str,
    ) -> (String, IdSource) {
        if let Some(url) = permalink {
            if let Some(caps) = PERMALINK_ID_RE.captures(url.path()) {
                return (caps[1].to_owned(), IdSource::PermalinkPath);
            }
            for key in &self.profile.id_query_keys {
                let found = url.query_pairs().find(|(k, v)| {
                    k == key.as_str() && !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit())
                });
                if let Some((_, value)) = found {
                    return (value.into_owned(), IdSource::QueryParam);
                }
            }
        }

        for name in &self.profile.id_attributes {
            match source.attribute(block, name) {
                Ok(Some(value)) => {
                    if let Some(found) = LONG_DIGITS_RE.find(&value) {
                        return (found.as_str().to_owned(), IdSource::Attribute);
                    }
                }
                Ok(None) => {}
                Err(err) => tracing::debug!(attribute = %name, ?err, "id attribute unreadable"),
            }
        }

        (content_hash_id(text), IdSource::ContentHash)
    }

    fn find_timestamp<S: ElementSource>(
        &self,
        source: &S,
        block: &S::Handle,
    ) -> anyhow::Result<Option<String>> {
        let Some(node) = source.query_one(block, &self.profile.time_selector)? else {
            return Ok(None);
        };

        if let Some(utime) = non_empty(source.attribute(&node, "data-utime")?) {
            match utime.parse::<i64>().ok().and_then(epoch_to_local) {
                Some(stamp) => return Ok(Some(stamp)),
                None => tracing::debug!(%utime, "ignoring unparseable data-utime"),
            }
        }
        if let Some(datetime) = non_empty(source.attribute(&node, "datetime")?) {
            return Ok(Some(datetime));
        }
        Ok(non_empty(source.attribute(&node, "title")?))
    }

    fn find_author<S: ElementSource>(
        &self,
        source: &S,
        block: &S::Handle,
    ) -> anyhow::Result<Option<String>> {
        for link in source.query_within(block, &self.profile.author_selector)? {
            let name = source.text(&link)?;
            let name = name.trim();
            if !name.is_empty() {
                return Ok(Some(name.to_owned()));
            }
        }
        Ok(None)
    }
}

/// `hash_` plus 16 hex chars of SHA-256 over the first 500 characters.
pub fn content_hash_id(text: &str) -> String {
    let sample: String = text.chars().take(HASH_SAMPLE_CHARS).collect();
    let digest = Sha256::digest(sample.as_bytes());
    let hex = hex::encode(digest);
    format!("hash_{}", &hex[..16])
}

fn epoch_to_local(secs: i64) -> Option<String> {
    DateTime::from_timestamp(secs, 0).map(|utc| utc.with_timezone(&Local).to_rfc3339())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}
