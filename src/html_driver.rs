use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use ego_tree::NodeId;
use rand::Rng as _;
use reqwest::header::{ACCEPT, COOKIE, USER_AGENT};
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::driver::{ElementSource, PageDriver};

/// Address of one element: which loaded page, and which node in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    page: usize,
    node: NodeId,
}

#[derive(Debug, Clone)]
pub struct AuthProbe {
    pub required: bool,
    /// Any match means the session is logged in.
    pub logged_in_selectors: Vec<String>,
    /// Any match (checked after the logged-in markers) means it is not.
    pub logged_out_selectors: Vec<String>,
}

impl Default for AuthProbe {
    fn default() -> Self {
        Self {
            required: true,
            logged_in_selectors: [
                r#"[aria-label*="Account"]"#,
                r#"[aria-label*="帳號"]"#,
                r#"[aria-label*="账号"]"#,
                r#"[aria-label*="個人檔案"]"#,
                r#"[aria-label*="个人主页"]"#,
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            logged_out_selectors: vec![r#"a[href*="login"]"#.to_owned()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct HtmlDriverOptions {
    pub user_agent: String,
    pub cookie_header: Option<String>,
    pub timeout: Duration,
    pub next_page_selector: String,
    /// Random pause after each pagination fetch, picked within `[min, max]`.
    pub scroll_delay: (Duration, Duration),
    pub auth: AuthProbe,
}

impl Default for HtmlDriverOptions {
    fn default() -> Self {
        Self {
            user_agent: format!("postharvest/{}", env!("CARGO_PKG_VERSION")),
            cookie_header: None,
            timeout: Duration::from_secs(90),
            next_page_selector: r#"a[rel="next"]"#.to_owned(),
            scroll_delay: (Duration::from_millis(1500), Duration::from_millis(3000)),
            auth: AuthProbe::default(),
        }
    }
}

struct LoadedPage {
    url: Url,
    html: Html,
    source_len: usize,
}

/// Page driver over fetched HTML.
///
/// Infinite scroll is emulated by following the next-page link and appending
/// the parsed page to the visible set, so handles from earlier pages stay
/// valid. Clicking is a no-op on static markup.
pub struct HtmlPageDriver {
    client: reqwest::blocking::Client,
    options: HtmlDriverOptions,
    pages: Vec<LoadedPage>,
}

impl HtmlPageDriver {
    pub fn new(options: HtmlDriverOptions) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(options.timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build page http client")?;

        Ok(Self {
            client,
            options,
            pages: Vec::new(),
        })
    }

    /// A driver already showing `html` as if it had been fetched from `url`.
    pub fn from_html(url: &str, html: &str, options: HtmlDriverOptions) -> anyhow::Result<Self> {
        let mut driver = Self::new(options)?;
        let url = Url::parse(url).with_context(|| format!("parse page url: {url}"))?;
        driver.pages.push(LoadedPage {
            url,
            html: Html::parse_document(html),
            source_len: html.len(),
        });
        Ok(driver)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Total source length of every loaded page; grows when pagination
    /// brings in more content.
    pub fn visible_len(&self) -> usize {
        self.pages.iter().map(|page| page.source_len).sum()
    }

    fn current(&self) -> anyhow::Result<&LoadedPage> {
        self.pages
            .last()
            .ok_or_else(|| anyhow::anyhow!("no page loaded; call navigate first"))
    }

    fn element(&self, handle: &NodeHandle) -> anyhow::Result<ElementRef<'_>> {
        let page = self
            .pages
            .get(handle.page)
            .ok_or_else(|| anyhow::anyhow!("stale handle: page {} is gone", handle.page))?;
        page.html
            .tree
            .get(handle.node)
            .and_then(ElementRef::wrap)
            .ok_or_else(|| anyhow::anyhow!("stale handle: node not found on page {}", handle.page))
    }

    fn fetch(&self, url: &Url) -> anyhow::Result<String> {
        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|()| anyhow::anyhow!("not a local file url: {url}"))?;
                std::fs::read_to_string(&path)
                    .with_context(|| format!("read page file: {}", path.display()))
            }
            "http" | "https" => {
                let mut request = self
                    .client
                    .get(url.clone())
                    .header(USER_AGENT, &self.options.user_agent)
                    .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8");
                if let Some(cookie) = self.options.cookie_header.as_deref() {
                    request = request.header(COOKIE, cookie);
                }
                let response = request.send().with_context(|| format!("GET {url}"))?;
                let response = response
                    .error_for_status()
                    .with_context(|| format!("GET {url}"))?;
                response
                    .text()
                    .with_context(|| format!("read body of {url}"))
            }
            other => anyhow::bail!("unsupported url scheme {other:?}: {url}"),
        }
    }

    fn load(&self, url: Url) -> anyhow::Result<LoadedPage> {
        let body = self.fetch(&url)?;
        Ok(LoadedPage {
            source_len: body.len(),
            html: Html::parse_document(&body),
            url,
        })
    }

    fn next_page_url(&self) -> anyhow::Result<Option<Url>> {
        let current = self.current()?;
        let selector = parse_selector(&self.options.next_page_selector)?;
        let Some(href) = current
            .html
            .select(&selector)
            .find_map(|link| link.value().attr("href"))
        else {
            return Ok(None);
        };
        let next = current
            .url
            .join(href.trim())
            .with_context(|| format!("resolve next page link: {href}"))?;
        Ok(Some(next))
    }

    fn pause_after_scroll(&self) {
        let (min, max) = self.options.scroll_delay;
        let min_ms = min.as_millis() as u64;
        let max_ms = max.as_millis() as u64;
        let delay_ms = if max_ms > min_ms {
            rand::rng().random_range(min_ms..=max_ms)
        } else {
            min_ms
        };
        if delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(delay_ms));
        }
    }

    fn matches_any(&self, selectors: &[String]) -> anyhow::Result<Option<String>> {
        for raw in selectors {
            let selector = parse_selector(raw)?;
            if self
                .pages
                .iter()
                .any(|page| page.html.select(&selector).next().is_some())
            {
                return Ok(Some(raw.clone()));
            }
        }
        Ok(None)
    }
}

impl ElementSource for HtmlPageDriver {
    type Handle = NodeHandle;

    fn query_within(&self, scope: &NodeHandle, selector: &str) -> anyhow::Result<Vec<NodeHandle>> {
        let selector = parse_selector(selector)?;
        let element = self.element(scope)?;
        Ok(element
            .select(&selector)
            .map(|found| NodeHandle {
                page: scope.page,
                node: found.id(),
            })
            .collect())
    }

    fn text(&self, handle: &NodeHandle) -> anyhow::Result<String> {
        Ok(self.element(handle)?.text().collect())
    }

    fn attribute(&self, handle: &NodeHandle, name: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .element(handle)?
            .value()
            .attr(name)
            .map(str::to_owned))
    }

    fn click(&mut self, handle: &NodeHandle) -> anyhow::Result<()> {
        self.element(handle)?;
        tracing::trace!(?handle, "click ignored on static html");
        Ok(())
    }
}

impl PageDriver for HtmlPageDriver {
    fn navigate(&mut self, url: &str) -> anyhow::Result<()> {
        let url = Url::parse(url).with_context(|| format!("parse url: {url}"))?;
        tracing::info!(%url, "navigate");
        let page = self.load(url)?;
        self.pages = vec![page];
        Ok(())
    }

    fn query_all(&self, selector: &str) -> anyhow::Result<Vec<NodeHandle>> {
        let selector = parse_selector(selector)?;
        Ok(self
            .pages
            .iter()
            .enumerate()
            .flat_map(|(page, loaded)| {
                loaded.html.select(&selector).map(move |found| NodeHandle {
                    page,
                    node: found.id(),
                })
            })
            .collect())
    }

    fn scroll_to_bottom(&mut self) -> anyhow::Result<bool> {
        let before = self.visible_len();
        let Some(next) = self.next_page_url()? else {
            tracing::debug!("no next page link; content did not grow");
            self.pause_after_scroll();
            return Ok(false);
        };
        if self.pages.iter().any(|page| page.url == next) {
            tracing::debug!(%next, "next page already loaded");
            self.pause_after_scroll();
            return Ok(false);
        }

        let page = self.load(next.clone())?;
        self.pages.push(page);
        self.pause_after_scroll();

        let after = self.visible_len();
        tracing::debug!(%next, before, after, "loaded next page");
        Ok(after > before)
    }

    fn is_authenticated(&self) -> anyhow::Result<bool> {
        if !self.options.auth.required {
            return Ok(true);
        }
        let current = self.current()?;

        if let Some(marker) = self.matches_any(&self.options.auth.logged_in_selectors)? {
            tracing::debug!(%marker, "found logged-in marker");
            return Ok(true);
        }
        if let Some(marker) = self.matches_any(&self.options.auth.logged_out_selectors)? {
            tracing::debug!(%marker, "found login marker");
            return Ok(false);
        }
        if current.url.as_str().to_ascii_lowercase().contains("login") {
            tracing::debug!(url = %current.url, "landed on a login page");
            return Ok(false);
        }

        tracing::warn!("could not determine login state; assuming logged out");
        Ok(false)
    }

    fn screenshot(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create snapshot dir: {}", parent.display()))?;
        }
        let dump = self
            .pages
            .iter()
            .map(|page| page.html.html())
            .collect::<Vec<_>>()
            .join("\n");
        std::fs::write(path, dump)
            .with_context(|| format!("write page snapshot: {}", path.display()))?;
        tracing::info!(path = %path.display(), "page snapshot saved");
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.pages.clear();
        tracing::debug!("html driver closed");
        Ok(())
    }
}

fn parse_selector(selector: &str) -> anyhow::Result<Selector> {
    Selector::parse(selector).map_err(|err| anyhow::anyhow!("invalid selector {selector:?}: {err:?}"))
}
