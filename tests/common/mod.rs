#![allow(dead_code)]

pub mod feed_server;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use postharvest::driver::{ElementSource, PageDriver};
use postharvest::extract::{Extractor, ExtractorProfile};
use postharvest::scrape::{LoopOptions, MAX_IDLE_SCROLLS};
use tokio_util::sync::CancellationToken;

pub const BLOCK_SELECTOR: &str = r#"[role="article"]"#;
const PERMALINK_SELECTOR: &str = r#"a[href*="/posts/"]"#;
const MESSAGE_SELECTOR: &str = r#"div[data-ad-preview="message"]"#;

#[derive(Debug, Default)]
struct Node {
    matches: Vec<String>,
    text: String,
    attrs: HashMap<String, String>,
    children: Vec<usize>,
}

/// Page driver that replays a fixed feed: an initial batch of blocks, then
/// one batch per scroll (an empty batch is a scroll that found nothing).
#[derive(Debug)]
pub struct ScriptedDriver {
    nodes: Vec<Node>,
    initial: Vec<usize>,
    visible: Vec<usize>,
    pending: VecDeque<Vec<usize>>,
    pub authenticated: bool,
    pub fail_navigation: bool,
    pub cancel_on_scroll: Option<CancellationToken>,
    /// Directory replaced by a plain file on the first scroll.
    pub clobber_on_scroll: Option<PathBuf>,
    pub navigations: Vec<String>,
    pub scrolls: usize,
    pub closed: bool,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            initial: Vec::new(),
            visible: Vec::new(),
            pending: VecDeque::new(),
            authenticated: true,
            fail_navigation: false,
            cancel_on_scroll: None,
            clobber_on_scroll: None,
            navigations: Vec::new(),
            scrolls: 0,
            closed: false,
        }
    }

    fn push(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn block(&mut self, href: &str, text: &str) -> usize {
        let link = self.push(Node {
            matches: vec![PERMALINK_SELECTOR.to_owned()],
            text: "1h".to_owned(),
            attrs: HashMap::from([("href".to_owned(), href.to_owned())]),
            children: Vec::new(),
        });
        let message = self.push(Node {
            matches: vec![MESSAGE_SELECTOR.to_owned()],
            text: text.to_owned(),
            ..Node::default()
        });
        self.push(Node {
            matches: vec![BLOCK_SELECTOR.to_owned()],
            text: format!("1h\n{text}"),
            attrs: HashMap::new(),
            children: vec![link, message],
        })
    }

    /// A top-level post with a permalink carrying `id`.
    pub fn post(&mut self, id: &str, text: &str) -> usize {
        self.block(&format!("/groups/1/posts/{id}/"), text)
    }

    /// A comment block: its permalink carries a `comment_id`.
    pub fn reply(&mut self, id: &str, text: &str) -> usize {
        self.block(&format!("/groups/1/posts/{id}/?comment_id=77"), text)
    }

    pub fn initially(mut self, blocks: Vec<usize>) -> Self {
        self.initial = blocks;
        self
    }

    pub fn then_scroll(mut self, blocks: Vec<usize>) -> Self {
        self.pending.push_back(blocks);
        self
    }
}

impl ElementSource for ScriptedDriver {
    type Handle = usize;

    fn query_within(&self, scope: &usize, selector: &str) -> anyhow::Result<Vec<usize>> {
        let node = self
            .nodes
            .get(*scope)
            .ok_or_else(|| anyhow::anyhow!("no node {scope}"))?;
        Ok(node
            .children
            .iter()
            .copied()
            .filter(|child| self.nodes[*child].matches.iter().any(|m| m == selector))
            .collect())
    }

    fn text(&self, handle: &usize) -> anyhow::Result<String> {
        self.nodes
            .get(*handle)
            .map(|node| node.text.clone())
            .ok_or_else(|| anyhow::anyhow!("no node {handle}"))
    }

    fn attribute(&self, handle: &usize, name: &str) -> anyhow::Result<Option<String>> {
        let node = self
            .nodes
            .get(*handle)
            .ok_or_else(|| anyhow::anyhow!("no node {handle}"))?;
        Ok(node.attrs.get(name).cloned())
    }

    fn click(&mut self, _handle: &usize) -> anyhow::Result<()> {
        Ok(())
    }
}

impl PageDriver for ScriptedDriver {
    fn navigate(&mut self, url: &str) -> anyhow::Result<()> {
        self.navigations.push(url.to_owned());
        if self.fail_navigation {
            anyhow::bail!("navigation timed out after 90s");
        }
        self.visible = self.initial.clone();
        Ok(())
    }

    fn query_all(&self, selector: &str) -> anyhow::Result<Vec<usize>> {
        anyhow::ensure!(selector == BLOCK_SELECTOR, "unexpected selector {selector}");
        Ok(self.visible.clone())
    }

    fn scroll_to_bottom(&mut self) -> anyhow::Result<bool> {
        self.scrolls += 1;
        if let Some(cancel) = &self.cancel_on_scroll {
            cancel.cancel();
        }
        if let Some(dir) = self.clobber_on_scroll.take() {
            std::fs::remove_dir_all(&dir)?;
            std::fs::write(&dir, b"not a directory")?;
        }
        match self.pending.pop_front() {
            Some(batch) if !batch.is_empty() => {
                self.visible.extend(batch);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn is_authenticated(&self) -> anyhow::Result<bool> {
        Ok(self.authenticated)
    }

    fn screenshot(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, b"<scripted page>")?;
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.closed = true;
        Ok(())
    }
}

pub fn extractor() -> Extractor {
    Extractor::new(ExtractorProfile {
        expand_settle: Duration::ZERO,
        ..ExtractorProfile::default()
    })
}

pub fn loop_options(max_posts: usize, debug_dir: Option<PathBuf>) -> LoopOptions {
    LoopOptions {
        target_url: "https://www.facebook.com/groups/1".to_owned(),
        max_posts,
        block_selector: BLOCK_SELECTOR.to_owned(),
        page_settle: Duration::ZERO,
        max_idle_scrolls: MAX_IDLE_SCROLLS,
        debug_dir,
    }
}

/// Long enough for the message strategy (over ten characters).
pub fn body(n: usize) -> String {
    format!("Post number {n} with enough text to keep.")
}
