use std::path::Path;

/// Read and click access to the nodes of a loaded page.
///
/// The extractor only needs this much of a driver, so fixture handles in
/// tests and a real page driver are interchangeable.
pub trait ElementSource {
    /// Handles compare equal when they address the same node.
    type Handle: Clone + Eq + std::hash::Hash + std::fmt::Debug;

    /// All descendants of `scope` matching `selector`, in document order.
    fn query_within(
        &self,
        scope: &Self::Handle,
        selector: &str,
    ) -> anyhow::Result<Vec<Self::Handle>>;

    fn query_one(
        &self,
        scope: &Self::Handle,
        selector: &str,
    ) -> anyhow::Result<Option<Self::Handle>> {
        Ok(self.query_within(scope, selector)?.into_iter().next())
    }

    /// Rendered text of the node and its descendants.
    fn text(&self, handle: &Self::Handle) -> anyhow::Result<String>;

    fn attribute(&self, handle: &Self::Handle, name: &str) -> anyhow::Result<Option<String>>;

    fn is_visible(&self, _handle: &Self::Handle) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn click(&mut self, handle: &Self::Handle) -> anyhow::Result<()>;
}

/// Page-level operations the acquisition loop drives. Every call blocks until
/// the page settles or the driver's own timeout fires.
pub trait PageDriver: ElementSource {
    fn navigate(&mut self, url: &str) -> anyhow::Result<()>;

    fn query_all(&self, selector: &str) -> anyhow::Result<Vec<Self::Handle>>;

    /// Loads more content. Returns whether the reachable content grew.
    fn scroll_to_bottom(&mut self) -> anyhow::Result<bool>;

    fn is_authenticated(&self) -> anyhow::Result<bool>;

    fn screenshot(&self, path: &Path) -> anyhow::Result<()>;

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
