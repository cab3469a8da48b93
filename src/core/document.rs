use crate::dom::Locator;
use crate::errors::Result;
use crate::types::{ElementRect, NodeId, ScrollMetrics};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One change observed in the external tree.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRecord {
    /// Parent whose child list changed; `None` when the backend cannot tell.
    pub target: Option<NodeId>,
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

impl MutationRecord {
    pub fn unlocated() -> Self {
        Self {
            target: None,
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

/// The live, foreign-owned tree the engine observes and acts upon.
///
/// Implementations never cache: every call reflects the state of the tree at
/// the time it runs, and nothing returned may be assumed valid after the
/// caller awaits something else.
#[async_trait]
pub trait Document: Send + Sync {
    /// The outermost node (the document body).
    async fn root(&self) -> Result<NodeId>;

    /// Every descendant of `scope` (the whole document when `None`) matching
    /// `locator`, in document order. The scope node itself is never returned.
    async fn query_all(&self, scope: Option<NodeId>, locator: &Locator) -> Result<Vec<NodeId>>;

    async fn query(&self, scope: Option<NodeId>, locator: &Locator) -> Result<Option<NodeId>> {
        Ok(self.query_all(scope, locator).await?.into_iter().next())
    }

    /// Whether the node is still attached to the document.
    async fn contains(&self, node: NodeId) -> Result<bool>;

    /// Concatenated text of the node and its descendants.
    async fn text(&self, node: NodeId) -> Result<String>;

    async fn is_visible(&self, node: NodeId) -> Result<bool>;

    async fn bounding_rect(&self, node: NodeId) -> Result<Option<ElementRect>>;

    async fn has_marker(&self, node: NodeId, marker: &str) -> Result<bool>;

    async fn set_marker(&self, node: NodeId, marker: &str) -> Result<()>;

    /// Pointer move / over / enter sequence on the node.
    async fn hover(&self, node: NodeId) -> Result<()>;

    async fn click(&self, node: NodeId) -> Result<()>;

    async fn scroll_metrics(&self, node: NodeId) -> Result<ScrollMetrics>;

    /// Sets the scroll offset and dispatches a scroll event on the node.
    async fn set_scroll_top(&self, node: NodeId, scroll_top: f64) -> Result<()>;

    /// Language tag the document declares, if any.
    async fn language(&self) -> Result<Option<String>>;

    /// Change notifications from this point on.
    fn subscribe(&self) -> broadcast::Receiver<MutationRecord>;

    /// Whether `node` lies strictly inside `ancestor`.
    async fn is_descendant(&self, node: NodeId, ancestor: NodeId) -> Result<bool>;
}

pub type SharedDocument = Arc<dyn Document>;
