use crate::core::Document;
use crate::errors::{Result, SweepError};
use crate::layout::Layout;
use crate::types::NodeId;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Picks the next row to act on inside the messages container.
///
/// A finder lives for one run and remembers every row handed to the
/// workflow, so a row is never offered twice even when the page refuses
/// the marker written on it.
pub struct TargetFinder<'a> {
    layout: &'a Layout,
    container: NodeId,
    in_view_offset: f64,
    attempted: Mutex<HashSet<NodeId>>,
}

impl<'a> TargetFinder<'a> {
    pub fn new(layout: &'a Layout, container: NodeId, in_view_offset: f64) -> Self {
        Self {
            layout,
            container,
            in_view_offset,
            attempted: Mutex::new(HashSet::new()),
        }
    }

    fn attempted(&self) -> MutexGuard<'_, HashSet<NodeId>> {
        self.attempted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records that `row` is being handed to the workflow. Returns `false`
    /// if it already was.
    pub fn claim(&self, row: NodeId) -> bool {
        self.attempted().insert(row)
    }

    pub fn attempted_count(&self) -> usize {
        self.attempted().len()
    }

    pub fn container(&self) -> NodeId {
        self.container
    }

    /// Eligible rows that are visible and far enough into the viewport,
    /// newest first.
    pub async fn candidates(&self, document: &dyn Document) -> Result<Vec<NodeId>> {
        let rows = document
            .query_all(Some(self.container), &self.layout.eligible_row())
            .await?;
        let mut candidates = Vec::new();
        for row in rows.into_iter().rev() {
            let seen = self.attempted().contains(&row);
            if seen {
                continue;
            }
            match self.in_view(document, row).await {
                Ok(true) => candidates.push(row),
                Ok(false) => {}
                // Removed between the query and the check.
                Err(SweepError::StaleNode(_)) => trace!(%row, "candidate went stale"),
                Err(e) => return Err(e),
            }
        }
        Ok(candidates)
    }

    pub async fn next_target(&self, document: &dyn Document) -> Result<Option<NodeId>> {
        Ok(self.candidates(document).await?.into_iter().next())
    }

    async fn in_view(&self, document: &dyn Document, row: NodeId) -> Result<bool> {
        if !document.is_visible(row).await? {
            return Ok(false);
        }
        Ok(document
            .bounding_rect(row)
            .await?
            .map(|rect| rect.y > self.in_view_offset)
            .unwrap_or(false))
    }

    /// Whether the marker rendered only at the very start of the
    /// conversation is on screen.
    pub async fn top_marker_visible(&self, document: &dyn Document) -> Result<bool> {
        match document.query(None, &self.layout.top_marker).await? {
            Some(marker) => match document.is_visible(marker).await {
                Ok(visible) => Ok(visible),
                Err(SweepError::StaleNode(_)) => Ok(false),
                Err(e) => Err(e),
            },
            None => Ok(false),
        }
    }
}
