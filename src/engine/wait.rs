//! Bounded, cancellable waits over the external tree.
//!
//! Every wait follows the same shape: subscribe to change notifications,
//! check the condition once, then re-check after each change in scope until
//! it holds, the deadline passes, or the session is cancelled. Exactly one
//! of those outcomes is reported and the subscription is released on all
//! three paths.

use crate::core::{Document, SharedDocument};
use crate::dom::Locator;
use crate::engine::subscriptions::{Subscription, SubscriptionRegistry};
use crate::errors::{Result, SweepError};
use crate::types::NodeId;
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A condition over the live tree.
#[async_trait]
pub trait Probe: Send + Sync {
    type Output: Send;

    /// What is being waited for, used in logs and timeout errors.
    fn describe(&self) -> String;

    /// `Some` once the condition holds.
    async fn probe(&self, document: &dyn Document) -> Result<Option<Self::Output>>;
}

/// A node matching the locator is present.
pub struct Appears {
    pub scope: Option<NodeId>,
    pub locator: Locator,
}

#[async_trait]
impl Probe for Appears {
    type Output = NodeId;

    fn describe(&self) -> String {
        format!("appearance of {:?}", self.locator)
    }

    async fn probe(&self, document: &dyn Document) -> Result<Option<NodeId>> {
        document.query(self.scope, &self.locator).await
    }
}

/// A node matching the locator is present that was not among `existing`.
///
/// Menus and dialogs left open by an earlier interaction keep matching the
/// same locators, so a consequence of a click is only accepted when it is
/// a node the click brought in.
pub struct AppearsAnew {
    pub scope: Option<NodeId>,
    pub locator: Locator,
    pub existing: HashSet<NodeId>,
}

#[async_trait]
impl Probe for AppearsAnew {
    type Output = NodeId;

    fn describe(&self) -> String {
        format!("new {:?}", self.locator)
    }

    async fn probe(&self, document: &dyn Document) -> Result<Option<NodeId>> {
        Ok(document
            .query_all(self.scope, &self.locator)
            .await?
            .into_iter()
            .find(|node| !self.existing.contains(node)))
    }
}

/// A previously held node is no longer part of the tree.
pub struct Removed {
    pub node: NodeId,
}

#[async_trait]
impl Probe for Removed {
    type Output = ();

    fn describe(&self) -> String {
        format!("removal of node {}", self.node)
    }

    async fn probe(&self, document: &dyn Document) -> Result<Option<()>> {
        Ok((!document.contains(self.node).await?).then_some(()))
    }
}

/// Nothing matches the locator any more.
pub struct Vanishes {
    pub scope: Option<NodeId>,
    pub locator: Locator,
}

#[async_trait]
impl Probe for Vanishes {
    type Output = ();

    fn describe(&self) -> String {
        format!("disappearance of {:?}", self.locator)
    }

    async fn probe(&self, document: &dyn Document) -> Result<Option<()>> {
        match document.query(self.scope, &self.locator).await {
            Ok(found) => Ok(found.is_none().then_some(())),
            // A detached scope holds no matches.
            Err(SweepError::StaleNode(_)) => Ok(Some(())),
            Err(e) => Err(e),
        }
    }
}

/// Runs waits against one document on behalf of one session.
#[derive(Clone)]
pub struct Waiter {
    document: SharedDocument,
    registry: SubscriptionRegistry,
    cancel: CancellationToken,
}

impl Waiter {
    pub fn new(
        document: SharedDocument,
        registry: SubscriptionRegistry,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            document,
            registry,
            cancel,
        }
    }

    pub fn document(&self) -> &dyn Document {
        self.document.as_ref()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(SweepError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn subscribe(&self, label: String) -> Result<Subscription> {
        self.ensure_active()?;
        Ok(self
            .registry
            .register(label, &self.cancel, self.document.subscribe()))
    }

    /// Resolves as soon as `probe` holds, re-checking after every change
    /// inside `scope` (the whole document when `None`).
    pub async fn wait_for<P: Probe>(
        &self,
        scope: Option<NodeId>,
        probe: &P,
        timeout: Option<Duration>,
    ) -> Result<P::Output> {
        let mut subscription = self.subscribe(probe.describe())?;
        if let Some(found) = probe.probe(self.document()).await? {
            return Ok(found);
        }
        self.watch(&mut subscription, scope, probe, timeout).await
    }

    pub async fn appearance(
        &self,
        scope: Option<NodeId>,
        locator: Locator,
        timeout: Option<Duration>,
    ) -> Result<NodeId> {
        self.wait_for(scope, &Appears { scope, locator }, timeout)
            .await
    }

    pub async fn removal(&self, node: NodeId, timeout: Option<Duration>) -> Result<()> {
        self.wait_for(None, &Removed { node }, timeout).await
    }

    pub async fn disappearance(
        &self,
        scope: Option<NodeId>,
        locator: Locator,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.wait_for(scope, &Vanishes { scope, locator }, timeout)
            .await
    }

    /// Clicks `control` and waits for the consequence described by `probe`.
    ///
    /// The subscription is in place and the condition checked before the
    /// click, and checked again right after it, so a consequence that is
    /// already satisfied or lands instantly is never missed.
    pub async fn click_and_wait<P: Probe>(
        &self,
        control: NodeId,
        scope: Option<NodeId>,
        probe: &P,
        timeout: Option<Duration>,
    ) -> Result<P::Output> {
        let mut subscription = self.subscribe(probe.describe())?;
        let before = probe.probe(self.document()).await?;
        self.document.click(control).await?;
        if let Some(found) = before {
            return Ok(found);
        }
        if let Some(found) = probe.probe(self.document()).await? {
            return Ok(found);
        }
        self.watch(&mut subscription, scope, probe, timeout).await
    }

    /// Clicks `control` and waits for a node matching `locator` that was not
    /// in the document before the click.
    pub async fn click_for_new(
        &self,
        control: NodeId,
        locator: Locator,
        timeout: Option<Duration>,
    ) -> Result<NodeId> {
        let existing: HashSet<NodeId> = self
            .document
            .query_all(None, &locator)
            .await?
            .into_iter()
            .collect();
        if !existing.is_empty() {
            debug!(leftover = existing.len(), what = ?locator, "ignoring matches already open");
        }
        let probe = AppearsAnew {
            scope: None,
            locator,
            existing,
        };
        self.click_and_wait(control, None, &probe, timeout).await
    }

    /// Waits for the next change inside `scope`. `Ok(false)` when the
    /// timeout passes first.
    pub async fn next_change(&self, scope: Option<NodeId>, timeout: Duration) -> Result<bool> {
        let mut subscription = self.subscribe("next change".to_string())?;
        let deadline = Instant::now() + timeout;
        loop {
            let change = tokio::select! {
                biased;
                _ = subscription.token.cancelled() => return Err(SweepError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Ok(false),
                change = subscription.receiver.recv() => change,
            };
            match change {
                Ok(record) => {
                    if self.in_scope(scope, record.target).await? {
                        return Ok(true);
                    }
                }
                Err(RecvError::Lagged(_)) => return Ok(true),
                Err(RecvError::Closed) => return Err(SweepError::FeedClosed),
            }
        }
    }

    /// Sleeps unless the session is cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.ensure_active()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SweepError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn watch<P: Probe>(
        &self,
        subscription: &mut Subscription,
        scope: Option<NodeId>,
        probe: &P,
        timeout: Option<Duration>,
    ) -> Result<P::Output> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let change = tokio::select! {
                biased;
                _ = subscription.token.cancelled() => {
                    debug!(what = %probe.describe(), "wait cancelled");
                    return Err(SweepError::Cancelled);
                }
                _ = until(deadline) => {
                    let timeout_ms = timeout.map(|t| t.as_millis() as u64).unwrap_or_default();
                    debug!(what = %probe.describe(), timeout_ms, "wait timed out");
                    return Err(SweepError::timeout(probe.describe(), timeout_ms));
                }
                change = subscription.receiver.recv() => change,
            };
            match change {
                Ok(record) => {
                    if !self.in_scope(scope, record.target).await? {
                        continue;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    trace!(missed, "change feed lagged, re-checking");
                }
                Err(RecvError::Closed) => return Err(SweepError::FeedClosed),
            }
            if let Some(found) = probe.probe(self.document()).await? {
                return Ok(found);
            }
        }
    }

    async fn in_scope(&self, scope: Option<NodeId>, target: Option<NodeId>) -> Result<bool> {
        match (scope, target) {
            (None, _) | (_, None) => Ok(true),
            (Some(scope), Some(target)) if scope == target => Ok(true),
            (Some(scope), Some(target)) => self.document.is_descendant(target, scope).await,
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{MemoryDocument, NodeSpec};
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn waiter(doc: &MemoryDocument) -> Waiter {
        Waiter::new(
            Arc::new(doc.clone()),
            SubscriptionRegistry::new(),
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_immediately_when_already_present() {
        let doc = MemoryDocument::new();
        let menu = doc
            .append(doc.root_id(), NodeSpec::new("div").with_role("menu"))
            .unwrap();
        let waiter = waiter(&doc);
        let found = waiter
            .appearance(None, Locator::role("menu"), Some(Duration::from_millis(10)))
            .await;
        assert_eq!(assert_ok!(found), menu);
        assert_eq!(waiter.registry().live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_on_later_insertion() {
        let doc = MemoryDocument::new();
        let waiter = waiter(&doc);
        let inserter = doc.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let root = inserter.root_id();
            inserter.append(root, NodeSpec::new("div").with_role("dialog")).unwrap();
        });
        let found = waiter
            .appearance(None, Locator::role("dialog"), Some(Duration::from_secs(1)))
            .await;
        assert_ok!(found);
        assert_eq!(waiter.registry().live(), 0);
        assert_eq!(waiter.registry().released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_releases_subscription() {
        let doc = MemoryDocument::new();
        let waiter = waiter(&doc);
        let err = assert_err!(
            waiter
                .appearance(None, Locator::role("menu"), Some(Duration::from_millis(200)))
                .await
        );
        assert!(matches!(err, SweepError::Timeout { timeout_ms: 200, .. }));
        assert_eq!(waiter.registry().live(), 0);
        assert_eq!(doc.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_unbounded_wait() {
        let doc = MemoryDocument::new();
        let waiter = waiter(&doc);
        let token = waiter.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        });
        let err = assert_err!(waiter.appearance(None, Locator::role("menu"), None).await);
        assert!(err.is_cancelled());
        assert_eq!(waiter.registry().live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_to_start_once_cancelled() {
        let doc = MemoryDocument::new();
        let waiter = waiter(&doc);
        let button = doc.append(doc.root_id(), NodeSpec::new("button")).unwrap();
        waiter.cancel_token().cancel();
        let err = assert_err!(
            waiter
                .click_and_wait(button, None, &Removed { node: button }, None)
                .await
        );
        assert!(err.is_cancelled());
        assert!(doc.interactions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn removal_and_disappearance() {
        let doc = MemoryDocument::new();
        let root = doc.root_id();
        let row = doc.append(root, NodeSpec::new("div").with_role("row")).unwrap();
        let waiter = waiter(&doc);
        let remover = doc.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remover.remove(row).unwrap();
        });
        assert_ok!(waiter.removal(row, Some(Duration::from_secs(1))).await);
        assert_ok!(
            waiter
                .disappearance(None, Locator::role("row"), Some(Duration::from_millis(1)))
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn click_for_new_skips_what_was_already_open() {
        let doc = MemoryDocument::new();
        let root = doc.root_id();
        let leftover = doc.append(root, NodeSpec::new("div").with_role("menu")).unwrap();
        let button = doc.append(root, NodeSpec::new("button")).unwrap();
        let waiter = waiter(&doc);
        let inserter = doc.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            inserter.append(root, NodeSpec::new("div").with_role("menu")).unwrap();
        });

        let found = assert_ok!(
            waiter
                .click_for_new(button, Locator::role("menu"), Some(Duration::from_secs(1)))
                .await
        );
        assert_ne!(found, leftover);
        assert!(doc.is_attached(leftover));
        assert_eq!(waiter.registry().live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn click_for_new_times_out_when_only_leftovers_match() {
        let doc = MemoryDocument::new();
        let root = doc.root_id();
        doc.append(root, NodeSpec::new("div").with_role("dialog")).unwrap();
        let button = doc.append(root, NodeSpec::new("button")).unwrap();
        let waiter = waiter(&doc);

        let err = assert_err!(
            waiter
                .click_for_new(button, Locator::role("dialog"), Some(Duration::from_millis(100)))
                .await
        );
        assert!(matches!(err, SweepError::Timeout { .. }));
        assert_eq!(doc.interactions(), vec![crate::dom::Interaction::Click(button)]);
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_changes_outside_scope() {
        let doc = MemoryDocument::new();
        let root = doc.root_id();
        let pane = doc.append(root, NodeSpec::new("div")).unwrap();
        let elsewhere = doc.append(root, NodeSpec::new("div")).unwrap();
        let waiter = waiter(&doc);
        let mutator = doc.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            mutator.append(elsewhere, NodeSpec::new("span")).unwrap();
        });
        let changed = assert_ok!(
            waiter
                .next_change(Some(pane), Duration::from_millis(100))
                .await
        );
        assert!(!changed);
    }
}
