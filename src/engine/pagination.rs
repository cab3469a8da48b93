use crate::core::{Document, RunConfig, TimingConfig};
use crate::dom::Locator;
use crate::engine::targets::TargetFinder;
use crate::engine::wait::{Probe, Waiter};
use crate::errors::{Result, SweepError};
use crate::layout::Layout;
use crate::types::NodeId;
use async_trait::async_trait;
use tracing::{debug, info, instrument};

/// Result of moving the viewport toward older content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The viewport moved; there may be new rows to look at.
    Moved,
    /// Already at the start of the loaded content.
    AtStart,
}

/// A loader shows up in the container. Until it does, every check puts
/// the viewport back at the very top so the host keeps trying to load.
struct LoaderShows {
    container: NodeId,
    loader: Locator,
}

#[async_trait]
impl Probe for LoaderShows {
    type Output = NodeId;

    fn describe(&self) -> String {
        "loading indicator".to_string()
    }

    async fn probe(&self, document: &dyn Document) -> Result<Option<NodeId>> {
        if let Some(loader) = document.query(Some(self.container), &self.loader).await? {
            return Ok(Some(loader));
        }
        document.set_scroll_top(self.container, 0.0).await?;
        Ok(None)
    }
}

/// Moves the messages container toward older content and triggers the
/// loading of older pages.
pub struct Paginator<'a> {
    waiter: &'a Waiter,
    layout: &'a Layout,
    timing: &'a TimingConfig,
    scroll_step: f64,
    container: NodeId,
    reached_start: bool,
}

impl<'a> Paginator<'a> {
    pub fn new(
        waiter: &'a Waiter,
        layout: &'a Layout,
        timing: &'a TimingConfig,
        run: &RunConfig,
        container: NodeId,
    ) -> Self {
        Self {
            waiter,
            layout,
            timing,
            scroll_step: run.scroll_step_px,
            container,
            reached_start: false,
        }
    }

    /// Whether a load attempt ended with the viewport still at the top.
    pub fn reached_start(&self) -> bool {
        self.reached_start
    }

    /// Moves the viewport to the newest end of the conversation.
    pub async fn rewind_to_end(&self) -> Result<()> {
        let document = self.waiter.document();
        let metrics = document.scroll_metrics(self.container).await?;
        document
            .set_scroll_top(self.container, metrics.max_scroll_top())
            .await
    }

    /// Scrolls to the top and waits for the host to load older content.
    ///
    /// Returns `true` when the viewport is still at the top afterwards,
    /// meaning nothing older exists, and `false` when content was added
    /// above.
    #[instrument(skip(self), fields(container = %self.container))]
    pub async fn load_more(&mut self) -> Result<bool> {
        let document = self.waiter.document();
        document.set_scroll_top(self.container, 0.0).await?;

        let probe = LoaderShows {
            container: self.container,
            loader: self.layout.loader.clone(),
        };
        let loader = match self
            .waiter
            .wait_for(Some(self.container), &probe, Some(self.timing.loader_grace()))
            .await
        {
            Ok(loader) => Some(loader),
            Err(SweepError::Timeout { .. }) => None,
            Err(e) => return Err(e),
        };

        if let Some(loader) = loader {
            debug!(%loader, "waiting for loader to go away");
            self.waiter
                .disappearance(Some(self.container), self.layout.loader.clone(), None)
                .await?;
        } else {
            debug!("no loader within the grace period");
        }

        let metrics = document.scroll_metrics(self.container).await?;
        self.reached_start = metrics.at_start();
        if self.reached_start {
            info!("start of the conversation reached");
        }
        Ok(self.reached_start)
    }

    /// Steps the viewport backward until a candidate row is in view or the
    /// top is reached.
    pub async fn step(&self, finder: &TargetFinder<'_>) -> Result<Advance> {
        let document = self.waiter.document();
        let mut moved = false;
        loop {
            let metrics = document.scroll_metrics(self.container).await?;
            if metrics.at_start() {
                return Ok(if moved { Advance::Moved } else { Advance::AtStart });
            }
            let next = (metrics.scroll_top - self.scroll_step).max(0.0);
            document.set_scroll_top(self.container, next).await?;
            self.waiter.sleep(self.timing.scroll_settle()).await?;
            moved = true;

            let rows = document
                .query_all(Some(self.container), &self.layout.row)
                .await?;
            if rows.is_empty() {
                self.waiter
                    .next_change(Some(self.container), self.timing.new_content_timeout())
                    .await?;
            }
            if finder.next_target(document).await?.is_some() {
                return Ok(Advance::Moved);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SubscriptionRegistry;
    use crate::testing::{RowKind, ThreadSimulator};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn waiter_for(sim: &ThreadSimulator) -> Waiter {
        Waiter::new(
            Arc::new(sim.document().clone()),
            SubscriptionRegistry::new(),
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn loader_then_more_content_is_not_the_start() {
        let sim = ThreadSimulator::builder()
            .rows(&[RowKind::Theirs; 15])
            .older_page(&[RowKind::Mine; 3])
            .build()
            .unwrap();
        let waiter = waiter_for(&sim);
        let layout = Layout::english();
        let timing = TimingConfig::default();
        let mut paginator =
            Paginator::new(&waiter, &layout, &timing, &RunConfig::default(), sim.container());

        assert!(!paginator.load_more().await.unwrap());
        assert!(!paginator.reached_start());
        assert_eq!(sim.rows().len(), 18);
        assert!(sim.top_marker().is_some());
        assert_eq!(waiter.registry().live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_loader_at_the_top_is_the_start() {
        let sim = ThreadSimulator::builder()
            .rows(&[RowKind::Mine; 3])
            .build()
            .unwrap();
        let waiter = waiter_for(&sim);
        let layout = Layout::english();
        let timing = TimingConfig::default();
        let mut paginator =
            Paginator::new(&waiter, &layout, &timing, &RunConfig::default(), sim.container());

        let started = Instant::now();
        assert!(paginator.load_more().await.unwrap());
        assert!(paginator.reached_start());
        assert!(started.elapsed() >= timing.loader_grace());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_load_after_grace_is_not_the_start() {
        let sim = ThreadSimulator::builder()
            .rows(&[RowKind::Theirs; 15])
            .older_page(&[RowKind::Mine; 2])
            .loader(false)
            .build()
            .unwrap();
        let waiter = waiter_for(&sim);
        let layout = Layout::english();
        let timing = TimingConfig::default();
        let mut paginator =
            Paginator::new(&waiter, &layout, &timing, &RunConfig::default(), sim.container());

        assert!(!paginator.load_more().await.unwrap());
        assert_eq!(sim.rows().len(), 17);
    }

    #[tokio::test(start_paused = true)]
    async fn steps_until_a_candidate_is_in_view() {
        let mut kinds = vec![RowKind::Mine];
        kinds.extend([RowKind::Theirs; 19]);
        let sim = ThreadSimulator::builder().rows(&kinds).build().unwrap();
        let waiter = waiter_for(&sim);
        let layout = Layout::english();
        let timing = TimingConfig::default();
        let paginator =
            Paginator::new(&waiter, &layout, &timing, &RunConfig::default(), sim.container());
        let finder = TargetFinder::new(&layout, sim.container(), 100.0);

        paginator.rewind_to_end().await.unwrap();
        assert_eq!(finder.next_target(sim.document()).await.unwrap(), None);

        assert_eq!(paginator.step(&finder).await.unwrap(), Advance::Moved);
        assert_eq!(
            finder.next_target(sim.document()).await.unwrap(),
            Some(sim.rows()[0])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn step_at_the_top_reports_start() {
        let sim = ThreadSimulator::builder()
            .rows(&[RowKind::Theirs; 2])
            .build()
            .unwrap();
        let waiter = waiter_for(&sim);
        let layout = Layout::english();
        let timing = TimingConfig::default();
        let paginator =
            Paginator::new(&waiter, &layout, &timing, &RunConfig::default(), sim.container());
        let finder = TargetFinder::new(&layout, sim.container(), 100.0);

        assert_eq!(paginator.step(&finder).await.unwrap(), Advance::AtStart);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_loader_wait() {
        let sim = ThreadSimulator::builder()
            .rows(&[RowKind::Mine; 3])
            .build()
            .unwrap();
        let waiter = waiter_for(&sim);
        let layout = Layout::english();
        let timing = TimingConfig::default();
        let mut paginator =
            Paginator::new(&waiter, &layout, &timing, &RunConfig::default(), sim.container());

        let token = waiter.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            token.cancel();
        });
        assert!(paginator.load_more().await.unwrap_err().is_cancelled());
        assert_eq!(waiter.registry().live(), 0);
    }
}
