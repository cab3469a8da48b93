use crate::core::{Config, Document, SharedDocument};
use crate::engine::pagination::{Advance, Paginator};
use crate::engine::session::{RunReport, RunSession};
use crate::engine::status::{RunOutcome, StatusReporter, READY, STOPPING};
use crate::engine::targets::TargetFinder;
use crate::engine::wait::Waiter;
use crate::engine::workflow::Sequencer;
use crate::errors::{Result, SweepError};
use crate::layout::{Layout, LayoutRegistry};
use crate::types::RunMode;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Start/stop surface over a single document.
///
/// At most one run is live at a time. A run keeps its slot until it has
/// fully unwound, including after [`Controller::stop`].
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    document: SharedDocument,
    layouts: LayoutRegistry,
    config: Config,
    status: StatusReporter,
    active: Mutex<Option<ActiveRun>>,
}

struct ActiveRun {
    id: Uuid,
    cancel: CancellationToken,
}

/// Frees the run slot when the owning run is dropped, however it ends.
struct SlotGuard {
    inner: Arc<ControllerInner>,
    id: Uuid,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut active = self.inner.slot();
        if active.as_ref().map(|run| run.id) == Some(self.id) {
            *active = None;
        }
    }
}

impl ControllerInner {
    fn slot(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Controller {
    pub fn new(document: SharedDocument, config: Config) -> Self {
        Self::with_layouts(document, config, LayoutRegistry::default())
    }

    pub fn with_layouts(document: SharedDocument, config: Config, layouts: LayoutRegistry) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                document,
                layouts,
                config,
                status: StatusReporter::new(),
                active: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> watch::Receiver<String> {
        self.inner.status.subscribe()
    }

    pub fn status_line(&self) -> String {
        self.inner.status.current()
    }

    /// A run holds the slot and has not been asked to stop.
    pub fn is_running(&self) -> bool {
        self.inner
            .slot()
            .as_ref()
            .map(|run| !run.cancel.is_cancelled())
            .unwrap_or(false)
    }

    /// Asks the live run to stop. Returns `false` when there was nothing to
    /// stop, including when a stop is already under way.
    pub fn stop(&self) -> bool {
        let active = self.inner.slot();
        match active.as_ref() {
            Some(run) if !run.cancel.is_cancelled() => {
                info!(session = %run.id, "stop requested");
                run.cancel.cancel();
                self.inner.status.set(STOPPING);
                true
            }
            _ => false,
        }
    }

    /// Puts the status back to its idle line once no run is live.
    pub fn reset(&self) {
        if self.inner.slot().is_none() {
            self.inner.status.set(READY);
        }
    }

    /// Starts a run in the background.
    pub fn start(&self, mode: RunMode) -> Result<JoinHandle<RunReport>> {
        let (session, guard) = self.claim(mode)?;
        let controller = self.clone();
        Ok(tokio::spawn(async move {
            controller.execute(session, guard).await
        }))
    }

    /// Runs to completion on the current task.
    pub async fn run(&self, mode: RunMode) -> Result<RunReport> {
        let (session, guard) = self.claim(mode)?;
        Ok(self.execute(session, guard).await)
    }

    fn claim(&self, mode: RunMode) -> Result<(RunSession, SlotGuard)> {
        self.inner.config.validate()?;
        let mut active = self.inner.slot();
        if active.is_some() {
            return Err(SweepError::Busy);
        }
        let session = RunSession::new(mode, CancellationToken::new());
        *active = Some(ActiveRun {
            id: session.id(),
            cancel: session.cancel_token().clone(),
        });
        let guard = SlotGuard {
            inner: self.inner.clone(),
            id: session.id(),
        };
        Ok((session, guard))
    }

    #[instrument(skip_all, fields(session = %session.id(), mode = ?session.mode()))]
    async fn execute(&self, mut session: RunSession, guard: SlotGuard) -> RunReport {
        info!("run started");
        let result = self.drive(&mut session).await;
        let (outcome, failure) = match result {
            Ok(()) if session.is_cancelled() => (RunOutcome::Aborted, None),
            Ok(()) => (RunOutcome::Completed, None),
            Err(e) if e.is_cancelled() || session.is_cancelled() => (RunOutcome::Aborted, None),
            Err(e) => {
                error!(error = %e, "run failed");
                (RunOutcome::Errored, Some(e.to_string()))
            }
        };
        session.teardown();
        drop(guard);
        self.inner
            .status
            .set(outcome.status_line(session.processed()));
        session.report(outcome, failure)
    }

    async fn drive(&self, session: &mut RunSession) -> Result<()> {
        let inner = &self.inner;
        let document = inner.document.clone();
        let waiter = Waiter::new(
            document.clone(),
            session.registry().clone(),
            session.cancel_token().clone(),
        );
        let layout = inner
            .layouts
            .detect(document.as_ref(), &inner.config.run.fallback_language)
            .await?;

        inner.status.set("Looking for the conversation...");
        let container = document
            .query(None, &layout.messages_root)
            .await?
            .ok_or_else(|| SweepError::Discovery("messages container not found".to_string()))?;
        debug!(%container, layout = %layout.name, "conversation found");

        let finder = TargetFinder::new(&layout, container, inner.config.run.in_view_offset_px);
        let mut paginator = Paginator::new(
            &waiter,
            &layout,
            &inner.config.timing,
            &inner.config.run,
            container,
        );
        paginator.rewind_to_end().await?;

        loop {
            waiter.ensure_active()?;
            self.drain(session, &waiter, &layout, &finder).await?;

            let at_top =
                paginator.reached_start() || finder.top_marker_visible(document.as_ref()).await?;
            if at_top && finder.next_target(document.as_ref()).await?.is_none() {
                info!(processed = session.processed(), "nothing left to process");
                return Ok(());
            }

            match paginator.step(&finder).await? {
                Advance::Moved => {}
                Advance::AtStart if paginator.reached_start() => return Ok(()),
                Advance::AtStart => {
                    inner.status.set("Loading next page...");
                    if paginator.load_more().await? {
                        inner.status.set(format!(
                            "All pages loaded ({} in total)...",
                            session.pages_loaded() + 1
                        ));
                    } else {
                        session.record_page();
                    }
                }
            }
        }
    }

    /// Processes every candidate currently in view, newest first.
    async fn drain(
        &self,
        session: &mut RunSession,
        waiter: &Waiter,
        layout: &Layout,
        finder: &TargetFinder<'_>,
    ) -> Result<()> {
        let timing = &self.inner.config.timing;
        let sequencer = Sequencer::new(waiter, layout, timing, session.mode());
        loop {
            waiter.ensure_active()?;
            self.inner.status.set("Retrieving next message...");
            let Some(target) = finder.next_target(waiter.document()).await? else {
                return Ok(());
            };
            if let Some(remaining) = session.throttle_remaining(timing.min_action_interval()) {
                let remaining_ms = remaining.as_millis() as u64;
                debug!(remaining_ms, "throttling");
                self.inner.status.set(format!(
                    "Waiting {} ms before next action...",
                    remaining_ms
                ));
                waiter.sleep(remaining).await?;
                continue;
            }

            self.inner.status.set(format!(
                "{}... ({})",
                session.mode().progress_verb(),
                session.processed() + 1
            ));
            finder.claim(target);
            match sequencer.execute(target).await {
                Ok(()) => session.record_success(),
                Err(e) if e.is_cancelled() => return Err(SweepError::Cancelled),
                Err(e) if e.is_target_local() => {
                    warn!(error = %e, %target, "target skipped");
                    session.record_failure();
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::MemoryDocument;
    use crate::testing::{RowKind, ThreadSimulator};
    use std::time::Duration;
    use tokio_test::assert_err;

    #[tokio::test(start_paused = true)]
    async fn missing_container_errors_the_run() {
        let controller = Controller::new(Arc::new(MemoryDocument::new()), Config::default());
        let report = controller.run(RunMode::Unsend).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Errored);
        assert!(report.error.unwrap().contains("messages container"));
        assert_eq!(controller.status_line(), "Errored. 0 processed.");
        assert!(!controller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_busy() {
        let sim = ThreadSimulator::builder()
            .rows(&[RowKind::Mine; 2])
            .build()
            .unwrap();
        let controller = Controller::new(sim.shared(), Config::default());
        let handle = controller.start(RunMode::Unsend).unwrap();
        assert!(controller.is_running());
        let err = assert_err!(controller.start(RunMode::Delete));
        assert!(matches!(err, SweepError::Busy));

        let report = handle.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(!controller.is_running());
        assert!(controller.start(RunMode::Unsend).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let sim = ThreadSimulator::builder()
            .rows(&[RowKind::Mine; 3])
            .removal_delay_ms(2_000)
            .build()
            .unwrap();
        let controller = Controller::new(sim.shared(), Config::default());
        assert!(!controller.stop());

        let handle = controller.start(RunMode::Unsend).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(controller.stop());
        assert!(!controller.stop());
        assert!(!controller.is_running());
        assert_eq!(controller.status_line(), STOPPING);

        let report = handle.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Aborted);
        assert_eq!(controller.status_line(), "Aborted. 0 processed.");
        assert!(!controller.stop());

        controller.reset();
        assert_eq!(controller.status_line(), READY);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_up_front() {
        let mut config = Config::default();
        config.run.scroll_step_px = 0.0;
        let controller = Controller::new(Arc::new(MemoryDocument::new()), config);
        let err = assert_err!(controller.run(RunMode::Unsend).await);
        assert!(matches!(err, SweepError::ConfigurationError(_)));
        assert!(!controller.is_running());
    }
}
