use crate::core::TimingConfig;
use crate::engine::wait::{Removed, Waiter};
use crate::errors::{Result, SweepError};
use crate::layout::{Layout, INELIGIBLE_MARKER, PROCESSED_MARKER};
use crate::types::{NodeId, RunMode};
use serde::Serialize;
use std::fmt;
use tracing::{debug, instrument, warn};

/// States of the per-target workflow, in the only order they can occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkflowStep {
    Idle,
    RevealControl,
    OpenMenu,
    SelectAction,
    ConfirmAction,
    AwaitRemoval,
    Done,
    Failed,
}

impl WorkflowStep {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStep::Done | WorkflowStep::Failed)
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Drives one target through the scripted interaction.
pub struct Sequencer<'a> {
    waiter: &'a Waiter,
    layout: &'a Layout,
    timing: &'a TimingConfig,
    mode: RunMode,
}

struct Progress<'t> {
    current: WorkflowStep,
    trace: &'t mut Vec<WorkflowStep>,
}

impl Progress<'_> {
    fn enter(&mut self, step: WorkflowStep) {
        debug!(from = %self.current, to = %step, "workflow transition");
        self.current = step;
        self.trace.push(step);
    }
}

impl<'a> Sequencer<'a> {
    pub fn new(waiter: &'a Waiter, layout: &'a Layout, timing: &'a TimingConfig, mode: RunMode) -> Self {
        Self {
            waiter,
            layout,
            timing,
            mode,
        }
    }

    /// Runs the workflow on `target`. `Ok` once the target has left the
    /// tree; any failure marks the target ineligible and comes back as a
    /// single [`SweepError::Workflow`] naming the step that failed.
    pub async fn execute(&self, target: NodeId) -> Result<()> {
        let mut trace = Vec::new();
        self.execute_traced(target, &mut trace).await
    }

    #[instrument(skip(self, trace), fields(mode = ?self.mode))]
    pub async fn execute_traced(&self, target: NodeId, trace: &mut Vec<WorkflowStep>) -> Result<()> {
        trace.push(WorkflowStep::Idle);
        let mut progress = Progress {
            current: WorkflowStep::Idle,
            trace,
        };
        match self.steps(target, &mut progress).await {
            Ok(()) => {
                progress.enter(WorkflowStep::Done);
                Ok(())
            }
            Err(source) => {
                let step = progress.current;
                progress.enter(WorkflowStep::Failed);
                self.mark_ineligible(target).await;
                Err(SweepError::Workflow {
                    step,
                    source: Box::new(source),
                })
            }
        }
    }

    async fn steps(&self, target: NodeId, progress: &mut Progress<'_>) -> Result<()> {
        let document = self.waiter.document();
        let step_timeout = Some(self.timing.step_timeout());

        progress.enter(WorkflowStep::RevealControl);
        self.waiter.ensure_active()?;
        document.hover(target).await?;
        let control = self
            .waiter
            .appearance(
                Some(target),
                self.layout.reveal_control.clone(),
                Some(self.timing.reveal_timeout()),
            )
            .await?;

        // Menus render outside the target, so the search is document-wide.
        // A menu or dialog left open by an earlier target must not count.
        progress.enter(WorkflowStep::OpenMenu);
        let menu_item = self
            .waiter
            .click_for_new(control, self.layout.menu_item(self.mode), step_timeout)
            .await?;

        progress.enter(WorkflowStep::SelectAction);
        let confirm = self
            .waiter
            .click_for_new(menu_item, self.layout.confirm_control.clone(), step_timeout)
            .await?;

        // The surface is gone once its own confirm control has left the tree.
        progress.enter(WorkflowStep::ConfirmAction);
        self.waiter
            .click_and_wait(confirm, None, &Removed { node: confirm }, step_timeout)
            .await?;
        if let Err(e) = document.set_marker(target, PROCESSED_MARKER).await {
            debug!(error = %e, "target left before it could be marked processed");
        }

        progress.enter(WorkflowStep::AwaitRemoval);
        self.waiter.removal(target, step_timeout).await
    }

    async fn mark_ineligible(&self, target: NodeId) {
        match self.waiter.document().set_marker(target, INELIGIBLE_MARKER).await {
            Ok(()) => {}
            Err(SweepError::StaleNode(_)) => {}
            Err(e) => warn!(error = %e, "could not mark target ineligible"),
        }
    }
}
