use crate::engine::status::RunOutcome;
use crate::engine::subscriptions::SubscriptionRegistry;
use crate::types::RunMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub session_id: Uuid,
    pub mode: RunMode,
    pub outcome: RunOutcome,
    pub processed: usize,
    pub failures: usize,
    pub pages_loaded: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Milliseconds from the start of the run to each successful action.
    pub completion_offsets_ms: Vec<u64>,
    pub error: Option<String>,
}

/// State owned by one run: identity, cancellation, counters and the
/// subscriptions it holds open.
pub struct RunSession {
    id: Uuid,
    mode: RunMode,
    cancel: CancellationToken,
    registry: SubscriptionRegistry,
    processed: usize,
    failures: usize,
    pages_loaded: usize,
    started: Instant,
    started_at: DateTime<Utc>,
    completions: Vec<Instant>,
}

impl RunSession {
    pub fn new(mode: RunMode, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            cancel,
            registry: SubscriptionRegistry::new(),
            processed: 0,
            failures: 0,
            pages_loaded: 0,
            started: Instant::now(),
            started_at: Utc::now(),
            completions: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn pages_loaded(&self) -> usize {
        self.pages_loaded
    }

    pub fn record_success(&mut self) {
        self.processed += 1;
        self.completions.push(Instant::now());
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub fn record_page(&mut self) {
        self.pages_loaded += 1;
    }

    /// Time still to wait before another action may start.
    pub fn throttle_remaining(&self, min_interval: Duration) -> Option<Duration> {
        let last = self.completions.last()?;
        min_interval
            .checked_sub(last.elapsed())
            .filter(|remaining| !remaining.is_zero())
    }

    /// Releases every subscription still registered. Returns how many
    /// were left behind.
    pub fn teardown(&self) -> usize {
        let labels = self.registry.live_labels();
        let leaked = self.registry.release_all();
        if leaked > 0 {
            warn!(session = %self.id, leaked, ?labels, "subscriptions outlived their wait");
        }
        leaked
    }

    pub fn report(&self, outcome: RunOutcome, error: Option<String>) -> RunReport {
        let report = RunReport {
            session_id: self.id,
            mode: self.mode,
            outcome,
            processed: self.processed,
            failures: self.failures,
            pages_loaded: self.pages_loaded,
            started_at: self.started_at,
            finished_at: Utc::now(),
            completion_offsets_ms: self
                .completions
                .iter()
                .map(|at| at.duration_since(self.started).as_millis() as u64)
                .collect(),
            error,
        };
        info!(
            session = %report.session_id,
            outcome = ?report.outcome,
            processed = report.processed,
            failures = report.failures,
            "run finished"
        );
        report
    }
}
