use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

pub const READY: &str = "Ready";
pub const STOPPING: &str = "Stopping...";

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Aborted,
    Errored,
}

impl RunOutcome {
    /// Final status line for a run that processed `processed` targets.
    pub fn status_line(&self, processed: usize) -> String {
        let word = match self {
            RunOutcome::Completed => "Done",
            RunOutcome::Aborted => "Aborted",
            RunOutcome::Errored => "Errored",
        };
        format!("{}. {} processed.", word, processed)
    }
}

/// Latest-value status channel.
///
/// Observers only ever see the most recent line; intermediate updates may be
/// skipped by a slow reader.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    sender: watch::Sender<String>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(READY.to_string());
        Self { sender }
    }

    pub fn set(&self, line: impl Into<String>) {
        let line = line.into();
        info!(status = %line);
        self.sender.send_replace(line);
    }

    pub fn current(&self) -> String {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_lines() {
        assert_eq!(RunOutcome::Completed.status_line(3), "Done. 3 processed.");
        assert_eq!(RunOutcome::Aborted.status_line(0), "Aborted. 0 processed.");
        assert_eq!(RunOutcome::Errored.status_line(1), "Errored. 1 processed.");
    }

    #[tokio::test]
    async fn observers_see_latest_line() {
        let status = StatusReporter::new();
        let mut observer = status.subscribe();
        assert_eq!(*observer.borrow(), READY);

        status.set("Loading next page...");
        status.set("Unsending... (1)");
        observer.changed().await.unwrap();
        assert_eq!(*observer.borrow_and_update(), "Unsending... (1)");
        assert_eq!(status.current(), "Unsending... (1)");
    }
}
