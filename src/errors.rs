use crate::engine::WorkflowStep;
use crate::types::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Timed out after {timeout_ms}ms waiting for {what}")]
    Timeout { what: String, timeout_ms: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Workflow failed at step {step}: {source}")]
    Workflow {
        step: WorkflowStep,
        #[source]
        source: Box<SweepError>,
    },

    #[error("A run is already in progress")]
    Busy,

    #[error("Node {0} is no longer attached to the document")]
    StaleNode(NodeId),

    #[error("Change notification feed closed")]
    FeedClosed,

    #[error("Browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("JavaScript execution failed: {0}")]
    JavaScriptFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SweepError>;

impl SweepError {
    pub fn timeout(what: impl Into<String>, timeout_ms: u64) -> Self {
        SweepError::Timeout {
            what: what.into(),
            timeout_ms,
        }
    }

    /// True for a cancellation, also when it surfaced through a workflow step.
    pub fn is_cancelled(&self) -> bool {
        match self {
            SweepError::Cancelled => true,
            SweepError::Workflow { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Failures confined to a single target: the run skips the target and continues.
    pub fn is_target_local(&self) -> bool {
        match self {
            SweepError::Workflow { source, .. } => !source.is_cancelled(),
            SweepError::Timeout { .. } | SweepError::StaleNode(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_wrapping_keeps_cancellation_visible() {
        let err = SweepError::Workflow {
            step: WorkflowStep::AwaitRemoval,
            source: Box::new(SweepError::Cancelled),
        };
        assert!(err.is_cancelled());
        assert!(!err.is_target_local());
    }

    #[test]
    fn timeouts_are_local_to_the_target() {
        let err = SweepError::Workflow {
            step: WorkflowStep::OpenMenu,
            source: Box::new(SweepError::timeout("menu item", 200)),
        };
        assert!(err.is_target_local());
        assert_eq!(
            err.to_string(),
            "Workflow failed at step OpenMenu: Timed out after 200ms waiting for menu item"
        );
    }

    #[test]
    fn discovery_is_fatal() {
        let err = SweepError::Discovery("messages container".into());
        assert!(!err.is_target_local());
        assert!(!err.is_cancelled());
    }
}
