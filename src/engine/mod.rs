//! The run engine: waits, the per-target workflow, pagination and the
//! start/stop surface tying them together.

pub mod controller;
pub mod pagination;
pub mod session;
pub mod status;
pub mod subscriptions;
pub mod targets;
pub mod wait;
pub mod workflow;

pub use controller::Controller;
pub use pagination::{Advance, Paginator};
pub use session::{RunReport, RunSession};
pub use status::{RunOutcome, StatusReporter};
pub use subscriptions::{Subscription, SubscriptionRegistry};
pub use targets::TargetFinder;
pub use wait::{Appears, AppearsAnew, Probe, Removed, Vanishes, Waiter};
pub use workflow::{Sequencer, WorkflowStep};
