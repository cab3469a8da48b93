pub mod config;
pub mod document;

pub use config::{BrowserConfig, Config, RunConfig, TimingConfig};
pub use document::{Document, MutationRecord, SharedDocument};
