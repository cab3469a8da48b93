#[cfg(feature = "chrome")]
pub mod browser;
pub mod core;
pub mod dom;
pub mod engine;
pub mod errors;
pub mod layout;
pub mod testing;
pub mod types;

#[cfg(feature = "chrome")]
pub use browser::ChromeDocument;
pub use crate::core::{Config, Document, MutationRecord, SharedDocument};
pub use dom::{Locator, MemoryDocument};
pub use engine::{Controller, RunOutcome, RunReport};
pub use errors::{Result, SweepError};
pub use layout::{Layout, LayoutRegistry};
pub use types::*;
