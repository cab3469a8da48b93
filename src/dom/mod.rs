pub mod locator;
pub mod memory;

pub use locator::Locator;
pub use memory::{Behavior, Interaction, MemoryDocument, NodeSpec};
