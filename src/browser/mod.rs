pub mod chrome;
pub mod mutation_feed;
mod scripts;

pub use chrome::ChromeDocument;
pub use mutation_feed::MutationFeed;
