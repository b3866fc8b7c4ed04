//! CLI command implementations

pub mod cache;
pub mod completions;
pub mod config;
pub mod run;
pub mod store;

pub use cache::execute as cache;
pub use completions::execute as completions;
pub use config::execute as config;
pub use run::execute as run;
pub use store::execute as store;
