//! run-isolated - Content-addressed sandbox runner
//!
//! Materializes a sandbox directory from an isolated manifest: every file is
//! fetched once into a shared local cache, hardlinked read-only into the
//! sandbox, and the manifest's command runs there. The sandbox is removed
//! afterwards whatever the outcome.

pub mod audit;
pub mod cache;
pub mod cli;
pub mod config;
pub mod digest;
pub mod error;
pub mod exec;
pub mod manifest;
pub mod orchestrator;
pub mod perms;
pub mod sandbox;
pub mod storage;
pub mod ui;

pub use digest::Digest;
pub use error::{IsolateError, IsolateResult};
