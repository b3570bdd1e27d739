//! # cnat
//!
//! Local front end for the [`cnat_reconciler`] crate: task manifests, a
//! process-backed execution-unit runner, and the CLI wiring them together.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod cli;
pub mod manifest;
pub mod runner;
pub mod session;

pub use manifest::{load_manifest, parse_manifest, TaskManifest};
pub use runner::{LocalRunner, RunnerConfig, RunnerStopper};
pub use session::{run_session, summarize, SessionOptions};
