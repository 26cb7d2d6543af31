//! Worker side of the build farm.
//!
//! - [`WorkerClient`]: subscribes to the coordinator and serves dispatched jobs
//! - [`PipelineExecutor`]: runs the configured build command for one job
//! - [`transfer`]: artifact upload and repository download
//!
//! # Job flow
//!
//! 1. The coordinator pushes a dispatch on the subscription stream
//! 2. The worker reports `Processing` and runs the pipeline
//! 3. The pipeline step is reported, outputs are uploaded concurrently
//! 4. The terminal status is reported, which frees the slot on the coordinator

pub mod client;
pub mod executor;
pub mod transfer;

pub use client::{Registration, WorkerClient};
pub use executor::{PipelineExecutor, PipelineOutcome};
