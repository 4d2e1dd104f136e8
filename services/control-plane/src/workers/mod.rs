//! Background workers besides the job runner.

pub mod gpu;
pub mod status;

pub use gpu::{GpuSyncConfig, GpuSynchronizer};
pub use status::StatusReporter;

/// Names reported by the status heartbeats.
pub const JOB_RUNNER: &str = "jobRunner";
pub const GPU_SYNCHRONIZER: &str = "gpuSynchronizer";
