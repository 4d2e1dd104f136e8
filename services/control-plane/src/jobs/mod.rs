//! Asynchronous jobs: the handler registry and the runner.
//!
//! Services enqueue jobs; the runner leases them from the store, checks the
//! definition's guards, holds the definition's activity on the target while
//! the handler runs and records the outcome. Retryable failures go back to
//! the queue with exponential backoff until the attempts run out.

mod error;
pub mod guards;
pub mod handlers;
pub mod registry;
pub mod runner;
mod target;

pub use error::{JobError, JobResult};
pub use guards::{Guard, Verdict};
pub use handlers::JobHandler;
pub use registry::{Definition, Registry};
pub use runner::{JobRunner, RunnerConfig};
