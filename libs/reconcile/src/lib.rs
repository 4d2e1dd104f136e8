//! Subsystem reconciliation primitives.
//!
//! This library provides the operators that converge an external subsystem
//! (container orchestrator, image registry, hypervisor, CI) to the desired
//! state of a managed resource. Three views of every subsystem object meet
//! here:
//!
//! - **Generated**: what a generator says should exist.
//! - **Stored**: the last public object written back into the resource record.
//! - **Live**: what the subsystem reports right now.
//!
//! The operators ([`SsCreator`], [`SsUpdater`], [`SsDeleter`],
//! [`SsRepairer`]) talk to the subsystem through [`ObjectOps`] and persist
//! their result through a [`WriteBack`].
//!
//! # Invariants
//!
//! - Every operator writes back exactly what the subsystem returned
//! - A deleter treats "not found" as success
//! - Repairing an already converged object performs no subsystem writes
//! - Comparisons ignore time fields and treat empty containers as absent

mod normalize;
mod operators;
mod ops;

use std::time::Duration;

pub use normalize::{canonical_json, equivalent, normalize, SpecHash};
pub use operators::{RepairOutcome, SsCreator, SsDeleter, SsRepairer, SsUpdater};
pub use ops::{Discard, ObjectOps, Public, Retained, WriteBack};

/// Default number of attempts a job gets before it is terminated.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay of the retry schedule.
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(30);

/// Delay before the next attempt after `attempts` failed attempts.
///
/// The schedule doubles from [`RETRY_BASE_DELAY`]: 30 s, 60 s, 120 s, ...
pub fn retry_backoff(attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    RETRY_BASE_DELAY.saturating_mul(1u32 << exponent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 30)]
    #[case(1, 30)]
    #[case(2, 60)]
    #[case(3, 120)]
    #[case(5, 480)]
    fn test_retry_backoff(#[case] attempts: u32, #[case] secs: u64) {
        assert_eq!(retry_backoff(attempts), Duration::from_secs(secs));
    }

    #[test]
    fn test_retry_backoff_saturates() {
        assert!(retry_backoff(u32::MAX) >= retry_backoff(16));
    }
}
