//! Algorithms for controlling concurrency limits.
//!
//! The [Limiter](crate::Limiter) implementations never decide the size of the concurrency limit
//! themselves. They delegate that decision to a [LimitAlgorithm], which is fed a [Sample] for every
//! job that finishes with an outcome other than [Outcome::Ignore].

mod aimd;
mod fixed;

use std::time::Duration;

use crate::Outcome;

pub use aimd::Aimd;
pub use fixed::Fixed;

/// An algorithm for controlling a concurrency limit.
///
/// Implementations are called concurrently from every completing job, so `update` must be cheap
/// and must not block.
pub trait LimitAlgorithm {
    /// The current limit.
    fn limit(&self) -> usize;

    /// Update the concurrency limit in response to a new job completion.
    ///
    /// Returns the new limit.
    fn update(&self, sample: Sample) -> usize;
}

/// The result of a job, including the [Outcome] (loss) and latency (delay).
///
/// Samples are never produced for [Outcome::Ignore].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub(crate) latency: Duration,
    /// Jobs in flight when the sample was taken, including the job being sampled.
    pub(crate) in_flight: usize,
    pub(crate) outcome: Outcome,
}

impl Sample {
    /// How long the job took, from admission to outcome.
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Jobs in flight when the sample was taken.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// The outcome of the job.
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }
}
