//! Concurrency limits for admitting work, with gateways for common kinds of work.
//!
//! A [Limiter] decides whether a job may start. Each admitted job gets a [Listener], which must be
//! told how the job went so the limit can adapt. [PartitionedLimiter] splits capacity between
//! populations of jobs, and [BlockingLimiter] makes callers wait for capacity instead of rejecting
//! them.
//!
//! The [gateway] module applies limiters to worker pools, HTTP clients and servers, remote calls
//! and resource pools.

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

mod error;
pub mod gateway;
mod limiter;
pub mod limits;

pub use error::{AcquireError, CallError, ExecutorError, JoinError, PoolError};
pub use limiter::{
    BlockingLimiter, Completion, DefaultLimiter, Fallback, Limiter, LimiterState, Listener,
    Outcome, PartitionedLimiter, PartitionedLimiterBuilder,
};
