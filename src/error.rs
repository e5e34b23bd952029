/// Why a [Limiter](crate::Limiter) didn't hand out a [Listener](crate::Listener).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    /// There was no capacity available.
    #[error("concurrency limit exceeded")]
    Rejected,

    /// The caller waited for capacity, but none became available in time.
    #[error("timed out waiting for concurrency limit capacity")]
    TimedOut,

    /// The caller gave up waiting for capacity.
    #[error("cancelled while waiting for concurrency limit capacity")]
    Cancelled,
}

/// Errors produced when submitting work to a [LimitedExecutor](crate::gateway::LimitedExecutor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// The concurrency limit didn't admit the work. Nothing was submitted to the pool.
    #[error("concurrency limit exceeded: {0}")]
    LimitExceeded(#[source] AcquireError),

    /// The work was admitted, but the pool refused it.
    #[error("task rejected by the worker pool")]
    PoolRejected,

    /// The pool was interrupted, e.g. shut down, while waiting for a batch to finish.
    #[error("interrupted while waiting for tasks to complete")]
    Interrupted,
}

/// Why a submitted task didn't produce its own result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    /// The task panicked.
    #[error("task panicked")]
    Panicked,

    /// The task was cancelled before it finished, or never ran.
    #[error("task cancelled")]
    Cancelled,
}

/// Errors produced by a [LimitedCall](crate::gateway::LimitedCall).
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// The concurrency limit didn't admit the call. The call was not made.
    #[error("concurrency limit exceeded: {0}")]
    LimitExceeded(#[source] AcquireError),

    /// The call itself failed. The error is passed through untouched.
    #[error(transparent)]
    Call(E),
}

/// Errors produced by a [LimitedPool](crate::gateway::LimitedPool).
#[derive(Debug, thiserror::Error)]
pub enum PoolError<E> {
    /// The concurrency limit didn't admit the acquisition. The pool was not asked.
    #[error("cannot acquire resource: {0}")]
    CannotAcquire(#[source] AcquireError),

    /// The pool itself failed to provide a resource.
    #[error(transparent)]
    Pool(E),
}
