//! Gateways which apply a [Limiter](crate::Limiter) to different kinds of work.
//!
//! Each gateway follows the same steps:
//!
//! 1. Describe the work with a context, e.g. the request being made.
//! 2. Acquire a [Listener](crate::Listener) from the limiter.
//! 3. If rejected, signal overload the way the transport normally would, without doing the work.
//! 4. Otherwise do the work, classify its result as an [Outcome](crate::Outcome), and hand the
//!    result back unchanged.

mod call;
mod classify;
mod client;
mod context;
mod executor;
mod filter;
mod pool;

pub use call::{Call, LimitedCall};
pub use classify::{Classifier, HasStatus, StatusClassifier};
pub use client::{HttpLimit, HttpLimitLayer};
pub use context::RequestContext;
pub use executor::{Executor, Job, LimitedExecutor, TaskContext, TaskHandle, WorkerPool};
pub use filter::{LimitedFuture, RequestFilter};
pub use pool::{LimitedPool, PoolContext, ResourcePool};

/// A response standing in for one the server never sent.
fn overload_response<B: Default>(status: http::StatusCode) -> http::Response<B> {
    let mut response = http::Response::new(B::default());
    *response.status_mut() = status;
    response
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use async_trait::async_trait;

    use crate::{limits::Fixed, DefaultLimiter, Limiter, Listener, Outcome};

    /// Records the outcome of every listener it hands out.
    #[derive(Debug, Clone)]
    pub(crate) struct Recording {
        limiter: DefaultLimiter<Fixed>,
        acquired: Arc<AtomicUsize>,
        outcomes: Arc<Mutex<Vec<Outcome>>>,
    }

    impl Recording {
        pub(crate) fn new(limit: usize) -> Self {
            Self {
                limiter: DefaultLimiter::new(Fixed::new(limit)),
                acquired: Arc::default(),
                outcomes: Arc::default(),
            }
        }

        pub(crate) fn acquired(&self) -> usize {
            self.acquired.load(Ordering::SeqCst)
        }

        pub(crate) fn outcomes(&self) -> Vec<Outcome> {
            self.outcomes.lock().unwrap().clone()
        }

        pub(crate) fn in_flight(&self) -> usize {
            self.limiter.state().in_flight()
        }
    }

    #[async_trait]
    impl<C: ?Sized + Sync> Limiter<C> for Recording {
        fn try_acquire(&self, ctx: &C) -> Option<Listener> {
            let listener = self.limiter.try_acquire(ctx)?;
            self.acquired.fetch_add(1, Ordering::SeqCst);

            let outcomes = Arc::clone(&self.outcomes);
            Some(listener.then(move |outcome| outcomes.lock().unwrap().push(outcome)))
        }
    }
}
