use std::{
    cmp,
    fmt::Debug,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

pub use blocking::BlockingLimiter;
pub use listener::{Completion, Listener};
pub use partitioning::{Fallback, PartitionedLimiter, PartitionedLimiterBuilder};

use crate::{
    error::AcquireError,
    limits::{LimitAlgorithm, Sample},
};

mod blocking;
mod listener;
mod partitioning;

/// Limits the number of concurrent jobs.
///
/// Acquire a [Listener] to run a job, and report the job's [Outcome] through it once the job is
/// finished.
///
/// `C` is the context describing the job, e.g. the request being made. Limiters may use it to
/// decide which population the job belongs to.
#[async_trait]
pub trait Limiter<C: ?Sized + Sync = ()>: Debug + Send + Sync {
    /// Try to immediately acquire a [Listener].
    ///
    /// Returns `None` if there is no capacity available. Never waits.
    fn try_acquire(&self, ctx: &C) -> Option<Listener>;

    /// Acquire a [Listener], possibly waiting for capacity.
    ///
    /// Unless the limiter is built to wait, this is the same as [try_acquire](Limiter::try_acquire).
    async fn acquire(&self, ctx: &C) -> Result<Listener, AcquireError> {
        self.try_acquire(ctx).ok_or(AcquireError::Rejected)
    }
}

#[async_trait]
impl<C, L> Limiter<C> for Arc<L>
where
    C: ?Sized + Sync,
    L: Limiter<C> + ?Sized,
{
    fn try_acquire(&self, ctx: &C) -> Option<Listener> {
        (**self).try_acquire(ctx)
    }

    async fn acquire(&self, ctx: &C) -> Result<Listener, AcquireError> {
        (**self).acquire(ctx).await
    }
}

/// A basic limiter, with a concurrency limit controlled by a [LimitAlgorithm].
///
/// Cheaply cloneable. Clones share the same limit.
#[derive(Debug)]
pub struct DefaultLimiter<T> {
    inner: Arc<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    limit_algo: T,
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,

    /// Best-effort
    in_flight: AtomicUsize,

    /// Permits which couldn't be removed when the limit went down, because they were in use.
    /// They are removed as jobs finish instead.
    debt: AtomicUsize,
}

/// A snapshot of the state of the [Limiter].
///
/// Not guaranteed to be consistent under high concurrency.
#[derive(Debug, Clone, Copy)]
pub struct LimiterState {
    limit: usize,
    available: usize,
    in_flight: usize,
}

/// How a job went, from the point of view of congestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The job succeeded. Its latency can be used to build confidence in the current limit.
    Success,
    /// The job failed in a way unrelated to overload, or was cancelled. It shouldn't influence the
    /// limit.
    Ignore,
    /// The job failed because of overload, e.g. it got an explicit backpressure signal. The limit
    /// should come down.
    Dropped,
}

impl<T> DefaultLimiter<T>
where
    T: LimitAlgorithm,
{
    /// Create a limiter with a given limit control algorithm.
    pub fn new(limit_algo: T) -> Self {
        let initial_permits = limit_algo.limit();
        assert!(initial_permits >= 1);
        Self {
            inner: Arc::new(Inner {
                limit_algo,
                semaphore: Arc::new(Semaphore::new(initial_permits)),
                limit: AtomicUsize::new(initial_permits),
                in_flight: AtomicUsize::new(0),
                debt: AtomicUsize::new(0),
            }),
        }
    }

    /// The current state of the limiter.
    pub fn state(&self) -> LimiterState {
        LimiterState {
            limit: self.inner.limit(),
            available: self.inner.semaphore.available_permits(),
            in_flight: self.inner.in_flight(),
        }
    }
}

impl<T> Clone for DefaultLimiter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Inner<T>
where
    T: LimitAlgorithm,
{
    fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn release(&self, permit: OwnedSemaphorePermit, outcome: Outcome, latency: Duration) {
        if outcome != Outcome::Ignore {
            let sample = Sample {
                latency,
                in_flight: self.in_flight(),
                outcome,
            };

            let new_limit = self.limit_algo.update(sample);
            self.set_limit(new_limit);
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let repaid = self
            .debt
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |debt| debt.checked_sub(1))
            .is_ok();
        if repaid {
            permit.forget();
        } else {
            drop(permit);
        }
    }

    fn set_limit(&self, new_limit: usize) {
        let old_limit = self.limit.swap(new_limit, Ordering::SeqCst);

        match new_limit.cmp(&old_limit) {
            cmp::Ordering::Greater => {
                let increase = new_limit - old_limit;
                // Cancel out any outstanding debt before adding new permits.
                let debt = self
                    .debt
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |debt| {
                        Some(debt.saturating_sub(increase))
                    })
                    .unwrap_or_default();

                self.semaphore.add_permits(increase - cmp::min(debt, increase));
            }
            cmp::Ordering::Less => {
                let decrease = old_limit - new_limit;

                // Acquiring some permits and throwing them away reduces the available limit.
                let mut removed = 0;
                while removed < decrease {
                    match self.semaphore.try_acquire() {
                        Ok(permit) => {
                            permit.forget();
                            removed += 1;
                        }
                        Err(_) => break,
                    }
                }

                // The rest are in use, so remove them once they're released.
                self.debt.fetch_add(decrease - removed, Ordering::SeqCst);
            }
            cmp::Ordering::Equal => return,
        }

        tracing::debug!(old_limit, new_limit, "concurrency limit changed");
    }
}

#[async_trait]
impl<C, T> Limiter<C> for DefaultLimiter<T>
where
    C: ?Sized + Sync,
    T: LimitAlgorithm + Debug + Send + Sync + 'static,
{
    fn try_acquire(&self, _ctx: &C) -> Option<Listener> {
        match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
                tracing::trace!(limit = self.inner.limit(), "admitted");

                let inner = Arc::clone(&self.inner);
                Some(Listener::new(move |outcome: Outcome, latency: Duration| {
                    inner.release(permit, outcome, latency)
                }))
            }
            Err(TryAcquireError::NoPermits) => {
                tracing::debug!(limit = self.inner.limit(), "rejected: no capacity available");
                None
            }

            Err(TryAcquireError::Closed) => {
                panic!("we own the semaphore, we shouldn't have closed it")
            }
        }
    }
}

impl LimiterState {
    /// The current concurrency limit.
    pub fn limit(&self) -> usize {
        self.limit
    }
    /// The amount of concurrency available to use.
    pub fn available(&self) -> usize {
        self.available
    }
    /// The number of jobs in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use crate::{
        limits::{Fixed, LimitAlgorithm, Sample},
        DefaultLimiter, Limiter, Outcome,
    };

    #[test]
    fn it_works() {
        let limiter = DefaultLimiter::new(Fixed::new(10));

        let listener = limiter.try_acquire(&()).unwrap();
        assert_eq!(limiter.state().in_flight(), 1);

        listener.on_success();

        assert_eq!(limiter.state().limit(), 10);
        assert_eq!(limiter.state().in_flight(), 0);
        assert_eq!(limiter.state().available(), 10);
    }

    #[test]
    fn rejects_at_the_limit() {
        let limiter = DefaultLimiter::new(Fixed::new(2));

        let first = limiter.try_acquire(&()).unwrap();
        let _second = limiter.try_acquire(&()).unwrap();
        assert!(limiter.try_acquire(&()).is_none());

        first.on_ignore();
        assert!(limiter.try_acquire(&()).is_some());
    }

    #[tokio::test]
    async fn acquire_does_not_wait() {
        let limiter = DefaultLimiter::new(Fixed::new(1));

        let _listener = limiter.acquire(&()).await.unwrap();
        assert_eq!(
            limiter.acquire(&()).await.unwrap_err(),
            crate::AcquireError::Rejected
        );
    }

    /// Counts samples, and lets the test pick the next limit.
    #[derive(Debug)]
    struct Scripted {
        limit: AtomicUsize,
        next: AtomicUsize,
        samples: AtomicUsize,
    }

    impl LimitAlgorithm for Arc<Scripted> {
        fn limit(&self) -> usize {
            self.limit.load(Ordering::SeqCst)
        }

        fn update(&self, sample: Sample) -> usize {
            assert_ne!(sample.outcome(), Outcome::Ignore);
            self.samples.fetch_add(1, Ordering::SeqCst);
            let next = self.next.load(Ordering::SeqCst);
            self.limit.store(next, Ordering::SeqCst);
            next
        }
    }

    fn scripted(limit: usize) -> Arc<Scripted> {
        Arc::new(Scripted {
            limit: AtomicUsize::new(limit),
            next: AtomicUsize::new(limit),
            samples: AtomicUsize::new(0),
        })
    }

    #[test]
    fn ignored_jobs_are_not_sampled() {
        let algo = scripted(3);
        let limiter = DefaultLimiter::new(algo.clone());

        limiter.try_acquire(&()).unwrap().on_ignore();
        assert_eq!(algo.samples.load(Ordering::SeqCst), 0);

        limiter.try_acquire(&()).unwrap().on_success();
        limiter.try_acquire(&()).unwrap().on_dropped();
        assert_eq!(algo.samples.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn lowering_the_limit_below_in_flight_takes_effect_as_jobs_finish() {
        let algo = scripted(4);
        let limiter = DefaultLimiter::new(algo.clone());

        let listeners: Vec<_> = (0..4).map(|_| limiter.try_acquire(&()).unwrap()).collect();
        let mut listeners = listeners.into_iter();

        algo.next.store(1, Ordering::SeqCst);
        listeners.next().unwrap().on_dropped();
        assert_eq!(limiter.state().limit(), 1);

        // Three still in flight, against a limit of one.
        assert!(limiter.try_acquire(&()).is_none());
        listeners.next().unwrap().on_ignore();
        listeners.next().unwrap().on_ignore();
        assert!(limiter.try_acquire(&()).is_none());

        listeners.next().unwrap().on_ignore();
        assert_eq!(limiter.state().available(), 1);
        assert!(limiter.try_acquire(&()).is_some());
    }

    #[test]
    fn raising_the_limit_cancels_outstanding_debt() {
        let algo = scripted(3);
        let limiter = DefaultLimiter::new(algo.clone());

        let a = limiter.try_acquire(&()).unwrap();
        let b = limiter.try_acquire(&()).unwrap();
        let _c = limiter.try_acquire(&()).unwrap();

        // 3 -> 1 with everything in flight. Releasing `a` pays off one of the two owed permits.
        algo.next.store(1, Ordering::SeqCst);
        a.on_dropped();
        assert_eq!(limiter.state().available(), 0);

        // 1 -> 3: the remaining debt is cancelled, one new permit is added, and `b` returns its own.
        algo.next.store(3, Ordering::SeqCst);
        b.on_success();
        assert_eq!(limiter.state().limit(), 3);
        assert_eq!(limiter.state().in_flight(), 1);
        assert_eq!(limiter.state().available(), 2);
    }
}
