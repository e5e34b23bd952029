use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{Limiter, Listener};
use crate::error::AcquireError;

/// A wrapper which waits for capacity instead of rejecting.
///
/// When the wrapped limiter has no capacity, callers queue up and wait for a job to finish.
/// Waiters are served in the order they arrived, and new callers never jump the queue.
///
/// Only jobs admitted through this wrapper wake waiters up, so the wrapped limiter shouldn't be
/// used directly as well.
#[derive(Debug)]
pub struct BlockingLimiter<L> {
    inner: L,
    timeout: Option<Duration>,
    queue: Arc<Mutex<WaitQueue>>,
}

#[derive(Debug, Default)]
struct WaitQueue {
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
    /// Waiters which have been woken up but haven't retried yet.
    woken: usize,
    next_id: u64,
}

/// Removes a cancelled waiter from the queue, passing on its wake-up if it already had one.
struct Waiter<'q> {
    queue: &'q Mutex<WaitQueue>,
    id: u64,
    armed: bool,
}

impl<L> BlockingLimiter<L> {
    /// Wait for capacity on `inner`, with no timeout.
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            timeout: None,
            queue: Arc::default(),
        }
    }

    /// Give up waiting after `timeout`, failing with [AcquireError::TimedOut].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The wrapped limiter.
    pub fn inner(&self) -> &L {
        &self.inner
    }

    /// The number of callers waiting for capacity.
    pub fn waiting(&self) -> usize {
        lock(&self.queue).waiters.len()
    }

    /// Acquire a [Listener], waiting until capacity is available, the timeout elapses or `cancel`
    /// completes.
    pub async fn acquire_cancellable<C, F>(
        &self,
        ctx: &C,
        cancel: F,
    ) -> Result<Listener, AcquireError>
    where
        C: ?Sized + Sync,
        L: Limiter<C>,
        F: Future<Output = ()> + Send,
    {
        tokio::select! {
            listener = self.acquire(ctx) => listener,
            _ = cancel => {
                tracing::debug!("cancelled while waiting for capacity");
                Err(AcquireError::Cancelled)
            }
        }
    }

    fn wrap(&self, listener: Listener) -> Listener {
        let queue = Arc::clone(&self.queue);
        listener.then(move |_| wake_next(&mut lock(&queue)))
    }

    async fn wait<C>(&self, ctx: &C) -> Listener
    where
        C: ?Sized + Sync,
        L: Limiter<C>,
    {
        let mut woken = false;
        loop {
            let (tx, rx) = oneshot::channel();

            let mut waiter = {
                let mut queue = lock(&self.queue);

                let my_turn = if woken {
                    queue.woken -= 1;
                    true
                } else {
                    queue.waiters.is_empty() && queue.woken == 0
                };

                if my_turn {
                    if let Some(listener) = self.inner.try_acquire(ctx) {
                        drop(queue);
                        return self.wrap(listener);
                    }
                }

                let id = queue.next_id;
                queue.next_id += 1;
                if woken {
                    // Keep our place at the front.
                    queue.waiters.push_front((id, tx));
                } else {
                    queue.waiters.push_back((id, tx));
                }
                tracing::debug!(waiter = id, waiting = queue.waiters.len(), "waiting for capacity");

                Waiter {
                    queue: &self.queue,
                    id,
                    armed: true,
                }
            };

            woken = rx.await.is_ok();
            waiter.armed = false;
        }
    }
}

#[async_trait]
impl<C, L> Limiter<C> for BlockingLimiter<L>
where
    C: ?Sized + Sync,
    L: Limiter<C>,
{
    fn try_acquire(&self, ctx: &C) -> Option<Listener> {
        let queue = lock(&self.queue);
        if !queue.waiters.is_empty() || queue.woken > 0 {
            return None;
        }
        let listener = self.inner.try_acquire(ctx);
        drop(queue);

        listener.map(|listener| self.wrap(listener))
    }

    async fn acquire(&self, ctx: &C) -> Result<Listener, AcquireError> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.wait(ctx))
                .await
                .map_err(|_| {
                    tracing::debug!(?timeout, "timed out waiting for capacity");
                    AcquireError::TimedOut
                }),
            None => Ok(self.wait(ctx).await),
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let mut queue = lock(self.queue);
        if let Some(position) = queue.waiters.iter().position(|(id, _)| *id == self.id) {
            queue.waiters.remove(position);
        } else {
            // We were woken up, but won't use it.
            queue.woken -= 1;
            wake_next(&mut queue);
        }
    }
}

fn wake_next(queue: &mut WaitQueue) {
    while let Some((id, waiter)) = queue.waiters.pop_front() {
        if waiter.send(()).is_ok() {
            queue.woken += 1;
            tracing::debug!(waiter = id, "woke waiter");
            return;
        }
    }
}

fn lock(queue: &Mutex<WaitQueue>) -> MutexGuard<'_, WaitQueue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}
