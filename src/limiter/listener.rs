use std::{fmt, time::Duration};

use tokio::time::Instant;

use super::Outcome;

/// Records the outcome of an admitted job against whatever granted the admission.
///
/// Implemented for any `FnOnce(Outcome, Duration) + Send`, which receives the outcome and the
/// time elapsed since admission.
pub trait Completion: Send {
    /// Record the outcome. Called exactly once.
    fn complete(self: Box<Self>, outcome: Outcome, latency: Duration);
}

impl<F> Completion for F
where
    F: FnOnce(Outcome, Duration) + Send,
{
    fn complete(self: Box<Self>, outcome: Outcome, latency: Duration) {
        (*self)(outcome, latency)
    }
}

/// A one-shot handle for an admitted job, required to report how the job went.
///
/// Exactly one of [on_success](Listener::on_success), [on_ignore](Listener::on_ignore) or
/// [on_dropped](Listener::on_dropped) must be called once the job is finished. Each consumes the
/// listener, so reporting twice does not compile.
///
/// A listener dropped without an outcome is treated as [Outcome::Ignore], so the concurrency it
/// holds is always given back.
#[must_use = "dropping a listener without an outcome ignores the job"]
pub struct Listener {
    completion: Option<Box<dyn Completion>>,
    start: Instant,
}

impl Listener {
    /// Create a listener which calls `completion` with the job's outcome.
    pub fn new(completion: impl Completion + 'static) -> Self {
        Self {
            completion: Some(Box::new(completion)),
            start: Instant::now(),
        }
    }

    /// A listener which isn't tracked by any limiter.
    pub fn unlimited() -> Self {
        Self::new(|_: Outcome, _: Duration| {})
    }

    /// Run `after` once this listener's outcome has been recorded.
    pub fn then<F>(mut self, after: F) -> Self
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        let inner = self.completion.take();
        Self {
            completion: Some(Box::new(move |outcome: Outcome, latency: Duration| {
                if let Some(inner) = inner {
                    inner.complete(outcome, latency);
                }
                after(outcome);
            })),
            start: self.start,
        }
    }

    /// The job succeeded. Its latency may be used to adjust the limit.
    pub fn on_success(self) {
        self.resolve(Outcome::Success)
    }

    /// The job failed for a reason unrelated to overload, or there is nothing useful to learn from
    /// it. The limit is left alone.
    pub fn on_ignore(self) {
        self.resolve(Outcome::Ignore)
    }

    /// The job failed because of overload, e.g. an explicit backpressure signal was observed.
    pub fn on_dropped(self) {
        self.resolve(Outcome::Dropped)
    }

    /// Report the given outcome.
    pub fn resolve(mut self, outcome: Outcome) {
        self.complete(outcome);
    }

    /// Time elapsed since the job was admitted.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn complete(&mut self, outcome: Outcome) {
        if let Some(completion) = self.completion.take() {
            completion.complete(outcome, self.start.elapsed());
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.completion.is_some() {
            tracing::warn!("listener dropped without an outcome, ignoring the job");
            self.complete(Outcome::Ignore);
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("resolved", &self.completion.is_none())
            .field("start", &self.start)
            .finish()
    }
}
