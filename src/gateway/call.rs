use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::{Classifier, LimitedFuture, RequestContext, StatusClassifier};
use crate::{CallError, Limiter};

/// A single remote call, which can be executed once and cloned to be retried.
#[async_trait]
pub trait Call: Send + Sync {
    /// The successful result of the call.
    type Response: Send + 'static;
    /// Why the call failed.
    type Error: Send + 'static;

    /// The request this call will make.
    fn request(&self) -> &RequestContext;

    /// Make the call, waiting for the response.
    async fn execute(&self) -> Result<Self::Response, Self::Error>;

    /// Cancel the call, if possible.
    fn cancel(&self);

    /// Whether [cancel](Call::cancel) has been called.
    fn is_canceled(&self) -> bool;

    /// Whether the call has been executed.
    fn is_executed(&self) -> bool;

    /// A fresh, unexecuted copy of this call, e.g. to retry it.
    fn clone_call(&self) -> Self
    where
        Self: Sized;
}

/// Applies a [Limiter] to a [Call].
///
/// A limited call is itself a [Call], which fails with [CallError::LimitExceeded] without making
/// the request if not admitted. Cancellation and the other call state pass through to the wrapped
/// call, and clones stay limited.
#[derive(Debug)]
pub struct LimitedCall<C, L, K = StatusClassifier> {
    call: Arc<C>,
    limiter: Arc<L>,
    classifier: Arc<K>,
}

impl<C, L> LimitedCall<C, L> {
    /// Limit `call` with a limiter which may be shared with other calls.
    pub fn new(call: C, limiter: Arc<L>) -> Self {
        Self {
            call: Arc::new(call),
            limiter,
            classifier: Arc::new(StatusClassifier::default()),
        }
    }
}

impl<C, L, K> LimitedCall<C, L, K> {
    /// Classify responses with `classifier` instead of by status code.
    pub fn with_classifier<K2>(self, classifier: K2) -> LimitedCall<C, L, K2> {
        LimitedCall {
            call: self.call,
            limiter: self.limiter,
            classifier: Arc::new(classifier),
        }
    }

    /// The wrapped call.
    pub fn inner(&self) -> &C {
        &self.call
    }
}

impl<C, L, K> LimitedCall<C, L, K>
where
    C: Call + 'static,
    L: Limiter<RequestContext> + 'static,
    K: Classifier<C::Response, C::Error> + 'static,
{
    /// Make the call in the background, passing its result to `callback`.
    ///
    /// `callback` is called exactly once, including when the call isn't admitted.
    pub fn enqueue<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<C::Response, CallError<C::Error>>) + Send + 'static,
    {
        let call = self.clone_handle();
        tokio::spawn(async move { callback(call.execute().await) })
    }

    fn clone_handle(&self) -> Self {
        Self {
            call: Arc::clone(&self.call),
            limiter: Arc::clone(&self.limiter),
            classifier: Arc::clone(&self.classifier),
        }
    }
}

#[async_trait]
impl<C, L, K> Call for LimitedCall<C, L, K>
where
    C: Call + 'static,
    L: Limiter<RequestContext> + 'static,
    K: Classifier<C::Response, C::Error> + 'static,
{
    type Response = C::Response;
    type Error = CallError<C::Error>;

    fn request(&self) -> &RequestContext {
        self.call.request()
    }

    async fn execute(&self) -> Result<Self::Response, Self::Error> {
        let ctx = self.call.request();
        let listener = self.limiter.acquire(ctx).await.map_err(|error| {
            tracing::debug!(%error, method = %ctx.method(), uri = %ctx.uri(), "call rejected");
            CallError::LimitExceeded(error)
        })?;

        let classifier = |result: &Result<C::Response, C::Error>| self.classifier.classify(result);
        LimitedFuture::new(self.call.execute(), listener, classifier)
            .await
            .map_err(CallError::Call)
    }

    fn cancel(&self) {
        self.call.cancel();
    }

    fn is_canceled(&self) -> bool {
        self.call.is_canceled()
    }

    fn is_executed(&self) -> bool {
        self.call.is_executed()
    }

    fn clone_call(&self) -> Self {
        Self {
            call: Arc::new(self.call.clone_call()),
            limiter: Arc::clone(&self.limiter),
            classifier: Arc::clone(&self.classifier),
        }
    }
}
