use std::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};

use http::{Request, Response, StatusCode};
use pin_project_lite::pin_project;

use super::{overload_response, Classifier, RequestContext, StatusClassifier};
use crate::{Limiter, Listener};

pin_project! {
    /// A future which reports its own [Outcome](crate::Outcome) to a [Listener] when it
    /// completes.
    ///
    /// The outcome is reported once, when the future completes, using the classifier. If the
    /// future is dropped before completing, the job is ignored.
    pub struct LimitedFuture<F, K> {
        #[pin]
        inner: F,
        listener: Option<Listener>,
        classifier: K,
    }

    impl<F, K> PinnedDrop for LimitedFuture<F, K> {
        fn drop(this: Pin<&mut Self>) {
            if let Some(listener) = this.project().listener.take() {
                tracing::trace!("limited future dropped before completing");
                listener.on_ignore();
            }
        }
    }
}

impl<F, K> LimitedFuture<F, K> {
    /// Report the outcome of `inner` to `listener`, classified by `classifier`.
    pub fn new(inner: F, listener: Listener, classifier: K) -> Self {
        Self {
            inner,
            listener: Some(listener),
            classifier,
        }
    }
}

impl<F, K, T, E> Future for LimitedFuture<F, K>
where
    F: Future<Output = Result<T, E>>,
    K: Classifier<T, E>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));
        if let Some(listener) = this.listener.take() {
            listener.resolve(this.classifier.classify(&result));
        }
        Poll::Ready(result)
    }
}

/// Applies a [Limiter] to requests handled by a server.
///
/// Requests which aren't admitted get a `429 Too Many Requests` response without reaching the
/// handler. Responses are classified with a [StatusClassifier] unless another [Classifier] is
/// given.
#[derive(Debug)]
pub struct RequestFilter<L, K = StatusClassifier> {
    limiter: L,
    classifier: K,
}

impl<L> RequestFilter<L> {
    /// Filter requests through `limiter`, classifying responses by status.
    pub fn new(limiter: L) -> Self {
        Self {
            limiter,
            classifier: StatusClassifier::default(),
        }
    }
}

impl<L, K> RequestFilter<L, K> {
    /// Classify responses with `classifier`, e.g. to decide which statuses count as success.
    pub fn with_classifier<M>(self, classifier: M) -> RequestFilter<L, M> {
        RequestFilter {
            limiter: self.limiter,
            classifier,
        }
    }

    /// The limiter requests are admitted by.
    pub fn limiter(&self) -> &L {
        &self.limiter
    }

    /// Handle a request with `next`, if admitted.
    pub async fn filter<B, R, E, N, Fut>(
        &self,
        request: Request<B>,
        next: N,
    ) -> Result<Response<R>, E>
    where
        L: Limiter<RequestContext>,
        K: Classifier<Response<R>, E>,
        N: FnOnce(Request<B>) -> Fut,
        Fut: Future<Output = Result<Response<R>, E>>,
        R: Default,
    {
        let ctx = RequestContext::from_request(&request);
        match self.limiter.acquire(&ctx).await {
            Ok(listener) => {
                let classify = |result: &Result<Response<R>, E>| self.classifier.classify(result);
                LimitedFuture::new(next(request), listener, classify).await
            }
            Err(error) => {
                tracing::debug!(%error, method = %ctx.method(), uri = %ctx.uri(), "request rejected");
                Ok(overload_response(StatusCode::TOO_MANY_REQUESTS))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::pending,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use tokio_test::{assert_pending, assert_ready_eq, task};

    use super::*;
    use crate::{gateway::testing::Recording, Outcome};

    fn succeeds_if_ok(result: &Result<u8, u8>) -> Outcome {
        if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Ignore
        }
    }

    #[test]
    fn resolves_once_on_completion() {
        let limiter = Recording::new(1);
        let listener = limiter.try_acquire(&()).unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<u8>();
        let mut future = task::spawn(LimitedFuture::new(
            async move { rx.await.map_err(|_| 0) },
            listener,
            succeeds_if_ok,
        ));

        assert_pending!(future.poll());
        assert!(limiter.outcomes().is_empty());

        tx.send(7).unwrap();
        assert!(future.is_woken());
        assert_ready_eq!(future.poll(), Ok(7));
        drop(future);

        assert_eq!(limiter.outcomes(), vec![Outcome::Success]);
    }

    #[test]
    fn ignores_when_dropped_early() {
        let limiter = Recording::new(1);
        let listener = limiter.try_acquire(&()).unwrap();

        let mut future = task::spawn(LimitedFuture::new(
            pending::<Result<u8, u8>>(),
            listener,
            succeeds_if_ok,
        ));
        assert_pending!(future.poll());
        drop(future);

        assert_eq!(limiter.outcomes(), vec![Outcome::Ignore]);
        assert_eq!(limiter.in_flight(), 0);
    }

    fn request() -> Request<()> {
        Request::get("/things").body(()).unwrap()
    }

    async fn respond(status: u16) -> Result<Response<String>, ()> {
        Ok(Response::builder()
            .status(status)
            .body(String::from("hi"))
            .unwrap())
    }

    #[tokio::test]
    async fn classifies_handler_responses() {
        let limiter = Recording::new(1);
        let filter = RequestFilter::new(limiter.clone());

        let ok = filter.filter(request(), |_| respond(200)).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let unavailable = filter.filter(request(), |_| respond(503)).await.unwrap();
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        filter
            .filter(request(), |_| async { Err::<Response<String>, _>(()) })
            .await
            .unwrap_err();

        assert_eq!(
            limiter.outcomes(),
            vec![Outcome::Success, Outcome::Dropped, Outcome::Ignore]
        );
    }

    #[tokio::test]
    async fn custom_classifier_decides_success() {
        let limiter = Recording::new(1);
        let filter = RequestFilter::new(limiter.clone()).with_classifier(
            |result: &Result<Response<String>, ()>| match result {
                Ok(response) if response.status().is_redirection() => Outcome::Success,
                Ok(response) if response.status().is_server_error() => Outcome::Dropped,
                _ => Outcome::Ignore,
            },
        );

        filter.filter(request(), |_| respond(302)).await.unwrap();
        filter.filter(request(), |_| respond(200)).await.unwrap();
        filter.filter(request(), |_| respond(500)).await.unwrap();

        assert_eq!(
            limiter.outcomes(),
            vec![Outcome::Success, Outcome::Ignore, Outcome::Dropped]
        );
    }

    #[tokio::test]
    async fn rejects_with_too_many_requests() {
        let limiter = Recording::new(1);
        let filter = RequestFilter::new(limiter.clone());
        let _busy = limiter.try_acquire(&()).unwrap();

        let calls = AtomicUsize::new(0);
        let response = filter
            .filter(request(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                respond(200)
            })
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.body().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
