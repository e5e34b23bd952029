use std::{
    sync::Arc,
    task::{Context, Poll},
};

use futures::future::BoxFuture;
use http::{Request, Response, StatusCode};
use tower::{Layer, Service};

use super::{overload_response, Classifier, LimitedFuture, RequestContext, StatusClassifier};
use crate::Limiter;

/// Applies a [Limiter] to outgoing HTTP requests made through a [Service].
///
/// Requests which aren't admitted never reach the inner service. Instead they get a synthesized
/// `503 Service Unavailable` response with an empty body.
///
/// Responses are classified with a [StatusClassifier] unless another [Classifier] is given.
#[derive(Debug)]
pub struct HttpLimitLayer<L, K = StatusClassifier> {
    limiter: Arc<L>,
    classifier: Arc<K>,
}

/// A [Service] which applies a [Limiter] to HTTP requests. See [HttpLimitLayer].
#[derive(Debug)]
pub struct HttpLimit<S, L, K = StatusClassifier> {
    inner: S,
    limiter: Arc<L>,
    classifier: Arc<K>,
}

impl<L> HttpLimitLayer<L> {
    /// Use a limiter owned by this layer.
    pub fn new(limiter: L) -> Self {
        Self::shared(Arc::new(limiter))
    }

    /// Use a limiter which is shared with other gateways.
    pub fn shared(limiter: Arc<L>) -> Self {
        Self {
            limiter,
            classifier: Arc::new(StatusClassifier::default()),
        }
    }
}

impl<L, K> HttpLimitLayer<L, K> {
    /// Classify responses with `classifier`, e.g. to decide which statuses count as success.
    pub fn with_classifier<M>(self, classifier: M) -> HttpLimitLayer<L, M> {
        HttpLimitLayer {
            limiter: self.limiter,
            classifier: Arc::new(classifier),
        }
    }
}

impl<L, K> Clone for HttpLimitLayer<L, K> {
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            classifier: Arc::clone(&self.classifier),
        }
    }
}

impl<S, L, K> Layer<S> for HttpLimitLayer<L, K> {
    type Service = HttpLimit<S, L, K>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpLimit {
            inner,
            limiter: Arc::clone(&self.limiter),
            classifier: Arc::clone(&self.classifier),
        }
    }
}

impl<S: Clone, L, K> Clone for HttpLimit<S, L, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            classifier: Arc::clone(&self.classifier),
        }
    }
}

impl<S, L, K, ReqBody, ResBody> Service<Request<ReqBody>> for HttpLimit<S, L, K>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send,
    L: Limiter<RequestContext> + 'static,
    K: Classifier<Response<ResBody>, S::Error> + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // Take the service which was driven to readiness, leaving a clone in its place.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = Arc::clone(&self.limiter);
        let classifier = Arc::clone(&self.classifier);

        Box::pin(async move {
            let ctx = RequestContext::from_request(&request);
            let listener = match limiter.acquire(&ctx).await {
                Ok(listener) => listener,
                Err(error) => {
                    tracing::debug!(
                        %error,
                        method = %ctx.method(),
                        uri = %ctx.uri(),
                        "client concurrency limit reached"
                    );
                    return Ok(overload_response(StatusCode::SERVICE_UNAVAILABLE));
                }
            };

            let classify =
                move |result: &Result<Response<ResBody>, S::Error>| classifier.classify(result);
            LimitedFuture::new(inner.call(request), listener, classify).await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use http::HeaderName;
    use tower::{service_fn, ServiceExt};

    use super::*;
    use crate::{gateway::testing::Recording, Outcome, PartitionedLimiter};

    fn get(uri: &str) -> Request<()> {
        Request::get(uri).body(()).unwrap()
    }

    async fn upstream(request: Request<()>) -> Result<Response<String>, io::Error> {
        let status = match request.uri().path() {
            "/ok" => StatusCode::OK,
            "/overloaded" => StatusCode::SERVICE_UNAVAILABLE,
            "/missing" => StatusCode::NOT_FOUND,
            _ => return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        };
        Ok(Response::builder()
            .status(status)
            .body(String::from("upstream"))
            .unwrap())
    }

    #[tokio::test]
    async fn classifies_responses() {
        let limiter = Recording::new(1);
        let service = HttpLimitLayer::new(limiter.clone()).layer(service_fn(upstream));

        let response = service.clone().oneshot(get("/overloaded")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.body(), "upstream");

        let response = service.clone().oneshot(get("/ok")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = service.clone().oneshot(get("/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let error = service.clone().oneshot(get("/broken")).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::ConnectionReset);

        assert_eq!(
            limiter.outcomes(),
            vec![
                Outcome::Dropped,
                Outcome::Success,
                Outcome::Ignore,
                Outcome::Ignore
            ]
        );
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn custom_classifier_decides_success() {
        let limiter = Recording::new(1);
        let service = HttpLimitLayer::new(limiter.clone())
            .with_classifier(|result: &Result<Response<String>, io::Error>| match result {
                Ok(response) if response.status() == StatusCode::NOT_FOUND => Outcome::Success,
                Ok(_) => Outcome::Ignore,
                Err(_) => Outcome::Dropped,
            })
            .layer(service_fn(upstream));

        service.clone().oneshot(get("/missing")).await.unwrap();
        service.clone().oneshot(get("/ok")).await.unwrap();
        service.oneshot(get("/broken")).await.unwrap_err();

        assert_eq!(
            limiter.outcomes(),
            vec![Outcome::Success, Outcome::Ignore, Outcome::Dropped]
        );
    }

    #[tokio::test]
    async fn rejected_requests_are_not_sent() {
        let limiter = Recording::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let service = HttpLimitLayer::new(limiter.clone()).layer(service_fn({
            let calls = Arc::clone(&calls);
            move |request| {
                calls.fetch_add(1, Ordering::SeqCst);
                upstream(request)
            }
        }));

        let busy = limiter.try_acquire(&()).unwrap();

        let response = service.clone().oneshot(get("/ok")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.body().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        busy.on_success();
        let response = service.oneshot(get("/ok")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.acquired(), 2);
    }

    #[tokio::test]
    async fn partitions_by_header() {
        let limiter = PartitionedLimiter::<RequestContext>::builder()
            .limit(2)
            .partition("batch", 1.0)
            .partition("live", 1.0)
            .partition_resolver(RequestContext::by_header(HeaderName::from_static(
                "x-priority",
            )))
            .build();
        let service = HttpLimitLayer::new(limiter).layer(service_fn(upstream));

        let request = |priority: &str| {
            Request::get("/ok")
                .header("x-priority", priority)
                .body(())
                .unwrap()
        };

        // Partitions are created by their first request.
        let response = service.clone().oneshot(request("batch")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let _busy = limiter_partition(&service, "batch")
            .try_acquire(&())
            .unwrap();

        let response = service.clone().oneshot(request("batch")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let response = service.clone().oneshot(request("live")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    fn limiter_partition<S>(
        service: &HttpLimit<S, PartitionedLimiter<RequestContext>>,
        name: &str,
    ) -> Arc<crate::DefaultLimiter<crate::limits::Fixed>> {
        service.limiter.partition(name).unwrap()
    }
}
