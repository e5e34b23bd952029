use http::{header, request, HeaderMap, HeaderName, Method, Request, Uri};

/// The context of an HTTP-shaped request: its method, URI and headers.
///
/// Used by the [HttpLimit](super::HttpLimit), [LimitedCall](super::LimitedCall) and
/// [RequestFilter](super::RequestFilter) gateways.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
}

impl RequestContext {
    /// Describe a request from its parts.
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
        }
    }

    /// Capture the context of a request.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        Self::new(
            request.method().clone(),
            request.uri().clone(),
            request.headers().clone(),
        )
    }

    /// Capture the context of a request from its parts.
    pub fn from_parts(parts: &request::Parts) -> Self {
        Self::new(parts.method.clone(), parts.uri.clone(), parts.headers.clone())
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The host the request is for, from the URI or else the `Host` header.
    pub fn host(&self) -> Option<&str> {
        self.uri.host().or_else(|| {
            self.header(&header::HOST)
                .map(|host| host.split(':').next().unwrap_or(host))
        })
    }

    /// The value of a header, if present and valid UTF-8.
    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// A partition key resolver which partitions requests by host.
    pub fn by_host() -> impl Fn(&RequestContext) -> Option<String> + Send + Sync + 'static {
        |ctx: &RequestContext| ctx.host().map(str::to_owned)
    }

    /// A partition key resolver which partitions requests by the value of a header.
    pub fn by_header(
        name: HeaderName,
    ) -> impl Fn(&RequestContext) -> Option<String> + Send + Sync + 'static {
        move |ctx: &RequestContext| ctx.header(&name).map(str::to_owned)
    }
}

impl<B> From<&Request<B>> for RequestContext {
    fn from(request: &Request<B>) -> Self {
        Self::from_request(request)
    }
}
