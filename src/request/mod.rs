pub mod body;

use std::sync::Arc;

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{RetryConfig, TimeoutConfig};
use crate::error::ClientError;
use crate::middleware::progress::ProgressCallback;
use crate::middleware::redirect::BeforeRedirectHook;

pub use body::{Body, BodyStream, Part};

/// An immutable request description. Builder methods consume `self` and
/// return a new value; unchanged fields are shared (`Bytes`, `Arc`).
pub struct Request {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Body,
    pub(crate) cancel: CancellationToken,
    pub(crate) throw_on_http_error: bool,
    pub(crate) timeout: TimeoutConfig,
    pub(crate) max_response_bytes: Option<u64>,
    pub(crate) follow_redirects: bool,
    pub(crate) max_redirects: u32,
    pub(crate) retry_override: Option<RetryConfig>,
    pub(crate) before_redirect: Option<Arc<BeforeRedirectHook>>,
    pub(crate) on_upload_progress: Option<Arc<ProgressCallback>>,
    pub(crate) on_download_progress: Option<Arc<ProgressCallback>>,
    pub(crate) http2_preferred: bool,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Body::Empty,
            cancel: CancellationToken::new(),
            throw_on_http_error: true,
            timeout: TimeoutConfig::default(),
            max_response_bytes: None,
            follow_redirects: true,
            max_redirects: 5,
            retry_override: None,
            before_redirect: None,
            on_upload_progress: None,
            on_download_progress: None,
            http2_preferred: false,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The per-domain key used by the scheduler and the cookie/auth layers.
    pub fn domain(&self) -> String {
        self.url.host_str().unwrap_or("").to_ascii_lowercase()
    }

    /// Sets (replaces) a header. Setting the same name/value twice is
    /// indistinguishable from setting it once.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header, preserving existing values of the same name.
    pub fn with_header_append(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn without_header(mut self, name: &HeaderName) -> Self {
        self.headers.remove(name);
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json<T: serde::Serialize>(mut self, value: &T) -> Result<Self, ClientError> {
        self.body = Body::json(value)?;
        Ok(self)
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = url;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_throw_on_http_error(mut self, throw: bool) -> Self {
        self.throw_on_http_error = throw;
        self
    }

    pub fn with_max_response_bytes(mut self, max: u64) -> Self {
        self.max_response_bytes = Some(max);
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn with_max_redirects(mut self, max: u32) -> Self {
        self.max_redirects = max;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry_override = Some(retry);
        self
    }

    pub fn with_before_redirect(mut self, hook: Arc<BeforeRedirectHook>) -> Self {
        self.before_redirect = Some(hook);
        self
    }

    pub fn with_upload_progress(mut self, cb: Arc<ProgressCallback>) -> Self {
        self.on_upload_progress = Some(cb);
        self
    }

    pub fn with_download_progress(mut self, cb: Arc<ProgressCallback>) -> Self {
        self.on_download_progress = Some(cb);
        self
    }

    pub fn with_http2_preferred(mut self, preferred: bool) -> Self {
        self.http2_preferred = preferred;
        self
    }

    /// A full copy for retry/redirect replay. `None` when the body is a
    /// single-pass stream.
    pub fn try_duplicate(&self) -> Option<Request> {
        Some(Request {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone_for_replay()?,
            cancel: self.cancel.clone(),
            throw_on_http_error: self.throw_on_http_error,
            timeout: self.timeout.clone(),
            max_response_bytes: self.max_response_bytes,
            follow_redirects: self.follow_redirects,
            max_redirects: self.max_redirects,
            retry_override: self.retry_override.clone(),
            before_redirect: self.before_redirect.clone(),
            on_upload_progress: self.on_upload_progress.clone(),
            on_download_progress: self.on_download_progress.clone(),
            http2_preferred: self.http2_preferred,
        })
    }

    /// Copy of this request with a different body (used when a redirect
    /// drops or replays the body).
    pub(crate) fn duplicate_with_body(&self, body: Body) -> Request {
        Request {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body,
            cancel: self.cancel.clone(),
            throw_on_http_error: self.throw_on_http_error,
            timeout: self.timeout.clone(),
            max_response_bytes: self.max_response_bytes,
            follow_redirects: self.follow_redirects,
            max_redirects: self.max_redirects,
            retry_override: self.retry_override.clone(),
            before_redirect: self.before_redirect.clone(),
            on_upload_progress: self.on_upload_progress.clone(),
            on_download_progress: self.on_download_progress.clone(),
            http2_preferred: self.http2_preferred,
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers.len())
            .field("body", &self.body)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> Request {
        Request::get(Url::parse("https://api.example.com/v1/items?b=2&a=1").unwrap())
    }

    #[test]
    fn test_with_header_is_idempotent() {
        let name = HeaderName::from_static("x-trace");
        let value = HeaderValue::from_static("abc");
        let once = req().with_header(name.clone(), value.clone());
        let twice = req()
            .with_header(name.clone(), value.clone())
            .with_header(name.clone(), value.clone());
        assert_eq!(
            once.headers().get_all("x-trace").iter().count(),
            twice.headers().get_all("x-trace").iter().count()
        );
    }

    #[test]
    fn test_append_preserves_multi_values() {
        let name = HeaderName::from_static("accept");
        let r = req()
            .with_header_append(name.clone(), HeaderValue::from_static("text/html"))
            .with_header_append(name.clone(), HeaderValue::from_static("application/json"));
        let values: Vec<_> = r.headers().get_all("accept").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_builder_produces_new_value() {
        let base = req();
        let with = base.with_max_redirects(2);
        assert_eq!(with.max_redirects, 2);
    }

    #[test]
    fn test_duplicate_requires_replayable_body() {
        let r = req().with_body("payload");
        assert!(r.try_duplicate().is_some());

        let stream = BodyStream::new(futures_util::stream::empty(), None);
        let r = req().with_body(Body::Stream(stream));
        assert!(r.try_duplicate().is_none());
    }

    #[test]
    fn test_domain_is_lowercased_host() {
        let r = Request::get(Url::parse("https://API.Example.COM:8443/x").unwrap());
        assert_eq!(r.domain(), "api.example.com");
    }
}
