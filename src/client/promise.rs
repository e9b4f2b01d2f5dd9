use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::config::{RetryConfig, TimeoutConfig};
use crate::error::ClientError;
use crate::middleware::progress::ProgressCallback;
use crate::middleware::redirect::BeforeRedirectHook;
use crate::middleware::Next;
use crate::request::{Body, Request};
use crate::response::decode::DownloadStream;
use crate::response::sse::SseStream;
use crate::response::{ByteStream, Response};

/// A lazily-executed request. Nothing is dispatched until the promise is
/// awaited (or a decoder shortcut is), so it can keep being configured.
/// `cancel()` works before and after dispatch through the request's
/// cancellation handle.
pub struct RequestPromise {
    request: Result<Request, ClientError>,
    pipeline: Next,
    cancel: CancellationToken,
    throw_on_http_error: bool,
}

impl RequestPromise {
    pub(crate) fn new(request: Result<Request, ClientError>, pipeline: Next) -> Self {
        let cancel = match &request {
            Ok(req) => req.cancellation().clone(),
            Err(_) => CancellationToken::new(),
        };
        let throw_on_http_error = match &request {
            Ok(req) => req.throw_on_http_error,
            Err(_) => true,
        };
        Self {
            request,
            pipeline,
            cancel,
            throw_on_http_error,
        }
    }

    fn map(mut self, f: impl FnOnce(Request) -> Request) -> Self {
        self.request = self.request.map(f);
        self
    }

    pub fn header(self, name: HeaderName, value: HeaderValue) -> Self {
        self.map(|r| r.with_header(name, value))
    }

    pub fn body(self, body: impl Into<Body>) -> Self {
        self.map(|r| r.with_body(body))
    }

    /// JSON-serialize `value` as the request body.
    pub fn json_body<T: serde::Serialize>(mut self, value: &T) -> Self {
        self.request = self.request.and_then(|r| r.with_json(value));
        self
    }

    pub fn form(self, pairs: Vec<(String, String)>) -> Self {
        self.map(|r| r.with_body(Body::Form(pairs)))
    }

    pub fn timeout(self, timeout: TimeoutConfig) -> Self {
        self.map(|r| r.with_timeout(timeout))
    }

    pub fn retry(self, retry: RetryConfig) -> Self {
        self.map(|r| r.with_retry(retry))
    }

    pub fn max_response_bytes(self, max: u64) -> Self {
        self.map(|r| r.with_max_response_bytes(max))
    }

    pub fn follow_redirects(self, follow: bool) -> Self {
        self.map(|r| r.with_follow_redirects(follow))
    }

    pub fn max_redirects(self, max: u32) -> Self {
        self.map(|r| r.with_max_redirects(max))
    }

    pub fn before_redirect(self, hook: Arc<BeforeRedirectHook>) -> Self {
        self.map(|r| r.with_before_redirect(hook))
    }

    pub fn throw_on_http_error(mut self, throw: bool) -> Self {
        self.throw_on_http_error = throw;
        self.map(|r| r.with_throw_on_http_error(throw))
    }

    pub fn on_upload_progress(self, cb: Arc<ProgressCallback>) -> Self {
        self.map(|r| r.with_upload_progress(cb))
    }

    pub fn on_download_progress(self, cb: Arc<ProgressCallback>) -> Self {
        self.map(|r| r.with_download_progress(cb))
    }

    pub fn http2_preferred(self, preferred: bool) -> Self {
        self.map(|r| r.with_http2_preferred(preferred))
    }

    /// The cancellation handle; composable with caller-owned tokens.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the request. Before admission this removes it from scheduler
    /// queues; in flight it aborts the dispatch and body.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run the pipeline. HTTP errors materialize here, and only here,
    /// when `throw_on_http_error` is set.
    pub async fn send(self) -> Result<Response, ClientError> {
        let req = self.request?;
        let throw = self.throw_on_http_error;
        let head_budget = req.timeout.request_duration();
        let cancel = req.cancellation().clone();

        let run = self.pipeline.run(req);
        let resp = match head_budget {
            Some(budget) => match tokio::time::timeout(budget, run).await {
                Ok(result) => result?,
                Err(_) => {
                    // Release queued/in-flight resources before reporting.
                    cancel.cancel();
                    return Err(ClientError::Timeout(crate::error::TimeoutCategory::Request));
                }
            },
            None => run.await?,
        };

        if throw && !resp.ok() {
            return Err(ClientError::Http {
                status: resp.status(),
                response: Box::new(resp),
            });
        }
        Ok(resp)
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T, ClientError> {
        self.send().await?.json().await
    }

    pub async fn text(self) -> Result<String, ClientError> {
        self.send().await?.text().await
    }

    pub async fn bytes(self) -> Result<Bytes, ClientError> {
        self.send().await?.bytes().await
    }

    pub async fn sse(self) -> Result<SseStream, ClientError> {
        self.send().await?.sse()
    }

    pub async fn download(self) -> Result<DownloadStream, ClientError> {
        self.send().await?.download()
    }

    /// Raw async byte iteration over the response body.
    pub async fn stream(self) -> Result<ByteStream, ClientError> {
        self.send().await?.raw()
    }
}

impl IntoFuture for RequestPromise {
    type Output = Result<Response, ClientError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.send())
    }
}
