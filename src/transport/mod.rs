use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_compression::tokio::bufread::{BrotliDecoder, DeflateDecoder, GzipDecoder};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use http::HeaderValue;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as PoolClient;
use hyper_util::rt::TokioExecutor;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::{ClientError, DecodeKind, TimeoutCategory};
use crate::middleware::progress::{ProgressDirection, ProgressStream};
use crate::request::{Body, Request};
use crate::response::{ByteStream, Response};

/// Outbound request body handed to hyper. Unsync: user-supplied body
/// streams are only required to be `Send`.
pub type OutboundBody = http_body_util::combinators::UnsyncBoxBody<Bytes, ClientError>;

type HttpsConnector = hyper_rustls::HttpsConnector<HttpConnector>;

/// Wire-level dispatch of one request to one response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dispatch(&self, req: Request) -> Result<Response, ClientError>;
}

/// Production transport: pooled hyper client over rustls, transparent
/// response decompression, upload progress, and per-category timeouts.
///
/// Two pooled clients are kept: one that only advertises HTTP/1.1 and one
/// that also offers h2 via ALPN. A request picks the ALPN client when it
/// (or the client default) prefers HTTP/2.
pub struct HyperTransport {
    h1: PoolClient<HttpsConnector, OutboundBody>,
    alpn: PoolClient<HttpsConnector, OutboundBody>,
    http2_preferred: bool,
    decompress: bool,
}

impl HyperTransport {
    pub fn new(agent: &AgentConfig, http2_preferred: bool, decompress: bool) -> Self {
        let connections = agent.connections.resolve();
        // hyper's pool is origin-keyed. Without per-domain pooling the idle
        // budget is kept to a single connection per origin so the pool
        // behaves like one small shared pool instead of N per-domain pools.
        let max_idle = if agent.per_domain_pooling {
            connections
        } else {
            1
        };
        let idle_timeout = Duration::from_secs_f64(agent.idle_timeout);

        let h1_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let alpn_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        let mut h1_builder = PoolClient::builder(TokioExecutor::new());
        h1_builder
            .pool_idle_timeout(idle_timeout)
            .pool_max_idle_per_host(max_idle);
        let mut alpn_builder = PoolClient::builder(TokioExecutor::new());
        alpn_builder
            .pool_idle_timeout(idle_timeout)
            .pool_max_idle_per_host(max_idle);

        Self {
            h1: h1_builder.build(h1_connector),
            alpn: alpn_builder.build(alpn_connector),
            http2_preferred,
            decompress,
        }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn dispatch(&self, req: Request) -> Result<Response, ClientError> {
        let url = req.url().clone();
        let cancel = req.cancellation().clone();
        let timeout = req.timeout.clone();
        let deadline = timeout.request_duration().map(|d| Instant::now() + d);
        let max_response_bytes = req.max_response_bytes;
        let decompress = self.decompress;
        let prefer_h2 = req.http2_preferred || self.http2_preferred;

        let wire = build_wire_request(req)?;

        let client = if prefer_h2 { &self.alpn } else { &self.h1 };
        let fut = client.request(wire);

        // Budget for the response head: response-start when configured,
        // otherwise the connect budget (a pooled connection makes the
        // distinction moot), otherwise whatever remains of the whole-request
        // budget.
        let (head_budget, head_category) = match (
            timeout.response_start_duration(),
            timeout.connect_duration(),
            deadline,
        ) {
            (Some(d), _, _) => (Some(d), TimeoutCategory::ResponseStart),
            (None, Some(d), _) => (Some(d), TimeoutCategory::Connect),
            (None, None, Some(at)) => (
                Some(at.saturating_duration_since(Instant::now())),
                TimeoutCategory::Request,
            ),
            (None, None, None) => (None, TimeoutCategory::Request),
        };

        let result = match head_budget {
            Some(budget) => match tokio::time::timeout(budget, fut).await {
                Ok(r) => r,
                Err(_) => {
                    debug!(url = %url, category = %head_category, "transport: head timeout");
                    return Err(ClientError::Timeout(head_category));
                }
            },
            None => fut.await,
        };

        let resp = result.map_err(map_dispatch_error)?;
        let version = resp.version();
        let (parts, incoming) = resp.into_parts();
        let mut headers = parts.headers;

        let guarded: ByteStream = Box::pin(GuardedBody::new(
            incoming,
            cancel,
            deadline,
            timeout.between_bytes_duration(),
            max_response_bytes,
        ));

        let body: ByteStream = if decompress {
            match content_encoding(&headers) {
                Some(encoding) => {
                    headers.remove(CONTENT_ENCODING);
                    headers.remove(CONTENT_LENGTH);
                    decode_body(guarded, encoding)
                }
                None => guarded,
            }
        } else {
            guarded
        };

        Ok(Response::new(parts.status, headers, url, version, body))
    }
}

/// Turn a `Request` into the `http::Request` hyper dispatches: implied
/// content type, default `Accept-Encoding`, explicit `Content-Length` where
/// the size is known, and the upload-progress wrapper when requested.
fn build_wire_request(req: Request) -> Result<http::Request<OutboundBody>, ClientError> {
    let mut builder = http::Request::builder()
        .method(req.method.clone())
        .uri(req.url.as_str());

    let implied_ct = req.body.implied_content_type();
    let total = req.body.content_length()?;

    {
        let headers = builder.headers_mut().ok_or_else(|| {
            ClientError::Config(format!("unbuildable request for {}", req.url))
        })?;
        for (name, value) in req.headers.iter() {
            headers.append(name.clone(), value.clone());
        }
        if let Some(ct) = implied_ct {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_str(&ct).unwrap_or(HeaderValue::from_static("application/octet-stream")));
            }
        }
        if !headers.contains_key(ACCEPT_ENCODING) {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate, br"));
        }
        if let Some(n) = total {
            if !headers.contains_key(CONTENT_LENGTH) && !matches!(req.body, Body::Empty) {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(n));
            }
        }
    }

    let body: OutboundBody = match (req.on_upload_progress, req.body) {
        (None, Body::Stream(stream)) => {
            let framed = futures_util::StreamExt::map(stream.inner, |r| r.map(Frame::data));
            BodyExt::boxed_unsync(StreamBody::new(framed))
        }
        (None, other) => {
            let bytes = other.to_bytes()?.unwrap_or_default();
            Full::new(bytes)
                .map_err(|never| match never {})
                .boxed_unsync()
        }
        (Some(callback), body) => {
            let inner: ByteStream = match body {
                Body::Stream(stream) => stream.inner,
                other => {
                    let bytes = other.to_bytes()?.unwrap_or_default();
                    if bytes.is_empty() {
                        Box::pin(futures_util::stream::empty())
                    } else {
                        Box::pin(futures_util::stream::once(async move { Ok(bytes) }))
                    }
                }
            };
            let counted =
                ProgressStream::new(inner, ProgressDirection::Upload, total, callback);
            let framed = futures_util::StreamExt::map(counted, |r| r.map(Frame::data));
            BodyExt::boxed_unsync(StreamBody::new(framed))
        }
    };

    builder
        .body(body)
        .map_err(|e| ClientError::Config(format!("unbuildable request: {}", e)))
}

fn content_encoding(headers: &http::HeaderMap) -> Option<&'static str> {
    match headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("gzip") | Some("x-gzip") => Some("gzip"),
        Some("deflate") => Some("deflate"),
        Some("br") => Some("br"),
        _ => None,
    }
}

/// Classify a hyper dispatch failure into the transport error taxonomy by
/// walking the source chain.
fn map_dispatch_error(e: hyper_util::client::legacy::Error) -> ClientError {
    let text = full_error_text(&e);
    let lower = text.to_ascii_lowercase();

    if e.is_connect() {
        if let Some(io) = find_io_error(&e) {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return ClientError::Timeout(TimeoutCategory::Connect);
            }
        }
        if lower.contains("dns") || lower.contains("lookup") || lower.contains("resolve") {
            return ClientError::Dns(text);
        }
        if lower.contains("tls") || lower.contains("certificate") || lower.contains("handshake") {
            return ClientError::Tls(text);
        }
        return ClientError::Connect(text);
    }

    if lower.contains("parse") || lower.contains("invalid") {
        return ClientError::Protocol(text);
    }
    ClientError::Connect(text)
}

fn full_error_text(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        out.push_str(": ");
        out.push_str(&s.to_string());
        source = s.source();
    }
    out
}

fn find_io_error(e: &dyn std::error::Error) -> Option<&std::io::Error> {
    let mut source = e.source();
    while let Some(s) = source {
        if let Some(io) = s.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        source = s.source();
    }
    None
}

/// Response body adapter: hyper frames out, guarded by cancellation, the
/// whole-request deadline, the between-bytes gap budget, and the response
/// size cap.
struct GuardedBody {
    inner: Incoming,
    cancel: Pin<Box<tokio_util::sync::WaitForCancellationFutureOwned>>,
    deadline: Option<Pin<Box<tokio::time::Sleep>>>,
    between_bytes: Option<Duration>,
    gap: Option<Pin<Box<tokio::time::Sleep>>>,
    max_bytes: Option<u64>,
    received: u64,
    done: bool,
}

impl GuardedBody {
    fn new(
        inner: Incoming,
        cancel: CancellationToken,
        deadline: Option<Instant>,
        between_bytes: Option<Duration>,
        max_bytes: Option<u64>,
    ) -> Self {
        Self {
            inner,
            cancel: Box::pin(cancel.cancelled_owned()),
            deadline: deadline.map(|at| Box::pin(tokio::time::sleep_until(at.into()))),
            between_bytes,
            gap: between_bytes.map(|d| Box::pin(tokio::time::sleep(d))),
            max_bytes,
            received: 0,
            done: false,
        }
    }

    fn finish(&mut self, item: Result<Bytes, ClientError>) -> Poll<Option<Result<Bytes, ClientError>>> {
        if item.is_err() {
            self.done = true;
        }
        Poll::Ready(Some(item))
    }
}

impl Stream for GuardedBody {
    type Item = Result<Bytes, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if this.cancel.as_mut().poll(cx).is_ready() {
            return this.finish(Err(ClientError::Cancelled));
        }

        loop {
            match hyper::body::Body::poll_frame(Pin::new(&mut this.inner), cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    let data = match frame.into_data() {
                        Ok(data) => data,
                        // Trailers are not surfaced on the byte stream.
                        Err(_) => continue,
                    };
                    this.received += data.len() as u64;
                    if let Some(max) = this.max_bytes {
                        if this.received > max {
                            return this.finish(Err(ClientError::Protocol(format!(
                                "response body exceeded max_response_bytes ({} > {})",
                                this.received, max
                            ))));
                        }
                    }
                    if let Some(d) = this.between_bytes {
                        this.gap = Some(Box::pin(tokio::time::sleep(d)));
                    }
                    return Poll::Ready(Some(Ok(data)));
                }
                Poll::Ready(Some(Err(e))) => {
                    return this.finish(Err(ClientError::Protocol(e.to_string())));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => {
                    if let Some(deadline) = this.deadline.as_mut() {
                        if deadline.as_mut().poll(cx).is_ready() {
                            return this
                                .finish(Err(ClientError::Timeout(TimeoutCategory::Request)));
                        }
                    }
                    if let Some(gap) = this.gap.as_mut() {
                        if gap.as_mut().poll(cx).is_ready() {
                            return this
                                .finish(Err(ClientError::Timeout(TimeoutCategory::BetweenBytes)));
                        }
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

/// Wrap an encoded byte stream with the matching async-compression decoder,
/// yielding decoded chunks. The stream is bridged through tokio's buffered
/// reader the same way on both directions of the compression boundary.
fn decode_body(encoded: ByteStream, encoding: &'static str) -> ByteStream {
    let reader = tokio_util::io::StreamReader::new(IoChunks(encoded));
    let buffered = tokio::io::BufReader::new(reader);

    match encoding {
        "gzip" => reader_to_stream(GzipDecoder::new(buffered)),
        "deflate" => reader_to_stream(DeflateDecoder::new(buffered)),
        "br" => reader_to_stream(BrotliDecoder::new(buffered)),
        _ => unreachable!(),
    }
}

fn reader_to_stream<R>(reader: R) -> ByteStream
where
    R: tokio::io::AsyncRead + Send + 'static,
{
    let state = (Box::pin(reader), false);
    Box::pin(futures_util::stream::unfold(state, |(mut r, done)| async move {
        if done {
            return None;
        }
        let mut buf = vec![0u8; 8192];
        match r.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), (r, false)))
            }
            Err(e) => {
                // io::Error wrapping a ClientError (cancellation, timeout)
                // unwraps back to it; anything else is a decode failure.
                let err = match e.get_ref().and_then(|inner| {
                    inner.downcast_ref::<ClientError>().map(|c| c.duplicate())
                }) {
                    Some(inner) => inner,
                    None => ClientError::Decode {
                        kind: DecodeKind::Gzip,
                        message: e.to_string(),
                    },
                };
                Some((Err(err), (r, true)))
            }
        }
    }))
}

/// `Stream<Item = Result<Bytes, ClientError>>` → `Stream<Item = io::Result<Bytes>>`
/// bridge for `StreamReader`.
struct IoChunks(ByteStream);

impl Stream for IoChunks {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.0.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                Poll::Ready(Some(Err(std::io::Error::other(e))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    #[test]
    fn test_content_encoding_detection() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_encoding(&headers), None);

        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert_eq!(content_encoding(&headers), Some("gzip"));

        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("BR"));
        assert_eq!(content_encoding(&headers), Some("br"));

        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        assert_eq!(content_encoding(&headers), None);
    }

    #[test]
    fn test_build_wire_request_defaults() {
        let req = crate::request::Request::get(url::Url::parse("https://h.test/a").unwrap());
        let wire = build_wire_request(req).unwrap();
        assert_eq!(
            wire.headers().get(ACCEPT_ENCODING).unwrap(),
            "gzip, deflate, br"
        );
        assert!(wire.headers().get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_build_wire_request_json_content_type() {
        let req = crate::request::Request::new(
            http::Method::POST,
            url::Url::parse("https://h.test/a").unwrap(),
        )
        .with_body(crate::request::Body::Json(serde_json::json!({"a": 1})));
        let wire = build_wire_request(req).unwrap();
        assert_eq!(wire.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(wire.headers().get(CONTENT_LENGTH).unwrap(), "7");
    }

    #[test]
    fn test_accept_encoding_not_overridden() {
        let req = crate::request::Request::get(url::Url::parse("https://h.test/a").unwrap())
            .with_header(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        let wire = build_wire_request(req).unwrap();
        assert_eq!(wire.headers().get(ACCEPT_ENCODING).unwrap(), "identity");
    }
}
