pub mod decode;
pub mod sse;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::Stream;
use http::{HeaderMap, StatusCode, Version};
use url::Url;

use crate::error::ClientError;

/// The lazy response body: chunks arrive as the peer sends them.
pub type ByteStream = BoxStream<'static, Result<Bytes, ClientError>>;

enum BodyState {
    Pending(ByteStream),
    Consumed,
}

/// An HTTP response with a single-consumer lazy body. Decode surfaces
/// (`bytes`, `text`, `json`, `sse`, `download`, `raw`) each consume the body;
/// a second consumption attempt fails with `BodyAlreadyConsumed` unless
/// `try_clone` was called before the first read.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
    version: Version,
    body: Mutex<BodyState>,
}

impl Response {
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        url: Url,
        version: Version,
        body: ByteStream,
    ) -> Self {
        Self {
            status,
            headers,
            url,
            version,
            body: Mutex::new(BodyState::Pending(body)),
        }
    }

    /// A response whose body is fully buffered (cache hits, dedup joiners).
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, url: Url, bytes: Bytes) -> Self {
        let stream: ByteStream = if bytes.is_empty() {
            Box::pin(futures_util::stream::empty())
        } else {
            Box::pin(futures_util::stream::once(async move { Ok(bytes) }))
        };
        Self::new(status, headers, url, Version::HTTP_11, stream)
    }

    /// Headless placeholder used when an error must be duplicated but the
    /// live body cannot be shared.
    pub(crate) fn synthetic(status: StatusCode, url: Url) -> Self {
        Self::from_bytes(status, HeaderMap::new(), url, Bytes::new())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }

    /// `true` for 200..=299.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Final URL after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Declared body length, when the peer sent one.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    pub fn body_used(&self) -> bool {
        matches!(*self.body.lock().unwrap(), BodyState::Consumed)
    }

    /// Takes the underlying byte stream. This is the single consumption
    /// point every decode surface goes through.
    pub fn raw(&self) -> Result<ByteStream, ClientError> {
        let mut guard = self.body.lock().unwrap();
        match std::mem::replace(&mut *guard, BodyState::Consumed) {
            BodyState::Pending(stream) => Ok(stream),
            BodyState::Consumed => Err(ClientError::BodyAlreadyConsumed),
        }
    }

    /// Splits the body into two independently consumable responses. Legal
    /// only before any read; chunks one side has read ahead of the other are
    /// buffered in memory.
    pub fn try_clone(&self) -> Result<Response, ClientError> {
        let mut guard = self.body.lock().unwrap();
        let stream = match std::mem::replace(&mut *guard, BodyState::Consumed) {
            BodyState::Pending(stream) => stream,
            BodyState::Consumed => return Err(ClientError::BodyAlreadyConsumed),
        };
        let (mine, theirs) = tee(stream);
        *guard = BodyState::Pending(Box::pin(mine));
        drop(guard);

        Ok(Response {
            status: self.status,
            headers: self.headers.clone(),
            url: self.url.clone(),
            version: self.version,
            body: Mutex::new(BodyState::Pending(Box::pin(theirs))),
        })
    }

    /// Replace the body stream, keeping the head (used by middleware that
    /// wraps the body, e.g. progress accounting).
    pub(crate) fn map_body<F>(self, f: F) -> Response
    where
        F: FnOnce(ByteStream) -> ByteStream,
    {
        let state = std::mem::replace(&mut *self.body.lock().unwrap(), BodyState::Consumed);
        let body = match state {
            BodyState::Pending(stream) => BodyState::Pending(f(stream)),
            BodyState::Consumed => BodyState::Consumed,
        };
        Response {
            status: self.status,
            headers: self.headers,
            url: self.url,
            version: self.version,
            body: Mutex::new(body),
        }
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers.len())
            .field("body_used", &self.body_used())
            .finish()
    }
}

/// Two-way tee over a byte stream. Whichever side polls first drives the
/// source; chunks are mirrored into the other side's queue. A dropped side
/// wakes the survivor so it takes over driving.
fn tee(source: ByteStream) -> (TeeStream, TeeStream) {
    let shared = Arc::new(TeeShared {
        inner: Mutex::new(TeeInner {
            source: Some(source),
            queues: [VecDeque::new(), VecDeque::new()],
            error: None,
            error_delivered: [false, false],
            done: false,
            wakers: [None, None],
            dropped: [false, false],
        }),
    });
    (
        TeeStream {
            shared: shared.clone(),
            idx: 0,
        },
        TeeStream { shared, idx: 1 },
    )
}

struct TeeShared {
    inner: Mutex<TeeInner>,
}

struct TeeInner {
    source: Option<ByteStream>,
    queues: [VecDeque<Bytes>; 2],
    error: Option<ClientError>,
    error_delivered: [bool; 2],
    done: bool,
    wakers: [Option<Waker>; 2],
    dropped: [bool; 2],
}

struct TeeStream {
    shared: Arc<TeeShared>,
    idx: usize,
}

impl Stream for TeeStream {
    type Item = Result<Bytes, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let idx = self.idx;
        let other = 1 - idx;
        let mut inner = self.shared.inner.lock().unwrap();

        if let Some(chunk) = inner.queues[idx].pop_front() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        if inner.error.is_some() {
            if !inner.error_delivered[idx] {
                inner.error_delivered[idx] = true;
                let err = inner.error.as_ref().unwrap().duplicate();
                return Poll::Ready(Some(Err(err)));
            }
            return Poll::Ready(None);
        }
        if inner.done {
            return Poll::Ready(None);
        }

        let source = match inner.source.as_mut() {
            Some(s) => s,
            None => return Poll::Ready(None),
        };
        match source.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !inner.dropped[other] {
                    inner.queues[other].push_back(chunk.clone());
                    if let Some(w) = inner.wakers[other].take() {
                        w.wake();
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                inner.error_delivered[idx] = true;
                let mine = e.duplicate();
                inner.error = Some(e);
                inner.source = None;
                if let Some(w) = inner.wakers[other].take() {
                    w.wake();
                }
                Poll::Ready(Some(Err(mine)))
            }
            Poll::Ready(None) => {
                inner.done = true;
                inner.source = None;
                if let Some(w) = inner.wakers[other].take() {
                    w.wake();
                }
                Poll::Ready(None)
            }
            Poll::Pending => {
                inner.wakers[idx] = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for TeeStream {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.dropped[self.idx] = true;
        inner.queues[self.idx].clear();
        // The survivor may be parked waiting for this side to drive the
        // source; hand it the wheel.
        if let Some(w) = inner.wakers[1 - self.idx].take() {
            w.wake();
        }
    }
}
