use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

use crate::error::ClientError;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::{ByteStream, Response};

/// Emit at most one event per this many bytes...
const EMIT_BYTES: u64 = 64 * 1024;
/// ...or per this much elapsed time, whichever comes first.
const EMIT_INTERVAL_MS: u128 = 100;

/// EWMA smoothing factor for the transfer rate.
const RATE_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Bytes transferred so far.
    pub loaded: u64,
    pub total: Option<u64>,
    /// 0..=100 when `total` is known.
    pub percent: Option<f64>,
    /// Smoothed bytes/second.
    pub rate: f64,
    /// Estimated seconds remaining, when `total` is known and rate > 0.
    pub estimated: Option<f64>,
    pub direction: ProgressDirection,
}

pub type ProgressCallback = dyn Fn(ProgressEvent) + Send + Sync;

/// Byte counter with emission cadence and EWMA rate smoothing. Shared by
/// the upload wrapper, the download wrapper, and `Response::download()`.
pub struct ProgressTracker {
    direction: ProgressDirection,
    total: Option<u64>,
    loaded: u64,
    rate: f64,
    last_sample: Instant,
    last_emit: Instant,
    last_emit_loaded: u64,
    emitted_initial: bool,
    emitted_final: bool,
}

impl ProgressTracker {
    pub fn new(direction: ProgressDirection, total: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            direction,
            total,
            loaded: 0,
            rate: 0.0,
            last_sample: now,
            last_emit: now,
            last_emit_loaded: 0,
            emitted_initial: false,
            emitted_final: false,
        }
    }

    fn event(&self) -> ProgressEvent {
        let percent = self.total.map(|t| {
            if t == 0 {
                100.0
            } else {
                (self.loaded as f64 / t as f64) * 100.0
            }
        });
        let estimated = match (self.total, self.rate > 1e-9) {
            (Some(t), true) if t >= self.loaded => Some((t - self.loaded) as f64 / self.rate),
            _ => None,
        };
        ProgressEvent {
            loaded: self.loaded,
            total: self.total,
            percent,
            rate: self.rate,
            estimated,
            direction: self.direction,
        }
    }

    /// The initial 0% event. Skipped for known-empty transfers, which emit
    /// only the single final event.
    pub fn initial(&mut self) -> Option<ProgressEvent> {
        if self.emitted_initial || self.total == Some(0) {
            return None;
        }
        self.emitted_initial = true;
        Some(self.event())
    }

    /// Account `n` transferred bytes; returns an event when the cadence
    /// allows one. Emission at exactly `total` is left to `finish` so the
    /// 100% event fires exactly once.
    pub fn record(&mut self, n: u64) -> Option<ProgressEvent> {
        self.loaded += n;

        let now = Instant::now();
        let dt = now.duration_since(self.last_sample).as_secs_f64();
        if dt > 1e-6 {
            let instant_rate = n as f64 / dt;
            self.rate = if self.rate == 0.0 {
                instant_rate
            } else {
                RATE_ALPHA * instant_rate + (1.0 - RATE_ALPHA) * self.rate
            };
            self.last_sample = now;
        }

        if self.total == Some(self.loaded) {
            return None;
        }
        let bytes_due = self.loaded - self.last_emit_loaded >= EMIT_BYTES;
        let time_due = now.duration_since(self.last_emit).as_millis() >= EMIT_INTERVAL_MS;
        if bytes_due || time_due {
            self.last_emit = now;
            self.last_emit_loaded = self.loaded;
            Some(self.event())
        } else {
            None
        }
    }

    /// The final event, exactly once.
    pub fn finish(&mut self) -> Option<ProgressEvent> {
        if self.emitted_final {
            return None;
        }
        self.emitted_final = true;
        if self.total.is_none() {
            self.total = Some(self.loaded);
        }
        Some(self.event())
    }

    pub fn loaded(&self) -> u64 {
        self.loaded
    }
}

/// Wraps a byte stream with progress accounting, invoking the callback per
/// the cadence rules. Errors pass through untouched.
pub struct ProgressStream {
    inner: ByteStream,
    tracker: ProgressTracker,
    callback: Arc<ProgressCallback>,
    done: bool,
}

impl ProgressStream {
    pub fn new(
        inner: ByteStream,
        direction: ProgressDirection,
        total: Option<u64>,
        callback: Arc<ProgressCallback>,
    ) -> Self {
        Self {
            inner,
            tracker: ProgressTracker::new(direction, total),
            callback,
            done: false,
        }
    }
}

impl Stream for ProgressStream {
    type Item = Result<Bytes, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(ev) = this.tracker.initial() {
            (this.callback)(ev);
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(ev) = this.tracker.record(chunk.len() as u64) {
                    (this.callback)(ev);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.done = true;
                if let Some(ev) = this.tracker.finish() {
                    (this.callback)(ev);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Download-side progress middleware: wraps the response body when the
/// request carries an `on_download_progress` callback. Upload accounting
/// happens in the transport, where the request body is turned into wire
/// bytes.
pub struct ProgressMiddleware;

#[async_trait]
impl Middleware for ProgressMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, ClientError> {
        let download = req.on_download_progress.clone();
        let resp = next.run(req).await?;
        match download {
            Some(cb) => {
                let total = resp.content_length();
                Ok(resp.map_body(|body| {
                    Box::pin(ProgressStream::new(
                        body,
                        ProgressDirection::Download,
                        total,
                        cb,
                    ))
                }))
            }
            None => Ok(resp),
        }
    }
}
