use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;

use crate::error::{ClientError, DecodeKind};
use crate::middleware::progress::{ProgressDirection, ProgressEvent, ProgressTracker};
use crate::response::{ByteStream, Response};
use crate::response::sse::SseStream;

impl Response {
    /// Buffers the whole body.
    pub async fn bytes(&self) -> Result<Bytes, ClientError> {
        let mut stream = self.raw()?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Buffers and decodes the body as UTF-8. A 204/304 (empty) body yields
    /// an empty string.
    pub async fn text(&self) -> Result<String, ClientError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| ClientError::Decode {
            kind: DecodeKind::Text,
            message: e.to_string(),
        })
    }

    /// Buffers and parses the body as JSON. An empty body (204/304 or a
    /// bare 200 with no payload) fails with a json decode error.
    pub async fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        let bytes = self.bytes().await?;
        if bytes.is_empty() {
            return Err(ClientError::Decode {
                kind: DecodeKind::Json,
                message: "empty body".into(),
            });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Lazy Server-Sent Events over the body.
    pub fn sse(&self) -> Result<SseStream, ClientError> {
        Ok(SseStream::new(self.raw()?))
    }

    /// Drains the body, yielding progress events instead of bytes.
    pub fn download(&self) -> Result<DownloadStream, ClientError> {
        let total = self.content_length();
        Ok(DownloadStream {
            inner: self.raw()?,
            tracker: ProgressTracker::new(ProgressDirection::Download, total),
            state: DownloadState::Initial,
        })
    }
}

enum DownloadState {
    Initial,
    Streaming,
    Finishing,
    Done,
}

/// Consumes the response body and yields progress events as bytes arrive.
pub struct DownloadStream {
    inner: ByteStream,
    tracker: ProgressTracker,
    state: DownloadState,
}

impl Stream for DownloadStream {
    type Item = Result<ProgressEvent, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.state {
                DownloadState::Initial => {
                    this.state = DownloadState::Streaming;
                    if let Some(ev) = this.tracker.initial() {
                        return Poll::Ready(Some(Ok(ev)));
                    }
                }
                DownloadState::Streaming => match this.inner.as_mut().poll_next(cx) {
                    Poll::Ready(Some(Ok(chunk))) => {
                        if let Some(ev) = this.tracker.record(chunk.len() as u64) {
                            return Poll::Ready(Some(Ok(ev)));
                        }
                    }
                    Poll::Ready(Some(Err(e))) => {
                        this.state = DownloadState::Done;
                        return Poll::Ready(Some(Err(e)));
                    }
                    Poll::Ready(None) => {
                        this.state = DownloadState::Finishing;
                    }
                    Poll::Pending => return Poll::Pending,
                },
                DownloadState::Finishing => {
                    this.state = DownloadState::Done;
                    if let Some(ev) = this.tracker.finish() {
                        return Poll::Ready(Some(Ok(ev)));
                    }
                }
                DownloadState::Done => return Poll::Ready(None),
            }
        }
    }
}
