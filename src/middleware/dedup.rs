use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::watch;
use tracing::debug;
use url::Url;

use crate::error::ClientError;
use crate::fingerprint::fingerprint;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

/// A completed response in shareable form. `Bytes` clones are zero-copy, so
/// every joiner materializes an independent stream over the same buffer.
#[derive(Clone)]
struct SharedResponse {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
    body: Bytes,
}

type Published = Option<Result<SharedResponse, Arc<ClientError>>>;

/// Coalesces concurrent idempotent requests with the same fingerprint into
/// one dispatch. The first arrival (leader) runs the suffix and publishes
/// the buffered outcome; joiners wait on the channel and receive their own
/// copy. A leader that vanishes without publishing (cancelled mid-flight)
/// closes the channel, and one joiner promotes itself.
pub struct DedupMiddleware {
    inflight: Arc<DashMap<String, watch::Receiver<Published>>>,
}

impl DedupMiddleware {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
        }
    }
}

impl Default for DedupMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the in-flight entry when the leader is done with it, including
/// the cancellation path.
struct EntryGuard {
    inflight: Arc<DashMap<String, watch::Receiver<Published>>>,
    key: String,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
    }
}

#[async_trait]
impl Middleware for DedupMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, ClientError> {
        if !matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
            return next.run(req).await;
        }
        let key = match fingerprint(&req) {
            Some(fp) => fp,
            None => return next.run(req).await,
        };

        loop {
            let tx = {
                match self.inflight.entry(key.clone()) {
                    dashmap::mapref::entry::Entry::Occupied(entry) => {
                        let rx = entry.get().clone();
                        drop(entry);
                        match join(rx, req.cancellation().clone()).await? {
                            Some(resp) => {
                                metrics::counter!("courier_dedup_joins_total").increment(1);
                                debug!(url = %req.url(), "dedup: joined in-flight request");
                                return Ok(resp);
                            }
                            // Leader vanished without publishing; contend
                            // for leadership.
                            None => continue,
                        }
                    }
                    dashmap::mapref::entry::Entry::Vacant(entry) => {
                        let (tx, rx) = watch::channel(None);
                        entry.insert(rx);
                        tx
                    }
                }
            };

            let _guard = EntryGuard {
                inflight: self.inflight.clone(),
                key: key.clone(),
            };

            let outcome = run_and_buffer(next, req).await;
            return match outcome {
                Ok(shared) => {
                    let resp = materialize(&shared);
                    let _ = tx.send(Some(Ok(shared)));
                    Ok(resp)
                }
                Err(e) => {
                    match e {
                        // Leader cancellation is personal, not shared: drop
                        // the channel so a joiner re-runs the request.
                        ClientError::Cancelled | ClientError::ScheduleCancelled => Err(e),
                        other => {
                            let shared = Arc::new(other);
                            let _ = tx.send(Some(Err(shared.clone())));
                            Err(shared.duplicate())
                        }
                    }
                }
            };
        }
    }
}

/// Wait for the leader's outcome. `Ok(None)` means the channel closed with
/// nothing published.
async fn join(
    mut rx: watch::Receiver<Published>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<Option<Response>, ClientError> {
    loop {
        {
            let current = rx.borrow();
            match &*current {
                Some(Ok(shared)) => return Ok(Some(materialize(shared))),
                Some(Err(e)) => return Err(e.duplicate()),
                None => {}
            }
        }
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    // Sender dropped without publishing.
                    let current = rx.borrow();
                    match &*current {
                        Some(Ok(shared)) => return Ok(Some(materialize(shared))),
                        Some(Err(e)) => return Err(e.duplicate()),
                        None => return Ok(None),
                    }
                }
            }
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
        }
    }
}

/// Run the suffix and buffer the full response for sharing.
async fn run_and_buffer(next: Next, req: Request) -> Result<SharedResponse, ClientError> {
    let resp = next.run(req).await?;
    let status = resp.status();
    let headers = resp.headers().clone();
    let url = resp.url().clone();
    let body = resp.bytes().await?;
    Ok(SharedResponse {
        status,
        headers,
        url,
        body,
    })
}

fn materialize(shared: &SharedResponse) -> Response {
    Response::from_bytes(
        shared.status,
        shared.headers.clone(),
        shared.url.clone(),
        shared.body.clone(),
    )
}
