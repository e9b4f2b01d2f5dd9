use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::{CacheConfig, CacheStrategy};
use crate::error::ClientError;
use crate::fingerprint::fingerprint;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

/// One cached response: full bytes plus head, stamped at insertion.
#[derive(Clone)]
pub struct CacheEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub url: Url,
    pub body: Bytes,
    pub inserted_at: SystemTime,
}

impl CacheEntry {
    fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.inserted_at).unwrap_or(Duration::ZERO)
    }
}

/// Pluggable cache storage. The default is in-memory; external stores keep
/// their own failure handling internal. A cache that cannot answer must
/// return `None`, never break the request.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<CacheEntry>;
    fn put(&self, key: &str, entry: CacheEntry);
    fn remove(&self, key: &str);
}

/// Default store: a concurrent map.
pub struct InMemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for InMemoryCache {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    fn put(&self, key: &str, entry: CacheEntry) {
        self.entries.insert(key.to_string(), entry);
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// Serves idempotent requests from the store. Sits before Cookie/Auth so a
/// hit neither touches the jar nor triggers a token refresh; a hit
/// reconstructs a fresh single-use Response per caller.
pub struct CacheMiddleware {
    cfg: CacheConfig,
    store: Arc<dyn CacheStore>,
    refreshing: Arc<DashMap<String, ()>>,
}

impl CacheMiddleware {
    pub fn new(cfg: CacheConfig, store: Arc<dyn CacheStore>) -> Self {
        Self {
            cfg,
            store,
            refreshing: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl Middleware for CacheMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, ClientError> {
        if matches!(self.cfg.strategy, CacheStrategy::NoStore) {
            return next.run(req).await;
        }
        if !matches!(*req.method(), Method::GET | Method::HEAD) {
            return next.run(req).await;
        }
        let key = match fingerprint(&req) {
            Some(fp) => fp,
            None => return next.run(req).await,
        };

        let ttl = Duration::from_secs_f64(self.cfg.ttl);
        let swr = Duration::from_secs_f64(self.cfg.swr);
        let now = SystemTime::now();

        if let Some(entry) = self.store.get(&key) {
            let age = entry.age(now);
            if age <= ttl {
                metrics::counter!("courier_cache_total", "outcome" => "hit").increment(1);
                debug!(url = %req.url(), age_ms = %age.as_millis(), "cache: fresh hit");
                return Ok(materialize(&entry));
            }
            if matches!(self.cfg.strategy, CacheStrategy::StaleWhileRevalidate)
                && age <= ttl + swr
            {
                metrics::counter!("courier_cache_total", "outcome" => "stale").increment(1);
                debug!(url = %req.url(), age_ms = %age.as_millis(), "cache: stale hit, revalidating");
                self.spawn_revalidation(&key, &req, &next);
                return Ok(materialize(&entry));
            }
            self.store.remove(&key);
        }

        metrics::counter!("courier_cache_total", "outcome" => "miss").increment(1);
        let resp = next.run(req).await?;
        if !resp.status().is_success() {
            return Ok(resp);
        }
        let (entry, resp) = buffer(resp).await?;
        self.store.put(&key, entry);
        Ok(resp)
    }
}

impl CacheMiddleware {
    /// Fire one background refresh per key; joiners of the stale window ride
    /// on the in-flight one. The refresh runs with its own cancellation so
    /// the caller dropping its stale response does not kill it.
    fn spawn_revalidation(&self, key: &str, req: &Request, next: &Next) {
        use dashmap::mapref::entry::Entry;
        match self.refreshing.entry(key.to_string()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let refresh_req = match req.try_duplicate() {
            Some(dup) => dup.with_cancel(CancellationToken::new()),
            None => {
                self.refreshing.remove(key);
                return;
            }
        };
        let key = key.to_string();
        let next = next.clone();
        let store = self.store.clone();
        let refreshing = self.refreshing.clone();

        tokio::spawn(async move {
            let result = next.run(refresh_req).await;
            match result {
                Ok(resp) if resp.status().is_success() => match buffer(resp).await {
                    Ok((entry, _)) => store.put(&key, entry),
                    Err(e) => warn!(error = %e, "cache: revalidation body read failed"),
                },
                Ok(resp) => {
                    debug!(status = %resp.status(), "cache: revalidation got non-2xx, keeping stale entry");
                }
                Err(e) => {
                    warn!(error = %e, "cache: revalidation failed, keeping stale entry");
                }
            }
            refreshing.remove(&key);
        });
    }
}

/// Read the body once, producing both the stored entry and an equivalent
/// response for the caller.
async fn buffer(resp: Response) -> Result<(CacheEntry, Response), ClientError> {
    let status = resp.status();
    let headers = resp.headers().clone();
    let url = resp.url().clone();
    let body = resp.bytes().await?;
    let entry = CacheEntry {
        status,
        headers,
        url,
        body,
        inserted_at: SystemTime::now(),
    };
    let fresh = materialize(&entry);
    Ok((entry, fresh))
}

fn materialize(entry: &CacheEntry) -> Response {
    Response::from_bytes(
        entry.status,
        entry.headers.clone(),
        entry.url.clone(),
        entry.body.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConcurrencyConfig;
    use crate::scheduler::Scheduler;
    use crate::transport::Transport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        dispatches: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Counter {
        async fn dispatch(&self, req: Request) -> Result<Response, ClientError> {
            let n = self.dispatches.fetch_add(1, Ordering::SeqCst);
            Ok(Response::from_bytes(
                StatusCode::OK,
                HeaderMap::new(),
                req.url().clone(),
                Bytes::from(format!("payload-{}", n)),
            ))
        }
    }

    fn pipeline(transport: Arc<Counter>, cfg: CacheConfig) -> (Next, Arc<InMemoryCache>) {
        let scheduler = Arc::new(Scheduler::new(&ConcurrencyConfig::default(), transport));
        let store = Arc::new(InMemoryCache::new());
        let chain: Arc<[Arc<dyn Middleware>]> = Arc::from(vec![Arc::new(CacheMiddleware::new(
            cfg,
            store.clone(),
        )) as Arc<dyn Middleware>]);
        (Next::new(chain, scheduler), store)
    }

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    fn ttl_cfg(ttl: f64) -> CacheConfig {
        CacheConfig {
            strategy: CacheStrategy::Ttl,
            ttl,
            swr: 0.0,
        }
    }

    #[tokio::test]
    async fn test_fresh_hit_skips_dispatch() {
        let transport = Arc::new(Counter {
            dispatches: AtomicUsize::new(0),
        });
        let (next, _) = pipeline(transport.clone(), ttl_cfg(60.0));

        let first = next.clone().run(get("https://h.test/x")).await.unwrap();
        assert_eq!(&first.bytes().await.unwrap()[..], b"payload-0");

        let second = next.run(get("https://h.test/x")).await.unwrap();
        assert_eq!(&second.bytes().await.unwrap()[..], b"payload-0");
        assert_eq!(transport.dispatches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hit_reconstructs_fresh_body_per_caller() {
        let transport = Arc::new(Counter {
            dispatches: AtomicUsize::new(0),
        });
        let (next, _) = pipeline(transport, ttl_cfg(60.0));

        next.clone().run(get("https://h.test/x")).await.unwrap();
        let a = next.clone().run(get("https://h.test/x")).await.unwrap();
        let b = next.run(get("https://h.test/x")).await.unwrap();
        // Each hit owns an unconsumed body.
        assert_eq!(&a.bytes().await.unwrap()[..], b"payload-0");
        assert_eq!(&b.bytes().await.unwrap()[..], b"payload-0");
    }

    #[tokio::test]
    async fn test_expired_entry_refetches() {
        let transport = Arc::new(Counter {
            dispatches: AtomicUsize::new(0),
        });
        let (next, store) = pipeline(transport.clone(), ttl_cfg(0.01));

        next.clone().run(get("https://h.test/x")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let resp = next.run(get("https://h.test/x")).await.unwrap();
        assert_eq!(&resp.bytes().await.unwrap()[..], b"payload-1");
        assert_eq!(transport.dispatches.load(Ordering::SeqCst), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_post_bypasses_cache() {
        let transport = Arc::new(Counter {
            dispatches: AtomicUsize::new(0),
        });
        let (next, store) = pipeline(transport.clone(), ttl_cfg(60.0));

        next.clone()
            .run(get("https://h.test/x").with_method(Method::POST))
            .await
            .unwrap();
        next.run(get("https://h.test/x").with_method(Method::POST))
            .await
            .unwrap();
        assert_eq!(transport.dispatches.load(Ordering::SeqCst), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_swr_serves_stale_and_revalidates() {
        let transport = Arc::new(Counter {
            dispatches: AtomicUsize::new(0),
        });
        let cfg = CacheConfig {
            strategy: CacheStrategy::StaleWhileRevalidate,
            ttl: 0.01,
            swr: 60.0,
        };
        let (next, store) = pipeline(transport.clone(), cfg);

        next.clone().run(get("https://h.test/x")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Stale window: caller gets the old payload immediately.
        let stale = next.clone().run(get("https://h.test/x")).await.unwrap();
        assert_eq!(&stale.bytes().await.unwrap()[..], b"payload-0");

        // The background refresh lands shortly after.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.dispatches.load(Ordering::SeqCst), 2);
        let refreshed = store.get(&fingerprint(&get("https://h.test/x")).unwrap()).unwrap();
        assert_eq!(&refreshed.body[..], b"payload-1");
    }

    #[tokio::test]
    async fn test_non_2xx_not_cached() {
        struct ErrTransport;
        #[async_trait]
        impl Transport for ErrTransport {
            async fn dispatch(&self, req: Request) -> Result<Response, ClientError> {
                Ok(Response::from_bytes(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    HeaderMap::new(),
                    req.url().clone(),
                    Bytes::new(),
                ))
            }
        }
        let scheduler = Arc::new(Scheduler::new(
            &ConcurrencyConfig::default(),
            Arc::new(ErrTransport),
        ));
        let store = Arc::new(InMemoryCache::new());
        let chain: Arc<[Arc<dyn Middleware>]> = Arc::from(vec![Arc::new(CacheMiddleware::new(
            ttl_cfg(60.0),
            store.clone(),
        )) as Arc<dyn Middleware>]);
        Next::new(chain, scheduler)
            .run(get("https://h.test/x"))
            .await
            .unwrap();
        assert!(store.is_empty());
    }
}
