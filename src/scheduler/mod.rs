pub mod adaptive;
pub mod token_bucket;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::ConcurrencyConfig;
use crate::error::ClientError;
use crate::request::Request;
use crate::response::Response;
use crate::transport::Transport;

pub use adaptive::AdaptivePauses;
pub use token_bucket::TokenBucket;

/// Admission gate in front of the transport. A dispatch proceeds only after
/// every active predicate passes, in order: rate-bucket token, global slot,
/// per-domain slot, adaptive pause. Slots release in reverse order when the
/// dispatch completes. Each queue is FIFO; a task waiting on one domain's
/// slot never blocks another domain.
pub struct Scheduler {
    global: Option<Arc<Semaphore>>,
    per_domain_cap: Option<usize>,
    domains: DashMap<String, Arc<Semaphore>>,
    bucket: Option<TokenBucket>,
    pub(crate) adaptive: AdaptivePauses,
    transport: Arc<dyn Transport>,
}

impl Scheduler {
    pub fn new(cfg: &ConcurrencyConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            global: cfg.max.map(|n| Arc::new(Semaphore::new(n))),
            per_domain_cap: cfg.per_domain,
            domains: DashMap::new(),
            bucket: cfg
                .requests_per_interval
                .map(|n| TokenBucket::new(n, Duration::from_secs_f64(cfg.interval))),
            adaptive: AdaptivePauses::new(),
            transport,
        }
    }

    /// Admit and dispatch one request.
    pub async fn execute(&self, req: Request) -> Result<Response, ClientError> {
        let cancel = req.cancellation().clone();
        let domain = req.domain();

        if let Some(bucket) = &self.bucket {
            bucket.acquire(&cancel).await?;
        }

        let _global = match &self.global {
            Some(sem) => Some(acquire_slot(sem, &cancel).await?),
            None => None,
        };

        let _domain_slot = match self.per_domain_cap {
            Some(cap) => {
                let sem = self
                    .domains
                    .entry(domain.clone())
                    .or_insert_with(|| Arc::new(Semaphore::new(cap)))
                    .clone();
                Some(acquire_slot(&sem, &cancel).await?)
            }
            None => None,
        };

        self.adaptive.wait(&domain, &cancel).await?;

        metrics::counter!(
            "courier_admissions_total",
            "domain" => domain.clone(),
        )
        .increment(1);
        metrics::gauge!("courier_dispatches_in_flight").increment(1.0);

        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            r = self.transport.dispatch(req) => r,
        };

        metrics::gauge!("courier_dispatches_in_flight").decrement(1.0);
        metrics::histogram!(
            "courier_dispatch_duration_seconds",
            "domain" => domain.clone(),
        )
        .record(start.elapsed().as_secs_f64());

        if let Ok(resp) = &result {
            self.adaptive
                .observe(&domain, resp.status().as_u16(), resp.headers());
        }

        result
    }
}

/// Wait for a semaphore slot, leaving the wait queue if cancellation fires.
async fn acquire_slot(
    sem: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit, ClientError> {
    tokio::select! {
        permit = sem.clone().acquire_owned() => {
            permit.map_err(|_| ClientError::ScheduleCancelled)
        }
        _ = cancel.cancelled() => Err(ClientError::ScheduleCancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    /// Transport that tracks its own peak concurrency.
    struct GaugeTransport {
        active: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl GaugeTransport {
        fn new(delay: Duration) -> Self {
            Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl Transport for GaugeTransport {
        async fn dispatch(&self, req: Request) -> Result<Response, ClientError> {
            let n = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(n, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Response::from_bytes(
                StatusCode::OK,
                HeaderMap::new(),
                req.url().clone(),
                Bytes::new(),
            ))
        }
    }

    fn cfg(max: Option<usize>, per_domain: Option<usize>) -> ConcurrencyConfig {
        ConcurrencyConfig {
            max,
            per_domain,
            ..ConcurrencyConfig::default()
        }
    }

    fn req(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_cap_bounds_concurrency() {
        let transport = Arc::new(GaugeTransport::new(Duration::from_millis(50)));
        let scheduler = Arc::new(Scheduler::new(&cfg(Some(2), None), transport.clone()));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move {
                s.execute(req("https://a.test/x")).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(transport.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_domain_cap_is_independent_across_domains() {
        let transport = Arc::new(GaugeTransport::new(Duration::from_millis(50)));
        let scheduler = Arc::new(Scheduler::new(&cfg(None, Some(1)), transport.clone()));

        let start = tokio::time::Instant::now();
        let mut handles = Vec::new();
        for url in ["https://a.test/x", "https://b.test/x"] {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move {
                s.execute(req(url)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        // Two different domains with per_domain=1 still overlap.
        assert!(start.elapsed() < Duration::from_millis(90));
        assert_eq!(transport.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_domain_serializes() {
        let transport = Arc::new(GaugeTransport::new(Duration::from_millis(50)));
        let scheduler = Arc::new(Scheduler::new(&cfg(None, Some(1)), transport.clone()));

        let start = tokio::time::Instant::now();
        let mut handles = Vec::new();
        for _ in 0..2 {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move {
                s.execute(req("https://a.test/x")).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(transport.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_admission() {
        let transport = Arc::new(GaugeTransport::new(Duration::from_secs(5)));
        let scheduler = Arc::new(Scheduler::new(&cfg(Some(1), None), transport.clone()));

        // Occupy the only slot.
        let s = scheduler.clone();
        let hold = tokio::spawn(async move { s.execute(req("https://a.test/1")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiting = req("https://a.test/2");
        let cancel = waiting.cancellation().clone();
        let s = scheduler.clone();
        let waiter = tokio::spawn(async move { s.execute(waiting).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        match waiter.await.unwrap() {
            Err(ClientError::ScheduleCancelled) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        hold.abort();
    }

    #[tokio::test]
    async fn test_cancel_in_flight() {
        let transport = Arc::new(GaugeTransport::new(Duration::from_secs(5)));
        let scheduler = Arc::new(Scheduler::new(&cfg(None, None), transport.clone()));

        let r = req("https://a.test/x");
        let cancel = r.cancellation().clone();
        let s = scheduler.clone();
        let task = tokio::spawn(async move { s.execute(r).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        match task.await.unwrap() {
            Err(ClientError::Cancelled) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_pause_delays_next_admission() {
        let transport = Arc::new(GaugeTransport::new(Duration::from_millis(1)));
        let scheduler = Arc::new(Scheduler::new(&cfg(None, None), transport.clone()));

        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, "1".parse().unwrap());
        scheduler.adaptive.observe("a.test", 429, &headers);

        let start = tokio::time::Instant::now();
        scheduler.execute(req("https://a.test/x")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(950));
    }
}
