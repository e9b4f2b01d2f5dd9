use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::RETRY_AFTER;
use http::{HeaderName, HeaderValue, Method};
use rand::Rng;
use tracing::debug;

use crate::config::{BackoffKind, JitterKind, RetryConfig};
use crate::error::ClientError;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;
use crate::scheduler::adaptive::parse_retry_after;

/// What a failed attempt looked like, handed to the retry predicate.
pub enum RetryOutcome<'a> {
    Status(u16),
    Error(&'a ClientError),
}

/// User hook deciding whether a non-idempotent (or any) request may retry.
pub type RetryPredicate = dyn Fn(&Request, &RetryOutcome<'_>) -> bool + Send + Sync;

const X_RETRY_ATTEMPT: HeaderName = HeaderName::from_static("x-retry-attempt");

/// Methods retried without a predicate when none are configured.
const IDEMPOTENT_METHODS: &[&str] = &["GET", "HEAD", "PUT", "DELETE", "OPTIONS"];

/// Replays its pipeline suffix on retriable failures. The suffix re-enters
/// the scheduler, so every attempt passes admission again; the cache sits
/// outside this middleware, so attempts beyond the first never turn into
/// cache hits that would mask a transient failure.
pub struct RetryMiddleware {
    cfg: RetryConfig,
    predicate: Option<Arc<RetryPredicate>>,
}

impl RetryMiddleware {
    pub fn new(cfg: RetryConfig, predicate: Option<Arc<RetryPredicate>>) -> Self {
        Self { cfg, predicate }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, ClientError> {
        let cfg = req.retry_override.clone().unwrap_or_else(|| self.cfg.clone());
        let max_attempts = cfg.max_attempts.max(1);
        let cancel = req.cancellation().clone();
        let replayable = req.body().is_replayable();

        let mut template = Some(req);
        let mut attempt: u32 = 1;

        loop {
            let is_last = attempt >= max_attempts;

            let mut attempt_req = match template.as_ref().and_then(|t| t.try_duplicate()) {
                Some(dup) => dup,
                // Single-pass body: hand over the original, one shot only.
                None => match template.take() {
                    Some(original) => original,
                    None => return Err(ClientError::NonReplayableBody),
                },
            };
            if attempt > 1 && cfg.expose_attempt_header {
                let retry_number = attempt - 1;
                attempt_req = attempt_req.with_header(
                    X_RETRY_ATTEMPT,
                    HeaderValue::from_str(&retry_number.to_string()).unwrap(),
                );
            }
            let method = attempt_req.method().clone();
            let url = attempt_req.url().clone();

            match next.clone().run(attempt_req).await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let retriable = !is_last
                        && cfg.status_codes.contains(&status)
                        && self.method_allows(&cfg, &method, template.as_ref(), &RetryOutcome::Status(status));
                    if !retriable {
                        return Ok(resp);
                    }
                    if !replayable {
                        return Err(ClientError::NonReplayableBody);
                    }

                    // A server-provided Retry-After replaces the computed
                    // backoff outright: zero retries immediately, a long one
                    // outwaits any backoff.
                    let delay = resp
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after)
                        .unwrap_or_else(|| compute_backoff(&cfg, attempt));

                    debug!(
                        url = %url,
                        status = status,
                        attempt = attempt,
                        delay_ms = %delay.as_millis(),
                        "retry: retriable status"
                    );
                    metrics::counter!(
                        "courier_retries_total",
                        "reason" => "status",
                    )
                    .increment(1);

                    sleep_or_cancel(delay, &cancel).await?;
                    attempt += 1;
                }
                Err(e) => {
                    let retriable = !is_last
                        && cfg.retry_on_transport_errors
                        && e.is_transport()
                        && self.method_allows(&cfg, &method, template.as_ref(), &RetryOutcome::Error(&e));
                    if !retriable {
                        return Err(e);
                    }
                    if !replayable {
                        return Err(ClientError::NonReplayableBody);
                    }

                    let delay = compute_backoff(&cfg, attempt);
                    debug!(
                        url = %url,
                        error = %e,
                        attempt = attempt,
                        delay_ms = %delay.as_millis(),
                        "retry: transport error"
                    );
                    metrics::counter!(
                        "courier_retries_total",
                        "reason" => "transport",
                    )
                    .increment(1);

                    sleep_or_cancel(delay, &cancel).await?;
                    attempt += 1;
                }
            }
        }
    }
}

impl RetryMiddleware {
    /// A method retries when it is in the configured (or idempotent) set,
    /// unless a predicate is installed, in which case the predicate decides
    /// for every method (the POST opt-in path).
    fn method_allows(
        &self,
        cfg: &RetryConfig,
        method: &Method,
        req: Option<&Request>,
        outcome: &RetryOutcome<'_>,
    ) -> bool {
        let in_set = match &cfg.methods {
            Some(list) => list.iter().any(|m| m.eq_ignore_ascii_case(method.as_str())),
            None => IDEMPOTENT_METHODS.contains(&method.as_str()),
        };
        match (&self.predicate, req) {
            // A predicate, when installed, has the final say for every
            // method: it can approve a POST and veto a GET.
            (Some(p), Some(req)) => p(req, outcome),
            (Some(_), None) => false,
            (None, _) => in_set,
        }
    }
}

/// `delay × factor^(attempt-1)` (or the fixed/linear shapes), clamped to
/// `max_delay`, plus the configured jitter.
pub(crate) fn compute_backoff(cfg: &RetryConfig, attempt: u32) -> Duration {
    let base = cfg.delay.max(0.0);
    let raw = match cfg.backoff {
        BackoffKind::Fixed => base,
        BackoffKind::Linear => base * attempt as f64,
        BackoffKind::Exponential => base * cfg.factor.powi(attempt.saturating_sub(1) as i32),
    };
    let clamped = raw.min(cfg.max_delay.max(0.0));
    let jittered = match cfg.jitter {
        JitterKind::None => clamped,
        JitterKind::Full => rand::thread_rng().gen_range(0.0..=clamped.max(f64::MIN_POSITIVE)),
        JitterKind::Equal => {
            let half = clamped / 2.0;
            half + rand::thread_rng().gen_range(0.0..=half.max(f64::MIN_POSITIVE))
        }
    };
    Duration::from_secs_f64(jittered.max(0.0))
}

async fn sleep_or_cancel(
    delay: Duration,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<(), ClientError> {
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(ClientError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConcurrencyConfig;
    use crate::scheduler::Scheduler;
    use crate::transport::Transport;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use url::Url;

    /// Scripted transport: pops one (status, headers) per dispatch.
    struct Script {
        steps: Mutex<Vec<(u16, Vec<(&'static str, &'static str)>)>>,
        dispatches: AtomicUsize,
        fail_first_with: Mutex<Option<ClientError>>,
    }

    impl Script {
        fn statuses(list: Vec<u16>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(list.into_iter().rev().map(|s| (s, Vec::new())).collect()),
                dispatches: AtomicUsize::new(0),
                fail_first_with: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl Transport for Script {
        async fn dispatch(&self, req: Request) -> Result<Response, ClientError> {
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.fail_first_with.lock().unwrap().take() {
                return Err(err);
            }
            let (status, headers) = self
                .steps
                .lock()
                .unwrap()
                .pop()
                .unwrap_or((200, Vec::new()));
            let mut map = HeaderMap::new();
            for (k, v) in headers {
                map.insert(
                    HeaderName::try_from(k).unwrap(),
                    HeaderValue::from_static(v),
                );
            }
            Ok(Response::from_bytes(
                StatusCode::from_u16(status).unwrap(),
                map,
                req.url().clone(),
                Bytes::from_static(b"body"),
            ))
        }
    }

    fn pipeline(transport: Arc<Script>, cfg: RetryConfig) -> Next {
        let scheduler = Arc::new(Scheduler::new(&ConcurrencyConfig::default(), transport));
        let chain: Arc<[Arc<dyn Middleware>]> =
            Arc::from(vec![
                Arc::new(RetryMiddleware::new(cfg, None)) as Arc<dyn Middleware>
            ]);
        Next::new(chain, scheduler)
    }

    fn fast_cfg(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            delay: 0.001,
            ..RetryConfig::default()
        }
    }

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_retries_on_status_then_succeeds() {
        let transport = Script::statuses(vec![503, 200]);
        let resp = pipeline(transport.clone(), fast_cfg(3))
            .run(get("https://h.test/x"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(transport.dispatches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_returns_last_response_after_exhaustion() {
        let transport = Script::statuses(vec![500, 500, 500, 500]);
        let resp = pipeline(transport.clone(), fast_cfg(3))
            .run(get("https://h.test/x"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        // Exactly max_attempts dispatches, then the last response returns.
        assert_eq!(transport.dispatches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retriable_status_returns_immediately() {
        let transport = Script::statuses(vec![404]);
        let resp = pipeline(transport.clone(), fast_cfg(3))
            .run(get("https://h.test/x"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(transport.dispatches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_post_not_retried_without_predicate() {
        let transport = Script::statuses(vec![503, 200]);
        let req = get("https://h.test/x").with_method(Method::POST).with_body("p");
        let resp = pipeline(transport.clone(), fast_cfg(3)).run(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(transport.dispatches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_post_retried_with_approving_predicate() {
        let transport = Script::statuses(vec![503, 200]);
        let scheduler = Arc::new(Scheduler::new(&ConcurrencyConfig::default(), transport.clone()));
        let predicate: Arc<RetryPredicate> = Arc::new(|_, _| true);
        let chain: Arc<[Arc<dyn Middleware>]> = Arc::from(vec![Arc::new(RetryMiddleware::new(
            fast_cfg(3),
            Some(predicate),
        )) as Arc<dyn Middleware>]);

        let req = get("https://h.test/x").with_method(Method::POST).with_body("p");
        let resp = Next::new(chain, scheduler).run(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(transport.dispatches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transport_error_retried() {
        let transport = Script::statuses(vec![200]);
        *transport.fail_first_with.lock().unwrap() =
            Some(ClientError::Connect("refused".into()));
        let resp = pipeline(transport.clone(), fast_cfg(3))
            .run(get("https://h.test/x"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(transport.dispatches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stream_body_fails_with_nonreplayable() {
        use crate::request::{Body, BodyStream};
        let transport = Script::statuses(vec![503, 200]);
        let req = get("https://h.test/x")
            .with_method(Method::PUT)
            .with_body(Body::Stream(BodyStream::new(
                futures_util::stream::empty(),
                None,
            )));
        match pipeline(transport, fast_cfg(3)).run(req).await {
            Err(ClientError::NonReplayableBody) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_retry_attempt_header_opt_in() {
        let transport = Arc::new(Script {
            steps: Mutex::new(vec![(200, Vec::new()), (503, Vec::new())]),
            dispatches: AtomicUsize::new(0),
            fail_first_with: Mutex::new(None),
        });
        let scheduler = Arc::new(Scheduler::new(&ConcurrencyConfig::default(), transport.clone()));

        struct HeaderSpy {
            seen: Arc<Mutex<Vec<Option<String>>>>,
        }
        #[async_trait]
        impl Middleware for HeaderSpy {
            async fn handle(&self, req: Request, next: Next) -> Result<Response, ClientError> {
                self.seen.lock().unwrap().push(
                    req.headers()
                        .get("x-retry-attempt")
                        .and_then(|v| v.to_str().ok())
                        .map(String::from),
                );
                next.run(req).await
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let cfg = RetryConfig {
            expose_attempt_header: true,
            ..fast_cfg(3)
        };
        let chain: Arc<[Arc<dyn Middleware>]> = Arc::from(vec![
            Arc::new(RetryMiddleware::new(cfg, None)) as Arc<dyn Middleware>,
            Arc::new(HeaderSpy { seen: seen.clone() }) as Arc<dyn Middleware>,
        ]);
        Next::new(chain, scheduler)
            .run(get("https://h.test/x"))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], None);
        assert_eq!(seen[1].as_deref(), Some("1"));
    }

    #[test]
    fn test_backoff_shapes() {
        let cfg = RetryConfig {
            delay: 1.0,
            factor: 2.0,
            max_delay: 10.0,
            jitter: JitterKind::None,
            backoff: BackoffKind::Exponential,
            ..RetryConfig::default()
        };
        assert_eq!(compute_backoff(&cfg, 1), Duration::from_secs(1));
        assert_eq!(compute_backoff(&cfg, 2), Duration::from_secs(2));
        assert_eq!(compute_backoff(&cfg, 3), Duration::from_secs(4));
        // Clamped at max_delay.
        assert_eq!(compute_backoff(&cfg, 10), Duration::from_secs(10));

        let linear = RetryConfig {
            backoff: BackoffKind::Linear,
            ..cfg.clone()
        };
        assert_eq!(compute_backoff(&linear, 3), Duration::from_secs(3));

        let fixed = RetryConfig {
            backoff: BackoffKind::Fixed,
            ..cfg
        };
        assert_eq!(compute_backoff(&fixed, 7), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let cfg = RetryConfig {
            delay: 1.0,
            jitter: JitterKind::Full,
            backoff: BackoffKind::Fixed,
            ..RetryConfig::default()
        };
        for _ in 0..50 {
            let d = compute_backoff(&cfg, 1);
            assert!(d <= Duration::from_secs(1));
        }
        let cfg = RetryConfig {
            jitter: JitterKind::Equal,
            ..cfg
        };
        for _ in 0..50 {
            let d = compute_backoff(&cfg, 1);
            assert!(d >= Duration::from_millis(499));
            assert!(d <= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_zero_is_immediate() {
        let transport = Arc::new(Script {
            steps: Mutex::new(vec![
                (200, Vec::new()),
                (503, vec![("retry-after", "0")]),
            ]),
            dispatches: AtomicUsize::new(0),
            fail_first_with: Mutex::new(None),
        });
        let cfg = RetryConfig {
            delay: 9999.0,
            ..fast_cfg(3)
        };
        let start = tokio::time::Instant::now();
        let resp = pipeline(transport, cfg)
            .run(get("https://h.test/x"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        // Retry-After: 0 overrides the enormous configured backoff.
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_backoff_upward() {
        let transport = Arc::new(Script {
            steps: Mutex::new(vec![
                (200, Vec::new()),
                (503, vec![("retry-after", "2")]),
            ]),
            dispatches: AtomicUsize::new(0),
            fail_first_with: Mutex::new(None),
        });
        let start = tokio::time::Instant::now();
        pipeline(transport, fast_cfg(3))
            .run(get("https://h.test/x"))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
