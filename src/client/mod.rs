pub mod batch;
pub mod promise;

use std::sync::Arc;

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

use crate::config::{ClientConfig, TimeoutConfig};
use crate::cookie::Jar;
use crate::error::ClientError;
use crate::middleware::cache::{CacheMiddleware, CacheStore, InMemoryCache};
use crate::middleware::cookies::CookieMiddleware;
use crate::middleware::dedup::DedupMiddleware;
use crate::middleware::progress::ProgressMiddleware;
use crate::middleware::redirect::{BeforeRedirectHook, RedirectMiddleware};
use crate::middleware::retry::{RetryMiddleware, RetryPredicate};
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::scheduler::Scheduler;
use crate::transport::{HyperTransport, Transport};

pub use batch::{BatchOptions, BatchOutcome, BatchStats};
pub use promise::RequestPromise;

/// Configures and assembles a [`Client`]. Data-shaped options live in
/// [`ClientConfig`]; callable ones (middlewares, hooks, stores, the
/// transport override) are set here.
pub struct ClientBuilder {
    config: ClientConfig,
    user_middlewares: Vec<Arc<dyn Middleware>>,
    auth: Option<Arc<dyn Middleware>>,
    jar: Option<Arc<Jar>>,
    cache_store: Option<Arc<dyn CacheStore>>,
    transport: Option<Arc<dyn Transport>>,
    retry_predicate: Option<Arc<RetryPredicate>>,
    before_redirect: Option<Arc<BeforeRedirectHook>>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            user_middlewares: Vec::new(),
            auth: None,
            jar: None,
            cache_store: None,
            transport: None,
            retry_predicate: None,
            before_redirect: None,
        }
    }

    /// Append a user middleware. Registration order is preserved; user
    /// middlewares sit between auth and retry.
    pub fn middleware(mut self, mw: Arc<dyn Middleware>) -> Self {
        self.user_middlewares.push(mw);
        self
    }

    /// Install an auth middleware (Basic, Bearer, Digest, SigV4, token
    /// provider, or custom).
    pub fn auth(mut self, mw: Arc<dyn Middleware>) -> Self {
        self.auth = Some(mw);
        self
    }

    /// Use a caller-owned jar instead of a fresh one.
    pub fn cookie_jar(mut self, jar: Arc<Jar>) -> Self {
        self.jar = Some(jar);
        self
    }

    /// Use a caller-owned cache store instead of the in-memory default.
    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    /// Replace the wire transport (tests, recording proxies).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Retry gate consulted per failed attempt (the POST opt-in hook).
    pub fn retry_predicate(mut self, predicate: Arc<RetryPredicate>) -> Self {
        self.retry_predicate = Some(predicate);
        self
    }

    /// Default `before_redirect` hook for every request; a per-request hook
    /// overrides it.
    pub fn before_redirect(mut self, hook: Arc<BeforeRedirectHook>) -> Self {
        self.before_redirect = Some(hook);
        self
    }

    /// Apply a plugin: a registration function that receives the builder
    /// and returns it with middleware or settings added.
    pub fn plugin(self, register: impl FnOnce(ClientBuilder) -> ClientBuilder) -> Self {
        register(self)
    }

    pub fn build(self) -> Result<Client, ClientError> {
        self.config.validate()?;

        let timeout = self.config.timeout.resolve();
        let concurrency = self.config.concurrency.resolve();
        let cookie_cfg = self.config.cookies.resolve();
        let cache_cfg = self.config.cache.resolve();

        let base_url = match &self.config.base_url {
            Some(raw) => Some(
                Url::parse(raw)
                    .map_err(|e| ClientError::Config(format!("invalid base_url: {}", e)))?,
            ),
            None => None,
        };

        let mut default_headers = HeaderMap::new();
        for (name, value) in &self.config.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| ClientError::Config(format!("invalid header name \"{}\": {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ClientError::Config(format!("invalid header value: {}", e)))?;
            default_headers.append(name, value);
        }

        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => Arc::new(HyperTransport::new(
                &concurrency.agent,
                self.config.http2_preferred,
                self.config.decompress,
            )),
        };
        let scheduler = Arc::new(Scheduler::new(&concurrency, transport));

        let jar = match &cookie_cfg {
            Some(_) => Some(self.jar.unwrap_or_else(|| Arc::new(Jar::new()))),
            None => None,
        };
        let ignore_invalid = cookie_cfg.as_ref().map(|c| c.ignore_invalid).unwrap_or(false);

        // Outer to inner: Dedup → Cache → Cookie → Auth → user → Retry →
        // Redirect → Progress → Scheduler(Transport).
        let mut chain: Vec<Arc<dyn Middleware>> = Vec::new();
        chain.push(Arc::new(DedupMiddleware::new()));
        if let Some(cache_cfg) = cache_cfg {
            let store = self
                .cache_store
                .unwrap_or_else(|| Arc::new(InMemoryCache::new()));
            chain.push(Arc::new(CacheMiddleware::new(cache_cfg, store)));
        }
        if let Some(jar) = &jar {
            chain.push(Arc::new(CookieMiddleware::new(jar.clone(), ignore_invalid)));
        }
        if let Some(auth) = self.auth {
            chain.push(auth);
        }
        chain.extend(self.user_middlewares);
        chain.push(Arc::new(RetryMiddleware::new(
            self.config.retry.clone(),
            self.retry_predicate,
        )));
        chain.push(Arc::new(RedirectMiddleware::new(
            jar.clone(),
            ignore_invalid,
        )));
        chain.push(Arc::new(ProgressMiddleware));

        Ok(Client {
            inner: Arc::new(ClientInner {
                base_url,
                default_headers,
                timeout,
                follow_redirects: self.config.follow_redirects,
                max_redirects: self.config.max_redirects,
                throw_on_http_error: self.config.throw_on_http_error,
                http2_preferred: self.config.http2_preferred,
                batch_concurrency: concurrency.runner.concurrency,
                chain: Arc::from(chain),
                scheduler,
                jar,
                before_redirect: self.before_redirect,
            }),
        })
    }
}

struct ClientInner {
    base_url: Option<Url>,
    default_headers: HeaderMap,
    timeout: TimeoutConfig,
    follow_redirects: bool,
    max_redirects: u32,
    throw_on_http_error: bool,
    http2_preferred: bool,
    batch_concurrency: usize,
    chain: Arc<[Arc<dyn Middleware>]>,
    scheduler: Arc<Scheduler>,
    jar: Option<Arc<Jar>>,
    before_redirect: Option<Arc<BeforeRedirectHook>>,
}

/// The client facade: owns the assembled pipeline (composed once at build
/// time), the scheduler, and per-client shared state. Cloning shares all of
/// it.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        ClientBuilder::new(config).build()
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// The jar shared by this client's cookie handling, when enabled.
    pub fn cookie_jar(&self) -> Option<&Arc<Jar>> {
        self.inner.jar.as_ref()
    }

    pub fn request(&self, method: Method, path: &str) -> RequestPromise {
        let pipeline = Next::new(self.inner.chain.clone(), self.inner.scheduler.clone());
        let request = self.synthesize(method, path);
        RequestPromise::new(request, pipeline)
    }

    pub fn get(&self, path: &str) -> RequestPromise {
        self.request(Method::GET, path)
    }

    pub fn head(&self, path: &str) -> RequestPromise {
        self.request(Method::HEAD, path)
    }

    pub fn post(&self, path: &str) -> RequestPromise {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> RequestPromise {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: &str) -> RequestPromise {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: &str) -> RequestPromise {
        self.request(Method::DELETE, path)
    }

    pub fn options(&self, path: &str) -> RequestPromise {
        self.request(Method::OPTIONS, path)
    }

    /// Run many promises with per-batch concurrency; results come back in
    /// submission order. Scheduler-wide limits still bound the whole batch.
    pub async fn batch(
        &self,
        promises: Vec<RequestPromise>,
        opts: BatchOptions,
    ) -> BatchOutcome {
        batch::run_batch(promises, self.inner.batch_concurrency, opts).await
    }

    fn synthesize(&self, method: Method, path: &str) -> Result<Request, ClientError> {
        let url = self.resolve_url(path)?;
        let mut req = Request::new(method, url)
            .with_timeout(self.inner.timeout.clone())
            .with_follow_redirects(self.inner.follow_redirects)
            .with_max_redirects(self.inner.max_redirects)
            .with_throw_on_http_error(self.inner.throw_on_http_error)
            .with_http2_preferred(self.inner.http2_preferred);
        if let Some(hook) = &self.inner.before_redirect {
            req = req.with_before_redirect(hook.clone());
        }
        for (name, value) in self.inner.default_headers.iter() {
            if !req.headers().contains_key(name) {
                req = req.with_header(name.clone(), value.clone());
            }
        }
        Ok(req)
    }

    fn resolve_url(&self, path: &str) -> Result<Url, ClientError> {
        match &self.inner.base_url {
            Some(base) => base
                .join(path)
                .map_err(|e| ClientError::Config(format!("cannot resolve \"{}\": {}", path, e))),
            None => Url::parse(path).map_err(|e| {
                ClientError::Config(format!(
                    "\"{}\" is not an absolute URL and no base_url is set: {}",
                    path, e
                ))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Response;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OkTransport {
        dispatches: AtomicUsize,
        status: u16,
    }

    #[async_trait]
    impl Transport for OkTransport {
        async fn dispatch(&self, req: Request) -> Result<Response, ClientError> {
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            Ok(Response::from_bytes(
                StatusCode::from_u16(self.status).unwrap(),
                HeaderMap::new(),
                req.url().clone(),
                Bytes::from_static(b"{\"ok\":true}"),
            ))
        }
    }

    fn client_with(status: u16) -> (Client, Arc<OkTransport>) {
        let transport = Arc::new(OkTransport {
            dispatches: AtomicUsize::new(0),
            status,
        });
        let config: ClientConfig = serde_json::from_str(
            r#"{"base_url": "https://api.test", "headers": {"x-app": "courier-tests"}}"#,
        )
        .unwrap();
        let client = Client::builder(config)
            .transport(transport.clone())
            .build()
            .unwrap();
        (client, transport)
    }

    #[tokio::test]
    async fn test_promise_is_lazy() {
        let (client, transport) = client_with(200);
        let promise = client.get("/items");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(transport.dispatches.load(Ordering::SeqCst), 0);

        let resp = promise.await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(transport.dispatches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_base_url_and_default_headers() {
        struct Spy {
            seen: std::sync::Mutex<Vec<(String, Option<String>)>>,
        }
        #[async_trait]
        impl Transport for Spy {
            async fn dispatch(&self, req: Request) -> Result<Response, ClientError> {
                self.seen.lock().unwrap().push((
                    req.url().to_string(),
                    req.headers()
                        .get("x-app")
                        .and_then(|v| v.to_str().ok())
                        .map(String::from),
                ));
                Ok(Response::from_bytes(
                    StatusCode::OK,
                    HeaderMap::new(),
                    req.url().clone(),
                    Bytes::new(),
                ))
            }
        }
        let transport = Arc::new(Spy {
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let config: ClientConfig = serde_json::from_str(
            r#"{"base_url": "https://api.test/v1/", "headers": {"x-app": "courier-tests"}}"#,
        )
        .unwrap();
        let client = Client::builder(config)
            .transport(transport.clone())
            .build()
            .unwrap();

        client.get("items?page=2").await.unwrap();
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].0, "https://api.test/v1/items?page=2");
        assert_eq!(seen[0].1.as_deref(), Some("courier-tests"));
    }

    #[tokio::test]
    async fn test_http_error_materialized_at_edge() {
        let (client, _) = client_with(500);
        match client.get("/fail").await {
            Err(ClientError::Http { status, response }) => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(&response.bytes().await.unwrap()[..], b"{\"ok\":true}");
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_throw_disabled_returns_response() {
        let (client, _) = client_with(500);
        let resp = client
            .get("/fail")
            .throw_on_http_error(false)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_json_shortcut() {
        let (client, _) = client_with(200);
        let v: serde_json::Value = client.get("/items").json().await.unwrap();
        assert_eq!(v["ok"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_invalid_path_surfaces_config_error() {
        let transport = Arc::new(OkTransport {
            dispatches: AtomicUsize::new(0),
            status: 200,
        });
        let client = Client::builder(ClientConfig::default())
            .transport(transport)
            .build()
            .unwrap();
        match client.get("/relative-without-base").await {
            Err(ClientError::Config(_)) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_counts() {
        let (client, transport) = client_with(200);
        let promises = vec![
            client.get("/a"),
            client.get("/b"),
            client.get("/does-not-matter"),
        ];
        let outcome = client
            .batch(promises, BatchOptions { concurrency: Some(2) })
            .await;
        assert_eq!(outcome.stats.total, 3);
        assert_eq!(outcome.stats.successful, 3);
        assert_eq!(outcome.stats.failed, 0);
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(
            outcome.results[0].as_ref().unwrap().url().path(),
            "/a"
        );
        assert_eq!(
            outcome.results[1].as_ref().unwrap().url().path(),
            "/b"
        );
        assert!(transport.dispatches.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_plugin_registration() {
        use crate::middleware::{Middleware, Next};

        struct Stamp;
        #[async_trait]
        impl Middleware for Stamp {
            async fn handle(&self, req: Request, next: Next) -> Result<Response, ClientError> {
                next.run(req.with_header(
                    HeaderName::from_static("x-stamped"),
                    HeaderValue::from_static("yes"),
                ))
                .await
            }
        }

        struct Spy {
            stamped: std::sync::Mutex<Option<bool>>,
        }
        #[async_trait]
        impl Transport for Spy {
            async fn dispatch(&self, req: Request) -> Result<Response, ClientError> {
                *self.stamped.lock().unwrap() = Some(req.headers().contains_key("x-stamped"));
                Ok(Response::from_bytes(
                    StatusCode::OK,
                    HeaderMap::new(),
                    req.url().clone(),
                    Bytes::new(),
                ))
            }
        }

        let transport = Arc::new(Spy {
            stamped: std::sync::Mutex::new(None),
        });
        let config: ClientConfig =
            serde_json::from_str(r#"{"base_url": "https://api.test"}"#).unwrap();
        let client = Client::builder(config)
            .transport(transport.clone())
            .plugin(|b| b.middleware(Arc::new(Stamp)))
            .build()
            .unwrap();

        client.get("/x").await.unwrap();
        assert_eq!(*transport.stamped.lock().unwrap(), Some(true));
    }
}
