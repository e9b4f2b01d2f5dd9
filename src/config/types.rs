use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ClientError;

/// Top-level client configuration. Everything here is plain data; callable
/// options (hooks, custom stores, transport override, plugins) live on the
/// builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL that relative request paths resolve against.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Default headers attached to every request (per-request headers win).
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub timeout: TimeoutOption,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default = "default_true")]
    pub follow_redirects: bool,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,

    #[serde(default)]
    pub concurrency: ConcurrencyOption,

    #[serde(default)]
    pub cache: CacheOption,

    #[serde(default)]
    pub cookies: CookieOption,

    /// Transparent decompression of gzip/deflate/brotli response bodies.
    /// Disable to observe on-the-wire byte counts in progress events.
    #[serde(default = "default_true")]
    pub decompress: bool,

    /// Turn non-2xx responses into `ClientError::Http` at the outer edge.
    #[serde(default = "default_true")]
    pub throw_on_http_error: bool,

    /// Prefer HTTP/2 when the server advertises it.
    #[serde(default)]
    pub http2_preferred: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            headers: HashMap::new(),
            timeout: TimeoutOption::default(),
            retry: RetryConfig::default(),
            follow_redirects: true,
            max_redirects: default_max_redirects(),
            concurrency: ConcurrencyOption::default(),
            cache: CacheOption::default(),
            cookies: CookieOption::default(),
            decompress: true,
            throw_on_http_error: true,
            http2_preferred: false,
        }
    }
}

impl Default for TimeoutOption {
    fn default() -> Self {
        TimeoutOption::Detailed(TimeoutConfig::default())
    }
}

/// `timeout: 30` (whole-request seconds) or the detailed form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeoutOption {
    Seconds(f64),
    Detailed(TimeoutConfig),
}

impl TimeoutOption {
    pub fn resolve(&self) -> TimeoutConfig {
        match self {
            TimeoutOption::Seconds(s) => TimeoutConfig {
                request: Some(*s),
                ..TimeoutConfig::default()
            },
            TimeoutOption::Detailed(cfg) => cfg.clone(),
        }
    }
}

/// All values are seconds; `None` means no budget for that category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default)]
    pub request: Option<f64>,

    #[serde(default)]
    pub connect: Option<f64>,

    #[serde(default)]
    pub response_start: Option<f64>,

    #[serde(default)]
    pub between_bytes: Option<f64>,
}

impl TimeoutConfig {
    pub fn request_duration(&self) -> Option<Duration> {
        self.request.map(Duration::from_secs_f64)
    }

    pub fn connect_duration(&self) -> Option<Duration> {
        self.connect.map(Duration::from_secs_f64)
    }

    pub fn response_start_duration(&self) -> Option<Duration> {
        self.response_start.map(Duration::from_secs_f64)
    }

    pub fn between_bytes_duration(&self) -> Option<Duration> {
        self.between_bytes.map(Duration::from_secs_f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterKind {
    None,
    Full,
    Equal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first. 1 disables retries.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff")]
    pub backoff: BackoffKind,

    /// Base delay in seconds.
    #[serde(default = "default_retry_delay")]
    pub delay: f64,

    #[serde(default = "default_retry_factor")]
    pub factor: f64,

    /// Clamp for the computed delay, in seconds.
    #[serde(default = "default_retry_max_delay")]
    pub max_delay: f64,

    #[serde(default = "default_jitter")]
    pub jitter: JitterKind,

    #[serde(default = "default_retry_statuses")]
    pub status_codes: Vec<u16>,

    /// Methods retried without a predicate. `None` uses the idempotent set
    /// (GET, HEAD, PUT, DELETE, OPTIONS).
    #[serde(default)]
    pub methods: Option<Vec<String>>,

    /// Send `X-Retry-Attempt: n` (starting at 1) on retried dispatches.
    #[serde(default)]
    pub expose_attempt_header: bool,

    /// Retry on connect/DNS/response-start transport failures.
    #[serde(default = "default_true")]
    pub retry_on_transport_errors: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            delay: default_retry_delay(),
            factor: default_retry_factor(),
            max_delay: default_retry_max_delay(),
            jitter: default_jitter(),
            status_codes: default_retry_statuses(),
            methods: None,
            expose_attempt_header: false,
            retry_on_transport_errors: true,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> BackoffKind {
    BackoffKind::Exponential
}

fn default_retry_delay() -> f64 {
    0.1
}

fn default_retry_factor() -> f64 {
    2.0
}

fn default_retry_max_delay() -> f64 {
    30.0
}

fn default_jitter() -> JitterKind {
    JitterKind::None
}

fn default_retry_statuses() -> Vec<u16> {
    vec![408, 429, 500, 502, 503, 504]
}

/// `concurrency: 16` (global cap) or the detailed form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConcurrencyOption {
    Max(usize),
    Detailed(ConcurrencyConfig),
}

impl Default for ConcurrencyOption {
    fn default() -> Self {
        ConcurrencyOption::Detailed(ConcurrencyConfig::default())
    }
}

impl ConcurrencyOption {
    pub fn resolve(&self) -> ConcurrencyConfig {
        match self {
            ConcurrencyOption::Max(n) => ConcurrencyConfig {
                max: Some(*n),
                ..ConcurrencyConfig::default()
            },
            ConcurrencyOption::Detailed(cfg) => cfg.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Global in-flight dispatch cap. `None` is unbounded.
    #[serde(default)]
    pub max: Option<usize>,

    /// Per-domain in-flight dispatch cap. `None` is unbounded.
    #[serde(default)]
    pub per_domain: Option<usize>,

    /// Token-bucket capacity; refilled evenly over `interval`.
    #[serde(default)]
    pub requests_per_interval: Option<u32>,

    /// Bucket refill interval in seconds.
    #[serde(default = "default_interval")]
    pub interval: f64,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub agent: AgentConfig,
}

fn default_interval() -> f64 {
    1.0
}

/// Defaults for the batch executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_runner_concurrency")]
    pub concurrency: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_runner_concurrency(),
        }
    }
}

fn default_runner_concurrency() -> usize {
    8
}

/// Connection pool policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub connections: Connections,

    /// Pool keyed by `(scheme, host, port)` vs. one shared pool.
    #[serde(default = "default_true")]
    pub per_domain_pooling: bool,

    /// Idle connection timeout in seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            connections: Connections::Auto,
            per_domain_pooling: true,
            idle_timeout: default_idle_timeout(),
        }
    }
}

fn default_idle_timeout() -> f64 {
    90.0
}

/// `connections: "auto"` (2 × available parallelism) or a fixed count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Connections {
    Fixed(usize),
    Auto,
}

impl Default for Connections {
    fn default() -> Self {
        Connections::Auto
    }
}

impl Connections {
    pub fn resolve(&self) -> usize {
        match self {
            Connections::Fixed(n) => (*n).max(1),
            Connections::Auto => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4);
                cpus * 2
            }
        }
    }
}

impl<'de> Deserialize<'de> for Connections {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Fixed(usize),
            Keyword(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Fixed(n) => Ok(Connections::Fixed(n)),
            Raw::Keyword(s) if s == "auto" => Ok(Connections::Auto),
            Raw::Keyword(s) => Err(serde::de::Error::custom(format!(
                "expected \"auto\" or an integer, got \"{}\"",
                s
            ))),
        }
    }
}

/// `cache: false` or the detailed form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheOption {
    Enabled(bool),
    Detailed(CacheConfig),
}

impl Default for CacheOption {
    fn default() -> Self {
        CacheOption::Enabled(false)
    }
}

impl CacheOption {
    pub fn resolve(&self) -> Option<CacheConfig> {
        match self {
            CacheOption::Enabled(false) => None,
            CacheOption::Enabled(true) => Some(CacheConfig::default()),
            CacheOption::Detailed(cfg) => {
                if matches!(cfg.strategy, CacheStrategy::NoStore) {
                    None
                } else {
                    Some(cfg.clone())
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    Ttl,
    StaleWhileRevalidate,
    NoStore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_strategy")]
    pub strategy: CacheStrategy,

    /// Freshness window in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl: f64,

    /// Additional stale-while-revalidate window in seconds.
    #[serde(default)]
    pub swr: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: default_cache_strategy(),
            ttl: default_cache_ttl(),
            swr: 0.0,
        }
    }
}

fn default_cache_strategy() -> CacheStrategy {
    CacheStrategy::Ttl
}

fn default_cache_ttl() -> f64 {
    60.0
}

/// `cookies: true|false` or the detailed form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CookieOption {
    Enabled(bool),
    Detailed(CookieConfig),
}

impl Default for CookieOption {
    fn default() -> Self {
        CookieOption::Enabled(false)
    }
}

impl CookieOption {
    pub fn resolve(&self) -> Option<CookieConfig> {
        match self {
            CookieOption::Enabled(false) => None,
            CookieOption::Enabled(true) => Some(CookieConfig::default()),
            CookieOption::Detailed(cfg) => Some(cfg.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CookieConfig {
    /// Drop invalid Set-Cookie headers silently instead of logging them.
    #[serde(default)]
    pub ignore_invalid: bool,
}

impl ClientConfig {
    /// Reject configurations the pipeline cannot honor. Called once at
    /// client construction.
    pub fn validate(&self) -> Result<(), ClientError> {
        let timeout = self.timeout.resolve();
        for (name, value) in [
            ("timeout.request", timeout.request),
            ("timeout.connect", timeout.connect),
            ("timeout.response_start", timeout.response_start),
            ("timeout.between_bytes", timeout.between_bytes),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(ClientError::Config(format!(
                        "{} must be a non-negative number, got {}",
                        name, v
                    )));
                }
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(ClientError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.delay < 0.0 || !self.retry.delay.is_finite() {
            return Err(ClientError::Config(format!(
                "retry.delay must be a non-negative number, got {}",
                self.retry.delay
            )));
        }
        if self.retry.factor < 1.0 {
            return Err(ClientError::Config(format!(
                "retry.factor must be >= 1, got {}",
                self.retry.factor
            )));
        }

        let concurrency = self.concurrency.resolve();
        if concurrency.max == Some(0) {
            return Err(ClientError::Config("concurrency.max must be > 0".into()));
        }
        if concurrency.per_domain == Some(0) {
            return Err(ClientError::Config(
                "concurrency.per_domain must be > 0".into(),
            ));
        }
        if concurrency.requests_per_interval == Some(0) {
            return Err(ClientError::Config(
                "concurrency.requests_per_interval must be > 0".into(),
            ));
        }
        if concurrency.requests_per_interval.is_some() && concurrency.interval <= 0.0 {
            return Err(ClientError::Config(format!(
                "concurrency.interval must be > 0, got {}",
                concurrency.interval
            )));
        }
        if concurrency.runner.concurrency == 0 {
            return Err(ClientError::Config(
                "concurrency.runner.concurrency must be > 0".into(),
            ));
        }

        if let Some(cache) = self.cache.resolve() {
            if cache.ttl < 0.0 || cache.swr < 0.0 {
                return Err(ClientError::Config(
                    "cache.ttl and cache.swr must be non-negative".into(),
                ));
            }
        }

        if let Some(base) = &self.base_url {
            url::Url::parse(base)
                .map_err(|e| ClientError::Config(format!("invalid base_url \"{}\": {}", base, e)))?;
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_max_redirects() -> u32 {
    5
}
