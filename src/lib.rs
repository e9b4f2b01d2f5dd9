//! courier: a composable async HTTP client.
//!
//! The execution core is an onion of middlewares around a pooled hyper
//! transport: dedup → cache → cookies → auth → user middlewares → retry →
//! redirect → progress → scheduler → transport. Requests are immutable
//! values, responses stream lazily with typed decode surfaces (bytes, text,
//! JSON, SSE, download progress), and a per-client scheduler enforces
//! global/per-domain concurrency, token-bucket rate limiting, and pauses
//! the server asks for.
//!
//! ```no_run
//! use courier::{Client, ClientConfig};
//!
//! # async fn run() -> Result<(), courier::ClientError> {
//! let config: ClientConfig = serde_json::from_str(
//!     r#"{
//!         "base_url": "https://api.example.com",
//!         "retry": {"max_attempts": 3, "backoff": "exponential", "delay": 0.1},
//!         "concurrency": {"max": 16, "per_domain": 4}
//!     }"#,
//! ).unwrap();
//! let client = Client::new(config)?;
//!
//! let user: serde_json::Value = client.get("/users/1").json().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod cookie;
pub mod error;
pub mod fingerprint;
pub mod middleware;
pub mod request;
pub mod response;
pub mod scheduler;
pub mod transport;

pub use client::{BatchOptions, BatchOutcome, BatchStats, Client, ClientBuilder, RequestPromise};
pub use config::{
    BackoffKind, CacheConfig, CacheStrategy, ClientConfig, ConcurrencyConfig, Connections,
    CookieConfig, JitterKind, RetryConfig, TimeoutConfig,
};
pub use cookie::{Cookie, Jar, Priority, SameSite};
pub use error::{ClientError, DecodeKind, TimeoutCategory};
pub use middleware::auth::{
    BasicAuth, BearerAuth, DigestAuth, QueryKeyAuth, SigV4Auth, TokenAuth, TokenProvider,
};
pub use middleware::cache::{CacheEntry, CacheStore, InMemoryCache};
pub use middleware::progress::{ProgressCallback, ProgressDirection, ProgressEvent};
pub use middleware::redirect::{BeforeRedirectHook, RedirectDecision, RedirectInfo};
pub use middleware::retry::{RetryOutcome, RetryPredicate};
pub use middleware::{Middleware, Next};
pub use request::{Body, BodyStream, Part, Request};
pub use response::sse::{SseEvent, SseStream};
pub use response::{ByteStream, Response};
pub use transport::{HyperTransport, Transport};
