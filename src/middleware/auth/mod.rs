pub mod digest;
pub mod sigv4;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use http::header::AUTHORIZATION;
use http::{HeaderValue, StatusCode};
use tracing::warn;

use crate::error::ClientError;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

pub use digest::DigestAuth;
pub use sigv4::SigV4Auth;

fn auth_error(message: impl Into<String>, cause: Option<ClientError>) -> ClientError {
    ClientError::Auth {
        message: message.into(),
        cause: cause.map(Box::new),
    }
}

/// `Authorization: Basic …`, encoded once at construction.
pub struct BasicAuth {
    header: HeaderValue,
}

impl BasicAuth {
    pub fn new(username: &str, password: &str) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", username, password));
        let mut value = HeaderValue::from_str(&format!("Basic {}", encoded))
            .expect("base64 is always a valid header value");
        value.set_sensitive(true);
        Self { header: value }
    }
}

#[async_trait]
impl Middleware for BasicAuth {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, ClientError> {
        next.run(req.with_header(AUTHORIZATION, self.header.clone()))
            .await
    }
}

/// `Authorization: Bearer …` with a fixed token.
pub struct BearerAuth {
    header: HeaderValue,
}

impl BearerAuth {
    pub fn new(token: &str) -> Result<Self, ClientError> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| auth_error(format!("invalid bearer token: {}", e), None))?;
        value.set_sensitive(true);
        Ok(Self { header: value })
    }
}

#[async_trait]
impl Middleware for BearerAuth {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, ClientError> {
        next.run(req.with_header(AUTHORIZATION, self.header.clone()))
            .await
    }
}

/// Credential carried as a query parameter (`?api_key=…`).
pub struct QueryKeyAuth {
    param: String,
    value: String,
}

impl QueryKeyAuth {
    pub fn new(param: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
impl Middleware for QueryKeyAuth {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, ClientError> {
        let mut url = req.url().clone();
        let already_present = url.query_pairs().any(|(k, _)| k == self.param.as_str());
        if !already_present {
            url.query_pairs_mut().append_pair(&self.param, &self.value);
        }
        next.run(req.with_url(url)).await
    }
}

/// Source of short-lived bearer tokens (OAuth2 client credentials, cloud
/// identity pools, service accounts). `token` returns the current token;
/// `refresh` obtains a new one after a 401.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, ClientError>;
    async fn refresh(&self) -> Result<String, ClientError>;
}

/// Bearer auth over a refreshable token source. On a 401 the token is
/// refreshed once (behind a single-flight guard, so a burst of 401s causes
/// one refresh) and the request is re-sent exactly once. A failed refresh
/// surfaces the original 401 response rather than the refresh error.
pub struct TokenAuth {
    provider: Arc<dyn TokenProvider>,
    refresh_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl TokenAuth {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            provider,
            refresh_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    fn bearer(token: &str) -> Result<HeaderValue, ClientError> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| auth_error(format!("invalid token from provider: {}", e), None))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

#[async_trait]
impl Middleware for TokenAuth {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, ClientError> {
        let token = self
            .provider
            .token()
            .await
            .map_err(|e| auth_error("token acquisition failed", Some(e)))?;

        let template = req.try_duplicate();
        let resp = next
            .clone()
            .run(req.with_header(AUTHORIZATION, Self::bearer(&token)?))
            .await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        let Some(template) = template else {
            return Ok(resp);
        };

        // Single-flight: whoever holds the lock first refreshes; the rest
        // observe the bumped generation and reuse the result.
        let generation_before = self.generation.load(Ordering::Acquire);
        {
            let _guard = self.refresh_lock.lock().await;
            if self.generation.load(Ordering::Acquire) == generation_before {
                match self.provider.refresh().await {
                    Ok(_) => {
                        self.generation.fetch_add(1, Ordering::Release);
                    }
                    Err(e) => {
                        warn!(error = %e, "auth: token refresh failed, surfacing original 401");
                        return Ok(resp);
                    }
                }
            }
        }

        let refreshed = self
            .provider
            .token()
            .await
            .map_err(|e| auth_error("token acquisition failed after refresh", Some(e)))?;
        next.run(template.with_header(AUTHORIZATION, Self::bearer(&refreshed)?))
            .await
    }
}
