use std::sync::Arc;

use async_trait::async_trait;
use http::header::{COOKIE, SET_COOKIE};
use http::HeaderValue;
use tracing::warn;

use crate::cookie::{Cookie, Jar};
use crate::error::ClientError;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

/// Attaches `Cookie:` from the jar before dispatch and ingests `Set-Cookie`
/// afterwards. Invalid cookies never fail the request; they are logged
/// unless the jar was configured to ignore them silently.
pub struct CookieMiddleware {
    jar: Arc<Jar>,
    ignore_invalid: bool,
}

impl CookieMiddleware {
    pub fn new(jar: Arc<Jar>, ignore_invalid: bool) -> Self {
        Self { jar, ignore_invalid }
    }

    pub fn jar(&self) -> &Arc<Jar> {
        &self.jar
    }
}

#[async_trait]
impl Middleware for CookieMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, ClientError> {
        // An explicitly set Cookie header wins over the jar.
        let req = if req.headers().contains_key(COOKIE) {
            req
        } else {
            match self
                .jar
                .cookie_header_for(req.url())
                .and_then(|v| HeaderValue::from_str(&v).ok())
            {
                Some(value) => req.with_header(COOKIE, value),
                None => req,
            }
        };

        let resp = next.run(req).await?;
        ingest_set_cookies(&self.jar, &resp, self.ignore_invalid);
        Ok(resp)
    }
}

/// Store every Set-Cookie on `resp` into the jar, matched against the
/// response's effective URL.
pub(crate) fn ingest_set_cookies(jar: &Jar, resp: &Response, ignore_invalid: bool) {
    for value in resp.headers().get_all(SET_COOKIE) {
        let raw = match value.to_str() {
            Ok(v) => v,
            Err(_) => {
                if !ignore_invalid {
                    warn!(url = %resp.url(), "cookies: non-ascii set-cookie header dropped");
                }
                continue;
            }
        };
        match Cookie::parse(raw, resp.url()) {
            Some(cookie) => jar.set(cookie),
            None => {
                if !ignore_invalid {
                    warn!(url = %resp.url(), header = %raw, "cookies: invalid set-cookie dropped");
                }
            }
        }
    }
}
