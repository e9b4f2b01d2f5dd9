use std::sync::Arc;

use async_trait::async_trait;
use http::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION, PROXY_AUTHORIZATION,
    TRANSFER_ENCODING,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tracing::debug;
use url::Url;

use crate::cookie::Jar;
use crate::error::ClientError;
use crate::middleware::cookies::ingest_set_cookies;
use crate::middleware::{Middleware, Next};
use crate::request::{Body, Request};
use crate::response::Response;

/// One pending hop, handed to the `before_redirect` hook.
#[derive(Debug, Clone)]
pub struct RedirectInfo {
    pub from: Url,
    pub to: Url,
    pub status: StatusCode,
    /// Headers as they will be sent on the next hop (after any
    /// cross-origin stripping).
    pub headers: HeaderMap,
    /// 1-based hop number.
    pub hop: u32,
}

pub enum RedirectDecision {
    Follow,
    /// Abort the request with `RedirectRejected`.
    Reject,
    /// Follow, but to this URL instead (absolute, or relative to the
    /// original target).
    ReplaceUrl(String),
}

pub type BeforeRedirectHook = dyn Fn(&RedirectInfo) -> RedirectDecision + Send + Sync;

/// Headers never carried across a cross-origin hop.
const SENSITIVE_HEADERS: &[HeaderName] = &[AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION];

/// Follows 3xx responses: rebuilds the URL against the current effective
/// URL, reshapes method and body per status, strips credentials on
/// cross-origin hops, and re-attaches jar cookies for the new origin.
pub struct RedirectMiddleware {
    jar: Option<Arc<Jar>>,
    ignore_invalid_cookies: bool,
}

impl RedirectMiddleware {
    pub fn new(jar: Option<Arc<Jar>>, ignore_invalid_cookies: bool) -> Self {
        Self {
            jar,
            ignore_invalid_cookies,
        }
    }
}

#[async_trait]
impl Middleware for RedirectMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, ClientError> {
        if !req.follow_redirects {
            return next.run(req).await;
        }

        let max_redirects = req.max_redirects;
        let hook = req.before_redirect.clone();
        let mut visited = vec![req.url().clone()];
        let mut hops: u32 = 0;
        let mut current = req;

        loop {
            let template = current.try_duplicate();
            let resp = next.clone().run(current).await?;

            if !resp.status().is_redirection() {
                return Ok(resp);
            }
            let location = match resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
            {
                Some(l) => l.to_string(),
                // A 3xx without Location (304 among others) is terminal.
                None => return Ok(resp),
            };

            hops += 1;
            if hops > max_redirects {
                return Err(ClientError::TooManyRedirects { hops, visited });
            }

            let from = resp.url().clone();
            let mut target = from.join(&location).map_err(|e| {
                ClientError::Protocol(format!("unresolvable location \"{}\": {}", location, e))
            })?;
            if visited.contains(&target) {
                // Revisiting a hop is a loop; charge it against the budget.
                return Err(ClientError::TooManyRedirects { hops, visited });
            }

            let status = resp.status();
            let method = template
                .as_ref()
                .map(|t| t.method().clone())
                .unwrap_or(Method::GET);

            // 303 (and 301/302 on non-GET/HEAD) demote to a bodyless GET;
            // 307/308 resend the method and body verbatim.
            let (next_method, next_body) = match status.as_u16() {
                303 => {
                    if method == Method::HEAD {
                        (Method::HEAD, Body::Empty)
                    } else {
                        (Method::GET, Body::Empty)
                    }
                }
                301 | 302 => {
                    if method == Method::GET || method == Method::HEAD {
                        match template.as_ref().and_then(|t| t.body().clone_for_replay()) {
                            Some(body) => (method.clone(), body),
                            None => return Err(ClientError::NonReplayableRedirect),
                        }
                    } else {
                        (Method::GET, Body::Empty)
                    }
                }
                307 | 308 => match template.as_ref().and_then(|t| t.body().clone_for_replay()) {
                    Some(body) => (method.clone(), body),
                    None => return Err(ClientError::NonReplayableRedirect),
                },
                _ => return Ok(resp),
            };

            let template = match template {
                Some(t) => t,
                None => return Err(ClientError::NonReplayableRedirect),
            };

            // Intermediate hop cookies still count.
            if let Some(jar) = &self.jar {
                ingest_set_cookies(jar, &resp, self.ignore_invalid_cookies);
            }

            let mut headers = template.headers().clone();
            let body_dropped = matches!(next_body, Body::Empty) && !template.body().is_empty();
            if body_dropped {
                headers.remove(CONTENT_LENGTH);
                headers.remove(CONTENT_TYPE);
                headers.remove(TRANSFER_ENCODING);
            }
            if is_cross_origin(&from, &target) {
                for name in SENSITIVE_HEADERS {
                    headers.remove(name);
                }
            }
            if let Some(jar) = &self.jar {
                headers.remove(COOKIE);
                if let Some(value) = jar
                    .cookie_header_for(&target)
                    .and_then(|v| HeaderValue::from_str(&v).ok())
                {
                    headers.insert(COOKIE, value);
                }
            }

            if let Some(hook) = &hook {
                let info = RedirectInfo {
                    from: from.clone(),
                    to: target.clone(),
                    status,
                    headers: headers.clone(),
                    hop: hops,
                };
                match hook(&info) {
                    RedirectDecision::Follow => {}
                    RedirectDecision::Reject => {
                        return Err(ClientError::RedirectRejected { url: target });
                    }
                    RedirectDecision::ReplaceUrl(replacement) => {
                        target = target.join(&replacement).map_err(|e| {
                            ClientError::Protocol(format!(
                                "unresolvable replacement \"{}\": {}",
                                replacement, e
                            ))
                        })?;
                    }
                }
            }

            debug!(
                from = %from,
                to = %target,
                status = status.as_u16(),
                hop = hops,
                "redirect: following"
            );
            metrics::counter!("courier_redirects_total").increment(1);

            visited.push(target.clone());
            let mut next_req = template
                .duplicate_with_body(next_body)
                .with_method(next_method)
                .with_url(target);
            next_req.headers = headers;
            current = next_req;
        }
    }
}

fn is_cross_origin(a: &Url, b: &Url) -> bool {
    a.scheme() != b.scheme()
        || a.host_str() != b.host_str()
        || a.port_or_known_default() != b.port_or_known_default()
}
