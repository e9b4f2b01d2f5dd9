use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use http::{HeaderValue, StatusCode};
use md5::{Digest, Md5};
use rand::Rng;
use tracing::debug;

use crate::error::ClientError;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

/// HTTP Digest authentication (RFC 7616, MD5, qop="auth").
///
/// The first 401 challenge is answered with exactly one retry. The
/// challenge is then kept, so subsequent requests authenticate
/// preemptively with an incremented nonce count. The nc counter is keyed
/// by `(realm, uri)`.
pub struct DigestAuth {
    username: String,
    password: String,
    challenge: Mutex<Option<Challenge>>,
    nonce_counts: DashMap<(String, String), u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Challenge {
    realm: String,
    nonce: String,
    qop: Option<String>,
    opaque: Option<String>,
    algorithm: String,
}

impl DigestAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            challenge: Mutex::new(None),
            nonce_counts: DashMap::new(),
        }
    }

    fn authorization(&self, method: &str, uri: &str, challenge: &Challenge) -> String {
        let nc = {
            let mut entry = self
                .nonce_counts
                .entry((challenge.realm.clone(), uri.to_string()))
                .or_insert(0);
            *entry += 1;
            *entry
        };
        let cnonce = random_cnonce();

        let ha1 = md5_hex(&format!(
            "{}:{}:{}",
            self.username, challenge.realm, self.password
        ));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));

        let uses_auth_qop = challenge
            .qop
            .as_deref()
            .map(|q| q.split(',').any(|t| t.trim() == "auth"))
            .unwrap_or(false);

        let response = if uses_auth_qop {
            md5_hex(&format!(
                "{}:{}:{:08x}:{}:auth:{}",
                ha1, challenge.nonce, nc, cnonce, ha2
            ))
        } else {
            md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2))
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            self.username, challenge.realm, challenge.nonce, uri, response
        );
        if uses_auth_qop {
            header.push_str(&format!(", qop=auth, nc={:08x}, cnonce=\"{}\"", nc, cnonce));
        }
        if let Some(opaque) = &challenge.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        header.push_str(&format!(", algorithm={}", challenge.algorithm));
        header
    }
}

#[async_trait]
impl Middleware for DigestAuth {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, ClientError> {
        let uri = request_uri(&req);
        let method = req.method().as_str().to_string();

        // Preemptive: reuse the last challenge when one is cached.
        let cached = self.challenge.lock().unwrap().clone();
        let req = match &cached {
            Some(challenge) => {
                let header = self.authorization(&method, &uri, challenge);
                req.with_header(AUTHORIZATION, sensitive_value(&header)?)
            }
            None => req,
        };

        let template = req.try_duplicate();
        let resp = next.clone().run(req).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let challenge = match resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge)
        {
            Some(c) => c,
            None => return Ok(resp),
        };
        let Some(template) = template else {
            return Ok(resp);
        };
        // A fresh challenge means a fresh nonce: answering with a stale one
        // in the preemptive path was what earned the 401.
        if cached.as_ref() == Some(&challenge) {
            return Ok(resp);
        }
        *self.challenge.lock().unwrap() = Some(challenge.clone());

        debug!(uri = %uri, realm = %challenge.realm, "auth: answering digest challenge");
        let header = self.authorization(&method, &uri, &challenge);
        next.run(template.with_header(AUTHORIZATION, sensitive_value(&header)?))
            .await
    }
}

fn sensitive_value(s: &str) -> Result<HeaderValue, ClientError> {
    let mut value = HeaderValue::from_str(s).map_err(|e| ClientError::Auth {
        message: format!("unencodable digest header: {}", e),
        cause: None,
    })?;
    value.set_sensitive(true);
    Ok(value)
}

fn request_uri(req: &Request) -> String {
    match req.url().query() {
        Some(q) => format!("{}?{}", req.url().path(), q),
        None => req.url().path().to_string(),
    }
}

/// Parse a `WWW-Authenticate: Digest …` challenge. Comma-splitting honors
/// quoted values.
fn parse_challenge(header: &str) -> Option<Challenge> {
    let rest = header.trim();
    if rest.len() < 6 || !rest[..6].eq_ignore_ascii_case("digest") {
        return None;
    }
    let rest = &rest[6..];

    let mut realm = None;
    let mut nonce = None;
    let mut qop = None;
    let mut opaque = None;
    let mut algorithm = "MD5".to_string();

    for part in split_quoted(rest) {
        let part = part.trim();
        let (key, value) = match part.find('=') {
            Some(pos) => (part[..pos].trim(), part[pos + 1..].trim().trim_matches('"')),
            None => continue,
        };
        match key.to_ascii_lowercase().as_str() {
            "realm" => realm = Some(value.to_string()),
            "nonce" => nonce = Some(value.to_string()),
            "qop" => qop = Some(value.to_string()),
            "opaque" => opaque = Some(value.to_string()),
            "algorithm" => algorithm = value.to_string(),
            _ => {}
        }
    }

    Some(Challenge {
        realm: realm?,
        nonce: nonce?,
        qop,
        opaque,
        algorithm,
    })
}

/// Split on commas that are outside double quotes.
fn split_quoted(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, b) in s.bytes().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b',' if !in_quotes => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn md5_hex(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    let mut out = String::with_capacity(32);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn random_cnonce() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            char::from_digit(n as u32, 16).unwrap()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConcurrencyConfig;
    use crate::scheduler::Scheduler;
    use crate::transport::Transport;
    use bytes::Bytes;
    use http::HeaderMap;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use url::Url;

    #[test]
    fn test_md5_hex_known_vector() {
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_parse_challenge() {
        let c = parse_challenge(
            "Digest realm=\"api\", nonce=\"n1\", qop=\"auth\", opaque=\"o1\", algorithm=MD5",
        )
        .unwrap();
        assert_eq!(c.realm, "api");
        assert_eq!(c.nonce, "n1");
        assert_eq!(c.qop.as_deref(), Some("auth"));
        assert_eq!(c.opaque.as_deref(), Some("o1"));
        assert_eq!(c.algorithm, "MD5");

        assert!(parse_challenge("Bearer realm=\"api\"").is_none());
        assert!(parse_challenge("Digest nonce=\"n\"").is_none());
    }

    #[test]
    fn test_parse_challenge_with_quoted_comma() {
        let c = parse_challenge("Digest realm=\"a, b\", nonce=\"n\"").unwrap();
        assert_eq!(c.realm, "a, b");
    }

    #[test]
    fn test_rfc7616_response_computation() {
        // RFC 2617 §3.5 example, which RFC 7616 carries forward for MD5.
        let ha1 = md5_hex("Mufasa:testrealm@host.com:Circle Of Life");
        let ha2 = md5_hex("GET:/dir/index.html");
        let response = md5_hex(&format!(
            "{}:dcd98b7102dd2f0e8b11d0f600bfb0c093:00000001:0a4f113b:auth:{}",
            ha1, ha2
        ));
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_nc_increments_per_realm_uri() {
        let auth = DigestAuth::new("u", "p");
        let challenge = Challenge {
            realm: "r".into(),
            nonce: "n".into(),
            qop: Some("auth".into()),
            opaque: None,
            algorithm: "MD5".into(),
        };
        let first = auth.authorization("GET", "/secure", &challenge);
        let second = auth.authorization("GET", "/secure", &challenge);
        let other_uri = auth.authorization("GET", "/other", &challenge);
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
        assert!(other_uri.contains("nc=00000001"));
    }

    /// 401s until it sees a Digest authorization with the right shape.
    struct DigestGate {
        seen: StdMutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl Transport for DigestGate {
        async fn dispatch(&self, req: Request) -> Result<Response, ClientError> {
            let auth = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            let ok = auth
                .as_deref()
                .map(|a| a.starts_with("Digest username=\"user\"") && a.contains("response=\""))
                .unwrap_or(false);
            self.seen.lock().unwrap().push(auth);

            let mut headers = HeaderMap::new();
            if !ok {
                headers.insert(
                    WWW_AUTHENTICATE,
                    HeaderValue::from_static("Digest realm=\"r\", nonce=\"n\", qop=\"auth\""),
                );
            }
            Ok(Response::from_bytes(
                if ok {
                    StatusCode::OK
                } else {
                    StatusCode::UNAUTHORIZED
                },
                headers,
                req.url().clone(),
                Bytes::new(),
            ))
        }
    }

    #[tokio::test]
    async fn test_challenge_then_preemptive() {
        let transport = Arc::new(DigestGate {
            seen: StdMutex::new(Vec::new()),
        });
        let scheduler = Arc::new(Scheduler::new(
            &ConcurrencyConfig::default(),
            transport.clone(),
        ));
        let auth = Arc::new(DigestAuth::new("user", "pass"));
        let chain: Arc<[Arc<dyn Middleware>]> = Arc::from(vec![auth as Arc<dyn Middleware>]);

        let url = Url::parse("https://h.test/secure").unwrap();
        let resp = Next::new(chain.clone(), scheduler.clone())
            .run(Request::get(url.clone()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = Next::new(chain, scheduler)
            .run(Request::get(url))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let seen = transport.seen.lock().unwrap();
        // Dispatch 1: unauthenticated. Dispatch 2: challenge answer with
        // nc=00000001 and uri. Dispatch 3: preemptive with nc=00000002.
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], None);
        let challenge_answer = seen[1].as_deref().unwrap();
        assert!(challenge_answer.contains("realm=\"r\""));
        assert!(challenge_answer.contains("nonce=\"n\""));
        assert!(challenge_answer.contains("uri=\"/secure\""));
        assert!(challenge_answer.contains("qop=auth"));
        assert!(challenge_answer.contains("nc=00000001"));
        let preemptive = seen[2].as_deref().unwrap();
        assert!(preemptive.contains("nc=00000002"));
    }

    #[tokio::test]
    async fn test_stale_challenge_does_not_loop() {
        // Server rejects even correct-shaped credentials: after one retry
        // the 401 is returned as-is.
        struct AlwaysChallenge;
        #[async_trait]
        impl Transport for AlwaysChallenge {
            async fn dispatch(&self, req: Request) -> Result<Response, ClientError> {
                let mut headers = HeaderMap::new();
                headers.insert(
                    WWW_AUTHENTICATE,
                    HeaderValue::from_static("Digest realm=\"r\", nonce=\"n\", qop=\"auth\""),
                );
                Ok(Response::from_bytes(
                    StatusCode::UNAUTHORIZED,
                    headers,
                    req.url().clone(),
                    Bytes::new(),
                ))
            }
        }
        let scheduler = Arc::new(Scheduler::new(
            &ConcurrencyConfig::default(),
            Arc::new(AlwaysChallenge),
        ));
        let chain: Arc<[Arc<dyn Middleware>]> =
            Arc::from(vec![
                Arc::new(DigestAuth::new("user", "pass")) as Arc<dyn Middleware>
            ]);
        let resp = Next::new(chain, scheduler)
            .run(Request::get(Url::parse("https://h.test/secure").unwrap()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
