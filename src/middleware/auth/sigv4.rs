use std::time::SystemTime;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderName, HeaderValue};
use sha2::{Digest, Sha256};

use crate::error::ClientError;
use crate::middleware::{Middleware, Next};
use crate::request::{Body, Request};
use crate::response::Response;

type HmacSha256 = Hmac<Sha256>;

const X_AMZ_DATE: HeaderName = HeaderName::from_static("x-amz-date");
const X_AMZ_CONTENT_SHA256: HeaderName = HeaderName::from_static("x-amz-content-sha256");
const X_AMZ_SECURITY_TOKEN: HeaderName = HeaderName::from_static("x-amz-security-token");

/// AWS Signature Version 4 request signing: canonical request, string to
/// sign, HMAC-SHA256 key derivation chain, `Authorization` header. Stream
/// bodies sign as UNSIGNED-PAYLOAD since their bytes cannot be digested
/// ahead of sending.
pub struct SigV4Auth {
    access_key: String,
    secret_key: String,
    region: String,
    service: String,
    session_token: Option<String>,
}

impl SigV4Auth {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: region.into(),
            service: service.into(),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }
}

#[async_trait]
impl Middleware for SigV4Auth {
    async fn handle(&self, req: Request, next: Next) -> Result<Response, ClientError> {
        let signed = self.sign(req, SystemTime::now())?;
        next.run(signed).await
    }
}

impl SigV4Auth {
    fn sign(&self, req: Request, now: SystemTime) -> Result<Request, ClientError> {
        let host = match (req.url().host_str(), req.url().port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(ClientError::Auth {
                    message: "sigv4 requires a host".into(),
                    cause: None,
                })
            }
        };

        let (amz_date, date) = format_amz_date(now);
        let payload_hash = match req.body() {
            Body::Stream(_) => "UNSIGNED-PAYLOAD".to_string(),
            body => {
                let bytes = body.to_bytes()?.unwrap_or_default();
                sha256_hex(&bytes)
            }
        };

        // Signed headers: host, the amz headers added here, and the content
        // type when the request carries one.
        let mut signed: Vec<(String, String)> = vec![
            ("host".into(), host.clone()),
            ("x-amz-content-sha256".into(), payload_hash.clone()),
            ("x-amz-date".into(), amz_date.clone()),
        ];
        if let Some(token) = &self.session_token {
            signed.push(("x-amz-security-token".into(), token.clone()));
        }
        if let Some(ct) = req.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
            signed.push(("content-type".into(), ct.trim().to_string()));
        }
        signed.sort();

        let canonical_headers: String = signed
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();
        let signed_names = signed
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            req.method().as_str(),
            canonical_path(req.url().path()),
            canonical_query(req.url()),
            canonical_headers,
            signed_names,
            payload_hash
        );

        let scope = format!("{}/{}/{}/aws4_request", date, self.region, self.service);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let key = derive_signing_key(&self.secret_key, &date, &self.region, &self.service);
        let signature = hex(&hmac(&key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, signed_names, signature
        );

        let mut auth_value =
            HeaderValue::from_str(&authorization).map_err(|e| ClientError::Auth {
                message: format!("unencodable sigv4 header: {}", e),
                cause: None,
            })?;
        auth_value.set_sensitive(true);

        let mut req = req
            .with_header(X_AMZ_DATE, HeaderValue::from_str(&amz_date).unwrap())
            .with_header(
                X_AMZ_CONTENT_SHA256,
                HeaderValue::from_str(&payload_hash).unwrap(),
            )
            .with_header(AUTHORIZATION, auth_value);
        if let Some(token) = &self.session_token {
            req = req.with_header(
                X_AMZ_SECURITY_TOKEN,
                HeaderValue::from_str(token).map_err(|e| ClientError::Auth {
                    message: format!("unencodable session token: {}", e),
                    cause: None,
                })?,
            );
        }
        Ok(req)
    }
}

/// kSigning = HMAC(HMAC(HMAC(HMAC("AWS4"+secret, date), region), service), "aws4_request")
fn derive_signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex(&Sha256::digest(data))
}

fn hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0xf) as usize] as char);
    }
    out
}

/// The URL path is already percent-encoded by the `Url` parser; an empty
/// path canonicalizes to "/".
fn canonical_path(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

/// Query pairs sorted by name then value, re-encoded with the sigv4
/// unreserved set.
fn canonical_query(url: &url::Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (aws_encode(&k), aws_encode(&v)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn aws_encode(s: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len());
    for b in s.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(*b as char)
            }
            _ => {
                out.push('%');
                out.push(HEX[(b >> 4) as usize] as char);
                out.push(HEX[(b & 0xf) as usize] as char);
            }
        }
    }
    out
}

/// `YYYYMMDD'T'HHMMSS'Z'` and `YYYYMMDD` from a wall-clock instant.
fn format_amz_date(now: SystemTime) -> (String, String) {
    let secs = now
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let days = secs.div_euclid(86_400);
    let tod = secs.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    let date = format!("{:04}{:02}{:02}", year, month, day);
    let amz = format!(
        "{}T{:02}{:02}{:02}Z",
        date,
        tod / 3600,
        (tod % 3600) / 60,
        tod % 60
    );
    (amz, date)
}

/// Days-since-epoch to proleptic Gregorian (y, m, d).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if month <= 2 { year + 1 } else { year }, month, day)
}
