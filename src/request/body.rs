use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use rand::Rng;

use crate::error::ClientError;

/// A single-pass byte stream used as a request body. Not replayable: a retry
/// or 307/308 redirect that needs to resend it fails instead of silently
/// resending a truncated body.
pub struct BodyStream {
    pub(crate) inner: BoxStream<'static, Result<Bytes, ClientError>>,
    pub(crate) total: Option<u64>,
}

impl BodyStream {
    pub fn new<S>(stream: S, total: Option<u64>) -> Self
    where
        S: futures_util::Stream<Item = Result<Bytes, ClientError>> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
            total,
        }
    }

    /// Total size in bytes when known up front (drives Content-Length and
    /// progress percentages).
    pub fn total(&self) -> Option<u64> {
        self.total
    }
}

impl std::fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyStream").field("total", &self.total).finish()
    }
}

/// One part of a multipart/form-data body.
#[derive(Debug, Clone)]
pub struct Part {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl Part {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            content_type: None,
            data: Bytes::from(value.into()),
        }
    }

    pub fn bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            content_type: None,
            data: data.into(),
        }
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn content_type(mut self, ct: impl Into<String>) -> Self {
        self.content_type = Some(ct.into());
        self
    }
}

/// Request body. Every variant except `Stream` can be re-encoded for retries
/// and 307/308 redirects, and digested for dedup/cache fingerprints.
#[derive(Debug)]
pub enum Body {
    Empty,
    Bytes(Bytes),
    Text(String),
    /// URL-encoded key/value pairs (`application/x-www-form-urlencoded`).
    Form(Vec<(String, String)>),
    Multipart {
        boundary: String,
        parts: Vec<Part>,
    },
    /// Serialized with serde_json at dispatch time.
    Json(serde_json::Value),
    Stream(BodyStream),
}

impl Body {
    pub fn multipart(parts: Vec<Part>) -> Self {
        Body::Multipart {
            boundary: random_boundary(),
            parts,
        }
    }

    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, ClientError> {
        Ok(Body::Json(serde_json::to_value(value).map_err(|e| {
            ClientError::Config(format!("unserializable json body: {}", e))
        })?))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Whether the body bytes can be produced a second time.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Body::Stream(_))
    }

    /// A second copy for retry/redirect replay. `None` for single-pass
    /// streams.
    pub fn clone_for_replay(&self) -> Option<Body> {
        match self {
            Body::Empty => Some(Body::Empty),
            Body::Bytes(b) => Some(Body::Bytes(b.clone())),
            Body::Text(s) => Some(Body::Text(s.clone())),
            Body::Form(pairs) => Some(Body::Form(pairs.clone())),
            Body::Multipart { boundary, parts } => Some(Body::Multipart {
                boundary: boundary.clone(),
                parts: parts.clone(),
            }),
            Body::Json(v) => Some(Body::Json(v.clone())),
            Body::Stream(_) => None,
        }
    }

    /// The content type implied by the body shape, used when the caller did
    /// not set one explicitly.
    pub fn implied_content_type(&self) -> Option<String> {
        match self {
            Body::Empty | Body::Bytes(_) | Body::Stream(_) => None,
            Body::Text(_) => Some("text/plain; charset=utf-8".to_string()),
            Body::Form(_) => Some("application/x-www-form-urlencoded".to_string()),
            Body::Multipart { boundary, .. } => {
                Some(format!("multipart/form-data; boundary={}", boundary))
            }
            Body::Json(_) => Some("application/json".to_string()),
        }
    }

    /// Encode a replayable body to its wire bytes. `None` for streams.
    pub fn to_bytes(&self) -> Result<Option<Bytes>, ClientError> {
        match self {
            Body::Empty => Ok(Some(Bytes::new())),
            Body::Bytes(b) => Ok(Some(b.clone())),
            Body::Text(s) => Ok(Some(Bytes::copy_from_slice(s.as_bytes()))),
            Body::Form(pairs) => {
                let mut ser = url::form_urlencoded::Serializer::new(String::new());
                for (k, v) in pairs {
                    ser.append_pair(k, v);
                }
                Ok(Some(Bytes::from(ser.finish())))
            }
            Body::Multipart { boundary, parts } => {
                Ok(Some(encode_multipart(boundary, parts)))
            }
            Body::Json(v) => {
                let buf = serde_json::to_vec(v)
                    .map_err(|e| ClientError::Config(format!("json body: {}", e)))?;
                Ok(Some(Bytes::from(buf)))
            }
            Body::Stream(_) => Ok(None),
        }
    }

    /// Known total size in bytes, when determinable without consuming.
    pub fn content_length(&self) -> Result<Option<u64>, ClientError> {
        match self {
            Body::Stream(s) => Ok(s.total()),
            _ => Ok(self.to_bytes()?.map(|b| b.len() as u64)),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Empty
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Bytes(b)
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(v))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Text(s)
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::Text(s.to_string())
    }
}

impl From<serde_json::Value> for Body {
    fn from(v: serde_json::Value) -> Self {
        Body::Json(v)
    }
}

fn encode_multipart(boundary: &str, parts: &[Part]) -> Bytes {
    let mut buf = BytesMut::new();
    for part in parts {
        buf.extend_from_slice(b"--");
        buf.extend_from_slice(boundary.as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(b"Content-Disposition: form-data; name=\"");
        buf.extend_from_slice(part.name.as_bytes());
        buf.extend_from_slice(b"\"");
        if let Some(filename) = &part.filename {
            buf.extend_from_slice(b"; filename=\"");
            buf.extend_from_slice(filename.as_bytes());
            buf.extend_from_slice(b"\"");
        }
        buf.extend_from_slice(b"\r\n");
        if let Some(ct) = &part.content_type {
            buf.extend_from_slice(b"Content-Type: ");
            buf.extend_from_slice(ct.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(&part.data);
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"--");
    buf.extend_from_slice(boundary.as_bytes());
    buf.extend_from_slice(b"--\r\n");
    buf.freeze()
}

fn random_boundary() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let tail: String = (0..24)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("courier-{}", tail)
}
