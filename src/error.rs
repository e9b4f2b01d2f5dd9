use std::fmt;

use http::StatusCode;
use url::Url;

use crate::response::Response;

/// Which timeout budget expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCategory {
    /// The whole-request deadline (connect through last body byte).
    Request,
    Connect,
    /// Waiting for the response head (status line + headers).
    ResponseStart,
    /// Gap between two body chunks.
    BetweenBytes,
}

impl fmt::Display for TimeoutCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutCategory::Request => write!(f, "request"),
            TimeoutCategory::Connect => write!(f, "connect"),
            TimeoutCategory::ResponseStart => write!(f, "response-start"),
            TimeoutCategory::BetweenBytes => write!(f, "between-bytes"),
        }
    }
}

/// Which decode surface failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeKind {
    Json,
    Sse,
    Text,
    Gzip,
}

impl fmt::Display for DecodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeKind::Json => write!(f, "json"),
            DecodeKind::Sse => write!(f, "sse"),
            DecodeKind::Text => write!(f, "text"),
            DecodeKind::Gzip => write!(f, "gzip"),
        }
    }
}

#[derive(Debug)]
pub enum ClientError {
    /// Invalid configuration (negative timeout, zero interval, ...).
    Config(String),
    /// The caller cancelled the request (or a deadline cancelled it).
    Cancelled,
    Timeout(TimeoutCategory),
    Connect(String),
    Dns(String),
    Tls(String),
    /// Malformed HTTP framing from the peer.
    Protocol(String),
    /// Non-2xx status while `throw_on_http_error` is set. Materialized only
    /// at the outer edge of the pipeline; intermediate stages see raw
    /// responses.
    Http {
        status: StatusCode,
        response: Box<Response>,
    },
    TooManyRedirects {
        hops: u32,
        visited: Vec<Url>,
    },
    /// The `before_redirect` hook vetoed a hop.
    RedirectRejected {
        url: Url,
    },
    /// 307/308 redirect needed to resend a body that cannot be replayed.
    NonReplayableRedirect,
    /// A retry was due but the body is a single-pass stream.
    NonReplayableBody,
    Decode {
        kind: DecodeKind,
        message: String,
    },
    BodyAlreadyConsumed,
    Auth {
        message: String,
        cause: Option<Box<ClientError>>,
    },
    /// Cancellation fired while waiting for scheduler admission.
    ScheduleCancelled,
    /// Feature not available in this build.
    Unsupported(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Config(msg) => write!(f, "config error: {}", msg),
            ClientError::Cancelled => write!(f, "request cancelled"),
            ClientError::Timeout(cat) => write!(f, "timeout ({})", cat),
            ClientError::Connect(msg) => write!(f, "connect error: {}", msg),
            ClientError::Dns(msg) => write!(f, "dns error: {}", msg),
            ClientError::Tls(msg) => write!(f, "tls error: {}", msg),
            ClientError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            ClientError::Http { status, .. } => write!(f, "http error: status {}", status),
            ClientError::TooManyRedirects { hops, .. } => {
                write!(f, "too many redirects ({} hops)", hops)
            }
            ClientError::RedirectRejected { url } => write!(f, "redirect rejected: {}", url),
            ClientError::NonReplayableRedirect => {
                write!(f, "redirect requires replaying a non-replayable body")
            }
            ClientError::NonReplayableBody => {
                write!(f, "retry requires replaying a non-replayable body")
            }
            ClientError::Decode { kind, message } => {
                write!(f, "decode error ({}): {}", kind, message)
            }
            ClientError::BodyAlreadyConsumed => write!(f, "response body already consumed"),
            ClientError::Auth { message, .. } => write!(f, "auth error: {}", message),
            ClientError::ScheduleCancelled => write!(f, "cancelled while waiting for admission"),
            ClientError::Unsupported(msg) => write!(f, "unsupported: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Auth { cause, .. } => cause
                .as_deref()
                .map(|c| c as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl ClientError {
    /// `true` for failures that happened before any response head arrived.
    /// These are the transport-level conditions the retry engine treats as
    /// network errors.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Connect(_)
                | ClientError::Dns(_)
                | ClientError::Tls(_)
                | ClientError::Timeout(TimeoutCategory::Connect)
                | ClientError::Timeout(TimeoutCategory::ResponseStart)
        )
    }

    /// The response attached to an `Http` error, if any.
    pub fn response(&self) -> Option<&Response> {
        match self {
            ClientError::Http { response, .. } => Some(response),
            _ => None,
        }
    }

    /// Re-create the same error kind for a second awaiter. Deduplicated
    /// requests publish one failure to every joiner; payloads that cannot be
    /// shared (a live response body) are rebuilt empty.
    pub(crate) fn duplicate(&self) -> ClientError {
        match self {
            ClientError::Config(m) => ClientError::Config(m.clone()),
            ClientError::Cancelled => ClientError::Cancelled,
            ClientError::Timeout(c) => ClientError::Timeout(*c),
            ClientError::Connect(m) => ClientError::Connect(m.clone()),
            ClientError::Dns(m) => ClientError::Dns(m.clone()),
            ClientError::Tls(m) => ClientError::Tls(m.clone()),
            ClientError::Protocol(m) => ClientError::Protocol(m.clone()),
            ClientError::Http { status, response } => ClientError::Http {
                status: *status,
                response: Box::new(Response::synthetic(*status, response.url().clone())),
            },
            ClientError::TooManyRedirects { hops, visited } => ClientError::TooManyRedirects {
                hops: *hops,
                visited: visited.clone(),
            },
            ClientError::RedirectRejected { url } => {
                ClientError::RedirectRejected { url: url.clone() }
            }
            ClientError::NonReplayableRedirect => ClientError::NonReplayableRedirect,
            ClientError::NonReplayableBody => ClientError::NonReplayableBody,
            ClientError::Decode { kind, message } => ClientError::Decode {
                kind: *kind,
                message: message.clone(),
            },
            ClientError::BodyAlreadyConsumed => ClientError::BodyAlreadyConsumed,
            ClientError::Auth { message, cause } => ClientError::Auth {
                message: message.clone(),
                cause: cause.as_ref().map(|c| Box::new(c.duplicate())),
            },
            ClientError::ScheduleCancelled => ClientError::ScheduleCancelled,
            ClientError::Unsupported(m) => ClientError::Unsupported(m.clone()),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Decode {
            kind: DecodeKind::Json,
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_kind() {
        let e = ClientError::Timeout(TimeoutCategory::BetweenBytes);
        assert_eq!(e.to_string(), "timeout (between-bytes)");

        let e = ClientError::Decode {
            kind: DecodeKind::Sse,
            message: "truncated frame".into(),
        };
        assert_eq!(e.to_string(), "decode error (sse): truncated frame");
    }

    #[test]
    fn test_transport_classification() {
        assert!(ClientError::Connect("refused".into()).is_transport());
        assert!(ClientError::Timeout(TimeoutCategory::Connect).is_transport());
        assert!(ClientError::Timeout(TimeoutCategory::ResponseStart).is_transport());
        assert!(!ClientError::Timeout(TimeoutCategory::BetweenBytes).is_transport());
        assert!(!ClientError::BodyAlreadyConsumed.is_transport());
    }

    #[test]
    fn test_auth_source_chain() {
        let e = ClientError::Auth {
            message: "token refresh failed".into(),
            cause: Some(Box::new(ClientError::Connect("reset".into()))),
        };
        let src = std::error::Error::source(&e).expect("cause");
        assert_eq!(src.to_string(), "connect error: reset");
    }

    #[test]
    fn test_duplicate_preserves_kind() {
        let e = ClientError::Dns("nxdomain".into());
        match e.duplicate() {
            ClientError::Dns(m) => assert_eq!(m, "nxdomain"),
            other => panic!("unexpected: {}", other),
        }
    }
}
