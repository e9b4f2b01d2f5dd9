use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use http::HeaderMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;

/// Reset values above this are epoch seconds, below it seconds-from-now.
const EPOCH_THRESHOLD: f64 = 1e8;

/// Per-domain pauses derived from rate-limit response headers. Applied to
/// every response whose headers parse, independent of any configuration
/// flag: a server saying "back off" is honored.
pub struct AdaptivePauses {
    pauses: DashMap<String, Instant>,
}

impl AdaptivePauses {
    pub fn new() -> Self {
        Self {
            pauses: DashMap::new(),
        }
    }

    /// Suspend until the domain's pause (if any) has elapsed. Pauses set
    /// while sleeping extend the wait.
    pub async fn wait(&self, domain: &str, cancel: &CancellationToken) -> Result<(), ClientError> {
        loop {
            let until = match self.pauses.get(domain) {
                Some(entry) => *entry.value(),
                None => return Ok(()),
            };
            let now = Instant::now();
            if until <= now {
                self.pauses.remove_if(domain, |_, v| *v <= now);
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep_until(until) => {}
                _ = cancel.cancelled() => return Err(ClientError::ScheduleCancelled),
            }
        }
    }

    /// Parse rate-limit headers off a completed response and record a pause
    /// when the server asked for one: 429/503 with `Retry-After`, or a
    /// remaining count of 0 with a reset in the future.
    pub fn observe(&self, domain: &str, status: u16, headers: &HeaderMap) {
        let retry_after = headers
            .get(http::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        let reset = header_value(headers, &["ratelimit-reset", "x-ratelimit-reset"])
            .and_then(parse_reset);

        let remaining = header_value(headers, &["ratelimit-remaining", "x-ratelimit-remaining"])
            .and_then(|v| v.trim().parse::<u64>().ok());

        let pause = if matches!(status, 429 | 503) && retry_after.is_some() {
            retry_after
        } else if remaining == Some(0) {
            reset.filter(|d| !d.is_zero())
        } else {
            None
        };

        if let Some(delta) = pause {
            let until = Instant::now() + delta;
            let mut entry = self.pauses.entry(domain.to_string()).or_insert(until);
            if *entry < until {
                *entry = until;
            }
            drop(entry);

            tracing::debug!(
                domain = %domain,
                status = status,
                pause_ms = %delta.as_millis(),
                "scheduler: adaptive pause"
            );
            metrics::counter!(
                "courier_adaptive_pauses_total",
                "domain" => domain.to_string(),
            )
            .increment(1);
        }
    }

    #[cfg(test)]
    pub fn pause_remaining(&self, domain: &str) -> Option<Duration> {
        // tokio's duration_since saturates at zero.
        self.pauses
            .get(domain)
            .map(|e| e.value().duration_since(Instant::now()))
    }
}

impl Default for AdaptivePauses {
    fn default() -> Self {
        Self::new()
    }
}

fn header_value<'a>(headers: &'a HeaderMap, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|n| headers.get(*n))
        .and_then(|v| v.to_str().ok())
}

/// `Retry-After`: delta seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    Some(
        when.duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

/// `RateLimit-Reset` / `X-RateLimit-Reset`: epoch seconds when the value is
/// large enough to be a timestamp, otherwise seconds-from-now.
pub fn parse_reset(value: &str) -> Option<Duration> {
    let raw = value.trim().parse::<f64>().ok()?;
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    if raw > EPOCH_THRESHOLD {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .ok()?
            .as_secs_f64();
        let delta = raw - now;
        if delta <= 0.0 {
            return Some(Duration::ZERO);
        }
        return Some(Duration::from_secs_f64(delta));
    }
    Some(Duration::from_secs_f64(raw))
}
