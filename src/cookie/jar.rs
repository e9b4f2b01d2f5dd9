use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// One stored cookie. `(name, domain, path)` is the unique key within a jar.
#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    /// Set when the Set-Cookie had no Domain attribute: the cookie matches
    /// the origin host exactly, never subdomains.
    pub host_only: bool,
    pub path: String,
    pub expires: Option<SystemTime>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
    pub partitioned: bool,
    pub priority: Priority,
    pub creation_time: SystemTime,
    pub last_access_time: SystemTime,
}

impl Cookie {
    /// Parse one Set-Cookie header value against the request it arrived on.
    /// Returns `None` for values the jar must reject (empty name, Domain
    /// not covering the request host).
    pub fn parse(header: &str, request_url: &Url) -> Option<Cookie> {
        let host = request_url.host_str()?.to_ascii_lowercase();
        let mut segments = header.split(';');

        let pair = segments.next()?.trim();
        let eq = pair.find('=')?;
        let name = pair[..eq].trim();
        if name.is_empty() {
            return None;
        }
        let raw_value = pair[eq + 1..].trim().trim_matches('"');
        let value = if raw_value.contains('%') {
            percent_decode(raw_value).unwrap_or_else(|| raw_value.to_string())
        } else {
            raw_value.to_string()
        };

        let now = SystemTime::now();
        let mut cookie = Cookie {
            name: name.to_string(),
            value,
            domain: host.clone(),
            host_only: true,
            path: default_path(request_url),
            expires: None,
            max_age: None,
            secure: false,
            http_only: false,
            same_site: None,
            partitioned: false,
            priority: Priority::Medium,
            creation_time: now,
            last_access_time: now,
        };

        for segment in segments {
            let segment = segment.trim();
            let (attr, value) = match segment.find('=') {
                Some(pos) => (segment[..pos].trim(), Some(segment[pos + 1..].trim())),
                None => (segment, None),
            };
            match attr.to_ascii_lowercase().as_str() {
                "domain" => {
                    let requested = value.unwrap_or("").trim_start_matches('.').to_ascii_lowercase();
                    if requested.is_empty() {
                        continue;
                    }
                    if !domain_covers(&requested, &host) {
                        // Domain that does not cover the origin host: the
                        // whole cookie is rejected, not just the attribute.
                        return None;
                    }
                    cookie.domain = requested;
                    cookie.host_only = false;
                }
                "path" => {
                    if let Some(p) = value {
                        if p.starts_with('/') {
                            cookie.path = p.to_string();
                        }
                    }
                }
                "expires" => {
                    if let Some(v) = value {
                        if let Ok(when) = httpdate::parse_http_date(v) {
                            cookie.expires = Some(when);
                        }
                    }
                }
                "max-age" => {
                    // Non-integer values are ignored; zero or negative means
                    // expire immediately.
                    if let Some(Ok(secs)) = value.map(|v| v.parse::<i64>()) {
                        cookie.max_age = Some(secs);
                    }
                }
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "samesite" => {
                    cookie.same_site = match value.map(|v| v.to_ascii_lowercase()).as_deref() {
                        Some("strict") => Some(SameSite::Strict),
                        Some("lax") => Some(SameSite::Lax),
                        Some("none") => Some(SameSite::None),
                        _ => cookie.same_site,
                    };
                }
                "partitioned" => cookie.partitioned = true,
                "priority" => {
                    cookie.priority = match value.map(|v| v.to_ascii_lowercase()).as_deref() {
                        Some("low") => Priority::Low,
                        Some("high") => Priority::High,
                        _ => Priority::Medium,
                    };
                }
                _ => {}
            }
        }

        Some(cookie)
    }

    /// Max-Age wins over Expires; neither makes a session cookie.
    pub fn expired_at(&self, now: SystemTime) -> bool {
        if let Some(max_age) = self.max_age {
            if max_age <= 0 {
                return true;
            }
            return self.creation_time + Duration::from_secs(max_age as u64) <= now;
        }
        if let Some(expires) = self.expires {
            return expires <= now;
        }
        false
    }

    pub fn is_expired(&self) -> bool {
        self.expired_at(SystemTime::now())
    }

    /// Serialize back to a Set-Cookie value. `parse` of the result yields an
    /// equivalent cookie (modulo attribute ordering and defaults).
    pub fn to_set_cookie_string(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if !self.host_only {
            out.push_str("; Domain=");
            out.push_str(&self.domain);
        }
        out.push_str("; Path=");
        out.push_str(&self.path);
        if let Some(expires) = self.expires {
            out.push_str("; Expires=");
            out.push_str(&httpdate::fmt_http_date(expires));
        }
        if let Some(max_age) = self.max_age {
            out.push_str("; Max-Age=");
            out.push_str(&max_age.to_string());
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        match self.same_site {
            Some(SameSite::Strict) => out.push_str("; SameSite=Strict"),
            Some(SameSite::Lax) => out.push_str("; SameSite=Lax"),
            Some(SameSite::None) => out.push_str("; SameSite=None"),
            None => {}
        }
        if self.partitioned {
            out.push_str("; Partitioned");
        }
        match self.priority {
            Priority::Low => out.push_str("; Priority=Low"),
            Priority::Medium => {}
            Priority::High => out.push_str("; Priority=High"),
        }
        out
    }

    fn matches(&self, url: &Url, now: SystemTime) -> bool {
        if self.expired_at(now) {
            return false;
        }
        if self.secure && url.scheme() != "https" {
            return false;
        }
        let host = match url.host_str() {
            Some(h) => h.to_ascii_lowercase(),
            None => return false,
        };
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_covers(&self.domain, &host)
        };
        domain_ok && path_matches(&self.path, url.path())
    }

    fn key(&self) -> (String, String, String) {
        (self.name.clone(), self.domain.clone(), self.path.clone())
    }
}

/// `domain` covers `host` when equal, or when `host` is a subdomain of it.
/// A dotless domain (e.g. a bare TLD) only ever covers itself.
fn domain_covers(domain: &str, host: &str) -> bool {
    if domain == host {
        return true;
    }
    if !domain.contains('.') {
        return false;
    }
    host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

/// RFC 6265 default-path: the request path up to its last slash.
fn default_path(url: &Url) -> String {
    let path = url.path();
    if !path.starts_with('/') {
        return "/".to_string();
    }
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => path[..pos].to_string(),
    }
}

fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    if cookie_path == request_path {
        return true;
    }
    if request_path.starts_with(cookie_path) {
        return cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/');
    }
    false
}

fn percent_decode(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = hex_digit(*bytes.get(i + 1)?)?;
            let lo = hex_digit(*bytes.get(i + 2)?)?;
            out.push(hi << 4 | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// In-memory cookie jar. All operations serialize on the jar mutex.
pub struct Jar {
    inner: Mutex<HashMap<(String, String, String), Cookie>>,
}

impl Jar {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace. Storing an already-expired cookie deletes any
    /// existing cookie under the same key (the Max-Age=0 eviction idiom).
    pub fn set(&self, cookie: Cookie) {
        let mut inner = self.inner.lock().unwrap();
        let key = cookie.key();
        if cookie.is_expired() {
            inner.remove(&key);
            return;
        }
        // Replacing keeps the original creation time, per RFC 6265 §5.3.
        if let Some(existing) = inner.get(&key) {
            let mut cookie = cookie;
            cookie.creation_time = existing.creation_time;
            inner.insert(key, cookie);
        } else {
            inner.insert(key, cookie);
        }
    }

    /// All cookies applying to `url`, longest path first, older first within
    /// equal paths. Expired cookies are dropped on the way out.
    pub fn get_cookies_for(&self, url: &Url) -> Vec<Cookie> {
        let now = SystemTime::now();
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|_, c| !c.expired_at(now));

        let mut matched: Vec<&mut Cookie> = inner
            .values_mut()
            .filter(|c| c.matches(url, now))
            .collect();
        matched.sort_by(|a, b| {
            b.path
                .len()
                .cmp(&a.path.len())
                .then(a.creation_time.cmp(&b.creation_time))
        });
        matched
            .into_iter()
            .map(|c| {
                c.last_access_time = now;
                c.clone()
            })
            .collect()
    }

    /// The `Cookie:` header value for `url`, if any cookie applies.
    pub fn cookie_header_for(&self, url: &Url) -> Option<String> {
        let cookies = self.get_cookies_for(url);
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn get_all(&self) -> Vec<Cookie> {
        let now = SystemTime::now();
        let inner = self.inner.lock().unwrap();
        inner
            .values()
            .filter(|c| !c.expired_at(now))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    /// Remove cookies stored for `domain` and its subdomains.
    pub fn clear_domain(&self, domain: &str) {
        let domain = domain.to_ascii_lowercase();
        self.inner
            .lock()
            .unwrap()
            .retain(|_, c| c.domain != domain && !domain_covers(&domain, &c.domain));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

impl Default for Jar {
    fn default() -> Self {
        Self::new()
    }
}
