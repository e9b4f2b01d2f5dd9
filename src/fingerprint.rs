use http::header::CONTENT_TYPE;
use sha2::{Digest, Sha256};

use crate::request::Request;

/// Canonical identity of a request, used as the dedup and cache key:
/// method + URL with sorted query pairs + content type + SHA-256 of the
/// body bytes. Requests with single-pass stream bodies have no fingerprint
/// and bypass dedup/cache.
pub fn fingerprint(req: &Request) -> Option<String> {
    let body_bytes = req.body().to_bytes().ok()??;

    let mut url = req.url().clone();
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &pairs {
            ser.append_pair(k, v);
        }
        url.set_query(Some(&ser.finish()));
    }
    url.set_fragment(None);

    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let digest = Sha256::digest(&body_bytes);

    let mut out = String::with_capacity(url.as_str().len() + 96);
    out.push_str(req.method().as_str());
    out.push(' ');
    out.push_str(url.as_str());
    out.push_str(" ct=");
    out.push_str(content_type);
    out.push_str(" body=");
    push_hex(&mut out, &digest);
    Some(out)
}

fn push_hex(out: &mut String, bytes: &[u8]) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0xf) as usize] as char);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Body, BodyStream};
    use url::Url;

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[test]
    fn test_query_order_is_canonical() {
        let a = fingerprint(&get("https://h.test/p?b=2&a=1")).unwrap();
        let b = fingerprint(&get("https://h.test/p?a=1&b=2")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_urls_differ() {
        let a = fingerprint(&get("https://h.test/p?a=1")).unwrap();
        let b = fingerprint(&get("https://h.test/p?a=2")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_body_contributes() {
        let a = fingerprint(&get("https://h.test/p").with_body("one")).unwrap();
        let b = fingerprint(&get("https://h.test/p").with_body("two")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_stream_bodies_have_no_fingerprint() {
        let req = get("https://h.test/p")
            .with_body(Body::Stream(BodyStream::new(futures_util::stream::empty(), None)));
        assert!(fingerprint(&req).is_none());
    }

    #[test]
    fn test_fragment_ignored() {
        let a = fingerprint(&get("https://h.test/p#frag")).unwrap();
        let b = fingerprint(&get("https://h.test/p")).unwrap();
        assert_eq!(a, b);
    }
}
