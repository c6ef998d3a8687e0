//! Outbound request transformation
//!
//! Every forward rotates the User-Agent, appends the optional static header,
//! and — when obfuscation is enabled — replaces the body with an encoded
//! frame and the header set with noise headers so no proxy-added metadata
//! leaks in cleartext.

use super::ProxyError;
use crate::obfuscation::{self, Direction, Obfuscator};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, USER_AGENT};
use http::request::Parts;
use http::{HeaderMap, Uri};
use tracing::{info, warn};

/// Pool of User-Agent values rotated across outbound requests
pub(crate) const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.1 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:89.0) Gecko/20100101 Firefox/89.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36 Edg/123.0.2420.81",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36 OPR/109.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.4; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4_1) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4.1 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4_1) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36 OPR/109.0.0.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux i686; rv:124.0) Gecko/20100101 Firefox/124.0",
];

/// Decoy header names installed when obfuscation replaces the header set
pub(crate) const NOISE_HEADER_NAMES: [&str; 4] = [
    "x-proxy-token",
    "x-connection-hash",
    "x-routing-key",
    "x-timestamp",
];

/// Pick a User-Agent uniformly at random from the pool
pub(crate) fn random_user_agent() -> &'static str {
    let mut buf = [0u8; 4];
    if obfuscation::random_bytes(&mut buf).is_err() {
        return USER_AGENTS[0];
    }
    USER_AGENTS[u32::from_be_bytes(buf) as usize % USER_AGENTS.len()]
}

/// Transform an outbound request in place, returning the body to forward
pub(crate) fn transform(
    parts: &mut Parts,
    body: Bytes,
    destination: &Uri,
    static_header: Option<&str>,
    obfuscator: Option<&Obfuscator>,
) -> Result<Bytes, ProxyError> {
    parts.uri = destination.clone();

    // Hop-by-hop and length headers are the transport's business
    parts.headers.remove(CONNECTION);
    parts.headers.remove(CONTENT_LENGTH);

    parts
        .headers
        .insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));

    if let Some(raw) = static_header {
        match parse_static_header(raw) {
            Some((name, value)) => {
                parts.headers.append(name, value);
            }
            None => warn!("invalid static header format, skipping: {}", raw),
        }
    }

    info!("forwarding request: {} {}", parts.method, parts.uri);

    if let Some(obfuscator) = obfuscator {
        let encoded = obfuscator.encode(Direction::Request, &body)?;
        apply_noise_headers(&mut parts.headers)?;
        return Ok(Bytes::from(encoded));
    }

    Ok(body)
}

/// Parse a `Name: value` static header string
pub(crate) fn parse_static_header(raw: &str) -> Option<(HeaderName, HeaderValue)> {
    let (name, value) = raw.split_once(':')?;
    let name = HeaderName::from_bytes(name.trim().as_bytes()).ok()?;
    let value = HeaderValue::from_str(value.trim()).ok()?;
    Some((name, value))
}

/// Replace the entire header set with randomly valued decoy headers
///
/// The Host header survives for routing; nothing else does.
fn apply_noise_headers(headers: &mut HeaderMap) -> Result<(), ProxyError> {
    let host = headers.get(HOST).cloned();
    headers.clear();

    if let Some(host) = host {
        headers.insert(HOST, host);
    }

    for name in NOISE_HEADER_NAMES {
        let value = obfuscation::random_alphanumeric(32)?;
        let value = HeaderValue::from_str(&value).map_err(http::Error::from)?;
        headers.insert(HeaderName::from_static(name), value);
    }

    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::JitterRange;
    use http::Request;

    fn request_parts() -> Parts {
        let (parts, ()) = Request::builder()
            .uri("http://inbound.example/path")
            .header(HOST, "inbound.example")
            .header("x-secret", "do-not-forward")
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    #[test]
    fn test_user_agent_from_pool() {
        for _ in 0..32 {
            let agent = random_user_agent();
            assert!(USER_AGENTS.contains(&agent));
        }
    }

    #[test]
    fn test_transform_sets_destination_and_agent() {
        let mut parts = request_parts();
        let destination: Uri = "http://upstream.example:9000/path".parse().unwrap();

        let body = transform(&mut parts, Bytes::new(), &destination, None, None).unwrap();

        assert!(body.is_empty());
        assert_eq!(parts.uri, destination);
        let agent = parts.headers.get(USER_AGENT).unwrap().to_str().unwrap();
        assert!(USER_AGENTS.contains(&agent));
    }

    #[test]
    fn test_static_header_appended() {
        let mut parts = request_parts();
        let destination: Uri = "http://upstream.example/".parse().unwrap();

        transform(
            &mut parts,
            Bytes::new(),
            &destination,
            Some("X-Env: staging"),
            None,
        )
        .unwrap();

        assert_eq!(parts.headers.get("x-env").unwrap(), "staging");
    }

    #[test]
    fn test_malformed_static_header_skipped() {
        let mut parts = request_parts();
        let destination: Uri = "http://upstream.example/".parse().unwrap();
        let before = parts.headers.len();

        transform(
            &mut parts,
            Bytes::new(),
            &destination,
            Some("no-colon-here"),
            None,
        )
        .unwrap();

        // Only the User-Agent was added
        assert_eq!(parts.headers.len(), before + 1);
    }

    #[test]
    fn test_noise_headers_replace_everything() {
        let mut parts = request_parts();
        let destination: Uri = "http://upstream.example/".parse().unwrap();
        let obfuscator = crate::obfuscation::Obfuscator::new()
            .unwrap()
            .with_jitter(JitterRange { min: 0, max: 0 });

        let body = transform(
            &mut parts,
            Bytes::from_static(b"ping"),
            &destination,
            None,
            Some(&obfuscator),
        )
        .unwrap();

        assert!(parts.headers.get("x-secret").is_none());
        assert!(parts.headers.get(USER_AGENT).is_none());
        assert_eq!(parts.headers.get(HOST).unwrap(), "inbound.example");
        assert_eq!(
            parts.headers.get(CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
        for name in NOISE_HEADER_NAMES {
            let value = parts.headers.get(name).unwrap().to_str().unwrap();
            assert_eq!(value.len(), 32);
        }

        // The encoded body must not contain the plaintext
        assert!(!body
            .windows(4)
            .any(|window| window == b"ping"));
    }
}
