use http::{HeaderMap, HeaderName};

/// Hop-by-hop headers per RFC 7230 §6.1. Meaningful only for a single
/// transport-level connection, never end-to-end.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Strips hop-by-hop headers from a request or response before it crosses
/// the proxy boundary.
///
/// In addition to the fixed RFC 7230 §6.1 list, every token named in the
/// `Connection` header's value is removed — a client may nominate
/// additional connection-scoped headers dynamically (e.g.
/// `Connection: close, X-Private`).
pub fn scrub(headers: &mut HeaderMap) {
    let mut dynamic: Vec<String> = Vec::new();
    for value in headers.get_all(http::header::CONNECTION) {
        if let Ok(s) = value.to_str() {
            for tok in s.split(',') {
                let tok = tok.trim();
                if !tok.is_empty() {
                    dynamic.push(tok.to_string());
                }
            }
        }
    }

    for name in &dynamic {
        if let Ok(name) = name.parse::<HeaderName>() {
            headers.remove(name);
        }
    }

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn removes_fixed_hop_by_hop_set() {
        let mut h = HeaderMap::new();
        h.insert("Connection", HeaderValue::from_static("close"));
        h.insert("Proxy-Connection", HeaderValue::from_static("keep-alive"));
        h.insert("Keep-Alive", HeaderValue::from_static("timeout=5"));
        h.insert("Transfer-Encoding", HeaderValue::from_static("chunked"));
        h.insert("Upgrade", HeaderValue::from_static("websocket"));
        h.insert("X-Custom", HeaderValue::from_static("keep-me"));

        scrub(&mut h);

        assert!(h.get("Connection").is_none());
        assert!(h.get("Proxy-Connection").is_none());
        assert!(h.get("Keep-Alive").is_none());
        assert!(h.get("Transfer-Encoding").is_none());
        assert!(h.get("Upgrade").is_none());
        assert_eq!(h.get("X-Custom").unwrap(), "keep-me");
    }

    #[test]
    fn removes_headers_named_in_connection_value() {
        let mut h = HeaderMap::new();
        h.insert(
            "Connection",
            HeaderValue::from_static("close, X-Private, X-Also-Private"),
        );
        h.insert("X-Private", HeaderValue::from_static("secret"));
        h.insert("X-Also-Private", HeaderValue::from_static("secret2"));
        h.insert("X-Public", HeaderValue::from_static("ok"));

        scrub(&mut h);

        assert!(h.get("X-Private").is_none());
        assert!(h.get("X-Also-Private").is_none());
        assert_eq!(h.get("X-Public").unwrap(), "ok");
    }

    #[test]
    fn idempotent() {
        let mut h = HeaderMap::new();
        h.insert("Connection", HeaderValue::from_static("close"));
        h.insert("X-Custom", HeaderValue::from_static("value"));
        scrub(&mut h);
        scrub(&mut h);
        assert_eq!(h.get("X-Custom").unwrap(), "value");
        assert!(h.get("Connection").is_none());
    }

    #[test]
    fn preserves_duplicate_headers_in_order() {
        let mut h = HeaderMap::new();
        h.append("X-Multi", HeaderValue::from_static("a"));
        h.append("X-Multi", HeaderValue::from_static("b"));
        scrub(&mut h);
        let values: Vec<_> = h.get_all("X-Multi").iter().collect();
        assert_eq!(values, vec!["a", "b"]);
    }
}
