//! Header conversion between hyper/reqwest header maps and [`Headers`].
//!
//! Repeated headers are joined with `, `, except `set-cookie` which is joined
//! with newlines so individual cookies survive the round trip.

use crate::route::Headers;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
use tracing::debug;

/// Headers that describe a single connection and never cross the proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

pub fn from_header_map(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        let Ok(value) = value.to_str() else {
            debug!("Dropping non-ASCII header {}", name);
            continue;
        };
        let separator = if name == SET_COOKIE { "\n" } else { ", " };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(separator);
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    headers
}

pub fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!("Dropping invalid header name {}", name);
            continue;
        };
        let values: Vec<&str> = if header_name == SET_COOKIE {
            value.lines().collect()
        } else {
            vec![value.as_str()]
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(v) => {
                    map.append(header_name.clone(), v);
                }
                Err(_) => debug!("Dropping invalid value for header {}", name),
            }
        }
    }
    map
}

/// Request headers safe to send upstream. Encodings are dropped so bodies
/// arrive uncompressed and can be rewritten.
pub fn for_upstream(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| {
            !is_hop_by_hop(name)
                && !matches!(name.as_str(), "host" | "content-length" | "accept-encoding")
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Response headers safe to hand back to the client with a buffered body.
pub fn for_client(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| {
            !is_hop_by_hop(name) && !matches!(name.as_str(), "content-length" | "content-encoding")
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_headers_are_joined() {
        let mut map = HeaderMap::new();
        map.append("accept", HeaderValue::from_static("text/html"));
        map.append("accept", HeaderValue::from_static("application/json"));
        map.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        map.append(SET_COOKIE, HeaderValue::from_static("b=2"));

        let headers = from_header_map(&map);
        assert_eq!(headers["accept"], "text/html, application/json");
        assert_eq!(headers["set-cookie"], "a=1\nb=2");

        let back = to_header_map(&headers);
        assert_eq!(back.get_all(SET_COOKIE).iter().count(), 2);
    }

    #[test]
    fn test_upstream_filter_drops_connection_headers() {
        let headers = Headers::from([
            ("host".to_string(), "x".to_string()),
            ("connection".to_string(), "keep-alive".to_string()),
            ("accept-encoding".to_string(), "gzip".to_string()),
            ("accept".to_string(), "*/*".to_string()),
        ]);
        let filtered = for_upstream(&headers);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("accept"));
    }

    #[test]
    fn test_client_filter_drops_length_and_encoding() {
        let headers = Headers::from([
            ("content-length".to_string(), "10".to_string()),
            ("content-encoding".to_string(), "gzip".to_string()),
            ("transfer-encoding".to_string(), "chunked".to_string()),
            ("content-type".to_string(), "text/html".to_string()),
        ]);
        let filtered = for_client(&headers);
        assert_eq!(filtered.keys().collect::<Vec<_>>(), vec!["content-type"]);
    }
}
