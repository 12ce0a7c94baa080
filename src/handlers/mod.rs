pub mod absolute;
pub mod connect;
pub mod mitm;
pub mod relative;

use indexmap::IndexMap;

use crate::cache::CacheEntry;
use crate::upstream::is_hop_by_hop;

/// Serialize a cache hit as a complete HTTP/1.1 response with the standard
/// `X-Cache: HIT` annotation.
pub fn render_cache_hit(entry: &CacheEntry, source: &str) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {} OK\r\n", entry.status_code);
    for (k, v) in &entry.headers {
        if is_hop_by_hop(k) || k.eq_ignore_ascii_case("content-length") {
            continue;
        }
        head.push_str(&format!("{k}: {v}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n", entry.body.len()));
    head.push_str("X-Cache: HIT\r\n");
    head.push_str("X-Proxy: Node-Proxy/1.0\r\n");
    head.push_str(&format!("X-Cache-Source: {source}\r\n"));
    head.push_str("Connection: close\r\n\r\n");

    let mut out = head.into_bytes();
    out.extend_from_slice(&entry.body);
    out
}

/// Serialize a freshly fetched origin response as a MISS, with the same
/// hop-by-hop filtering applied.
pub fn render_origin_response(
    status: u16,
    reason: &str,
    headers: &IndexMap<String, String>,
    body: &[u8],
    source: &str,
) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
    for (k, v) in headers {
        if is_hop_by_hop(k) || k.eq_ignore_ascii_case("content-length") {
            continue;
        }
        head.push_str(&format!("{k}: {v}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    head.push_str("X-Cache: MISS\r\n");
    head.push_str("X-Proxy: Node-Proxy/1.0\r\n");
    head.push_str(&format!("X-Cache-Source: {source}\r\n"));
    head.push_str("Connection: close\r\n\r\n");

    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}
