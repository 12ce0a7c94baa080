use indexmap::IndexMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::cachekey::CacheKey;
use crate::error::{ProxyError, ProxyResult};
use crate::handlers::{render_cache_hit, render_origin_response};
use crate::http1::{read_body, RequestHead};
use crate::state::AppState;
use crate::upstream::fetch_http;
use crate::whitelist::Match;

/// Serve a traditional `METHOD /path HTTP/1.1` request with a `Host` header.
/// Caching is only attempted for `GET` against a whitelisted host; every
/// other combination is a plain forward with no `X-Cache` header.
pub async fn handle<S: AsyncRead + AsyncWrite + Unpin>(
    state: &AppState,
    head: &RequestHead,
    leftover: Vec<u8>,
    client: &mut S,
) -> ProxyResult<()> {
    let host_header = head
        .header("host")
        .ok_or_else(|| ProxyError::BadRequest("Host header is required".into()))?
        .to_string();
    let (host, port) = split_host_port(&host_header, 80);

    let eligible = matches!(state.whitelist.is_eligible(&host), Match::Exact | Match::Regex(_));
    let body = read_body(client, leftover, &head.headers).await?;

    if head.method == "GET" && eligible {
        let key = CacheKey::parse(&head.target, Some(&host_header))?;
        if let Some(entry) = state.cache.lookup(&key) {
            state.stats.record_http_hit();
            let response = render_cache_hit(&entry, "cache");
            client
                .write_all(&response)
                .await
                .map_err(|e| ProxyError::Internal(format!("writing cached response: {e}")))?;
            client.flush().await.ok();
            return Ok(());
        }
        state.stats.record_http_miss();
        debug!(host, path = %head.target, "relative-form cache miss, forwarding");

        let mut forward_headers = IndexMap::new();
        for (k, v) in &head.headers {
            forward_headers.insert(k.clone(), v.clone());
        }

        let (resp_head, resp_body) =
            fetch_http(&host, port, &head.method, &head.target, &forward_headers, &body).await?;

        if resp_head.status == 200 {
            if let Err(e) = state.cache.store(&key, 200, &resp_head.headers, &resp_body) {
                tracing::warn!(host, %e, "failed to persist cache entry");
            }
        }

        let response = render_origin_response(
            resp_head.status,
            &resp_head.reason,
            &resp_head.headers,
            &resp_body,
            "direct",
        );
        client
            .write_all(&response)
            .await
            .map_err(|e| ProxyError::Internal(format!("writing origin response: {e}")))?;
        client.flush().await.ok();
        return Ok(());
    }

    // Not cache-eligible: forward unchanged, no X-Cache header, no cache I/O.
    let mut forward_headers = IndexMap::new();
    for (k, v) in &head.headers {
        forward_headers.insert(k.clone(), v.clone());
    }
    let (resp_head, resp_body) =
        fetch_http(&host, port, &head.method, &head.target, &forward_headers, &body).await?;

    let mut response = format!(
        "HTTP/1.1 {} {}\r\n",
        resp_head.status, resp_head.reason
    );
    for (k, v) in &resp_head.headers {
        if crate::upstream::is_hop_by_hop(k) || k.eq_ignore_ascii_case("content-length") {
            continue;
        }
        response.push_str(&format!("{k}: {v}\r\n"));
    }
    response.push_str(&format!("Content-Length: {}\r\n", resp_body.len()));
    response.push_str("Connection: close\r\n\r\n");
    let mut out = response.into_bytes();
    out.extend_from_slice(&resp_body);

    client
        .write_all(&out)
        .await
        .map_err(|e| ProxyError::Internal(format!("writing passthrough response: {e}")))?;
    client.flush().await.ok();
    Ok(())
}

fn split_host_port(host_header: &str, default_port: u16) -> (String, u16) {
    match host_header.rsplit_once(':') {
        Some((h, p)) => match p.parse::<u16>() {
            Ok(port) => (h.to_string(), port),
            Err(_) => (host_header.to_string(), default_port),
        },
        None => (host_header.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_explicit_port() {
        assert_eq!(split_host_port("example.com:8080", 80), ("example.com".to_string(), 8080));
    }

    #[test]
    fn defaults_port_when_absent() {
        assert_eq!(split_host_port("example.com", 80), ("example.com".to_string(), 80));
    }
}
