use indexmap::IndexMap;
use tokio::io::{AsyncWriteExt, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::cachekey::CacheKey;
use crate::error::{ProxyError, ProxyResult};
use crate::handlers::{render_cache_hit, render_origin_response};
use crate::http1::{read_body, read_request_head};
use crate::state::AppState;
use crate::upstream::fetch_https;
use crate::whitelist::Match;

/// Terminate TLS directly on the client socket using a CA-signed leaf
/// certificate for `connect_host`, parse the inner HTTP/1.1 request, and
/// serve it from cache or by fetching the true origin.
///
/// Runs TLS directly over the client socket rather than spinning up a
/// separate acceptor and splicing a second hop.
pub async fn terminate(
    state: &AppState,
    connect_host: &str,
    connect_port: u16,
    client: &mut TcpStream,
) -> ProxyResult<()> {
    let acceptor = state.ca.acceptor()?;
    let mut tls = acceptor
        .accept(client)
        .await
        .map_err(|e| ProxyError::TlsInterceptionFailure(format!("TLS handshake with client: {e}")))?;

    if let Err(e) = serve_one_exchange(state, connect_host, connect_port, &mut tls).await {
        warn!(host = connect_host, %e, "MITM exchange failed");
        let _ = tls.write_all(&e.to_wire_response()).await;
    }
    let _ = tls.shutdown().await;
    Ok(())
}

async fn serve_one_exchange<S: AsyncRead + AsyncWrite + Unpin>(
    state: &AppState,
    connect_host: &str,
    connect_port: u16,
    tls: &mut S,
) -> ProxyResult<()> {
    let mut buf = Vec::new();
    let head = read_request_head(tls, &mut buf).await?;
    let host = head.header("host").unwrap_or(connect_host).to_string();
    let body = read_body(tls, buf, &head.headers).await?;

    let eligible = matches!(state.whitelist.is_eligible(&host), Match::Exact | Match::Regex(_));
    let full_url = format!("https://{host}{}", head.target);

    if head.method == "GET" && eligible {
        let key = CacheKey::parse(&full_url, None)?;
        if let Some(entry) = state.cache.lookup(&key) {
            state.stats.record_https_hit();
            let response = render_cache_hit(&entry, "cache");
            tls.write_all(&response)
                .await
                .map_err(|e| ProxyError::Internal(format!("writing cached response: {e}")))?;
            tls.flush().await.ok();
            return Ok(());
        }
        state.stats.record_https_miss();
        debug!(host, path = %head.target, "MITM cache miss, fetching origin");

        let mut forward_headers = IndexMap::new();
        for (k, v) in &head.headers {
            forward_headers.insert(k.clone(), v.clone());
        }

        let origin_port = if connect_host == host { connect_port } else { 443 };
        let (resp_head, resp_body) =
            fetch_https(&host, origin_port, "GET", &head.target, &forward_headers, &body).await?;

        if resp_head.status == 200 {
            if let Err(e) = state.cache.store(&key, 200, &resp_head.headers, &resp_body) {
                tracing::warn!(host, %e, "failed to persist cache entry");
            } else {
                state.stats.record_https_save();
            }
        }

        let response = render_origin_response(
            resp_head.status,
            &resp_head.reason,
            &resp_head.headers,
            &resp_body,
            "direct",
        );
        tls.write_all(&response)
            .await
            .map_err(|e| ProxyError::Internal(format!("writing origin response: {e}")))?;
        tls.flush().await.ok();
        return Ok(());
    }

    // Non-GET or non-eligible host: forward without touching the cache.
    let mut forward_headers = IndexMap::new();
    for (k, v) in &head.headers {
        forward_headers.insert(k.clone(), v.clone());
    }
    let origin_port = if connect_host == host { connect_port } else { 443 };
    let (resp_head, resp_body) = fetch_https(
        &host,
        origin_port,
        &head.method,
        &head.target,
        &forward_headers,
        &body,
    )
    .await?;

    let mut response = format!("HTTP/1.1 {} {}\r\n", resp_head.status, resp_head.reason);
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

    tls.write_all(&out)
        .await
        .map_err(|e| ProxyError::Internal(format!("writing passthrough response: {e}")))?;
    tls.flush().await.ok();
    Ok(())
}
