use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::danger::NoServerVerification;
use crate::error::{ProxyError, ProxyResult};
use crate::http1::{read_response_body, read_response_head, ResponseHead};

const UPSTREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Hop-by-hop headers that must never be relayed verbatim in either
/// direction through the MITM or relative-form paths.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "transfer-encoding" | "keep-alive" | "proxy-connection" | "upgrade"
    )
}

fn build_request(
    method: &str,
    path: &str,
    host: &str,
    extra_headers: &IndexMap<String, String>,
    body: &[u8],
) -> Vec<u8> {
    let mut out = format!("{method} {path} HTTP/1.1\r\nHost: {host}\r\n");
    let mut saw_user_agent = false;
    let mut saw_accept = false;
    let mut saw_accept_encoding = false;

    for (k, v) in extra_headers {
        if is_hop_by_hop(k) || k.eq_ignore_ascii_case("host") {
            continue;
        }
        if k.eq_ignore_ascii_case("user-agent") {
            saw_user_agent = true;
        }
        if k.eq_ignore_ascii_case("accept") {
            saw_accept = true;
        }
        if k.eq_ignore_ascii_case("accept-encoding") {
            saw_accept_encoding = true;
        }
        out.push_str(&format!("{k}: {v}\r\n"));
    }

    if !saw_user_agent {
        out.push_str("User-Agent: Mozilla/5.0 ProxyAgent/1.0\r\n");
    }
    if !saw_accept {
        out.push_str("Accept: */*\r\n");
    }
    if !saw_accept_encoding {
        out.push_str("Accept-Encoding: identity\r\n");
    }
    if !body.is_empty() {
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    out.push_str("Connection: close\r\n\r\n");

    let mut buf = out.into_bytes();
    buf.extend_from_slice(body);
    buf
}

/// Fetch over plain TCP (used by the origin-form handler for `http://`).
pub async fn fetch_http(
    host: &str,
    port: u16,
    method: &str,
    path: &str,
    headers: &IndexMap<String, String>,
    body: &[u8],
) -> ProxyResult<(ResponseHead, Vec<u8>)> {
    let request = build_request(method, path, host, headers, body);

    let connect = TcpStream::connect((host, port));
    let mut stream = timeout(UPSTREAM_IDLE_TIMEOUT, connect)
        .await
        .map_err(|_| ProxyError::UpstreamTimeout)?
        .map_err(|e| ProxyError::UpstreamUnreachable(format!("{host}:{port}: {e}")))?;

    timeout(UPSTREAM_IDLE_TIMEOUT, stream.write_all(&request))
        .await
        .map_err(|_| ProxyError::UpstreamTimeout)?
        .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;

    read_response(&mut stream).await
}

/// Fetch over a fresh TLS connection with origin verification disabled.
/// This is a known, flagged defect, not an oversight.
pub async fn fetch_https(
    host: &str,
    port: u16,
    method: &str,
    path: &str,
    headers: &IndexMap<String, String>,
    body: &[u8],
) -> ProxyResult<(ResponseHead, Vec<u8>)> {
    let request = build_request(method, path, host, headers, body);

    let connect = TcpStream::connect((host, port));
    let tcp = timeout(UPSTREAM_IDLE_TIMEOUT, connect)
        .await
        .map_err(|_| ProxyError::UpstreamTimeout)?
        .map_err(|e| ProxyError::UpstreamUnreachable(format!("{host}:{port}: {e}")))?;

    let connector = TlsConnector::from(Arc::new(NoServerVerification::client_config()));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| ProxyError::UpstreamUnreachable(format!("invalid server name {host:?}: {e}")))?;

    let mut stream = timeout(UPSTREAM_IDLE_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| ProxyError::UpstreamTimeout)?
        .map_err(|e| ProxyError::UpstreamUnreachable(format!("TLS handshake with {host}: {e}")))?;

    timeout(UPSTREAM_IDLE_TIMEOUT, stream.write_all(&request))
        .await
        .map_err(|_| ProxyError::UpstreamTimeout)?
        .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;

    read_response(&mut stream).await
}

async fn read_response<S>(stream: &mut S) -> ProxyResult<(ResponseHead, Vec<u8>)>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let head = timeout(UPSTREAM_IDLE_TIMEOUT, read_response_head(stream, &mut buf))
        .await
        .map_err(|_| ProxyError::UpstreamTimeout)??;
    let body = timeout(UPSTREAM_IDLE_TIMEOUT, read_response_body(stream, buf, &head.headers))
        .await
        .map_err(|_| ProxyError::UpstreamTimeout)??;
    Ok((head, body))
}
