use tokio::io::{AsyncWriteExt, copy_bidirectional};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::handlers::mitm;
use crate::http1::RequestHead;
use crate::state::AppState;
use crate::whitelist::Match;

/// Dispatch a `CONNECT host:port` request: whitelisted hosts are handed to
/// the MITM terminator, everything else gets an opaque byte tunnel with no
/// inspection.
pub async fn handle(state: &AppState, head: &RequestHead, client: &mut TcpStream) -> ProxyResult<()> {
    let (host, port) = split_target(&head.target)?;
    state.stats.record_https_connection();

    if matches!(state.whitelist.is_eligible(&host), Match::Exact | Match::Regex(_)) {
        debug!(host, "CONNECT target is whitelisted, handing off to MITM");
        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .map_err(|e| ProxyError::Internal(format!("replying to CONNECT: {e}")))?;
        return mitm::terminate(state, &host, port, client).await;
    }

    debug!(host, "CONNECT target is not whitelisted, opening opaque tunnel");
    let mut origin = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| ProxyError::UpstreamUnreachable(format!("{host}:{port}: {e}")))?;

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .map_err(|e| ProxyError::Internal(format!("replying to CONNECT: {e}")))?;

    if let Err(e) = copy_bidirectional(client, &mut origin).await {
        warn!(host, %e, "opaque tunnel closed with error");
    }
    Ok(())
}

fn split_target(target: &str) -> ProxyResult<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::BadRequest(format!("malformed CONNECT target: {target}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ProxyError::BadRequest(format!("malformed CONNECT port: {port}")))?;
    Ok((host.to_string(), port))
}
