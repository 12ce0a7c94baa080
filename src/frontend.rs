use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::admin;
use crate::error::ProxyError;
use crate::handlers::{absolute, connect, relative};
use crate::http1::read_request_head;
use crate::registry::half_close;
use crate::state::AppState;

/// Run the accept loop until `shutdown` resolves, registering every
/// connection with `state.registry` so shutdown drain can see it.
///
/// A connection's own task owns it end to end; the loop itself only decides
/// whether to keep accepting.
pub async fn run(state: AppState, listener: TcpListener, shutdown: impl std::future::Future<Output = ()>) {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let state = state.clone();
                        tokio::spawn(async move {
                            let guard = state.registry.track();
                            if let Err(e) = handle_connection(&state, stream).await {
                                debug!(%peer, %e, "connection ended with error");
                            }
                            drop(guard);
                        });
                    }
                    Err(e) => {
                        warn!(%e, "accept failed");
                        continue;
                    }
                }
            }
            _ = &mut shutdown => {
                info!("accept loop stopping");
                break;
            }
        }
    }
}

async fn handle_connection(state: &AppState, mut stream: TcpStream) -> Result<(), ProxyError> {
    let mut buf = Vec::new();
    let head = match read_request_head(&mut stream, &mut buf).await {
        Ok(head) => head,
        Err(e) => {
            let _ = stream.write_all(&e.to_wire_response()).await;
            return Err(e);
        }
    };

    if head.method == "CONNECT" {
        let result = connect::handle(state, &head, &mut stream).await;
        return dispatch_result(&mut stream, result).await;
    }

    if let Some(host) = head.header("host") {
        if host_targets_self(host, state) {
            let err = ProxyError::BadRequest(
                "\u{76f4}\u{63a5}\u{306e}\u{30ed}\u{30fc}\u{30ab}\u{30eb}\u{30db}\u{30b9}\u{30c8}\u{3078}\u{306e}\u{30ea}\u{30af}\u{30a8}\u{30b9}\u{30c8}\u{306f}\u{8a31}\u{53ef}\u{3055}\u{308c}\u{3066}\u{3044}\u{307e}\u{305b}\u{3093}".to_string(),
            );
            let _ = stream.write_all(&err.to_wire_response()).await;
            return Err(err);
        }

        if host.contains("localhost") {
            if let Some(response) = admin::intercept(state, &head).await {
                stream.write_all(&response).await.map_err(|e| {
                    ProxyError::Internal(format!("writing admin response: {e}"))
                })?;
                stream.flush().await.ok();
                return Ok(());
            }
        }
    } else if !is_absolute_form(&head.target) {
        let err = ProxyError::BadRequest("Host header is required".to_string());
        let _ = stream.write_all(&err.to_wire_response()).await;
        return Err(err);
    }

    if is_absolute_form(&head.target) {
        state.stats.record_https_request();
        let url = head.target.clone();
        let eligible_https = url.starts_with("https://")
            && matches!(
                state.whitelist.is_eligible(url_host(&url)),
                crate::whitelist::Match::Exact | crate::whitelist::Match::Regex(_)
            );
        if eligible_https {
            let result = with_exchange_timeout(absolute::handle(state, &head, &url, &mut stream)).await;
            return dispatch_result(&mut stream, result).await;
        }
        // http:// absolute, or an unwhitelisted https:// host: treat like
        // origin-form with no disk cache.
        let mut origin_form_head = head.clone();
        origin_form_head.target = path_and_query_of(&url);
        origin_form_head
            .headers
            .entry("Host".to_string())
            .or_insert_with(|| url_host(&url).to_string());
        let result =
            with_exchange_timeout(relative::handle(state, &origin_form_head, buf, &mut stream)).await;
        return dispatch_result(&mut stream, result).await;
    }

    state.stats.record_http_request();
    let result = with_exchange_timeout(relative::handle(state, &head, buf, &mut stream)).await;
    dispatch_result(&mut stream, result).await
}

/// Overall bound on a single proxied client exchange. Since this
/// implementation buffers the full origin response before writing anything
/// to the client, an expiry here always lands before any response bytes
/// have been sent, so a `504` is always safe to emit.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(25);

async fn with_exchange_timeout(
    fut: impl std::future::Future<Output = Result<(), ProxyError>>,
) -> Result<(), ProxyError> {
    match timeout(EXCHANGE_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::UpstreamTimeout),
    }
}

async fn dispatch_result(
    stream: &mut TcpStream,
    result: Result<(), ProxyError>,
) -> Result<(), ProxyError> {
    if let Err(e) = &result {
        error!(%e, "exchange failed");
        let _ = stream.write_all(&e.to_wire_response()).await;
    }
    let _ = half_close(stream).await;
    result
}

fn is_absolute_form(target: &str) -> bool {
    target.starts_with("http://") || target.starts_with("https://")
}

fn url_host(url: &str) -> &str {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    rest.split('/').next().unwrap_or(rest)
}

fn path_and_query_of(url: &str) -> String {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    match rest.split_once('/') {
        Some((_, tail)) => format!("/{tail}"),
        None => "/".to_string(),
    }
}

fn host_targets_self(host: &str, state: &AppState) -> bool {
    host.contains(&format!("localhost:{}", state.config.proxy_port))
}
