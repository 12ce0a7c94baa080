use indexmap::IndexMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::cachekey::CacheKey;
use crate::error::ProxyResult;
use crate::handlers::{render_cache_hit, render_origin_response};
use crate::http1::RequestHead;
use crate::state::AppState;
use crate::upstream::fetch_https;
use crate::whitelist::Match;

/// Serve a fully-qualified `https://host/path` GET, consulting the cache
/// first and falling back to an origin fetch on a miss.
///
/// `http://` absolute URLs and URLs whose host is not whitelisted are the
/// relative-form handler's responsibility; this function assumes the caller
/// has already checked both.
pub async fn handle<W: AsyncWrite + Unpin>(
    state: &AppState,
    head: &RequestHead,
    url: &str,
    client: &mut W,
) -> ProxyResult<()> {
    let key = CacheKey::parse(url, None)?;

    if let Some(entry) = state.cache.lookup(&key) {
        state.stats.record_https_hit();
        let response = render_cache_hit(&entry, "cache");
        client.write_all(&response).await.map_err(|e| {
            crate::error::ProxyError::Internal(format!("writing cached response: {e}"))
        })?;
        client.flush().await.ok();
        return Ok(());
    }

    state.stats.record_https_miss();
    debug!(url, "absolute-form cache miss, fetching origin");

    let host = key.host().to_string();
    let path_with_query = url
        .splitn(4, '/')
        .nth(3)
        .map(|p| format!("/{p}"))
        .unwrap_or_else(|| "/".to_string());

    let mut forward_headers = IndexMap::new();
    for (k, v) in &head.headers {
        forward_headers.insert(k.clone(), v.clone());
    }

    let (resp_head, body) =
        fetch_https(&host, 443, "GET", &path_with_query, &forward_headers, &[]).await?;

    if resp_head.status == 200 && matches!(state.whitelist.is_eligible(&host), Match::Exact | Match::Regex(_))
    {
        if let Err(e) = state.cache.store(&key, 200, &resp_head.headers, &body) {
            tracing::warn!(url, %e, "failed to persist cache entry");
        } else {
            state.stats.record_https_save();
        }
    }

    let response = render_origin_response(
        resp_head.status,
        &resp_head.reason,
        &resp_head.headers,
        &body,
        "direct",
    );
    client
        .write_all(&response)
        .await
        .map_err(|e| crate::error::ProxyError::Internal(format!("writing origin response: {e}")))?;
    client.flush().await.ok();
    Ok(())
}
