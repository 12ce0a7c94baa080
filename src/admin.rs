use serde_json::json;

use crate::cachekey::CacheKey;
use crate::http1::RequestHead;
use crate::state::AppState;
use crate::whitelist::Match;

/// Runs before the normal proxy dispatch table whenever the request's `Host`
/// header contains `localhost`. Returns `Some(response_bytes)` when the
/// admin collaborator owns the request, `None` to fall through to the core.
pub async fn intercept(state: &AppState, head: &RequestHead) -> Option<Vec<u8>> {
    let host = head.header("host").unwrap_or("");
    if !host.contains("localhost") {
        return None;
    }

    let path = head.target.split('?').next().unwrap_or("");
    let query = head.target.split_once('?').map(|(_, q)| q).unwrap_or("");

    match (head.method.as_str(), path) {
        ("GET", "/health") => Some(text_response(200, "OK")),
        ("GET", "/proxy-stats") => Some(proxy_stats(state)),
        ("POST", "/check-whitelist") => Some(check_whitelist(state, head)),
        ("GET", "/clear-cache") => Some(clear_cache(state)),
        ("GET", "/check-cache") => Some(check_cache(state, query)),
        ("GET", "/update-cache") => Some(update_cache(state, query).await),
        ("GET", "/") => Some(dashboard(state)),
        _ => None,
    }
}

fn text_response(status: u16, body: &str) -> Vec<u8> {
    let reason = if status == 200 { "OK" } else { "Error" };
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
        len = body.len()
    )
    .into_bytes()
}

fn json_response(status: u16, body: &serde_json::Value) -> Vec<u8> {
    let rendered = body.to_string();
    let reason = if status == 200 { "OK" } else { "Bad Request" };
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{rendered}",
        len = rendered.len()
    )
    .into_bytes()
}

fn proxy_stats(state: &AppState) -> Vec<u8> {
    let snapshot = state.stats.snapshot();
    let body = json!({
        "http": {
            "requests": snapshot.http.requests,
            "cacheHits": snapshot.http.cache_hits,
            "cacheMisses": snapshot.http.cache_misses,
        },
        "https": {
            "connections": snapshot.https.connections,
            "requests": snapshot.https.requests,
            "cacheHits": snapshot.https.cache_hits,
            "cacheMisses": snapshot.https.cache_misses,
            "cacheSaves": snapshot.https.cache_saves,
        },
        "whitelistedDomains": state.whitelist.literal_domains(),
        "whitelistedRegexPatterns": state.whitelist.regex_patterns(),
        "liveConnections": state.registry.live_count(),
    });
    json_response(200, &body)
}

fn check_whitelist(state: &AppState, head: &RequestHead) -> Vec<u8> {
    let Some(host) = head.header("x-check-host") else {
        return json_response(400, &json!({"error": "X-Check-Host header is required"}));
    };

    let result = state.whitelist.is_eligible(host);
    let (is_whitelisted, matched_by) = match &result {
        Match::Exact => (true, Some("exact".to_string())),
        Match::Regex(pattern) => (true, Some(pattern.clone())),
        Match::None => (false, None),
    };

    json_response(
        200,
        &json!({
            "host": host,
            "isWhitelisted": is_whitelisted,
            "matchedBy": matched_by,
            "whitelistedDomains": state.whitelist.literal_domains(),
            "whitelistedRegexPatterns": state.whitelist.regex_patterns(),
        }),
    )
}

fn clear_cache(state: &AppState) -> Vec<u8> {
    let (deleted, errors) = state.cache.clear_all();
    let summary = if errors.is_empty() {
        format!("Cleared {deleted} cache files")
    } else {
        format!(
            "Cleared {deleted} cache files with {} errors: {}",
            errors.len(),
            errors.join("; ")
        )
    };
    text_response(200, &summary)
}

fn check_cache(state: &AppState, query: &str) -> Vec<u8> {
    let Some(url) = query_param(query, "url") else {
        return json_response(400, &json!({"error": "url query parameter is required"}));
    };

    let key = match CacheKey::parse(&url, None) {
        Ok(key) => key,
        Err(e) => return json_response(400, &json!({"error": e.to_string()})),
    };

    match state.cache.lookup(&key) {
        Some(entry) => json_response(
            200,
            &json!({
                "cached": true,
                "url": entry.url,
                "statusCode": entry.status_code,
                "contentType": entry.headers.get("content-type"),
                "dataSize": entry.body.len(),
            }),
        ),
        None => json_response(200, &json!({"cached": false, "url": url})),
    }
}

/// Force a fresh C7 fetch of `url` (ignoring any existing cache entry) and
/// report the outcome. Only `https://` URLs on a whitelisted host are
/// eligible to be cached; anything else is fetched but not stored.
async fn update_cache(state: &AppState, query: &str) -> Vec<u8> {
    let Some(url) = query_param(query, "url") else {
        return json_response(400, &json!({"error": "url query parameter is required"}));
    };

    let key = match CacheKey::parse(&url, None) {
        Ok(key) => key,
        Err(e) => return json_response(400, &json!({"error": e.to_string()})),
    };

    if !url.starts_with("https://") {
        return json_response(
            400,
            &json!({"error": "update-cache only supports https:// URLs", "url": url}),
        );
    }
    if !matches!(state.whitelist.is_eligible(key.host()), Match::Exact | Match::Regex(_)) {
        return json_response(
            400,
            &json!({"error": "host is not whitelisted", "url": url}),
        );
    }

    let path_with_query = url
        .splitn(4, '/')
        .nth(3)
        .map(|p| format!("/{p}"))
        .unwrap_or_else(|| "/".to_string());

    match crate::upstream::fetch_https(
        key.host(),
        443,
        "GET",
        &path_with_query,
        &indexmap::IndexMap::new(),
        &[],
    )
    .await
    {
        Ok((resp_head, body)) => {
            let mut stored = false;
            if resp_head.status == 200 {
                stored = state.cache.store(&key, 200, &resp_head.headers, &body).is_ok();
            }
            json_response(
                200,
                &json!({
                    "url": url,
                    "statusCode": resp_head.status,
                    "cached": stored,
                    "dataSize": body.len(),
                }),
            )
        }
        Err(e) => json_response(200, &json!({"url": url, "error": e.to_string()})),
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == name {
            Some(urlencoding_decode(v))
        } else {
            None
        }
    })
}

fn urlencoding_decode(s: &str) -> String {
    s.replace('+', " ")
}

fn dashboard(state: &AppState) -> Vec<u8> {
    let snapshot = state.stats.snapshot();
    let body = format!(
        "<!DOCTYPE html><html><head><title>relay-cache-proxy</title></head><body>\
         <h1>relay-cache-proxy</h1>\
         <p>HTTP requests: {}, cache hits: {}, cache misses: {}</p>\
         <p>HTTPS connections: {}, requests: {}, cache hits: {}, cache misses: {}, cache saves: {}</p>\
         <p>Live connections: {}</p>\
         </body></html>",
        snapshot.http.requests,
        snapshot.http.cache_hits,
        snapshot.http.cache_misses,
        snapshot.https.connections,
        snapshot.https.requests,
        snapshot.https.cache_hits,
        snapshot.https.cache_misses,
        snapshot.https.cache_saves,
        state.registry.live_count(),
    );
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
        len = body.len()
    )
    .into_bytes()
}
