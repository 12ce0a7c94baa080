//! End-to-end tests driving the real accept loop over TCP sockets: a mock
//! origin server stands in for the real internet, and the proxy is
//! exercised exactly as a client would, including its on-disk cache.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use relay_cache_proxy::cache::CacheStore;
use relay_cache_proxy::config::{Config, HttpsConfig};
use relay_cache_proxy::frontend;
use relay_cache_proxy::state::AppState;
use relay_cache_proxy::tls::CertificateAuthority;
use relay_cache_proxy::whitelist::Whitelist;

/// Spawn a proxy bound to an ephemeral port with the given whitelist, and
/// return its state (for direct counter/cache inspection) and address.
async fn spawn_proxy(whitelisted: &[&str], cache_root: std::path::PathBuf) -> (AppState, std::net::SocketAddr) {
    let cert_dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::load_or_create(
        &cert_dir.path().join("ca-cert.pem"),
        &cert_dir.path().join("ca-key.pem"),
    )
    .unwrap();

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = Config {
        proxy_port: addr.port(),
        whitelisted_domains: whitelisted.iter().map(|s| s.to_string()).collect(),
        https: HttpsConfig::default(),
        cache_root: cache_root.clone(),
        log_level: "ERROR".to_string(),
    };
    let whitelist = Whitelist::from_entries(&config.whitelisted_domains).unwrap();
    let cache = CacheStore::new(cache_root);
    let state = AppState::new(config, whitelist, cache, ca);

    let spawned_state = state.clone();
    tokio::spawn(async move {
        frontend::run(spawned_state, listener, std::future::pending()).await;
    });

    (state, addr)
}

/// Accept connections forever on `listener`, answering each with a fixed
/// 200 response carrying `body`. A single-exchange, non-keep-alive origin.
async fn run_mock_origin(listener: TcpListener, body: &'static [u8]) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            // Drain whatever the client sent (don't bother parsing it; a
            // single read is enough for these small test requests).
            let _ = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.write_all(body).await;
            let _ = stream.shutdown().await;
        });
    }
}

async fn send_request(addr: std::net::SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.shutdown().await.ok();
    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await;
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn http_hit_miss_hit_round_trip() {
    let origin_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let origin_addr = origin_listener.local_addr().unwrap();
    tokio::spawn(run_mock_origin(origin_listener, b"hello from origin"));

    let cache_dir = tempfile::tempdir().unwrap();
    let (state, proxy_addr) = spawn_proxy(&["127.0.0.1"], cache_dir.path().to_path_buf()).await;

    let host_header = format!("127.0.0.1:{}", origin_addr.port());
    let request = format!("GET / HTTP/1.1\r\nHost: {host_header}\r\n\r\n");

    let first = send_request(proxy_addr, &request).await;
    assert!(first.starts_with("HTTP/1.1 200"), "unexpected response: {first}");
    assert!(first.contains("X-Cache: MISS"), "expected a miss: {first}");
    assert!(first.contains("hello from origin"));

    let second = send_request(proxy_addr, &request).await;
    assert!(second.contains("X-Cache: HIT"), "expected a hit: {second}");
    assert!(second.contains("hello from origin"));

    let snapshot = state.stats.snapshot();
    assert_eq!(snapshot.http.requests, 2);
    assert_eq!(snapshot.http.cache_misses, 1);
    assert_eq!(snapshot.http.cache_hits, 1);
}

#[tokio::test]
async fn unwhitelisted_host_is_passthrough_with_no_cache() {
    // Bound on a distinct loopback address so it is reachable but does not
    // match the "127.0.0.1" whitelist literal.
    let origin_listener = TcpListener::bind(("127.0.0.2", 0)).await.unwrap();
    let origin_addr = origin_listener.local_addr().unwrap();
    tokio::spawn(run_mock_origin(origin_listener, b"not cached"));

    let cache_dir = tempfile::tempdir().unwrap();
    let (state, proxy_addr) = spawn_proxy(&["127.0.0.1"], cache_dir.path().to_path_buf()).await;

    let host_header = format!("127.0.0.2:{}", origin_addr.port());
    let request = format!("GET / HTTP/1.1\r\nHost: {host_header}\r\n\r\n");

    let response = send_request(proxy_addr, &request).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(!response.contains("X-Cache"), "unexpected cache header: {response}");
    assert!(response.contains("not cached"));

    assert!(!cache_dir.path().join("127.0.0.2").exists());
    let _ = state;
}

#[tokio::test]
async fn missing_host_header_is_rejected() {
    let cache_dir = tempfile::tempdir().unwrap();
    let (_state, proxy_addr) = spawn_proxy(&["example.com"], cache_dir.path().to_path_buf()).await;

    let response = send_request(proxy_addr, "GET / HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400"), "unexpected response: {response}");
    assert!(response.contains("Host header is required"));
}

#[tokio::test]
async fn self_proxy_request_is_rejected() {
    let cache_dir = tempfile::tempdir().unwrap();
    let (state, proxy_addr) = spawn_proxy(&["example.com"], cache_dir.path().to_path_buf()).await;
    assert_eq!(state.config.proxy_port, proxy_addr.port());

    let request = format!("GET / HTTP/1.1\r\nHost: localhost:{}\r\n\r\n", proxy_addr.port());
    let response = send_request(proxy_addr, &request).await;
    assert!(response.starts_with("HTTP/1.1 400"), "unexpected response: {response}");
    assert!(response.contains("\u{76f4}\u{63a5}"));
}

#[tokio::test]
async fn corrupted_sidecar_is_repaired_and_refetched() {
    let origin_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let origin_addr = origin_listener.local_addr().unwrap();
    tokio::spawn(run_mock_origin(origin_listener, b"valid body"));

    let cache_dir = tempfile::tempdir().unwrap();
    let (_state, proxy_addr) = spawn_proxy(&["127.0.0.1"], cache_dir.path().to_path_buf()).await;

    let host_header = format!("127.0.0.1:{}", origin_addr.port());
    let request = format!("GET / HTTP/1.1\r\nHost: {host_header}\r\n\r\n");

    let first = send_request(proxy_addr, &request).await;
    assert!(first.contains("X-Cache: MISS"));

    let sidecar = walk_for_sidecar(cache_dir.path());
    std::fs::write(&sidecar, b"").unwrap();

    let second = send_request(proxy_addr, &request).await;
    assert!(second.contains("X-Cache: MISS"), "expected a re-fetch: {second}");
    assert!(second.contains("valid body"));

    let third = send_request(proxy_addr, &request).await;
    assert!(third.contains("X-Cache: HIT"), "expected the repaired entry to serve a hit: {third}");
}

fn walk_for_sidecar(root: &std::path::Path) -> std::path::PathBuf {
    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() && entry.path().extension().map(|e| e == "cache").unwrap_or(false) {
            return entry.path().to_path_buf();
        }
    }
    panic!("no sidecar file found under {}", root.display());
}
