use clap::Parser;
use relay_cache_proxy::cache::CacheStore;
use relay_cache_proxy::cli::Cli;
use relay_cache_proxy::config::Config;
use relay_cache_proxy::frontend;
use relay_cache_proxy::shutdown;
use relay_cache_proxy::state::AppState;
use relay_cache_proxy::tls::CertificateAuthority;
use relay_cache_proxy::whitelist::Whitelist;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("error")),
        )
        .init();

    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        error!(?e, "a crypto provider was already installed");
    }

    let whitelist = match Whitelist::from_entries(&config.whitelisted_domains) {
        Ok(w) => w,
        Err(e) => {
            error!(%e, "invalid whitelist pattern in configuration");
            std::process::exit(1);
        }
    };

    let ca = match CertificateAuthority::load_or_create(&config.https.cert_path, &config.https.key_path)
    {
        Ok(ca) => ca,
        Err(e) => {
            error!(%e, "failed to initialize MITM certificate authority");
            std::process::exit(1);
        }
    };

    let cache = CacheStore::new(config.cache_root.clone());
    let proxy_port = config.proxy_port;
    let state = AppState::new(config, whitelist, cache, ca);

    let listener = match TcpListener::bind(("0.0.0.0", proxy_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%e, port = proxy_port, "failed to bind listener");
            std::process::exit(1);
        }
    };
    info!(port = proxy_port, "relay-cache-proxy listening");

    let stats_task = tokio::spawn(log_stats_periodically(state.clone()));

    frontend::run(state.clone(), listener, shutdown::signal_received()).await;
    let drained = shutdown::drain(state.registry.clone()).await;
    stats_task.abort();

    if !drained {
        error!("shutdown wall clock exceeded, exiting with error status");
        std::process::exit(1);
    }

    info!("server shutdown complete");
}

async fn log_stats_periodically(state: AppState) {
    let mut ticker = tokio::time::interval(STATS_LOG_INTERVAL);
    loop {
        ticker.tick().await;
        let snapshot = state.stats.snapshot();
        info!(
            http_requests = snapshot.http.requests,
            http_hits = snapshot.http.cache_hits,
            http_misses = snapshot.http.cache_misses,
            https_connections = snapshot.https.connections,
            https_hits = snapshot.https.cache_hits,
            https_misses = snapshot.https.cache_misses,
            https_saves = snapshot.https.cache_saves,
            live_connections = state.registry.live_count(),
            "periodic stats"
        );
        let repaired = state.cache.sweep(200);
        if repaired > 0 {
            info!(repaired, "periodic cache sweep repaired corrupt entries");
        }
    }
}
