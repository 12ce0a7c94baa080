use std::sync::Arc;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::registry::Registry;
use crate::stats::Stats;
use crate::tls::CertificateAuthority;
use crate::whitelist::Whitelist;

/// Everything a connection-handling task needs, shared immutably (or through
/// interior atomics/locks) across the whole process.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub whitelist: Arc<Whitelist>,
    pub cache: Arc<CacheStore>,
    pub stats: Arc<Stats>,
    pub registry: Arc<Registry>,
    pub ca: Arc<CertificateAuthority>,
}

impl AppState {
    pub fn new(
        config: Config,
        whitelist: Whitelist,
        cache: CacheStore,
        ca: Arc<CertificateAuthority>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            whitelist: Arc::new(whitelist),
            cache: Arc::new(cache),
            stats: Arc::new(Stats::default()),
            registry: Registry::new(),
            ca,
        }
    }
}
