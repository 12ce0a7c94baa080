use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically non-decreasing counters, published as an atomic snapshot.
#[derive(Debug, Default)]
pub struct Stats {
    http_requests: AtomicU64,
    http_cache_hits: AtomicU64,
    http_cache_misses: AtomicU64,

    https_connections: AtomicU64,
    https_requests: AtomicU64,
    https_cache_hits: AtomicU64,
    https_cache_misses: AtomicU64,
    https_cache_saves: AtomicU64,
}

#[derive(Debug, Serialize, Clone, Copy)]
pub struct HttpSnapshot {
    pub requests: u64,
    #[serde(rename = "cacheHits")]
    pub cache_hits: u64,
    #[serde(rename = "cacheMisses")]
    pub cache_misses: u64,
}

#[derive(Debug, Serialize, Clone, Copy)]
pub struct HttpsSnapshot {
    pub connections: u64,
    pub requests: u64,
    #[serde(rename = "cacheHits")]
    pub cache_hits: u64,
    #[serde(rename = "cacheMisses")]
    pub cache_misses: u64,
    #[serde(rename = "cacheSaves")]
    pub cache_saves: u64,
}

#[derive(Debug, Serialize, Clone, Copy)]
pub struct StatsSnapshot {
    pub http: HttpSnapshot,
    pub https: HttpsSnapshot,
}

macro_rules! inc {
    ($field:expr) => {
        $field.fetch_add(1, Ordering::Relaxed)
    };
}

impl Stats {
    pub fn record_http_request(&self) {
        inc!(self.http_requests);
    }
    pub fn record_http_hit(&self) {
        inc!(self.http_cache_hits);
    }
    pub fn record_http_miss(&self) {
        inc!(self.http_cache_misses);
    }

    pub fn record_https_connection(&self) {
        inc!(self.https_connections);
    }
    pub fn record_https_request(&self) {
        inc!(self.https_requests);
    }
    pub fn record_https_hit(&self) {
        inc!(self.https_cache_hits);
    }
    pub fn record_https_miss(&self) {
        inc!(self.https_cache_misses);
    }
    pub fn record_https_save(&self) {
        inc!(self.https_cache_saves);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            http: HttpSnapshot {
                requests: self.http_requests.load(Ordering::Relaxed),
                cache_hits: self.http_cache_hits.load(Ordering::Relaxed),
                cache_misses: self.http_cache_misses.load(Ordering::Relaxed),
            },
            https: HttpsSnapshot {
                connections: self.https_connections.load(Ordering::Relaxed),
                requests: self.https_requests.load(Ordering::Relaxed),
                cache_hits: self.https_cache_hits.load(Ordering::Relaxed),
                cache_misses: self.https_cache_misses.load(Ordering::Relaxed),
                cache_saves: self.https_cache_saves.load(Ordering::Relaxed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let stats = Stats::default();
        stats.record_http_request();
        stats.record_http_request();
        stats.record_http_hit();
        stats.record_http_miss();

        let snap = stats.snapshot();
        assert_eq!(snap.http.requests, 2);
        assert_eq!(snap.http.cache_hits, 1);
        assert_eq!(snap.http.cache_misses, 1);
    }
}
