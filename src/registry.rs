use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Tracks every live client socket so graceful shutdown can drain them.
/// Shutdown needs to know not just "stop accepting" but "who is still
/// connected".
pub struct Registry {
    next_id: AtomicU64,
    live: Mutex<FxHashSet<u64>>,
    shutting_down: AtomicBool,
}

/// RAII guard: a connection's id is removed from the registry on drop,
/// regardless of how the handling task exits.
pub struct ConnectionGuard {
    id: u64,
    registry: Arc<Registry>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.live.lock().remove(&self.id);
    }
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            live: Mutex::new(FxHashSet::default()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn track(self: &Arc<Self>) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.lock().insert(id);
        ConnectionGuard {
            id,
            registry: Arc::clone(self),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

/// Best-effort half-close used during the shutdown drain; errors are ignored
/// since the peer may already be gone.
pub async fn half_close(stream: &mut TcpStream) {
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracked_connections_are_counted_and_removed_on_drop() {
        let registry = Registry::new();
        assert_eq!(registry.live_count(), 0);

        let guard_a = registry.track();
        let guard_b = registry.track();
        assert_eq!(registry.live_count(), 2);

        drop(guard_a);
        assert_eq!(registry.live_count(), 1);

        drop(guard_b);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn shutdown_flag_round_trips() {
        let registry = Registry::new();
        assert!(!registry.is_shutting_down());
        registry.begin_shutdown();
        assert!(registry.is_shutting_down());
    }
}
