use indexmap::IndexMap;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cachekey::CacheKey;

/// On-disk metadata sidecar: `{url, statusCode, headers, href}`.
#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    url: String,
    #[serde(rename = "statusCode")]
    status_code: u16,
    headers: IndexMap<String, String>,
    href: String,
}

/// A cache entry as handed back to a caller.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status_code: u16,
    pub headers: IndexMap<String, String>,
    pub body: Vec<u8>,
    pub url: String,
}

/// Content-addressed two-file disk cache (metadata sidecar + raw body).
///
/// Concurrency contract: writes go to a `.tmp` sibling, are fsynced, then
/// renamed into place body-first, sidecar-second, so a reader that observes
/// the sidecar always observes a complete body.
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read and validate an entry. Any violated invariant deletes both files
    /// and returns `None`, repairing the corrupt pair in place.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let (body_path, sidecar_path) = key.disk_paths(&self.root);
        match self.lookup_inner(&body_path, &sidecar_path) {
            Ok(entry) => Some(entry),
            Err(reason) => {
                if let Some(reason) = reason {
                    warn!(path = %sidecar_path.display(), %reason, "repairing corrupt cache entry");
                    let _ = std::fs::remove_file(&body_path);
                    let _ = std::fs::remove_file(&sidecar_path);
                }
                None
            }
        }
    }

    /// `Ok(entry)` on a fully valid pair, `Err(Some(reason))` when something
    /// existed but was invalid (triggers repair), `Err(None)` on plain absence.
    fn lookup_inner(
        &self,
        body_path: &Path,
        sidecar_path: &Path,
    ) -> Result<CacheEntry, Option<String>> {
        let raw = match std::fs::read(sidecar_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(None),
            Err(e) => return Err(Some(format!("sidecar unreadable: {e}"))),
        };
        let sidecar: Sidecar =
            serde_json::from_slice(&raw).map_err(|e| Some(format!("sidecar malformed: {e}")))?;
        if sidecar.status_code != 200 {
            return Err(Some("sidecar status_code is not 200".into()));
        }
        let body_dir = sidecar_path
            .parent()
            .ok_or_else(|| Some("sidecar has no parent directory".to_string()))?;
        let actual_body_path = body_dir.join(&sidecar.href);
        if actual_body_path != body_path {
            debug!(expected = %body_path.display(), actual = %actual_body_path.display(), "href mismatch, trusting sidecar href");
        }
        let body = std::fs::read(&actual_body_path)
            .map_err(|e| Some(format!("body unreadable: {e}")))?;

        Ok(CacheEntry {
            status_code: sidecar.status_code,
            headers: sidecar.headers,
            body,
            url: sidecar.url,
        })
    }

    /// Persist a response. Only callable with `status == 200`; other statuses
    /// are never written to disk.
    pub fn store(
        &self,
        key: &CacheKey,
        status: u16,
        headers: &IndexMap<String, String>,
        body: &[u8],
    ) -> std::io::Result<()> {
        assert_eq!(status, 200, "only 200 responses are cacheable");
        let (body_path, sidecar_path) = key.disk_paths(&self.root);
        if let Some(parent) = body_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if let Err(e) = self.write_atomic(&body_path, body) {
            let _ = std::fs::remove_file(&body_path);
            return Err(e);
        }

        let href = body_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let sidecar = Sidecar {
            url: key.normalized_url.clone(),
            status_code: status,
            headers: headers.clone(),
            href,
        };
        let sidecar_bytes = serde_json::to_vec(&sidecar)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        if let Err(e) = self.write_atomic(&sidecar_path, &sidecar_bytes) {
            let _ = std::fs::remove_file(&body_path);
            let _ = std::fs::remove_file(&sidecar_path);
            return Err(e);
        }

        Ok(())
    }

    fn write_atomic(&self, dest: &Path, data: &[u8]) -> std::io::Result<()> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(parent)?;
        std::io::Write::write_all(&mut tmp, data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(dest)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(())
    }

    pub fn is_cached(&self, key: &CacheKey) -> bool {
        let (_, sidecar_path) = key.disk_paths(&self.root);
        sidecar_path.exists()
    }

    /// Remove every file and resulting-empty directory under the cache root.
    pub fn clear_all(&self) -> (usize, Vec<String>) {
        let mut deleted = 0usize;
        let mut errors = Vec::new();

        let files: Vec<PathBuf> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .collect();

        for file in files {
            match std::fs::remove_file(&file) {
                Ok(()) => deleted += 1,
                Err(e) => errors.push(format!("{}: {e}", file.display())),
            }
        }

        for entry in WalkDir::new(&self.root)
            .contents_first(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
        {
            let _ = std::fs::remove_dir(entry.path());
        }

        (deleted, errors)
    }

    /// Validate up to `max_files` sidecars, removing any pair that fails.
    /// Intended to run on a periodic timer as background maintenance.
    pub fn sweep(&self, max_files: usize) -> usize {
        let mut sidecars: Vec<PathBuf> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .filter(|p| p.extension().map(|e| e == "cache").unwrap_or(false))
            .collect();

        if sidecars.len() > max_files {
            let mut rng = rand::thread_rng();
            sidecars.partial_shuffle(&mut rng, max_files);
            sidecars.truncate(max_files);
        }

        let mut repaired = 0usize;
        for sidecar_path in sidecars {
            let body_path = sidecar_path.with_extension("");
            if self.lookup_inner(&body_path, &sidecar_path).is_err() {
                let _ = std::fs::remove_file(&body_path);
                let _ = std::fs::remove_file(&sidecar_path);
                repaired += 1;
            }
        }
        repaired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cachekey::CacheKey;

    fn headers() -> IndexMap<String, String> {
        let mut h = IndexMap::new();
        h.insert("content-type".to_string(), "text/plain".to_string());
        h
    }

    #[test]
    fn round_trips_a_stored_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let key = CacheKey::parse("https://example.com/foo", None).unwrap();

        store.store(&key, 200, &headers(), b"hello").unwrap();
        let entry = store.lookup(&key).expect("entry should round-trip");

        assert_eq!(entry.status_code, 200);
        assert_eq!(entry.body, b"hello");
        assert_eq!(entry.headers.get("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn missing_entry_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let key = CacheKey::parse("https://example.com/missing", None).unwrap();
        assert!(store.lookup(&key).is_none());
    }

    #[test]
    fn truncated_sidecar_is_repaired_on_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let key = CacheKey::parse("https://example.com/foo", None).unwrap();
        store.store(&key, 200, &headers(), b"hello").unwrap();

        let (body_path, sidecar_path) = key.disk_paths(dir.path());
        std::fs::write(&sidecar_path, b"").unwrap();

        assert!(store.lookup(&key).is_none());
        assert!(!body_path.exists());
        assert!(!sidecar_path.exists());
    }

    #[test]
    fn clear_all_removes_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        for path in ["https://example.com/a", "https://example.com/b"] {
            let key = CacheKey::parse(path, None).unwrap();
            store.store(&key, 200, &headers(), b"x").unwrap();
        }

        let (deleted, errors) = store.clear_all();
        assert_eq!(deleted, 4);
        assert!(errors.is_empty());

        let key = CacheKey::parse("https://example.com/a", None).unwrap();
        assert!(store.lookup(&key).is_none());
    }

    #[test]
    fn sweep_repairs_a_corrupted_entry_without_touching_valid_ones() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let good = CacheKey::parse("https://example.com/good", None).unwrap();
        let bad = CacheKey::parse("https://example.com/bad", None).unwrap();
        store.store(&good, 200, &headers(), b"good").unwrap();
        store.store(&bad, 200, &headers(), b"bad").unwrap();

        let (_, sidecar_path) = bad.disk_paths(dir.path());
        std::fs::write(&sidecar_path, b"not json").unwrap();

        let repaired = store.sweep(10);
        assert_eq!(repaired, 1);
        assert!(store.lookup(&good).is_some());
        assert!(store.lookup(&bad).is_none());
    }
}
