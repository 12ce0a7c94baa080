use md5::{Digest, Md5};
use std::path::{Path, PathBuf};

use crate::error::{ProxyError, ProxyResult};

/// A request URL reduced to the identity used for caching: scheme, host, path
/// and query verbatim, fragment dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub normalized_url: String,
    pub digest: String,
    host: String,
    path: String,
}

impl CacheKey {
    /// Parse an absolute or host-relative URL into a cache key.
    ///
    /// `host_hint` supplies the host for origin-form requests (`Host` header);
    /// an absolute URL's own host takes precedence when present.
    pub fn parse(url: &str, host_hint: Option<&str>) -> ProxyResult<Self> {
        let (scheme, rest): (&str, String) = if let Some(r) = url.strip_prefix("https://") {
            ("https", r.to_string())
        } else if let Some(r) = url.strip_prefix("http://") {
            ("http", r.to_string())
        } else if let Some(host) = host_hint {
            ("http", format!("{host}{url}"))
        } else {
            return Err(ProxyError::BadRequest(
                "URL has no scheme and no Host fallback".into(),
            ));
        };

        let (authority, path_and_query) = rest.split_once('/').unwrap_or((rest.as_str(), ""));
        let host = authority.to_string();
        if host.is_empty() {
            return Err(ProxyError::BadRequest("URL has no host".into()));
        }

        let path_and_query = format!("/{path_and_query}");
        let path_and_query = path_and_query
            .split_once('#')
            .map(|(pq, _)| pq.to_string())
            .unwrap_or(path_and_query);
        let (path, query) = path_and_query
            .split_once('?')
            .map(|(p, q)| (p.to_string(), Some(q.to_string())))
            .unwrap_or((path_and_query.clone(), None));

        if path.split('/').any(|seg| seg == "..") {
            return Err(ProxyError::BadRequest(
                "path traversal is not permitted".into(),
            ));
        }

        let path = if path.is_empty() { "/".to_string() } else { path };

        let normalized_url = match &query {
            Some(q) => format!("{scheme}://{host}{path}?{q}"),
            None => format!("{scheme}://{host}{path}"),
        };

        let mut hasher = Md5::new();
        hasher.update(normalized_url.as_bytes());
        let digest = hex::encode(hasher.finalize());

        Ok(Self {
            normalized_url,
            digest,
            host,
            path,
        })
    }

    /// `(body_path, sidecar_path)` rooted at `cache_root` for this key.
    pub fn disk_paths(&self, cache_root: &Path) -> (PathBuf, PathBuf) {
        let rel = &self.path;
        let base = rel.rsplit('/').next().filter(|s| !s.is_empty());
        let dir = rel
            .rsplit_once('/')
            .map(|(d, _)| d)
            .filter(|d| !d.is_empty())
            .unwrap_or("");

        let (stem, ext) = match base {
            Some(name) => match name.rsplit_once('.') {
                Some((s, e)) if !s.is_empty() => (s.to_string(), format!(".{e}")),
                _ => (name.to_string(), String::new()),
            },
            None => ("index".to_string(), ".html".to_string()),
        };

        let filename = format!("{stem}-{digest}{ext}", digest = self.digest);
        let mut body_path = PathBuf::from(cache_root);
        body_path.push(&self.host);
        if !dir.is_empty() {
            body_path.push(dir.trim_start_matches('/'));
        }
        body_path.push(filename);

        let mut sidecar_path = body_path.clone();
        let mut os_string = sidecar_path.into_os_string();
        os_string.push(".cache");
        sidecar_path = PathBuf::from(os_string);

        (body_path, sidecar_path)
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_across_repeated_calls() {
        let a = CacheKey::parse("https://example.com/foo?x=1", None).unwrap();
        let b = CacheKey::parse("https://example.com/foo?x=1", None).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.normalized_url, b.normalized_url);
    }

    #[test]
    fn query_is_part_of_identity() {
        let a = CacheKey::parse("https://example.com/foo?x=1", None).unwrap();
        let b = CacheKey::parse("https://example.com/foo?x=2", None).unwrap();
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn fragment_is_dropped() {
        let a = CacheKey::parse("https://example.com/foo#section", None).unwrap();
        let b = CacheKey::parse("https://example.com/foo", None).unwrap();
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn host_hint_used_for_origin_form() {
        let key = CacheKey::parse("/foo/bar", Some("example.com")).unwrap();
        assert_eq!(key.normalized_url, "http://example.com/foo/bar");
    }

    #[test]
    fn rejects_path_traversal() {
        let err = CacheKey::parse("https://example.com/../etc/passwd", None);
        assert!(err.is_err());
    }

    #[test]
    fn default_path_maps_to_index_html() {
        let key = CacheKey::parse("https://example.com/", None).unwrap();
        let (body, sidecar) = key.disk_paths(Path::new("/cache"));
        assert!(body.to_string_lossy().contains("index-"));
        assert!(sidecar.to_string_lossy().ends_with(".cache"));
    }
}
