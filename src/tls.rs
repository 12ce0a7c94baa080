use moka::sync::Cache;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::sign::CertifiedKey;
use rustls::server::{ClientHello, ResolvesServerCert};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::error::{ProxyError, ProxyResult};

/// Holds the MITM certificate authority and issues per-host leaf certificates
/// on demand, caching the result so repeat CONNECTs to the same host pay no
/// further signing cost.
///
/// TLS terminates directly on the client socket via a single SNI-driven
/// `ResolvesServerCert`, rather than spinning up one `ServerConfig` per
/// `CONNECT`.
pub struct CertificateAuthority {
    ca_cert_pem: String,
    ca_key: KeyPair,
    leaf_cache: Cache<String, Arc<CertifiedKey>>,
}

impl CertificateAuthority {
    /// Load CA material from `cert_path`/`key_path`, or mint a fresh
    /// self-signed CA and persist it there if neither file exists yet.
    pub fn load_or_create(cert_path: &Path, key_path: &Path) -> ProxyResult<Arc<Self>> {
        if cert_path.exists() && key_path.exists() {
            let ca_cert_pem = std::fs::read_to_string(cert_path)
                .map_err(|e| ProxyError::TlsInterceptionFailure(format!("reading CA cert: {e}")))?;
            let key_pem = std::fs::read_to_string(key_path)
                .map_err(|e| ProxyError::TlsInterceptionFailure(format!("reading CA key: {e}")))?;
            let ca_key = KeyPair::from_pem(&key_pem)
                .map_err(|e| ProxyError::TlsInterceptionFailure(format!("parsing CA key: {e}")))?;
            info!(cert_path = %cert_path.display(), "loaded existing MITM certificate authority");
            return Ok(Arc::new(Self {
                ca_cert_pem,
                ca_key,
                leaf_cache: Cache::new(10_000),
            }));
        }

        let (ca_cert_pem, ca_key) = Self::generate_ca()?;
        if let Some(parent) = cert_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProxyError::TlsInterceptionFailure(format!("creating cert dir: {e}")))?;
        }
        std::fs::write(cert_path, &ca_cert_pem)
            .map_err(|e| ProxyError::TlsInterceptionFailure(format!("writing CA cert: {e}")))?;
        std::fs::write(key_path, ca_key.serialize_pem())
            .map_err(|e| ProxyError::TlsInterceptionFailure(format!("writing CA key: {e}")))?;
        info!(cert_path = %cert_path.display(), "generated new MITM certificate authority");

        Ok(Arc::new(Self {
            ca_cert_pem,
            ca_key,
            leaf_cache: Cache::new(10_000),
        }))
    }

    fn generate_ca() -> ProxyResult<(String, KeyPair)> {
        let ca_key = KeyPair::generate()
            .map_err(|e| ProxyError::TlsInterceptionFailure(format!("generating CA key: {e}")))?;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "relay-cache-proxy local CA");
        params.distinguished_name = dn;

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| ProxyError::TlsInterceptionFailure(format!("self-signing CA: {e}")))?;

        Ok((ca_cert.pem(), ca_key))
    }

    /// Reconstruct the issuer `Certificate` object from stored PEM + key.
    /// Used only to sign leaves; never served to clients directly.
    fn issuer_certificate(&self) -> ProxyResult<rcgen::Certificate> {
        let mut params = CertificateParams::from_ca_cert_pem(&self.ca_cert_pem)
            .map_err(|e| ProxyError::TlsInterceptionFailure(format!("reparsing CA cert: {e}")))?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .self_signed(&self.ca_key)
            .map_err(|e| ProxyError::TlsInterceptionFailure(format!("re-deriving CA issuer: {e}")))
    }

    fn issue_leaf(&self, host: &str) -> ProxyResult<Arc<CertifiedKey>> {
        let leaf_key = KeyPair::generate()
            .map_err(|e| ProxyError::TlsInterceptionFailure(format!("generating leaf key: {e}")))?;

        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| ProxyError::TlsInterceptionFailure(format!("invalid SAN {host:?}: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let issuer = self.issuer_certificate()?;
        let leaf_cert = params
            .signed_by(&leaf_key, &issuer, &self.ca_key)
            .map_err(|e| ProxyError::TlsInterceptionFailure(format!("signing leaf for {host}: {e}")))?;

        let cert_der = leaf_cert.der().clone();
        let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(leaf_key.serialize_der().into());
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| ProxyError::TlsInterceptionFailure(format!("loading leaf signing key: {e}")))?;

        Ok(Arc::new(CertifiedKey::new(vec![cert_der], signing_key)))
    }

    /// Get or generate the leaf certificate for `host`, caching the result.
    pub fn leaf_for(&self, host: &str) -> ProxyResult<Arc<CertifiedKey>> {
        if let Some(cached) = self.leaf_cache.get(host) {
            return Ok(cached);
        }
        let leaf = self.issue_leaf(host)?;
        self.leaf_cache.insert(host.to_string(), Arc::clone(&leaf));
        Ok(leaf)
    }

    /// Build a `TlsAcceptor` that selects a per-host leaf certificate based
    /// on the client's SNI, terminating TLS directly on the client socket.
    pub fn acceptor(self: &Arc<Self>) -> ProxyResult<TlsAcceptor> {
        let resolver: Arc<dyn ResolvesServerCert> = Arc::new(SniCertResolver {
            ca: Arc::clone(self),
        });
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

struct SniCertResolver {
    ca: Arc<CertificateAuthority>,
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello.server_name()?;
        self.ca.leaf_for(host).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_certificates_are_cached_per_host() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(
            &dir.path().join("ca-cert.pem"),
            &dir.path().join("ca-key.pem"),
        )
        .unwrap();

        let first = ca.leaf_for("example.com").unwrap();
        let second = ca.leaf_for("example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn reload_from_disk_reuses_the_same_ca() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca-cert.pem");
        let key_path = dir.path().join("ca-key.pem");

        let first = CertificateAuthority::load_or_create(&cert_path, &key_path).unwrap();
        let second = CertificateAuthority::load_or_create(&cert_path, &key_path).unwrap();
        assert_eq!(first.ca_cert_pem, second.ca_cert_pem);
    }
}
