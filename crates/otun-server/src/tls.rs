//! TLS termination for the public listener.
//!
//! Certificate acquisition is a black-box seam: anything that can produce
//! a certified key for a hostname (an ACME client, a wildcard cert on
//! disk, the built-in development issuer) plugs in behind
//! [`CertificateResolver`]. The host policy lives in front of the seam:
//! a certificate is only ever resolved for hosts whose subdomain is
//! currently registered, so an attacker cannot drive issuance for
//! arbitrary names.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::http::extract_subdomain;
use crate::registry::TunnelRegistry;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    CertGen(String),

    #[error("invalid private key: {0}")]
    Key(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces certificates for public hostnames.
///
/// The edge treats this as a `get_certificate(hostname)` black box; ACME
/// providers implement it against their own account and challenge state.
pub trait CertificateResolver: Send + Sync {
    /// Returns the certified key for `hostname`, or `None` to refuse the
    /// handshake.
    fn resolve(&self, hostname: &str) -> Option<Arc<CertifiedKey>>;

    /// The key authorization for a pending ACME HTTP-01 challenge token,
    /// if the provider has one outstanding.
    fn challenge_response(&self, _token: &str) -> Option<String> {
        None
    }
}

/// rustls certificate resolver that applies the registry host policy
/// before consulting the inner provider.
pub struct PolicyResolver {
    registry: Arc<TunnelRegistry>,
    inner: Arc<dyn CertificateResolver>,
}

impl PolicyResolver {
    pub fn new(registry: Arc<TunnelRegistry>, inner: Arc<dyn CertificateResolver>) -> Self {
        Self { registry, inner }
    }

    pub fn provider(&self) -> Arc<dyn CertificateResolver> {
        self.inner.clone()
    }
}

impl std::fmt::Debug for PolicyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for PolicyResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        let subdomain = extract_subdomain(name)?;
        if !self.registry.contains(&subdomain) {
            debug!(host = name, "refusing certificate for unregistered subdomain");
            return None;
        }
        info!(host = name, subdomain = %subdomain, "allowing certificate");
        self.inner.resolve(name)
    }
}

/// Builds the public TLS configuration. HTTP/1.1 only: the request path
/// hands the decrypted connection to a raw splice, which HTTP/2 framing
/// cannot survive.
pub fn server_config(resolver: Arc<PolicyResolver>) -> rustls::ServerConfig {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

/// Development certificate issuer: a per-host self-signed certificate,
/// cached in memory and persisted as DER under the cert directory.
pub struct DevCertResolver {
    cert_dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl DevCertResolver {
    pub fn new(cert_dir: PathBuf) -> Self {
        Self {
            cert_dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn load_or_issue(&self, hostname: &str) -> Result<Arc<CertifiedKey>, TlsError> {
        let cert_path = self.cert_dir.join(format!("{hostname}.crt"));
        let key_path = self.cert_dir.join(format!("{hostname}.key"));

        let (cert_der, key_der) = if cert_path.is_file() && key_path.is_file() {
            (std::fs::read(&cert_path)?, std::fs::read(&key_path)?)
        } else {
            let (cert_der, key_der) = issue_self_signed(hostname)?;
            if let Err(e) = self.persist(&cert_path, &key_path, &cert_der, &key_der) {
                warn!(host = hostname, error = %e, "failed to persist certificate");
            }
            (cert_der, key_der)
        };

        let key = PrivateKeyDer::try_from(key_der)
            .map_err(|e| TlsError::Key(format!("{e:?}")))?;
        let signing_key =
            any_supported_type(&key).map_err(|e| TlsError::Key(e.to_string()))?;

        Ok(Arc::new(CertifiedKey::new(
            vec![CertificateDer::from(cert_der)],
            signing_key,
        )))
    }

    fn persist(
        &self,
        cert_path: &std::path::Path,
        key_path: &std::path::Path,
        cert_der: &[u8],
        key_der: &[u8],
    ) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.cert_dir)?;
        std::fs::write(cert_path, cert_der)?;
        std::fs::write(key_path, key_der)
    }
}

impl CertificateResolver for DevCertResolver {
    fn resolve(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(key) = self.cache.lock().unwrap().get(hostname) {
            return Some(key.clone());
        }
        match self.load_or_issue(hostname) {
            Ok(key) => {
                self.cache
                    .lock()
                    .unwrap()
                    .insert(hostname.to_string(), key.clone());
                Some(key)
            }
            Err(e) => {
                warn!(host = hostname, error = %e, "certificate issuance failed");
                None
            }
        }
    }
}

/// Generates a self-signed certificate for one hostname, returning
/// (certificate DER, PKCS#8 key DER).
fn issue_self_signed(hostname: &str) -> Result<(Vec<u8>, Vec<u8>), TlsError> {
    let mut params = rcgen::CertificateParams::new(vec![hostname.to_string()])
        .map_err(|e| TlsError::CertGen(e.to_string()))?;

    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, hostname);
    dn.push(rcgen::DnType::OrganizationName, "otun development");
    params.distinguished_name = dn;
    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| TlsError::CertGen(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::CertGen(e.to_string()))?;

    Ok((cert.der().to_vec(), key_pair.serialize_der()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    #[test]
    fn test_dev_resolver_issues_and_caches() {
        install_provider();
        let dir = tempfile::tempdir().unwrap();
        let resolver = DevCertResolver::new(dir.path().to_path_buf());

        let first = resolver.resolve("demo.tunnel.localhost").unwrap();
        let second = resolver.resolve("demo.tunnel.localhost").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // Persisted for the next process.
        assert!(dir.path().join("demo.tunnel.localhost.crt").is_file());
        assert!(dir.path().join("demo.tunnel.localhost.key").is_file());
    }

    #[test]
    fn test_dev_resolver_reloads_from_disk() {
        install_provider();
        let dir = tempfile::tempdir().unwrap();

        let cert_der = {
            let resolver = DevCertResolver::new(dir.path().to_path_buf());
            resolver.resolve("a.localhost").unwrap().cert[0].clone()
        };

        // A fresh resolver must load the same certificate, not mint a new one.
        let resolver = DevCertResolver::new(dir.path().to_path_buf());
        let reloaded = resolver.resolve("a.localhost").unwrap();
        assert_eq!(reloaded.cert[0], cert_der);
    }

    #[test]
    fn test_default_challenge_response_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DevCertResolver::new(dir.path().to_path_buf());
        assert!(resolver.challenge_response("token").is_none());
    }
}
