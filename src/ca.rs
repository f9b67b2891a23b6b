//! Local certificate authority.
//!
//! The CA key material itself comes from an external tool; this module
//! consumes its on-disk contract (PEM cert and key in the certs
//! directory), mints per-hostname leaf certificates on demand for the TLS
//! interception server, and exposes the root store used to verify local
//! backends.

use std::{
    collections::HashMap,
    fmt, fs,
    path::Path,
    sync::{Arc, Mutex},
};

use n0_error::{Result, StackResultExt, StdResultExt};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use rustls::{
    RootCertStore, ServerConfig,
    crypto::aws_lc_rs,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tracing::debug;

/// File name of the CA certificate inside the certs directory.
pub const CA_CERT_FILE: &str = "rootCA.pem";
/// File name of the CA private key inside the certs directory.
pub const CA_KEY_FILE: &str = "rootCA-key.pem";

const CA_NAME: &str = "wip-proxy development CA";

/// A certificate authority able to sign per-host leaf certificates.
pub struct CertificateAuthority {
    issuer_cert: rcgen::Certificate,
    issuer_key: KeyPair,
    root_der: CertificateDer<'static>,
}

impl CertificateAuthority {
    /// Loads the CA from a certs directory.
    ///
    /// Returns `None` when no CA has been installed there yet.
    pub fn load(dir: impl AsRef<Path>) -> Result<Option<Self>> {
        let dir = dir.as_ref();
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }
        let cert_pem = fs::read_to_string(&cert_path).anyerr()?;
        let key_pem = fs::read_to_string(&key_path).anyerr()?;
        Self::from_pem(&cert_pem, &key_pem).map(Some)
    }

    /// Builds the CA from PEM-encoded certificate and key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let issuer_key = KeyPair::from_pem(key_pem).std_context("invalid CA key")?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .std_context("invalid CA certificate")?;
        let issuer_cert = params
            .self_signed(&issuer_key)
            .std_context("unable to rebuild CA certificate")?;

        // Clients must trust the stored root, so keep its exact DER as the
        // trust anchor rather than the re-signed copy.
        let root_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .context("no certificate in CA PEM")?
            .std_context("invalid CA certificate PEM")?;

        Ok(Self {
            issuer_cert,
            issuer_key,
            root_der,
        })
    }

    /// Generates a fresh CA and writes it into the certs directory.
    pub fn bootstrap(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).anyerr()?;

        let issuer_key = KeyPair::generate().std_context("unable to generate CA key")?;
        let mut params = CertificateParams::new(Vec::new())
            .std_context("unable to build CA certificate parameters")?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::OrganizationName, CA_NAME);
        params.distinguished_name.push(DnType::CommonName, CA_NAME);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::CrlSign,
        ];
        let issuer_cert = params
            .self_signed(&issuer_key)
            .std_context("unable to self-sign CA certificate")?;

        fs::write(dir.join(CA_CERT_FILE), issuer_cert.pem()).anyerr()?;
        fs::write(dir.join(CA_KEY_FILE), issuer_key.serialize_pem()).anyerr()?;

        let root_der = issuer_cert.der().clone();
        Ok(Self {
            issuer_cert,
            issuer_key,
            root_der,
        })
    }

    /// DER encoding of the root certificate.
    pub fn root_certificate_der(&self) -> CertificateDer<'static> {
        self.root_der.clone()
    }

    /// A root store trusting only this CA.
    pub fn root_store(&self) -> RootCertStore {
        let mut store = RootCertStore::empty();
        store.add(self.root_der.clone()).ok();
        store
    }

    /// Server-side TLS configuration minting a certificate per SNI.
    ///
    /// ALPN prefers `http/1.1`; `h2` is accepted only to let the `PRI`
    /// guard answer clients that refuse HTTP/1.
    pub fn server_config(self: &Arc<Self>) -> Arc<ServerConfig> {
        let resolver = MintingResolver {
            ca: self.clone(),
            cache: Mutex::new(HashMap::new()),
        };
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        config.alpn_protocols = vec![
            b"http/1.1".to_vec(),
            b"h2".to_vec(),
            b"http/1.0".to_vec(),
        ];
        Arc::new(config)
    }

    /// Mints a leaf certificate for the given hostname, signed by this CA.
    fn mint(&self, hostname: &str) -> Result<Arc<CertifiedKey>> {
        let mut params = CertificateParams::new(vec![hostname.to_string()])
            .std_context("invalid hostname for certificate")?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.distinguished_name.push(DnType::CommonName, hostname);

        let key_pair = KeyPair::generate().std_context("unable to generate leaf key")?;
        let key_der = PrivateKeyDer::Pkcs8(key_pair.serialized_der().to_vec().into());
        let cert = params
            .signed_by(&key_pair, &self.issuer_cert, &self.issuer_key)
            .std_context("unable to sign leaf certificate")?;

        let signing_key =
            aws_lc_rs::sign::any_supported_type(&key_der).std_context("unsupported leaf key")?;
        Ok(Arc::new(CertifiedKey::new(
            vec![cert.der().clone()],
            signing_key,
        )))
    }
}

/// Root store with the system (webpki) trust anchors.
pub(crate) fn system_roots() -> RootCertStore {
    let mut store = RootCertStore::empty();
    store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    store
}

/// Client-side TLS configuration for dialing an intercepted backend.
pub(crate) fn upstream_client_config(
    roots: RootCertStore,
    alpn: Vec<Vec<u8>>,
) -> Arc<rustls::ClientConfig> {
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn;
    Arc::new(config)
}

/// Certificate resolver minting and caching one leaf per SNI hostname.
struct MintingResolver {
    ca: Arc<CertificateAuthority>,
    cache: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl fmt::Debug for MintingResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MintingResolver")
    }
}

impl ResolvesServerCert for MintingResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name().unwrap_or("localhost").to_string();
        let mut cache = self.cache.lock().expect("certificate cache poisoned");
        if let Some(key) = cache.get(&sni) {
            return Some(key.clone());
        }
        match self.ca.mint(&sni) {
            Ok(key) => {
                debug!(%sni, "minted leaf certificate");
                cache.insert(sni, key.clone());
                Some(key)
            }
            Err(err) => {
                debug!(%sni, "failed to mint leaf certificate: {err:#}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::bootstrap(dir.path()).unwrap();
        assert!(dir.path().join(CA_CERT_FILE).exists());
        assert!(dir.path().join(CA_KEY_FILE).exists());

        let loaded = CertificateAuthority::load(dir.path()).unwrap().unwrap();
        assert_eq!(ca.root_certificate_der(), loaded.root_certificate_der());
    }

    #[test]
    fn load_without_files_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CertificateAuthority::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn mints_leaf_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::bootstrap(dir.path()).unwrap();
        let key = ca.mint("example.wip").unwrap();
        assert_eq!(key.cert.len(), 1);
        assert_eq!(ca.root_store().len(), 1);
    }
}
