//! Self-signed TLS material.

use rcgen::{CertifiedKey, generate_simple_self_signed};
use rstest::fixture;
use rustls::{
    RootCertStore,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
};
use wirelink::{TlsClientConfig, TlsError, TlsServerConfig};

/// Names the fixture certificate is valid for.
pub const CERT_NAMES: [&str; 2] = ["localhost", "example.com"];

/// A self-signed certificate with its key.
pub struct TlsFixture {
    cert: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
}

impl TlsFixture {
    /// Issue a certificate for [`CERT_NAMES`].
    ///
    /// # Errors
    ///
    /// Returns [`rcgen::Error`] if the certificate cannot be generated.
    pub fn generate() -> Result<Self, rcgen::Error> {
        let names: Vec<String> = CERT_NAMES.iter().map(|n| (*n).to_owned()).collect();
        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(names)?;
        Ok(Self {
            cert: cert.der().clone(),
            key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
        })
    }

    /// Server configuration presenting the certificate.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError`] if rustls rejects the key.
    pub fn server(&self) -> Result<TlsServerConfig, TlsError> {
        TlsServerConfig::from_der(
            vec![self.cert.clone()],
            PrivateKeyDer::Pkcs8(self.key.clone_key()),
        )
    }

    /// Client configuration trusting only the certificate.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError`] if rustls rejects the configuration.
    pub fn client(&self) -> Result<TlsClientConfig, TlsError> {
        TlsClientConfig::with_root_certificates(self.roots())
    }

    /// Trust store holding only the certificate.
    #[must_use]
    pub fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        // A freshly generated certificate always parses.
        let _ = roots.add(self.cert.clone());
        roots
    }

    /// DER encoded certificate.
    #[must_use]
    pub fn cert(&self) -> &CertificateDer<'static> { &self.cert }

    /// PKCS#8 encoded private key.
    #[must_use]
    pub fn key(&self) -> PrivateKeyDer<'static> { PrivateKeyDer::Pkcs8(self.key.clone_key()) }
}

/// Fixture issuing a fresh certificate per test.
///
/// # Panics
///
/// Panics if certificate generation fails.
#[fixture]
pub fn tls_fixture() -> TlsFixture {
    TlsFixture::generate().expect("self-signed certificate")
}
