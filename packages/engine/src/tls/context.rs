//! TLS profile registry
//!
//! Resolves profile names to rustls configuration. The context is an
//! explicit, shared collaborator passed into connections by the owning
//! application; the engine never holds process-wide TLS state.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, ServerConfig, ServerConnection, SignatureScheme};

use crate::error::{Error, Result};

use super::RustlsEngine;

/// One named TLS profile: trust roots plus our own identity.
#[derive(Debug, Clone, Default)]
pub struct TlsProfile {
    /// PEM file with extra trust anchors for peer verification.
    pub ca_file: Option<PathBuf>,
    /// PEM file with our certificate chain (client or server identity).
    pub cert_file: Option<PathBuf>,
    /// PEM file with the matching private key.
    pub key_file: Option<PathBuf>,
    /// Load the platform trust store in addition to any CA file.
    pub use_native_roots: bool,
    /// Fall back to the bundled webpki roots when nothing else is given.
    pub use_webpki_roots: bool,
    /// Verify the peer certificate. Disabling this accepts any peer and is
    /// reflected in the `verified` flag reported with the certificate.
    pub verify_peer: bool,
}

impl TlsProfile {
    /// The sensible client default: webpki roots, peer verification on.
    #[must_use]
    pub fn client_default() -> Self {
        Self {
            use_webpki_roots: true,
            verify_peer: true,
            ..Self::default()
        }
    }
}

/// Registry mapping profile names to TLS configuration.
pub struct TlsContext {
    profiles: HashMap<String, TlsProfile>,
}

impl TlsContext {
    #[must_use]
    pub fn new() -> Self {
        // Pin the ring provider so config builders are deterministic no
        // matter which provider features downstream crates enable.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let mut profiles = HashMap::new();
        profiles.insert("default".to_string(), TlsProfile::client_default());
        Self { profiles }
    }

    /// Whether TLS support is available in this build.
    #[must_use]
    pub fn available() -> bool {
        true
    }

    /// Register or replace a named profile.
    pub fn insert_profile(&mut self, name: impl Into<String>, profile: TlsProfile) {
        self.profiles.insert(name.into(), profile);
    }

    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&TlsProfile> {
        self.profiles.get(name)
    }

    /// Build a client-side engine for `profile`, verifying the peer as
    /// `server_name`.
    pub fn client_engine(&self, profile: &str, server_name: &str) -> Result<RustlsEngine> {
        let profile = self
            .profiles
            .get(profile)
            .ok_or_else(|| Error::Read(format!("unknown TLS profile '{profile}'")))?;

        let builder = ClientConfig::builder();
        let config = if profile.verify_peer {
            let roots = self.load_roots(profile)?;
            let builder = builder.with_root_certificates(roots);
            match self.load_identity(profile)? {
                Some((chain, key)) => builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| Error::Read(format!("TLS client identity rejected: {e}")))?,
                None => builder.with_no_client_auth(),
            }
        } else {
            let verifier = Arc::new(AcceptAnyServerCert::new());
            let builder = builder
                .dangerous()
                .with_custom_certificate_verifier(verifier);
            match self.load_identity(profile)? {
                Some((chain, key)) => builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| Error::Read(format!("TLS client identity rejected: {e}")))?,
                None => builder.with_no_client_auth(),
            }
        };

        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| Error::Read(format!("invalid TLS server name '{server_name}': {e}")))?;
        let conn = ClientConnection::new(Arc::new(config), name)
            .map_err(|e| Error::Read(format!("TLS session setup failed: {e}")))?;
        Ok(RustlsEngine::client(conn, profile.verify_peer))
    }

    /// Build a server-side engine for `profile`. Requires an identity.
    pub fn server_engine(&self, profile: &str) -> Result<RustlsEngine> {
        let profile = self
            .profiles
            .get(profile)
            .ok_or_else(|| Error::Read(format!("unknown TLS profile '{profile}'")))?;
        let (chain, key) = self
            .load_identity(profile)?
            .ok_or_else(|| Error::Read("TLS server profile has no certificate/key".into()))?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| Error::Read(format!("TLS server identity rejected: {e}")))?;
        let conn = ServerConnection::new(Arc::new(config))
            .map_err(|e| Error::Read(format!("TLS session setup failed: {e}")))?;
        Ok(RustlsEngine::server(conn))
    }

    fn load_roots(&self, profile: &TlsProfile) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        if let Some(path) = &profile.ca_file {
            let file = File::open(path)
                .map_err(|e| Error::Read(format!("cannot open CA file {}: {e}", path.display())))?;
            let certs: Vec<CertificateDer<'static>> =
                rustls_pemfile::certs(&mut BufReader::new(file))
                    .collect::<std::io::Result<_>>()
                    .map_err(|e| {
                        Error::Read(format!("cannot parse CA file {}: {e}", path.display()))
                    })?;
            let (added, ignored) = roots.add_parsable_certificates(certs);
            tracing::debug!("loaded {added} CA certificates ({ignored} ignored)");
        }
        if profile.use_native_roots {
            let result = rustls_native_certs::load_native_certs();
            for err in &result.errors {
                tracing::warn!("native root store: {err}");
            }
            let (added, _ignored) = roots.add_parsable_certificates(result.certs);
            tracing::debug!("loaded {added} native root certificates");
        }
        if profile.use_webpki_roots || roots.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        Ok(roots)
    }

    #[allow(clippy::type_complexity)]
    fn load_identity(
        &self,
        profile: &TlsProfile,
    ) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
        let (Some(cert_path), Some(key_path)) = (&profile.cert_file, &profile.key_file) else {
            return Ok(None);
        };
        let cert_file = File::open(cert_path).map_err(|e| {
            Error::Read(format!(
                "cannot open certificate {}: {e}",
                cert_path.display()
            ))
        })?;
        let chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_file))
                .collect::<std::io::Result<_>>()
                .map_err(|e| {
                    Error::Read(format!(
                        "cannot parse certificate {}: {e}",
                        cert_path.display()
                    ))
                })?;
        let key_file = File::open(key_path)
            .map_err(|e| Error::Read(format!("cannot open key {}: {e}", key_path.display())))?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|e| Error::Read(format!("cannot parse key {}: {e}", key_path.display())))?
            .ok_or_else(|| Error::Read(format!("no private key in {}", key_path.display())))?;
        Ok(Some((chain, key)))
    }
}

impl Default for TlsContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Verifier used when a profile opts out of peer verification. The
/// handshake still runs; the reported certificate carries `verified: false`.
#[derive(Debug)]
struct AcceptAnyServerCert {
    schemes: Vec<SignatureScheme>,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        let schemes = rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default();
        Self { schemes }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
