//! TLS configuration
//!
//! The listener presents a certificate produced outside tether (usually
//! self-signed). Agents therefore do not validate it against a CA: the
//! client verifier accepts any chain but still checks handshake signatures,
//! and identity is established afterwards by fingerprint pinning in
//! [`crate::auth`].

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};

use tether_protocol::auth::certificate_fingerprint;

use crate::error::ConfigError;

/// Protocol versions offered by both sides (TLS 1.2 minimum)
static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn cert_error(path: &Path, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Certificate {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Load a PEM certificate chain
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let pem = std::fs::read(path).map_err(|e| cert_error(path, e))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| cert_error(path, e))?;

    if certs.is_empty() {
        return Err(cert_error(path, "no certificates found"));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let pem = std::fs::read(path).map_err(|e| cert_error(path, e))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| cert_error(path, e))?
        .ok_or_else(|| cert_error(path, "no private key found"))
}

/// SHA-256 fingerprint of the end-entity certificate in a PEM file
pub fn fingerprint_of_pem(path: &Path) -> Result<String, ConfigError> {
    let certs = load_certs(path)?;
    Ok(certificate_fingerprint(certs[0].as_ref()))
}

/// Build the listener's server configuration
pub fn server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, ConfigError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(|e| cert_error(cert_path, e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| cert_error(key_path, e))?;

    Ok(Arc::new(config))
}

/// Build the agent's client configuration
pub fn client_config() -> Result<Arc<ClientConfig>, ConfigError> {
    let provider = provider();
    let verifier = Arc::new(PinnedLaterVerifier {
        provider: provider.clone(),
    });

    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(|e| ConfigError::Invalid(format!("TLS client setup failed: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Server name to present in SNI for a `host:port` target
pub fn server_name(target: &str) -> Option<ServerName<'static>> {
    let host = match target.rsplit_once(':') {
        Some((host, _port)) => host,
        None => target,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string()).ok()
}

/// Accepts any server chain; pinning happens after the handshake
#[derive(Debug)]
struct PinnedLaterVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedLaterVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_pair(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf, Vec<u8>) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("listener.crt");
        let key_path = dir.join("listener.key");
        std::fs::File::create(&cert_path)
            .unwrap()
            .write_all(certified.cert.pem().as_bytes())
            .unwrap();
        std::fs::File::create(&key_path)
            .unwrap()
            .write_all(certified.key_pair.serialize_pem().as_bytes())
            .unwrap();
        (cert_path, key_path, certified.cert.der().to_vec())
    }

    #[test]
    fn test_server_config_from_pem() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key, _) = write_pair(dir.path());
        assert!(server_config(&cert, &key).is_ok());
    }

    #[test]
    fn test_fingerprint_of_pem_matches_der() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, _, der) = write_pair(dir.path());
        assert_eq!(fingerprint_of_pem(&cert).unwrap(), certificate_fingerprint(&der));
    }

    #[test]
    fn test_missing_files_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.crt");
        assert!(matches!(
            server_config(&missing, &missing),
            Err(ConfigError::Certificate { .. })
        ));
    }

    #[test]
    fn test_key_file_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, _, _) = write_pair(dir.path());
        // A certificate file holds no private key
        assert!(load_private_key(&cert).is_err());
    }

    #[test]
    fn test_client_config_builds() {
        assert!(client_config().is_ok());
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("listener.example:8443").is_some());
        assert!(server_name("10.1.2.3:8443").is_some());
        assert!(server_name("[::1]:8443").is_some());
    }
}
