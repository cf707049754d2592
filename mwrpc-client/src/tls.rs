//! TLS client configuration for `wss://` endpoints.

use crate::connection::TlsClientConfig;
use crate::error::ClientError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Builds a rustls client configuration.
///
/// Uses the CA file when given, otherwise the bundled webpki roots. A client
/// certificate is presented only when both cert and key paths are set.
pub fn client_config(config: &TlsClientConfig) -> Result<Arc<rustls::ClientConfig>, ClientError> {
    // Pinned: more than one provider may be compiled in through the
    // WebSocket stack.
    let provider = Arc::new(aws_lc_rs::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::TlsConfig(e.to_string()))?;

    if config.insecure {
        tracing::warn!("Using insecure TLS (certificate verification disabled)");
        let client_config = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
            .with_no_client_auth();
        return Ok(Arc::new(client_config));
    }

    let builder = builder.with_root_certificates(root_store(config.ca_cert_path.as_deref())?);

    let client_config = match (&config.client_cert_path, &config.client_key_path) {
        (Some(cert_path), Some(key_path)) => builder
            .with_client_auth_cert(load_certs(cert_path)?, load_private_key(key_path)?)
            .map_err(|e| ClientError::TlsConfig(format!("invalid client cert/key: {}", e)))?,
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(client_config))
}

fn root_store(ca_path: Option<&Path>) -> Result<RootCertStore, ClientError> {
    let Some(path) = ca_path else {
        return Ok(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        });
    };

    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(load_certs(path)?);
    if ignored > 0 {
        tracing::warn!("skipped {} unusable CA certificate(s) in {:?}", ignored, path);
    }
    if added == 0 {
        return Err(ClientError::TlsConfig(format!(
            "no usable CA certificate in {:?}",
            path
        )));
    }
    Ok(store)
}

/// Accepts any server certificate but still checks handshake signatures.
/// Development only: self-signed NAS certificates are common.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
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
            &self.0.signature_verification_algorithms,
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
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn open_pem(path: &Path) -> Result<BufReader<File>, ClientError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open {:?}: {}", path, e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    rustls_pemfile::certs(&mut open_pem(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    rustls_pemfile::private_key(&mut open_pem(path)?)
        .map_err(|e| ClientError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        .ok_or_else(|| ClientError::TlsConfig(format!("no private key found in {:?}", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_files_are_config_errors() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(err.to_string().contains("cannot open"));

        let err = load_private_key(Path::new("/nonexistent/key.pem")).unwrap_err();
        assert!(err.to_string().contains("cannot open"));

        let config = TlsClientConfig::new().with_ca_cert("/nonexistent/ca.pem");
        assert!(matches!(
            client_config(&config),
            Err(ClientError::TlsConfig(_))
        ));
    }

    #[test]
    fn test_ca_file_without_certificates_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        let config = TlsClientConfig::new().with_ca_cert(file.path());
        let err = client_config(&config).unwrap_err();
        assert!(err.to_string().contains("no usable CA certificate"));
    }

    #[test]
    fn test_key_file_without_key_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = load_private_key(file.path()).unwrap_err();
        assert!(err.to_string().contains("no private key"));
    }

    #[test]
    fn test_default_roots_are_bundled() {
        let store = root_store(None).unwrap();
        assert_eq!(store.len(), webpki_roots::TLS_SERVER_ROOTS.len());
    }

    #[test]
    fn test_insecure_verifier_uses_provider_schemes() {
        let provider = Arc::new(aws_lc_rs::default_provider());
        let verifier = AcceptAnyServerCert(Arc::clone(&provider));
        let schemes = verifier.supported_verify_schemes();
        assert!(!schemes.is_empty());
        assert_eq!(
            schemes,
            provider.signature_verification_algorithms.supported_schemes()
        );
    }

    #[test]
    fn test_default_and_insecure_configs_build() {
        assert!(client_config(&TlsClientConfig::new()).is_ok());
        assert!(client_config(&TlsClientConfig::new().with_insecure()).is_ok());
    }
}
