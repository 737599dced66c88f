//! rustls client configuration built from [`TlsOptions`].

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::warn;

use crate::config::TlsOptions;
use crate::error::ClientError;

fn tls_error(e: impl std::fmt::Display) -> ClientError {
    ClientError::Tls(e.to_string())
}

/// Builds the rustls config for `options`, reading any PEM files now.
pub(crate) fn client_config(options: &TlsOptions) -> Result<Arc<ClientConfig>, ClientError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?;

    let builder = if options.accept_invalid_certs {
        warn!("TLS certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
    } else {
        builder.with_root_certificates(root_store(options.ca_file.as_deref())?)
    };

    let config = match (&options.client_cert_file, &options.client_key_file) {
        (Some(cert), Some(key)) => {
            let chain = load_certs(cert)?;
            let key = PrivateKeyDer::from_pem_file(key)
                .map_err(|e| tls_error(format!("{}: {e}", key.display())))?;
            builder.with_client_auth_cert(chain, key).map_err(tls_error)?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(tls_error(
                "client certificate and client key must be configured together",
            ));
        }
    };
    Ok(Arc::new(config))
}

fn root_store(ca_file: Option<&Path>) -> Result<RootCertStore, ClientError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = ca_file {
        for cert in load_certs(path)? {
            roots.add(cert).map_err(tls_error)?;
        }
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .map_err(|e| tls_error(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(tls_error(format!("{}: no certificates found", path.display())));
    }
    Ok(certs)
}

/// Accepts any server certificate. Handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
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
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_options_trust_web_roots() {
        let config = client_config(&TlsOptions::default()).unwrap();
        assert!(!config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn accepting_invalid_certs_builds() {
        let options = TlsOptions {
            accept_invalid_certs: true,
            ..TlsOptions::default()
        };
        assert!(client_config(&options).is_ok());
    }

    #[test]
    fn missing_ca_file_is_reported() {
        let options = TlsOptions {
            ca_file: Some("/nonexistent/kolibri-ca.pem".into()),
            ..TlsOptions::default()
        };
        match client_config(&options) {
            Err(ClientError::Tls(msg)) => assert!(msg.contains("kolibri-ca.pem")),
            other => panic!("expected TLS error, got {other:?}"),
        }
    }

    #[test]
    fn ca_file_without_certificates_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let options = TlsOptions {
            ca_file: Some(file.path().to_path_buf()),
            ..TlsOptions::default()
        };
        match client_config(&options) {
            Err(ClientError::Tls(msg)) => assert!(msg.contains("no certificates found")),
            other => panic!("expected TLS error, got {other:?}"),
        }
    }

    #[test]
    fn client_cert_needs_key() {
        let options = TlsOptions {
            client_cert_file: Some("/etc/kolibri/client.pem".into()),
            ..TlsOptions::default()
        };
        assert!(matches!(client_config(&options), Err(ClientError::Tls(_))));
    }
}
