use std::fs;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::client::danger::ServerCertVerified;
use rustls::client::danger::ServerCertVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::ServerName;
use rustls::pki_types::UnixTime;
use rustls::DigitallySignedStruct;
use rustls::SignatureScheme;
use sha2::Digest;
use sha2::Sha256;

use crate::configuration::ServerTlsSettings;

/// How an outbound HTTPS connection decides to trust its peer.
///
/// `assert_fingerprint` pins the peer's leaf certificate by SHA-256 digest and
/// bypasses chain validation entirely; it takes precedence when both are
/// supplied. Without a pin, `ca_bundle` (or the system roots) drive standard
/// chain+hostname verification, and `assert_hostname: Some(false)` downgrades
/// to accepting any certificate.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub ca_bundle: Option<PathBuf>,
    pub assert_hostname: Option<bool>,
    pub assert_fingerprint: Option<String>,
}

/// Normalize `aa:bb:…` / `AABB…` into digest bytes. Must name 32 bytes.
pub fn parse_fingerprint(fingerprint: &str) -> Result<Vec<u8>, String> {
    let hex_digits: String = fingerprint.chars().filter(|c| *c != ':').collect();
    let bytes = hex::decode(hex_digits.to_ascii_lowercase())
        .map_err(|_| format!("Invalid fingerprint: {fingerprint:?}"))?;
    if bytes.len() != Sha256::output_size() {
        return Err(format!(
            "Fingerprint must be a SHA-256 digest, got {} bytes",
            bytes.len()
        ));
    }
    Ok(bytes)
}

/// Accepts a peer iff the SHA-256 digest of its leaf certificate DER matches
/// the pinned value. Handshake signatures are still verified, so presenting
/// the pinned certificate without its private key fails.
#[derive(Debug)]
struct FingerprintVerifier {
    expected: Vec<u8>,
    provider: CryptoProvider,
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let digest = Sha256::digest(end_entity.as_ref());
        if digest.as_slice() == self.expected.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            tracing::warn!("peer certificate does not match the pinned fingerprint");
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
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

/// Build a reqwest client honoring `TlsOptions`.
pub fn build_client(
    options: &TlsOptions,
    timeout: Option<Duration>,
) -> Result<reqwest::Client, anyhow::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    if let Some(fingerprint) = &options.assert_fingerprint {
        let expected = parse_fingerprint(fingerprint)
            .map_err(|reason| anyhow::anyhow!("{reason}"))
            .context("invalid certificate fingerprint")?;
        let verifier = FingerprintVerifier {
            expected,
            provider: rustls::crypto::ring::default_provider(),
        };
        let config =
            rustls::ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .context("failed to select TLS protocol versions")?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        builder = builder.use_preconfigured_tls(config);
    } else {
        if let Some(ca_bundle) = &options.ca_bundle {
            let pem = fs::read(ca_bundle)
                .with_context(|| format!("failed to read CA bundle {}", ca_bundle.display()))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("invalid CA bundle {}", ca_bundle.display()))?;
            builder = builder.add_root_certificate(cert);
        }
        if options.assert_hostname == Some(false) {
            // the rustls backend has no hostname-only toggle
            builder = builder.danger_accept_invalid_certs(true);
        }
    }

    builder.build().context("failed to build HTTP client")
}

/// Load a PEM cert/key pair into a server config for a TLS-terminated
/// listener.
pub fn server_config(tls: &ServerTlsSettings) -> Result<rustls::ServerConfig, anyhow::Error> {
    let mut cert_reader = BufReader::new(
        File::open(&tls.cert)
            .with_context(|| format!("failed to open certificate {}", tls.cert.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid certificate {}", tls.cert.display()))?;

    let mut key_reader = BufReader::new(
        File::open(&tls.key)
            .with_context(|| format!("failed to open private key {}", tls.key.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("invalid private key {}", tls.key.display()))?
        .with_context(|| format!("no private key found in {}", tls.key.display()))?;

    rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("certificate/key mismatch")
}
