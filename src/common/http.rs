use bytes::Bytes;
use http_body_util::Full;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;

use crate::error::{DavError, DavResult};

/// Type alias for the Hyper client used across the DAV modules.
pub type HyperClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// TLS peer-verification policy for the transport.
///
/// The default verifies the server certificate against the platform trust
/// store (with the bundled WebPKI roots as fallback). `DangerNoVerify`
/// accepts any certificate and is only meant for test fixtures and
/// appliances with self-signed certificates; hosts must opt into it
/// explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    #[default]
    Secure,
    DangerNoVerify,
}

/// Build a Hyper client configured with HTTP/2, connection pooling, and a TLS
/// connector that prefers native roots but falls back to the bundled WebPKI
/// store.
pub fn build_hyper_client(tls: TlsMode) -> DavResult<HyperClient> {
    let https_builder = match tls {
        TlsMode::Secure => HttpsConnectorBuilder::new()
            .with_native_roots()
            .unwrap_or_else(|err| {
                tracing::debug!("falling back to webpki roots (native roots unavailable: {err})");
                HttpsConnectorBuilder::new().with_webpki_roots()
            }),
        TlsMode::DangerNoVerify => {
            tracing::warn!("TLS peer verification disabled, accepting any server certificate");
            let config = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification))
                .with_no_client_auth();
            HttpsConnectorBuilder::new().with_tls_config(config)
        }
    };

    let https = https_builder
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();

    Ok(Client::builder(TokioExecutor::new())
        .http2_adaptive_window(true)
        .pool_max_idle_per_host(128)
        .build::<_, Full<Bytes>>(https))
}

/// Certificate verifier that accepts everything. Installed only for
/// [`TlsMode::DangerNoVerify`].
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA1,
            ECDSA_SHA1_Legacy,
            RSA_PKCS1_SHA256,
            ECDSA_NISTP256_SHA256,
            RSA_PKCS1_SHA384,
            ECDSA_NISTP384_SHA384,
            RSA_PKCS1_SHA512,
            ECDSA_NISTP521_SHA512,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            ED25519,
        ]
    }
}

/// Extract the `scheme://host[:port]` part of a URL, used to resolve
/// root-relative hrefs returned by discovery steps.
pub fn url_host_part(url: &str) -> DavResult<String> {
    let parsed = url::Url::parse(url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| DavError::Network(format!("URL has no host: {url}")))?;
    match parsed.port() {
        Some(port) => Ok(format!("{}://{}:{}", parsed.scheme(), host, port)),
        None => Ok(format!("{}://{}", parsed.scheme(), host)),
    }
}
