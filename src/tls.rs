//! TLS layering over the raw TCP stream.
//!
//! TLS is negotiated immediately at accept/connect, before any envelope
//! bytes flow. Certificates come either from PEM files or from an
//! in-memory rustls config handle supplied by the caller; certificate
//! parsing beyond PEM decoding is the caller's concern.

use crate::error::Error;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{
    self, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
    server::WebPkiClientVerifier,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// A PEM certificate/key pair on disk.
#[derive(Debug, Clone)]
pub struct PemIdentity {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Clone, Default)]
pub struct TlsServerSettings {
    /// PEM identity presented to clients.
    pub certificate: Option<PemIdentity>,
    /// Pre-built config; takes precedence over `certificate`.
    pub preconfigured: Option<Arc<rustls::ServerConfig>>,
    /// Require and verify a client certificate.
    pub mutually_authenticate: bool,
    /// Roots used to verify client certificates when mutual auth is on.
    pub client_ca_certificate_path: Option<PathBuf>,
}

#[derive(Clone, Default)]
pub struct TlsClientSettings {
    /// SNI / verification name; defaults to the connect host.
    pub server_name: Option<String>,
    /// Skip server certificate verification entirely. Test rigs only.
    pub accept_invalid_certificates: bool,
    /// Present a client certificate; requires `client_certificate`.
    pub mutually_authenticate: bool,
    pub client_certificate: Option<PemIdentity>,
    /// Roots used to verify the server; system webpki roots when absent.
    pub ca_certificate_path: Option<PathBuf>,
    /// Pre-built config; takes precedence over every other knob here.
    pub preconfigured: Option<Arc<rustls::ClientConfig>>,
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// The session byte stream: raw TCP or TLS over it.
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub(crate) fn build_acceptor(settings: &TlsServerSettings) -> Result<TlsAcceptor, Error> {
    if let Some(config) = &settings.preconfigured {
        return Ok(TlsAcceptor::from(config.clone()));
    }
    let identity = settings.certificate.as_ref().ok_or_else(|| {
        Error::InvalidSettings("TLS enabled without a certificate or preconfigured config".into())
    })?;
    let certs = load_certs(&identity.cert_path)?;
    let key = load_key(&identity.key_path)?;

    let builder = if settings.mutually_authenticate {
        let ca_path = settings.client_ca_certificate_path.as_ref().ok_or_else(|| {
            Error::InvalidSettings(
                "mutual authentication requires client_ca_certificate_path".into(),
            )
        })?;
        let roots = load_root_store(ca_path)?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::Tls(e.to_string()))?;
        rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
    } else {
        rustls::ServerConfig::builder().with_no_client_auth()
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

pub(crate) fn build_connector(settings: &TlsClientSettings) -> Result<TlsConnector, Error> {
    if let Some(config) = &settings.preconfigured {
        return Ok(TlsConnector::from(config.clone()));
    }

    let builder = if settings.accept_invalid_certificates {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
    } else {
        let roots = match &settings.ca_certificate_path {
            Some(path) => load_root_store(path)?,
            None => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                roots
            }
        };
        rustls::ClientConfig::builder().with_root_certificates(roots)
    };

    let config = match &settings.client_certificate {
        Some(identity) => {
            let certs = load_certs(&identity.cert_path)?;
            let key = load_key(&identity.key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::Tls(e.to_string()))?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Resolve the name the server certificate is verified against.
pub(crate) fn server_name_for(
    settings: &TlsClientSettings,
    host: &str,
) -> Result<ServerName<'static>, Error> {
    let name = settings.server_name.clone().unwrap_or_else(|| host.to_owned());
    ServerName::try_from(name.clone())
        .map_err(|_| Error::Tls(format!("invalid TLS server name `{name}`")))
}

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let bytes = std::fs::read(path)?;
    let certs = CertificateDer::pem_slice_iter(&bytes)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("{}: {e:?}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, Error> {
    let bytes = std::fs::read(path)?;
    PrivateKeyDer::from_pem_slice(&bytes)
        .map_err(|e| Error::Tls(format!("{}: {e:?}", path.display())))
}

fn load_root_store(path: &std::path::Path) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::Tls(e.to_string()))?;
    }
    Ok(roots)
}

// ---------------------------------------------------------------------------
// AcceptAnyServerCert
// ---------------------------------------------------------------------------

/// Verifier behind `accept_invalid_certificates`: trusts any presented
/// chain while still checking handshake signatures with the default
/// provider's algorithms.
#[derive(Debug)]
struct AcceptAnyServerCert(rustls::crypto::WebPkiSupportedAlgorithms);

impl AcceptAnyServerCert {
    fn new() -> Self {
        AcceptAnyServerCert(
            rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
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
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_schemes()
    }
}
