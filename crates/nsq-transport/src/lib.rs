//! Stream stack for a single NSQ connection.
//!
//! # Purpose
//! Dials the TCP connection, performs the optional mid-stream TLS upgrade,
//! and provides the Snappy/DEFLATE transforms that sit between the socket
//! and the frame codec once compression has been negotiated.
//!
//! # Design notes
//! Transforms are byte-level codecs rather than `AsyncRead` wrappers because
//! upgrades happen mid-stream: the `OK` frame confirming a compression
//! upgrade already arrives compressed, so bytes buffered before the upgrade
//! must be replayed through the new decoder.
use rustls::pki_types::ServerName;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

mod compress;

pub use compress::{Codec, Compression};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),
    #[error("failed to load CA certificates from {path:?}")]
    CaCertificates { path: PathBuf },
    #[error("corrupt {codec} stream: {detail}")]
    Compression {
        codec: &'static str,
        detail: String,
    },
}

/// TLS knobs carried by the client configuration.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Overrides the server name presented for certificate validation
    /// (defaults to the host portion of the dialed address).
    pub server_name: Option<String>,
    /// Additional PEM CA certificates trusted alongside the webpki roots.
    pub ca_file: Option<PathBuf>,
    /// Skip certificate verification entirely (self-signed dev brokers).
    pub insecure_skip_verify: bool,
}

/// The connection's byte stream, before or after the TLS upgrade.
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    /// Upgrade a plaintext stream in place. Idempotent calls are a bug and
    /// return the stream unchanged.
    pub async fn upgrade_tls(self, host: &str, options: &TlsOptions) -> Result<Self> {
        match self {
            Stream::Plain(tcp) => {
                let tls = tls_handshake(tcp, host, options).await?;
                Ok(Stream::Tls(Box::new(tls)))
            }
            already_tls @ Stream::Tls(_) => Ok(already_tls),
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dial a broker with a bounded connect timeout and `TCP_NODELAY`.
pub async fn dial(addr: &str, timeout: Duration) -> Result<Stream> {
    let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::ConnectTimeout {
            addr: addr.to_string(),
            timeout,
        })??;
    tcp.set_nodelay(true)?;
    debug!(addr, "tcp connected");
    Ok(Stream::Plain(tcp))
}

async fn tls_handshake(
    tcp: TcpStream,
    host: &str,
    options: &TlsOptions,
) -> Result<TlsStream<TcpStream>> {
    install_crypto_provider();
    let config = if options.insecure_skip_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_no_client_auth()
    } else {
        let mut roots =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(path) = &options.ca_file {
            let pem = std::fs::read(path).map_err(|_| Error::CaCertificates {
                path: path.clone(),
            })?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert = cert.map_err(|_| Error::CaCertificates { path: path.clone() })?;
                roots
                    .add(cert)
                    .map_err(|_| Error::CaCertificates { path: path.clone() })?;
            }
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    let name = options
        .server_name
        .clone()
        .unwrap_or_else(|| host.split(':').next().unwrap_or(host).to_string());
    let server_name = ServerName::try_from(name.clone())
        .map_err(|_| Error::InvalidServerName(name.clone()))?;

    let connector = TlsConnector::from(Arc::new(config));
    let stream = connector.connect(server_name, tcp).await?;
    debug!(server_name = %name, "tls handshake complete");
    Ok(stream)
}

fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
