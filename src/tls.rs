//! TLS support and the client stream abstraction.
//!
//! Certificates and keys are loaded from PEM files into a
//! tokio-rustls acceptor. `ClientStream` lets the rest of the crate
//! treat plain TCP, Unix sockets, and TLS-upgraded TCP uniformly.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::TlsAcceptor;

use crate::error::{Result, WireError};

/// TLS configuration for the listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to the server certificate chain (PEM).
    pub cert_path: String,
    /// Path to the server private key (PEM).
    pub key_path: String,
}

impl TlsConfig {
    pub fn new(cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
        let file = File::open(path)
            .map_err(|e| WireError::Tls(format!("failed to open {}: {}", path.display(), e)))?;
        let mut reader = BufReader::new(file);

        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| WireError::Tls(format!("failed to parse certificates: {}", e)))?;

        if certs.is_empty() {
            return Err(WireError::Tls(format!(
                "no certificates found in {}",
                path.display()
            )));
        }

        Ok(certs)
    }

    fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
        let file = File::open(path)
            .map_err(|e| WireError::Tls(format!("failed to open {}: {}", path.display(), e)))?;
        let mut reader = BufReader::new(file);

        loop {
            match rustls_pemfile::read_one(&mut reader) {
                Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => {
                    return Ok(PrivateKeyDer::Pkcs1(key));
                }
                Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => {
                    return Ok(PrivateKeyDer::Pkcs8(key));
                }
                Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => {
                    return Ok(PrivateKeyDer::Sec1(key));
                }
                Ok(Some(_)) => continue,
                Ok(None) => {
                    return Err(WireError::Tls(format!(
                        "no private key found in {}",
                        path.display()
                    )));
                }
                Err(e) => {
                    return Err(WireError::Tls(format!("failed to parse key: {}", e)));
                }
            }
        }
    }

    /// Build a TLS acceptor from this configuration.
    pub fn build_acceptor(&self) -> Result<TlsAcceptor> {
        let certs = Self::load_certs(Path::new(&self.cert_path))?;
        let key = Self::load_key(Path::new(&self.key_path))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| WireError::Tls(format!("failed to build TLS config: {}", e)))?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// An accepted client socket, possibly upgraded to TLS mid-handshake.
pub enum ClientStream {
    Tcp(TcpStream),
    Unix(UnixStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl ClientStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls(_))
    }

    /// Perform the server-side TLS handshake on a plain TCP stream.
    /// Only TCP connections can be upgraded.
    pub async fn upgrade_to_tls(self, acceptor: &TlsAcceptor) -> Result<ClientStream> {
        match self {
            ClientStream::Tcp(stream) => {
                let tls = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| WireError::Tls(format!("TLS handshake failed: {}", e)))?;
                Ok(ClientStream::Tls(Box::new(tls)))
            }
            ClientStream::Unix(_) => Err(WireError::Tls(
                "cannot upgrade a unix socket to TLS".to_string(),
            )),
            ClientStream::Tls(_) => Err(WireError::Tls("connection is already TLS".to_string())),
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Unix(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
