//! TLS support via rustls (feature `tls`).
//!
//! A context is built once and shared by a listener or client; each
//! connection gets its own session. The handshake is driven to completion
//! at accept/connect time, so a failure surfaces before the connection ever
//! reaches the framing layer — and closes only that connection.

use crate::net::stream::{PlainSock, Stream};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// TLS configuration and handshake errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// rustls-level failure.
    #[error("tls: {0}")]
    Rustls(#[from] rustls::Error),

    /// Reading PEM material failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The key file contained no usable private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    /// The host is not a valid TLS server name.
    #[error("invalid tls server name")]
    BadServerName,
}

/// Server-side TLS context: one certificate chain and key, shared by every
/// accepted connection.
#[derive(Clone)]
pub struct TlsServerContext {
    config: Arc<ServerConfig>,
}

impl TlsServerContext {
    /// Builds a context from PEM-encoded certificate-chain and key files.
    pub fn from_pem_files(cert: impl AsRef<Path>, key: impl AsRef<Path>) -> Result<Self, TlsError> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
            .collect::<Result<Vec<_>, _>>()?;
        let key_path = key.as_ref();
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| TlsError::NoPrivateKey(key_path.display().to_string()))?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Wraps a prepared rustls configuration.
    #[must_use]
    pub fn from_config(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    /// Performs the server-side handshake on a freshly accepted socket.
    pub(crate) fn accept(&self, mut sock: PlainSock) -> Result<Stream, TlsError> {
        let mut conn = ServerConnection::new(Arc::clone(&self.config))?;
        while conn.is_handshaking() {
            if let Err(e) = conn.complete_io(&mut sock) {
                debug!(error = %e, "tls accept handshake failed");
                return Err(e.into());
            }
        }
        Ok(Stream::TlsServer(Box::new(rustls::StreamOwned::new(
            conn, sock,
        ))))
    }
}

impl std::fmt::Debug for TlsServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServerContext").finish_non_exhaustive()
    }
}

/// Client-side TLS context.
#[derive(Clone)]
pub struct TlsClientContext {
    config: Arc<ClientConfig>,
}

impl TlsClientContext {
    /// Builds a context trusting the PEM-encoded root certificate(s) in
    /// `path` (typically a private CA for test or internal deployments).
    pub fn from_root_ca(path: impl AsRef<Path>) -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)) {
            roots.add(cert?)?;
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Wraps a prepared rustls configuration (e.g. one using the platform
    /// trust store).
    #[must_use]
    pub fn from_config(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }

    /// Performs the client-side handshake against `host`.
    ///
    /// UNIX-domain endpoints have no DNS name; callers pass `localhost`.
    pub(crate) fn connect(&self, host: &str, mut sock: PlainSock) -> Result<Stream, TlsError> {
        let name = ServerName::try_from(host.to_owned()).map_err(|_| TlsError::BadServerName)?;
        let mut conn = ClientConnection::new(Arc::clone(&self.config), name)?;
        while conn.is_handshaking() {
            if let Err(e) = conn.complete_io(&mut sock) {
                debug!(error = %e, "tls connect handshake failed");
                return Err(e.into());
            }
        }
        Ok(Stream::TlsClient(Box::new(rustls::StreamOwned::new(
            conn, sock,
        ))))
    }
}

impl std::fmt::Debug for TlsClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClientContext").finish_non_exhaustive()
    }
}
