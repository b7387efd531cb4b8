//! Unified byte stream over TCP, UNIX-domain, and TLS transports.
//!
//! The framing state machine above is identical for every flavour; this
//! module collapses them behind one [`Stream`] with blocking `Read`/`Write`
//! and an fd for reactor registration.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// A plain (non-TLS) connected socket.
#[derive(Debug)]
pub enum PlainSock {
    /// TCP connection.
    Tcp(TcpStream),
    /// UNIX-domain connection.
    Unix(UnixStream),
}

impl PlainSock {
    fn shutdown_write(&self) {
        let _ = match self {
            Self::Tcp(sock) => sock.shutdown(Shutdown::Write),
            Self::Unix(sock) => sock.shutdown(Shutdown::Write),
        };
    }
}

impl Read for PlainSock {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(sock) => sock.read(buf),
            Self::Unix(sock) => sock.read(buf),
        }
    }
}

impl Write for PlainSock {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(sock) => sock.write(buf),
            Self::Unix(sock) => sock.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(sock) => sock.flush(),
            Self::Unix(sock) => sock.flush(),
        }
    }
}

impl AsRawFd for PlainSock {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(sock) => sock.as_raw_fd(),
            Self::Unix(sock) => sock.as_raw_fd(),
        }
    }
}

/// One connection's byte stream, possibly TLS-wrapped.
///
/// The TLS variants route `recv`/`send` through the rustls session; the
/// same framing state machine sits above either way.
pub enum Stream {
    /// Cleartext stream.
    Plain(PlainSock),
    /// Server-side TLS session.
    #[cfg(feature = "tls")]
    TlsServer(Box<rustls::StreamOwned<rustls::ServerConnection, PlainSock>>),
    /// Client-side TLS session.
    #[cfg(feature = "tls")]
    TlsClient(Box<rustls::StreamOwned<rustls::ClientConnection, PlainSock>>),
}

impl Stream {
    /// Writes the whole buffer, treating a zero-length write as failure.
    pub fn send_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            match self.write(rest) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "peer stopped accepting bytes",
                    ))
                }
                Ok(sent) => rest = &rest[sent..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Closes the write half. For TLS this also queues a `close_notify`.
    pub fn shutdown(&mut self) {
        match self {
            Self::Plain(sock) => sock.shutdown_write(),
            #[cfg(feature = "tls")]
            Self::TlsServer(tls) => {
                tls.conn.send_close_notify();
                let _ = tls.flush();
                tls.sock.shutdown_write();
            }
            #[cfg(feature = "tls")]
            Self::TlsClient(tls) => {
                tls.conn.send_close_notify();
                let _ = tls.flush();
                tls.sock.shutdown_write();
            }
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(sock) => sock.read(buf),
            #[cfg(feature = "tls")]
            Self::TlsServer(tls) => tls.read(buf),
            #[cfg(feature = "tls")]
            Self::TlsClient(tls) => tls.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(sock) => sock.write(buf),
            #[cfg(feature = "tls")]
            Self::TlsServer(tls) => tls.write(buf),
            #[cfg(feature = "tls")]
            Self::TlsClient(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(sock) => sock.flush(),
            #[cfg(feature = "tls")]
            Self::TlsServer(tls) => tls.flush(),
            #[cfg(feature = "tls")]
            Self::TlsClient(tls) => tls.flush(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Plain(sock) => sock.as_raw_fd(),
            #[cfg(feature = "tls")]
            Self::TlsServer(tls) => tls.sock.as_raw_fd(),
            #[cfg(feature = "tls")]
            Self::TlsClient(tls) => tls.sock.as_raw_fd(),
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(sock) => f.debug_tuple("Plain").field(sock).finish(),
            #[cfg(feature = "tls")]
            Self::TlsServer(tls) => f.debug_tuple("TlsServer").field(&tls.sock).finish(),
            #[cfg(feature = "tls")]
            Self::TlsClient(tls) => f.debug_tuple("TlsClient").field(&tls.sock).finish(),
        }
    }
}
