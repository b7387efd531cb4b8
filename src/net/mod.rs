//! Transport endpoints: server listener, client endpoint, address grammar,
//! and the optional TLS wrap.
//!
//! Both endpoints are driven entirely by a shared [`crate::Reactor`]; a
//! single process may run a server and a client on one reactor thread (the
//! proxy embedding). Connections use blocking sockets and read at most one
//! 64 KiB chunk per readiness event, so no callback ever blocks waiting for
//! the peer.

pub mod addr;
pub mod client;
pub mod server;
pub mod stream;

#[cfg(feature = "tls")]
pub mod tls;

pub use addr::{AddrError, Endpoint};
pub use client::WsClient;
pub use server::WsServer;

#[cfg(feature = "tls")]
pub use tls::{TlsClientContext, TlsError, TlsServerContext};

/// Bytes requested from the OS per readiness event.
pub(crate) const RECV_CHUNK: usize = 64 * 1024;

/// Connection lifecycle phase shared by both endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Awaiting the opening handshake.
    Opening,
    /// Handshake complete, framed traffic flows.
    Normal,
    /// A CLOSE was sent after a peer fault; draining until teardown.
    Closing,
}

/// Errors produced while setting up or driving a transport endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The address did not match the supported grammar.
    #[error(transparent)]
    Addr(#[from] AddrError),

    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// TLS context or handshake failure.
    #[cfg(feature = "tls")]
    #[error(transparent)]
    Tls(#[from] tls::TlsError),

    /// A `wss://` address was given without a TLS context (or the `tls`
    /// feature is disabled), or a TLS context was given a `ws://` address.
    #[error("address scheme does not match the TLS configuration")]
    TlsMismatch,
}
