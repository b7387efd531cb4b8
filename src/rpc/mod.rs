//! JSON-RPC 2.0 dispatcher layered over framed message transports.
//!
//! The dispatcher never touches sockets: its whole contract with the
//! transport layer is an I/O abstraction delivering framed message payloads.
//! [`ServerTransport`] accepts many clients and hands each one up as a
//! [`SessionHandle`]; [`ClientTransport`] speaks to one server. The concrete
//! WebSocket implementations live in [`crate::net`]; tests substitute
//! in-memory fakes.
//!
//! One JSON message travels per TEXT frame. BINARY frames bypass JSON-RPC
//! entirely and reach the optional binary hooks unchanged.

pub mod client;
pub mod server;

pub use client::RpcClient;
pub use server::Rpc;

use crate::promise::Resolver;
use std::io;
use std::sync::Arc;

/// Kind of a delivered WebSocket message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text payload (JSON-RPC traffic).
    Text,
    /// Opaque binary payload.
    Binary,
}

/// Per-connection handle the server dispatcher uses to push bytes back.
///
/// Subscriber sets hold these by [`std::sync::Weak`] reference, so a closed
/// connection expires out of pub/sub bookkeeping on its own.
pub trait SessionHandle: Send + Sync {
    /// Sends one message to the peer.
    fn send(&self, data: &[u8], kind: MessageKind) -> io::Result<()>;
    /// Closes the connection.
    fn shutdown(&self);
}

/// Callback set a server transport drives.
///
/// `on_accept` fires once a connection completes the opening handshake;
/// `on_remove` once it is torn down; `on_recv` for every complete TEXT or
/// BINARY message.
pub struct ServerHooks {
    /// Connection accepted (handshake complete).
    pub on_accept: Box<dyn Fn(&Arc<dyn SessionHandle>) + Send + Sync>,
    /// Connection removed.
    pub on_remove: Box<dyn Fn(&Arc<dyn SessionHandle>) + Send + Sync>,
    /// Complete message received.
    pub on_recv: Box<dyn Fn(&Arc<dyn SessionHandle>, &[u8], MessageKind) + Send + Sync>,
}

/// Server side of the transport seam.
pub trait ServerTransport: Send + Sync {
    /// Begins accepting connections, reporting through `hooks`.
    fn start(&self, hooks: ServerHooks) -> io::Result<()>;
    /// Stops listening and tears down every connection.
    fn shutdown(&self);
}

/// Incoming-payload callback for a client transport.
pub type ClientRecvFn = Box<dyn Fn(&[u8], MessageKind) + Send + Sync>;

/// Client side of the transport seam.
pub trait ClientTransport: Send + Sync {
    /// Begins receiving. `started` settles once the opening handshake
    /// completes (resolve) or fails (reject).
    fn start(&self, on_recv: ClientRecvFn, started: Resolver<()>);
    /// Sends one message to the server.
    fn send(&self, data: &[u8], kind: MessageKind) -> io::Result<()>;
    /// Returns true while the transport is registered with the reactor.
    fn alive(&self) -> bool;
    /// Registers a callback invoked once when the transport dies.
    fn on_die(&self, callback: Box<dyn FnOnce() + Send>);
    /// Tears the transport down, firing the death callbacks.
    fn shutdown(&self);
}

/// Optional observer hooks for the server dispatcher.
///
/// All methods default to no-ops; implement only what you need.
pub trait RpcHooks: Send + Sync {
    /// A client completed the handshake.
    fn on_accept(&self, _client: &Arc<dyn SessionHandle>) {}
    /// A client went away.
    fn on_remove(&self, _client: &Arc<dyn SessionHandle>) {}
    /// A client sent a BINARY frame.
    fn on_binary(&self, _client: &Arc<dyn SessionHandle>, _data: &[u8]) {}
}

/// Optional observer hooks for the client dispatcher.
pub trait ClientHooks: Send + Sync {
    /// The server sent a BINARY frame.
    fn on_binary(&self, _data: &[u8]) {}
}

/// Default no-op server hooks.
pub(crate) struct NoHooks;

impl RpcHooks for NoHooks {}
impl ClientHooks for NoHooks {}
