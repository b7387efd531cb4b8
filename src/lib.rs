//! wsrpc: bidirectional JSON-RPC 2.0 over RFC 6455 WebSocket framing.
//!
//! # Overview
//!
//! This crate embeds a JSON-RPC 2.0 engine whose transport is a WebSocket
//! spoken over plain TCP, TLS, or UNIX-domain sockets. It provides a server
//! that accepts many clients and a client that talks to one server, with
//! promise-style call/notify/event semantics layered above a single-threaded
//! readiness reactor.
//!
//! # Architecture
//!
//! ```text
//! bytes ── Buffer ── ws codec ── transport ── dispatcher ── handlers
//!                                    │
//!                                 Reactor (readiness loop)
//! ```
//!
//! Control flow is driven exclusively by the [`Reactor`]: fd readiness wakes
//! a transport callback, the codec advances the connection state machine, the
//! dispatcher handles a complete message, and the handler result (immediate
//! or deferred through a [`Promise`]) is written back as a response frame.
//!
//! # Module Structure
//!
//! - [`buffer`]: growable read-side byte buffer with drop-from-front
//! - [`ws`]: WebSocket wire protocol — framing and opening handshake
//! - [`reactor`]: single-threaded level-triggered readiness loop
//! - [`net`]: server listener, client endpoint, address grammar, TLS wrap
//! - [`promise`]: eager single-shot chainable completion carrier
//! - [`rpc`]: JSON-RPC dispatcher, pub/sub bookkeeping, error taxonomy
//! - [`error`]: unified failure carrier
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use wsrpc::{Reactor, Rpc, WsServer};
//!
//! let reactor = Arc::new(Reactor::new()?);
//! let server = WsServer::bind("ws://127.0.0.1:8000/rpc", Arc::clone(&reactor))?;
//! let rpc = Rpc::new(server);
//! rpc.register("echo", |_client, params| Ok(params));
//! rpc.start()?;
//! reactor.wait()?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod error;
pub mod net;
pub mod promise;
pub mod reactor;
pub mod rpc;
pub mod ws;

pub use buffer::Buffer;
pub use error::{Error, Result};
pub use net::{Endpoint, WsClient, WsServer};
pub use promise::{map_all, map_any, Promise, Resolver};
pub use reactor::{HandleId, Interest, Reactor, ReactorEvent};
pub use rpc::{
    ClientHooks, ClientTransport, MessageKind, Rpc, RpcClient, RpcHooks, ServerTransport,
    SessionHandle,
};
