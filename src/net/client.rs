//! WebSocket client endpoint.
//!
//! Connecting sends the upgrade request with a fresh random key; the first
//! readable event validates the server's `101` answer against that key and
//! settles the start promise. After that the receive loop mirrors the
//! server's, except every outbound frame is masked with a fresh key.

use crate::buffer::Buffer;
use crate::error::Error;
use crate::net::addr::Endpoint;
use crate::net::stream::{PlainSock, Stream};
use crate::net::{Phase, TransportError, RECV_CHUNK};
use crate::promise::Resolver;
use crate::reactor::{HandleId, Interest, Reactor, ReactorEvent};
use crate::rpc::{ClientRecvFn, ClientTransport, MessageKind};
use crate::ws;
use parking_lot::Mutex;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use tracing::{debug, trace};

fn connect_tcp(host: &str, port: u16) -> Result<PlainSock, TransportError> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect(addr) {
            Ok(sock) => return Ok(PlainSock::Tcp(sock)),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "host did not resolve"))
        .into())
}

struct ClientInner {
    stream: Stream,
    buffer: Buffer,
    phase: Phase,
}

struct ClientShared {
    reactor: Arc<Reactor>,
    fd: RawFd,
    key: String,
    inner: Mutex<ClientInner>,
    deaths: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    handle: Mutex<Option<HandleId>>,
}

impl ClientShared {
    /// Tears the transport down once: deregisters the fd and fires the
    /// death callbacks. Later calls are no-ops.
    fn kill(&self) {
        if self.reactor.has(self.fd) {
            self.reactor.del(self.fd);
            if let Some(handle) = self.handle.lock().take() {
                self.reactor.unregister(handle);
            }
            let deaths: Vec<_> = self.deaths.lock().drain(..).collect();
            trace!(fd = self.fd, "client transport down");
            for death in deaths {
                death();
            }
        }
    }

    fn handle_event(&self, on_recv: &ClientRecvFn, started: &Resolver<()>, event: ReactorEvent) {
        if !event.is_readable() {
            self.kill();
            started.reject(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "socket error",
            )));
            return;
        }

        let mut resolved = false;
        let mut rejection = None;
        let mut dead = false;
        let mut messages = Vec::new();
        {
            let mut inner = self.inner.lock();
            let ClientInner {
                stream,
                buffer,
                phase,
            } = &mut *inner;

            match stream.read(buffer.allocate(RECV_CHUNK)) {
                Ok(0) => dead = true,
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "recv failed");
                    rejection = Some(Error::Io(e));
                    dead = true;
                }
                Ok(read) => {
                    buffer.eat(read);
                    if *phase == Phase::Opening {
                        // The whole 101 answer is expected in this event;
                        // anything else fails the start promise.
                        match ws::parse_handshake_answer(buffer.as_slice(), &self.key) {
                            Ok(Some(_)) => {
                                *phase = Phase::Normal;
                                buffer.reset();
                                resolved = true;
                                trace!(fd = self.fd, "handshake complete");
                            }
                            Ok(None) | Err(_) => rejection = Some(Error::HandshakeFailed),
                        }
                    } else {
                        loop {
                            match ws::parse_server_frame(buffer.as_slice()) {
                                Ok(None) => break,
                                Err(e) => {
                                    debug!(fd = self.fd, error = %e, "invalid frame");
                                    let close =
                                        ws::build_frame(ws::FrameKind::Close, &[], true);
                                    let _ = stream.send_all(&close);
                                    *phase = Phase::Closing;
                                    buffer.reset();
                                    break;
                                }
                                Ok(Some(frame)) => {
                                    match frame.kind {
                                        ws::FrameKind::Close => {
                                            dead = true;
                                            break;
                                        }
                                        ws::FrameKind::Ping => {
                                            let pong = ws::build_frame(
                                                ws::FrameKind::Pong,
                                                &frame.payload,
                                                true,
                                            );
                                            if let Err(e) = stream.send_all(&pong) {
                                                debug!(fd = self.fd, error = %e, "pong failed");
                                                dead = true;
                                                break;
                                            }
                                        }
                                        ws::FrameKind::Pong => {}
                                        ws::FrameKind::Text => {
                                            messages.push((MessageKind::Text, frame.payload));
                                        }
                                        ws::FrameKind::Binary => {
                                            messages.push((MessageKind::Binary, frame.payload));
                                        }
                                    }
                                    buffer.drop_front(frame.consumed);
                                    if buffer.is_empty() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        // Callbacks run with the connection lock released.
        if resolved {
            started.resolve(());
        }
        for (kind, payload) in messages {
            on_recv(&payload, kind);
        }
        if let Some(error) = rejection {
            started.reject(error);
        }
        if dead {
            self.kill();
        }
    }
}

/// WebSocket client transport: one connection to one server.
pub struct WsClient {
    shared: Arc<ClientShared>,
}

impl WsClient {
    /// Connects a cleartext endpoint (`ws://` or `ws+unix://`) and sends
    /// the upgrade request.
    pub fn connect(address: &str, reactor: Arc<Reactor>) -> Result<Self, TransportError> {
        let endpoint = Endpoint::parse(address)?;
        if endpoint.is_tls() {
            return Err(TransportError::TlsMismatch);
        }
        let sock = Self::open(&endpoint)?;
        Self::establish(endpoint, Stream::Plain(sock), reactor)
    }

    /// Connects a TLS endpoint (`wss://` or `wss+unix://`).
    #[cfg(feature = "tls")]
    pub fn connect_tls(
        address: &str,
        tls: &crate::net::tls::TlsClientContext,
        reactor: Arc<Reactor>,
    ) -> Result<Self, TransportError> {
        let endpoint = Endpoint::parse(address)?;
        if !endpoint.is_tls() {
            return Err(TransportError::TlsMismatch);
        }
        let sock = Self::open(&endpoint)?;
        // UNIX endpoints have no DNS name to verify against.
        let name = match &endpoint {
            Endpoint::Tcp { host, .. } => host.clone(),
            Endpoint::Unix { .. } => "localhost".to_owned(),
        };
        let stream = tls.connect(&name, sock)?;
        Self::establish(endpoint, stream, reactor)
    }

    fn open(endpoint: &Endpoint) -> Result<PlainSock, TransportError> {
        match endpoint {
            Endpoint::Tcp { host, port, .. } => connect_tcp(host, *port),
            Endpoint::Unix { path, .. } => Ok(PlainSock::Unix(UnixStream::connect(path)?)),
        }
    }

    fn establish(
        endpoint: Endpoint,
        mut stream: Stream,
        reactor: Arc<Reactor>,
    ) -> Result<Self, TransportError> {
        let key = ws::generate_client_key();
        let request =
            ws::build_handshake_request(&endpoint.host_header(), endpoint.resource(), &key);
        stream.send_all(request.as_bytes())?;
        let fd = stream.as_raw_fd();
        debug!(fd, "handshake request sent");
        Ok(Self {
            shared: Arc::new(ClientShared {
                reactor,
                fd,
                key,
                inner: Mutex::new(ClientInner {
                    stream,
                    buffer: Buffer::new(),
                    phase: Phase::Opening,
                }),
                deaths: Mutex::new(Vec::new()),
                handle: Mutex::new(None),
            }),
        })
    }

    /// The reactor driving this endpoint.
    #[must_use]
    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.shared.reactor
    }
}

impl ClientTransport for WsClient {
    fn start(&self, on_recv: ClientRecvFn, started: Resolver<()>) {
        let shared = Arc::clone(&self.shared);
        let fail = started.clone();
        let handle = self
            .shared
            .reactor
            .register(move |event| shared.handle_event(&on_recv, &started, event));
        *self.shared.handle.lock() = Some(handle);
        if let Err(e) = self.shared.reactor.add(
            Interest::READABLE | Interest::ERROR | Interest::HUP,
            self.shared.fd,
            handle,
        ) {
            self.shared.reactor.unregister(handle);
            self.shared.handle.lock().take();
            fail.reject(Error::Io(e));
        }
    }

    fn send(&self, data: &[u8], kind: MessageKind) -> io::Result<()> {
        let frame_kind = match kind {
            MessageKind::Text => ws::FrameKind::Text,
            MessageKind::Binary => ws::FrameKind::Binary,
        };
        // Client-to-server frames are always masked.
        let frame = ws::build_frame(frame_kind, data, true);
        self.shared.inner.lock().stream.send_all(&frame)
    }

    fn alive(&self) -> bool {
        self.shared.reactor.has(self.shared.fd)
    }

    fn on_die(&self, callback: Box<dyn FnOnce() + Send>) {
        self.shared.deaths.lock().push(callback);
    }

    fn shutdown(&self) {
        self.shared.kill();
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.shared.kill();
    }
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("fd", &self.shared.fd)
            .field("alive", &self.shared.reactor.has(self.shared.fd))
            .finish_non_exhaustive()
    }
}
