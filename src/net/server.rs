//! WebSocket server listener and per-connection state machine.
//!
//! The listener binds per the address grammar, registers with the reactor,
//! and owns every accepted connection in an fd-keyed map. Each connection
//! walks `Opening -> Normal` on a successful handshake; protocol faults in
//! `Normal` answer with a CLOSE frame and park the connection in `Closing`
//! until the peer goes away. All faults are confined to their connection.

use crate::buffer::Buffer;
use crate::net::addr::Endpoint;
use crate::net::stream::{PlainSock, Stream};
use crate::net::{Phase, TransportError, RECV_CHUNK};
use crate::reactor::{HandleId, Interest, Reactor, ReactorEvent};
use crate::rpc::{MessageKind, ServerHooks, ServerTransport, SessionHandle};
use crate::ws;
use parking_lot::Mutex;
use socket2::{Domain, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Debug)]
enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    fn accept(&self) -> io::Result<PlainSock> {
        match self {
            Self::Tcp(listener) => listener.accept().map(|(sock, _)| PlainSock::Tcp(sock)),
            Self::Unix(listener) => listener.accept().map(|(sock, _)| PlainSock::Unix(sock)),
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(listener) => listener.as_raw_fd(),
            Self::Unix(listener) => listener.as_raw_fd(),
        }
    }
}

fn bind_tcp(host: &str, port: u16) -> Result<TcpListener, TransportError> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_cloexec(true)?;
        socket.set_reuse_address(true)?;
        match socket.bind(&addr.into()).and_then(|()| socket.listen(255)) {
            Ok(()) => return Ok(socket.into()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "host did not resolve"))
        .into())
}

fn bind_unix(path: &Path) -> Result<UnixListener, TransportError> {
    // A previous instance may have left its socket file behind.
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_cloexec(true)?;
    socket.bind(&SockAddr::unix(path)?)?;
    socket.listen(255)?;
    Ok(socket.into())
}

struct ConnInner {
    stream: Stream,
    buffer: Buffer,
    phase: Phase,
}

/// One accepted connection. The listener's map holds the only strong
/// reference besides transient dispatch clones; pub/sub bookkeeping holds it
/// weakly, so removal from the map expires all subscriptions.
struct ServerConn {
    fd: RawFd,
    inner: Mutex<ConnInner>,
}

/// What one readiness event produced.
#[derive(Default)]
struct Progress {
    accepted: bool,
    messages: Vec<(MessageKind, Vec<u8>)>,
    stopped: bool,
}

/// Outcome of examining the buffered opening handshake. Owned, so the
/// buffer can be mutated once the parse borrow is released.
enum HandshakeStep {
    Wait,
    Reject(String),
    WrongResource(String),
    Accept { answer: String, consumed: usize },
}

impl ServerConn {
    /// Advances the connection state machine on one readable event.
    ///
    /// Delivers at most one 64 KiB read, then parses as far as the buffer
    /// allows. Messages are returned rather than dispatched so the caller
    /// can invoke hooks with the connection lock released.
    fn on_readable(&self, path: &str) -> io::Result<Progress> {
        let mut inner = self.inner.lock();
        let ConnInner {
            stream,
            buffer,
            phase,
        } = &mut *inner;
        let mut progress = Progress::default();

        let read = stream.read(buffer.allocate(RECV_CHUNK))?;
        if read == 0 {
            progress.stopped = true;
            return Ok(progress);
        }
        buffer.eat(read);

        if *phase == Phase::Opening {
            let step = match ws::parse_handshake(buffer.as_slice()) {
                Ok(None) => HandshakeStep::Wait,
                Err(e) => HandshakeStep::Reject(e.to_string()),
                Ok(Some(handshake)) => {
                    if handshake.resource == path {
                        HandshakeStep::Accept {
                            answer: ws::build_handshake_answer(handshake.key, None),
                            consumed: handshake.consumed,
                        }
                    } else {
                        HandshakeStep::WrongResource(handshake.resource.to_owned())
                    }
                }
            };
            match step {
                HandshakeStep::Wait => return Ok(progress),
                HandshakeStep::Reject(reason) => {
                    debug!(fd = self.fd, reason = %reason, "handshake rejected");
                    let _ = stream.send_all(
                        b"HTTP/1.1 400 Bad Request\r\nSec-WebSocket-Version: 13\r\n\r\n",
                    );
                    progress.stopped = true;
                    return Ok(progress);
                }
                HandshakeStep::WrongResource(resource) => {
                    debug!(fd = self.fd, resource = %resource, "unknown resource");
                    let _ = stream.send_all(b"HTTP/1.1 404 Not Found\r\n\r\n");
                    progress.stopped = true;
                    return Ok(progress);
                }
                HandshakeStep::Accept { answer, consumed } => {
                    stream.send_all(answer.as_bytes())?;
                    buffer.drop_front(consumed);
                    *phase = Phase::Normal;
                    progress.accepted = true;
                    trace!(fd = self.fd, "handshake complete");
                    return Ok(progress);
                }
            }
        }

        loop {
            match ws::parse_client_frame(buffer.as_slice()) {
                Ok(None) => break,
                Err(e) => {
                    debug!(fd = self.fd, error = %e, "invalid frame");
                    let close = ws::build_frame(ws::FrameKind::Close, &[], false);
                    let _ = stream.send_all(&close);
                    *phase = Phase::Closing;
                    buffer.reset();
                    break;
                }
                Ok(Some(frame)) => {
                    match frame.kind {
                        ws::FrameKind::Close => {
                            if *phase != Phase::Closing {
                                let close = ws::build_frame(ws::FrameKind::Close, &[], false);
                                let _ = stream.send_all(&close);
                            }
                            progress.stopped = true;
                            return Ok(progress);
                        }
                        ws::FrameKind::Ping => {
                            let pong = ws::build_frame(ws::FrameKind::Pong, &frame.payload, false);
                            stream.send_all(&pong)?;
                        }
                        ws::FrameKind::Pong => {}
                        ws::FrameKind::Text => {
                            progress.messages.push((MessageKind::Text, frame.payload));
                        }
                        ws::FrameKind::Binary => {
                            progress.messages.push((MessageKind::Binary, frame.payload));
                        }
                    }
                    buffer.drop_front(frame.consumed);
                    if buffer.is_empty() {
                        break;
                    }
                }
            }
        }
        Ok(progress)
    }

    fn close(&self) {
        self.inner.lock().stream.shutdown();
    }
}

impl SessionHandle for ServerConn {
    fn send(&self, data: &[u8], kind: MessageKind) -> io::Result<()> {
        let frame_kind = match kind {
            MessageKind::Text => ws::FrameKind::Text,
            MessageKind::Binary => ws::FrameKind::Binary,
        };
        // Server-to-client frames are never masked.
        let frame = ws::build_frame(frame_kind, data, false);
        self.inner.lock().stream.send_all(&frame)
    }

    fn shutdown(&self) {
        self.close();
    }
}

struct ServerShared {
    reactor: Arc<Reactor>,
    listener: Listener,
    path: String,
    clients: Mutex<HashMap<RawFd, Arc<ServerConn>>>,
    handles: Mutex<Vec<HandleId>>,
    #[cfg(feature = "tls")]
    tls: Option<crate::net::tls::TlsServerContext>,
}

impl ServerShared {
    fn wrap(&self, sock: PlainSock) -> Result<Stream, TransportError> {
        #[cfg(feature = "tls")]
        if let Some(tls) = &self.tls {
            return Ok(tls.accept(sock)?);
        }
        Ok(Stream::Plain(sock))
    }

    fn handle_accept(&self, event: ReactorEvent, client_handle: HandleId) {
        if !event.is_readable() {
            // Listener fault: withdraw it, existing connections continue.
            warn!(fd = event.fd, "listener error, withdrawing");
            self.reactor.del(event.fd);
            return;
        }
        let sock = match self.listener.accept() {
            Ok(sock) => sock,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        };
        let stream = match self.wrap(sock) {
            Ok(stream) => stream,
            Err(e) => {
                // A failed TLS handshake aborts this connection only.
                debug!(error = %e, "connection setup failed");
                return;
            }
        };
        let fd = stream.as_raw_fd();
        let conn = Arc::new(ServerConn {
            fd,
            inner: Mutex::new(ConnInner {
                stream,
                buffer: Buffer::new(),
                phase: Phase::Opening,
            }),
        });
        self.clients.lock().insert(fd, Arc::clone(&conn));
        if let Err(e) = self
            .reactor
            .add(Interest::READABLE | Interest::ERROR | Interest::HUP, fd, client_handle)
        {
            warn!(fd, error = %e, "could not register connection");
            self.clients.lock().remove(&fd);
            return;
        }
        trace!(fd, "connection accepted");
    }

    fn handle_client(&self, hooks: &ServerHooks, event: ReactorEvent) {
        let Some(conn) = self.clients.lock().get(&event.fd).cloned() else {
            return;
        };
        let outcome = if event.is_readable() {
            conn.on_readable(&self.path)
        } else {
            Err(io::Error::new(io::ErrorKind::Other, "socket error"))
        };
        match outcome {
            Ok(progress) => {
                let handle: Arc<dyn SessionHandle> = Arc::clone(&conn) as Arc<dyn SessionHandle>;
                if progress.accepted {
                    (hooks.on_accept)(&handle);
                }
                for (kind, payload) in progress.messages {
                    (hooks.on_recv)(&handle, &payload, kind);
                }
                if progress.stopped {
                    self.remove(hooks, &conn);
                }
            }
            Err(e) => {
                debug!(fd = event.fd, error = %e, "connection failed");
                self.remove(hooks, &conn);
            }
        }
    }

    fn remove(&self, hooks: &ServerHooks, conn: &Arc<ServerConn>) {
        self.reactor.del(conn.fd);
        if self.clients.lock().remove(&conn.fd).is_some() {
            trace!(fd = conn.fd, "connection removed");
            let handle: Arc<dyn SessionHandle> = Arc::clone(conn) as Arc<dyn SessionHandle>;
            (hooks.on_remove)(&handle);
            conn.close();
        }
    }

    fn teardown(&self) {
        self.reactor.del(self.listener.as_raw_fd());
        let clients: Vec<_> = self.clients.lock().drain().collect();
        for (fd, conn) in clients {
            self.reactor.del(fd);
            conn.close();
        }
        for handle in self.handles.lock().drain(..) {
            self.reactor.unregister(handle);
        }
    }
}

/// WebSocket server transport: listener plus connection ownership.
pub struct WsServer {
    shared: Arc<ServerShared>,
}

impl WsServer {
    /// Binds a cleartext listener (`ws://` or `ws+unix://`).
    pub fn bind(address: &str, reactor: Arc<Reactor>) -> Result<Self, TransportError> {
        let endpoint = Endpoint::parse(address)?;
        if endpoint.is_tls() {
            return Err(TransportError::TlsMismatch);
        }
        Self::bind_endpoint(
            endpoint,
            #[cfg(feature = "tls")]
            None,
            reactor,
        )
    }

    /// Binds a TLS listener (`wss://` or `wss+unix://`).
    #[cfg(feature = "tls")]
    pub fn bind_tls(
        address: &str,
        tls: crate::net::tls::TlsServerContext,
        reactor: Arc<Reactor>,
    ) -> Result<Self, TransportError> {
        let endpoint = Endpoint::parse(address)?;
        if !endpoint.is_tls() {
            return Err(TransportError::TlsMismatch);
        }
        Self::bind_endpoint(endpoint, Some(tls), reactor)
    }

    fn bind_endpoint(
        endpoint: Endpoint,
        #[cfg(feature = "tls")] tls: Option<crate::net::tls::TlsServerContext>,
        reactor: Arc<Reactor>,
    ) -> Result<Self, TransportError> {
        let path = endpoint.resource().to_owned();
        let listener = match &endpoint {
            Endpoint::Tcp { host, port, .. } => Listener::Tcp(bind_tcp(host, *port)?),
            Endpoint::Unix { path, .. } => Listener::Unix(bind_unix(path)?),
        };
        debug!(fd = listener.as_raw_fd(), path = %path, "listener bound");
        Ok(Self {
            shared: Arc::new(ServerShared {
                reactor,
                listener,
                path,
                clients: Mutex::new(HashMap::new()),
                handles: Mutex::new(Vec::new()),
                #[cfg(feature = "tls")]
                tls,
            }),
        })
    }

    /// The reactor driving this listener.
    #[must_use]
    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.shared.reactor
    }

    /// Local address of a TCP listener (useful after binding port 0).
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.shared.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }
}

impl ServerTransport for WsServer {
    fn start(&self, hooks: ServerHooks) -> io::Result<()> {
        let shared = Arc::clone(&self.shared);
        let client_handle = self
            .shared
            .reactor
            .register(move |event| shared.handle_client(&hooks, event));

        let shared = Arc::clone(&self.shared);
        let accept_handle = self
            .shared
            .reactor
            .register(move |event| shared.handle_accept(event, client_handle));

        self.shared
            .handles
            .lock()
            .extend([client_handle, accept_handle]);
        self.shared.reactor.add(
            Interest::READABLE | Interest::ERROR | Interest::HUP,
            self.shared.listener.as_raw_fd(),
            accept_handle,
        )
    }

    fn shutdown(&self) {
        self.shared.teardown();
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}

impl std::fmt::Debug for WsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServer")
            .field("path", &self.shared.path)
            .field("clients", &self.shared.clients.lock().len())
            .finish_non_exhaustive()
    }
}
