//! Client-side JSON-RPC dispatcher.
//!
//! Outbound calls allocate a correlation id from a wrapping `u32` counter,
//! park their resolver in the in-flight table, and send the request; reply
//! routing removes the resolver and settles it. Incoming traffic is routed
//! by shape: objects carrying a `notification` key go to the local listener
//! table, objects carrying `result`/`error` plus `id` go to the in-flight
//! table.
//!
//! The id space wraps harmlessly: a collision would need 2^32 calls in
//! flight simultaneously, far beyond any realistic embedding.

use crate::error::Error;
use crate::promise::{Promise, Resolver};
use crate::rpc::{ClientHooks, ClientTransport, MessageKind, NoHooks};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Default)]
struct State {
    /// Local listeners for server-pushed notifications.
    listeners: HashMap<String, Arc<dyn Fn(Value) + Send + Sync>>,
    /// Resolvers of in-flight calls, keyed by correlation id.
    inflight: HashMap<u32, Resolver<Value>>,
    /// Last allocated correlation id.
    last_id: u32,
}

/// JSON-RPC client: promise-returning calls, fire-and-forget notifications,
/// and a local listener table for server push.
pub struct RpcClient {
    io: Arc<dyn ClientTransport>,
    state: Arc<Mutex<State>>,
    hooks: Arc<dyn ClientHooks>,
}

impl RpcClient {
    /// Wraps a client transport with no observer hooks.
    pub fn new(io: impl ClientTransport + 'static) -> Self {
        Self::with_hooks(io, NoHooks)
    }

    /// Wraps a client transport with binary-frame hooks.
    pub fn with_hooks(io: impl ClientTransport + 'static, hooks: impl ClientHooks + 'static) -> Self {
        Self {
            io: Arc::new(io),
            state: Arc::new(Mutex::new(State::default())),
            hooks: Arc::new(hooks),
        }
    }

    /// The transport this dispatcher drives.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn ClientTransport> {
        &self.io
    }

    /// Starts receiving. The returned promise resolves once the transport's
    /// opening handshake completes, or rejects if it fails.
    pub fn start(&self) -> Promise<()> {
        let io = Arc::clone(&self.io);
        let state = Arc::clone(&self.state);
        let hooks = Arc::clone(&self.hooks);
        Promise::new(move |resolver| {
            let recv = move |payload: &[u8], kind: MessageKind| {
                incoming(&state, &hooks, payload, kind);
            };
            io.start(Box::new(recv), resolver);
        })
    }

    /// Tears down the transport. In-flight resolvers are abandoned, not
    /// rejected: their promises simply never settle.
    pub fn stop(&self) {
        self.io.shutdown();
    }

    /// Returns true while the transport is up.
    #[must_use]
    pub fn alive(&self) -> bool {
        self.io.alive()
    }

    /// Registers a callback invoked once when the transport dies.
    pub fn on_die(&self, callback: impl FnOnce() + Send + 'static) {
        self.io.on_die(Box::new(callback));
    }

    /// Calls a remote method. The returned promise resolves with the result
    /// or rejects with the remote error; the request is sent when the
    /// promise is forced.
    pub fn call(&self, name: &str, params: Value) -> Promise<Value> {
        let io = Arc::clone(&self.io);
        let state = Arc::clone(&self.state);
        let method = name.to_owned();
        Promise::new(move |resolver| {
            let id = {
                let mut state = state.lock();
                state.last_id = state.last_id.wrapping_add(1);
                let id = state.last_id;
                state.inflight.insert(id, resolver.clone());
                id
            };
            trace!(method = %method, id, "call");
            let request = json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": id,
            })
            .to_string();
            if let Err(e) = io.send(request.as_bytes(), MessageKind::Text) {
                state.lock().inflight.remove(&id);
                resolver.reject(e.into());
            }
        })
    }

    /// Sends a notification: no id, no reply, no promise.
    pub fn notify(&self, name: &str, params: Value) -> io::Result<()> {
        let request = json!({ "jsonrpc": "2.0", "method": name, "params": params }).to_string();
        self.io.send(request.as_bytes(), MessageKind::Text)
    }

    /// Registers a local listener for a server event and subscribes via the
    /// built-in `rpc.on`. Resolves to `true` iff the server accepted the
    /// subscription (`{ name: "ok" }`).
    pub fn on(
        &self,
        name: &str,
        listener: impl Fn(Value) + Send + Sync + 'static,
    ) -> Promise<bool> {
        self.state
            .lock()
            .listeners
            .insert(name.to_owned(), Arc::new(listener));
        let key = name.to_owned();
        self.call("rpc.on", json!([name]))
            .map(move |ret| Ok(ret.get(&key).and_then(Value::as_str) == Some("ok")))
    }

    /// Drops the local listener and unsubscribes via `rpc.off`. Resolves to
    /// `true` iff the server reported `"ok"`.
    pub fn off(&self, name: &str) -> Promise<bool> {
        self.state.lock().listeners.remove(name);
        let key = name.to_owned();
        self.call("rpc.off", json!([name]))
            .map(move |ret| Ok(ret.get(&key).and_then(Value::as_str) == Some("ok")))
    }
}

/// Routes one incoming payload.
fn incoming(state: &Arc<Mutex<State>>, hooks: &Arc<dyn ClientHooks>, payload: &[u8], kind: MessageKind) {
    if kind == MessageKind::Binary {
        hooks.on_binary(payload);
        return;
    }

    let parsed: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "unparseable server message dropped");
            return;
        }
    };

    // Server push: { "notification": <name>, "params": <value> }.
    if let Some(name) = parsed.get("notification").and_then(Value::as_str) {
        let listener = state.lock().listeners.get(name).cloned();
        let params = parsed.get("params").cloned().unwrap_or(Value::Null);
        match listener {
            Some(listener) => listener(params),
            None => trace!(event = name, "notification without listener"),
        }
        return;
    }

    // Reply: { "result" | "error", "id": <correlation id> }.
    let Some(id) = parsed
        .get("id")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
    else {
        trace!("server message without usable id dropped");
        return;
    };
    let Some(resolver) = state.lock().inflight.remove(&id) else {
        trace!(id, "reply for unknown call dropped");
        return;
    };
    if let Some(error) = parsed.get("error") {
        resolver.reject(Error::remote(error.clone()));
    } else {
        resolver.resolve(parsed.get("result").cloned().unwrap_or(Value::Null));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ClientRecvFn;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Transport fake: captures sends, lets the test inject traffic.
    struct MockTransport {
        sent: Mutex<Vec<Vec<u8>>>,
        recv: Mutex<Option<ClientRecvFn>>,
        started: Mutex<Option<Resolver<()>>>,
        alive: AtomicBool,
        deaths: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                recv: Mutex::new(None),
                started: Mutex::new(None),
                alive: AtomicBool::new(true),
                deaths: Mutex::new(Vec::new()),
            })
        }

        fn sent_json(&self) -> Vec<Value> {
            self.sent
                .lock()
                .iter()
                .map(|bytes| serde_json::from_slice(bytes).expect("request is JSON"))
                .collect()
        }

        fn inject(&self, payload: &str) {
            let recv = self.recv.lock();
            let recv = recv.as_ref().expect("client started");
            recv(payload.as_bytes(), MessageKind::Text);
        }
    }

    impl ClientTransport for Arc<MockTransport> {
        fn start(&self, on_recv: ClientRecvFn, started: Resolver<()>) {
            *self.recv.lock() = Some(on_recv);
            *self.started.lock() = Some(started);
        }

        fn send(&self, data: &[u8], _kind: MessageKind) -> io::Result<()> {
            if !self.alive.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport down"));
            }
            self.sent.lock().push(data.to_vec());
            Ok(())
        }

        fn alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn on_die(&self, callback: Box<dyn FnOnce() + Send>) {
            self.deaths.lock().push(callback);
        }

        fn shutdown(&self) {
            if self.alive.swap(false, Ordering::SeqCst) {
                for death in self.deaths.lock().drain(..) {
                    death();
                }
            }
        }
    }

    fn started_client() -> (RpcClient, Arc<MockTransport>) {
        let transport = MockTransport::new();
        let client = RpcClient::new(Arc::clone(&transport));
        let resolved = Arc::new(AtomicBool::new(false));
        let probe = Arc::clone(&resolved);
        client
            .start()
            .then(move |()| probe.store(true, Ordering::SeqCst))
            .force();
        transport.started.lock().take().unwrap().resolve(());
        assert!(resolved.load(Ordering::SeqCst));
        (client, transport)
    }

    #[test]
    fn call_sends_request_and_resolves_on_reply() {
        let (client, transport) = started_client();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        client
            .call("sum", json!([1, 2]))
            .then(move |v| *slot.lock() = Some(v))
            .force();

        let requests = transport.sent_json();
        assert_eq!(
            requests[0],
            json!({ "jsonrpc": "2.0", "method": "sum", "params": [1, 2], "id": 1 })
        );

        transport.inject(r#"{"jsonrpc":"2.0","result":3,"id":1}"#);
        assert_eq!(*seen.lock(), Some(json!(3)));
    }

    #[test]
    fn call_rejects_with_remote_error() {
        let (client, transport) = started_client();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        client
            .call("error", json!([]))
            .fail(move |e| *slot.lock() = Some(e))
            .force();

        transport.inject(r#"{"jsonrpc":"2.0","error":{"code":-32000,"message":"boom"},"id":1}"#);

        let err = seen.lock().take().expect("rejected");
        match err {
            Error::Remote { code, message, .. } => {
                assert_eq!(code, -32000);
                assert_eq!(message, "boom");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn correlation_ids_increment_per_call() {
        let (client, transport) = started_client();
        client.call("a", json!([])).force();
        client.call("b", json!([])).force();
        let requests = transport.sent_json();
        assert_eq!(requests[0]["id"], 1);
        assert_eq!(requests[1]["id"], 2);
    }

    #[test]
    fn correlation_id_wraps_at_u32_max() {
        let (client, transport) = started_client();
        client.state.lock().last_id = u32::MAX;
        client.call("wrap", json!([])).force();
        assert_eq!(transport.sent_json()[0]["id"], 0);
    }

    #[test]
    fn notify_has_no_id_and_no_promise() {
        let (client, transport) = started_client();
        client.notify("ping", json!({"n": 1})).expect("notify");
        let requests = transport.sent_json();
        assert_eq!(
            requests[0],
            json!({ "jsonrpc": "2.0", "method": "ping", "params": { "n": 1 } })
        );
        assert!(client.state.lock().inflight.is_empty());
    }

    #[test]
    fn on_subscribes_and_routes_notifications() {
        let (client, transport) = started_client();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let confirmed = Arc::new(AtomicBool::new(false));
        let probe = Arc::clone(&confirmed);
        client
            .on("tick", move |params| sink.lock().push(params))
            .then(move |ok| probe.store(ok, Ordering::SeqCst))
            .force();

        let requests = transport.sent_json();
        assert_eq!(requests[0]["method"], "rpc.on");
        assert_eq!(requests[0]["params"], json!(["tick"]));

        transport.inject(r#"{"jsonrpc":"2.0","result":{"tick":"ok"},"id":1}"#);
        assert!(confirmed.load(Ordering::SeqCst));

        transport.inject(r#"{"notification":"tick","params":42}"#);
        assert_eq!(*events.lock(), vec![json!(42)]);
    }

    #[test]
    fn on_resolves_false_when_event_invalid() {
        let (client, transport) = started_client();
        let confirmed = Arc::new(Mutex::new(None));
        let probe = Arc::clone(&confirmed);
        client
            .on("mystery", |_| {})
            .then(move |ok| *probe.lock() = Some(ok))
            .force();
        transport.inject(
            r#"{"jsonrpc":"2.0","result":{"mystery":"provided event invalid"},"id":1}"#,
        );
        assert_eq!(*confirmed.lock(), Some(false));
    }

    #[test]
    fn off_removes_listener_and_reports_status() {
        let (client, transport) = started_client();
        client.on("tick", |_| {}).force();
        transport.inject(r#"{"jsonrpc":"2.0","result":{"tick":"ok"},"id":1}"#);

        let confirmed = Arc::new(Mutex::new(None));
        let probe = Arc::clone(&confirmed);
        client
            .off("tick")
            .then(move |ok| *probe.lock() = Some(ok))
            .force();
        assert_eq!(transport.sent_json()[1]["method"], "rpc.off");
        transport.inject(r#"{"jsonrpc":"2.0","result":{"tick":"ok"},"id":2}"#);
        assert_eq!(*confirmed.lock(), Some(true));

        // Listener is gone; further pushes are dropped quietly.
        transport.inject(r#"{"notification":"tick","params":1}"#);
        assert!(client.state.lock().listeners.is_empty());
    }

    #[test]
    fn reply_with_unknown_id_is_dropped() {
        let (client, transport) = started_client();
        transport.inject(r#"{"jsonrpc":"2.0","result":1,"id":77}"#);
        assert!(client.state.lock().inflight.is_empty());
    }

    #[test]
    fn notification_without_listener_is_dropped() {
        let (_client, transport) = started_client();
        transport.inject(r#"{"notification":"ghost","params":null}"#);
    }

    #[test]
    fn send_failure_rejects_immediately() {
        let (client, transport) = started_client();
        transport.alive.store(false, Ordering::SeqCst);

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        client
            .call("never", json!([]))
            .fail(move |e| *slot.lock() = Some(e.to_string()))
            .force();
        assert!(seen.lock().is_some());
        assert!(client.state.lock().inflight.is_empty());
    }

    #[test]
    fn stop_abandons_inflight_calls() {
        let (client, transport) = started_client();
        let settled = Arc::new(AtomicBool::new(false));
        let then_probe = Arc::clone(&settled);
        let fail_probe = Arc::clone(&settled);
        client
            .call("pending", json!([]))
            .then(move |_| then_probe.store(true, Ordering::SeqCst))
            .fail(move |_| fail_probe.store(true, Ordering::SeqCst))
            .force();

        client.stop();
        assert!(!transport.alive());
        // The resolver stays parked; neither branch fires.
        assert!(!settled.load(Ordering::SeqCst));
        assert_eq!(client.state.lock().inflight.len(), 1);
    }

    #[test]
    fn on_die_fires_once_at_shutdown() {
        let (client, _transport) = started_client();
        let died = Arc::new(AtomicBool::new(false));
        let probe = Arc::clone(&died);
        client.on_die(move || probe.store(true, Ordering::SeqCst));
        client.stop();
        assert!(died.load(Ordering::SeqCst));
        client.stop();
    }

    #[test]
    fn binary_frames_reach_hooks_not_dispatcher() {
        struct BinHooks(Arc<Mutex<Vec<Vec<u8>>>>);
        impl ClientHooks for BinHooks {
            fn on_binary(&self, data: &[u8]) {
                self.0.lock().push(data.to_vec());
            }
        }

        let transport = MockTransport::new();
        let blobs = Arc::new(Mutex::new(Vec::new()));
        let client = RpcClient::with_hooks(Arc::clone(&transport), BinHooks(Arc::clone(&blobs)));
        client.start().force();
        transport.started.lock().take().unwrap().resolve(());

        let recv = transport.recv.lock();
        recv.as_ref().unwrap()(b"\x00\x01\x02", MessageKind::Binary);
        assert_eq!(*blobs.lock(), vec![vec![0u8, 1, 2]]);
        assert!(client.state.lock().inflight.is_empty());
    }
}
