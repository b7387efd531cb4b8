//! Server-side JSON-RPC dispatcher.
//!
//! Routes incoming requests through the method table, then the regex proxy
//! table (registration order, first match wins), and replies with results or
//! taxonomy-mapped error objects. Carries the pub/sub bookkeeping behind the
//! built-in `rpc.on`/`rpc.off` methods.
//!
//! # Locking
//!
//! All dispatcher state sits behind one mutex, but handlers are stored as
//! `Arc`s and cloned out before invocation, so handler code runs with the
//! lock released and may freely re-enter [`Rpc::emit`], registration, or any
//! send path.

use crate::error::Error;
use crate::promise::Promise;
use crate::rpc::{
    MessageKind, NoHooks, RpcHooks, ServerHooks, ServerTransport, SessionHandle,
};
use parking_lot::Mutex;
use regex::{Captures, Regex};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Sync method handler: `(client, params) -> result`.
pub type MethodFn =
    dyn Fn(&Arc<dyn SessionHandle>, Value) -> Result<Value, Error> + Send + Sync;
/// Async method handler: `(client, params) -> promise of result`.
pub type AsyncMethodFn = dyn Fn(&Arc<dyn SessionHandle>, Value) -> Promise<Value> + Send + Sync;
/// Sync proxy handler: `(client, captures, params) -> result`.
pub type ProxyFn =
    dyn Fn(&Arc<dyn SessionHandle>, &Captures<'_>, Value) -> Result<Value, Error> + Send + Sync;
/// Async proxy handler: `(client, captures, params) -> promise of result`.
pub type AsyncProxyFn =
    dyn Fn(&Arc<dyn SessionHandle>, &Captures<'_>, Value) -> Promise<Value> + Send + Sync;

/// Sync-or-async handler variant, selected by pattern match at dispatch.
enum Handler {
    Sync(Box<MethodFn>),
    Async(Box<AsyncMethodFn>),
}

enum ProxyHandler {
    Sync(Box<ProxyFn>),
    Async(Box<AsyncProxyFn>),
}

#[derive(Default)]
struct Inner {
    methods: HashMap<String, Arc<Handler>>,
    proxies: Vec<(Regex, Arc<ProxyHandler>, u64)>,
    next_proxy_id: u64,
    /// Registered server events, in insertion order.
    events: Vec<String>,
    /// Subscribers per event, held weakly and pruned on emit.
    subscribers: HashMap<String, Vec<Weak<dyn SessionHandle>>>,
}

impl Inner {
    fn event_registered(&self, name: &str) -> bool {
        self.events.iter().any(|e| e == name)
    }

    fn subscribe(&mut self, name: &str, client: &Arc<dyn SessionHandle>) {
        let subs = self.subscribers.entry(name.to_owned()).or_default();
        let already = subs
            .iter()
            .any(|w| w.upgrade().is_some_and(|a| Arc::ptr_eq(&a, client)));
        if !already {
            subs.push(Arc::downgrade(client));
        }
    }

    /// Removes the client from an event's subscriber set, pruning expired
    /// entries along the way. Returns whether the client was subscribed.
    fn unsubscribe(&mut self, name: &str, client: &Arc<dyn SessionHandle>) -> bool {
        let Some(subs) = self.subscribers.get_mut(name) else {
            return false;
        };
        let mut removed = false;
        subs.retain(|weak| match weak.upgrade() {
            None => false,
            Some(live) => {
                if Arc::ptr_eq(&live, client) {
                    removed = true;
                    false
                } else {
                    true
                }
            }
        });
        removed
    }
}

/// JSON-RPC server: method tables, pub/sub bookkeeping, and the transport it
/// owns.
pub struct Rpc {
    io: Arc<dyn ServerTransport>,
    inner: Arc<Mutex<Inner>>,
    hooks: Arc<dyn RpcHooks>,
}

impl Rpc {
    /// Wraps a server transport with no observer hooks.
    pub fn new(io: impl ServerTransport + 'static) -> Self {
        Self::with_hooks(io, NoHooks)
    }

    /// Wraps a server transport with observer hooks for accept/remove/binary
    /// events.
    pub fn with_hooks(io: impl ServerTransport + 'static, hooks: impl RpcHooks + 'static) -> Self {
        let rpc = Self {
            io: Arc::new(io),
            inner: Arc::new(Mutex::new(Inner::default())),
            hooks: Arc::new(hooks),
        };
        rpc.install_builtins();
        rpc
    }

    /// The transport this dispatcher drives.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn ServerTransport> {
        &self.io
    }

    /// Registers a sync method handler, replacing any previous registration
    /// under the same name.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&Arc<dyn SessionHandle>, Value) -> Result<Value, Error>
            + Send
            + Sync
            + 'static,
    ) {
        self.inner
            .lock()
            .methods
            .insert(name.into(), Arc::new(Handler::Sync(Box::new(handler))));
    }

    /// Registers an async (promise-returning) method handler.
    pub fn register_async(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&Arc<dyn SessionHandle>, Value) -> Promise<Value> + Send + Sync + 'static,
    ) {
        self.inner
            .lock()
            .methods
            .insert(name.into(), Arc::new(Handler::Async(Box::new(handler))));
    }

    /// Registers a sync regex proxy handler. Proxies are consulted in
    /// registration order after the exact-match table; the returned id can
    /// be passed to [`unregister_proxy`](Self::unregister_proxy).
    pub fn register_proxy(
        &self,
        pattern: Regex,
        handler: impl Fn(&Arc<dyn SessionHandle>, &Captures<'_>, Value) -> Result<Value, Error>
            + Send
            + Sync
            + 'static,
    ) -> u64 {
        self.insert_proxy(pattern, ProxyHandler::Sync(Box::new(handler)))
    }

    /// Registers an async regex proxy handler.
    pub fn register_proxy_async(
        &self,
        pattern: Regex,
        handler: impl Fn(&Arc<dyn SessionHandle>, &Captures<'_>, Value) -> Promise<Value>
            + Send
            + Sync
            + 'static,
    ) -> u64 {
        self.insert_proxy(pattern, ProxyHandler::Async(Box::new(handler)))
    }

    fn insert_proxy(&self, pattern: Regex, handler: ProxyHandler) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_proxy_id;
        inner.next_proxy_id += 1;
        inner.proxies.push((pattern, Arc::new(handler), id));
        id
    }

    /// Removes an exact-match method.
    pub fn unregister(&self, name: &str) {
        self.inner.lock().methods.remove(name);
    }

    /// Removes a regex proxy handler by registration id.
    pub fn unregister_proxy(&self, id: u64) {
        self.inner.lock().proxies.retain(|(_, _, pid)| *pid != id);
    }

    /// Declares a server event clients may subscribe to via `rpc.on`.
    pub fn event(&self, name: impl Into<String>) {
        self.inner.lock().events.push(name.into());
    }

    /// Pushes a notification to every live subscriber of `name`.
    ///
    /// The envelope is serialised once; expired subscribers are pruned
    /// opportunistically.
    pub fn emit(&self, name: &str, data: Value) {
        let envelope = json!({ "notification": name, "params": data }).to_string();
        let mut inner = self.inner.lock();
        let Some(subs) = inner.subscribers.get_mut(name) else {
            return;
        };
        subs.retain(|weak| match weak.upgrade() {
            Some(client) => {
                if let Err(e) = client.send(envelope.as_bytes(), MessageKind::Text) {
                    debug!(event = name, error = %e, "notification send failed");
                }
                true
            }
            None => false,
        });
    }

    /// Starts accepting and dispatching.
    pub fn start(&self) -> io::Result<()> {
        let inner = Arc::clone(&self.inner);
        let recv_hooks = Arc::clone(&self.hooks);
        let accept_hooks = Arc::clone(&self.hooks);
        let remove_hooks = Arc::clone(&self.hooks);
        self.io.start(ServerHooks {
            on_accept: Box::new(move |client| accept_hooks.on_accept(client)),
            on_remove: Box::new(move |client| remove_hooks.on_remove(client)),
            on_recv: Box::new(move |client, payload, kind| match kind {
                MessageKind::Binary => recv_hooks.on_binary(client, payload),
                MessageKind::Text => dispatch(&inner, client, payload),
            }),
        })
    }

    /// Stops the transport; every connection is torn down.
    pub fn stop(&self) {
        self.io.shutdown();
    }

    /// Installs the built-in `rpc.on` / `rpc.off` subscription methods.
    ///
    /// They capture the dispatcher state weakly so the method table does not
    /// keep its own container alive.
    fn install_builtins(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.register("rpc.on", move |client, params| {
            let inner = weak.upgrade().ok_or_else(|| Error::internal("dispatcher gone"))?;
            let names = event_name_list(&params)?;
            let mut inner = inner.lock();
            let mut result = Map::new();
            for name in names {
                let status = if inner.event_registered(&name) {
                    inner.subscribe(&name, client);
                    "ok"
                } else {
                    "provided event invalid"
                };
                result.insert(name, Value::String(status.into()));
            }
            Ok(Value::Object(result))
        });

        let weak = Arc::downgrade(&self.inner);
        self.register("rpc.off", move |client, params| {
            let inner = weak.upgrade().ok_or_else(|| Error::internal("dispatcher gone"))?;
            let names = event_name_list(&params)?;
            let mut inner = inner.lock();
            let mut result = Map::new();
            for name in names {
                let status = if inner.event_registered(&name) {
                    if inner.unsubscribe(&name, client) {
                        "ok"
                    } else {
                        "not subscribed"
                    }
                } else {
                    "provided event invalid"
                };
                result.insert(name, Value::String(status.into()));
            }
            Ok(Value::Object(result))
        });
    }
}

/// Validates `rpc.on`/`rpc.off` params: an array of strings.
fn event_name_list(params: &Value) -> Result<Vec<String>, Error> {
    let Some(items) = params.as_array() else {
        return Err(Error::InvalidParams);
    };
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_owned)
                .ok_or(Error::InvalidParams)
        })
        .collect()
}

/// `id` may be any JSON primitive; objects and arrays are rejected.
fn is_primitive(value: &Value) -> bool {
    !(value.is_object() || value.is_array())
}

fn send_text(client: &Arc<dyn SessionHandle>, message: &str) {
    if let Err(e) = client.send(message.as_bytes(), MessageKind::Text) {
        debug!(error = %e, "reply send failed");
    }
}

fn send_result(client: &Arc<dyn SessionHandle>, result: Value, id: Value) {
    let reply = json!({ "jsonrpc": "2.0", "result": result, "id": id }).to_string();
    send_text(client, &reply);
}

fn send_error(client: &Arc<dyn SessionHandle>, error: Value, id: Value) {
    let reply = json!({ "jsonrpc": "2.0", "error": error, "id": id }).to_string();
    send_text(client, &reply);
}

enum Matched {
    Exact(Arc<Handler>),
    Proxy(Arc<ProxyHandler>, Regex),
    None,
}

/// Handles one TEXT payload: parse, validate, resolve, invoke, reply.
///
/// Requests with an `id` always get a reply; notifications never do. When
/// the id cannot be determined the error reply carries `"id": null`.
fn dispatch(inner: &Arc<Mutex<Inner>>, client: &Arc<dyn SessionHandle>, payload: &[u8]) {
    let parsed: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            send_error(
                client,
                json!({ "code": -32700, "message": e.to_string() }),
                Value::Null,
            );
            return;
        }
    };

    // The echoable id, when one is present and primitive.
    let id = match parsed.get("id") {
        Some(value) if is_primitive(value) => Some(value.clone()),
        _ => None,
    };
    let reply_id = id.clone().unwrap_or(Value::Null);
    let invalid = |message: &str| {
        send_error(
            client,
            json!({ "code": -32600, "message": message }),
            id.clone().unwrap_or(Value::Null),
        );
    };

    if !parsed.is_object() {
        invalid("object required");
        return;
    }
    if parsed.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        invalid("jsonrpc version mismatch");
        return;
    }
    let Some(method) = parsed.get("method").and_then(Value::as_str) else {
        invalid("method must be a string");
        return;
    };
    let params = parsed.get("params").cloned().unwrap_or(Value::Null);
    if !(params.is_object() || params.is_array()) {
        invalid("params must be an object or array");
        return;
    }
    if parsed.get("id").is_some_and(|value| !is_primitive(value)) {
        invalid("id must be a primitive");
        return;
    }

    trace!(method, notification = id.is_none(), "dispatch");

    // Clone the handler out so it runs with the lock released.
    let matched = {
        let inner = inner.lock();
        if let Some(handler) = inner.methods.get(method) {
            Matched::Exact(Arc::clone(handler))
        } else if let Some((pattern, handler, _)) =
            inner.proxies.iter().find(|(pattern, _, _)| pattern.is_match(method))
        {
            Matched::Proxy(Arc::clone(handler), pattern.clone())
        } else {
            Matched::None
        }
    };

    match matched {
        Matched::None => {
            if id.is_some() {
                send_error(client, Error::MethodNotFound.to_error_object(), reply_id);
            }
        }
        Matched::Exact(handler) => match &*handler {
            Handler::Sync(f) => finish_sync(client, id, f(client, params)),
            Handler::Async(f) => finish_async(client, id, f(client, params)),
        },
        Matched::Proxy(handler, pattern) => {
            let Some(captures) = pattern.captures(method) else {
                // is_match held under the lock; a capture failure here would
                // mean the regex crate disagrees with itself.
                return;
            };
            match &*handler {
                ProxyHandler::Sync(f) => finish_sync(client, id, f(client, &captures, params)),
                ProxyHandler::Async(f) => finish_async(client, id, f(client, &captures, params)),
            }
        }
    }
}

fn finish_sync(
    client: &Arc<dyn SessionHandle>,
    id: Option<Value>,
    result: Result<Value, Error>,
) {
    match result {
        Ok(value) => {
            if let Some(id) = id {
                send_result(client, value, id);
            }
        }
        Err(e) => {
            debug!(error = %e, "handler failed");
            if let Some(id) = id {
                send_error(client, e.to_error_object(), id);
            }
        }
    }
}

fn finish_async(client: &Arc<dyn SessionHandle>, id: Option<Value>, promise: Promise<Value>) {
    match id {
        // Notification: run the handler, discard the outcome.
        None => promise.force(),
        Some(id) => {
            let ok_client = Arc::clone(client);
            let err_client = Arc::clone(client);
            let err_id = id.clone();
            promise
                .then(move |value| send_result(&ok_client, value, id))
                .fail(move |e| {
                    debug!(error = %e, "async handler failed");
                    send_error(&err_client, e.to_error_object(), err_id);
                })
                .force();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::Resolver;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Captures everything "sent" to a fake client connection.
    struct MockSession {
        sent: Mutex<Vec<(Vec<u8>, MessageKind)>>,
        down: AtomicBool,
    }

    impl MockSession {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                down: AtomicBool::new(false),
            })
        }

        fn sent_json(&self) -> Vec<Value> {
            self.sent
                .lock()
                .iter()
                .map(|(bytes, _)| serde_json::from_slice(bytes).expect("reply is JSON"))
                .collect()
        }
    }

    impl SessionHandle for MockSession {
        fn send(&self, data: &[u8], kind: MessageKind) -> io::Result<()> {
            self.sent.lock().push((data.to_vec(), kind));
            Ok(())
        }

        fn shutdown(&self) {
            self.down.store(true, Ordering::SeqCst);
        }
    }

    /// Transport that hands its hooks to the test for direct injection.
    struct MockTransport {
        hooks: Mutex<Option<ServerHooks>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hooks: Mutex::new(None),
            })
        }
    }

    impl ServerTransport for Arc<MockTransport> {
        fn start(&self, hooks: ServerHooks) -> io::Result<()> {
            *self.hooks.lock() = Some(hooks);
            Ok(())
        }

        fn shutdown(&self) {}
    }

    struct Fixture {
        rpc: Rpc,
        transport: Arc<MockTransport>,
    }

    impl Fixture {
        fn new() -> Self {
            let transport = MockTransport::new();
            let rpc = Rpc::new(Arc::clone(&transport));
            Self { rpc, transport }
        }

        fn started(self) -> Self {
            self.rpc.start().expect("start");
            self
        }

        fn deliver(&self, client: &Arc<MockSession>, payload: &str) {
            let handle: Arc<dyn SessionHandle> = Arc::clone(client) as Arc<dyn SessionHandle>;
            let hooks = self.transport.hooks.lock();
            let hooks = hooks.as_ref().expect("transport started");
            (hooks.on_recv)(&handle, payload.as_bytes(), MessageKind::Text);
        }
    }

    #[test]
    fn call_reaches_exact_handler_and_replies() {
        let fx = Fixture::new();
        fx.rpc.register("test", |_client, params| Ok(params));
        let fx = fx.started();

        let client = MockSession::new();
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"test","params":["x"],"id":1}"#,
        );

        let replies = client.sent_json();
        assert_eq!(replies.len(), 1);
        assert_eq!(
            replies[0],
            json!({ "jsonrpc": "2.0", "result": ["x"], "id": 1 })
        );
    }

    #[test]
    fn unknown_method_replies_32601() {
        let fx = Fixture::new().started();
        let client = MockSession::new();
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"nope","params":["x"],"id":1}"#,
        );

        let replies = client.sent_json();
        assert_eq!(
            replies[0],
            json!({
                "jsonrpc": "2.0",
                "error": { "code": -32601, "message": "method not found" },
                "id": 1
            })
        );
    }

    #[test]
    fn malformed_json_replies_32700_with_null_id() {
        let fx = Fixture::new().started();
        let client = MockSession::new();
        fx.deliver(&client, "{bad");

        let replies = client.sent_json();
        assert_eq!(replies[0]["error"]["code"], -32700);
        assert_eq!(replies[0]["id"], Value::Null);
    }

    #[test]
    fn invalid_request_shapes_reply_32600() {
        let fx = Fixture::new().started();
        let cases = [
            r#""just a string""#,
            r#"{"jsonrpc":"1.0","method":"m","params":[],"id":1}"#,
            r#"{"jsonrpc":"2.0","method":42,"params":[],"id":1}"#,
            r#"{"jsonrpc":"2.0","method":"m","params":"flat","id":1}"#,
            r#"{"jsonrpc":"2.0","method":"m","params":[],"id":{"o":1}}"#,
        ];
        for case in cases {
            let client = MockSession::new();
            fx.deliver(&client, case);
            let replies = client.sent_json();
            assert_eq!(replies[0]["error"]["code"], -32600, "case: {case}");
        }
    }

    #[test]
    fn handler_error_replies_32000() {
        let fx = Fixture::new();
        fx.rpc
            .register("error", |_client, _params| Err(Error::internal("boom")));
        let fx = fx.started();

        let client = MockSession::new();
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"error","params":[],"id":9}"#,
        );

        let replies = client.sent_json();
        assert_eq!(
            replies[0],
            json!({
                "jsonrpc": "2.0",
                "error": { "code": -32000, "message": "boom" },
                "id": 9
            })
        );
    }

    #[test]
    fn invalid_params_from_handler_replies_32602() {
        let fx = Fixture::new();
        fx.rpc
            .register("strict", |_client, _params| Err(Error::InvalidParams));
        let fx = fx.started();

        let client = MockSession::new();
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"strict","params":[],"id":2}"#,
        );

        assert_eq!(client.sent_json()[0]["error"]["code"], -32602);
    }

    #[test]
    fn notifications_never_get_replies() {
        let fx = Fixture::new();
        fx.rpc
            .register("error", |_client, _params| Err(Error::internal("boom")));
        let fx = fx.started();

        let client = MockSession::new();
        // Unknown method, failing handler, and a success: all without id.
        fx.deliver(&client, r#"{"jsonrpc":"2.0","method":"nope","params":[]}"#);
        fx.deliver(&client, r#"{"jsonrpc":"2.0","method":"error","params":[]}"#);
        fx.deliver(&client, r#"{"jsonrpc":"2.0","method":"rpc.on","params":[]}"#);

        assert!(client.sent.lock().is_empty());
    }

    #[test]
    fn exact_match_beats_regex_proxy() {
        let fx = Fixture::new();
        fx.rpc.register("foo", |_c, _p| Ok(json!("exact")));
        fx.rpc
            .register_proxy(Regex::new("^foo.*$").unwrap(), |_c, _caps, _p| {
                Ok(json!("proxy"))
            });
        let fx = fx.started();

        let client = MockSession::new();
        fx.deliver(&client, r#"{"jsonrpc":"2.0","method":"foo","params":[],"id":1}"#);
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"foobar","params":[],"id":2}"#,
        );

        let replies = client.sent_json();
        assert_eq!(replies[0]["result"], "exact");
        assert_eq!(replies[1]["result"], "proxy");
    }

    #[test]
    fn proxy_receives_capture_groups() {
        let fx = Fixture::new();
        fx.rpc
            .register_proxy(Regex::new(r"^echo\.(\S+)$").unwrap(), |_c, caps, _p| {
                Ok(json!(caps[1]))
            });
        let fx = fx.started();

        let client = MockSession::new();
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"echo.hi","params":[],"id":5}"#,
        );

        assert_eq!(
            client.sent_json()[0],
            json!({ "jsonrpc": "2.0", "result": "hi", "id": 5 })
        );
    }

    #[test]
    fn proxies_match_in_registration_order() {
        let fx = Fixture::new();
        fx.rpc
            .register_proxy(Regex::new("^job\\..*$").unwrap(), |_c, _caps, _p| {
                Ok(json!("first"))
            });
        fx.rpc
            .register_proxy(Regex::new("^job\\.run$").unwrap(), |_c, _caps, _p| {
                Ok(json!("second"))
            });
        let fx = fx.started();

        let client = MockSession::new();
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"job.run","params":[],"id":1}"#,
        );
        assert_eq!(client.sent_json()[0]["result"], "first");
    }

    #[test]
    fn unregister_proxy_removes_by_id() {
        let fx = Fixture::new();
        let id = fx
            .rpc
            .register_proxy(Regex::new("^p\\..*$").unwrap(), |_c, _caps, _p| {
                Ok(json!("proxied"))
            });
        fx.rpc.unregister_proxy(id);
        let fx = fx.started();

        let client = MockSession::new();
        fx.deliver(&client, r#"{"jsonrpc":"2.0","method":"p.x","params":[],"id":1}"#);
        assert_eq!(client.sent_json()[0]["error"]["code"], -32601);
    }

    #[test]
    fn unregister_method_by_name() {
        let fx = Fixture::new();
        fx.rpc.register("gone", |_c, _p| Ok(json!(1)));
        fx.rpc.unregister("gone");
        let fx = fx.started();

        let client = MockSession::new();
        fx.deliver(&client, r#"{"jsonrpc":"2.0","method":"gone","params":[],"id":1}"#);
        assert_eq!(client.sent_json()[0]["error"]["code"], -32601);
    }

    #[test]
    fn async_handler_replies_on_later_resolution() {
        let parked: Arc<Mutex<Option<Resolver<Value>>>> = Arc::new(Mutex::new(None));
        let fx = Fixture::new();
        let park = Arc::clone(&parked);
        fx.rpc.register_async("later", move |_client, _params| {
            let park = Arc::clone(&park);
            Promise::new(move |resolver| *park.lock() = Some(resolver))
        });
        let fx = fx.started();

        let client = MockSession::new();
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"later","params":[],"id":7}"#,
        );
        assert!(client.sent.lock().is_empty());

        parked.lock().take().unwrap().resolve(json!("done"));
        assert_eq!(
            client.sent_json()[0],
            json!({ "jsonrpc": "2.0", "result": "done", "id": 7 })
        );
    }

    #[test]
    fn async_handler_rejection_maps_through_taxonomy() {
        let fx = Fixture::new();
        fx.rpc.register_async("fail", |_client, _params| {
            Promise::rejected(Error::internal("async boom"))
        });
        let fx = fx.started();

        let client = MockSession::new();
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"fail","params":[],"id":3}"#,
        );
        let replies = client.sent_json();
        assert_eq!(replies[0]["error"]["code"], -32000);
        assert_eq!(replies[0]["error"]["message"], "async boom");
    }

    #[test]
    fn dispatch_order_is_request_order() {
        let fx = Fixture::new();
        fx.rpc.register("echo", |_c, params| Ok(params));
        let fx = fx.started();

        let client = MockSession::new();
        for id in 1..=5 {
            fx.deliver(
                &client,
                &format!(r#"{{"jsonrpc":"2.0","method":"echo","params":[{id}],"id":{id}}}"#),
            );
        }

        let ids: Vec<i64> = client
            .sent_json()
            .iter()
            .map(|reply| reply["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn rpc_on_subscribes_and_emit_delivers_once() {
        let fx = Fixture::new();
        fx.rpc.event("tick");
        let fx = fx.started();

        let subscriber = MockSession::new();
        let bystander = MockSession::new();
        fx.deliver(
            &subscriber,
            r#"{"jsonrpc":"2.0","method":"rpc.on","params":["tick"],"id":1}"#,
        );
        assert_eq!(
            subscriber.sent_json()[0],
            json!({ "jsonrpc": "2.0", "result": { "tick": "ok" }, "id": 1 })
        );

        fx.rpc.emit("tick", json!(42));
        let replies = subscriber.sent_json();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[1], json!({ "notification": "tick", "params": 42 }));
        assert!(bystander.sent.lock().is_empty());
    }

    #[test]
    fn duplicate_subscription_delivers_once() {
        let fx = Fixture::new();
        fx.rpc.event("tick");
        let fx = fx.started();

        let client = MockSession::new();
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"rpc.on","params":["tick"],"id":1}"#,
        );
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"rpc.on","params":["tick"],"id":2}"#,
        );
        fx.rpc.emit("tick", json!(null));

        // Two rpc.on replies plus exactly one notification.
        assert_eq!(client.sent.lock().len(), 3);
    }

    #[test]
    fn rpc_on_unknown_event_is_reported_per_name() {
        let fx = Fixture::new();
        fx.rpc.event("known");
        let fx = fx.started();

        let client = MockSession::new();
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"rpc.on","params":["known","mystery"],"id":1}"#,
        );
        assert_eq!(
            client.sent_json()[0]["result"],
            json!({ "known": "ok", "mystery": "provided event invalid" })
        );
    }

    #[test]
    fn rpc_on_non_string_entry_is_invalid_params() {
        let fx = Fixture::new().started();
        let client = MockSession::new();
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"rpc.on","params":[42],"id":1}"#,
        );
        assert_eq!(client.sent_json()[0]["error"]["code"], -32602);
    }

    #[test]
    fn rpc_off_stops_delivery_and_reports_status() {
        let fx = Fixture::new();
        fx.rpc.event("tick");
        let fx = fx.started();

        let client = MockSession::new();
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"rpc.on","params":["tick"],"id":1}"#,
        );
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"rpc.off","params":["tick"],"id":2}"#,
        );
        assert_eq!(client.sent_json()[1]["result"], json!({ "tick": "ok" }));

        fx.rpc.emit("tick", json!(1));
        assert_eq!(client.sent.lock().len(), 2);

        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"rpc.off","params":["tick"],"id":3}"#,
        );
        assert_eq!(
            client.sent_json()[2]["result"],
            json!({ "tick": "not subscribed" })
        );
    }

    #[test]
    fn emit_after_subscriber_dropped_prunes_silently() {
        let fx = Fixture::new();
        fx.rpc.event("tick");
        let fx = fx.started();

        let client = MockSession::new();
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"rpc.on","params":["tick"],"id":1}"#,
        );
        drop(client);

        fx.rpc.emit("tick", json!("nobody"));
        let inner = fx.rpc.inner.lock();
        assert!(inner.subscribers.get("tick").unwrap().is_empty());
    }

    #[test]
    fn emit_without_subscribers_is_harmless() {
        let fx = Fixture::new();
        fx.rpc.event("tick");
        fx.rpc.emit("tick", json!(1));
        fx.rpc.emit("unregistered", json!(2));
    }

    #[test]
    fn null_id_is_echoed_not_treated_as_notification() {
        let fx = Fixture::new();
        fx.rpc.register("echo", |_c, params| Ok(params));
        let fx = fx.started();

        let client = MockSession::new();
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"echo","params":[],"id":null}"#,
        );
        let replies = client.sent_json();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["id"], Value::Null);
    }

    #[test]
    fn string_id_is_echoed() {
        let fx = Fixture::new();
        fx.rpc.register("echo", |_c, params| Ok(params));
        let fx = fx.started();

        let client = MockSession::new();
        fx.deliver(
            &client,
            r#"{"jsonrpc":"2.0","method":"echo","params":[],"id":"abc"}"#,
        );
        assert_eq!(client.sent_json()[0]["id"], "abc");
    }
}
