//! Eager, single-shot, chainable completion carrier.
//!
//! A [`Promise`] owns an executor body and at most one success handler and
//! one failure handler. The body runs exactly once — explicitly via
//! [`Promise::force`], or implicitly when the promise is dropped — with
//! whatever handlers are attached at that moment (missing handlers default
//! to no-ops). That lets callers fire-and-forget:
//!
//! ```ignore
//! client.call("status", json!([]))
//!     .then(|v| println!("status: {v}"))
//!     .fail(|e| eprintln!("failed: {e}"));
//! // The temporary is dropped here, which forces the executor.
//! ```
//!
//! Resolution may happen long after the body ran: the body receives a
//! cloneable [`Resolver`] it can park in a correlation table, and whichever
//! clone fires first wins — a promise settles at most once.
//!
//! Promises are move-only and have exactly one downstream consumer:
//! re-attaching a handler replaces the previous one.

use crate::error::Error;
use parking_lot::Mutex;
use std::sync::Arc;

type ValueFn<T> = Box<dyn FnOnce(T) + Send>;
type FailFn = Box<dyn FnOnce(Error) + Send>;
type Body<T> = Box<dyn FnOnce(Resolver<T>) + Send>;

/// Single-shot resolution handle handed to a promise's executor.
///
/// Clones share the same settlement slot: after any clone resolves or
/// rejects, every later attempt is silently ignored.
pub struct Resolver<T> {
    slots: Arc<Mutex<Slots<T>>>,
}

struct Slots<T> {
    on_value: Option<ValueFn<T>>,
    on_error: Option<FailFn>,
    settled: bool,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T> Resolver<T> {
    fn new(on_value: Option<ValueFn<T>>, on_error: Option<FailFn>) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                on_value,
                on_error,
                settled: false,
            })),
        }
    }

    /// Delivers the success value. No-op if already settled.
    pub fn resolve(&self, value: T) {
        let handler = {
            let mut slots = self.slots.lock();
            if slots.settled {
                return;
            }
            slots.settled = true;
            slots.on_error = None;
            slots.on_value.take()
        };
        if let Some(handler) = handler {
            handler(value);
        }
    }

    /// Delivers the failure. No-op if already settled.
    pub fn reject(&self, error: Error) {
        let handler = {
            let mut slots = self.slots.lock();
            if slots.settled {
                return;
            }
            slots.settled = true;
            slots.on_value = None;
            slots.on_error.take()
        };
        if let Some(handler) = handler {
            handler(error);
        }
    }
}

/// Eager, single-shot, move-only promise.
///
/// See the [module docs](self) for the execution model.
#[must_use = "a promise executes when dropped; bind or force it deliberately"]
pub struct Promise<T: Send + 'static> {
    body: Option<Body<T>>,
    on_value: Option<ValueFn<T>>,
    on_error: Option<FailFn>,
}

impl<T: Send + 'static> Promise<T> {
    /// Creates a promise from an executor body.
    ///
    /// The body runs once the promise is forced (explicitly or at drop) and
    /// receives a [`Resolver`] bound to whatever handlers are attached then.
    pub fn new(body: impl FnOnce(Resolver<T>) + Send + 'static) -> Self {
        Self {
            body: Some(Box::new(body)),
            on_value: None,
            on_error: None,
        }
    }

    /// A promise that immediately resolves with `value`.
    pub fn resolved(value: T) -> Self {
        Self::new(move |resolver| resolver.resolve(value))
    }

    /// A promise that immediately rejects with `error`.
    pub fn rejected(error: Error) -> Self {
        Self::new(move |resolver| resolver.reject(error))
    }

    /// Attaches the success handler, replacing any previous one.
    pub fn then(mut self, handler: impl FnOnce(T) + Send + 'static) -> Self {
        self.on_value = Some(Box::new(handler));
        self
    }

    /// Attaches the failure handler, replacing any previous one.
    pub fn fail(mut self, handler: impl FnOnce(Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(handler));
        self
    }

    /// Transforms the success value, producing a promise of the result.
    ///
    /// A transform error becomes a rejection of the returned promise;
    /// rejections of `self` propagate unchanged. Handlers previously
    /// attached to `self` are discarded — the transform is the consumer.
    pub fn map<R: Send + 'static>(
        mut self,
        transform: impl FnOnce(T) -> Result<R, Error> + Send + 'static,
    ) -> Promise<R> {
        let body = self.body.take();
        Promise::new(move |resolver| {
            let on_fail = resolver.clone();
            Self {
                body,
                on_value: None,
                on_error: None,
            }
            .then(move |value| match transform(value) {
                Ok(mapped) => resolver.resolve(mapped),
                Err(error) => resolver.reject(error),
            })
            .fail(move |error| on_fail.reject(error))
            .force();
        })
    }

    /// Transforms the success value into another promise, flattening it.
    ///
    /// The returned promise settles the way the inner promise does;
    /// rejections of `self` propagate unchanged.
    pub fn chain<R: Send + 'static>(
        mut self,
        transform: impl FnOnce(T) -> Promise<R> + Send + 'static,
    ) -> Promise<R> {
        let body = self.body.take();
        Promise::new(move |resolver| {
            let on_fail = resolver.clone();
            Self {
                body,
                on_value: None,
                on_error: None,
            }
            .then(move |value| {
                let inner_fail = resolver.clone();
                transform(value)
                    .then(move |mapped| resolver.resolve(mapped))
                    .fail(move |error| inner_fail.reject(error))
                    .force();
            })
            .fail(move |error| on_fail.reject(error))
            .force();
        })
    }

    /// Runs the executor now instead of waiting for drop.
    pub fn force(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(body) = self.body.take() {
            let resolver = Resolver::new(self.on_value.take(), self.on_error.take());
            body(resolver);
        }
    }
}

impl<T: Send + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        self.run();
    }
}

impl<T: Send + 'static> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("pending", &self.body.is_some())
            .field("has_then", &self.on_value.is_some())
            .field("has_fail", &self.on_error.is_some())
            .finish()
    }
}

/// Applies `transform` to every item and resolves with all results in input
/// order once every produced promise has resolved. The first rejection
/// rejects the whole.
pub fn map_all<T, R, F>(items: Vec<T>, transform: F) -> Promise<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Promise<R> + Send + 'static,
{
    Promise::new(move |resolver| {
        let total = items.len();
        if total == 0 {
            resolver.resolve(Vec::new());
            return;
        }
        let gathered: Arc<Mutex<Vec<Option<R>>>> =
            Arc::new(Mutex::new((0..total).map(|_| None).collect()));
        let remaining = Arc::new(Mutex::new(total));

        for (index, item) in items.into_iter().enumerate() {
            let gathered = Arc::clone(&gathered);
            let remaining = Arc::clone(&remaining);
            let resolver = resolver.clone();
            let fail_resolver = resolver.clone();
            transform(item)
                .then(move |value| {
                    gathered.lock()[index] = Some(value);
                    let done = {
                        let mut left = remaining.lock();
                        *left -= 1;
                        *left == 0
                    };
                    if done {
                        // remaining only reaches zero after every slot was
                        // filled, so the take cannot skip entries.
                        let values: Vec<R> =
                            gathered.lock().iter_mut().filter_map(Option::take).collect();
                        resolver.resolve(values);
                    }
                })
                .fail(move |error| fail_resolver.reject(error))
                .force();
        }
    })
}

/// Applies `transform` to every item; the first promise to resolve wins.
/// Rejects only when every produced promise has failed (with the last
/// failure), or immediately when `items` is empty.
pub fn map_any<T, R, F>(items: Vec<T>, transform: F) -> Promise<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Promise<R> + Send + 'static,
{
    Promise::new(move |resolver| {
        let total = items.len();
        if total == 0 {
            resolver.reject(Error::internal("no candidates"));
            return;
        }
        let failures = Arc::new(Mutex::new(0usize));

        for item in items {
            let failures = Arc::clone(&failures);
            let resolver = resolver.clone();
            let fail_resolver = resolver.clone();
            transform(item)
                .then(move |value| resolver.resolve(value))
                .fail(move |error| {
                    let all_failed = {
                        let mut count = failures.lock();
                        *count += 1;
                        *count == total
                    };
                    if all_failed {
                        fail_resolver.reject(error);
                    }
                })
                .force();
        }
    })
}
