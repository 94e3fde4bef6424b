//! Handler and middleware traits, and their type erasure.
//!
//! # How async handlers are stored
//!
//! The router needs to hold handlers of *different* types in a single
//! `HashMap<Method, Tree>`. Rust collections can only hold one concrete type,
//! so we use **trait objects** (`dyn ErasedHandler`) to hide the concrete
//! handler type behind a common interface and store everything uniformly.
//!
//! ```text
//! async fn hello(req: Request) -> Response { … }   ← user writes this
//!        ↓ router.get("/", hello)
//! hello.into_boxed_handler()                       ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(hello))                       ← heap-allocated wrapper
//!        ↓  stored as BoxedHandler = Arc<dyn ErasedHandler>
//! handler.call(req)  at request time               ← one vtable dispatch
//! ```
//!
//! # How middleware wraps a handler
//!
//! A [`Middleware`] receives the request plus a [`Next`] — the rest of the
//! chain. Wrapping a handler in a middleware yields another `BoxedHandler`,
//! so a whole chain is just handlers nested inside each other:
//!
//! ```text
//! recovery( logging( cors( trace( router ) ) ) )
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::request::Request;
use crate::response::{IntoResponse, Response};

// ── Internal types ────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future that resolves to a [`Response`].
///
/// `Pin<Box<…>>` is required because the async runtime must be able to poll
/// the future in-place. `Send + 'static` let tokio move the future across
/// threads safely.
pub type BoxFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: Request) -> BoxFuture;
}

/// A heap-allocated, type-erased handler shared across concurrent requests.
#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for every valid route handler.
///
/// You never implement this yourself. It is automatically satisfied for any
/// `async fn` with the signature:
///
/// ```text
/// async fn name(req: Request) -> impl IntoResponse
/// ```
///
/// The trait is **sealed** (via the private `Sealed` supertrait): only the
/// blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

/// Newtype wrapper that holds a concrete handler `F` and implements
/// [`ErasedHandler`], bridging the typed world to the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_response() })
    }
}

// ── Middleware ────────────────────────────────────────────────────────────────

/// The remainder of the chain, handed to a [`Middleware`].
///
/// Call [`run`](Next::run) to pass the request on; drop it to short-circuit.
#[derive(Clone)]
pub struct Next {
    inner: BoxedHandler,
}

impl Next {
    pub(crate) fn new(inner: BoxedHandler) -> Self {
        Self { inner }
    }

    pub async fn run(self, req: Request) -> Response {
        self.inner.call(req).await
    }
}

/// A layer that runs around a handler.
///
/// Implemented by the built-in middleware in [`crate::middleware`], and
/// automatically for any function of the shape:
///
/// ```text
/// async fn name(req: Request, next: Next) -> Response
/// ```
///
/// Middleware values are built once at startup and shared across all
/// requests, so `handle` receives `Arc<Self>` and must not mutate
/// configuration.
pub trait Middleware: Send + Sync + 'static {
    fn handle(self: Arc<Self>, req: Request, next: Next) -> BoxFuture;
}

impl<F, Fut> Middleware for F
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn handle(self: Arc<Self>, req: Request, next: Next) -> BoxFuture {
        Box::pin((self)(req, next))
    }
}

/// A shared, type-erased middleware.
pub type BoxedMiddleware = Arc<dyn Middleware>;

/// A handler with one middleware in front of it.
struct Layered {
    middleware: BoxedMiddleware,
    next: BoxedHandler,
}

impl ErasedHandler for Layered {
    fn call(&self, req: Request) -> BoxFuture {
        Arc::clone(&self.middleware).handle(req, Next::new(Arc::clone(&self.next)))
    }
}

/// Wraps `handler` in `layers`; the first layer ends up outermost.
pub(crate) fn layer_all(handler: BoxedHandler, layers: &[BoxedMiddleware]) -> BoxedHandler {
    layers.iter().rev().fold(handler, |next, middleware| {
        let layered: BoxedHandler = Arc::new(Layered { middleware: Arc::clone(middleware), next });
        layered
    })
}
