//! Chain composition and versioned route groups.
//!
//! A [`Pipeline`] owns the global layers and a [`Router`]. Routes are added
//! either directly or through [`RouteGroup`]s mounted under
//! `/api/{version}`. [`Pipeline::build`] freezes everything into an [`App`]:
//!
//! ```text
//! recovery → logging → cors → trace → X-Served-By → extra layers → router
//!                                                                    ↓
//!                                         group layers → route layers → handler
//! ```
//!
//! ```rust,no_run
//! use gatehouse::{Pipeline, PipelineConfig, Request};
//!
//! # fn main() -> Result<(), gatehouse::Error> {
//! let app = Pipeline::new(PipelineConfig::default())?
//!     .version("v1", |api| {
//!         api.get("/ping", |_req: Request| async { "pong" });
//!     })
//!     .build();
//! # Ok(()) }
//! ```

use std::sync::Arc;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Deserialize;

use crate::Error;
use crate::handler::{BoxedHandler, BoxedMiddleware, ErasedHandler, Handler, Middleware, Next, layer_all};
use crate::middleware::{
    Cors, CorsConfig, CsrfConfig, Logging, LoggingConfig, Recovery, RecoveryConfig, TraceConfig,
    Tracer,
};
use crate::middleware::recovery::CommittedHeaders;
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;

const SERVED_BY: HeaderName = HeaderName::from_static("x-served-by");

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Install the access log layer.
    pub request_logging: bool,
    /// Value of the `X-Served-By` response header; `None` omits it.
    pub served_by: Option<String>,
    pub cors: CorsConfig,
    pub recovery: RecoveryConfig,
    pub logging: LoggingConfig,
    pub trace: TraceConfig,
    /// Not used by the pipeline itself; carried so one file configures
    /// the [`Csrf`](crate::middleware::Csrf) layers too.
    pub csrf: CsrfConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_logging: true,
            served_by: None,
            cors: CorsConfig::default(),
            recovery: RecoveryConfig::default(),
            logging: LoggingConfig::default(),
            trace: TraceConfig::default(),
            csrf: CsrfConfig::default(),
        }
    }
}

/// Builder for the full request chain.
pub struct Pipeline {
    recovery: Recovery,
    logging: Option<Logging>,
    cors: Cors,
    tracer: Tracer,
    served_by: Option<HeaderValue>,
    layers: Vec<BoxedMiddleware>,
    router: Router,
    versions: Vec<(String, RouteGroup)>,
}

impl Pipeline {
    /// Fails on an invalid trace header name or `served_by` value.
    pub fn new(config: PipelineConfig) -> Result<Self, Error> {
        let served_by = config
            .served_by
            .map(|v| {
                HeaderValue::try_from(v).map_err(|e| Error::Config(format!("served_by: {e}")))
            })
            .transpose()?;

        Ok(Self {
            recovery: Recovery::new(config.recovery),
            logging: config.request_logging.then(|| Logging::new(config.logging)),
            cors: Cors::new(config.cors),
            tracer: Tracer::new(config.trace)?,
            served_by,
            layers: Vec::new(),
            router: Router::new(),
            versions: Vec::new(),
        })
    }

    /// Replaces the recovery layer, e.g. to install custom callbacks.
    pub fn recovery(mut self, recovery: Recovery) -> Self {
        self.recovery = recovery;
        self
    }

    /// Replaces (or enables) the access log layer.
    pub fn logging(mut self, logging: Logging) -> Self {
        self.logging = Some(logging);
        self
    }

    pub fn without_logging(mut self) -> Self {
        self.logging = None;
        self
    }

    /// Adds a global layer between the built-in ones and the router. Layers
    /// run in the order they are added.
    pub fn layer(mut self, middleware: impl Middleware) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    /// Registers a route outside any version group.
    pub fn route(mut self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.router = self.router.on(method, path, handler);
        self
    }

    /// Mounts `setup`'s routes under `/api/{version}`. Registering the same
    /// version again adds to the existing group.
    pub fn version(mut self, version: &str, setup: impl FnOnce(&mut RouteGroup)) -> Self {
        let index = match self.versions.iter().position(|(v, _)| v == version) {
            Some(index) => index,
            None => {
                tracing::debug!(version, "mounting api version");
                let group = RouteGroup::new(format!("/api/{version}"));
                self.versions.push((version.to_owned(), group));
                self.versions.len() - 1
            }
        };
        setup(&mut self.versions[index].1);
        self
    }

    /// Freezes the chain.
    ///
    /// # Panics
    ///
    /// Panics if two routes conflict or a path is malformed. Routes are
    /// registered at startup, so this surfaces immediately.
    pub fn build(self) -> App {
        let mut router = self.router;
        for (_, group) in self.versions {
            router = group.register(router, &[]);
        }

        let mut layers: Vec<BoxedMiddleware> = vec![Arc::new(self.recovery)];
        if let Some(logging) = self.logging {
            layers.push(Arc::new(logging));
        }
        layers.push(Arc::new(self.cors));
        layers.push(Arc::new(self.tracer));
        if let Some(value) = self.served_by {
            layers.push(Arc::new(ServedBy(value)));
        }
        layers.extend(self.layers);

        let router: BoxedHandler = Arc::new(router);
        App { handler: layer_all(router, &layers) }
    }
}

/// Sets `X-Served-By` unless the handler chose its own.
struct ServedBy(HeaderValue);

impl Middleware for ServedBy {
    fn handle(self: Arc<Self>, req: Request, next: Next) -> crate::handler::BoxFuture {
        let mut served_by = HeaderMap::new();
        served_by.insert(SERVED_BY, self.0.clone());
        CommittedHeaders::record(&req, &served_by);

        Box::pin(async move {
            let mut res = next.run(req).await;
            res.headers_mut().entry(SERVED_BY).or_insert_with(|| self.0.clone());
            res
        })
    }
}

/// Something that registers a related set of routes, like the login flow.
pub trait ApiEndpoint: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn register(self: Arc<Self>, group: &mut RouteGroup);
}

/// Routes sharing a path prefix and a stack of layers.
pub struct RouteGroup {
    prefix: String,
    layers: Vec<BoxedMiddleware>,
    routes: Vec<Route>,
    children: Vec<RouteGroup>,
}

struct Route {
    method: Method,
    path: String,
    layers: Vec<BoxedMiddleware>,
    handler: BoxedHandler,
}

impl RouteGroup {
    fn new(prefix: String) -> Self {
        Self { prefix, layers: Vec::new(), routes: Vec::new(), children: Vec::new() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Adds a layer to every route of this group and its subgroups, including
    /// routes registered earlier.
    pub fn layer(&mut self, middleware: impl Middleware) -> &mut Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    /// A subgroup under `prefix` that inherits this group's layers.
    pub fn group(&mut self, prefix: &str, setup: impl FnOnce(&mut RouteGroup)) -> &mut Self {
        let mut child = RouteGroup::new(join(&self.prefix, prefix));
        setup(&mut child);
        self.children.push(child);
        self
    }

    /// Mounts an endpoint's routes directly in this group.
    pub fn endpoint<E: ApiEndpoint>(&mut self, endpoint: Arc<E>) -> &mut Self {
        tracing::debug!(endpoint = endpoint.name(), prefix = %self.prefix, "registering endpoint");
        endpoint.register(self);
        self
    }

    /// Starts a registration whose routes get `middleware` in front of the
    /// handler, after the group's own layers.
    pub fn with(&mut self, middleware: impl Middleware) -> With<'_> {
        With { group: self, layers: vec![Arc::new(middleware)] }
    }

    pub fn on(&mut self, method: Method, path: &str, handler: impl Handler) -> &mut Self {
        self.push(method, path, Vec::new(), handler.into_boxed_handler());
        self
    }

    pub fn get(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::GET, path, handler)
    }

    pub fn post(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::POST, path, handler)
    }

    pub fn put(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::PUT, path, handler)
    }

    pub fn patch(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::PATCH, path, handler)
    }

    pub fn delete(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::DELETE, path, handler)
    }

    fn push(&mut self, method: Method, path: &str, layers: Vec<BoxedMiddleware>, handler: BoxedHandler) {
        let path = join(&self.prefix, path);
        self.routes.push(Route { method, path, layers, handler });
    }

    fn register(self, mut router: Router, inherited: &[BoxedMiddleware]) -> Router {
        let layers: Vec<BoxedMiddleware> = inherited.iter().chain(&self.layers).cloned().collect();

        for route in self.routes {
            let stack: Vec<BoxedMiddleware> = layers.iter().chain(&route.layers).cloned().collect();
            router = router.add(route.method, &route.path, layer_all(route.handler, &stack));
        }
        for child in self.children {
            router = child.register(router, &layers);
        }
        router
    }
}

/// Route registration with extra per-route layers.
/// Obtained from [`RouteGroup::with`].
pub struct With<'a> {
    group: &'a mut RouteGroup,
    layers: Vec<BoxedMiddleware>,
}

impl With<'_> {
    pub fn with(mut self, middleware: impl Middleware) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    pub fn on(&mut self, method: Method, path: &str, handler: impl Handler) -> &mut Self {
        self.group.push(method, path, self.layers.clone(), handler.into_boxed_handler());
        self
    }

    pub fn get(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::GET, path, handler)
    }

    pub fn post(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::POST, path, handler)
    }

    pub fn put(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::PUT, path, handler)
    }

    pub fn patch(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::PATCH, path, handler)
    }

    pub fn delete(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::DELETE, path, handler)
    }
}

fn join(prefix: &str, path: &str) -> String {
    match (prefix.ends_with('/'), path.starts_with('/')) {
        _ if path.is_empty() => prefix.to_owned(),
        (true, true) => format!("{prefix}{}", &path[1..]),
        (false, false) => format!("{prefix}/{path}"),
        _ => format!("{prefix}{path}"),
    }
}

/// A finished request chain, cheap to clone and share.
#[derive(Clone)]
pub struct App {
    handler: BoxedHandler,
}

impl App {
    /// Runs one request through the chain.
    pub async fn handle(&self, req: Request) -> Response {
        self.handler.call(req).await
    }
}

/// A bare router, without any of the built-in layers.
impl From<Router> for App {
    fn from(router: Router) -> Self {
        Self { handler: Arc::new(router) }
    }
}

impl From<Pipeline> for App {
    fn from(pipeline: Pipeline) -> Self {
        pipeline.build()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use http::StatusCode;

    use super::*;

    fn get(uri: &str) -> Request {
        Request::from(http::Request::get(uri).body(Bytes::new()).unwrap())
    }

    fn quiet() -> PipelineConfig {
        PipelineConfig { request_logging: false, ..Default::default() }
    }

    #[test]
    fn join_paths() {
        assert_eq!(join("/api/v1", "/users"), "/api/v1/users");
        assert_eq!(join("/api/v1/", "/users"), "/api/v1/users");
        assert_eq!(join("/api/v1", "users"), "/api/v1/users");
        assert_eq!(join("/api/v1", ""), "/api/v1");
    }

    #[tokio::test]
    async fn versions_mount_under_api_prefix() {
        let app = Pipeline::new(quiet())
            .unwrap()
            .version("v0", |api| {
                api.get("/ping", |_req: Request| async { "v0" });
            })
            .version("v1", |api| {
                api.get("/ping", |_req: Request| async { "v1" });
            })
            .build();

        assert_eq!(app.handle(get("/api/v0/ping")).await.body(), b"v0");
        assert_eq!(app.handle(get("/api/v1/ping")).await.body(), b"v1");
        assert_eq!(app.handle(get("/ping")).await.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn duplicate_version_reuses_group() {
        let app = Pipeline::new(quiet())
            .unwrap()
            .version("v1", |api| {
                api.layer(|req: Request, next: Next| async move {
                    let mut res = next.run(req).await;
                    res.headers_mut().insert("x-group", HeaderValue::from_static("v1"));
                    res
                });
                api.get("/a", |_req: Request| async { "a" });
            })
            .version("v1", |api| {
                api.get("/b", |_req: Request| async { "b" });
            })
            .build();

        let a = app.handle(get("/api/v1/a")).await;
        let b = app.handle(get("/api/v1/b")).await;
        assert_eq!(b.body(), b"b");
        assert_eq!(a.header("x-group"), Some("v1"));
        assert_eq!(b.header("x-group"), Some("v1"));
    }

    #[tokio::test]
    async fn layer_order_is_group_then_route() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let tag = |name: &'static str| {
            let order = Arc::clone(&order);
            move |req: Request, next: Next| {
                order.lock().unwrap().push(name);
                next.run(req)
            }
        };

        let app = Pipeline::new(quiet())
            .unwrap()
            .layer(tag("global"))
            .version("v1", |api| {
                api.layer(tag("group"));
                api.group("/users", |users| {
                    users.layer(tag("subgroup"));
                    users.with(tag("route")).get("/{id}", |req: Request| async move {
                        req.param("id").unwrap_or_default().to_owned()
                    });
                });
            })
            .build();

        let res = app.handle(get("/api/v1/users/7")).await;
        assert_eq!(res.body(), b"7");
        assert_eq!(*order.lock().unwrap(), vec!["global", "group", "subgroup", "route"]);
    }

    #[tokio::test]
    async fn built_in_layers_are_applied() {
        let config = PipelineConfig { served_by: Some("gatehouse-test".into()), ..quiet() };
        let app = Pipeline::new(config)
            .unwrap()
            .route(Method::GET, "/", |_req: Request| async { "root" })
            .build();

        let req = Request::from(
            http::Request::get("/").header("Origin", "http://a.test").body(Bytes::new()).unwrap(),
        );
        let res = app.handle(req).await;
        assert_eq!(res.body(), b"root");
        assert_eq!(res.header("x-served-by"), Some("gatehouse-test"));
        assert_eq!(res.header("access-control-allow-origin"), Some("*"));
        assert_eq!(res.header("x-request-id").map(str::len), Some(8));
    }

    #[tokio::test]
    async fn panics_become_500() {
        let app = Pipeline::new(quiet())
            .unwrap()
            .route(Method::GET, "/boom", |_req: Request| async {
                if true {
                    panic!("boom");
                }
                "unreachable"
            })
            .build();

        let res = app.handle(get("/boom")).await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn invalid_served_by_is_rejected() {
        let config = PipelineConfig { served_by: Some("bad\nvalue".into()), ..quiet() };
        assert!(matches!(Pipeline::new(config), Err(Error::Config(_))));
    }
}
