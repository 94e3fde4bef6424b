//! Panic containment. Install as the outermost layer.
//!
//! A panic anywhere below is caught in the task that raised it, classified,
//! logged and turned into at most one response. A panic that merely reports a
//! vanished client (broken pipe, connection reset) gets no response by
//! default, because nobody is left to read it.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::error::Error as StdError;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};

use futures_util::FutureExt;
use http::{HeaderMap, Method, StatusCode};
use serde::Deserialize;

use super::cors::merge_headers;
use super::logging::Logger;
use crate::handler::{BoxFuture, Middleware, Next};
use crate::request::Request;
use crate::response::Response;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// What was caught.
#[derive(Debug)]
pub struct PanicRecord {
    pub error: BoxError,
    /// Backtrace taken at the panic site.
    pub stack: String,
    pub broken_pipe: bool,
}

/// The parts of the failed request a response callback may inspect.
#[derive(Clone, Debug)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
}

impl From<&Request> for RequestHead {
    fn from(req: &Request) -> Self {
        Self { method: req.method().clone(), path: req.path().to_owned(), headers: req.headers().clone() }
    }
}

/// Response headers that layers below recovery settle on before calling
/// downstream.
///
/// [`Recovery`] puts one into the request's extensions. A response built
/// for a panic gets every recorded header, the same as a response the
/// handler returns normally.
#[derive(Clone, Debug, Default)]
pub struct CommittedHeaders(Arc<Mutex<HeaderMap>>);

impl CommittedHeaders {
    /// Records `headers` on the request's slot. A no-op without a recovery
    /// layer above.
    pub fn record(req: &Request, headers: &HeaderMap) {
        if let Some(committed) = req.extensions().get::<CommittedHeaders>() {
            merge_headers(&mut committed.lock(), headers);
        }
    }

    fn apply(&self, res: &mut Response) {
        merge_headers(res.headers_mut(), &self.lock());
    }

    fn lock(&self) -> MutexGuard<'_, HeaderMap> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub type ResponseCallback = Arc<dyn Fn(&PanicRecord, &RequestHead) -> Response + Send + Sync>;
pub type LogCallback = Arc<dyn Fn(&PanicRecord) + Send + Sync>;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Log recovered panics through `tracing`. Otherwise the [`Logger`] set
    /// with [`Recovery::logger`] is used, if any.
    pub use_tracing: bool,
    /// Include the backtrace in the default error body.
    pub expose_stack_trace: bool,
    pub log_prefix: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { use_tracing: true, expose_stack_trace: false, log_prefix: String::new() }
    }
}

enum LogMode {
    Default,
    Custom(LogCallback),
    Off,
}

pub struct Recovery {
    config: RecoveryConfig,
    logger: Option<Arc<dyn Logger>>,
    log: LogMode,
    error_callback: Option<ResponseCallback>,
    broken_pipe_callback: Option<ResponseCallback>,
}

impl Recovery {
    pub fn new(config: RecoveryConfig) -> Self {
        install_stack_hook();
        let expose = config.expose_stack_trace;
        Self {
            config,
            logger: None,
            log: LogMode::Default,
            error_callback: Some(Arc::new(move |record: &PanicRecord, _head: &RequestHead| {
                default_error_response(record, expose)
            })),
            broken_pipe_callback: None,
        }
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Replaces the default JSON `500` for panics that are not broken pipes.
    pub fn error_callback(
        mut self,
        f: impl Fn(&PanicRecord, &RequestHead) -> Response + Send + Sync + 'static,
    ) -> Self {
        self.error_callback = Some(Arc::new(f));
        self
    }

    /// Leaves the response untouched for panics that are not broken pipes.
    pub fn without_error_callback(mut self) -> Self {
        self.error_callback = None;
        self
    }

    pub fn broken_pipe_callback(
        mut self,
        f: impl Fn(&PanicRecord, &RequestHead) -> Response + Send + Sync + 'static,
    ) -> Self {
        self.broken_pipe_callback = Some(Arc::new(f));
        self
    }

    /// Replaces the default logging, which reports everything except broken
    /// pipes at error level.
    pub fn log_callback(mut self, f: impl Fn(&PanicRecord) + Send + Sync + 'static) -> Self {
        self.log = LogMode::Custom(Arc::new(f));
        self
    }

    pub fn without_log_callback(mut self) -> Self {
        self.log = LogMode::Off;
        self
    }

    fn recover(&self, payload: Box<dyn Any + Send>, head: &RequestHead) -> Response {
        let stack = LAST_PANIC_STACK.with(|s| s.borrow_mut().take()).unwrap_or_default();
        let error = into_error(payload);
        let broken_pipe = is_broken_pipe(&*error);
        let record = PanicRecord { error, stack, broken_pipe };

        match &self.log {
            LogMode::Default => self.default_log(&record),
            LogMode::Custom(f) => f(&record),
            LogMode::Off => {}
        }

        let callback = if record.broken_pipe { &self.broken_pipe_callback } else { &self.error_callback };
        match callback {
            Some(f) => f(&record, head),
            None => Response::default(),
        }
    }

    fn default_log(&self, record: &PanicRecord) {
        if record.broken_pipe {
            return;
        }
        let message = if self.config.log_prefix.is_empty() {
            record.error.to_string()
        } else {
            format!("{} {}", self.config.log_prefix, record.error)
        };

        if self.config.use_tracing {
            tracing::error!(stack = %record.stack, "{message}");
        } else if let Some(logger) = &self.logger {
            logger.error(&format!("{message}; stacktrace={}", record.stack));
        }
    }
}

impl Default for Recovery {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

impl Middleware for Recovery {
    fn handle(self: Arc<Self>, mut req: Request, next: Next) -> BoxFuture {
        let head = RequestHead::from(&req);
        let committed = CommittedHeaders::default();
        req.extensions_mut().insert(committed.clone());

        Box::pin(async move {
            match AssertUnwindSafe(next.run(req)).catch_unwind().await {
                Ok(res) => res,
                Err(payload) => {
                    let mut res = self.recover(payload, &head);
                    committed.apply(&mut res);
                    res
                }
            }
        })
    }
}

fn default_error_response(record: &PanicRecord, expose_stack: bool) -> Response {
    let mut body = serde_json::json!({ "error": "Internal Server Error" });
    if expose_stack && !record.stack.is_empty() {
        body["stack"] = serde_json::Value::String(record.stack.clone());
    }
    Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR).json(body.to_string())
}

thread_local! {
    static LAST_PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static STACK_HOOK: Once = Once::new();

/// Records a backtrace for every panic on the panicking thread, then defers
/// to whatever hook was installed before.
fn install_stack_hook() {
    STACK_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let stack = Backtrace::force_capture().to_string();
            LAST_PANIC_STACK.with(|s| *s.borrow_mut() = Some(stack));
            previous(info);
        }));
    });
}

/// Panic payloads become errors: `io::Error` and boxed errors are kept,
/// messages are wrapped.
fn into_error(payload: Box<dyn Any + Send>) -> BoxError {
    let payload = match payload.downcast::<io::Error>() {
        Ok(err) => return err,
        Err(other) => other,
    };
    let payload = match payload.downcast::<BoxError>() {
        Ok(err) => return *err,
        Err(other) => other,
    };
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        return (*message).into();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone().into();
    }
    "panic with a non-string payload".into()
}

/// True if any I/O error in the chain reports a peer that went away.
pub fn is_broken_pipe(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(io_err.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset) {
                return true;
            }
            let message = io_err.to_string().to_lowercase();
            if message.contains("broken pipe") || message.contains("connection reset by peer") {
                return true;
            }
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::*;
    use crate::handler::{BoxedHandler, BoxedMiddleware, ErasedHandler, Handler, layer_all};
    use crate::response::IntoResponse;

    fn panicking(payload: fn() -> Box<dyn Any + Send>) -> BoxedHandler {
        (move |_req: Request| async move {
            if true {
                std::panic::resume_unwind(payload());
            }
            StatusCode::OK
        })
        .into_boxed_handler()
    }

    fn message_panic() -> BoxedHandler {
        (|_req: Request| async {
            if true {
                panic!("something went wrong");
            }
            StatusCode::OK
        })
        .into_boxed_handler()
    }

    fn broken_pipe_panic() -> BoxedHandler {
        (|_req: Request| async {
            if true {
                std::panic::panic_any(io::Error::new(io::ErrorKind::BrokenPipe, "write: broken pipe"));
            }
            StatusCode::OK
        })
        .into_boxed_handler()
    }

    async fn call(recovery: Recovery, handler: BoxedHandler) -> Response {
        let layers: [BoxedMiddleware; 1] = [Arc::new(recovery)];
        let req = Request::from(http::Request::get("/boom").body(Bytes::new()).unwrap());
        layer_all(handler, &layers).call(req).await
    }

    #[tokio::test]
    async fn passes_through_without_panic() {
        let ok = (|_req: Request| async { "fine" }).into_boxed_handler();
        let res = call(Recovery::default(), ok).await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.body(), b"fine");
    }

    #[tokio::test]
    async fn default_response_hides_details() {
        let res = call(Recovery::default(), message_panic()).await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.header("content-type"), Some("application/json"));
        assert_eq!(res.body(), br#"{"error":"Internal Server Error"}"#);
    }

    #[tokio::test]
    async fn exposed_stack_is_included() {
        let config = RecoveryConfig { expose_stack_trace: true, ..Default::default() };
        let res = call(Recovery::new(config), message_panic()).await;
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["error"], "Internal Server Error");
        assert!(body["stack"].as_str().is_some_and(|s| !s.is_empty()));
    }

    #[tokio::test]
    async fn custom_error_callback_sees_the_error() {
        let recovery = Recovery::default().error_callback(|record, head| {
            assert!(!record.broken_pipe);
            assert_eq!(head.path, "/boom");
            (StatusCode::IM_A_TEAPOT, record.error.to_string()).into_response()
        });
        let res = call(recovery, message_panic()).await;
        assert_eq!(res.status_code(), StatusCode::IM_A_TEAPOT);
        assert_eq!(res.body(), b"something went wrong");
    }

    #[tokio::test]
    async fn broken_pipe_without_callback_leaves_response_untouched() {
        let res = call(Recovery::default(), broken_pipe_panic()).await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert!(res.body().is_empty());
    }

    #[tokio::test]
    async fn broken_pipe_callback_runs_instead_of_error_callback() {
        let recovery = Recovery::default()
            .broken_pipe_callback(|record, _head| {
                assert!(record.broken_pipe);
                Response::status(StatusCode::SERVICE_UNAVAILABLE)
            })
            .error_callback(|_record, _head| unreachable!("error callback must not run"));
        let res = call(recovery, broken_pipe_panic()).await;
        assert_eq!(res.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn without_error_callback_leaves_response_untouched() {
        let res = call(Recovery::default().without_error_callback(), message_panic()).await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert!(res.body().is_empty());
    }

    #[tokio::test]
    async fn log_callback_sees_every_panic() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let recovery = Recovery::default()
            .log_callback(move |record| sink.lock().unwrap().push((record.error.to_string(), record.broken_pipe)));

        call(recovery, broken_pipe_panic()).await;
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![("write: broken pipe".to_owned(), true)]);
    }

    #[derive(Default)]
    struct ErrorSink(Mutex<Vec<String>>);

    impl Logger for ErrorSink {
        fn debug(&self, _: &str) {}
        fn info(&self, _: &str) {}
        fn warn(&self, _: &str) {}
        fn error(&self, message: &str) { self.0.lock().unwrap().push(message.to_owned()) }
    }

    #[tokio::test]
    async fn default_log_uses_logger_with_prefix() {
        let sink = Arc::new(ErrorSink::default());
        let config = RecoveryConfig { use_tracing: false, log_prefix: "[recovery]".into(), ..Default::default() };
        let recovery = Recovery::new(config).logger(sink.clone());

        call(recovery, message_panic()).await;
        let lines = sink.0.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("[recovery] something went wrong; stacktrace="));
    }

    #[tokio::test]
    async fn default_log_skips_broken_pipes() {
        let sink = Arc::new(ErrorSink::default());
        let config = RecoveryConfig { use_tracing: false, ..Default::default() };
        call(Recovery::new(config).logger(sink.clone()), broken_pipe_panic()).await;
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn boxed_error_payload_is_kept() {
        let handler = panicking(|| {
            let err: BoxError = Box::new(io::Error::new(io::ErrorKind::Other, "connection reset by peer"));
            Box::new(err)
        });
        let res = call(Recovery::default(), handler).await;
        assert_eq!(res.status_code(), StatusCode::OK);
    }

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("write failed") }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> { Some(&self.0) }
    }

    #[tokio::test]
    async fn recovered_response_carries_committed_headers() {
        let commit = |req: Request, next: Next| async move {
            let mut headers = HeaderMap::new();
            headers.insert("x-request-id", http::HeaderValue::from_static("ABC123"));
            headers.append("vary", http::HeaderValue::from_static("Origin"));
            CommittedHeaders::record(&req, &headers);
            next.run(req).await
        };
        let layers: [BoxedMiddleware; 2] = [Arc::new(Recovery::default()), Arc::new(commit)];
        let req = Request::from(http::Request::get("/boom").body(Bytes::new()).unwrap());
        let res = layer_all(message_panic(), &layers).call(req).await;

        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.header("x-request-id"), Some("ABC123"));
        assert_eq!(res.header("vary"), Some("Origin"));
        assert_eq!(res.header("content-type"), Some("application/json"));
    }

    #[test]
    fn recording_without_recovery_is_a_no_op() {
        let req = Request::from(http::Request::get("/").body(Bytes::new()).unwrap());
        CommittedHeaders::record(&req, &HeaderMap::new());
        assert!(req.extensions().get::<CommittedHeaders>().is_none());
    }

    #[test]
    fn broken_pipe_classification() {
        let kind = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(is_broken_pipe(&kind));

        let message = io::Error::new(io::ErrorKind::Other, "write tcp: Broken Pipe");
        assert!(is_broken_pipe(&message));

        let nested = Wrapped(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(is_broken_pipe(&nested));

        let unrelated = io::Error::new(io::ErrorKind::Other, "disk full");
        assert!(!is_broken_pipe(&unrelated));
        let plain: BoxError = "broken pipe".into();
        assert!(!is_broken_pipe(&*plain));
    }

    #[test]
    fn payload_coercion() {
        assert_eq!(into_error(Box::new("static")).to_string(), "static");
        assert_eq!(into_error(Box::new(String::from("owned"))).to_string(), "owned");
        assert_eq!(into_error(Box::new(42u8)).to_string(), "panic with a non-string payload");
    }
}
