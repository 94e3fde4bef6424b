//! Access logging: one line per request.
//!
//! The line is written when the request's log entry is dropped, which
//! happens after the downstream chain finishes *or* while a panic unwinds
//! through it. A panicking request is therefore still logged, with the
//! defaults of [`ResponseCapture`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use http::Method;
use http::header::{REFERER, USER_AGENT};
use serde::Deserialize;

use super::capture::ResponseCapture;
use super::trace::RequestId;
use crate::handler::{BoxFuture, Middleware, Next};
use crate::request::Request;

/// A leveled sink for plain log lines. Used instead of `tracing` when one is
/// configured.
pub trait Logger: Send + Sync {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Prepended to every message, separated by a space.
    pub prefix: String,
    /// Request header whose value is logged as `header_request_id`.
    pub header_request_id: Option<String>,
    /// Log the [`RequestId`] attached by the tracer as `context_request_id`.
    pub context_request_id: bool,
}

/// Fields in the order they are recorded. Absent ids are skipped.
macro_rules! access_event {
    ($level:expr, $entry:ident, $message:ident) => {
        tracing::event!(
            $level,
            protocol = $entry.protocol,
            status = $entry.capture.status.as_u16(),
            data_length = $entry.capture.bytes_written,
            duration = ?$entry.start.elapsed(),
            client_ip = %$entry.client_ip,
            user_agent = %$entry.user_agent,
            referer = %$entry.referer,
            header_request_id = $entry.header_request_id.as_deref(),
            context_request_id = $entry.context_request_id.as_deref(),
            "{}",
            $message
        )
    };
}

pub struct Logging {
    config: LoggingConfig,
    logger: Option<Arc<dyn Logger>>,
}

impl Logging {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config, logger: None }
    }

    /// Sends lines to `logger` instead of `tracing`.
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    fn prefixed(&self, message: String) -> String {
        if self.config.prefix.is_empty() {
            message
        } else {
            format!("{} {message}", self.config.prefix)
        }
    }

    fn emit(&self, entry: &Entry) {
        match &self.logger {
            Some(logger) => {
                let line = self.prefixed(entry.line());
                match self.config.level {
                    LogLevel::Debug => logger.debug(&line),
                    LogLevel::Info => logger.info(&line),
                    LogLevel::Warn => logger.warn(&line),
                    LogLevel::Error => logger.error(&line),
                }
            }
            None => {
                let message = self.prefixed(format!("{} {}", entry.method, entry.path));
                match self.config.level {
                    LogLevel::Debug => access_event!(tracing::Level::DEBUG, entry, message),
                    LogLevel::Info => access_event!(tracing::Level::INFO, entry, message),
                    LogLevel::Warn => access_event!(tracing::Level::WARN, entry, message),
                    LogLevel::Error => access_event!(tracing::Level::ERROR, entry, message),
                }
            }
        }
    }
}

impl Middleware for Logging {
    fn handle(self: Arc<Self>, req: Request, next: Next) -> BoxFuture {
        Box::pin(async move {
            let mut entry = Entry::new(Arc::clone(&self), &req);
            let res = next.run(req).await;
            entry.capture.record(&res);
            if self.config.context_request_id {
                if let Some(RequestId(id)) = res.extensions().get::<RequestId>().filter(|id| !id.0.is_empty()) {
                    entry.context_request_id = Some(id.clone());
                }
            }
            res
        })
    }
}

/// One request's access log line, written on drop.
struct Entry {
    logging: Arc<Logging>,
    start: Instant,
    method: Method,
    path: String,
    protocol: &'static str,
    client_ip: String,
    user_agent: String,
    referer: String,
    header_request_id: Option<String>,
    context_request_id: Option<String>,
    capture: ResponseCapture,
}

impl Entry {
    fn new(logging: Arc<Logging>, req: &Request) -> Self {
        let header = |name: &str| req.header(name).unwrap_or_default().to_owned();
        let header_request_id = logging
            .config
            .header_request_id
            .as_deref()
            .and_then(|name| req.header(name))
            .filter(|id| !id.is_empty())
            .map(str::to_owned);
        let context_request_id = super::trace::request_id(req)
            .filter(|id| logging.config.context_request_id && !id.is_empty())
            .map(str::to_owned);

        Self {
            start: Instant::now(),
            method: req.method().clone(),
            path: req.path().to_owned(),
            protocol: req.protocol(),
            client_ip: client_ip(req),
            user_agent: header(USER_AGENT.as_str()),
            referer: header(REFERER.as_str()),
            header_request_id,
            context_request_id,
            capture: ResponseCapture::new(),
            logging,
        }
    }

    /// `GET /foo HTTP/1.1 - 418 13 - 1.2ms - 10.0.0.1 curl/8.0 - rid=.. ctx=..`
    fn line(&self) -> String {
        let mut line = format!(
            "{} {} {} - {} {} - {:?} - {} {} {}",
            self.method,
            self.path,
            self.protocol,
            self.capture.status.as_u16(),
            self.capture.bytes_written,
            self.start.elapsed(),
            self.client_ip,
            self.user_agent,
            self.referer,
        );
        match (&self.header_request_id, &self.context_request_id) {
            (Some(rid), Some(ctx)) => line.push_str(&format!(" - rid={rid} ctx={ctx}")),
            (Some(rid), None) => line.push_str(&format!(" - rid={rid}")),
            (None, Some(ctx)) => line.push_str(&format!(" - ctx={ctx}")),
            (None, None) => {}
        }
        line
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        let logging = Arc::clone(&self.logging);
        logging.emit(self);
    }
}

/// `X-Forwarded-For` if present, else the peer address without its port.
/// `"[::1]:4711"` becomes `"::1"`; an address without a port is returned
/// unchanged.
pub(crate) fn client_ip(req: &Request) -> String {
    if let Some(forwarded) = req.header("x-forwarded-for").filter(|v| !v.is_empty()) {
        return forwarded.to_owned();
    }

    let addr = req.remote_addr();
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return socket.ip().to_string();
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host.to_owned(),
        _ => addr.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::panic::AssertUnwindSafe;
    use std::sync::Mutex;

    use bytes::Bytes;
    use futures_util::FutureExt;
    use http::StatusCode;

    use super::*;
    use crate::handler::{BoxedHandler, BoxedMiddleware, ErasedHandler, Handler, layer_all};

    #[derive(Default)]
    struct MockLogger {
        messages: Mutex<Vec<String>>,
    }

    impl MockLogger {
        fn push(&self, level: &str, message: &str) {
            self.messages.lock().unwrap().push(format!("{level}: {message}"));
        }

        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl Logger for MockLogger {
        fn debug(&self, message: &str) { self.push("DEBUG", message) }
        fn info(&self, message: &str) { self.push("INFO", message) }
        fn warn(&self, message: &str) { self.push("WARN", message) }
        fn error(&self, message: &str) { self.push("ERROR", message) }
    }

    fn teapot() -> BoxedHandler {
        (|_req: Request| async { (StatusCode::IM_A_TEAPOT, "Hello, World!") }).into_boxed_handler()
    }

    fn get_foo() -> Request {
        Request::from(http::Request::get("http://example.com/foo").body(Bytes::new()).unwrap())
    }

    fn chain(logging: Logging, handler: BoxedHandler) -> BoxedHandler {
        let layers: [BoxedMiddleware; 1] = [Arc::new(logging)];
        layer_all(handler, &layers)
    }

    #[tokio::test]
    async fn one_line_through_custom_logger() {
        let logger = Arc::new(MockLogger::default());
        let logging = Logging::new(LoggingConfig { level: LogLevel::Error, ..Default::default() })
            .logger(logger.clone());

        let res = chain(logging, teapot()).call(get_foo()).await;
        assert_eq!(res.status_code(), StatusCode::IM_A_TEAPOT);
        assert_eq!(res.body(), b"Hello, World!");

        let messages = logger.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("ERROR: GET /foo HTTP/1.1 - 418 13 - "), "{}", messages[0]);
        assert!(messages[0].contains(" - 127.0.0.1  "));
    }

    #[tokio::test]
    async fn ids_and_prefix_in_plain_line() {
        let logger = Arc::new(MockLogger::default());
        let config = LoggingConfig {
            prefix: "[access]".into(),
            header_request_id: Some("X-Request-Id".into()),
            context_request_id: true,
            ..Default::default()
        };
        let logging = Logging::new(config).logger(logger.clone());
        let handler = (|_req: Request| async {
            let mut res = crate::Response::text("ok");
            res.extensions_mut().insert(RequestId("CTX1".into()));
            res
        })
        .into_boxed_handler();

        let req = http::Request::get("/foo")
            .header("X-Request-Id", "HDR1")
            .header("User-Agent", "curl/8.0")
            .body(Bytes::new())
            .unwrap();
        chain(logging, handler).call(Request::from(req)).await;

        let messages = logger.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("INFO: [access] GET /foo"));
        assert!(messages[0].contains("curl/8.0"));
        assert!(messages[0].ends_with(" - rid=HDR1 ctx=CTX1"), "{}", messages[0]);
    }

    #[tokio::test]
    async fn panicking_handler_is_still_logged() {
        let logger = Arc::new(MockLogger::default());
        let logging = Logging::new(LoggingConfig::default()).logger(logger.clone());
        let handler = (|_req: Request| async {
            if true {
                panic!("boom");
            }
            "unreachable"
        })
        .into_boxed_handler();

        let chain = chain(logging, handler);
        let outcome = AssertUnwindSafe(chain.call(get_foo())).catch_unwind().await;
        assert!(outcome.is_err());

        let messages = logger.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains(" - 200 0 - "), "{}", messages[0]);
    }

    #[tokio::test]
    async fn empty_ids_are_left_out() {
        let logger = Arc::new(MockLogger::default());
        let config = LoggingConfig {
            header_request_id: Some("X-Request-Id".into()),
            context_request_id: true,
            ..Default::default()
        };
        let logging = Logging::new(config).logger(logger.clone());
        let handler = (|_req: Request| async {
            let mut res = crate::Response::text("ok");
            res.extensions_mut().insert(RequestId(String::new()));
            res
        })
        .into_boxed_handler();

        chain(logging, handler).call(get_foo()).await;

        let messages = logger.messages();
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].contains("rid="), "{}", messages[0]);
        assert!(!messages[0].contains("ctx="), "{}", messages[0]);
    }

    #[test]
    fn client_ip_forms() {
        let with_remote = |addr: &str| get_foo().with_remote_addr(addr);
        assert_eq!(client_ip(&with_remote("10.0.0.7:51234")), "10.0.0.7");
        assert_eq!(client_ip(&with_remote("[::1]:4711")), "::1");
        assert_eq!(client_ip(&with_remote("example.com:1234")), "example.com");
        assert_eq!(client_ip(&with_remote("example.com")), "example.com");
        assert_eq!(client_ip(&with_remote("[::1]")), "[::1]");

        let forwarded = Request::from(
            http::Request::get("/").header("X-Forwarded-For", "203.0.113.9").body(Bytes::new()).unwrap(),
        );
        assert_eq!(client_ip(&forwarded), "203.0.113.9");
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> { Ok(()) }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer { self.clone() }
    }

    #[tokio::test]
    async fn structured_fields_through_tracing() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let logging = Logging::new(LoggingConfig {
            level: LogLevel::Warn,
            header_request_id: Some("X-Request-Id".into()),
            ..Default::default()
        });
        chain(logging, teapot()).call(get_foo()).await;

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert_eq!(output.lines().count(), 1, "{output}");
        assert!(output.contains("WARN"));
        assert!(output.contains("GET /foo"));
        assert!(output.contains("status=418"));
        assert!(output.contains("data_length=13"));
        assert!(!output.contains("context_request_id"));
    }
}
