//! Masked double-submit CSRF protection.
//!
//! Two layers share one [`Csrf`] instance:
//!
//! - [`Csrf::refresh`] issues a token, stores it in the session and exposes it
//!   to later handlers through [`token`].
//! - [`Csrf::verify`] rejects unsafe requests whose submitted token does not
//!   carry the same secret as the session's.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use gatehouse::middleware::csrf::{Csrf, CsrfConfig};
//! # use gatehouse::session::MemorySessionStore;
//! # fn main() -> Result<(), gatehouse::Error> {
//! let sessions = Arc::new(MemorySessionStore::default());
//! let csrf = Arc::new(Csrf::with_session_store(CsrfConfig::default(), sessions.clone())?);
//! let (verify, refresh) = (csrf.verify(), csrf.refresh());
//! # Ok(()) }
//! ```

mod token;

use std::sync::Arc;

use http::StatusCode;
use serde::Deserialize;

use crate::Error;
use crate::handler::{BoxFuture, Middleware, Next};
use crate::request::Request;
use crate::response::Response;
use crate::session::SessionStore;

/// The token issued for the current request, stored in the request's
/// extensions by [`Csrf::refresh`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsrfToken(pub String);

/// The token issued for this request, if a refresh layer ran before.
pub fn token(req: &Request) -> Option<&str> {
    req.extensions().get::<CsrfToken>().map(|t| t.0.as_str())
}

pub type SessionReader = Arc<dyn Fn(&Request) -> String + Send + Sync>;
pub type SessionWriter = Arc<dyn Fn(&Request, String) + Send + Sync>;
pub type TokenGetter = Arc<dyn Fn(&Request) -> String + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CsrfConfig {
    /// Secret length in bytes. The encoded token carries twice as many.
    pub token_length: usize,
    /// Methods that pass without a token.
    pub ignore_methods: Vec<String>,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            token_length: 32,
            ignore_methods: ["GET", "HEAD", "OPTIONS"].map(String::from).to_vec(),
        }
    }
}

pub struct Csrf {
    config: CsrfConfig,
    session_reader: SessionReader,
    session_writer: SessionWriter,
    token_getter: TokenGetter,
    error_callback: ErrorCallback,
}

impl Csrf {
    /// Fails when the OS random source cannot be read.
    pub fn new(
        config: CsrfConfig,
        session_reader: impl Fn(&Request) -> String + Send + Sync + 'static,
        session_writer: impl Fn(&Request, String) + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        token::check_random_source()?;
        Ok(Self {
            config,
            session_reader: Arc::new(session_reader),
            session_writer: Arc::new(session_writer),
            token_getter: Arc::new(default_token_getter),
            error_callback: Arc::new(default_error_callback),
        })
    }

    /// Keeps the token in the `csrf_token` field of the session data.
    pub fn with_session_store(
        config: CsrfConfig,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self, Error> {
        let writer_store = Arc::clone(&store);
        Self::new(
            config,
            move |req| store.data(req).csrf_token,
            move |req, token| {
                let mut data = writer_store.data(req);
                data.csrf_token = token;
                writer_store.set_data(req, data);
            },
        )
    }

    /// Replaces the default lookup order
    /// (`X-CSRF-TOKEN`, `X-XSRF-TOKEN`, `?_csrf=`, form field `_csrf`).
    pub fn token_getter(mut self, f: impl Fn(&Request) -> String + Send + Sync + 'static) -> Self {
        self.token_getter = Arc::new(f);
        self
    }

    /// Replaces the default `403 CSRF token mismatch` response.
    pub fn error_callback(mut self, f: impl Fn(&Request) -> Response + Send + Sync + 'static) -> Self {
        self.error_callback = Arc::new(f);
        self
    }

    pub fn verify(self: &Arc<Self>) -> Verify {
        Verify(Arc::clone(self))
    }

    pub fn refresh(self: &Arc<Self>) -> Refresh {
        Refresh(Arc::clone(self))
    }

    fn is_ignored(&self, req: &Request) -> bool {
        self.config.ignore_methods.iter().any(|m| m == req.method().as_str())
    }
}

/// Rejects requests that fail token verification.
pub struct Verify(Arc<Csrf>);

impl Middleware for Verify {
    fn handle(self: Arc<Self>, req: Request, next: Next) -> BoxFuture {
        let csrf = &self.0;
        if csrf.is_ignored(&req) {
            return Box::pin(next.run(req));
        }

        let submitted = (csrf.token_getter)(&req);
        let stored = (csrf.session_reader)(&req);
        if !token::token_equal(&submitted, &stored) {
            tracing::debug!(method = %req.method(), path = req.path(), "csrf token mismatch");
            let res = (csrf.error_callback)(&req);
            return Box::pin(async move { res });
        }

        Box::pin(next.run(req))
    }
}

/// Issues a token once per request.
pub struct Refresh(Arc<Csrf>);

impl Middleware for Refresh {
    fn handle(self: Arc<Self>, mut req: Request, next: Next) -> BoxFuture {
        if req.extensions().get::<CsrfToken>().is_some() {
            return Box::pin(next.run(req));
        }

        let csrf = &self.0;
        let issued = match token::issue(csrf.config.token_length) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, "failed to generate csrf token");
                return Box::pin(async { Response::status(StatusCode::INTERNAL_SERVER_ERROR) });
            }
        };

        (csrf.session_writer)(&req, issued.clone());
        req.extensions_mut().insert(CsrfToken(issued));
        Box::pin(next.run(req))
    }
}

fn default_token_getter(req: &Request) -> String {
    ["X-CSRF-TOKEN", "X-XSRF-TOKEN"]
        .iter()
        .find_map(|name| req.header(name).filter(|t| !t.is_empty()).map(str::to_owned))
        .or_else(|| req.query_param("_csrf").filter(|t| !t.is_empty()))
        .or_else(|| req.form_value("_csrf").filter(|t| !t.is_empty()))
        .unwrap_or_default()
}

fn default_error_callback(_req: &Request) -> Response {
    Response::builder().status(StatusCode::FORBIDDEN).text("CSRF token mismatch")
}
