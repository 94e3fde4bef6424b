//! Incoming HTTP request type.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Extensions, HeaderMap, Method, Uri, Version};

/// An incoming HTTP request with its body fully buffered.
///
/// Middleware passes request-scoped values down the chain through
/// [`extensions`](Request::extensions) — a map keyed by type, so two layers
/// can never collide on a string key.
pub struct Request {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) params: HashMap<String, String>,
    pub(crate) remote_addr: String,
    pub(crate) extensions: Extensions,
}

impl Request {
    pub(crate) fn new(parts: http::request::Parts, body: Bytes, remote_addr: SocketAddr) -> Self {
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
            params: HashMap::new(),
            remote_addr: remote_addr.to_string(),
            extensions: parts.extensions,
        }
    }

    /// Overrides the peer address, e.g. `"10.0.0.7:51234"` or `"[::1]:4711"`.
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = addr.into();
        self
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn path(&self) -> &str { self.uri.path() }
    pub fn query(&self) -> Option<&str> { self.uri.query() }
    pub fn version(&self) -> Version { self.version }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }
    pub fn remote_addr(&self) -> &str { &self.remote_addr }
    pub fn extensions(&self) -> &Extensions { &self.extensions }
    pub fn extensions_mut(&mut self) -> &mut Extensions { &mut self.extensions }

    /// Wire form of the protocol version, e.g. `"HTTP/1.1"`.
    pub fn protocol(&self) -> &'static str {
        match self.version {
            Version::HTTP_09 => "HTTP/0.9",
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_11 => "HTTP/1.1",
            Version::HTTP_2 => "HTTP/2.0",
            Version::HTTP_3 => "HTTP/3.0",
            _ => "HTTP/1.1",
        }
    }

    /// Case-insensitive header lookup. Values that are not visible ASCII
    /// are treated as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// First value of a percent-decoded query parameter.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// First value of a form field.
    ///
    /// For `POST`, `PUT` and `PATCH` requests with an
    /// `application/x-www-form-urlencoded` body the body is searched first,
    /// then the query string. The body stays untouched, so later handlers can
    /// still read it.
    pub fn form_value(&self, name: &str) -> Option<String> {
        if self.has_form_body() {
            let found = url::form_urlencoded::parse(&self.body)
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned());
            if found.is_some() {
                return found;
            }
        }
        self.query_param(name)
    }

    pub(crate) fn set_params(&mut self, params: HashMap<String, String>) {
        self.params = params;
    }

    fn has_form_body(&self) -> bool {
        let carries_body = matches!(self.method, Method::POST | Method::PUT | Method::PATCH);
        let is_form = self
            .header(CONTENT_TYPE.as_str())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        carries_body && is_form
    }
}

/// Builds a request from an in-memory `http::Request`, e.g. in tests or when
/// embedding the pipeline behind another server. The peer address defaults
/// to `127.0.0.1:0`; override it with [`Request::with_remote_addr`].
impl From<http::Request<Bytes>> for Request {
    fn from(req: http::Request<Bytes>) -> Self {
        let (parts, body) = req.into_parts();
        Self::new(parts, body, SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}
