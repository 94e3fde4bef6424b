//! Cross-Origin Resource Sharing.
//!
//! Admission failures are advisory: a disallowed origin only means the
//! access-control headers are withheld. The browser enforces the policy, the
//! server never blocks the request. Preflight requests are answered here with
//! `204 No Content` and never reach the handler.

use std::collections::HashSet;
use std::sync::Arc;

use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
    ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, HeaderName, HeaderValue, ORIGIN,
    VARY,
};
use http::{HeaderMap, Method, StatusCode};
use serde::Deserialize;

use super::recovery::CommittedHeaders;
use crate::handler::{BoxFuture, Middleware, Next};
use crate::request::Request;
use crate::response::Response;

const ACCESS_CONTROL_REQUEST_PRIVATE_NETWORK: HeaderName =
    HeaderName::from_static("access-control-request-private-network");
const ACCESS_CONTROL_ALLOW_PRIVATE_NETWORK: HeaderName =
    HeaderName::from_static("access-control-allow-private-network");

const VARY_PREFLIGHT: &str =
    "Origin, Access-Control-Request-Method, Access-Control-Request-Headers";
const VARY_PREFLIGHT_PRIVATE: &str = "Origin, Access-Control-Request-Method, \
    Access-Control-Request-Headers, Access-Control-Request-Private-Network";

/// CORS settings.
///
/// `"*"` in `allowed_origins`, `allowed_methods` or `allowed_headers` allows
/// everything and makes the other entries of that list irrelevant. An origin
/// may contain one `*` standing for zero or more characters, e.g.
/// `https://*.example.com`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    /// Sent in addition to the CORS-safelisted response headers.
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub allow_private_networks: bool,
    /// Preflight cache lifetime in seconds; `0` omits the header.
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_owned()],
            allowed_methods: ["HEAD", "GET", "POST", "PUT", "PATCH", "DELETE"]
                .map(String::from)
                .to_vec(),
            allowed_headers: vec!["*".to_owned()],
            exposed_headers: Vec::new(),
            allow_credentials: false,
            allow_private_networks: false,
            max_age: 0,
        }
    }
}

/// An origin pattern with a single `*`, split into the parts around it.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Wildcard {
    prefix: String,
    suffix: String,
}

impl Wildcard {
    /// Splits at the first `*`. Without one, the whole input is the prefix.
    fn new(pattern: &str) -> Self {
        match pattern.split_once('*') {
            Some((prefix, suffix)) => Self { prefix: prefix.to_owned(), suffix: suffix.to_owned() },
            None => Self { prefix: pattern.to_owned(), suffix: String::new() },
        }
    }

    fn matches(&self, s: &str) -> bool {
        s.len() >= self.prefix.len() + self.suffix.len()
            && s.starts_with(&self.prefix)
            && s.ends_with(&self.suffix)
    }
}

/// The CORS middleware. Build once, share across requests.
pub struct Cors {
    all_origins: bool,
    origins: HashSet<String>,
    origin_patterns: Vec<Wildcard>,
    all_methods: bool,
    methods: HashSet<String>,
    all_headers: bool,
    headers: HashSet<String>,
    exposed_headers: Option<HeaderValue>,
    allow_credentials: bool,
    allow_private_networks: bool,
    max_age: Option<HeaderValue>,
    vary_preflight: HeaderValue,
}

impl Cors {
    pub fn new(config: CorsConfig) -> Self {
        let all_origins = config.allowed_origins.iter().any(|o| o == "*");
        let mut origins = HashSet::new();
        let mut origin_patterns = Vec::new();
        if !all_origins {
            for origin in config.allowed_origins {
                if origin.len() > 1 && origin.contains('*') {
                    origin_patterns.push(Wildcard::new(&origin));
                } else {
                    origins.insert(origin);
                }
            }
        }

        let headers: HashSet<String> =
            config.allowed_headers.iter().map(|h| h.to_ascii_lowercase()).collect();

        let exposed = config
            .exposed_headers
            .iter()
            .map(|h| canonical_header_key(h))
            .collect::<Vec<_>>()
            .join(", ");

        let vary = if config.allow_private_networks { VARY_PREFLIGHT_PRIVATE } else { VARY_PREFLIGHT };

        Self {
            all_origins,
            origins,
            origin_patterns,
            all_methods: config.allowed_methods.iter().any(|m| m == "*"),
            methods: config.allowed_methods.into_iter().collect(),
            all_headers: headers.contains("*"),
            headers,
            exposed_headers: HeaderValue::try_from(exposed).ok().filter(|v| !v.is_empty()),
            allow_credentials: config.allow_credentials,
            allow_private_networks: config.allow_private_networks,
            max_age: (config.max_age > 0).then(|| HeaderValue::from(config.max_age)),
            vary_preflight: HeaderValue::from_static(vary),
        }
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        if self.all_origins {
            return true;
        }
        self.origins.contains(origin) || self.origin_patterns.iter().any(|w| w.matches(origin))
    }

    /// `OPTIONS` is always allowed so that preflights themselves pass.
    pub fn method_allowed(&self, method: &str) -> bool {
        if method == Method::OPTIONS.as_str() || self.all_methods {
            return true;
        }
        self.methods.contains(method)
    }

    /// Checks a comma-separated `Access-Control-Request-Headers` value.
    /// Every listed header has to be allowed.
    pub fn headers_allowed(&self, requested: &str) -> bool {
        if requested.is_empty() {
            return true;
        }
        if self.headers.is_empty() {
            return false;
        }
        if self.all_headers {
            return true;
        }
        requested
            .split(',')
            .all(|h| self.headers.contains(&h.trim().to_ascii_lowercase()))
    }

    fn is_preflight(req: &Request) -> bool {
        req.method() == Method::OPTIONS
            && req.header(ACCESS_CONTROL_REQUEST_METHOD.as_str()).is_some_and(|m| !m.is_empty())
    }

    fn allow_origin_value(&self, origin: &HeaderValue) -> HeaderValue {
        if self.all_origins { HeaderValue::from_static("*") } else { origin.clone() }
    }

    fn preflight_headers(&self, req: &Request) -> HeaderMap {
        let mut out = HeaderMap::new();
        out.append(VARY, self.vary_preflight.clone());

        let Some(origin) = non_empty(req, &ORIGIN) else { return out };
        if !origin.to_str().is_ok_and(|o| self.origin_allowed(o)) {
            return out;
        }

        let Some(method) = non_empty(req, &ACCESS_CONTROL_REQUEST_METHOD) else { return out };
        if !method.to_str().is_ok_and(|m| self.method_allowed(m)) {
            return out;
        }

        let requested_headers = non_empty(req, &ACCESS_CONTROL_REQUEST_HEADERS);
        let requested = requested_headers.and_then(|h| h.to_str().ok()).unwrap_or_default();
        if !self.headers_allowed(requested) {
            return out;
        }

        out.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin_value(origin));
        out.insert(ACCESS_CONTROL_ALLOW_METHODS, method.clone());
        if let Some(h) = requested_headers {
            out.insert(ACCESS_CONTROL_ALLOW_HEADERS, h.clone());
        }
        if self.allow_credentials {
            out.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
        if self.allow_private_networks
            && req.header(ACCESS_CONTROL_REQUEST_PRIVATE_NETWORK.as_str()) == Some("true")
        {
            out.insert(ACCESS_CONTROL_ALLOW_PRIVATE_NETWORK, HeaderValue::from_static("true"));
        }
        if let Some(max_age) = &self.max_age {
            out.insert(ACCESS_CONTROL_MAX_AGE, max_age.clone());
        }
        out
    }

    fn normal_headers(&self, req: &Request) -> HeaderMap {
        let mut out = HeaderMap::new();
        out.append(VARY, HeaderValue::from_static("Origin"));

        let Some(origin) = non_empty(req, &ORIGIN) else { return out };
        if !origin.to_str().is_ok_and(|o| self.origin_allowed(o)) {
            return out;
        }
        if !self.method_allowed(req.method().as_str()) {
            return out;
        }

        out.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin_value(origin));
        if let Some(exposed) = &self.exposed_headers {
            out.insert(ACCESS_CONTROL_EXPOSE_HEADERS, exposed.clone());
        }
        if self.allow_credentials {
            out.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
        out
    }
}

impl Middleware for Cors {
    fn handle(self: Arc<Self>, req: Request, next: Next) -> BoxFuture {
        Box::pin(async move {
            if Self::is_preflight(&req) {
                let mut res = Response::status(StatusCode::NO_CONTENT);
                *res.headers_mut() = self.preflight_headers(&req);
                return res;
            }

            let cors_headers = self.normal_headers(&req);
            CommittedHeaders::record(&req, &cors_headers);
            let mut res = next.run(req).await;
            merge_headers(res.headers_mut(), &cors_headers);
            res
        })
    }
}

/// `Vary` accumulates; anything the handler already set wins over ours.
pub(super) fn merge_headers(target: &mut HeaderMap, ours: &HeaderMap) {
    for (name, value) in ours {
        if name == VARY {
            target.append(VARY, value.clone());
        } else if !target.contains_key(name) {
            target.insert(name.clone(), value.clone());
        }
    }
}

fn non_empty<'a>(req: &'a Request, name: &HeaderName) -> Option<&'a HeaderValue> {
    req.headers().get(name).filter(|v| !v.is_empty())
}

/// `x-custom-header` → `X-Custom-Header`.
fn canonical_header_key(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
