//! Per-request correlation ids.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use super::recovery::CommittedHeaders;
use crate::Error;
use crate::handler::{BoxFuture, Middleware, Next};
use crate::request::Request;

/// The correlation id of the current request.
///
/// Inserted into the request's extensions on the way in and into the
/// response's extensions on the way out, so layers outside the tracer (the
/// access log) can see it too.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(pub String);

/// The id attached to this request, if a tracer ran before.
pub fn request_id(req: &Request) -> Option<&str> {
    req.extensions().get::<RequestId>().map(|id| id.0.as_str())
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Reuse this request header's value as the id when it is present.
    pub upstream_header: Option<String>,
    /// Response header carrying the id.
    pub header: Option<String>,
    /// Store the id as a [`RequestId`] request extension.
    pub attach_to_context: bool,
    /// Length of generated ids; `0` disables generation.
    pub length: usize,
    pub charset: String,
    /// Generator seed; defaults to the current time in nanoseconds.
    pub seed: Option<u64>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            upstream_header: None,
            header: Some("X-Request-Id".to_owned()),
            attach_to_context: true,
            length: 8,
            charset: "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789".to_owned(),
            seed: None,
        }
    }
}

pub struct Tracer {
    upstream_header: Option<HeaderName>,
    header: Option<HeaderName>,
    attach_to_context: bool,
    length: usize,
    charset: Vec<char>,
    rng: Mutex<StdRng>,
}

impl Tracer {
    /// Fails when a configured header name is not a valid HTTP header name.
    pub fn new(config: TraceConfig) -> Result<Self, Error> {
        let seed = config.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default()
        });

        Ok(Self {
            upstream_header: config.upstream_header.as_deref().map(header_name).transpose()?,
            header: config.header.as_deref().map(header_name).transpose()?,
            attach_to_context: config.attach_to_context,
            length: config.length,
            charset: config.charset.chars().collect(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    fn generate(&self) -> String {
        if self.charset.is_empty() {
            return String::new();
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        (0..self.length).map(|_| self.charset[rng.gen_range(0..self.charset.len())]).collect()
    }

    fn resolve(&self, req: &Request) -> String {
        let upstream = self
            .upstream_header
            .as_ref()
            .and_then(|name| req.headers().get(name))
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());

        match upstream {
            Some(id) => id.to_owned(),
            None if self.length > 0 => self.generate(),
            None => String::new(),
        }
    }
}

impl Middleware for Tracer {
    fn handle(self: Arc<Self>, mut req: Request, next: Next) -> BoxFuture {
        let id = self.resolve(&req);
        if self.attach_to_context {
            req.extensions_mut().insert(RequestId(id.clone()));
        }

        let mut headers = HeaderMap::new();
        if let Some(name) = &self.header {
            match HeaderValue::try_from(id.as_str()) {
                Ok(value) => {
                    headers.insert(name.clone(), value);
                }
                Err(_) => tracing::debug!(request_id = %id, "request id is not a valid header value"),
            }
        }
        CommittedHeaders::record(&req, &headers);

        Box::pin(async move {
            let mut res = next.run(req).await;
            res.headers_mut().extend(headers);
            if self.attach_to_context {
                res.extensions_mut().insert(RequestId(id));
            }
            res
        })
    }
}

fn header_name(name: &str) -> Result<HeaderName, Error> {
    HeaderName::try_from(name).map_err(|e| Error::Config(format!("header `{name}`: {e}")))
}
