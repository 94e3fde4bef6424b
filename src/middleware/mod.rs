//! Built-in middleware.
//!
//! Each layer is configured once at startup, shared behind an `Arc` and
//! never mutated afterwards. [`Pipeline`](crate::Pipeline) stacks them in
//! this order, outermost first:
//!
//! ```text
//! recovery → logging → cors → trace → [X-Served-By] → router → csrf/auth → handler
//! ```
//!
//! Every layer can also be used on its own through
//! [`RouteGroup::with`](crate::pipeline::RouteGroup::with) or
//! [`Pipeline::layer`](crate::Pipeline::layer).

pub mod capture;
pub mod cors;
pub mod csrf;
pub mod logging;
pub mod recovery;
pub mod trace;

pub use capture::ResponseCapture;
pub use cors::{Cors, CorsConfig};
pub use csrf::{Csrf, CsrfConfig, CsrfToken};
pub use logging::{LogLevel, Logger, Logging, LoggingConfig};
pub use recovery::{CommittedHeaders, PanicRecord, Recovery, RecoveryConfig, RequestHead};
pub use trace::{RequestId, TraceConfig, Tracer};
