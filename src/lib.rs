//! # gatehouse
//!
//! The request pipeline in front of a JSON API: CORS, CSRF, panic recovery,
//! request ids and access logging, composed around versioned route groups.
//!
//! ## The contract
//!
//! A reverse proxy still owns TLS, rate limiting and body-size limits.
//! gatehouse owns what changes between applications:
//!
//! - **CORS**: preflight answers and response headers from one policy
//! - **CSRF**: masked double-submit tokens bound to the session
//! - **Recovery**: panics become responses, broken pipes are told apart
//! - **Tracing**: a request id per request, reused from upstream if present
//! - **Access logging**: one line per request, even when the handler panics
//! - **Routing**: radix-tree lookup via [`matchit`], API versions under `/api/{version}`
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use gatehouse::{Pipeline, PipelineConfig, Request, Response, Server};
//! use http::StatusCode;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), gatehouse::Error> {
//!     let app = Pipeline::new(PipelineConfig::default())?
//!         .version("v1", |api| {
//!             api.get("/users/{id}", get_user).post("/users", create_user);
//!         })
//!         .build();
//!
//!     Server::bind("0.0.0.0:3000")?.serve(app).await
//! }
//!
//! async fn get_user(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     Response::json(format!(r#"{{"id":"{id}"}}"#))
//! }
//!
//! async fn create_user(req: Request) -> Response {
//!     if req.body().is_empty() {
//!         return Response::status(StatusCode::BAD_REQUEST);
//!     }
//!     Response::builder()
//!         .status(StatusCode::CREATED)
//!         .header("location", "/api/v1/users/99")
//!         .json(r#"{"id":"99"}"#)
//! }
//! ```

mod error;
mod handler;
mod request;
mod response;
mod router;
mod server;

pub mod auth;
pub mod login;
pub mod middleware;
pub mod pipeline;
pub mod session;

pub use error::Error;
pub use handler::{BoxFuture, Handler, Middleware, Next};
pub use pipeline::{App, Pipeline, PipelineConfig};
pub use request::Request;
pub use response::{ContentType, IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use server::Server;
