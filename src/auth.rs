//! Session-based route guards.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use gatehouse::auth::{Authenticator, Scope};
//! # use gatehouse::session::MemorySessionStore;
//! # use gatehouse::{Pipeline, PipelineConfig, Request};
//! # fn main() -> Result<(), gatehouse::Error> {
//! let sessions = Arc::new(MemorySessionStore::default());
//! let auth = Arc::new(Authenticator::new(sessions.clone(), |_id: &str| true));
//!
//! let app = Pipeline::new(PipelineConfig::default())?
//!     .layer(sessions.layer())
//!     .version("v1", |api| {
//!         api.with(auth.logged_in(&[Scope::Admin]))
//!             .get("/users", |_req: Request| async { "[]" });
//!         api.with(auth.logged_in(&[]))
//!             .with(auth.user_id_match("id"))
//!             .get("/users/{id}", |_req: Request| async { "{}" });
//!     })
//!     .build();
//! # Ok(()) }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::StatusCode;
use serde::Deserialize;

use crate::handler::{BoxFuture, Middleware, Next};
use crate::request::Request;
use crate::response::error_json;
use crate::session::{SessionData, SessionStore};

/// Identifier used for requests without a logged-in user.
pub const UNKNOWN_USER_ID: &str = "_unknown_";

/// Who is making the request, as attached by the guards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserInfo {
    pub id: String,
    pub is_admin: bool,
}

impl UserInfo {
    pub fn anonymous() -> Self {
        Self { id: UNKNOWN_USER_ID.to_owned(), is_admin: false }
    }

    fn from_session(session: &SessionData) -> Self {
        Self { id: session.user_identifier.clone(), is_admin: session.is_admin }
    }
}

/// The user attached by [`Authenticator::logged_in`] or
/// [`Authenticator::info_only`].
pub fn user_info(req: &Request) -> Option<&UserInfo> {
    req.extensions().get::<UserInfo>()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    /// Implies every other scope.
    Admin,
    User,
}

/// Admins hold every scope; any other scope only needs a login.
pub fn user_has_scopes(session: &SessionData, scopes: &[Scope]) -> bool {
    if scopes.is_empty() || session.is_admin {
        return true;
    }
    if scopes.contains(&Scope::Admin) {
        return false;
    }
    session.logged_in
}

pub type ValidFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Confirms that a logged-in user still exists and may use the service.
pub trait UserValidator: Send + Sync + 'static {
    fn is_user_valid<'a>(&'a self, user_id: &'a str) -> ValidFuture<'a>;
}

impl<F> UserValidator for F
where
    F: Fn(&str) -> bool + Send + Sync + 'static,
{
    fn is_user_valid<'a>(&'a self, user_id: &'a str) -> ValidFuture<'a> {
        let valid = self(user_id);
        Box::pin(async move { valid })
    }
}

pub struct Authenticator {
    sessions: Arc<dyn SessionStore>,
    validator: Arc<dyn UserValidator>,
}

impl Authenticator {
    pub fn new(sessions: Arc<dyn SessionStore>, validator: impl UserValidator) -> Self {
        Self { sessions, validator: Arc::new(validator) }
    }

    /// Requires a logged-in, still valid user holding `scopes`.
    pub fn logged_in(self: &Arc<Self>, scopes: &[Scope]) -> LoggedIn {
        LoggedIn { auth: Arc::clone(self), scopes: scopes.to_vec() }
    }

    /// Requires the path parameter `param` to name the session's user,
    /// unless that user is an admin.
    pub fn user_id_match(self: &Arc<Self>, param: &str) -> UserIdMatch {
        UserIdMatch { auth: Arc::clone(self), param: param.to_owned() }
    }

    /// Attaches [`UserInfo`] without rejecting anyone.
    pub fn info_only(self: &Arc<Self>) -> InfoOnly {
        InfoOnly { auth: Arc::clone(self) }
    }
}

pub struct LoggedIn {
    auth: Arc<Authenticator>,
    scopes: Vec<Scope>,
}

impl Middleware for LoggedIn {
    fn handle(self: Arc<Self>, mut req: Request, next: Next) -> BoxFuture {
        Box::pin(async move {
            let session = self.auth.sessions.data(&req);

            if !session.logged_in {
                return error_json(StatusCode::UNAUTHORIZED, "not logged in");
            }
            if !user_has_scopes(&session, &self.scopes) {
                return error_json(StatusCode::FORBIDDEN, "not enough permissions");
            }
            if !self.auth.validator.is_user_valid(&session.user_identifier).await {
                tracing::info!(user = %session.user_identifier, "user no longer valid, destroying session");
                self.auth.sessions.destroy(&req);
                return error_json(StatusCode::UNAUTHORIZED, "session no longer available");
            }

            req.extensions_mut().insert(UserInfo::from_session(&session));
            next.run(req).await
        })
    }
}

pub struct UserIdMatch {
    auth: Arc<Authenticator>,
    param: String,
}

impl Middleware for UserIdMatch {
    fn handle(self: Arc<Self>, req: Request, next: Next) -> BoxFuture {
        let session = self.auth.sessions.data(&req);
        if session.is_admin {
            return Box::pin(next.run(req));
        }

        let requested = req.param(&self.param).map(decode_path_id).unwrap_or_default();
        if requested != session.user_identifier {
            return Box::pin(async { error_json(StatusCode::FORBIDDEN, "not enough permissions") });
        }
        Box::pin(next.run(req))
    }
}

pub struct InfoOnly {
    auth: Arc<Authenticator>,
}

impl Middleware for InfoOnly {
    fn handle(self: Arc<Self>, mut req: Request, next: Next) -> BoxFuture {
        let session = self.auth.sessions.data(&req);
        let info = if session.logged_in { UserInfo::from_session(&session) } else { UserInfo::anonymous() };
        req.extensions_mut().insert(info);
        Box::pin(next.run(req))
    }
}

/// Encodes a user id for use as a path segment: standard base64 with `+`
/// replaced by `.`, `/` by `_` and `=` by `-`.
pub fn encode_path_id(id: &str) -> String {
    STANDARD.encode(id).replace('+', ".").replace('/', "_").replace('=', "-")
}

/// Inverse of [`encode_path_id`]. Undecodable input yields an empty string,
/// which matches no user.
pub fn decode_path_id(encoded: &str) -> String {
    let standard = encoded.replace('-', "=").replace('_', "/").replace('.', "+");
    STANDARD
        .decode(standard)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::handler::{BoxedMiddleware, ErasedHandler, Handler, layer_all};
    use crate::router::Router;
    use crate::session::MemorySessionStore;

    const COOKIE: &str = "gatehouse_session=s1";

    fn req(path: &str) -> Request {
        Request::from(http::Request::get(path).header("cookie", COOKIE).body(Bytes::new()).unwrap())
    }

    fn store_with(data: SessionData) -> Arc<MemorySessionStore> {
        let store = Arc::new(MemorySessionStore::default());
        store.set_data(&req("/"), data);
        store
    }

    fn user(id: &str, is_admin: bool) -> SessionData {
        SessionData { logged_in: true, is_admin, user_identifier: id.into(), ..Default::default() }
    }

    fn whoami() -> crate::handler::BoxedHandler {
        (|req: Request| async move {
            let info = user_info(&req).cloned().unwrap_or_else(UserInfo::anonymous);
            format!("{}|{}", info.id, info.is_admin)
        })
        .into_boxed_handler()
    }

    async fn call(layer: BoxedMiddleware, path: &str) -> crate::Response {
        layer_all(whoami(), &[layer]).call(req(path)).await
    }

    #[test]
    fn scope_rules() {
        let anonymous = SessionData::default();
        let alice = user("alice", false);
        let root = user("root", true);

        assert!(user_has_scopes(&anonymous, &[]));
        assert!(!user_has_scopes(&anonymous, &[Scope::User]));
        assert!(user_has_scopes(&alice, &[Scope::User]));
        assert!(!user_has_scopes(&alice, &[Scope::User, Scope::Admin]));
        assert!(user_has_scopes(&root, &[Scope::Admin]));
    }

    #[tokio::test]
    async fn logged_in_rejects_anonymous() {
        let auth = Arc::new(Authenticator::new(Arc::new(MemorySessionStore::default()), |_: &str| true));
        let res = call(Arc::new(auth.logged_in(&[])), "/").await;
        assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(res.body(), br#"{"Code":401,"Message":"not logged in"}"#);
    }

    #[tokio::test]
    async fn logged_in_checks_scopes() {
        let auth = Arc::new(Authenticator::new(store_with(user("alice", false)), |_: &str| true));
        let res = call(Arc::new(auth.logged_in(&[Scope::Admin])), "/").await;
        assert_eq!(res.status_code(), StatusCode::FORBIDDEN);

        let res = call(Arc::new(auth.logged_in(&[Scope::User])), "/").await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.body(), b"alice|false");
    }

    #[tokio::test]
    async fn invalid_user_loses_session() {
        let store = store_with(user("mallory", false));
        let auth = Arc::new(Authenticator::new(store.clone(), |id: &str| id != "mallory"));

        let res = call(Arc::new(auth.logged_in(&[])), "/").await;
        assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(res.body(), br#"{"Code":401,"Message":"session no longer available"}"#);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn user_id_match_compares_decoded_param() {
        let auth = Arc::new(Authenticator::new(store_with(user("alice@example.com", false)), |_: &str| true));
        let guard: BoxedMiddleware = Arc::new(auth.user_id_match("id"));
        let router = Router::new().get("/users/{id}", move |req: Request| {
            let next = crate::handler::Next::new(whoami());
            let guard = Arc::clone(&guard);
            async move { guard.handle(req, next).await }
        });

        let own = format!("/users/{}", encode_path_id("alice@example.com"));
        let res = router.call(req(&own)).await;
        assert_eq!(res.status_code(), StatusCode::OK);

        let other = format!("/users/{}", encode_path_id("bob@example.com"));
        let res = router.call(req(&other)).await;
        assert_eq!(res.status_code(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn info_only_defaults_to_anonymous() {
        let auth = Arc::new(Authenticator::new(Arc::new(MemorySessionStore::default()), |_: &str| true));
        let res = call(Arc::new(auth.info_only()), "/").await;
        assert_eq!(res.body(), format!("{UNKNOWN_USER_ID}|false").as_bytes());

        let auth = Arc::new(Authenticator::new(store_with(user("root", true)), |_: &str| true));
        let res = call(Arc::new(auth.info_only()), "/").await;
        assert_eq!(res.body(), b"root|true");
    }

    #[test]
    fn path_id_encoding() {
        assert_eq!(encode_path_id("a"), "YQ--");
        assert_eq!(decode_path_id("YQ--"), "a");
        assert_eq!(decode_path_id(&encode_path_id("??>~")), "??>~");
        assert_eq!(decode_path_id("%%%"), "");
    }
}
