//! Session storage seen by the CSRF layer, the auth guards and the login flow.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use http::HeaderValue;
use http::header::{COOKIE, SET_COOKIE};
use serde::{Deserialize, Serialize};

use crate::handler::{BoxFuture, Middleware, Next};
use crate::request::Request;

/// Everything a session remembers about its user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub logged_in: bool,
    pub is_admin: bool,
    pub user_identifier: String,
    pub firstname: String,
    pub lastname: String,
    pub email: String,
    pub csrf_token: String,
}

/// Request-keyed session backend.
///
/// `data` returns [`SessionData::default`] for requests without a session.
pub trait SessionStore: Send + Sync + 'static {
    fn data(&self, req: &Request) -> SessionData;
    fn set_data(&self, req: &Request, data: SessionData);
    fn destroy(&self, req: &Request);
}

/// The session id the current request is bound to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionId(pub String);

/// In-process [`SessionStore`] keyed by a session cookie.
///
/// Install [`layer`](MemorySessionStore::layer) in front of anything that
/// reads or writes sessions: it binds each request to a [`SessionId`],
/// issuing a new cookie when the client did not send one.
pub struct MemorySessionStore {
    cookie_name: String,
    secure: bool,
    sessions: Mutex<HashMap<String, SessionData>>,
}

impl MemorySessionStore {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self { cookie_name: cookie_name.into(), secure: false, sessions: Mutex::new(HashMap::new()) }
    }

    /// Marks issued cookies `Secure`.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn layer(self: &Arc<Self>) -> SessionLayer {
        SessionLayer(Arc::clone(self))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionData>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_id(&self, req: &Request) -> Option<String> {
        if let Some(SessionId(id)) = req.extensions().get::<SessionId>() {
            return Some(id.clone());
        }
        cookie(req, &self.cookie_name)
    }

    fn cookie_header(&self, id: &str) -> Option<HeaderValue> {
        let secure = if self.secure { "; Secure" } else { "" };
        HeaderValue::try_from(format!(
            "{}={id}; Path=/; HttpOnly; SameSite=Lax{secure}",
            self.cookie_name
        ))
        .ok()
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new("gatehouse_session")
    }
}

impl SessionStore for MemorySessionStore {
    fn data(&self, req: &Request) -> SessionData {
        self.session_id(req)
            .and_then(|id| self.lock().get(&id).cloned())
            .unwrap_or_default()
    }

    fn set_data(&self, req: &Request, data: SessionData) {
        match self.session_id(req) {
            Some(id) => {
                self.lock().insert(id, data);
            }
            None => tracing::warn!(path = req.path(), "request is not bound to a session, data dropped"),
        }
    }

    fn destroy(&self, req: &Request) {
        if let Some(id) = self.session_id(req) {
            self.lock().remove(&id);
        }
    }
}

/// Binds requests to sessions of a [`MemorySessionStore`].
pub struct SessionLayer(Arc<MemorySessionStore>);

impl Middleware for SessionLayer {
    fn handle(self: Arc<Self>, mut req: Request, next: Next) -> BoxFuture {
        let (id, issued) = match cookie(&req, &self.0.cookie_name) {
            Some(id) => (id, false),
            None => (uuid::Uuid::new_v4().simple().to_string(), true),
        };
        req.extensions_mut().insert(SessionId(id.clone()));

        Box::pin(async move {
            let mut res = next.run(req).await;
            if issued {
                if let Some(value) = self.0.cookie_header(&id) {
                    res.headers_mut().append(SET_COOKIE, value);
                }
            }
            res
        })
    }
}

/// Value of the named cookie, if present and non-empty.
pub(crate) fn cookie(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, v)| *k == name && !v.is_empty())
        .map(|(_, v)| v.to_owned())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::StatusCode;

    use super::*;
    use crate::handler::{BoxedMiddleware, ErasedHandler, Handler, layer_all};

    fn with_cookie(cookie: &str) -> Request {
        Request::from(http::Request::get("/").header("cookie", cookie).body(Bytes::new()).unwrap())
    }

    #[test]
    fn cookie_parsing() {
        let req = with_cookie("a=1; gatehouse_session=abc; b=2");
        assert_eq!(cookie(&req, "gatehouse_session").as_deref(), Some("abc"));
        assert_eq!(cookie(&req, "missing"), None);
        assert_eq!(cookie(&with_cookie("gatehouse_session="), "gatehouse_session"), None);
    }

    #[test]
    fn data_round_trips_per_cookie() {
        let store = MemorySessionStore::default();
        let alice = with_cookie("gatehouse_session=alice");
        let bob = with_cookie("gatehouse_session=bob");

        store.set_data(&alice, SessionData { logged_in: true, user_identifier: "alice".into(), ..Default::default() });
        assert!(store.data(&alice).logged_in);
        assert_eq!(store.data(&bob), SessionData::default());

        store.destroy(&alice);
        assert!(store.is_empty());
    }

    #[test]
    fn writes_without_a_session_are_dropped() {
        let store = MemorySessionStore::default();
        let anonymous = Request::from(http::Request::get("/").body(Bytes::new()).unwrap());
        store.set_data(&anonymous, SessionData { logged_in: true, ..Default::default() });
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn middleware_issues_cookie_once() {
        let store = Arc::new(MemorySessionStore::default().secure(true));
        let writer = Arc::clone(&store);
        let handler = (move |req: Request| {
            writer.set_data(&req, SessionData { email: "a@b.c".into(), ..Default::default() });
            async { StatusCode::OK }
        })
        .into_boxed_handler();
        let layers: [BoxedMiddleware; 1] = [Arc::new(store.layer())];
        let chain = layer_all(handler, &layers);

        let res = chain.call(Request::from(http::Request::get("/").body(Bytes::new()).unwrap())).await;
        let set_cookie = res.header("set-cookie").unwrap().to_owned();
        assert!(set_cookie.ends_with("; Path=/; HttpOnly; SameSite=Lax; Secure"));
        assert_eq!(store.len(), 1);

        let pair = set_cookie.split(';').next().unwrap();
        let res = chain.call(with_cookie(pair)).await;
        assert!(res.header("set-cookie").is_none());
        assert_eq!(store.data(&with_cookie(pair)).email, "a@b.c");
    }
}
