//! OAuth login flow on top of the session store.
//!
//! [`LoginFlow`] owns the HTTP side of the handshake: it hands out provider
//! redirect URLs, validates the callback against an injected [`StateStore`]
//! and writes the resulting user into the session. Talking to the identity
//! provider is left to [`LoginProvider`] implementations.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use gatehouse::login::{LoginConfig, LoginFlow, StateStore};
//! # use gatehouse::session::MemorySessionStore;
//! # use gatehouse::{Pipeline, PipelineConfig};
//! # async fn run() -> Result<(), gatehouse::Error> {
//! let config = LoginConfig { external_url: "https://vpn.example.com".into(), ..Default::default() };
//! let sessions = Arc::new(MemorySessionStore::default());
//! let states = Arc::new(StateStore::new(config.state_ttl()));
//! states.spawn_cleaner();
//!
//! let login = Arc::new(LoginFlow::new(config, sessions.clone(), states));
//! let app = Pipeline::new(PipelineConfig::default())?
//!     .layer(sessions.layer())
//!     .version("v1", |api| {
//!         api.endpoint(login);
//!     })
//!     .build();
//! # let _ = app; Ok(()) }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use http::StatusCode;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use url::Url;

use crate::pipeline::{ApiEndpoint, RouteGroup};
use crate::request::Request;
use crate::response::{Response, error_json};
use crate::session::SessionStore;

/// Query parameter appended to the return URL after a redirecting login.
pub const LOGIN_STATE_PARAM: &str = "wgLoginState";

const NONCE_BYTES: usize = 16;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    /// Public base URL of the application. Return URLs must start with it.
    pub external_url: String,
    /// Lifetime of a pending handshake.
    pub state_ttl_secs: u64,
    /// Upper bound for the code exchange with the provider.
    pub exchange_timeout_secs: u64,
}

impl LoginConfig {
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self { external_url: String::new(), state_ttl_secs: 5 * 60, exchange_timeout_secs: 1000 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("missing oauth provider {0}")]
    UnknownProvider(String),

    #[error("failed to generate nonce: {0}")]
    Randomness(#[from] rand::Error),

    #[error("unable to exchange code: {0}")]
    Exchange(String),

    #[error("login timed out after {0:?}")]
    Timeout(Duration),
}

/// The user a provider vouched for.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserProfile {
    pub identifier: String,
    pub is_admin: bool,
    pub firstname: String,
    pub lastname: String,
    pub email: String,
}

pub type ExchangeFuture<'a> = Pin<Box<dyn Future<Output = Result<UserProfile, LoginError>> + Send + 'a>>;

/// An external identity provider.
pub trait LoginProvider: Send + Sync + 'static {
    /// Human-readable name shown on login pages.
    fn name(&self) -> &str;

    /// Where to send the browser to start the handshake.
    fn auth_code_url(&self, state: &str, nonce: &str) -> String;

    /// Trades the authorization code for the user's profile.
    fn exchange<'a>(&'a self, code: &'a str, nonce: &'a str) -> ExchangeFuture<'a>;
}

// ── StateStore ───────────────────────────────────────────────────────────────

/// A pending handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginState {
    pub remote_host: String,
    pub provider: String,
    pub nonce: String,
    pub return_to: Option<String>,
    expires_at: Instant,
}

/// Pending handshakes keyed by their random state id.
///
/// A state is only handed back to the host that created it and only until
/// its TTL runs out. [`spawn_cleaner`](StateStore::spawn_cleaner) evicts
/// expired entries in the background.
pub struct StateStore {
    ttl: Duration,
    states: Mutex<HashMap<String, LoginState>>,
    closed: Arc<Notify>,
}

impl StateStore {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, states: Mutex::new(HashMap::new()), closed: Arc::new(Notify::new()) }
    }

    pub fn new_state(&self, remote_addr: &str, provider: &str, nonce: &str, return_to: Option<&str>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let state = LoginState {
            remote_host: remote_host(remote_addr),
            provider: provider.to_owned(),
            nonce: nonce.to_owned(),
            return_to: return_to.map(str::to_owned),
            expires_at: Instant::now() + self.ttl,
        };
        self.lock().insert(id.clone(), state);
        id
    }

    /// The live state `id`, if it was created by the same host as
    /// `remote_addr`.
    pub fn get(&self, id: &str, remote_addr: &str) -> Option<LoginState> {
        let states = self.lock();
        let state = states.get(id)?;
        if state.expires_at <= Instant::now() || state.remote_host != remote_host(remote_addr) {
            return None;
        }
        Some(state.clone())
    }

    pub fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired handshakes and returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut states = self.lock();
        let before = states.len();
        states.retain(|_, state| state.expires_at > now);
        before - states.len()
    }

    /// Runs [`evict_expired`](StateStore::evict_expired) once per TTL until
    /// the store is dropped or [`shutdown`](StateStore::shutdown) is called.
    /// Must be called from within a tokio runtime.
    pub fn spawn_cleaner(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        let period = self.ttl.max(Duration::from_millis(1));
        tokio::spawn(clean(store, Arc::clone(&self.closed), period))
    }

    /// Stops the cleaner task.
    pub fn shutdown(&self) {
        self.closed.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LoginState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        self.closed.notify_one();
    }
}

/// Holds only a weak reference between ticks, so the store is freed as soon
/// as its owners let go.
async fn clean(store: Weak<StateStore>, closed: Arc<Notify>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = closed.notified() => break,
            _ = ticker.tick() => {
                let Some(strong) = store.upgrade() else { break };
                let evicted = strong.evict_expired();
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted expired login states");
                }
            }
        }
    }
    tracing::debug!("login state cleaner stopped");
}

/// `"10.0.0.7:51234"` → `"10.0.0.7"`, `"[::1]:80"` → `"::1"`.
fn remote_host(addr: &str) -> String {
    if let Ok(addr) = addr.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host.to_owned(),
        _ => addr.to_owned(),
    }
}

// ── LoginFlow ────────────────────────────────────────────────────────────────

/// HTTP handlers for the OAuth handshake, mounted under `/auth` by its
/// [`ApiEndpoint`] implementation.
pub struct LoginFlow {
    external_url: String,
    exchange_timeout: Duration,
    sessions: Arc<dyn SessionStore>,
    states: Arc<StateStore>,
    providers: HashMap<String, Arc<dyn LoginProvider>>,
}

impl LoginFlow {
    pub fn new(config: LoginConfig, sessions: Arc<dyn SessionStore>, states: Arc<StateStore>) -> Self {
        Self {
            exchange_timeout: config.exchange_timeout(),
            external_url: config.external_url,
            sessions,
            states,
            providers: HashMap::new(),
        }
    }

    /// Registers `provider` under the path segment `id`.
    pub fn provider(mut self, id: &str, provider: impl LoginProvider) -> Self {
        self.providers.insert(id.to_owned(), Arc::new(provider));
        self
    }

    pub fn exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// `GET /login/{provider}/init`
    ///
    /// Query: `redirect=true` answers with a redirect to the provider instead
    /// of JSON; `return=<url>` is where the browser goes after the callback.
    pub async fn initiate(&self, req: Request) -> Response {
        let session = self.sessions.data(&req);
        let auto_redirect = req.query_param("redirect").is_some_and(|v| parse_bool(&v));
        let return_to = req.query_param("return").filter(|r| !r.is_empty());
        let provider_id = req.param("provider").unwrap_or_default();

        if let Some(return_to) = &return_to {
            if !self.is_valid_return_url(return_to) {
                return error_json(StatusCode::BAD_REQUEST, "invalid return URL");
            }
        }
        let back = return_to.as_deref().filter(|_| auto_redirect);

        if session.logged_in {
            return match back {
                Some(back) => redirect_back(back, true),
                None => error_json(StatusCode::BAD_REQUEST, "already logged in"),
            };
        }

        let started = self.start(&req, provider_id, return_to.as_deref());
        let (auth_code_url, state) = match started {
            Ok(started) => started,
            Err(err) => {
                tracing::warn!(provider = provider_id, error = %err, "unable to start oauth login");
                return match back {
                    Some(back) => redirect_back(back, false),
                    None => error_json(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
                };
            }
        };

        if auto_redirect {
            return redirect(&auth_code_url);
        }
        let body = serde_json::json!({ "redirect_url": auth_code_url, "state": state });
        Response::json(body.to_string())
    }

    /// `GET /login/{provider}/callback`
    pub async fn callback(&self, req: Request) -> Response {
        let session = self.sessions.data(&req);
        let provider_id = req.param("provider").unwrap_or_default().to_owned();
        let state_id = req.query_param("state").unwrap_or_default();
        let code = req.query_param("code").unwrap_or_default();

        let state = self.states.get(&state_id, req.remote_addr());
        let return_to = state
            .as_ref()
            .and_then(|s| s.return_to.clone())
            .filter(|r| self.is_valid_return_url(r));

        if session.logged_in {
            return match return_to {
                Some(return_to) => redirect_back(&return_to, true),
                None => error_json(StatusCode::BAD_REQUEST, "already logged in"),
            };
        }

        let Some(state) = state else {
            return error_json(StatusCode::BAD_REQUEST, "invalid oauth state");
        };
        let provider = self.providers.get(&provider_id).filter(|_| state.provider == provider_id);
        let Some(provider) = provider else {
            return match return_to {
                Some(return_to) => redirect_back(&return_to, false),
                None => error_json(StatusCode::BAD_REQUEST, "invalid oauth provider"),
            };
        };
        self.states.remove(&state_id);

        let exchange = provider.exchange(&code, &state.nonce);
        let user = match tokio::time::timeout(self.exchange_timeout, exchange).await {
            Ok(Ok(user)) => user,
            Ok(Err(err)) => return self.login_failed(&provider_id, err, return_to),
            Err(_) => {
                let err = LoginError::Timeout(self.exchange_timeout);
                return self.login_failed(&provider_id, err, return_to);
            }
        };

        let mut data = self.sessions.data(&req);
        data.logged_in = true;
        data.is_admin = user.is_admin;
        data.user_identifier = user.identifier.clone();
        data.firstname = user.firstname.clone();
        data.lastname = user.lastname.clone();
        data.email = user.email.clone();
        self.sessions.set_data(&req, data);
        tracing::info!(provider = %provider_id, user = %user.identifier, "oauth login succeeded");

        match return_to {
            Some(return_to) => redirect_back(&return_to, true),
            None => match serde_json::to_vec(&user) {
                Ok(body) => Response::json(body),
                Err(_) => Response::status(StatusCode::INTERNAL_SERVER_ERROR),
            },
        }
    }

    /// `POST /logout`
    pub async fn logout(&self, req: Request) -> Response {
        if !self.sessions.data(&req).logged_in {
            return error_json(StatusCode::OK, "not logged in");
        }
        self.sessions.destroy(&req);
        error_json(StatusCode::OK, "logout ok")
    }

    /// `GET /session`
    pub async fn session_info(&self, req: Request) -> Response {
        let session = self.sessions.data(&req);
        let info = if session.logged_in {
            serde_json::json!({
                "LoggedIn": true,
                "IsAdmin": session.is_admin,
                "UserIdentifier": session.user_identifier,
                "UserFirstname": session.firstname,
                "UserLastname": session.lastname,
                "UserEmail": session.email,
            })
        } else {
            serde_json::json!({ "LoggedIn": false })
        };
        Response::json(info.to_string())
    }

    /// `GET /providers`
    fn provider_list(&self, prefix: &str) -> Response {
        let mut ids: Vec<&String> = self.providers.keys().collect();
        ids.sort();
        let list: Vec<_> = ids
            .into_iter()
            .map(|id| {
                serde_json::json!({
                    "Identifier": id,
                    "Name": self.providers[id].name(),
                    "ProviderUrl": format!("{prefix}/login/{id}/init"),
                    "CallbackUrl": format!("{prefix}/login/{id}/callback"),
                })
            })
            .collect();
        Response::json(serde_json::Value::from(list).to_string())
    }

    fn start(&self, req: &Request, provider_id: &str, return_to: Option<&str>) -> Result<(String, String), LoginError> {
        let provider = self
            .providers
            .get(provider_id)
            .ok_or_else(|| LoginError::UnknownProvider(provider_id.to_owned()))?;
        let nonce = random_string(NONCE_BYTES)?;
        let state = self.states.new_state(req.remote_addr(), provider_id, &nonce, return_to);
        Ok((provider.auth_code_url(&state, &nonce), state))
    }

    fn login_failed(&self, provider: &str, err: LoginError, return_to: Option<String>) -> Response {
        tracing::warn!(provider, error = %err, "oauth login failed");
        match return_to {
            Some(return_to) => redirect_back(&return_to, false),
            None => error_json(StatusCode::UNAUTHORIZED, &err.to_string()),
        }
    }

    fn is_valid_return_url(&self, url: &str) -> bool {
        url.starts_with(&self.external_url)
    }
}

impl ApiEndpoint for LoginFlow {
    fn name(&self) -> &'static str {
        "authentication"
    }

    fn register(self: Arc<Self>, group: &mut RouteGroup) {
        group.group("/auth", |auth| {
            let prefix = auth.prefix().to_owned();

            let flow = Arc::clone(&self);
            auth.get("/providers", move |_req: Request| {
                let res = flow.provider_list(&prefix);
                async move { res }
            });
            let flow = Arc::clone(&self);
            auth.get("/session", move |req: Request| {
                let flow = Arc::clone(&flow);
                async move { flow.session_info(req).await }
            });
            let flow = Arc::clone(&self);
            auth.get("/login/{provider}/init", move |req: Request| {
                let flow = Arc::clone(&flow);
                async move { flow.initiate(req).await }
            });
            let flow = Arc::clone(&self);
            auth.get("/login/{provider}/callback", move |req: Request| {
                let flow = Arc::clone(&flow);
                async move { flow.callback(req).await }
            });
            let flow = Arc::clone(&self);
            auth.post("/logout", move |req: Request| {
                let flow = Arc::clone(&flow);
                async move { flow.logout(req).await }
            });
        });
    }
}

fn redirect(location: &str) -> Response {
    Response::builder().status(StatusCode::FOUND).header("location", location).no_body()
}

/// Redirects to `return_to` with [`LOGIN_STATE_PARAM`] set, keeping its other
/// query parameters.
fn redirect_back(return_to: &str, success: bool) -> Response {
    let Ok(mut url) = Url::parse(return_to) else {
        return error_json(StatusCode::BAD_REQUEST, "invalid return URL");
    };
    let outcome = if success { "success" } else { "err" };

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != LOGIN_STATE_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.push((LOGIN_STATE_PARAM.to_owned(), outcome.to_owned()));
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    url.query_pairs_mut().clear().extend_pairs(pairs);

    redirect(url.as_str())
}

fn random_string(bytes: usize) -> Result<String, rand::Error> {
    let mut buf = vec![0u8; bytes];
    OsRng.try_fill_bytes(&mut buf)?;
    Ok(URL_SAFE_NO_PAD.encode(buf))
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "t" | "T" | "true" | "TRUE" | "True")
}
