//! A small session-backed API: CSRF-protected writes, guarded user routes and
//! an OAuth login against a fake identity provider.
//!
//! Run with:
//!   cargo run --example basic
//!
//! Try:
//!   curl -i -c jar http://localhost:3000/api/v1/csrf
//!   curl -i -b jar -X POST http://localhost:3000/api/v1/notes \
//!        -H "X-CSRF-TOKEN: <token from the first call>" -d 'hello'
//!   curl -i -b jar 'http://localhost:3000/api/v1/auth/login/demo/init?redirect=true'
//!   curl -i -b jar http://localhost:3000/api/v1/users

use std::sync::Arc;

use gatehouse::auth::{Authenticator, Scope};
use gatehouse::login::{ExchangeFuture, LoginConfig, LoginFlow, LoginProvider, StateStore, UserProfile};
use gatehouse::middleware::csrf::{Csrf, token as csrf_token};
use gatehouse::session::MemorySessionStore;
use gatehouse::{Pipeline, PipelineConfig, Request, Response, Server};
use http::StatusCode;

#[tokio::main]
async fn main() -> Result<(), gatehouse::Error> {
    tracing_subscriber::fmt::init();

    let config = PipelineConfig { served_by: Some("demo-1".into()), ..Default::default() };
    let login_config = LoginConfig { external_url: "http://localhost:3000".into(), ..Default::default() };

    let sessions = Arc::new(MemorySessionStore::default());
    let states = Arc::new(StateStore::new(login_config.state_ttl()));
    states.spawn_cleaner();

    let csrf = Arc::new(Csrf::with_session_store(config.csrf.clone(), sessions.clone())?);
    let auth = Arc::new(Authenticator::new(sessions.clone(), |_id: &str| true));
    let login = Arc::new(LoginFlow::new(login_config, sessions.clone(), states).provider("demo", DemoProvider));

    let app = Pipeline::new(config)?
        .layer(sessions.layer())
        .version("v1", |api| {
            api.endpoint(login);
            api.with(csrf.refresh()).get("/csrf", issued_token);
            api.with(csrf.verify()).post("/notes", create_note);
            api.with(auth.logged_in(&[Scope::User])).get("/users", list_users);
        })
        .build();

    Server::bind("0.0.0.0:3000")?.serve(app).await
}

// GET /api/v1/csrf
async fn issued_token(req: Request) -> Response {
    let token = csrf_token(&req).unwrap_or_default();
    Response::json(format!(r#"{{"token":"{token}"}}"#))
}

// POST /api/v1/notes
async fn create_note(req: Request) -> Response {
    if req.body().is_empty() {
        return Response::status(StatusCode::BAD_REQUEST);
    }
    Response::builder()
        .status(StatusCode::CREATED)
        .text(String::from_utf8_lossy(req.body()).into_owned())
}

// GET /api/v1/users
async fn list_users(_req: Request) -> Response {
    Response::json(r#"[{"Identifier":"demo@example.com"}]"#)
}

/// Logs everyone in as the same user without leaving the server.
struct DemoProvider;

impl LoginProvider for DemoProvider {
    fn name(&self) -> &str {
        "Demo login"
    }

    fn auth_code_url(&self, state: &str, _nonce: &str) -> String {
        format!("http://localhost:3000/api/v1/auth/login/demo/callback?state={state}&code=demo")
    }

    fn exchange<'a>(&'a self, _code: &'a str, _nonce: &'a str) -> ExchangeFuture<'a> {
        Box::pin(async {
            Ok(UserProfile {
                identifier: "demo@example.com".into(),
                firstname: "Demo".into(),
                email: "demo@example.com".into(),
                ..Default::default()
            })
        })
    }
}
