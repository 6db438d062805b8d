use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use futures_util::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::StreamReader;
use tower_http::services::ServeDir;
use tracing::{info, warn};

use fe_core::connection::Identity;
use fe_core::dispatch::{dispatch, error_reply};
use fe_core::protocol::{ActionRequest, Reply, ResponseEnvelope, STATUS_BAD_REQUEST};
use fe_core::session::{BindError, BoundSession, SessionBinder, SessionKey};
use fe_platform::FileExplorer;

pub const SESSION_COOKIE: &str = "fe_session";

/// Largest accepted upload request body
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub binder: Arc<SessionBinder>,
}

pub fn router(state: AppState, static_dir: Option<PathBuf>) -> Router {
    let mut app = Router::new()
        .route("/", get(index))
        .route("/login", get(login_page).post(login))
        .route("/logout", get(logout))
        .route("/logout/*rest", get(logout))
        .route("/api/_", post(api))
        .route("/bridges/php/handler.php", post(api))
        .route(
            "/api/upload",
            post(upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/download", post(not_supported));

    if let Some(dir) = static_dir {
        info!("serving static files from {}", dir.display());
        app = app.nest_service("/static", ServeDir::new(dir));
    }

    app.with_state(state)
}

fn session_key(jar: &CookieJar) -> Option<SessionKey> {
    jar.get(SESSION_COOKIE).and_then(|c| SessionKey::parse(c.value()))
}

fn reply_response(reply: Reply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply.body)).into_response()
}

fn api_auth_error(message: impl Into<String>) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ResponseEnvelope::failure(message)),
    )
        .into_response()
}

/// Resolve the caller's session for an API path
async fn api_session(
    state: &AppState,
    jar: &CookieJar,
) -> Result<(SessionKey, BoundSession), Response> {
    let key = session_key(jar).ok_or_else(|| api_auth_error(BindError::Unauthenticated.to_string()))?;
    match state.binder.resolve(&key).await {
        Ok(bound) => Ok((key, bound)),
        Err(e) => Err(api_auth_error(e.to_string())),
    }
}

async fn api(State(state): State<AppState>, jar: CookieJar, Json(req): Json<ActionRequest>) -> Response {
    let (key, bound) = match api_session(&state, &jar).await {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    let reply = dispatch(&req, bound.explorer.as_ref()).await;
    if reply.is_connection_failure() {
        state.binder.invalidate(&key).await;
    }
    reply_response(reply)
}

async fn upload(State(state): State<AppState>, jar: CookieJar, mut multipart: Multipart) -> Response {
    let (key, bound) = match api_session(&state, &jar).await {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    let mut destination = String::from("/");
    let mut uploaded = 0usize;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => return reply_response(Reply::error(STATUS_BAD_REQUEST, e.body_text())),
        };

        if field.name() == Some("destination") {
            match field.text().await {
                Ok(text) => destination = text,
                Err(e) => return reply_response(Reply::error(STATUS_BAD_REQUEST, e.body_text())),
            }
            continue;
        }

        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        // The part is streamed straight into the backend, never buffered whole
        let body = field.map_err(|e| io::Error::new(io::ErrorKind::Other, e.body_text()));
        let mut reader = StreamReader::new(Box::pin(body));
        if let Err(e) = bound
            .explorer
            .upload_file(&destination, &mut reader, &file_name)
            .await
        {
            let reply = error_reply("upload", e);
            if reply.is_connection_failure() {
                state.binder.invalidate(&key).await;
            }
            return reply_response(reply);
        }
        uploaded += 1;
    }

    info!("uploaded {} file(s) to {}", uploaded, destination);
    reply_response(Reply::ok(ResponseEnvelope::success("")))
}

async fn not_supported() -> Response {
    reply_response(Reply::not_supported())
}

async fn index(State(state): State<AppState>, jar: CookieJar) -> Response {
    let Some(key) = session_key(&jar) else {
        return Redirect::to("/login").into_response();
    };
    match state.binder.resolve(&key).await {
        Ok(bound) => Html(format!(
            "<!doctype html><title>File manager</title><p>Signed in as {}. <a href=\"/logout\">Log out</a></p>",
            escape_html(&bound.username)
        ))
        .into_response(),
        Err(e) => login_redirect(Some(&e.to_string())).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    error: Option<String>,
}

async fn login_page(Query(query): Query<LoginQuery>) -> Html<String> {
    let error = query
        .error
        .map(|e| format!("<p class=\"error\">{}</p>", escape_html(&e)))
        .unwrap_or_default();
    Html(format!(
        "<!doctype html><title>Sign in</title>{}\
         <form method=\"post\" action=\"/login\">\
         <input name=\"username\" placeholder=\"username\">\
         <input name=\"password\" type=\"password\" placeholder=\"password\">\
         <button type=\"submit\">Sign in</button></form>",
        error
    ))
}

#[derive(Deserialize)]
struct LoginForm {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> (CookieJar, Redirect) {
    // A login always starts from a fresh key
    if let Some(old) = session_key(&jar) {
        state.binder.logout(&old).await;
    }

    let key = SessionKey::generate();
    match state
        .binder
        .login(&key, Identity::new(form.username, form.password))
        .await
    {
        Ok(()) => {
            let cookie = Cookie::build((SESSION_COOKIE, key.as_str().to_string()))
                .path("/")
                .http_only(true)
                .same_site(SameSite::Lax);
            (jar.add(cookie), Redirect::to("/"))
        }
        Err(e) => {
            warn!("login rejected: {}", e);
            (jar.remove(Cookie::build(SESSION_COOKIE).path("/")), login_redirect(Some(&e.to_string())))
        }
    }
}

async fn logout(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Redirect) {
    if let Some(key) = session_key(&jar) {
        state.binder.logout(&key).await;
    }
    (
        jar.remove(Cookie::build(SESSION_COOKIE).path("/")),
        Redirect::to("/login"),
    )
}

fn login_redirect(error: Option<&str>) -> Redirect {
    match error.and_then(|e| serde_urlencoded::to_string([("error", e)]).ok()) {
        Some(query) => Redirect::to(&format!("/login?{}", query)),
        None => Redirect::to("/login"),
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
