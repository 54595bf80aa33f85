//! Authentication middleware for Axum.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use std::sync::Arc;

use super::session::SessionStore;

/// Name of the dashboard session cookie
pub const SESSION_COOKIE: &str = "vmdeck_session";

/// Extension that holds the authenticated caller
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user: String,
    pub token: String,
}

/// Session token carried by the request, if any
pub fn session_token(jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE).map(|c| c.value().to_string())
}

/// Cookie handed out on login
pub fn session_cookie(token: String, secure: bool) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .build()
}

/// Cookie that clears the session on logout
pub fn expired_session_cookie() -> Cookie<'static> {
    Cookie::build(SESSION_COOKIE).path("/").build()
}

pub fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"error": "Unauthorized"})),
    )
        .into_response()
}

/// Middleware that requires a live session.
///
/// Runs before any WebSocket upgrade, so an unauthenticated console request
/// is refused before the relay touches the hypervisor.
pub async fn require_auth(
    sessions: Arc<SessionStore>,
    mut request: Request,
    next: Next,
) -> Response {
    let jar = CookieJar::from_headers(request.headers());
    let Some(token) = session_token(&jar) else {
        return unauthorized();
    };

    match sessions.get(&token).await {
        Some(session) => {
            request.extensions_mut().insert(AuthenticatedUser {
                user: session.user,
                token: session.token,
            });
            next.run(request).await
        }
        None => unauthorized(),
    }
}
