//! Request authentication layers.
//!
//! Three surfaces, per the external interface contract:
//! - agents present the shared `X-Agent-Token`;
//! - scripted admin access presents the bearer `admin_token` (bypasses CSRF);
//! - humans arrive with a signed session cookie minted by the web tier, and
//!   must echo the session's CSRF nonce in `X-CSRF-Token` on any non-GET.

use axum::extract::{Request, State};
use axum::http::Method;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::middleware::Next;
use axum::response::Response;

use crate::auth::session::{ALL_PERMS, PERM_REVIEW_REQUESTS, PERM_VIEW_NODES, SESSION_COOKIE};
use crate::error::ApiError;

use super::AppState;

/// Authenticated principal, inserted into request extensions by
/// [`require_admin`] and consumed by the permission layers and handlers.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub username: String,
    pub role: String,
    pub perms: u32,
    /// True when authenticated by the bearer admin token.
    pub via_token: bool,
}

impl AuthContext {
    /// Operator name for audit fields; the bearer token has no username.
    pub fn operator(&self) -> &str {
        if self.username.trim().is_empty() { "admin" } else { self.username.trim() }
    }
}

/// Gate for agent endpoints. An empty configured token locks agents out.
pub async fn require_agent(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = req
        .headers()
        .get("x-agent-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .trim();
    if presented.is_empty() || presented != state.config.agent_token {
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(req).await)
}

/// Gate for the admin API: bearer token first, session cookie second.
pub async fn require_admin(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let bearer = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or("");
    if !state.config.admin_token.is_empty() && bearer == state.config.admin_token {
        req.extensions_mut().insert(AuthContext {
            username: String::new(),
            role: "admin".to_string(),
            perms: ALL_PERMS,
            via_token: true,
        });
        return Ok(next.run(req).await);
    }

    let Some(keys) = state.sessions.as_ref() else {
        return Err(ApiError::Unauthorized);
    };
    let token = cookie_value(&req, SESSION_COOKIE).ok_or(ApiError::Unauthorized)?;
    let claims = keys.verify(&token).map_err(|_| ApiError::Unauthorized)?;
    if claims.role != "admin" && claims.role != "power_user" {
        return Err(ApiError::Unauthorized);
    }

    // Cookie sessions need the CSRF nonce on anything with side effects.
    if !matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
        let presented = req
            .headers()
            .get("x-csrf-token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .trim();
        if claims.csrf.is_empty() || presented != claims.csrf {
            return Err(ApiError::CsrfRequired);
        }
    }

    req.extensions_mut().insert(AuthContext {
        username: claims.sub,
        role: claims.role,
        perms: claims.perms,
        via_token: false,
    });
    Ok(next.run(req).await)
}

/// Full-admin gate: the bearer token or an admin-role session.
pub async fn require_super_admin(req: Request, next: Next) -> Result<Response, ApiError> {
    let auth = current(&req)?;
    if auth.via_token || auth.role == "admin" {
        return Ok(next.run(req).await);
    }
    Err(ApiError::Forbidden)
}

/// Review-permission gate (admins, or power users with the review bit).
pub async fn require_review_permission(req: Request, next: Next) -> Result<Response, ApiError> {
    require_perm(req, next, PERM_REVIEW_REQUESTS).await
}

/// Nodes-permission gate (admins, or power users with the nodes bit).
pub async fn require_nodes_permission(req: Request, next: Next) -> Result<Response, ApiError> {
    require_perm(req, next, PERM_VIEW_NODES).await
}

async fn require_perm(req: Request, next: Next, perm: u32) -> Result<Response, ApiError> {
    let auth = current(&req)?;
    let allowed = auth.via_token
        || auth.role == "admin"
        || (auth.role == "power_user" && auth.perms & perm != 0);
    if allowed {
        return Ok(next.run(req).await);
    }
    Err(ApiError::Forbidden)
}

fn current(req: &Request) -> Result<&AuthContext, ApiError> {
    req.extensions().get::<AuthContext>().ok_or(ApiError::Unauthorized)
}

fn cookie_value(req: &Request, name: &str) -> Option<String> {
    let header = req.headers().get(COOKIE)?.to_str().ok()?;
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name && !value.trim().is_empty()).then(|| value.trim().to_string())
    })
}
