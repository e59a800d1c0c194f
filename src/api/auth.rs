//! Bearer-token identity and policy-engine authorization.
//!
//! Access is all-or-nothing: every request must carry a bearer token, and
//! every request is checked against the external policy engine. Signature
//! verification of the token is the JWKS collaborator's concern upstream;
//! the policy engine rejects tokens it does not trust, and skiff only reads
//! the identity claims.

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine as _;
use serde_json::{json, Value};
use tracing::warn;

use super::AppState;
use crate::error::{Error, Result};

/// Identity attached to a request once it passes authorization.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
}

/// Answers "may this token do that" for the API layer.
#[async_trait]
pub trait AuthClient: Send + Sync {
    async fn authorize(&self, token: &str, method: &str) -> Result<bool>;
}

/// Client for the external policy engine.
pub struct PolicyClient {
    client: reqwest::Client,
    base_url: String,
}

impl PolicyClient {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl AuthClient for PolicyClient {
    async fn authorize(&self, token: &str, method: &str) -> Result<bool> {
        let body = json!({
            "user": {"token": token},
            "request": {
                "resource": "/skiff",
                "action": {"service": "skiff", "method": method},
            }
        });
        let response = self
            .client
            .post(format!("{}/auth/request", self.base_url))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let reply: Value = response.json().await?;
        Ok(reply["auth"].as_bool().unwrap_or(false))
    }
}

/// Pull the user identity out of the token's claims: Gen3-style
/// `context.user.name` first, standard `sub` as fallback.
pub fn user_id_from_token(token: &str) -> Result<String> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::Auth("malformed bearer token".into()))?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| Error::Auth("malformed token payload".into()))?;
    let claims: Value =
        serde_json::from_slice(&bytes).map_err(|_| Error::Auth("malformed token claims".into()))?;

    claims["context"]["user"]["name"]
        .as_str()
        .or_else(|| claims["sub"].as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Auth("token carries no user identity".into()))
}

/// Middleware run on every endpoint: extract the bearer token, check it with
/// the policy engine, and stash the identity for the handlers.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start_matches("Bearer ").trim().to_string())
        .filter(|v| !v.is_empty());

    let Some(token) = token else {
        return unauthorized("no token in Authorization header");
    };

    match state.auth.authorize(&token, "access").await {
        Ok(true) => {}
        Ok(false) => return forbidden("user not authorized to access this resource"),
        Err(e) => {
            warn!("policy engine error: {e}");
            return forbidden("authorization could not be verified");
        }
    }

    match user_id_from_token(&token) {
        Ok(user_id) => {
            request.extensions_mut().insert(AuthContext { user_id });
        }
        Err(e) => return unauthorized(&e.to_string()),
    }

    next.run(request).await
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": {"code": "AUTH_ERROR", "message": message}})),
    )
        .into_response()
}

fn forbidden(message: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({"error": {"code": "AUTH_ERROR", "message": message}})),
    )
        .into_response()
}
