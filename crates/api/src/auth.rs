//! Caller identity
//!
//! Callers are authenticated upstream by the gateway, which forwards the
//! verified identity in `x-user-id` / `x-user-role`. Those headers are only
//! trusted when the request also carries the shared `x-gateway-token`.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use tierledger_shared::UserId;

use crate::error::ApiError;

pub const GATEWAY_TOKEN_HEADER: &str = "x-gateway-token";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(role) if role.eq_ignore_ascii_case("admin") => Role::Admin,
            _ => Role::User,
        }
    }
}

/// Authenticated caller, inserted as a request extension
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: UserId,
    pub role: Role,
}

impl AuthUser {
    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.role == Role::Admin {
            Ok(())
        } else {
            tracing::warn!(user_id = %self.user_id, "Non-admin caller on admin route");
            Err(ApiError::Forbidden)
        }
    }
}

/// State for the auth middleware
#[derive(Clone)]
pub struct AuthState {
    gateway_token: Arc<str>,
}

impl AuthState {
    pub fn new(gateway_token: &str) -> Self {
        Self {
            gateway_token: Arc::from(gateway_token),
        }
    }

    fn token_matches(&self, presented: &str) -> bool {
        bool::from(presented.as_bytes().ct_eq(self.gateway_token.as_bytes()))
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Resolve the caller from forwarded headers
pub fn authenticate(auth: &AuthState, headers: &HeaderMap) -> Result<AuthUser, ApiError> {
    let token = header(headers, GATEWAY_TOKEN_HEADER).ok_or(ApiError::Unauthorized)?;
    if !auth.token_matches(token) {
        tracing::warn!("Request with invalid gateway token");
        return Err(ApiError::Unauthorized);
    }

    let user_id = header(headers, USER_ID_HEADER)
        .ok_or(ApiError::Unauthorized)?
        .parse::<UserId>()
        .map_err(|_| ApiError::Unauthorized)?;

    Ok(AuthUser {
        user_id,
        role: Role::from_header(header(headers, USER_ROLE_HEADER)),
    })
}

/// Middleware rejecting requests without a trusted caller identity
pub async fn require_auth(
    State(auth): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user = authenticate(&auth, request.headers())?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}
