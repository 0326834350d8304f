//! Upgrade Authentication
//!
//! Bearer-token middleware that resolves the caller's [`Identity`] before a
//! WebSocket upgrade is attempted. The identity travels to the upgrade
//! handler in the request extensions.

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// User role carried by an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Passenger,
    Driver,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Passenger => "PASSENGER",
            Role::Driver => "DRIVER",
            Role::Admin => "ADMIN",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verified caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Token unknown, expired or malformed
    #[error("unauthorized")]
    Unauthorized,

    /// The authenticator itself failed
    #[error("authentication backend error: {0}")]
    Internal(String),
}

/// Resolves bearer tokens into identities
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Fixed token table, loaded from the `[auth]` config section
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, Identity>) -> Self {
        Self { tokens }
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::Unauthorized)
    }
}

/// Middleware state: who authenticates, and which role a route requires
#[derive(Clone)]
pub struct AuthState {
    pub authenticator: Arc<dyn Authenticator>,
    pub required_role: Option<Role>,
}

impl AuthState {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            required_role: None,
        }
    }

    pub fn require_role(mut self, role: Role) -> Self {
        self.required_role = Some(role);
        self
    }
}

/// Token from an `Authorization: Bearer <token>` header value
fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .filter(|token| !token.is_empty())
}

/// Reject requests without a valid bearer token; insert the [`Identity`]
/// into the request extensions otherwise.
///
/// Missing header, wrong scheme, empty or unknown token: 401. Role
/// mismatch: 403. Authenticator failure: 500.
pub async fn require_identity(
    State(auth): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_owned);

    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    let identity = match auth.authenticator.authenticate(&token).await {
        Ok(identity) => identity,
        Err(AuthError::Unauthorized) => {
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "Auth middleware error parsing token");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
    };

    if let Some(required) = auth.required_role {
        if identity.role != required {
            return (
                StatusCode::FORBIDDEN,
                format!("user {} is not authorized", identity.role),
            )
                .into_response();
        }
    }

    request.extensions_mut().insert(identity);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("bearer abc"), None);
        assert_eq!(bearer_token(""), None);
    }

    #[tokio::test]
    async fn test_static_authenticator() {
        let identity = Identity {
            user_id: Uuid::new_v4(),
            role: Role::Driver,
        };
        let auth = StaticTokenAuthenticator::default().with_token("t-1", identity.clone());

        assert_eq!(auth.authenticate("t-1").await, Ok(identity));
        assert_eq!(auth.authenticate("t-2").await, Err(AuthError::Unauthorized));
    }

    #[test]
    fn test_role_wire_format() {
        assert_eq!(serde_json::to_string(&Role::Passenger).unwrap(), "\"PASSENGER\"");
        let role: Role = serde_json::from_str("\"ADMIN\"").unwrap();
        assert_eq!(role, Role::Admin);
    }
}
