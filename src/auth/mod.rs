//! Token validation for the REST layer and the socket gateway.
//!
//! Tokens are HS256 JWTs signed with `AUTH_JWT_SECRET`. With `--no-auth`
//! (`AUTH_DISABLED`), authentication is off and every request runs as a
//! local development user with admin rights.

mod cookies;

use axum::{extract::FromRequestParts, http::request::Parts};
use chrono::Utc;
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::ApiError;
use crate::collab::{document_community, Participant};

pub use cookies::token_from_headers;

/// JWT claims carried by access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community: Option<String>,
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("token expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
}

/// The caller behind a request or socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub community: Option<String>,
    pub is_admin: bool,
}

impl User {
    /// Identity used when authentication is disabled.
    pub fn local_dev() -> Self {
        Self {
            id: "local-dev".to_string(),
            name: "Local Developer".to_string(),
            email: "dev@localhost".to_string(),
            community: None,
            is_admin: true,
        }
    }

    /// Whether the user may act inside `community`.
    pub fn can_access_community(&self, community: &str) -> bool {
        self.is_admin || self.community.as_deref() == Some(community)
    }

    /// Whether the user may open the document `name`. Unscoped documents are
    /// open to every authenticated user.
    pub fn can_access_document(&self, name: &str) -> bool {
        match document_community(name) {
            Some(community) => self.can_access_community(community),
            None => true,
        }
    }

    pub fn participant(&self) -> Participant {
        Participant {
            user_id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Clone, Default)]
pub struct AuthConfig {
    secret: Option<Vec<u8>>,
    admin_emails: Vec<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("enabled", &self.is_enabled())
            .field("admin_emails", &self.admin_emails)
            .finish()
    }
}

impl AuthConfig {
    /// No token checks; every caller is [`User::local_dev`].
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_secret(secret: impl Into<Vec<u8>>, admin_emails: Vec<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            admin_emails: admin_emails
                .into_iter()
                .map(|e| e.trim().to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Resolves the caller from an optional raw token.
    pub fn authenticate(&self, token: Option<&str>) -> Result<User, AuthError> {
        let Some(secret) = &self.secret else {
            return Ok(User::local_dev());
        };
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;

        let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid,
            })?;

        let claims = data.claims;
        let is_admin = self
            .admin_emails
            .iter()
            .any(|e| e.eq_ignore_ascii_case(&claims.email));

        Ok(User {
            name: if claims.name.is_empty() {
                claims.sub.clone()
            } else {
                claims.name
            },
            id: claims.sub,
            email: claims.email,
            community: claims.community,
            is_admin,
        })
    }

    /// Signs a token for `claims`. Used by tooling and tests; the server
    /// itself never issues tokens.
    pub fn issue(&self, claims: &Claims) -> Result<String, jsonwebtoken::errors::Error> {
        let secret = self.secret.as_deref().unwrap_or_default();
        encode(&Header::default(), claims, &EncodingKey::from_secret(secret))
    }
}

impl Claims {
    /// Claims valid for `ttl_secs` from now.
    pub fn new(sub: &str, email: &str, community: Option<&str>, ttl_secs: i64) -> Self {
        Self {
            sub: sub.to_string(),
            name: sub.to_string(),
            email: email.to_string(),
            community: community.map(str::to_string),
            exp: Utc::now().timestamp() + ttl_secs,
        }
    }
}

/// Reads the [`User`] the auth middleware stored in the request extensions.
impl<S> FromRequestParts<S> for User
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<User>()
            .cloned()
            .ok_or_else(|| ApiError::Unauthorized("Authentication required".to_string()))
    }
}
