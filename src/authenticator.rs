//! Credential checking.
//!
//! The concrete authenticator is chosen once at start-up; request handling
//! only sees the `Authenticator` capability.

use crate::ticket::types::ExtraAttributes;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub service: Option<String>,
    pub client_hostname: Option<String>,
}

/// A user record as seen by the credential checker.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub username: String,
    pub attributes: ExtraAttributes,
}

#[derive(Debug, Error)]
pub enum AuthenticatorError {
    #[error("{0}")]
    Backend(String),

    #[error("Failed to load user table from {path}: {reason}")]
    Load { path: String, reason: String },
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn find_user(&self, credentials: &Credentials)
        -> Result<Option<User>, AuthenticatorError>;

    async fn validate(&self, credentials: &Credentials) -> Result<bool, AuthenticatorError>;

    /// Names of user attributes copied into the session on login.
    fn extra_attributes_to_extract(&self) -> &[String];
}

/// Check credentials and, when valid, collect the configured attributes.
///
/// Returns `None` for incorrect credentials. Attributes the user lacks are
/// recorded as `null`.
pub async fn authenticate(
    authenticator: &dyn Authenticator,
    credentials: &Credentials,
) -> Result<Option<ExtraAttributes>, AuthenticatorError> {
    let user = authenticator.find_user(credentials).await?;
    if !authenticator.validate(credentials).await? {
        return Ok(None);
    }

    let mut extra = ExtraAttributes::new();
    for name in authenticator.extra_attributes_to_extract() {
        let value = user
            .as_ref()
            .and_then(|u| u.attributes.get(name))
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        debug!("Extracting attribute {} for {}", name, credentials.username);
        extra.insert(name.clone(), value);
    }
    Ok(Some(extra))
}

/// Entry of the static user table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticUser {
    pub username: String,
    /// Hex SHA-256 of the password.
    pub password_sha256: String,
    #[serde(default)]
    pub attributes: ExtraAttributes,
}

impl StaticUser {
    pub fn with_password(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password_sha256: hex::encode(Sha256::digest(password.as_bytes())),
            attributes: ExtraAttributes::new(),
        }
    }

    pub fn attribute(mut self, name: &str, value: serde_json::Value) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }
}

/// Authenticator backed by an in-memory user table.
pub struct StaticAuthenticator {
    users: HashMap<String, StaticUser>,
    extra_attributes: Vec<String>,
}

impl StaticAuthenticator {
    pub fn new(users: Vec<StaticUser>, extra_attributes: Vec<String>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|u| (u.username.clone(), u))
                .collect(),
            extra_attributes,
        }
    }

    /// Load a JSON array of `StaticUser` entries.
    pub fn from_file(path: &str, extra_attributes: Vec<String>) -> Result<Self, AuthenticatorError> {
        let load_error = |reason: String| AuthenticatorError::Load {
            path: path.to_string(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        let users: Vec<StaticUser> =
            serde_json::from_str(&content).map_err(|e| load_error(e.to_string()))?;
        info!("Loaded {} users from {}", users.len(), path);
        Ok(Self::new(users, extra_attributes))
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn find_user(
        &self,
        credentials: &Credentials,
    ) -> Result<Option<User>, AuthenticatorError> {
        Ok(self.users.get(&credentials.username).map(|u| User {
            username: u.username.clone(),
            attributes: u.attributes.clone(),
        }))
    }

    async fn validate(&self, credentials: &Credentials) -> Result<bool, AuthenticatorError> {
        let Some(user) = self.users.get(&credentials.username) else {
            return Ok(false);
        };
        let presented = hex::encode(Sha256::digest(credentials.password.as_bytes()));
        Ok(constant_time_eq(
            presented.as_bytes(),
            user.password_sha256.to_ascii_lowercase().as_bytes(),
        ))
    }

    fn extra_attributes_to_extract(&self) -> &[String] {
        &self.extra_attributes
    }
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
