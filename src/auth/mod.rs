// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Authentication — bearer tokens checked against configured users
//!
//! Only the SHA-256 of each token is kept in the config. Requests send the
//! token in `Authorization: Bearer <token>`; its digest is compared in
//! constant time against every user. With no users configured, auth is
//! off and every caller is "anonymous".

use actix_web::HttpRequest;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::UserConfig;

/// Caller name used when auth is disabled
pub const ANONYMOUS: &str = "anonymous";

/// Hex SHA-256 of a token, as stored in `token_sha256`
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Constant-time string comparison
fn constant_time_eq(provided: &str, expected: &str) -> bool {
    if provided.is_empty() || expected.is_empty() {
        return false;
    }
    provided.len() == expected.len()
        && provided.as_bytes().iter().zip(expected.as_bytes().iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

/// Extract the bearer token from a request
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    let value = req.headers().get("Authorization")?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() { None } else { Some(token.to_string()) }
}

/// Why a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    Missing,
    Invalid,
}

impl AuthFailure {
    pub fn message(&self) -> &'static str {
        match self {
            AuthFailure::Missing => "Not authenticated",
            AuthFailure::Invalid => "Invalid token",
        }
    }
}

pub struct TokenAuth {
    users: Vec<UserConfig>,
}

impl TokenAuth {
    pub fn new(users: Vec<UserConfig>) -> Self {
        let users: Vec<UserConfig> = users.into_iter()
            .map(|mut u| {
                u.token_sha256 = u.token_sha256.trim().to_lowercase();
                u
            })
            .collect();
        if users.is_empty() {
            warn!("No users configured — API authentication is DISABLED");
        }
        Self { users }
    }

    pub fn is_enabled(&self) -> bool {
        !self.users.is_empty()
    }

    /// Name of the user owning `token`
    pub fn user_for_token(&self, token: &str) -> Option<&str> {
        let digest = hash_token(token);
        // Check every user so timing does not reveal which one matched
        let mut found = None;
        for user in &self.users {
            if constant_time_eq(&digest, &user.token_sha256) && found.is_none() {
                found = Some(user.name.as_str());
            }
        }
        found
    }

    /// Authenticate a request; returns the caller's name
    pub fn authenticate(&self, req: &HttpRequest) -> Result<String, AuthFailure> {
        if !self.is_enabled() {
            return Ok(ANONYMOUS.to_string());
        }
        let token = bearer_token(req).ok_or(AuthFailure::Missing)?;
        match self.user_for_token(&token) {
            Some(name) => Ok(name.to_string()),
            None => {
                warn!("Rejected API token from {}", req.peer_addr().map(|a| a.ip().to_string()).unwrap_or_else(|| "unknown".into()));
                Err(AuthFailure::Invalid)
            }
        }
    }
}
