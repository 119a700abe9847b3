// Identity verification for the authenticate handshake.

pub mod jwt;

use std::{future::Future, pin::Pin};

use thiserror::Error;

pub use jwt::JwtIdentityService;

/// Claims resolved from a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: String,
    pub exp: i64,
    pub iss: Option<String>,
    pub aud: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
}

pub type VerifyFuture<'a> = Pin<Box<dyn Future<Output = Result<VerifiedIdentity, AuthError>> + Send + 'a>>;

/// External identity service consumed by the handshake.
pub trait IdentityVerifier: Send + Sync {
    fn verify<'a>(&'a self, token: &'a str) -> VerifyFuture<'a>;
}
