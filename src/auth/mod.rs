//! Request authentication: static bearer token or JWT, mutually exclusive.
//!
//! The WebSocket handshake and the video endpoints accept a cookie fallback
//! (`owl_session=<token>`) because browser `<img>`/`WebSocket` clients
//! cannot set an `Authorization` header.

pub mod jwt;

use crate::config::{AuthMode, GatewayConfig};
use crate::error::ApiError;
use anyhow::{Context, Result};

pub use jwt::{JwtValidation, JwtValidator};

/// Compare a presented token against the configured one in constant time.
///
/// Folds the XOR of every byte pair into a single accumulator and checks
/// it once at the end, so a mismatch in the first byte costs the same as
/// a mismatch in the last and response timing reveals nothing about how
/// much of the token was right.
pub fn tokens_equal(presented: &str, expected: &str) -> bool {
    if presented.len() != expected.len() {
        return false;
    }
    let diff = presented
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    diff == 0
}

/// Identity attached to an admitted request. Bearer-token auth yields an
/// empty identity; JWT auth propagates the standard claims handlers care
/// about.
#[derive(Debug, Clone, Default)]
pub struct AuthIdentity {
    pub subject: Option<String>,
    pub scope: Option<String>,
    pub client_id: Option<String>,
}

/// The gateway's authenticator. Built once at startup from config; shared
/// read-only afterwards.
pub struct Authenticator {
    mode: AuthMode,
    token: String,
    jwt: Option<JwtValidator>,
}

impl Authenticator {
    pub fn from_config(cfg: &GatewayConfig) -> Result<Self> {
        let jwt = match cfg.auth_mode {
            AuthMode::Jwt => {
                let path = cfg
                    .jwt
                    .public_key
                    .as_ref()
                    .context("auth_mode = jwt requires jwt.public_key")?;
                let pem = std::fs::read(path)
                    .with_context(|| format!("reading jwt public key {}", path.display()))?;
                Some(JwtValidator::new(
                    &pem,
                    &cfg.jwt.algorithm,
                    cfg.jwt.issuer.clone(),
                    cfg.jwt.audience.clone(),
                    cfg.jwt.clock_skew_seconds,
                    cfg.jwt.require_exp,
                )?)
            }
            AuthMode::Token => None,
        };
        Ok(Self {
            mode: cfg.auth_mode,
            token: cfg.auth_token.clone(),
            jwt,
        })
    }

    /// Build a token-mode authenticator directly (tests, embedded use).
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Token,
            token: token.into(),
            jwt: None,
        }
    }

    pub fn from_jwt(validator: JwtValidator) -> Self {
        Self {
            mode: AuthMode::Jwt,
            token: String::new(),
            jwt: Some(validator),
        }
    }

    /// Auth is disabled when token mode is configured with an empty token.
    pub fn is_enabled(&self) -> bool {
        match self.mode {
            AuthMode::Token => !self.token.is_empty(),
            AuthMode::Jwt => true,
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Validate a request given its `Authorization` header and, when the
    /// header is absent, its `Cookie` header.
    pub fn validate(
        &self,
        authorization: Option<&str>,
        cookie: Option<&str>,
    ) -> Result<AuthIdentity, ApiError> {
        if !self.is_enabled() {
            return Ok(AuthIdentity::default());
        }

        let credential = match authorization {
            Some(h) => h
                .strip_prefix("Bearer ")
                .ok_or_else(|| ApiError::Unauthorized("Invalid Authorization header".into()))?
                .to_string(),
            None => cookie
                .and_then(session_cookie)
                .ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".into()))?,
        };

        match self.mode {
            AuthMode::Token => {
                if tokens_equal(&credential, &self.token) {
                    Ok(AuthIdentity::default())
                } else {
                    Err(ApiError::Unauthorized("Invalid bearer token".into()))
                }
            }
            AuthMode::Jwt => {
                let validator = self.jwt.as_ref().ok_or(ApiError::Internal)?;
                match validator.validate(&credential) {
                    JwtValidation::Valid(claims) => Ok(AuthIdentity {
                        subject: claims.sub,
                        scope: claims.scope,
                        client_id: claims.client_id,
                    }),
                    other => Err(ApiError::Unauthorized(format!(
                        "JWT validation failed: {}",
                        other.describe()
                    ))),
                }
            }
        }
    }
}

/// Extract the `owl_session` value from a `Cookie` header.
fn session_cookie(header: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "owl_session").then(|| value.to_string())
    })
}
