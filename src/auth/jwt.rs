//! JWT validation (RS256/RS384/RS512, RFC 7519 standard claims).
//!
//! Every failure mode is a distinct tag so callers (and logs) can tell an
//! expired token from a forged one. Only `Valid` admits a request.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Standard claims plus the two custom claims the gateway propagates.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Claims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// `aud` may be a string or an array per RFC 7519.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Tagged validation result.
#[derive(Debug, Clone, PartialEq)]
pub enum JwtValidation {
    Valid(Claims),
    Expired,
    NotYetValid,
    InvalidSignature,
    InvalidIssuer,
    InvalidAudience,
    InvalidFormat,
    MissingClaim(String),
}

impl JwtValidation {
    pub fn describe(&self) -> &'static str {
        match self {
            JwtValidation::Valid(_) => "valid",
            JwtValidation::Expired => "token expired",
            JwtValidation::NotYetValid => "token not yet valid",
            JwtValidation::InvalidSignature => "invalid signature",
            JwtValidation::InvalidIssuer => "invalid issuer",
            JwtValidation::InvalidAudience => "invalid audience",
            JwtValidation::InvalidFormat => "malformed token",
            JwtValidation::MissingClaim(_) => "missing required claim",
        }
    }
}

pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Build a validator from a PEM-encoded RSA public key.
    pub fn new(
        public_key_pem: &[u8],
        algorithm: &str,
        issuer: Option<String>,
        audience: Option<String>,
        clock_skew_seconds: u64,
        require_exp: bool,
    ) -> anyhow::Result<Self> {
        let alg = match algorithm {
            "RS256" => Algorithm::RS256,
            "RS384" => Algorithm::RS384,
            "RS512" => Algorithm::RS512,
            other => anyhow::bail!("unsupported JWT algorithm: {other}"),
        };
        let key = DecodingKey::from_rsa_pem(public_key_pem)?;

        let mut validation = Validation::new(alg);
        validation.leeway = clock_skew_seconds;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        if require_exp {
            validation.set_required_spec_claims(&["exp"]);
        } else {
            validation.set_required_spec_claims::<&str>(&[]);
        }
        if let Some(iss) = &issuer {
            validation.set_issuer(&[iss]);
        }
        match &audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        Ok(Self { key, validation })
    }

    pub fn validate(&self, token: &str) -> JwtValidation {
        use jsonwebtoken::errors::ErrorKind;

        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => JwtValidation::Valid(data.claims),
            Err(e) => match e.kind() {
                ErrorKind::ExpiredSignature => JwtValidation::Expired,
                ErrorKind::ImmatureSignature => JwtValidation::NotYetValid,
                ErrorKind::InvalidSignature => JwtValidation::InvalidSignature,
                ErrorKind::InvalidIssuer => JwtValidation::InvalidIssuer,
                ErrorKind::InvalidAudience => JwtValidation::InvalidAudience,
                ErrorKind::MissingRequiredClaim(claim) => {
                    JwtValidation::MissingClaim(claim.clone())
                }
                _ => JwtValidation::InvalidFormat,
            },
        }
    }
}
