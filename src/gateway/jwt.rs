//! JWT issuing and validation.
//!
//! Tokens are HMAC-SHA-256 signed. The subject equals the user id and the
//! issuer is a fixed constant. The signing secret is loaded once at
//! process start: in production its absence is fatal, in development a
//! random secret is generated with a warning that sessions will not
//! survive a restart.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BaliseError, Result};

/// Fixed token issuer.
pub const ISSUER: &str = "balise-registry";

/// Default token lifetime when the configured value is 0.
const DEFAULT_LIFETIME_MINUTES: i64 = 60;

static PROCESS_SECRET: std::sync::OnceLock<Vec<u8>> = std::sync::OnceLock::new();

/// Resolve the process-wide signing secret exactly once. Concurrent
/// callers observe the same value; later calls ignore their arguments.
///
/// # Errors
///
/// Propagates [`JwtSigner::resolve_secret`] failures on first call.
pub fn process_secret(configured: Option<&str>, dev_mode: bool) -> Result<&'static [u8]> {
    if let Some(secret) = PROCESS_SECRET.get() {
        return Ok(secret.as_slice());
    }
    let resolved = JwtSigner::resolve_secret(configured, dev_mode)?;
    Ok(PROCESS_SECRET.get_or_init(|| resolved).as_slice())
}

/// Registered and private claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub user_id: Uuid,
    pub email: String,
}

/// Issues and validates session tokens with a process-wide secret.
pub struct JwtSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    lifetime_minutes: i64,
}

impl JwtSigner {
    /// Build a signer. A `lifetime_minutes` of 0 selects the 1 hour
    /// default.
    #[must_use]
    pub fn new(secret: &[u8], lifetime_minutes: i64) -> Self {
        let lifetime_minutes = if lifetime_minutes <= 0 {
            DEFAULT_LIFETIME_MINUTES
        } else {
            lifetime_minutes
        };
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            lifetime_minutes,
        }
    }

    /// Resolve the signing secret from configuration.
    ///
    /// # Errors
    ///
    /// In production mode a missing secret is a fatal configuration
    /// error. In development mode a 32-byte random secret is generated
    /// instead, with a warning.
    pub fn resolve_secret(configured: Option<&str>, dev_mode: bool) -> Result<Vec<u8>> {
        match configured {
            Some(secret) if !secret.trim().is_empty() => Ok(secret.as_bytes().to_vec()),
            _ if dev_mode => {
                tracing::warn!(
                    "No JWT secret configured; generated a random development secret, sessions will not persist across restarts"
                );
                use rand::RngCore;
                let mut secret = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                Ok(secret)
            }
            _ => Err(BaliseError::ConfigMissing {
                key: "auth.jwt_secret".to_string(),
            }),
        }
    }

    /// Issue a token for a user.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if encoding fails.
    pub fn issue(&self, user_id: Uuid, email: &str) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            iss: ISSUER.to_string(),
            iat: now.timestamp(),
            exp: (now + chrono::Duration::minutes(self.lifetime_minutes)).timestamp(),
            user_id,
            email: email.to_string(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| BaliseError::internal(format!("JWT encode: {e}")))
    }

    /// Validate a token and return its claims.
    ///
    /// # Errors
    ///
    /// `TokenExpired` for expired tokens, `TokenInvalid` for everything
    /// else that fails validation.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        match decode::<Claims>(token, &self.decoding, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(BaliseError::TokenExpired),
                _ => Err(BaliseError::token_invalid(e.to_string())),
            },
        }
    }
}
