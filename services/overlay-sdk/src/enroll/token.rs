//! One-time enrollment tokens
//!
//! The token is a JWT issued by the controller. Its signature is checked by
//! the controller during the exchange; locally only the claims are read.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{OverlayError, Result};

/// Enrollment method this client performs
pub const ONE_TIME_TOKEN_METHOD: &str = "ott";

/// Claims carried by an enrollment token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentClaims {
    /// Controller base URL
    pub iss: String,
    /// Identity id on the controller
    pub sub: String,
    /// One-time secret
    pub jti: String,
    /// Enrollment method
    pub em: String,
    /// Expiry, seconds since the epoch
    pub exp: i64,
}

/// Parsed token; consumed by a single enrollment exchange
#[derive(Clone)]
pub struct EnrollmentToken {
    raw: String,
    claims: EnrollmentClaims,
    algorithm: Algorithm,
}

impl std::fmt::Debug for EnrollmentToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrollmentToken")
            .field("iss", &self.claims.iss)
            .field("sub", &self.claims.sub)
            .field("em", &self.claims.em)
            .field("exp", &self.claims.exp)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl EnrollmentToken {
    pub fn parse(jwt: &str) -> Result<Self> {
        let jwt = jwt.trim();
        let header =
            decode_header(jwt).map_err(|e| OverlayError::Enrollment(format!("bad token: {}", e)))?;

        let mut validation = Validation::new(header.alg);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = decode::<EnrollmentClaims>(jwt, &DecodingKey::from_secret(&[]), &validation)
            .map_err(|e| OverlayError::Enrollment(format!("bad token claims: {}", e)))?;
        let claims = data.claims;

        if claims.em != ONE_TIME_TOKEN_METHOD {
            return Err(OverlayError::Enrollment(format!(
                "unsupported enrollment method: {}",
                claims.em
            )));
        }
        if !(claims.iss.starts_with("https://") || claims.iss.starts_with("http://")) {
            return Err(OverlayError::Enrollment(format!(
                "issuer is not a controller URL: {}",
                claims.iss
            )));
        }
        if claims.jti.is_empty() {
            return Err(OverlayError::Enrollment("token has no secret".to_string()));
        }

        Ok(Self {
            raw: jwt.to_string(),
            claims,
            algorithm: header.alg,
        })
    }

    pub fn claims(&self) -> &EnrollmentClaims {
        &self.claims
    }

    /// Controller that issued the token
    pub fn controller(&self) -> &str {
        self.claims.iss.trim_end_matches('/')
    }

    pub fn secret(&self) -> &str {
        &self.claims.jti
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.claims.exp, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Fails with `TokenExpired` once `now` has reached the expiry
    pub fn ensure_valid_at(&self, now: DateTime<Utc>) -> Result<()> {
        let expires_at = self.expires_at();
        if now >= expires_at {
            return Err(OverlayError::TokenExpired(expires_at));
        }
        Ok(())
    }
}
