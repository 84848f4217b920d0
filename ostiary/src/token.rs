//! Stateless inspection of bearer token claims
//!
//! Access tokens are treated as opaque strings owned by the caller. The
//! functions here peek at the claims carried in the payload segment of a
//! compact JWT to answer expiration questions. Nothing here verifies a
//! signature; the authority that issued the token has already done so.

use std::error::Error as StdError;

use base64::Engine;
use ostiary_clock::{DurationMillis, EpochMillis};
use serde::Deserialize;
use thiserror::Error;

use crate::AccessTokenRef;

/// Tokens expiring within this window are renewed proactively
pub const DEFAULT_EXPIRING_THRESHOLD: DurationMillis = DurationMillis::from_mins(5);

/// The token could not be decoded into claims with an expiration
#[derive(Debug, Error)]
#[error("malformed token")]
pub struct MalformedToken {
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

pub(crate) fn malformed_token() -> MalformedToken {
    MalformedToken { source: None }
}

pub(crate) fn malformed_token_from(
    source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
) -> MalformedToken {
    MalformedToken {
        source: Some(source.into()),
    }
}

/// The claims derived from a token's payload segment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenClaims {
    subject: Option<String>,
    issued_at: Option<EpochMillis>,
    expires_at: EpochMillis,
}

impl TokenClaims {
    /// The subject the token was issued for
    #[inline]
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// When the token was issued
    #[inline]
    pub fn issued_at(&self) -> Option<EpochMillis> {
        self.issued_at
    }

    /// When the token stops being valid
    #[inline]
    pub fn expires_at(&self) -> EpochMillis {
        self.expires_at
    }
}

#[derive(Deserialize)]
struct RawClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    iat: Option<u64>,
    #[serde(default)]
    exp: Option<u64>,
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid and not yet due for renewal
    Fresh,
    /// The token is valid, but expires within the renewal threshold
    Expiring,
    /// The token is no longer valid, or could not be read
    Expired,
}

/// Decodes the claims carried in the token's payload segment
///
/// # Errors
///
/// Returns an error if the token does not have three segments, the payload
/// is not base64url-encoded JSON, or the payload lacks an `exp` claim.
pub fn decode_claims(token: &AccessTokenRef) -> Result<TokenClaims, MalformedToken> {
    let mut segments = token.as_str().split('.');
    let payload = match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some(_header), Some(payload), Some(_signature), None) => payload,
        _ => return Err(malformed_token()),
    };

    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(malformed_token_from)?;
    let claims: RawClaims = serde_json::from_slice(&raw).map_err(malformed_token_from)?;

    let exp = claims.exp.ok_or_else(malformed_token)?;

    Ok(TokenClaims {
        subject: claims.sub,
        issued_at: claims.iat.map(EpochMillis::from_secs),
        expires_at: EpochMillis::from_secs(exp),
    })
}

/// Gets the time at which the token expires
///
/// # Errors
///
/// Returns an error if the payload cannot be decoded or carries no
/// expiration claim.
#[inline]
pub fn expires_at(token: &AccessTokenRef) -> Result<EpochMillis, MalformedToken> {
    decode_claims(token).map(|c| c.expires_at)
}

/// Whether the token has expired as of `now`
///
/// A token that cannot be decoded is considered expired.
pub fn is_expired(token: &AccessTokenRef, now: EpochMillis) -> bool {
    match expires_at(token) {
        Ok(exp) => now >= exp,
        Err(_) => true,
    }
}

/// Whether the still-valid token expires within `threshold` of `now`
///
/// Expired and undecodable tokens are not "expiring soon"; they are already
/// past saving.
pub fn is_expiring_soon(token: &AccessTokenRef, now: EpochMillis, threshold: DurationMillis) -> bool {
    match expires_at(token) {
        Ok(exp) => now < exp && exp - now <= threshold,
        Err(_) => false,
    }
}

/// How much longer the token remains valid as of `now`
pub fn time_remaining(token: &AccessTokenRef, now: EpochMillis) -> DurationMillis {
    expires_at(token)
        .map(|exp| exp - now)
        .unwrap_or(DurationMillis::ZERO)
}

/// Gets the token's lifecycle status as of `now`
pub fn token_status(token: &AccessTokenRef, now: EpochMillis, threshold: DurationMillis) -> TokenStatus {
    if is_expired(token, now) {
        TokenStatus::Expired
    } else if is_expiring_soon(token, now, threshold) {
        TokenStatus::Expiring
    } else {
        TokenStatus::Fresh
    }
}

#[cfg(test)]
pub(crate) mod test_tokens {
    use base64::Engine;

    use crate::AccessToken;

    /// Builds an unsigned compact token carrying the given JSON claims
    pub fn with_claims(claims: &str) -> AccessToken {
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        AccessToken::new(format!(
            "{}.{}.{}",
            engine.encode(br#"{"alg":"HS256","typ":"JWT"}"#),
            engine.encode(claims.as_bytes()),
            engine.encode(b"signature"),
        ))
    }

    /// Builds a token expiring at `exp_secs` seconds after the epoch
    pub fn expiring_at(exp_secs: u64) -> AccessToken {
        with_claims(&format!(
            r#"{{"sub":"user-1","iat":{},"exp":{}}}"#,
            exp_secs.saturating_sub(3600),
            exp_secs
        ))
    }
}
