//! Token validation, issuance and revocation
//!
//! Tokens are HS256 JWTs. `sub` carries the scope string, `iat` and the
//! optional `exp` are epoch seconds, and the optional `jti` (a UUID) enables
//! revocation and usage tracking.

use std::collections::HashSet;
use std::sync::Arc;

use axum::http::{header::AUTHORIZATION, HeaderMap, Uri};
use axum::extract::Query;
use chrono::{DateTime, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AuthError, KvError};
use crate::kv::KvStore;
use crate::metrics::now_millis;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<Uuid>,
}

impl Claims {
    /// Claims issued now for `subject`, with a fresh token id
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            sub: subject.into(),
            iat: Utc::now().timestamp(),
            exp: None,
            jti: Some(Uuid::new_v4()),
        }
    }

    pub fn expires_at(mut self, exp: i64) -> Self {
        self.exp = Some(exp);
        self
    }

    pub fn without_id(mut self) -> Self {
        self.jti = None;
        self
    }
}

/// The caller a validated token speaks for
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub subject: String,
    pub token_id: Option<Uuid>,
    pub issued_at: DateTime<Utc>,
}

pub fn revocation_key(token_id: &Uuid) -> String {
    format!("auth:revocation:{}", token_id)
}

pub fn issue_token(secret: &[u8], claims: &Claims) -> Result<String, jsonwebtoken::errors::Error> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret),
    )
}

/// Writes the revocation marker for `token_id`; the value is the revocation time
pub async fn revoke(kv: &dyn KvStore, token_id: &Uuid) -> Result<(), KvError> {
    kv.put(&revocation_key(token_id), &now_millis().to_string())
        .await
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Pulls the raw token from `Authorization: Bearer` or the `token` query
/// parameter. The header wins when both are present.
pub fn extract_credential(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim().to_string())
        })
        .filter(|token| !token.is_empty());

    from_header.or_else(|| {
        Query::<TokenQuery>::try_from_uri(uri)
            .ok()
            .and_then(|Query(query)| query.token)
            .filter(|token| !token.is_empty())
    })
}

#[derive(Clone)]
pub struct TokenValidator {
    decoding_key: DecodingKey,
    kv: Arc<dyn KvStore>,
}

impl TokenValidator {
    pub fn new(secret: &[u8], kv: Arc<dyn KvStore>) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            kv,
        }
    }

    fn validation(verify_signature: bool) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked by hand so it is reported before the signature.
        validation.validate_exp = false;
        validation.required_spec_claims = HashSet::from(["sub".to_string()]);
        if !verify_signature {
            validation.insecure_disable_signature_validation();
        }
        validation
    }

    /// Expiry, then signature, then revocation
    pub async fn validate(&self, raw_token: &str) -> Result<Identity, AppError> {
        let unverified = decode::<Claims>(raw_token, &self.decoding_key, &Self::validation(false))
            .map_err(|_| AuthError::Malformed)?
            .claims;

        if let Some(exp) = unverified.exp {
            if exp < Utc::now().timestamp() {
                return Err(AuthError::Expired.into());
            }
        }

        let claims = decode::<Claims>(raw_token, &self.decoding_key, &Self::validation(true))
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    AuthError::InvalidSignature
                }
                _ => AuthError::Malformed,
            })?
            .claims;

        if let Some(token_id) = claims.jti {
            if self.kv.get(&revocation_key(&token_id)).await?.is_some() {
                return Err(AuthError::Revoked.into());
            }
        }

        let issued_at = DateTime::from_timestamp(claims.iat, 0).ok_or(AuthError::Malformed)?;

        Ok(Identity {
            subject: claims.sub,
            token_id: claims.jti,
            issued_at,
        })
    }
}
