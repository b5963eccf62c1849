use std::collections::HashSet;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::auth::AuthError;
use crate::auth::directory::{Identity, Role};
use crate::utils::time::now_sec;

const ALGORITHM: Algorithm = Algorithm::HS256;
const REFRESH_TOKEN_BYTES: usize = 32;

/// Access token claims.
///
/// The role is captured at issuance and stays authoritative for the token's
/// lifetime; a role change applies from the next issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub email: String,
    pub role: Role,
    /// Issued-at timestamp (Unix seconds).
    pub iat: i64,
    /// Expiration timestamp (Unix seconds).
    pub exp: i64,
    /// Unique token ID, keeps tokens minted in the same second distinct.
    pub jti: Uuid,
}

impl Claims {
    /// Seconds left before the token expires, zero once expired.
    pub fn remaining_ttl(&self) -> Duration {
        Duration::from_secs(self.exp.saturating_sub(now_sec()).max(0) as u64)
    }
}

/// Mints and verifies HMAC-signed access tokens and opaque refresh tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding_key: Option<EncodingKey>,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str, access_ttl: Duration) -> Self {
        let mut validation = Validation::new(ALGORITHM);
        validation.leeway = 0;
        validation.required_spec_claims = HashSet::from(["exp".to_owned(), "iat".to_owned()]);

        Self {
            encoding_key: (!secret.is_empty()).then(|| EncodingKey::from_secret(secret.as_bytes())),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            access_ttl,
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn issue_access_token(&self, identity: &Identity) -> Result<String, AuthError> {
        let iat = now_sec();
        let claims = Claims {
            user_id: identity.id,
            email: identity.email.clone(),
            role: identity.role,
            iat,
            exp: iat + self.access_ttl.as_secs() as i64,
            jti: Uuid::new_v4(),
        };
        self.sign(&claims)
    }

    pub(crate) fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        let key = self
            .encoding_key
            .as_ref()
            .ok_or_else(|| AuthError::SigningError("signing secret is not configured".to_owned()))?;

        encode(&Header::new(ALGORITHM), claims, key)
            .map_err(|e| AuthError::SigningError(e.to_string()))
    }

    /// Verifies the signature, the algorithm and `exp > now`.
    pub fn validate_access_token(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    AuthError::InvalidSignature
                }
                _ => AuthError::Malformed,
            })?;

        // The library accepts `exp == now`.
        if claims.exp <= now_sec() {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }

    /// 256 random bits, URL-safe base64 without padding.
    pub fn issue_refresh_token(&self) -> Result<String, AuthError> {
        let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| AuthError::EntropyError(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }
}

/// Digest used wherever a token is stored, so raw values never reach a store.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
