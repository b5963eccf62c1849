use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Stable, machine-readable identifiers returned in error bodies.
///
/// Clients match on `code` from `{"code": "TOKEN_EXPIRED", "message": "..."}`.
pub mod error_code {
    pub const INVALID_CREDENTIALS: &str = "INVALID_CREDENTIALS";
    pub const INVALID_SIGNATURE: &str = "INVALID_SIGNATURE";
    pub const TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";
    pub const MALFORMED_TOKEN: &str = "MALFORMED_TOKEN";
    pub const TOKEN_REVOKED: &str = "TOKEN_REVOKED";
    pub const MISSING_TOKEN: &str = "MISSING_TOKEN";
    pub const UNKNOWN_REFRESH_TOKEN: &str = "UNKNOWN_REFRESH_TOKEN";
    pub const INVALID_STATE: &str = "INVALID_STATE";
    pub const PROVIDER_CONFLICT: &str = "PROVIDER_CONFLICT";
    pub const EMAIL_TAKEN: &str = "EMAIL_TAKEN";
    pub const USERNAME_TAKEN: &str = "USERNAME_TAKEN";
    pub const ORIGIN_NOT_ALLOWED: &str = "ORIGIN_NOT_ALLOWED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const STORE_UNAVAILABLE: &str = "STORE_UNAVAILABLE";
    pub const ENTROPY: &str = "ENTROPY_ERROR";
    pub const HASHING: &str = "HASHING_ERROR";
    pub const SIGNING: &str = "SIGNING_ERROR";
    pub const OAUTH_PROVIDER: &str = "OAUTH_PROVIDER_ERROR";
    pub const DIRECTORY: &str = "DIRECTORY_ERROR";
    pub const CANCELED: &str = "CANCELED";
    pub const DEADLINE_EXCEEDED: &str = "DEADLINE_EXCEEDED";
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown email, OAuth-only account or wrong password. Deliberately indistinguishable.
    #[error("invalid email or password")]
    InvalidCredentials,

    /// Signature mismatch or unexpected signing algorithm.
    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token has expired")]
    Expired,

    #[error("token is malformed")]
    Malformed,

    #[error("token has been revoked")]
    Revoked,

    #[error("missing bearer token")]
    MissingToken,

    #[error("refresh token is unknown or expired")]
    UnknownRefreshToken,

    #[error("invalid or expired state parameter")]
    InvalidState,

    /// An identity with this email is already bound to another provider.
    #[error("email is registered with a different sign-in method")]
    ProviderConflict,

    #[error("email already registered")]
    EmailTaken,

    #[error("username already taken")]
    UsernameTaken,

    /// Neither `Origin` nor `Referer` matches the configured allow-list.
    #[error("invalid origin")]
    OriginNotAllowed,

    #[error("insufficient permissions")]
    Forbidden,

    #[error("{0}")]
    BadRequest(String),

    #[error("token store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("failed to gather randomness: {0}")]
    EntropyError(String),

    #[error("failed to hash password: {0}")]
    HashingError(String),

    #[error("failed to sign token: {0}")]
    SigningError(String),

    #[error("oauth provider error: {0}")]
    OAuthProvider(String),

    #[error("user directory error: {0}")]
    Directory(String),

    #[error("operation canceled")]
    Canceled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl AuthError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => error_code::INVALID_CREDENTIALS,
            Self::InvalidSignature => error_code::INVALID_SIGNATURE,
            Self::Expired => error_code::TOKEN_EXPIRED,
            Self::Malformed => error_code::MALFORMED_TOKEN,
            Self::Revoked => error_code::TOKEN_REVOKED,
            Self::MissingToken => error_code::MISSING_TOKEN,
            Self::UnknownRefreshToken => error_code::UNKNOWN_REFRESH_TOKEN,
            Self::InvalidState => error_code::INVALID_STATE,
            Self::ProviderConflict => error_code::PROVIDER_CONFLICT,
            Self::EmailTaken => error_code::EMAIL_TAKEN,
            Self::UsernameTaken => error_code::USERNAME_TAKEN,
            Self::OriginNotAllowed => error_code::ORIGIN_NOT_ALLOWED,
            Self::Forbidden => error_code::FORBIDDEN,
            Self::BadRequest(_) => error_code::BAD_REQUEST,
            Self::StoreUnavailable(_) => error_code::STORE_UNAVAILABLE,
            Self::EntropyError(_) => error_code::ENTROPY,
            Self::HashingError(_) => error_code::HASHING,
            Self::SigningError(_) => error_code::SIGNING,
            Self::OAuthProvider(_) => error_code::OAUTH_PROVIDER,
            Self::Directory(_) => error_code::DIRECTORY,
            Self::Canceled => error_code::CANCELED,
            Self::DeadlineExceeded => error_code::DEADLINE_EXCEEDED,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials
            | Self::InvalidSignature
            | Self::Expired
            | Self::Revoked
            | Self::MissingToken
            | Self::UnknownRefreshToken => StatusCode::UNAUTHORIZED,
            Self::Malformed | Self::InvalidState | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ProviderConflict | Self::EmailTaken | Self::UsernameTaken => {
                StatusCode::CONFLICT
            }
            Self::Forbidden | Self::OriginNotAllowed => StatusCode::FORBIDDEN,
            Self::StoreUnavailable(_)
            | Self::EntropyError(_)
            | Self::HashingError(_)
            | Self::SigningError(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::OAuthProvider(_) => StatusCode::BAD_GATEWAY,
            Self::Directory(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Canceled | Self::DeadlineExceeded => StatusCode::REQUEST_TIMEOUT,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.error_code(), "{self}");
        }

        // Infrastructure details stay in the logs.
        let message = match &self {
            Self::StoreUnavailable(_)
            | Self::EntropyError(_)
            | Self::HashingError(_)
            | Self::SigningError(_)
            | Self::Directory(_) => "service temporarily unavailable".to_owned(),
            other => other.to_string(),
        };

        let body = serde_json::json!({
            "code": self.error_code(),
            "message": message,
        });
        (status, Json(body)).into_response()
    }
}
