use serde::{Deserialize, Serialize};

use crate::api::models::user::UserView;
use crate::auth::{Session, TokenPair};

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct GoogleLoginQuery {
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GoogleLoginResponse {
    pub auth_url: String,
    pub state: String,
}

/// Query parameters received on OAuth callback.
///
/// Everything is optional because the provider reports a denied consent
/// through `error` alone.
#[derive(Debug, Deserialize)]
pub struct OAuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub redirect_uri: Option<String>,
    pub error: Option<String>,
}

/// Returned after register, login and OAuth login.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub user: UserView,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            user: UserView::from(&session.identity),
            tokens: session.tokens,
        }
    }
}
