use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::{Claims, Identity, Provider, Role};

/// Public view of an identity. Credentials never leave the service.
#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub role: Role,
    pub provider: Provider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
    pub is_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<DateTime<Utc>>,
}

impl From<&Identity> for UserView {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id,
            email: identity.email.clone(),
            username: identity.username.clone(),
            role: identity.role,
            provider: identity.provider,
            profile_picture: identity.profile_picture.clone(),
            is_verified: identity.verified,
            last_login_at: identity.last_login_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub claims: Claims,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserView>,
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub pong: bool,
    pub role: Role,
}
