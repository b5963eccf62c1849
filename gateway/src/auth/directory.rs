use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Staff,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Staff => "staff",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "staff" => Ok(Self::Staff),
            "admin" => Ok(Self::Admin),
            other => anyhow::bail!("unknown role: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Local,
    Google,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Google => "google",
        }
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "google" => Ok(Self::Google),
            other => anyhow::bail!("unknown provider: {other}"),
        }
    }
}

/// A user record as owned by the User Directory.
///
/// `password_hash` is `None` only for accounts whose provider is not `Local`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
    pub username: Option<String>,
    pub password_hash: Option<String>,
    pub role: Role,
    pub provider: Provider,
    pub provider_id: Option<String>,
    pub profile_picture: Option<String>,
    /// Email ownership confirmed by the provider. Always `false` for local accounts.
    pub verified: bool,
    /// SHA-256 digest of the single active refresh token.
    pub refresh_token_hash: Option<String>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Fields required to create an identity; the directory assigns the ID.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub email: String,
    pub username: Option<String>,
    pub password_hash: Option<String>,
    pub role: Role,
    pub provider: Provider,
    pub provider_id: Option<String>,
    pub profile_picture: Option<String>,
    pub verified: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("email already registered")]
    EmailTaken,
    #[error("username already taken")]
    UsernameTaken,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<DirectoryError> for AuthError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::EmailTaken => AuthError::EmailTaken,
            DirectoryError::UsernameTaken => AuthError::UsernameTaken,
            DirectoryError::Backend(e) => AuthError::Directory(format!("{e:#}")),
        }
    }
}

/// Persistent user records.
///
/// `update` is last-write-wins on the whole record.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<Identity>, DirectoryError>;

    async fn find_by_username(&self, username: &str) -> Result<Option<Identity>, DirectoryError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, DirectoryError>;

    async fn find_by_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<Identity>, DirectoryError>;

    async fn create(&self, identity: NewIdentity) -> Result<Identity, DirectoryError>;

    async fn update(&self, identity: &Identity) -> Result<(), DirectoryError>;
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::HashMap;

    use parking_lot::RwLock;

    use super::*;

    #[derive(Default)]
    pub struct InMemoryUserDirectory {
        users: RwLock<HashMap<Uuid, Identity>>,
    }

    impl InMemoryUserDirectory {
        pub fn insert(&self, identity: Identity) {
            self.users.write().insert(identity.id, identity);
        }

        pub fn len(&self) -> usize {
            self.users.read().len()
        }

        pub fn get(&self, id: Uuid) -> Option<Identity> {
            self.users.read().get(&id).cloned()
        }
    }

    #[async_trait]
    impl UserDirectory for InMemoryUserDirectory {
        async fn find_by_email(&self, email: &str) -> Result<Option<Identity>, DirectoryError> {
            Ok(self.users.read().values().find(|u| u.email == email).cloned())
        }

        async fn find_by_username(
            &self,
            username: &str,
        ) -> Result<Option<Identity>, DirectoryError> {
            Ok(self
                .users
                .read()
                .values()
                .find(|u| u.username.as_deref() == Some(username))
                .cloned())
        }

        async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, DirectoryError> {
            Ok(self.get(id))
        }

        async fn find_by_refresh_token(
            &self,
            token_hash: &str,
        ) -> Result<Option<Identity>, DirectoryError> {
            Ok(self
                .users
                .read()
                .values()
                .find(|u| u.refresh_token_hash.as_deref() == Some(token_hash))
                .cloned())
        }

        async fn create(&self, new: NewIdentity) -> Result<Identity, DirectoryError> {
            let mut users = self.users.write();
            if users.values().any(|u| u.email == new.email) {
                return Err(DirectoryError::EmailTaken);
            }
            if new.username.is_some() && users.values().any(|u| u.username == new.username) {
                return Err(DirectoryError::UsernameTaken);
            }

            let identity = Identity {
                id: Uuid::new_v4(),
                email: new.email,
                username: new.username,
                password_hash: new.password_hash,
                role: new.role,
                provider: new.provider,
                provider_id: new.provider_id,
                profile_picture: new.profile_picture,
                verified: new.verified,
                refresh_token_hash: None,
                refresh_token_expires_at: None,
                last_login_at: None,
            };
            users.insert(identity.id, identity.clone());
            Ok(identity)
        }

        async fn update(&self, identity: &Identity) -> Result<(), DirectoryError> {
            match self.users.write().get_mut(&identity.id) {
                Some(slot) => {
                    *slot = identity.clone();
                    Ok(())
                }
                None => Err(DirectoryError::Backend(anyhow::anyhow!(
                    "user {} not found",
                    identity.id
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_str() {
        for role in [Role::User, Role::Staff, Role::Admin] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"admin\"");
        assert_eq!(serde_json::from_str::<Role>("\"staff\"").unwrap(), Role::Staff);
    }

    #[test]
    fn directory_errors_map_to_auth_errors() {
        assert!(matches!(
            AuthError::from(DirectoryError::EmailTaken),
            AuthError::EmailTaken
        ));
        assert!(matches!(
            AuthError::from(DirectoryError::UsernameTaken),
            AuthError::UsernameTaken
        ));
        assert!(matches!(
            AuthError::from(DirectoryError::Backend(anyhow::anyhow!("boom"))),
            AuthError::Directory(_)
        ));
    }
}
