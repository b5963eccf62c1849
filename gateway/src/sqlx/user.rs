use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::auth::{DirectoryError, Identity, NewIdentity, UserDirectory};
use crate::sqlx::SqlxClient;

const IDENTITY_COLUMNS: &str = "id, email, username, password_hash, role, provider, provider_id, \
     profile_picture, is_verified, refresh_token_hash, refresh_token_expires_at, last_login_at";

const USERNAME_UNIQUE_INDEX: &str = "users_username_key";

#[derive(sqlx::FromRow)]
struct IdentityRow {
    id: Uuid,
    email: String,
    username: Option<String>,
    password_hash: Option<String>,
    role: String,
    provider: String,
    provider_id: Option<String>,
    profile_picture: Option<String>,
    is_verified: bool,
    refresh_token_hash: Option<String>,
    refresh_token_expires_at: Option<DateTime<Utc>>,
    last_login_at: Option<DateTime<Utc>>,
}

impl TryFrom<IdentityRow> for Identity {
    type Error = anyhow::Error;

    fn try_from(row: IdentityRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            role: row
                .role
                .parse()
                .with_context(|| format!("user {} has an unknown role", row.id))?,
            provider: row
                .provider
                .parse()
                .with_context(|| format!("user {} has an unknown provider", row.id))?,
            email: row.email,
            username: row.username,
            password_hash: row.password_hash,
            provider_id: row.provider_id,
            profile_picture: row.profile_picture,
            verified: row.is_verified,
            refresh_token_hash: row.refresh_token_hash,
            refresh_token_expires_at: row.refresh_token_expires_at,
            last_login_at: row.last_login_at,
        })
    }
}

fn select_by(column: &str) -> String {
    format!("SELECT {IDENTITY_COLUMNS} FROM users WHERE {column} = $1")
}

fn into_identity(row: Option<IdentityRow>) -> Result<Option<Identity>, DirectoryError> {
    Ok(row.map(Identity::try_from).transpose()?)
}

fn unique_violation(constraint: Option<&str>) -> DirectoryError {
    match constraint {
        Some(USERNAME_UNIQUE_INDEX) => DirectoryError::UsernameTaken,
        _ => DirectoryError::EmailTaken,
    }
}

#[async_trait]
impl UserDirectory for SqlxClient {
    async fn find_by_email(&self, email: &str) -> Result<Option<Identity>, DirectoryError> {
        let row = sqlx::query_as::<_, IdentityRow>(&select_by("email"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context("failed to find user by email")?;
        into_identity(row)
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Identity>, DirectoryError> {
        let row = sqlx::query_as::<_, IdentityRow>(&select_by("username"))
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .context("failed to find user by username")?;
        into_identity(row)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, DirectoryError> {
        let row = sqlx::query_as::<_, IdentityRow>(&select_by("id"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to find user by id")?;
        into_identity(row)
    }

    async fn find_by_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<Identity>, DirectoryError> {
        let row = sqlx::query_as::<_, IdentityRow>(&select_by("refresh_token_hash"))
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .context("failed to find user by refresh token")?;
        into_identity(row)
    }

    async fn create(&self, identity: NewIdentity) -> Result<Identity, DirectoryError> {
        let query = format!(
            "INSERT INTO users \
                 (id, email, username, password_hash, role, provider, provider_id, \
                  profile_picture, is_verified) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {IDENTITY_COLUMNS}"
        );

        let row = sqlx::query_as::<_, IdentityRow>(&query)
            .bind(Uuid::new_v4())
            .bind(&identity.email)
            .bind(&identity.username)
            .bind(&identity.password_hash)
            .bind(identity.role.as_str())
            .bind(identity.provider.as_str())
            .bind(&identity.provider_id)
            .bind(&identity.profile_picture)
            .bind(identity.verified)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e.as_database_error() {
                Some(db) if db.is_unique_violation() => unique_violation(db.constraint()),
                _ => DirectoryError::Backend(anyhow::Error::new(e).context("failed to insert user")),
            })?;

        Ok(Identity::try_from(row)?)
    }

    async fn update(&self, identity: &Identity) -> Result<(), DirectoryError> {
        let result = sqlx::query(
            "UPDATE users \
             SET email = $2, \
                 password_hash = $3, \
                 role = $4, \
                 provider = $5, \
                 provider_id = $6, \
                 refresh_token_hash = $7, \
                 refresh_token_expires_at = $8, \
                 last_login_at = $9, \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(identity.id)
        .bind(&identity.email)
        .bind(&identity.username)
        .bind(&identity.password_hash)
        .bind(identity.role.as_str())
        .bind(identity.provider.as_str())
        .bind(&identity.provider_id)
        .bind(&identity.profile_picture)
        .bind(identity.verified)
        .bind(&identity.refresh_token_hash)
        .bind(identity.refresh_token_expires_at)
        .bind(identity.last_login_at)
        .execute(&self.pool)
        .await
        .context("failed to update user")?;

        if result.rows_affected() == 0 {
            return Err(anyhow::anyhow!("user {} not found", identity.id).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Provider, Role};

    fn row(role: &str, provider: &str) -> IdentityRow {
        IdentityRow {
            id: Uuid::new_v4(),
            email: "ana@example.com".to_owned(),
            username: Some("ana".to_owned()),
            password_hash: None,
            role: role.to_owned(),
            provider: provider.to_owned(),
            provider_id: Some("g-1".to_owned()),
            profile_picture: Some("https://images.example.com/ana.png".to_owned()),
            is_verified: true,
            refresh_token_hash: None,
            refresh_token_expires_at: None,
            last_login_at: None,
        }
    }

    #[test]
    fn row_converts_to_identity() {
        let identity = Identity::try_from(row("staff", "google")).unwrap();
        assert_eq!(identity.role, Role::Staff);
        assert_eq!(identity.provider, Provider::Google);
        assert_eq!(identity.provider_id.as_deref(), Some("g-1"));
        assert_eq!(identity.username.as_deref(), Some("ana"));
        assert!(identity.verified);
        assert!(identity.profile_picture.is_some());
    }

    #[test]
    fn unique_violations_name_the_taken_field() {
        assert!(matches!(
            unique_violation(Some(USERNAME_UNIQUE_INDEX)),
            DirectoryError::UsernameTaken
        ));
        assert!(matches!(
            unique_violation(Some("users_email_key")),
            DirectoryError::EmailTaken
        ));
        assert!(matches!(unique_violation(None), DirectoryError::EmailTaken));
    }

    #[test]
    fn unknown_enum_values_are_rejected() {
        assert!(Identity::try_from(row("root", "local")).is_err());
        assert!(Identity::try_from(row("user", "github")).is_err());
    }
}
