use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{TimeDelta, Utc};
use serde::Serialize;
use url::Url;
use uuid::Uuid;

use crate::auth::directory::{Identity, NewIdentity, Provider, Role, UserDirectory};
use crate::auth::oauth::{OAuthProfile, OAuthProvider};
use crate::auth::password::CredentialVerifier;
use crate::auth::token::{Claims, TokenIssuer, token_digest};
use crate::auth::{AuthError, CallContext, CsrfStateStore, RevocationRegistry};

const MIN_PASSWORD_LEN: usize = 8;
const MIN_USERNAME_LEN: usize = 3;
const MAX_USERNAME_LEN: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
}

/// An identity together with freshly issued tokens.
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: Identity,
    pub tokens: TokenPair,
}

/// Login, OAuth login, refresh, logout and the authenticated-request gate.
pub struct SessionService {
    directory: Arc<dyn UserDirectory>,
    oauth: Arc<dyn OAuthProvider>,
    verifier: CredentialVerifier,
    tokens: TokenIssuer,
    revocation: RevocationRegistry,
    csrf: CsrfStateStore,
    refresh_ttl: TimeDelta,
    default_redirect_uri: String,
}

pub struct SessionServiceParts {
    pub directory: Arc<dyn UserDirectory>,
    pub oauth: Arc<dyn OAuthProvider>,
    pub verifier: CredentialVerifier,
    pub tokens: TokenIssuer,
    pub revocation: RevocationRegistry,
    pub csrf: CsrfStateStore,
    pub refresh_ttl: Duration,
    pub default_redirect_uri: String,
}

impl SessionService {
    pub fn new(parts: SessionServiceParts) -> anyhow::Result<Self> {
        let SessionServiceParts {
            directory,
            oauth,
            verifier,
            tokens,
            revocation,
            csrf,
            refresh_ttl,
            default_redirect_uri,
        } = parts;

        Ok(Self {
            directory,
            oauth,
            verifier,
            tokens,
            revocation,
            csrf,
            refresh_ttl: TimeDelta::from_std(refresh_ttl).context("refresh token ttl is too large")?,
            default_redirect_uri,
        })
    }

    pub async fn shutdown(&self) {
        self.csrf.shutdown().await;
    }

    // ── Local accounts ─────────────────────────────────────────────────────────

    pub async fn register(
        &self,
        ctx: &CallContext,
        email: &str,
        password: &str,
        username: Option<&str>,
    ) -> Result<Session, AuthError> {
        let email = normalize_email(email);
        if !valid_email(&email) {
            return Err(AuthError::BadRequest("invalid email address".to_owned()));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::BadRequest(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        let username = username.map(str::trim).filter(|u| !u.is_empty());
        if let Some(username) = username {
            validate_username(username)?;
        }

        if self.find_by_email(ctx, &email).await?.is_some() {
            return Err(AuthError::EmailTaken);
        }
        if let Some(username) = username {
            let taken = ctx
                .run(async {
                    self.directory
                        .find_by_username(username)
                        .await
                        .map_err(AuthError::from)
                })
                .await?;
            if taken.is_some() {
                return Err(AuthError::UsernameTaken);
            }
        }

        let new_identity = NewIdentity {
            email,
            username: username.map(str::to_owned),
            password_hash: Some(self.hash_password(password).await?),
            role: Role::User,
            provider: Provider::Local,
            provider_id: None,
            profile_picture: None,
            verified: false,
        };
        let identity = ctx
            .run(async {
                self.directory
                    .create(new_identity)
                    .await
                    .map_err(AuthError::from)
            })
            .await?;

        tracing::info!(user_id = %identity.id, email = %identity.email, "user registered");
        self.start_session(ctx, identity, true).await
    }

    /// Unknown email, password-less account and wrong password all fail with
    /// the same [`AuthError::InvalidCredentials`] after the same amount of work.
    pub async fn login(
        &self,
        ctx: &CallContext,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let email = normalize_email(email);

        let account = self
            .find_by_email(ctx, &email)
            .await?
            .and_then(|identity| {
                let hash = identity.password_hash.clone()?;
                Some((identity, hash))
            });

        let Some((identity, hash)) = account else {
            self.burn_verification(password).await;
            tracing::info!(%email, "login rejected: no password account");
            return Err(AuthError::InvalidCredentials);
        };

        if !self.verify_password(password, hash).await? {
            tracing::info!(user_id = %identity.id, "login rejected: wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        tracing::info!(user_id = %identity.id, email = %identity.email, "user logged in");
        self.start_session(ctx, identity, true).await
    }

    // ── OAuth ──────────────────────────────────────────────────────────────────

    /// Returns the provider URL to send the browser to, and the state bound to it.
    pub async fn oauth_login_url(
        &self,
        ctx: &CallContext,
        redirect_uri: Option<&str>,
    ) -> Result<(Url, String), AuthError> {
        let redirect_uri = redirect_uri.unwrap_or(&self.default_redirect_uri);
        let state = self.csrf.generate_state(ctx).await?;
        let url = self
            .oauth
            .authorization_url(&state, redirect_uri)
            .map_err(provider_error)?;

        tracing::info!("oauth login initiated");
        Ok((url, state))
    }

    pub async fn oauth_login(
        &self,
        ctx: &CallContext,
        code: &str,
        state: &str,
        redirect_uri: Option<&str>,
    ) -> Result<Session, AuthError> {
        if !self.csrf.validate_state(ctx, state).await? {
            tracing::warn!("oauth callback rejected: invalid state");
            return Err(AuthError::InvalidState);
        }

        let redirect_uri = redirect_uri.unwrap_or(&self.default_redirect_uri);
        let profile = ctx
            .run(async {
                let access_token = self
                    .oauth
                    .exchange_code(code, redirect_uri)
                    .await
                    .map_err(provider_error)?;
                self.oauth
                    .fetch_profile(&access_token)
                    .await
                    .map_err(provider_error)
            })
            .await?;

        let email = normalize_email(&profile.email);
        let identity = match self.find_by_email(ctx, &email).await? {
            Some(existing) => bind_oauth_profile(existing, &profile)?,
            None => match self.create_oauth_identity(ctx, email.clone(), &profile).await {
                Ok(identity) => identity,
                // A concurrent first login for the same email created it first.
                Err(AuthError::EmailTaken) => {
                    let existing = self.find_by_email(ctx, &email).await?.ok_or_else(|| {
                        AuthError::Directory(format!("user {email} vanished after insert conflict"))
                    })?;
                    bind_oauth_profile(existing, &profile)?
                }
                Err(e) => return Err(e),
            },
        };

        tracing::info!(
            user_id = %identity.id,
            email = %identity.email,
            verified_email = profile.verified_email,
            "user authenticated via oauth"
        );
        self.start_session(ctx, identity, true).await
    }

    async fn create_oauth_identity(
        &self,
        ctx: &CallContext,
        email: String,
        profile: &OAuthProfile,
    ) -> Result<Identity, AuthError> {
        let new_identity = NewIdentity {
            email,
            username: None,
            password_hash: None,
            role: Role::User,
            provider: Provider::Google,
            provider_id: Some(profile.id.clone()),
            profile_picture: profile.picture.clone(),
            verified: profile.verified_email,
        };
        let identity = ctx
            .run(async {
                self.directory
                    .create(new_identity)
                    .await
                    .map_err(AuthError::from)
            })
            .await?;

        tracing::info!(user_id = %identity.id, "user created from oauth profile");
        Ok(identity)
    }

    // ── Tokens ─────────────────────────────────────────────────────────────────

    /// Redeems a refresh token for a new access token and a new refresh token.
    ///
    /// The stored refresh token is overwritten, so the presented one stops
    /// working. Concurrent refreshes of the same token may both succeed; the
    /// last write to the identity decides which new refresh token survives.
    pub async fn refresh_access_token(
        &self,
        ctx: &CallContext,
        refresh_token: &str,
    ) -> Result<Session, AuthError> {
        let token_hash = token_digest(refresh_token);
        let identity = ctx
            .run(async {
                self.directory
                    .find_by_refresh_token(&token_hash)
                    .await
                    .map_err(AuthError::from)
            })
            .await?
            .ok_or(AuthError::UnknownRefreshToken)?;

        if identity
            .refresh_token_expires_at
            .is_none_or(|expires_at| expires_at <= Utc::now())
        {
            tracing::info!(user_id = %identity.id, "refresh rejected: token expired");
            return Err(AuthError::UnknownRefreshToken);
        }

        tracing::info!(user_id = %identity.id, "tokens refreshed");
        self.start_session(ctx, identity, false).await
    }

    /// Revokes `access_token` for its remaining lifetime and clears the stored
    /// refresh token. Both steps are attempted; the first failure is returned.
    pub async fn logout(
        &self,
        ctx: &CallContext,
        access_token: &str,
        claims: &Claims,
    ) -> Result<(), AuthError> {
        let revoked = self
            .revocation
            .revoke(ctx, access_token, claims.remaining_ttl())
            .await;
        if let Err(e) = &revoked {
            tracing::error!(user_id = %claims.user_id, "failed to revoke access token: {e}");
        }

        let cleared = self.clear_refresh_token(ctx, claims.user_id).await;
        if let Err(e) = &cleared {
            tracing::error!(user_id = %claims.user_id, "failed to clear refresh token: {e}");
        }

        revoked.and(cleared)?;
        tracing::info!(user_id = %claims.user_id, jti = %claims.jti, "user logged out");
        Ok(())
    }

    /// The gate in front of every protected route.
    pub async fn authenticate(&self, ctx: &CallContext, token: &str) -> Result<Claims, AuthError> {
        if self.revocation.is_revoked(ctx, token).await? {
            tracing::warn!("rejected revoked access token");
            return Err(AuthError::Revoked);
        }

        self.tokens.validate_access_token(token).inspect_err(|e| match e {
            AuthError::Expired => tracing::debug!("rejected expired access token"),
            AuthError::InvalidSignature => tracing::warn!("rejected access token with invalid signature"),
            _ => tracing::info!("rejected malformed access token"),
        })
    }

    pub async fn find_identity(
        &self,
        ctx: &CallContext,
        id: Uuid,
    ) -> Result<Option<Identity>, AuthError> {
        ctx.run(async { self.directory.find_by_id(id).await.map_err(AuthError::from) })
            .await
    }

    // ── Internals ──────────────────────────────────────────────────────────────

    async fn start_session(
        &self,
        ctx: &CallContext,
        mut identity: Identity,
        stamp_login: bool,
    ) -> Result<Session, AuthError> {
        let access_token = self.tokens.issue_access_token(&identity)?;
        let refresh_token = self.tokens.issue_refresh_token()?;

        let now = Utc::now();
        identity.refresh_token_hash = Some(token_digest(&refresh_token));
        identity.refresh_token_expires_at = Some(now + self.refresh_ttl);
        if stamp_login {
            identity.last_login_at = Some(now);
        }

        ctx.run(async { self.directory.update(&identity).await.map_err(AuthError::from) })
            .await?;

        Ok(Session {
            identity,
            tokens: TokenPair {
                access_token,
                refresh_token,
                token_type: "Bearer",
                expires_in: self.tokens.access_ttl().as_secs(),
            },
        })
    }

    async fn clear_refresh_token(&self, ctx: &CallContext, user_id: Uuid) -> Result<(), AuthError> {
        let Some(mut identity) = self.find_identity(ctx, user_id).await? else {
            return Ok(());
        };
        if identity.refresh_token_hash.is_none() {
            return Ok(());
        }

        identity.refresh_token_hash = None;
        identity.refresh_token_expires_at = None;
        ctx.run(async { self.directory.update(&identity).await.map_err(AuthError::from) })
            .await
    }

    async fn find_by_email(
        &self,
        ctx: &CallContext,
        email: &str,
    ) -> Result<Option<Identity>, AuthError> {
        ctx.run(async { self.directory.find_by_email(email).await.map_err(AuthError::from) })
            .await
    }

    async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let verifier = self.verifier.clone();
        let password = password.to_owned();
        tokio::task::spawn_blocking(move || verifier.hash(&password))
            .await
            .map_err(|e| AuthError::HashingError(e.to_string()))?
    }

    async fn verify_password(&self, password: &str, hash: String) -> Result<bool, AuthError> {
        let verifier = self.verifier.clone();
        let password = password.to_owned();
        tokio::task::spawn_blocking(move || verifier.verify(&password, &hash))
            .await
            .map_err(|e| AuthError::HashingError(e.to_string()))
    }

    async fn burn_verification(&self, password: &str) {
        let verifier = self.verifier.clone();
        let password = password.to_owned();
        tokio::task::spawn_blocking(move || verifier.verify_dummy(&password))
            .await
            .ok();
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Binds a provider profile to an existing identity, refusing accounts owned
/// by another provider or another provider-side account.
fn bind_oauth_profile(mut existing: Identity, profile: &OAuthProfile) -> Result<Identity, AuthError> {
    if existing.provider != Provider::Google {
        tracing::warn!(
            user_id = %existing.id,
            provider = existing.provider.as_str(),
            "oauth login rejected: email bound to another provider"
        );
        return Err(AuthError::ProviderConflict);
    }
    if existing.provider_id.as_deref().is_some_and(|id| id != profile.id) {
        tracing::warn!(user_id = %existing.id, "oauth login rejected: provider account mismatch");
        return Err(AuthError::ProviderConflict);
    }

    existing.provider_id = Some(profile.id.clone());
    existing.verified = profile.verified_email;
    if profile.picture.is_some() {
        existing.profile_picture = profile.picture.clone();
    }
    Ok(existing)
}

fn provider_error(e: anyhow::Error) -> AuthError {
    AuthError::OAuthProvider(format!("{e:#}"))
}

fn validate_username(username: &str) -> Result<(), AuthError> {
    let len = username.chars().count();
    if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len)
        || !username.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(AuthError::BadRequest(format!(
            "username must be {MIN_USERNAME_LEN} to {MAX_USERNAME_LEN} letters or digits"
        )));
    }
    Ok(())
}

fn valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::testing::*;
    use super::*;
    use crate::auth::directory::DirectoryError;
    use crate::auth::directory::memory::InMemoryUserDirectory;
    use crate::auth::oauth::fake::FakeOAuthProvider;
    use crate::auth::store::MemoryTtlStore;
    use crate::auth::store::failing::UnreachableStore;

    #[tokio::test]
    async fn login_then_gate_accepts_token() {
        let h = harness();
        let account = local_account(&h.directory, "ana@example.com", "correct-horse");

        let session = h
            .service
            .login(&ctx(), "ana@example.com", "correct-horse")
            .await
            .unwrap();
        assert_eq!(session.identity.id, account.id);
        assert_eq!(session.tokens.token_type, "Bearer");
        assert_eq!(session.tokens.expires_in, 3600);

        let claims = h
            .service
            .authenticate(&ctx(), &session.tokens.access_token)
            .await
            .unwrap();
        assert_eq!(claims.user_id, account.id);
        assert_eq!(claims.email, "ana@example.com");
        assert_eq!(claims.role, Role::User);

        let stored = h.directory.get(account.id).unwrap();
        assert_eq!(
            stored.refresh_token_hash.as_deref(),
            Some(token_digest(&session.tokens.refresh_token).as_str())
        );
        assert!(stored.last_login_at.is_some());
    }

    #[tokio::test]
    async fn login_email_is_case_insensitive() {
        let h = harness();
        local_account(&h.directory, "ana@example.com", "correct-horse");
        h.service
            .login(&ctx(), "  Ana@Example.COM ", "correct-horse")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn login_failures_are_indistinguishable() {
        let h = harness();
        local_account(&h.directory, "ana@example.com", "correct-horse");
        h.service
            .oauth_login(
                &ctx(),
                GOOD_CODE,
                &h.service.oauth_login_url(&ctx(), None).await.unwrap().1,
                None,
            )
            .await
            .unwrap();

        for (email, password) in [
            ("ana@example.com", "wrong-horse"),
            ("nobody@example.com", "correct-horse"),
            (OAUTH_EMAIL, "anything-at-all"),
        ] {
            let err = h.service.login(&ctx(), email, password).await.unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredentials), "{email}: {err:?}");
        }
    }

    #[tokio::test]
    async fn logout_revokes_access_token() {
        let h = harness();
        let account = local_account(&h.directory, "ana@example.com", "correct-horse");
        let session = h
            .service
            .login(&ctx(), "ana@example.com", "correct-horse")
            .await
            .unwrap();
        let token = session.tokens.access_token;

        let claims = h.service.authenticate(&ctx(), &token).await.unwrap();
        h.service.logout(&ctx(), &token, &claims).await.unwrap();

        let err = h.service.authenticate(&ctx(), &token).await.unwrap_err();
        assert!(matches!(err, AuthError::Revoked));
        assert!(h.directory.get(account.id).unwrap().refresh_token_hash.is_none());

        let err = h
            .service
            .refresh_access_token(&ctx(), &session.tokens.refresh_token)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownRefreshToken));
    }

    #[tokio::test]
    async fn refresh_token_is_single_use() {
        let h = harness();
        local_account(&h.directory, "ana@example.com", "correct-horse");
        let first = h
            .service
            .login(&ctx(), "ana@example.com", "correct-horse")
            .await
            .unwrap();

        let second = h
            .service
            .refresh_access_token(&ctx(), &first.tokens.refresh_token)
            .await
            .unwrap();
        assert_ne!(second.tokens.refresh_token, first.tokens.refresh_token);
        assert_ne!(second.tokens.access_token, first.tokens.access_token);
        h.service
            .authenticate(&ctx(), &second.tokens.access_token)
            .await
            .unwrap();

        let err = h
            .service
            .refresh_access_token(&ctx(), &first.tokens.refresh_token)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownRefreshToken));

        h.service
            .refresh_access_token(&ctx(), &second.tokens.refresh_token)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn refresh_does_not_stamp_last_login() {
        let h = harness();
        let account = local_account(&h.directory, "ana@example.com", "correct-horse");
        let session = h
            .service
            .login(&ctx(), "ana@example.com", "correct-horse")
            .await
            .unwrap();
        let logged_in_at = h.directory.get(account.id).unwrap().last_login_at;

        h.service
            .refresh_access_token(&ctx(), &session.tokens.refresh_token)
            .await
            .unwrap();
        assert_eq!(h.directory.get(account.id).unwrap().last_login_at, logged_in_at);
    }

    #[tokio::test]
    async fn expired_refresh_token_is_unknown() {
        let h = harness();
        let account = local_account(&h.directory, "ana@example.com", "correct-horse");
        let session = h
            .service
            .login(&ctx(), "ana@example.com", "correct-horse")
            .await
            .unwrap();

        let mut stored = h.directory.get(account.id).unwrap();
        stored.refresh_token_expires_at = Some(Utc::now() - TimeDelta::seconds(1));
        h.directory.insert(stored);

        let err = h
            .service
            .refresh_access_token(&ctx(), &session.tokens.refresh_token)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownRefreshToken));
    }

    #[tokio::test]
    async fn role_change_applies_from_next_token() {
        let h = harness();
        let account = local_account(&h.directory, "ana@example.com", "correct-horse");
        let session = h
            .service
            .login(&ctx(), "ana@example.com", "correct-horse")
            .await
            .unwrap();

        let mut promoted = h.directory.get(account.id).unwrap();
        promoted.role = Role::Admin;
        h.directory.insert(promoted);

        let old = h
            .service
            .authenticate(&ctx(), &session.tokens.access_token)
            .await
            .unwrap();
        assert_eq!(old.role, Role::User);

        let refreshed = h
            .service
            .refresh_access_token(&ctx(), &session.tokens.refresh_token)
            .await
            .unwrap();
        let new = h
            .service
            .authenticate(&ctx(), &refreshed.tokens.access_token)
            .await
            .unwrap();
        assert_eq!(new.role, Role::Admin);
    }

    #[tokio::test]
    async fn oauth_login_creates_user_once() {
        let h = harness();

        let (url, state) = h.service.oauth_login_url(&ctx(), None).await.unwrap();
        assert!(url.query_pairs().any(|(k, v)| k == "state" && v == state));
        let first = h
            .service
            .oauth_login(&ctx(), GOOD_CODE, &state, None)
            .await
            .unwrap();
        assert_eq!(first.identity.email, OAUTH_EMAIL);
        assert_eq!(first.identity.provider, Provider::Google);
        assert_eq!(first.identity.provider_id.as_deref(), Some("google-good-code"));
        assert!(first.identity.password_hash.is_none());
        assert!(first.identity.verified);
        assert_eq!(
            first.identity.profile_picture.as_deref(),
            Some("https://images.example.com/good-code.png")
        );
        assert_eq!(
            h.oauth.last_redirect_uri.lock().as_deref(),
            Some(DEFAULT_REDIRECT_URI)
        );

        let (_, state) = h.service.oauth_login_url(&ctx(), None).await.unwrap();
        let second = h
            .service
            .oauth_login(&ctx(), GOOD_CODE, &state, Some("http://app.example.com/cb"))
            .await
            .unwrap();
        assert_eq!(second.identity.id, first.identity.id);
        assert_eq!(h.directory.len(), 1);
        assert_eq!(
            h.oauth.last_redirect_uri.lock().as_deref(),
            Some("http://app.example.com/cb")
        );
    }

    #[tokio::test]
    async fn oauth_state_is_single_use() {
        let h = harness();
        let (_, state) = h.service.oauth_login_url(&ctx(), None).await.unwrap();
        h.service
            .oauth_login(&ctx(), GOOD_CODE, &state, None)
            .await
            .unwrap();

        let err = h
            .service
            .oauth_login(&ctx(), GOOD_CODE, &state, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidState));

        let err = h
            .service
            .oauth_login(&ctx(), GOOD_CODE, "forged", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidState));
    }

    #[tokio::test]
    async fn oauth_with_local_email_conflicts() {
        let h = harness();
        let account = local_account(&h.directory, OAUTH_EMAIL, "correct-horse");

        let (_, state) = h.service.oauth_login_url(&ctx(), None).await.unwrap();
        let err = h
            .service
            .oauth_login(&ctx(), GOOD_CODE, &state, None)
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::ProviderConflict));
        assert_eq!(h.directory.len(), 1);
        assert_eq!(h.directory.get(account.id).unwrap(), account);
    }

    #[tokio::test]
    async fn oauth_with_other_google_account_conflicts() {
        let h = harness();
        let account = google_account(&h.directory, OAUTH_EMAIL, Some("google-someone-else"));

        let (_, state) = h.service.oauth_login_url(&ctx(), None).await.unwrap();
        let err = h
            .service
            .oauth_login(&ctx(), GOOD_CODE, &state, None)
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::ProviderConflict));
        let stored = h.directory.get(account.id).unwrap();
        assert_eq!(stored, account);
        assert!(stored.refresh_token_hash.is_none());
        assert!(stored.last_login_at.is_none());
    }

    #[tokio::test]
    async fn oauth_binds_unbound_google_account() {
        let h = harness();
        let account = google_account(&h.directory, OAUTH_EMAIL, None);

        let (_, state) = h.service.oauth_login_url(&ctx(), None).await.unwrap();
        let session = h
            .service
            .oauth_login(&ctx(), GOOD_CODE, &state, None)
            .await
            .unwrap();
        assert_eq!(session.identity.id, account.id);

        let stored = h.directory.get(account.id).unwrap();
        assert_eq!(stored.provider_id.as_deref(), Some("google-good-code"));
        assert!(stored.verified);
        assert!(stored.profile_picture.is_some());
        assert_eq!(
            stored.refresh_token_hash.as_deref(),
            Some(token_digest(&session.tokens.refresh_token).as_str())
        );
        assert_eq!(h.directory.len(), 1);
    }

    /// Holds every caller of the first two email lookups until both have
    /// seen the same (empty) result.
    struct LockstepDirectory {
        inner: Arc<InMemoryUserDirectory>,
        barrier: tokio::sync::Barrier,
        lookups: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl UserDirectory for LockstepDirectory {
        async fn find_by_email(&self, email: &str) -> Result<Option<Identity>, DirectoryError> {
            let found = self.inner.find_by_email(email).await?;
            if self.lookups.fetch_add(1, Ordering::SeqCst) < 2 {
                self.barrier.wait().await;
            }
            Ok(found)
        }

        async fn find_by_username(
            &self,
            username: &str,
        ) -> Result<Option<Identity>, DirectoryError> {
            self.inner.find_by_username(username).await
        }

        async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, DirectoryError> {
            self.inner.find_by_id(id).await
        }

        async fn find_by_refresh_token(
            &self,
            token_hash: &str,
        ) -> Result<Option<Identity>, DirectoryError> {
            self.inner.find_by_refresh_token(token_hash).await
        }

        async fn create(&self, identity: NewIdentity) -> Result<Identity, DirectoryError> {
            self.inner.create(identity).await
        }

        async fn update(&self, identity: &Identity) -> Result<(), DirectoryError> {
            self.inner.update(identity).await
        }
    }

    #[tokio::test]
    async fn concurrent_first_oauth_logins_share_one_identity() {
        let users = Arc::new(InMemoryUserDirectory::default());
        let directory = Arc::new(LockstepDirectory {
            inner: users.clone(),
            barrier: tokio::sync::Barrier::new(2),
            lookups: AtomicUsize::new(0),
        });
        let oauth = Arc::new(FakeOAuthProvider::default().with_profile(GOOD_CODE, OAUTH_EMAIL));
        let service = service(directory, oauth, MemoryTtlStore::new());

        let (_, first_state) = service.oauth_login_url(&ctx(), None).await.unwrap();
        let (_, second_state) = service.oauth_login_url(&ctx(), None).await.unwrap();

        let (first_ctx, second_ctx) = (ctx(), ctx());
        let (first, second) = tokio::join!(
            service.oauth_login(&first_ctx, GOOD_CODE, &first_state, None),
            service.oauth_login(&second_ctx, GOOD_CODE, &second_state, None),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.identity.id, second.identity.id);
        assert_eq!(users.len(), 1);
        assert_eq!(
            users.get(first.identity.id).unwrap().provider_id.as_deref(),
            Some("google-good-code")
        );
    }

    #[tokio::test]
    async fn register_with_username() {
        let h = harness();
        let session = h
            .service
            .register(&ctx(), "ana@example.com", "long-enough", Some(" ana42 "))
            .await
            .unwrap();
        assert_eq!(session.identity.username.as_deref(), Some("ana42"));
        assert!(!session.identity.verified);

        let err = h
            .service
            .register(&ctx(), "other@example.com", "long-enough", Some("ana42"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UsernameTaken));

        // Blank usernames are treated as absent, and absent ones never collide.
        for email in ["b@example.com", "c@example.com"] {
            let session = h
                .service
                .register(&ctx(), email, "long-enough", Some("  "))
                .await
                .unwrap();
            assert!(session.identity.username.is_none());
        }
        assert_eq!(h.directory.len(), 3);
    }

    #[tokio::test]
    async fn register_rejects_bad_usernames() {
        let h = harness();
        let long = "a".repeat(51);
        for username in ["ab", "with space", "dash-ed", long.as_str()] {
            let err = h
                .service
                .register(&ctx(), "ana@example.com", "long-enough", Some(username))
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::BadRequest(_)), "{username}: {err:?}");
        }
        assert_eq!(h.directory.len(), 0);
    }

    #[tokio::test]
    async fn rejected_code_is_provider_error() {
        let h = harness();
        let (_, state) = h.service.oauth_login_url(&ctx(), None).await.unwrap();
        let err = h
            .service
            .oauth_login(&ctx(), "bad-code", &state, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::OAuthProvider(_)));
        assert_eq!(h.directory.len(), 0);
    }

    #[tokio::test]
    async fn register_creates_local_account() {
        let h = harness();
        let session = h
            .service
            .register(&ctx(), " New@Example.com", "long-enough", None)
            .await
            .unwrap();
        assert_eq!(session.identity.email, "new@example.com");
        assert_eq!(session.identity.provider, Provider::Local);
        assert_eq!(session.identity.role, Role::User);

        h.service
            .login(&ctx(), "new@example.com", "long-enough")
            .await
            .unwrap();

        let err = h
            .service
            .register(&ctx(), "new@example.com", "another-password", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::EmailTaken));
    }

    #[tokio::test]
    async fn register_validates_input() {
        let h = harness();
        for (email, password) in [
            ("not-an-email", "long-enough"),
            ("@example.com", "long-enough"),
            ("a@localhost", "long-enough"),
            ("a@example.com", "short"),
        ] {
            let err = h
                .service
                .register(&ctx(), email, password, None)
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::BadRequest(_)), "{email}: {err:?}");
        }
        assert_eq!(h.directory.len(), 0);
    }

    #[tokio::test]
    async fn gate_fails_open_when_revocation_store_is_down() {
        let h = harness_with_revocation_store(Arc::new(UnreachableStore));
        let account = local_account(&h.directory, "ana@example.com", "correct-horse");
        let session = h
            .service
            .login(&ctx(), "ana@example.com", "correct-horse")
            .await
            .unwrap();
        let token = session.tokens.access_token;

        let claims = h.service.authenticate(&ctx(), &token).await.unwrap();

        let err = h.service.logout(&ctx(), &token, &claims).await.unwrap_err();
        assert!(matches!(err, AuthError::StoreUnavailable(_)));
        // The refresh token is still cleared.
        assert!(h.directory.get(account.id).unwrap().refresh_token_hash.is_none());
    }

    #[tokio::test]
    async fn gate_rejects_foreign_tokens() {
        let h = harness();
        let foreign = TokenIssuer::new("another-secret", Duration::from_secs(3600));
        let account = local_account(&h.directory, "ana@example.com", "correct-horse");
        let token = foreign.issue_access_token(&account).unwrap();

        let err = h.service.authenticate(&ctx(), &token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidSignature));
        let err = h.service.authenticate(&ctx(), "not.a.jwt").await.unwrap_err();
        assert!(matches!(err, AuthError::Malformed));
    }

    #[tokio::test]
    async fn cancelled_request_is_aborted() {
        let h = harness();
        local_account(&h.directory, "ana@example.com", "correct-horse");
        let ctx = ctx();
        ctx.cancel();

        let err = h
            .service
            .login(&ctx, "ana@example.com", "correct-horse")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Canceled));
    }

    #[test]
    fn email_shape() {
        assert!(valid_email("a@b.co"));
        assert!(!valid_email("a@b."));
        assert!(!valid_email("a@.b"));
        assert!(!valid_email("ab.co"));
        assert_eq!(normalize_email(" A@B.Co "), "a@b.co");
    }
}
