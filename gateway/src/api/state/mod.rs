use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::config::{ApiConfig, ApiSecrets, AuthConfig, OAuthConfig};
use crate::api::endpoint::ApiEndpoint;
use crate::auth::{
    CallContext, CredentialVerifier, CsrfStateStore, MemoryTtlStore, OAuthProvider,
    RevocationRegistry, SessionService, SessionServiceParts, TokenIssuer, TtlStore,
    UserDirectory,
};

pub struct ApiStateBuilder<
    MandatoryFields = (Arc<dyn UserDirectory>, Arc<dyn OAuthProvider>),
> {
    api: ApiConfig,
    auth: AuthConfig,
    oauth: OAuthConfig,
    shared_store: Option<Arc<dyn TtlStore>>,
    mandatory_fields: MandatoryFields,
}

impl ApiStateBuilder {
    pub fn build(self, secrets: &ApiSecrets) -> Result<ApiState> {
        let (directory, oauth) = self.mandatory_fields;
        let auth = self.auth;
        let OAuthConfig {
            default_redirect_uri,
            allowed_origins,
            ..
        } = self.oauth;

        if auth.revocation_ttl_ceiling < auth.access_token_ttl {
            tracing::warn!(
                ceiling = ?auth.revocation_ttl_ceiling,
                access_token_ttl = ?auth.access_token_ttl,
                "revocation ttl ceiling is shorter than the access token lifetime"
            );
        }

        let (revocation_store, csrf) = match self.shared_store {
            Some(store) => (
                store.clone(),
                CsrfStateStore::new(store, auth.store_timeout),
            ),
            None => {
                tracing::warn!("no shared store, revocations and oauth states stay in process");
                let store = MemoryTtlStore::new();
                (
                    store.clone() as Arc<dyn TtlStore>,
                    CsrfStateStore::in_memory(store, auth.state_sweep_interval, auth.store_timeout),
                )
            }
        };

        let sessions = SessionService::new(SessionServiceParts {
            directory,
            oauth,
            verifier: CredentialVerifier::new(auth.password)?,
            tokens: TokenIssuer::new(&secrets.jwt_secret, auth.access_token_ttl),
            revocation: RevocationRegistry::new(
                revocation_store,
                auth.store_timeout,
                auth.revocation_ttl_ceiling,
            ),
            csrf,
            refresh_ttl: auth.refresh_token_ttl,
            default_redirect_uri,
        })?;

        Ok(ApiState {
            inner: Arc::new(Inner {
                config: self.api,
                allowed_origins,
                sessions,
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

impl<T2> ApiStateBuilder<((), T2)> {
    pub fn with_directory(
        self,
        directory: Arc<dyn UserDirectory>,
    ) -> ApiStateBuilder<(Arc<dyn UserDirectory>, T2)> {
        let (_, oauth) = self.mandatory_fields;

        ApiStateBuilder {
            api: self.api,
            auth: self.auth,
            oauth: self.oauth,
            shared_store: self.shared_store,
            mandatory_fields: (directory, oauth),
        }
    }
}

impl<T1> ApiStateBuilder<(T1, ())> {
    pub fn with_oauth_provider(
        self,
        provider: Arc<dyn OAuthProvider>,
    ) -> ApiStateBuilder<(T1, Arc<dyn OAuthProvider>)> {
        let (directory, _) = self.mandatory_fields;

        ApiStateBuilder {
            api: self.api,
            auth: self.auth,
            oauth: self.oauth,
            shared_store: self.shared_store,
            mandatory_fields: (directory, provider),
        }
    }
}

impl<T1, T2> ApiStateBuilder<(T1, T2)> {
    pub fn with_api_config(self, api: ApiConfig) -> Self {
        Self { api, ..self }
    }

    pub fn with_auth_config(self, auth: AuthConfig) -> Self {
        Self { auth, ..self }
    }

    pub fn with_oauth_config(self, oauth: OAuthConfig) -> Self {
        Self { oauth, ..self }
    }

    /// Store shared by all instances (e.g. Redis). Without one, revocations
    /// and OAuth states live in this process only.
    pub fn with_shared_store(self, store: Option<Arc<dyn TtlStore>>) -> Self {
        Self {
            shared_store: store,
            ..self
        }
    }
}

#[derive(Clone)]
#[repr(transparent)]
pub struct ApiState {
    inner: Arc<Inner>,
}

impl ApiState {
    pub fn builder() -> ApiStateBuilder<((), ())> {
        ApiStateBuilder {
            api: ApiConfig::default(),
            auth: AuthConfig::default(),
            oauth: OAuthConfig::default(),
            shared_store: None,
            mandatory_fields: ((), ()),
        }
    }

    pub async fn bind_socket(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(self.config().listen_addr).await
    }

    pub async fn bind_endpoint(&self) -> Result<ApiEndpoint> {
        ApiEndpoint::builder().bind(self.clone()).await
    }

    pub fn config(&self) -> &ApiConfig {
        &self.inner.config
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.inner.allowed_origins
    }

    pub fn sessions(&self) -> &SessionService {
        &self.inner.sessions
    }

    /// Deadline and cancellation for one request.
    pub fn call_context(&self) -> CallContext {
        CallContext::with_cancellation(
            self.inner.config.request_timeout,
            self.inner.shutdown.child_token(),
        )
    }

    /// Aborts pending store, directory and provider calls of in-flight requests.
    pub fn cancel_requests(&self) {
        self.inner.shutdown.cancel();
    }

    /// Gives in-flight requests `grace` to finish, then cancels whatever is
    /// still pending.
    pub fn cancel_requests_after(&self, grace: Duration) {
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    tracing::warn!(?grace, "grace period elapsed, cancelling in-flight requests");
                    shutdown.cancel();
                }
            }
        });
    }

    pub async fn shutdown(&self) {
        self.cancel_requests();
        self.inner.sessions.shutdown().await;
    }
}

struct Inner {
    config: ApiConfig,
    allowed_origins: Vec<String>,
    sessions: SessionService,
    shutdown: CancellationToken,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::auth::directory::memory::InMemoryUserDirectory;
    use crate::auth::oauth::fake::FakeOAuthProvider;
    use crate::auth::session::testing::{GOOD_CODE, OAUTH_EMAIL, SECRET};

    pub fn test_state() -> (ApiState, Arc<InMemoryUserDirectory>) {
        test_state_with_oauth(OAuthConfig::default())
    }

    pub fn test_state_with_oauth(oauth_config: OAuthConfig) -> (ApiState, Arc<InMemoryUserDirectory>) {
        let directory = Arc::new(InMemoryUserDirectory::default());
        let oauth = FakeOAuthProvider::default().with_profile(GOOD_CODE, OAUTH_EMAIL);
        let secrets = ApiSecrets {
            jwt_secret: SECRET.to_owned(),
            client_id: "client".to_owned(),
            client_secret: "secret".to_owned(),
        };

        let state = ApiState::builder()
            .with_directory(directory.clone())
            .with_oauth_provider(Arc::new(oauth))
            .with_oauth_config(oauth_config)
            .with_auth_config(AuthConfig {
                password: crate::auth::PasswordConfig {
                    memory_kib: 64,
                    iterations: 1,
                    parallelism: 1,
                },
                ..AuthConfig::default()
            })
            .build(&secrets)
            .unwrap();

        (state, directory)
    }
}
