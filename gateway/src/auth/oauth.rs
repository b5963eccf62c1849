use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;
use zeroize::Zeroizing;

use crate::api::config::{ApiSecrets, OAuthConfig};

/// Profile returned by the provider's userinfo endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthProfile {
    /// Provider-side account ID.
    #[serde(alias = "sub")]
    pub id: String,
    pub email: String,
    #[serde(default, alias = "email_verified")]
    pub verified_email: bool,
    #[serde(default)]
    pub picture: Option<String>,
}

/// Token response from the provider's token endpoint.
#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
}

/// OAuth2 authorization-code flow against an external identity provider.
///
/// The redirect URI is chosen per request, never fixed at startup.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn authorization_url(&self, state: &str, redirect_uri: &str) -> anyhow::Result<Url>;

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> anyhow::Result<String>;

    async fn fetch_profile(&self, access_token: &str) -> anyhow::Result<OAuthProfile>;
}

pub struct GoogleOAuth {
    http_client: reqwest::Client,
    client_id: Zeroizing<String>,
    client_secret: Zeroizing<String>,
    auth_url: Url,
    token_url: Url,
    userinfo_url: Url,
}

impl GoogleOAuth {
    pub fn new(
        config: &OAuthConfig,
        secrets: &ApiSecrets,
        http_client: reqwest::Client,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http_client,
            client_id: Zeroizing::new(secrets.client_id.clone()),
            client_secret: Zeroizing::new(secrets.client_secret.clone()),
            auth_url: Url::parse(&config.auth_url).context("invalid oauth auth_url")?,
            token_url: Url::parse(&config.token_url).context("invalid oauth token_url")?,
            userinfo_url: Url::parse(&config.userinfo_url).context("invalid oauth userinfo_url")?,
        })
    }
}

#[async_trait]
impl OAuthProvider for GoogleOAuth {
    fn authorization_url(&self, state: &str, redirect_uri: &str) -> anyhow::Result<Url> {
        let mut auth_url = self.auth_url.clone();
        auth_url
            .query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair(
                "scope",
                "https://www.googleapis.com/auth/userinfo.email \
                 https://www.googleapis.com/auth/userinfo.profile",
            )
            .append_pair("access_type", "offline")
            .append_pair("state", state);
        Ok(auth_url)
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> anyhow::Result<String> {
        let token: OAuthTokenResponse = self
            .http_client
            .post(self.token_url.clone())
            .form(&[
                ("code", code),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("redirect_uri", redirect_uri),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .context("token request failed")?
            .error_for_status()
            .context("token endpoint rejected the code")?
            .json()
            .await
            .context("invalid token response")?;

        Ok(token.access_token)
    }

    async fn fetch_profile(&self, access_token: &str) -> anyhow::Result<OAuthProfile> {
        self.http_client
            .get(self.userinfo_url.clone())
            .bearer_auth(access_token)
            .send()
            .await
            .context("userinfo request failed")?
            .error_for_status()
            .context("userinfo endpoint rejected the token")?
            .json()
            .await
            .context("invalid userinfo response")
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    /// Provider that maps fixed codes to fixed profiles.
    #[derive(Default)]
    pub struct FakeOAuthProvider {
        profiles: Mutex<HashMap<String, OAuthProfile>>,
        pub last_redirect_uri: Mutex<Option<String>>,
    }

    impl FakeOAuthProvider {
        pub fn with_profile(self, code: &str, email: &str) -> Self {
            self.profiles.lock().insert(
                code.to_owned(),
                OAuthProfile {
                    id: format!("google-{code}"),
                    email: email.to_owned(),
                    verified_email: true,
                    picture: Some(format!("https://images.example.com/{code}.png")),
                },
            );
            self
        }
    }

    #[async_trait]
    impl OAuthProvider for FakeOAuthProvider {
        fn authorization_url(&self, state: &str, redirect_uri: &str) -> anyhow::Result<Url> {
            let mut url = Url::parse("https://accounts.example.com/auth")?;
            url.query_pairs_mut()
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("state", state);
            Ok(url)
        }

        async fn exchange_code(&self, code: &str, redirect_uri: &str) -> anyhow::Result<String> {
            *self.last_redirect_uri.lock() = Some(redirect_uri.to_owned());
            if self.profiles.lock().contains_key(code) {
                Ok(format!("access-{code}"))
            } else {
                anyhow::bail!("invalid_grant")
            }
        }

        async fn fetch_profile(&self, access_token: &str) -> anyhow::Result<OAuthProfile> {
            let code = access_token
                .strip_prefix("access-")
                .context("unknown access token")?;
            self.profiles
                .lock()
                .get(code)
                .cloned()
                .context("unknown access token")
        }
    }
}
