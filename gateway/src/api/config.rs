use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::auth::PasswordConfig;

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// TCP socket address to listen for incoming connections.
    ///
    /// Default: `0.0.0.0:8000`
    pub listen_addr: SocketAddr,

    /// Deadline for a whole request, including every store and provider call.
    ///
    /// Default: `25s`
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// How long in-flight requests may keep running after a termination
    /// signal before their pending calls are cancelled.
    ///
    /// Default: `10s`
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: (Ipv4Addr::UNSPECIFIED, 8000).into(),
            request_timeout: Duration::from_secs(25),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Default: `1h`
    #[serde(with = "humantime_serde")]
    pub access_token_ttl: Duration,

    /// Default: `7days`
    #[serde(with = "humantime_serde")]
    pub refresh_token_ttl: Duration,

    /// Upper bound on how long a revocation entry is kept.
    ///
    /// Should not be lower than `access_token_ttl`, otherwise a revoked
    /// token becomes usable again once its entry is dropped.
    ///
    /// Default: `24h`
    #[serde(with = "humantime_serde")]
    pub revocation_ttl_ceiling: Duration,

    /// Timeout of a single revocation or state store call.
    ///
    /// Default: `5s`
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,

    /// How often the in-process state store evicts abandoned states.
    ///
    /// Default: `5m`
    #[serde(with = "humantime_serde")]
    pub state_sweep_interval: Duration,

    pub password: PasswordConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_token_ttl: Duration::from_secs(3600),
            refresh_token_ttl: Duration::from_secs(7 * 24 * 3600),
            revocation_ttl_ceiling: Duration::from_secs(24 * 3600),
            store_timeout: Duration::from_secs(5),
            state_sweep_interval: Duration::from_secs(5 * 60),
            password: PasswordConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Redirect URI used when the client does not pass one.
    ///
    /// Default: `http://localhost:8000/auth/google/callback`
    pub default_redirect_uri: String,

    /// Timeout of each call to the provider.
    ///
    /// Default: `10s`
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,

    /// Origins allowed to call `/auth/google/*`, matched against `Origin`
    /// exactly or as a prefix of `Referer`. Empty disables the check.
    ///
    /// Default: `[]`
    pub allowed_origins: Vec<String>,

    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            default_redirect_uri: "http://localhost:8000/auth/google/callback".to_owned(),
            http_timeout: Duration::from_secs(10),
            allowed_origins: Vec::new(),
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_owned(),
            token_url: "https://oauth2.googleapis.com/token".to_owned(),
            userinfo_url: "https://www.googleapis.com/oauth2/v2/userinfo".to_owned(),
        }
    }
}

/// Sensitive credentials, loaded exclusively from environment variables.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct ApiSecrets {
    pub jwt_secret: String,
    pub client_id: String,
    pub client_secret: String,
}

impl ApiSecrets {
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = std::env::var("JWT_SECRET").context("JWT_SECRET not set")?;
        anyhow::ensure!(!jwt_secret.is_empty(), "JWT_SECRET is empty");

        Ok(Self {
            jwt_secret,
            client_id: std::env::var("GOOGLE_CLIENT_ID").context("GOOGLE_CLIENT_ID not set")?,
            client_secret: std::env::var("GOOGLE_CLIENT_SECRET")
                .context("GOOGLE_CLIENT_SECRET not set")?,
        })
    }
}
