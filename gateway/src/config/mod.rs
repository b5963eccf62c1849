use serde::{Deserialize, Serialize};

use crate::api::config::{ApiConfig, AuthConfig, OAuthConfig};
use crate::redis::RedisConfig;
use crate::sqlx::PgConfig;
use crate::utils::logger::LoggerConfig;

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiConfig,

    pub auth: AuthConfig,

    pub oauth: OAuthConfig,

    pub postgres: PgConfig,

    pub redis: RedisConfig,

    pub logger: LoggerConfig,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "api": { "listen_addr": "127.0.0.1:9000" },
                "auth": { "access_token_ttl": "30m", "password": { "memory_kib": 65536 } },
                "redis": { "key_prefix": "staging:" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.api.listen_addr.port(), 9000);
        assert_eq!(config.api.request_timeout, Duration::from_secs(25));
        assert_eq!(config.auth.access_token_ttl, Duration::from_secs(1800));
        assert_eq!(config.auth.refresh_token_ttl, Duration::from_secs(7 * 86400));
        assert_eq!(config.auth.password.memory_kib, 65536);
        assert_eq!(config.redis.key_prefix, "staging:");
        assert_eq!(config.postgres.db_pool_size, 5);
        assert_eq!(config.logger.outputs.len(), 1);
    }

    #[test]
    fn invalid_value_path_is_reported() {
        let json = r#"{"auth":{"store_timeout":"soon"}}"#;
        let de = &mut serde_json::Deserializer::from_str(json);
        let err = serde_path_to_error::deserialize::<_, AppConfig>(de).unwrap_err();
        assert_eq!(err.path().to_string(), "auth.store_timeout");
    }
}
