use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Prepended to every key, so several deployments can share one Redis.
    ///
    /// Default: `rota:`
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            key_prefix: "rota:".to_owned(),
        }
    }
}
