use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::auth::store::{MemoryTtlStore, Sweeper, TtlStore};
use crate::auth::{AuthError, CallContext};

/// Lifetime of an OAuth state value.
pub const STATE_TTL: Duration = Duration::from_secs(10 * 60);

const KEY_PREFIX: &str = "oauth:state:";
const STATE_BYTES: usize = 32;

/// Single-use, time-boxed nonces binding an OAuth callback to the login
/// request that started it.
pub struct CsrfStateStore {
    store: Arc<dyn TtlStore>,
    store_timeout: Duration,
    sweeper: Mutex<Option<Sweeper>>,
}

impl CsrfStateStore {
    /// Backed by a shared store that expires entries itself (e.g. Redis).
    pub fn new(store: Arc<dyn TtlStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
            sweeper: Mutex::new(None),
        }
    }

    /// Backed by an in-process map, with a sweep task that evicts abandoned
    /// entries every `sweep_interval` until [`CsrfStateStore::shutdown`].
    ///
    /// The sweep covers the whole map, so other users of `store` are swept too.
    pub fn in_memory(
        store: Arc<MemoryTtlStore>,
        sweep_interval: Duration,
        store_timeout: Duration,
    ) -> Self {
        let sweeper = store.spawn_sweeper(sweep_interval);
        Self {
            store,
            store_timeout,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Creates and stores a fresh state value valid for [`STATE_TTL`].
    pub async fn generate_state(&self, ctx: &CallContext) -> Result<String, AuthError> {
        let mut bytes = [0u8; STATE_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| AuthError::EntropyError(e.to_string()))?;
        let state = URL_SAFE_NO_PAD.encode(bytes);

        let key = format!("{KEY_PREFIX}{state}");
        ctx.run(async {
            match tokio::time::timeout(self.store_timeout, self.store.put(&key, STATE_TTL)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(AuthError::StoreUnavailable(format!("{e:#}"))),
                Err(_) => Err(AuthError::StoreUnavailable("state store timed out".to_owned())),
            }
        })
        .await?;

        Ok(state)
    }

    /// Consumes `state`. True only for a known, unexpired value; any value is
    /// removed on first use regardless of the outcome.
    pub async fn validate_state(&self, ctx: &CallContext, state: &str) -> Result<bool, AuthError> {
        if state.is_empty() {
            return Ok(false);
        }

        let key = format!("{KEY_PREFIX}{state}");
        ctx.run(async {
            match tokio::time::timeout(self.store_timeout, self.store.take(&key)).await {
                Ok(Ok(valid)) => Ok(valid),
                Ok(Err(e)) => Err(AuthError::StoreUnavailable(format!("{e:#}"))),
                Err(_) => Err(AuthError::StoreUnavailable("state store timed out".to_owned())),
            }
        })
        .await
    }

    /// Stops the sweep task, if any.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
        }
    }
}
