use std::sync::Arc;
use std::time::Duration;

use crate::auth::store::TtlStore;
use crate::auth::token::token_digest;
use crate::auth::{AuthError, CallContext};

const KEY_PREFIX: &str = "jwt:revoked:";

/// Negative cache of access tokens that must be rejected before they expire.
///
/// # Fail-open
///
/// When the backing store cannot be reached, [`RevocationRegistry::is_revoked`]
/// answers `false` and logs a warning, so an outage of the store does not lock
/// every user out. During such an outage a logged-out token keeps working until
/// its own expiry. Revoking, on the other hand, reports the failure to the caller.
#[derive(Clone)]
pub struct RevocationRegistry {
    store: Arc<dyn TtlStore>,
    store_timeout: Duration,
    ttl_ceiling: Duration,
}

impl RevocationRegistry {
    pub fn new(store: Arc<dyn TtlStore>, store_timeout: Duration, ttl_ceiling: Duration) -> Self {
        Self {
            store,
            store_timeout,
            ttl_ceiling,
        }
    }

    fn key(token: &str) -> String {
        format!("{KEY_PREFIX}{}", token_digest(token))
    }

    /// Records `token` as revoked for `ttl`, capped at the configured ceiling.
    ///
    /// Idempotent. A zero `ttl` means the token has already expired and
    /// nothing is written.
    pub async fn revoke(
        &self,
        ctx: &CallContext,
        token: &str,
        ttl: Duration,
    ) -> Result<(), AuthError> {
        let ttl = if ttl > self.ttl_ceiling {
            tracing::warn!(
                ?ttl,
                ceiling = ?self.ttl_ceiling,
                "revocation ttl capped below token lifetime"
            );
            self.ttl_ceiling
        } else {
            ttl
        };

        if ttl.is_zero() {
            return Ok(());
        }

        let key = Self::key(token);
        ctx.run(async {
            match tokio::time::timeout(self.store_timeout, self.store.put(&key, ttl)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(AuthError::StoreUnavailable(format!("{e:#}"))),
                Err(_) => Err(AuthError::StoreUnavailable(
                    "revocation store timed out".to_owned(),
                )),
            }
        })
        .await
    }

    /// Point lookup, fail-open. Only caller cancellation or deadline surfaces as an error.
    pub async fn is_revoked(&self, ctx: &CallContext, token: &str) -> Result<bool, AuthError> {
        let key = Self::key(token);
        ctx.run(async {
            match tokio::time::timeout(self.store_timeout, self.store.contains(&key)).await {
                Ok(Ok(revoked)) => Ok(revoked),
                Ok(Err(e)) => {
                    tracing::warn!("revocation check failed, allowing token: {e:#}");
                    Ok(false)
                }
                Err(_) => {
                    tracing::warn!(
                        timeout = ?self.store_timeout,
                        "revocation check timed out, allowing token"
                    );
                    Ok(false)
                }
            }
        })
        .await
    }
}
