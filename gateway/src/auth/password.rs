use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::auth::AuthError;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordConfig {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

/// Hashes and verifies user passwords.
#[derive(Clone)]
pub struct CredentialVerifier {
    params: Params,
    /// Hash of a throwaway password with the configured cost, verified
    /// against when there is no real hash to check.
    dummy_hash: Arc<str>,
}

impl CredentialVerifier {
    /// Hashes the dummy password once, so this costs one full hash.
    pub fn new(config: PasswordConfig) -> anyhow::Result<Self> {
        let params = Params::new(config.memory_kib, config.iterations, config.parallelism, None)
            .map_err(|e| anyhow::anyhow!("invalid argon2 parameters: {e}"))?;

        let mut verifier = Self {
            params,
            dummy_hash: Arc::from(""),
        };
        verifier.dummy_hash = verifier
            .hash("rota-dummy-password")
            .map_err(|e| anyhow::anyhow!("failed to prepare dummy hash: {e}"))?
            .into();
        Ok(verifier)
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Produces a salted PHC string (`$argon2id$v=19$...`).
    pub fn hash(&self, plaintext: &str) -> Result<String, AuthError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()
            .hash_password(plaintext.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::HashingError(e.to_string()))
    }

    /// Never fails: malformed stored hashes simply do not match.
    ///
    /// Parameters are read from the stored hash, so hashes produced with an
    /// older cost configuration keep verifying.
    pub fn verify(&self, plaintext: &str, hash: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => self
                .argon2()
                .verify_password(plaintext.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Burns one verification against a fixed hash so that unknown accounts
    /// take as long to reject as wrong passwords.
    pub fn verify_dummy(&self, plaintext: &str) {
        let _ = self.verify(plaintext, &self.dummy_hash);
    }
}

#[cfg(test)]
pub(crate) fn test_verifier() -> CredentialVerifier {
    CredentialVerifier::new(PasswordConfig {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    })
    .unwrap()
}
