//! Safe-storage secret lookup in the platform keychain.
//!
//! Uses the `keyring` crate:
//! - macOS: Keychain Services ("Signal Safe Storage" / "Signal Key")
//! - Windows: Credential Manager
//!
//! Desktop builds on Linux keep the secret in the Secret Service, which the
//! caller can pass in directly instead.

use secrecy::{ExposeSecret, SecretString};
use sigbak_core::{SigbakError, SigbakResult};
use zeroize::Zeroize;

/// Length of the secret the desktop client generates
pub const SAFE_STORAGE_SECRET_LEN: usize = 24;

/// The keychain secret that wraps the desktop database key.
pub struct SafeStorageSecret(SecretString);

impl SafeStorageSecret {
    pub fn new(mut password: String) -> Self {
        if password.len() != SAFE_STORAGE_SECRET_LEN {
            tracing::warn!(
                len = password.len(),
                expected = SAFE_STORAGE_SECRET_LEN,
                "unusual safe-storage secret length"
            );
        }
        let secret = SecretString::from(password.as_str());
        password.zeroize();
        Self(secret)
    }

    pub fn as_secret(&self) -> &SecretString {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<SafeStorageSecret> for SecretString {
    fn from(secret: SafeStorageSecret) -> Self {
        secret.0
    }
}

impl std::fmt::Debug for SafeStorageSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SafeStorageSecret([REDACTED; {}])", self.len())
    }
}

/// Fetch the secret stored under `service` / `account`.
///
/// A missing entry is `Ok(None)`; any other keychain failure is an error.
pub fn fetch_secret(service: &str, account: &str) -> SigbakResult<Option<SafeStorageSecret>> {
    let entry = keyring::Entry::new(service, account)
        .map_err(|e| SigbakError::Config(format!("keychain entry '{service}': {e}")))?;
    match entry.get_password() {
        Ok(password) => {
            tracing::debug!(service, account, "found safe-storage secret in keychain");
            Ok(Some(SafeStorageSecret::new(password)))
        }
        Err(keyring::Error::NoEntry) => {
            tracing::debug!(service, account, "no keychain entry");
            Ok(None)
        }
        Err(e) => Err(SigbakError::Config(format!(
            "keychain lookup for '{service}' / '{account}': {e}"
        ))),
    }
}
