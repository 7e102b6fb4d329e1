//! Desktop profile database unwrap
//!
//! ```text
//! <config_dir>/config.json   { "key": "<64 hex>" } or { "encryptedKey": "<hex>" }
//! <config_dir>/sql/db.sqlite SQLCipher database
//! ```
//!
//! `encryptedKey` is wrapped with the OS safe-storage secret, see
//! [`sigbak_crypto::decrypt_database_key`].

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use sigbak_core::{SigbakError, SigbakResult};
use sigbak_crypto::{decrypt_database_key, SafeStoragePlatform, SqlCipherDecryptor, SqlCipherKey};

use crate::store::SqliteStore;

pub const CONFIG_FILE: &str = "config.json";
pub const DATABASE_FILE: &str = "sql/db.sqlite";

/// Key fields of the desktop `config.json`; everything else is ignored.
#[derive(Deserialize, Default)]
pub struct DesktopConfigFile {
    pub key: Option<String>,
    #[serde(rename = "encryptedKey")]
    pub encrypted_key: Option<String>,
}

impl std::fmt::Debug for DesktopConfigFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesktopConfigFile")
            .field("key", &self.key.as_ref().map(|_| "[REDACTED]"))
            .field("encrypted_key", &self.encrypted_key.is_some())
            .finish()
    }
}

impl DesktopConfigFile {
    pub fn read(dir: &Path) -> SigbakResult<Self> {
        let path = dir.join(CONFIG_FILE);
        let content = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| SigbakError::Config(format!("{}: {e}", path.display())))?;
        if config.key.is_none() && config.encrypted_key.is_none() {
            return Err(SigbakError::Config(format!(
                "{} has neither key nor encryptedKey",
                path.display()
            )));
        }
        Ok(config)
    }
}

/// The SQLCipher key of the profile: the plain `key` when present,
/// otherwise `encryptedKey` unwrapped with `secret`.
pub fn resolve_database_key(
    config: &DesktopConfigFile,
    secret: Option<&SecretString>,
    platform: SafeStoragePlatform,
) -> SigbakResult<SqlCipherKey> {
    if let Some(key) = &config.key {
        return SqlCipherKey::from_hex(key);
    }
    let Some(encrypted) = &config.encrypted_key else {
        return Err(SigbakError::Config("desktop config holds no database key".into()));
    };
    let secret = secret.ok_or_else(|| {
        SigbakError::Config("encryptedKey needs the safe-storage secret from the keychain".into())
    })?;
    let hex_key = decrypt_database_key(secret, encrypted, platform)?;
    SqlCipherKey::from_hex(&hex_key)
}

/// Decrypt `<dir>/sql/db.sqlite` into `out` and open the result.
pub fn unwrap_database(
    dir: &Path,
    key: &SqlCipherKey,
    version: u32,
    out: &Path,
) -> SigbakResult<SqliteStore> {
    let input = dir.join(DATABASE_FILE);
    if !input.exists() {
        return Err(SigbakError::Config(format!("no desktop database at {}", input.display())));
    }
    let pages = SqlCipherDecryptor::decrypt_file(key, version, &input, out)?;
    tracing::info!(pages, output = %out.display(), "unwrapped desktop database");
    SqliteStore::open(out)
}

/// Where the desktop client keeps its profile on this platform.
pub fn default_config_dir(platform: SafeStoragePlatform) -> Option<PathBuf> {
    let home = PathBuf::from(std::env::var("HOME").ok()?);
    Some(match platform {
        SafeStoragePlatform::MacOs => home.join("Library/Application Support/Signal"),
        SafeStoragePlatform::Linux => std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".config"))
            .join("Signal"),
    })
}
