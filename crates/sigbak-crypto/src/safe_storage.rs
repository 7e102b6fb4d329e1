//! Desktop database key unwrap (Chromium "safe storage")
//!
//! ```text
//! key  = PBKDF2-HMAC-SHA1(secret, "saltysalt", iters, 16)    iters: mac 1003, linux 1
//! blob = "v10" | "v11" ‖ AES-128-CBC(key, iv = 16 × ' ', PKCS#7)
//! ```
//!
//! The plaintext is the 64-hex-digit SQLCipher key.

use aes::Aes128;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;
use sigbak_core::{SigbakError, SigbakResult};
use zeroize::Zeroizing;

use crate::IV_SIZE;

const SALT: &[u8] = b"saltysalt";
const DERIVED_KEY_SIZE: usize = 16;
const PREFIX_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeStoragePlatform {
    MacOs,
    Linux,
}

impl SafeStoragePlatform {
    pub fn from_name(name: &str) -> SigbakResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "macos" | "mac" | "darwin" => Ok(Self::MacOs),
            "linux" => Ok(Self::Linux),
            other => Err(SigbakError::Config(format!(
                "unknown safe-storage platform: {other}"
            ))),
        }
    }

    fn iterations(self) -> u32 {
        match self {
            Self::MacOs => 1003,
            Self::Linux => 1,
        }
    }

    fn prefix(self) -> &'static [u8] {
        match self {
            Self::MacOs => b"v10",
            Self::Linux => b"v11",
        }
    }
}

/// Unwrap the hex `encryptedKey` from the desktop config.json with the
/// secret held by the OS keychain.
pub fn decrypt_database_key(
    secret: &SecretString,
    encrypted_hex: &str,
    platform: SafeStoragePlatform,
) -> SigbakResult<Zeroizing<String>> {
    let blob = hex::decode(encrypted_hex.trim())
        .map_err(|e| SigbakError::DecryptionFailure(format!("encryptedKey is not hex: {e}")))?;
    if blob.len() <= PREFIX_SIZE {
        return Err(SigbakError::DecryptionFailure(format!(
            "encryptedKey of {} bytes is too short",
            blob.len()
        )));
    }

    let (prefix, ciphertext) = blob.split_at(PREFIX_SIZE);
    if prefix != platform.prefix() {
        tracing::warn!(
            found = %String::from_utf8_lossy(prefix),
            expected = %String::from_utf8_lossy(platform.prefix()),
            "unexpected safe-storage prefix, trying anyway"
        );
    }

    let mut key = Zeroizing::new([0u8; DERIVED_KEY_SIZE]);
    pbkdf2::pbkdf2_hmac::<Sha1>(
        secret.expose_secret().as_bytes(),
        SALT,
        platform.iterations(),
        key.as_mut_slice(),
    );

    let iv = [b' '; IV_SIZE];
    let plaintext = Zeroizing::new(
        cbc::Decryptor::<Aes128>::new_from_slices(key.as_slice(), &iv)
            .map_err(|e| SigbakError::DecryptionFailure(format!("AES-128-CBC init: {e}")))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| {
                SigbakError::DecryptionFailure("safe-storage secret does not fit this key".into())
            })?,
    );

    if plaintext.is_empty()
        || !plaintext
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    {
        return Err(SigbakError::DecryptionFailure(
            "unwrapped database key is not lowercase alphanumeric".into(),
        ));
    }

    let mut out = Zeroizing::new(String::with_capacity(plaintext.len()));
    out.extend(plaintext.iter().map(|&b| b as char));
    tracing::debug!(?platform, "unwrapped desktop database key");
    Ok(out)
}
